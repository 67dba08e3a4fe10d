//! End-to-end collection scenarios driven through the public `RegMark`
//! facade and the toy VM binding.
//!
//! Every test owns a freshly mapped heap. The cases that register roots or
//! drain the reference queue go through process-global toy VM state and run
//! under `serial_test`.

use crate::util::options::Options;
use crate::util::test_util::toy_vm::ToyVM;
use crate::RegMark;

mod random_graphs;

/// Four committed 512K regions on two workers, plus any overrides.
fn toy_heap(configure: impl FnOnce(&mut Options)) -> RegMark<ToyVM> {
    let mut options = Options::default();
    assert!(options.set_from_str("threads", "2"));
    assert!(options.set_from_str("heap_size", "2m"));
    assert!(options.set_from_str("region_log", "19"));
    configure(&mut options);
    let regmark = RegMark::new(options).unwrap();
    for index in 0..regmark.region_manager().region_count() {
        regmark.commit_region(index).unwrap();
    }
    regmark
}
