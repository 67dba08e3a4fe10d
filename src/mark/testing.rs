//! Shared heap assembly for the mark module's unit tests.

use crate::heap::{CardTable, RegionManager};
use crate::mark::scheme::{GlobalMarkingScheme, MarkEnv};
use crate::remset::InterRegionRememberedSet;
use crate::scheduler::TaskRunner;
use crate::util::mark_map::MarkMap;
use crate::util::options::Options;
use crate::util::test_util::fixtures::ToyHeapWriter;
use crate::util::test_util::toy_vm::ToyVM;

/// A small managed heap with every region committed and backed, plus a
/// two-worker gang. Tests lay objects down with [`MarkFixture::writer`].
pub(crate) struct MarkFixture {
    pub options: Options,
    pub manager: RegionManager,
    pub card_table: CardTable,
    pub mark_map: MarkMap,
    pub remset: InterRegionRememberedSet,
    pub runner: TaskRunner,
}

impl MarkFixture {
    pub fn new() -> MarkFixture {
        Self::with_options(|_| {})
    }

    /// Two workers over four 512K regions unless `configure` says otherwise.
    pub fn with_options(configure: impl FnOnce(&mut Options)) -> MarkFixture {
        let mut options = Options::default();
        assert!(options.set_from_str("threads", "2"));
        assert!(options.set_from_str("heap_size", "2m"));
        assert!(options.set_from_str("region_log", "19"));
        configure(&mut options);
        let manager = RegionManager::new(&options).unwrap();
        let card_table = CardTable::new(manager.heap_start(), manager.heap_extent()).unwrap();
        let mark_map = MarkMap::new(manager.heap_start(), manager.heap_extent()).unwrap();
        let remset = InterRegionRememberedSet::new(&options, manager.region_count()).unwrap();
        for index in 0..manager.region_count() {
            manager.region(index).set_committed(true);
            remset.allocate_region_buffers(index).unwrap();
        }
        let runner = TaskRunner::new(options.threads);
        MarkFixture {
            options,
            manager,
            card_table,
            mark_map,
            remset,
            runner,
        }
    }

    pub fn env(&self) -> MarkEnv<'_> {
        MarkEnv {
            manager: &self.manager,
            card_table: &self.card_table,
            mark_map: &self.mark_map,
            remset: &self.remset,
            options: &self.options,
            sync: self.runner.sync(),
        }
    }

    pub fn writer(&self) -> ToyHeapWriter {
        ToyHeapWriter::new(self.manager.heap_range())
    }

    pub fn scheme(&self) -> GlobalMarkingScheme<ToyVM> {
        GlobalMarkingScheme::new(&self.options)
    }
}
