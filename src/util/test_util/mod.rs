use std::sync::Mutex;

pub mod fixtures;
pub mod toy_vm;

pub use fixtures::ToyHeapWriter;

lazy_static! {
    // A global lock to make tests serial. The toy binding keeps its roots and
    // reference queue in process-global state, so tests that touch them must
    // not interleave.
    static ref SERIAL_TEST_LOCK: Mutex<()> = Mutex::default();
}

// force some tests to be executed serially
pub fn serial_test<F>(f: F)
where
    F: FnOnce(),
{
    // If one test fails, the lock will become poisoned. We would want to continue for other tests anyway.
    let _guard = SERIAL_TEST_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    f();
}
