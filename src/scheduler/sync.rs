//! Barrier synchronization between collector workers.

use std::sync::{Condvar, Mutex};

/// Barrier state, protected by the mutex in [`TaskSync`].
struct SyncState {
    /// Workers that have arrived at the current rendezvous.
    arrived: usize,
    /// Bumped each time the barrier opens. Waiters key their wakeup on the
    /// generation, so reusing the barrier cannot mix workers from two
    /// consecutive rendezvous and spurious wakeups are harmless.
    generation: usize,
    /// True while one elected worker runs a serial section between
    /// [`TaskSync::synchronize_and_release_single`] and
    /// [`TaskSync::release_synchronized`].
    single_released: bool,
}

/// A cyclic barrier for a fixed group of collector workers.
///
/// Parallel passes use two rendezvous flavors: [`TaskSync::synchronize`]
/// releases the whole group once everyone has arrived, while
/// [`TaskSync::synchronize_and_release_single`] elects the last worker to
/// arrive for a serial section (resetting a work-unit counter, consuming a
/// shared latch) and keeps the rest parked until it finishes.
pub struct TaskSync {
    workers: usize,
    state: Mutex<SyncState>,
    all_arrived: Condvar,
}

impl TaskSync {
    pub fn new(workers: usize) -> Self {
        debug_assert!(workers > 0);
        Self {
            workers,
            state: Mutex::new(SyncState {
                arrived: 0,
                generation: 0,
                single_released: false,
            }),
            all_arrived: Condvar::new(),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers
    }

    /// Block until every worker in the group has arrived.
    pub fn synchronize(&self, ordinal: usize) {
        let mut state = self.state.lock().unwrap();
        debug_assert!(!state.single_released);
        state.arrived += 1;
        trace!("Worker {} synchronized ({}/{})", ordinal, state.arrived, self.workers);
        if state.arrived == self.workers {
            self.open_barrier(&mut state);
        } else {
            let generation = state.generation;
            while state.generation == generation {
                state = self.all_arrived.wait(state).unwrap();
            }
        }
    }

    /// Block until every worker has arrived, then release exactly one.
    ///
    /// The elected worker (the last to arrive) returns `true` and keeps
    /// running; the others stay parked until it calls
    /// [`Self::release_synchronized`], then return `false`.
    pub fn synchronize_and_release_single(&self, ordinal: usize) -> bool {
        let mut state = self.state.lock().unwrap();
        debug_assert!(!state.single_released);
        state.arrived += 1;
        trace!(
            "Worker {} synchronized for single release ({}/{})",
            ordinal,
            state.arrived,
            self.workers
        );
        if state.arrived == self.workers {
            state.single_released = true;
            true
        } else {
            let generation = state.generation;
            while state.generation == generation {
                state = self.all_arrived.wait(state).unwrap();
            }
            false
        }
    }

    /// End the elected worker's serial section and release the group.
    pub fn release_synchronized(&self, ordinal: usize) {
        let mut state = self.state.lock().unwrap();
        debug_assert!(state.single_released);
        debug_assert_eq!(state.arrived, self.workers);
        state.single_released = false;
        trace!("Worker {} released the group", ordinal);
        self.open_barrier(&mut state);
    }

    fn open_barrier(&self, state: &mut SyncState) {
        state.arrived = 0;
        state.generation = state.generation.wrapping_add(1);
        self.all_arrived.notify_all();
    }
}
