//! Worker threads and their rendezvous primitives.
//!
//! Collection work runs on a fixed gang of workers. [`TaskRunner`] owns one
//! [`GCWorker`] context per thread and fans a closure out over the gang.
//! Worker contexts persist across runs, so per-worker caches survive between
//! the increments of a cycle.

mod sync;
pub use sync::TaskSync;

use atomic_refcell::AtomicRefCell;

use crate::remset::RememberedSetWorkerState;

/// Per-thread collector context.
pub struct GCWorker {
    ordinal: usize,
    /// Buffer cache and overflow cursor for remembered-set operations.
    pub remset: RememberedSetWorkerState,
    scanned_bytes: usize,
}

impl GCWorker {
    fn new(ordinal: usize) -> Self {
        GCWorker {
            ordinal,
            remset: RememberedSetWorkerState::new(ordinal),
            scanned_bytes: 0,
        }
    }

    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    /// Record bytes scanned since the last [`Self::take_scanned`].
    pub fn note_scanned(&mut self, bytes: usize) {
        self.scanned_bytes += bytes;
    }

    pub fn take_scanned(&mut self) -> usize {
        std::mem::take(&mut self.scanned_bytes)
    }
}

/// A fixed gang of collector workers.
pub struct TaskRunner {
    sync: TaskSync,
    workers: Vec<AtomicRefCell<GCWorker>>,
}

impl TaskRunner {
    pub fn new(threads: usize) -> Self {
        debug_assert!(threads > 0);
        TaskRunner {
            sync: TaskSync::new(threads),
            workers: (0..threads)
                .map(|ordinal| AtomicRefCell::new(GCWorker::new(ordinal)))
                .collect(),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn sync(&self) -> &TaskSync {
        &self.sync
    }

    /// Run `task` once on every worker in parallel and wait for all of them.
    ///
    /// The calling thread doubles as worker 0.
    pub fn run<F>(&self, task: F)
    where
        F: Fn(&mut GCWorker) + Sync,
    {
        std::thread::scope(|scope| {
            for cell in &self.workers[1..] {
                let task = &task;
                scope.spawn(move || {
                    let mut worker = cell.borrow_mut();
                    task(&mut worker);
                });
            }
            let mut worker = self.workers[0].borrow_mut();
            task(&mut worker);
        });
    }

    /// Run `task` on worker 0 only, on the calling thread.
    ///
    /// For serial maintenance that still needs a worker context, such as
    /// flushing a buffer cache.
    pub fn with_main<R>(&self, task: impl FnOnce(&mut GCWorker) -> R) -> R {
        let mut worker = self.workers[0].borrow_mut();
        task(&mut worker)
    }
}
