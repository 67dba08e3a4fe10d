//! The inter-region remembered set.
//!
//! For every region the heap keeps a [`RememberedSetCardList`]: the card
//! addresses of all locations outside the region that hold references into
//! it. Marking appends to the lists through per-worker buckets; collections
//! consume them to find a region's incoming references without scanning the
//! whole heap. A list that would exceed its per-region cap, or that loses
//! the competition for buffers when the global pool runs dry, degrades to
//! an overflowed state that tracks nothing and answers every membership
//! query conservatively until the next global mark rebuilds it.
//!
//! Same-region references are never recorded; callers pre-filter them and
//! [`remember_reference_for_mark`] filters again by region index.
//!
//! [`remember_reference_for_mark`]: InterRegionRememberedSet::remember_reference_for_mark

mod bucket;
mod card_list;
mod pool;

pub use card_list::RememberedSetCardList;
pub use pool::BufferCache;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use self::bucket::AddResult;
use self::pool::CardBufferPool;
use crate::heap::{CardTable, RegionManager};
use crate::util::options::Options;
use crate::util::{Address, ObjectReference};

/// Index link terminator for the overflowed-list chain.
pub(crate) const NIL_REGION: usize = usize::MAX;

/// Per-worker remembered-set context: the slot selecting this worker's
/// bucket in every list, a private buffer cache, and the resume point of the
/// worker's walk over the global overflowed list.
pub struct RememberedSetWorkerState {
    ordinal: usize,
    cache: BufferCache,
    overflow_cursor: usize,
}

impl RememberedSetWorkerState {
    pub fn new(ordinal: usize) -> Self {
        RememberedSetWorkerState {
            ordinal,
            cache: BufferCache::default(),
            overflow_cursor: NIL_REGION,
        }
    }

    pub fn ordinal(&self) -> usize {
        self.ordinal
    }
}

/// Point-in-time remembered-set accounting, for cycle logs and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RememberedSetStats {
    pub overflowed_regions: usize,
    pub stable_regions: usize,
    pub being_rebuilt_regions: usize,
    pub free_buffers: usize,
    pub total_buffers: usize,
}

pub struct InterRegionRememberedSet {
    pool: CardBufferPool,
    /// Cards one region's list may hold before it degrades to overflowed.
    max_cards_per_list: usize,
    region_size: usize,
    stable_region_threshold: f32,
    /// Chain of lists that overflowed since the last reset, threaded through
    /// each list's `overflowed_next` by region index. Rebuilt from scratch
    /// for every mark, copy-forward or compact.
    overflowed_list_head: AtomicUsize,
    overflowed_list_tail: AtomicUsize,
    overflowed_region_count: AtomicUsize,
    stable_region_count: AtomicUsize,
    being_rebuilt_region_count: AtomicUsize,
    should_flush_decommitted: AtomicBool,
}

impl InterRegionRememberedSet {
    pub fn new(options: &Options, region_count: usize) -> std::io::Result<Self> {
        let max_cards_per_list = options.remset_list_max_cards();
        Ok(InterRegionRememberedSet {
            pool: CardBufferPool::new(region_count, max_cards_per_list)?,
            max_cards_per_list,
            region_size: options.region_size(),
            stable_region_threshold: options.stable_region_threshold,
            overflowed_list_head: AtomicUsize::new(NIL_REGION),
            overflowed_list_tail: AtomicUsize::new(NIL_REGION),
            overflowed_region_count: AtomicUsize::new(0),
            stable_region_count: AtomicUsize::new(0),
            being_rebuilt_region_count: AtomicUsize::new(0),
            should_flush_decommitted: AtomicBool::new(false),
        })
    }

    /// Back the region's share of the buffer pool. Runs as part of region
    /// commit, before any reference into the region can be remembered.
    pub fn allocate_region_buffers(&self, index: usize) -> std::io::Result<()> {
        self.pool.back_region(index)
    }

    /// Record a reference found by partial or global marking. A partial
    /// collection rebuilds every collection-set list, so all targets accept;
    /// a global mark increment rebuilds only the lists flagged for it.
    pub fn remember_reference_for_mark(
        &self,
        manager: &RegionManager,
        worker: &mut RememberedSetWorkerState,
        from: ObjectReference,
        to: ObjectReference,
        global_mark_phase: bool,
    ) {
        let from_index = manager.index_for_address(from.to_raw_address());
        let to_index = manager.index_for_address(to.to_raw_address());
        if from_index == to_index {
            return;
        }
        let rscl = manager.region(to_index).remembered_set();
        if global_mark_phase && !rscl.is_being_rebuilt() {
            return;
        }
        self.remember_card(manager, worker, to_index, CardTable::card_of_object(from));
    }

    /// Record a reference whose source object a compaction just moved.
    pub fn remember_reference_for_compact(
        &self,
        manager: &RegionManager,
        worker: &mut RememberedSetWorkerState,
        from: ObjectReference,
        to: ObjectReference,
    ) {
        let from_index = manager.index_for_address(from.to_raw_address());
        let to_index = manager.index_for_address(to.to_raw_address());
        if from_index == to_index {
            return;
        }
        self.remember_card(manager, worker, to_index, CardTable::card_of_object(from));
    }

    /// Record a reference out of an object a copy-forward pass evacuated.
    pub fn remember_reference_for_copy_forward(
        &self,
        manager: &RegionManager,
        worker: &mut RememberedSetWorkerState,
        from: ObjectReference,
        to: ObjectReference,
    ) {
        self.remember_reference_for_compact(manager, worker, from, to);
    }

    fn remember_card(
        &self,
        manager: &RegionManager,
        worker: &mut RememberedSetWorkerState,
        to_index: usize,
        card: Address,
    ) {
        let rscl = manager.region(to_index).remembered_set();
        loop {
            if rscl.is_overflowed() {
                // The coarse state already covers this card. Reclaim
                // whatever this worker still holds in the list.
                rscl.release_bucket(&self.pool, &mut worker.cache, worker.ordinal);
                return;
            }
            match rscl.add_to_bucket(&self.pool, worker.ordinal, card) {
                AddResult::Added | AddResult::Duplicate => return,
                AddResult::NeedsBuffer => {
                    if !self.acquire_buffer(manager, worker, to_index) {
                        return;
                    }
                }
            }
        }
    }

    /// Reserve and install one buffer for this worker's bucket of the target
    /// list. False means the list went overflowed instead; its coverage is
    /// coarse from here on and the entry need not be stored.
    fn acquire_buffer(
        &self,
        manager: &RegionManager,
        worker: &mut RememberedSetWorkerState,
        to_index: usize,
    ) -> bool {
        let rscl = manager.region(to_index).remembered_set();
        if !rscl.try_reserve_buffer(self.max_cards_per_list) {
            self.overflow_list(manager, worker, to_index);
            return false;
        }
        loop {
            if let Some(block) = self.pool.allocate(&mut worker.cache) {
                rscl.install_reserved_buffer(&self.pool, worker.ordinal, block);
                return true;
            }
            // The pool is dry. Sacrifice some list with buffers in this
            // worker's bucket and retry with what that frees.
            match self.find_rscl_to_overflow(manager, worker) {
                Some(victim) => {
                    self.overflow_list(manager, worker, victim);
                    if victim == to_index {
                        rscl.unreserve_buffer();
                        return false;
                    }
                }
                None => {
                    rscl.unreserve_buffer();
                    self.overflow_list(manager, worker, to_index);
                    return false;
                }
            }
        }
    }

    /// Degrade a list to overflowed. The first thread to flip the flag
    /// publishes the list on the overflowed chain; every thread reclaims its
    /// own bucket once it observes the flag.
    fn overflow_list(
        &self,
        manager: &RegionManager,
        worker: &mut RememberedSetWorkerState,
        index: usize,
    ) {
        let rscl = manager.region(index).remembered_set();
        if rscl.try_set_overflowed() {
            self.overflowed_region_count.fetch_add(1, Ordering::SeqCst);
            self.enqueue_overflowed(manager, index);
            debug!("remembered set for region {} overflowed", index);
        }
        rscl.release_bucket(&self.pool, &mut worker.cache, worker.ordinal);
    }

    /// Append to the overflowed chain: swing the tail, then link the old
    /// tail (or the head, for the first entry) to us. A walker can observe
    /// the chain a link short while an append is mid-flight; walks only
    /// need the list as a hint, so that is tolerated.
    fn enqueue_overflowed(&self, manager: &RegionManager, index: usize) {
        manager
            .region(index)
            .remembered_set()
            .overflowed_next
            .store(NIL_REGION, Ordering::SeqCst);

        let mut old_tail = self.overflowed_list_tail.load(Ordering::SeqCst);
        loop {
            match self.overflowed_list_tail.compare_exchange(
                old_tail,
                index,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(observed) => old_tail = observed,
            }
        }
        if old_tail == NIL_REGION {
            self.overflowed_list_head.store(index, Ordering::SeqCst);
        } else {
            manager
                .region(old_tail)
                .remembered_set()
                .overflowed_next
                .store(index, Ordering::SeqCst);
        }
    }

    /// Pick a list whose buffers this worker can reclaim: preferably one
    /// that already overflowed and still holds buffers in this worker's
    /// bucket, resuming the chain walk where this worker left off; failing
    /// that, the object-bearing list with the most buffers overall.
    fn find_rscl_to_overflow(
        &self,
        manager: &RegionManager,
        worker: &mut RememberedSetWorkerState,
    ) -> Option<usize> {
        let mut candidate = if worker.overflow_cursor != NIL_REGION {
            manager
                .region(worker.overflow_cursor)
                .remembered_set()
                .overflowed_next
                .load(Ordering::SeqCst)
        } else {
            self.overflowed_list_head.load(Ordering::SeqCst)
        };
        while candidate != NIL_REGION {
            let rscl = manager.region(candidate).remembered_set();
            debug_assert!(rscl.is_overflowed());
            worker.overflow_cursor = candidate;
            if rscl.bucket(worker.ordinal).buffer_count() > 0 {
                return Some(candidate);
            }
            candidate = rscl.overflowed_next.load(Ordering::SeqCst);
        }

        let mut best: Option<usize> = None;
        for region in manager.regions() {
            if !region.contains_objects() {
                continue;
            }
            let rscl = region.remembered_set();
            if rscl.bucket(worker.ordinal).buffer_count() == 0 {
                continue;
            }
            let better = match best {
                Some(current) => {
                    manager.region(current).remembered_set().buffer_count() < rscl.buffer_count()
                }
                None => true,
            };
            if better {
                best = Some(region.index());
            }
        }
        best
    }

    /// Exact when the target list is accurate, conservatively true when it
    /// is overflowed or the reference stays within one region.
    pub fn is_reference_remembered(
        &self,
        manager: &RegionManager,
        from: ObjectReference,
        to: ObjectReference,
    ) -> bool {
        let from_index = manager.index_for_address(from.to_raw_address());
        let to_index = manager.index_for_address(to.to_raw_address());
        if from_index == to_index {
            return true;
        }
        let rscl = manager.region(to_index).remembered_set();
        if rscl.is_overflowed() {
            return true;
        }
        rscl.is_card_remembered(&self.pool, CardTable::card_of_object(from))
    }

    /// Drop everything remembered for a region, typically because the
    /// region was emptied or is about to be recycled.
    pub fn clear_references_to_region(
        &self,
        manager: &RegionManager,
        worker: &mut RememberedSetWorkerState,
        to_index: usize,
    ) {
        let rscl = manager.region(to_index).remembered_set();
        if rscl.is_empty() {
            return;
        }
        debug_assert!(!rscl.is_being_rebuilt());
        self.forget_overflow_kind(rscl);
        rscl.clear(&self.pool, &mut worker.cache);
    }

    fn forget_overflow_kind(&self, rscl: &RememberedSetCardList) {
        if rscl.is_stable() {
            self.stable_region_count.fetch_sub(1, Ordering::SeqCst);
        } else if rscl.is_overflowed() {
            self.overflowed_region_count.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Degrade a swept region's list to the stable coarse state when the
    /// region is dense enough that it will practically never be chosen for
    /// collection. Occupancy comes from the sweep that just measured it.
    pub fn overflow_if_stable_region(
        &self,
        manager: &RegionManager,
        worker: &mut RememberedSetWorkerState,
        index: usize,
        free_bytes: usize,
        dark_matter_bytes: usize,
    ) {
        let rscl = manager.region(index).remembered_set();
        if !rscl.is_accurate() {
            return;
        }
        let unused = free_bytes + dark_matter_bytes;
        if (unused as f64) < self.region_size as f64 * self.stable_region_threshold as f64 {
            rscl.set_as_stable();
            self.stable_region_count.fetch_add(1, Ordering::SeqCst);
            rscl.release_all_buckets(&self.pool, &mut worker.cache);
            debug!("remembered set for region {} marked stable", index);
        }
    }

    /// A full global collection rebuilds every list from scratch, so all
    /// remembered state can be dropped. A GMP picking up partial mark state
    /// must keep the accurate lists instead.
    pub fn prepare_regions_for_global_collect(
        &self,
        manager: &RegionManager,
        worker: &mut RememberedSetWorkerState,
        gmp_in_progress: bool,
    ) {
        if gmp_in_progress {
            return;
        }
        debug_assert_eq!(self.being_rebuilt_region_count.load(Ordering::SeqCst), 0);
        for region in manager.regions() {
            let rscl = region.remembered_set();
            debug_assert!(!rscl.is_being_rebuilt());
            self.forget_overflow_kind(rscl);
            rscl.clear(&self.pool, &mut worker.cache);
        }
        debug_assert_eq!(self.overflowed_region_count.load(Ordering::SeqCst), 0);
        debug_assert_eq!(self.stable_region_count.load(Ordering::SeqCst), 0);
    }

    /// At global mark kickoff: restart every overflowed list empty and
    /// accepting, so the full trace rebuilds it.
    pub fn prepare_overflowed_regions_for_rebuilding(
        &self,
        manager: &RegionManager,
        worker: &mut RememberedSetWorkerState,
    ) {
        debug_assert_eq!(self.being_rebuilt_region_count.load(Ordering::SeqCst), 0);
        for region in manager.regions() {
            let rscl = region.remembered_set();
            debug_assert!(!rscl.is_being_rebuilt());
            if rscl.is_overflowed() {
                self.being_rebuilt_region_count.fetch_add(1, Ordering::SeqCst);
                self.forget_overflow_kind(rscl);
                rscl.clear(&self.pool, &mut worker.cache);
                rscl.set_as_being_rebuilt();
            }
        }
        debug_assert_eq!(self.overflowed_region_count.load(Ordering::SeqCst), 0);
        debug_assert_eq!(self.stable_region_count.load(Ordering::SeqCst), 0);
    }

    /// End of a global mark or global collect: rebuilt lists become
    /// ordinary lists again. A list can have re-overflowed while being
    /// rebuilt; it keeps that state.
    pub fn set_regions_as_rebuilding_complete(&self, manager: &RegionManager) {
        let mut rebuilt = 0;
        let mut still_overflowed = 0;
        for region in manager.regions() {
            let rscl = region.remembered_set();
            if rscl.is_being_rebuilt() {
                rebuilt += 1;
                if rscl.is_overflowed() {
                    still_overflowed += 1;
                }
                rscl.set_as_rebuilding_complete();
                self.being_rebuilt_region_count.fetch_sub(1, Ordering::SeqCst);
            }
        }
        debug!(
            "remembered set rebuild complete: {} rebuilt, {} still overflowed",
            rebuilt, still_overflowed
        );
        debug_assert_eq!(self.being_rebuilt_region_count.load(Ordering::SeqCst), 0);
    }

    /// The overflowed chain must have been reset before a partial collect
    /// starts; it then collects only this cycle's overflows.
    pub fn setup_for_partial_collect(&self) {
        debug_assert_eq!(self.overflowed_list_head.load(Ordering::SeqCst), NIL_REGION);
        debug_assert_eq!(self.overflowed_list_tail.load(Ordering::SeqCst), NIL_REGION);
    }

    /// Cycle-end housekeeping for one worker: spill its buffer cache and
    /// forget its overflowed-chain position.
    pub fn release_cached_buffers(&self, worker: &mut RememberedSetWorkerState) {
        self.pool.drain_cache(&mut worker.cache);
        worker.overflow_cursor = NIL_REGION;
    }

    /// Empty the overflowed chain. Runs after every worker has released its
    /// cached buffers at the end of a cycle.
    pub fn reset_overflowed_list(&self) {
        self.overflowed_list_head.store(NIL_REGION, Ordering::SeqCst);
        self.overflowed_list_tail.store(NIL_REGION, Ordering::SeqCst);
    }

    /// Note that regions were decommitted; the next flush pass reclaims
    /// their buffers.
    pub fn note_region_decommit(&self) {
        self.should_flush_decommitted.store(true, Ordering::SeqCst);
    }

    /// Reclaim free buffers owned by decommitted regions so their payload
    /// can be unmapped. Callers drain every worker cache first; buffers a
    /// still-live list holds keep their payload mapped until a later pass.
    pub fn flush_buffers_for_decommitted_regions(&self, manager: &RegionManager) -> usize {
        if !self.should_flush_decommitted.swap(false, Ordering::SeqCst) {
            return 0;
        }
        let culled = self
            .pool
            .release_decommitted(|index| manager.region(index).is_committed());
        if culled > 0 {
            debug!("reclaimed {} card buffers from decommitted regions", culled);
        }
        culled
    }

    /// Fold every collection-set region's remembered cards into the card
    /// table and drop the lists; from here the card table alone carries the
    /// state. Cards whose referencing region is itself in the collection
    /// set, or holds no objects, are dropped rather than flushed. Workers
    /// share the pass through the region work-unit counter.
    pub fn flush_into_card_table(
        &self,
        manager: &RegionManager,
        worker: &mut RememberedSetWorkerState,
        card_table: &CardTable,
        gmp_active: bool,
    ) {
        while let Some(index) = manager.claim_next() {
            let region = manager.region(index);
            if !region.should_mark() {
                continue;
            }
            let rscl = region.remembered_set();
            debug_assert!(
                !rscl.is_overflowed(),
                "collection set selection must exclude overflowed regions"
            );
            if !rscl.is_overflowed() {
                rscl.for_each_card(&self.pool, &mut |card| {
                    let from_region = manager.region_for_address(card);
                    if !from_region.should_mark() && from_region.contains_objects() {
                        card_table.flush_card(card_table.index_of(card), gmp_active);
                    }
                });
            }
            self.clear_references_to_region(manager, worker, index);
        }
    }

    /// Prune accurate lists of entries the coming partial collection makes
    /// redundant: cards in collection-set regions, cards in object-free
    /// regions, and cards its card scan will visit anyway. Overflowed lists
    /// just shed their buffers. Workers share the pass through the region
    /// work-unit counter.
    pub fn clear_from_region_references(
        &self,
        manager: &RegionManager,
        worker: &mut RememberedSetWorkerState,
        card_table: &CardTable,
    ) {
        let mut processed = 0usize;
        let mut removed_total = 0usize;
        while let Some(index) = manager.claim_next() {
            let rscl = manager.region(index).remembered_set();
            if rscl.is_overflowed() {
                rscl.release_all_buckets(&self.pool, &mut worker.cache);
                continue;
            }
            let (removed, _released) =
                rscl.retain_cards(&self.pool, &mut worker.cache, &mut |card| {
                    let from_region = manager.region_for_address(card);
                    from_region.contains_objects()
                        && !from_region.should_mark()
                        && !card_table
                            .state(card_table.index_of(card))
                            .is_dirty_for_partial_collect()
                });
            processed += removed + rscl.size();
            removed_total += removed;
        }
        trace!(
            "remembered set pruning: {} cards processed, {} removed",
            processed,
            removed_total
        );
    }

    pub fn stats(&self) -> RememberedSetStats {
        RememberedSetStats {
            overflowed_regions: self.overflowed_region_count.load(Ordering::SeqCst),
            stable_regions: self.stable_region_count.load(Ordering::SeqCst),
            being_rebuilt_regions: self.being_rebuilt_region_count.load(Ordering::SeqCst),
            free_buffers: self.pool.free_buffer_count(),
            total_buffers: self.pool.total_buffer_count(),
        }
    }
}
