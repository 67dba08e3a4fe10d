//! A `RegMark` instance: the region manager, card table, mark map,
//! remembered set and marking engine wired together behind one type.
//!
//! Hosts construct one instance per managed heap, commit regions as the
//! heap grows, route their write barrier through [`RegMark::dirty_object_card`]
//! and drive collections through the `perform_mark_*` entry points. The
//! parts stay reachable through accessors for collaborators that need the
//! lower-level APIs, such as a compactor walking a region's remembered set.

use std::sync::atomic::AtomicBool;
use std::time::Instant;

use delegate::delegate;

use crate::heap::{CardTable, RegionManager};
use crate::mark::{
    ConcurrentMarkOutcome, GlobalMarkDelegate, GlobalMarkingScheme, MarkDelegateState, MarkEnv,
    MarkStats,
};
use crate::remset::{InterRegionRememberedSet, RememberedSetStats};
use crate::scheduler::TaskRunner;
use crate::util::conversions::bytes_to_formatted_string;
use crate::util::mark_map::MarkMap;
use crate::util::options::Options;
use crate::util::{Address, ObjectReference};
use crate::vm::VMBinding;

/// An instance of the mark core for one managed heap.
pub struct RegMark<VM: VMBinding> {
    options: Options,
    manager: RegionManager,
    card_table: CardTable,
    mark_map: MarkMap,
    remset: InterRegionRememberedSet,
    scheme: GlobalMarkingScheme<VM>,
    delegate: GlobalMarkDelegate,
    runner: TaskRunner,
}

impl<VM: VMBinding> RegMark<VM> {
    /// Reserve the heap range and its side structures. Regions start
    /// uncommitted; commit them before laying out objects.
    pub fn new(options: Options) -> std::io::Result<RegMark<VM>> {
        match crate::util::logger::try_init() {
            Ok(_) => debug!("regmark initialized the logger"),
            Err(_) => debug!(
                "regmark failed to initialize the logger, possibly the host installed one already"
            ),
        }
        let manager = RegionManager::new(&options)?;
        let card_table = CardTable::new(manager.heap_start(), manager.heap_extent())?;
        let mark_map = MarkMap::new(manager.heap_start(), manager.heap_extent())?;
        let remset = InterRegionRememberedSet::new(&options, manager.region_count())?;
        let scheme = GlobalMarkingScheme::new(&options);
        let delegate = GlobalMarkDelegate::new();
        let runner = TaskRunner::new(options.threads);
        debug!(
            "regmark {} {}",
            crate::build_info::REGMARK_PKG_VERSION,
            *crate::build_info::REGMARK_GIT_VERSION,
        );
        info!(
            "initialized {} regions of {} with {} workers",
            manager.region_count(),
            bytes_to_formatted_string(manager.region_size()),
            runner.worker_count()
        );
        Ok(RegMark {
            options,
            manager,
            card_table,
            mark_map,
            remset,
            scheme,
            delegate,
            runner,
        })
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn region_manager(&self) -> &RegionManager {
        &self.manager
    }

    pub fn card_table(&self) -> &CardTable {
        &self.card_table
    }

    pub fn mark_map(&self) -> &MarkMap {
        &self.mark_map
    }

    pub fn remembered_set(&self) -> &InterRegionRememberedSet {
        &self.remset
    }

    fn env(&self) -> MarkEnv<'_> {
        MarkEnv {
            manager: &self.manager,
            card_table: &self.card_table,
            mark_map: &self.mark_map,
            remset: &self.remset,
            options: &self.options,
            sync: self.runner.sync(),
        }
    }

    /// Whether a global mark phase is mid-cycle. Card flushes and
    /// remembering calls behave differently while one is.
    fn global_mark_active(&self) -> bool {
        self.delegate.state() != MarkDelegateState::Idle
    }

    delegate! {
        to self.card_table {
            /// Write-barrier entry: dirty the card holding `object`'s header.
            pub fn dirty_object_card(&self, object: ObjectReference);
            /// Dirty the card covering an arbitrary heap address, for
            /// barriers on interior writes such as array copies.
            #[call(dirty_card_for)]
            pub fn dirty_card(&self, addr: Address);
        }
        to self.remset {
            /// Check that the overflowed chain was reset before a partial
            /// collection starts recording into it.
            pub fn setup_for_partial_collect(&self);
            #[call(stats)]
            pub fn remembered_set_stats(&self) -> RememberedSetStats;
        }
        to self.scheme {
            #[call(stats)]
            pub fn mark_stats(&self) -> MarkStats;
        }
        to self.delegate {
            #[call(state)]
            pub fn mark_state(&self) -> MarkDelegateState;
        }
    }

    /// Bring a region into service: back its remembered-set list and hand it
    /// over with a clear mark map.
    pub fn commit_region(&self, index: usize) -> std::io::Result<()> {
        let region = self.manager.region(index);
        debug_assert!(!region.is_committed());
        region.set_committed(true);
        self.remset.allocate_region_buffers(index)?;
        self.card_table.clear_range(region.range());
        self.mark_map.clear_range(region.range());
        region.set_mark_map_cleared();
        Ok(())
    }

    /// Take a region out of service. Its remembered-set payload is reclaimed
    /// by the next [`Self::flush_decommitted_buffers`] once no live list
    /// holds its buffers. Must not run while a global mark is rebuilding the
    /// region's list.
    pub fn decommit_region(&self, index: usize) {
        let region = self.manager.region(index);
        debug_assert!(region.is_committed());
        self.runner.with_main(|worker| {
            self.remset
                .clear_references_to_region(&self.manager, &mut worker.remset, index);
        });
        region.set_committed(false);
        self.remset.note_region_decommit();
    }

    /// Reclaim buffers whose owning region was decommitted. Returns how many
    /// were culled from the free pool.
    pub fn flush_decommitted_buffers(&self) -> usize {
        self.remset
            .flush_buffers_for_decommitted_regions(&self.manager)
    }

    /// Record a cross-region reference discovered by a mark pass running
    /// outside this crate's own tracer.
    pub fn remember_reference_for_mark(&self, from: ObjectReference, to: ObjectReference) {
        let global_mark_phase = self.global_mark_active();
        self.runner.with_main(|worker| {
            self.remset.remember_reference_for_mark(
                &self.manager,
                &mut worker.remset,
                from,
                to,
                global_mark_phase,
            );
        });
    }

    /// Record a cross-region reference out of an object a compaction moved.
    pub fn remember_reference_for_compact(&self, from: ObjectReference, to: ObjectReference) {
        self.runner.with_main(|worker| {
            self.remset
                .remember_reference_for_compact(&self.manager, &mut worker.remset, from, to);
        });
    }

    /// Record a cross-region reference out of an evacuated object.
    pub fn remember_reference_for_copy_forward(&self, from: ObjectReference, to: ObjectReference) {
        self.runner.with_main(|worker| {
            self.remset
                .remember_reference_for_copy_forward(&self.manager, &mut worker.remset, from, to);
        });
    }

    pub fn is_reference_remembered(&self, from: ObjectReference, to: ObjectReference) -> bool {
        self.remset.is_reference_remembered(&self.manager, from, to)
    }

    /// Drop everything remembered for one region.
    pub fn clear_references_to_region(&self, index: usize) {
        self.runner.with_main(|worker| {
            self.remset
                .clear_references_to_region(&self.manager, &mut worker.remset, index);
        });
    }

    /// Degrade a swept region's list to stable if the sweep found the region
    /// dense enough to never be worth collecting.
    pub fn overflow_if_stable_region(&self, index: usize, free_bytes: usize, dark_matter_bytes: usize) {
        self.runner.with_main(|worker| {
            self.remset.overflow_if_stable_region(
                &self.manager,
                &mut worker.remset,
                index,
                free_bytes,
                dark_matter_bytes,
            );
        });
    }

    /// Mark the whole heap in one stop-the-world call.
    pub fn perform_mark_for_global_gc(&mut self) {
        let RegMark {
            options,
            manager,
            card_table,
            mark_map,
            remset,
            scheme,
            delegate,
            runner,
        } = self;
        let env = MarkEnv {
            manager,
            card_table,
            mark_map,
            remset,
            options,
            sync: runner.sync(),
        };
        delegate.perform_mark_for_global_gc(env, runner, scheme);
    }

    /// Advance a global mark phase until `deadline`, starting a cycle when
    /// none is underway. Returns whether the cycle finished.
    pub fn perform_mark_incremental(&mut self, deadline: Instant) -> bool {
        let RegMark {
            options,
            manager,
            card_table,
            mark_map,
            remset,
            scheme,
            delegate,
            runner,
        } = self;
        let env = MarkEnv {
            manager,
            card_table,
            mark_map,
            remset,
            options,
            sync: runner.sync(),
        };
        delegate.perform_mark_incremental(env, runner, scheme, deadline)
    }

    /// Drain up to `bytes_to_scan` bytes of queued mark work while mutators
    /// run. Only legal between increments, with the cycle parked in the
    /// packet-processing state.
    pub fn perform_mark_concurrent(
        &self,
        bytes_to_scan: usize,
        force_exit: &AtomicBool,
    ) -> ConcurrentMarkOutcome {
        self.delegate
            .perform_mark_concurrent(self.env(), &self.runner, &self.scheme, bytes_to_scan, force_exit)
    }

    /// Retire settled cards without rescanning them, until `deadline`.
    /// Returns whether the whole table was examined; false when scrubbing is
    /// disabled, no mark cycle is parked mid-queue, or time ran out.
    pub fn scrub_card_table(&self, deadline: Instant) -> bool {
        if !self.options.card_scrubbing
            || self.delegate.state() != MarkDelegateState::ProcessPackets
        {
            return false;
        }
        self.delegate
            .scrub_cards_while_marking(self.env(), &self.runner, &self.scheme, deadline)
    }

    /// Fold collection-set regions' remembered cards into the card table and
    /// drop their lists. Runs on the worker gang.
    pub fn flush_remembered_sets_into_card_table(&self) {
        let gmp_active = self.global_mark_active();
        self.manager.reset_work_units();
        self.runner.run(|worker| {
            self.remset.flush_into_card_table(
                &self.manager,
                &mut worker.remset,
                &self.card_table,
                gmp_active,
            );
        });
    }

    /// Reset the card state of every collection-set region: their objects are
    /// about to be evacuated or swept, so per-card obligations inside the set
    /// are void. Obligations toward a live global mark survive.
    pub fn reset_collection_set_cards(&self) {
        let gmp_active = self.global_mark_active();
        self.manager.reset_work_units();
        self.runner.run(|_worker| {
            while let Some(index) = self.manager.claim_next() {
                let region = self.manager.region(index);
                if !region.should_mark() {
                    continue;
                }
                for card in self.card_table.indices_of(region.range()) {
                    self.card_table.reset_collection_set_card(card, gmp_active);
                }
            }
        });
    }

    /// Prune lists of entries the coming partial collection covers through
    /// other means. Runs on the worker gang.
    pub fn clear_from_region_references(&self) {
        self.manager.reset_work_units();
        self.runner.run(|worker| {
            self.remset.clear_from_region_references(
                &self.manager,
                &mut worker.remset,
                &self.card_table,
            );
        });
    }

    /// Cycle-end housekeeping: every worker spills its buffer cache, the
    /// overflowed chain resets, and buffers of decommitted regions are
    /// reclaimed.
    pub fn finish_cycle(&self) {
        self.runner
            .run(|worker| self.remset.release_cached_buffers(&mut worker.remset));
        self.remset.reset_overflowed_list();
        self.remset
            .flush_buffers_for_decommitted_regions(&self.manager);
    }
}
