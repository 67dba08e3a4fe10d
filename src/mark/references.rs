//! Soft, weak and phantom reference processing.
//!
//! Scanning discovers active references on the region that holds them; the
//! passes here run between the final complete-scan rounds, in soft, weak,
//! phantom order. Processing never marks anything new, so each pass only
//! settles reference state and feeds the cleared ones back to the binding.

use std::sync::atomic::Ordering;

use crate::mark::scheme::{CycleKind, GlobalMarkingScheme, MarkEnv};
use crate::scheduler::GCWorker;
use crate::util::ObjectReference;
use crate::vm::{ObjectModel, ReferenceKind, ReferenceState, Scanning, Slot, VMBinding};

impl<VM: VMBinding> GlobalMarkingScheme<VM> {
    /// Settle every reference of `ref_kind` discovered during the mark.
    ///
    /// A surviving referent keeps the reference active (softs age by one);
    /// a dead one clears the reference. Each worker reports its cleared
    /// references with a queue to the binding in one batch.
    pub(super) fn process_reference_pass(
        &self,
        env: MarkEnv,
        kind: CycleKind,
        worker: &mut GCWorker,
        ref_kind: ReferenceKind,
    ) {
        let ordinal = worker.ordinal();
        if env.sync.synchronize_and_release_single(ordinal) {
            env.manager.reset_work_units();
            env.sync.release_synchronized(ordinal);
        }
        let mut to_enqueue = Vec::new();
        while let Some(index) = env.manager.claim_next() {
            let region = env.manager.region(index);
            if !region.contains_objects() {
                continue;
            }
            let mut discovered = region.take_discovered(ref_kind);
            if discovered.is_empty() {
                continue;
            }
            // Card rescans and overflow recovery rediscover; settle each
            // reference once.
            discovered.sort_unstable();
            discovered.dedup();
            for reference in discovered {
                self.process_reference(env, kind, worker, ref_kind, reference, &mut to_enqueue);
            }
        }
        if !to_enqueue.is_empty() {
            for reference in &to_enqueue {
                VM::VMObjectModel::set_reference_state(*reference, ReferenceState::Enqueued);
            }
            self.counters
                .references_enqueued
                .fetch_add(to_enqueue.len() as u64, Ordering::Relaxed);
            VM::VMScanning::enqueue_cleared_references(&to_enqueue);
        }
    }

    fn process_reference(
        &self,
        env: MarkEnv,
        kind: CycleKind,
        worker: &mut GCWorker,
        ref_kind: ReferenceKind,
        reference: ObjectReference,
        to_enqueue: &mut Vec<ObjectReference>,
    ) {
        debug_assert!(env.mark_map.is_marked(reference));
        debug_assert_eq!(
            VM::VMObjectModel::reference_state(reference),
            ReferenceState::Active
        );
        let referent_slot = VM::VMObjectModel::referent_slot(reference);
        let Some(referent) = referent_slot.load() else {
            return;
        };
        if env.mark_map.is_marked(referent) {
            if ref_kind == ReferenceKind::Soft {
                let age = VM::VMObjectModel::soft_reference_age(reference);
                VM::VMObjectModel::set_soft_reference_age(reference, age.saturating_add(1));
            }
            // The referent slot survives the cycle, so the edge belongs in
            // the rebuilt remembered set even when scanning skipped it.
            if (reference.to_raw_address() ^ referent.to_raw_address())
                >= env.manager.region_size()
            {
                env.remset.remember_reference_for_mark(
                    env.manager,
                    &mut worker.remset,
                    reference,
                    referent,
                    kind == CycleKind::GlobalMarkPhase,
                );
            }
        } else {
            VM::VMObjectModel::set_reference_state(reference, ReferenceState::Cleared);
            referent_slot.clear();
            self.counters
                .references_cleared
                .fetch_add(1, Ordering::Relaxed);
            if VM::VMObjectModel::has_reference_queue(reference) {
                to_enqueue.push(reference);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mark::scheme::ScanBudget;
    use crate::mark::testing::MarkFixture;
    use crate::util::test_util::serial_test;
    use crate::util::test_util::toy_vm::{self, ToyVM};

    type OM = <ToyVM as VMBinding>::VMObjectModel;

    fn trace_and_process(
        fixture: &MarkFixture,
        scheme: &GlobalMarkingScheme<ToyVM>,
        roots: &[ObjectReference],
        ref_kind: ReferenceKind,
    ) {
        scheme.begin_cycle();
        let env = fixture.env();
        fixture.runner.run(|worker| {
            let mut stream = scheme.stream(env);
            scheme.init_mark_map(env, CycleKind::GlobalCollection, worker, &mut stream);
            if worker.ordinal() == 0 {
                for root in roots {
                    scheme.trace_root(env, &mut stream, *root);
                }
            }
            scheme.complete_scan(
                env,
                CycleKind::GlobalCollection,
                worker,
                &mut stream,
                ScanBudget::unbounded(),
            );
            scheme.process_reference_pass(env, CycleKind::GlobalCollection, worker, ref_kind);
            stream.flush();
        });
    }

    #[test]
    fn a_weak_reference_clears_and_enqueues_when_its_referent_dies() {
        serial_test(|| {
            toy_vm::reset();
            let fixture = MarkFixture::new();
            let scheme = fixture.scheme();
            let mut writer = fixture.writer();
            let referent = writer.leaf(1);
            let weak = writer.reference(ReferenceKind::Weak, Some(referent), true);

            trace_and_process(&fixture, &scheme, &[weak], ReferenceKind::Weak);

            assert!(!fixture.mark_map.is_marked(referent));
            assert_eq!(OM::reference_state(weak), ReferenceState::Enqueued);
            assert_eq!(OM::referent_slot(weak).load(), None);
            assert_eq!(toy_vm::take_enqueued(), vec![weak]);
            let stats = scheme.stats();
            assert_eq!(stats.references_cleared, 1);
            assert_eq!(stats.references_enqueued, 1);
        });
    }

    #[test]
    fn a_young_soft_reference_keeps_its_referent_alive_and_ages() {
        let fixture = MarkFixture::new();
        let scheme = fixture.scheme();
        let mut writer = fixture.writer();
        let referent = writer.leaf(1);
        let soft = writer.reference(ReferenceKind::Soft, Some(referent), false);

        trace_and_process(&fixture, &scheme, &[soft], ReferenceKind::Soft);

        assert!(fixture.mark_map.is_marked(referent));
        assert_eq!(OM::reference_state(soft), ReferenceState::Active);
        assert_eq!(OM::referent_slot(soft).load(), Some(referent));
        assert_eq!(OM::soft_reference_age(soft), 1);
        assert_eq!(scheme.stats().references_cleared, 0);
    }

    #[test]
    fn a_soft_reference_past_the_age_limit_clears_like_a_weak_one() {
        let fixture = MarkFixture::new();
        let scheme = fixture.scheme();
        let max_age = fixture.options.max_soft_reference_age as usize;
        let mut writer = fixture.writer();
        let referent = writer.leaf(1);
        let soft = writer.reference(ReferenceKind::Soft, Some(referent), false);
        OM::set_soft_reference_age(soft, max_age);

        trace_and_process(&fixture, &scheme, &[soft], ReferenceKind::Soft);

        assert!(!fixture.mark_map.is_marked(referent));
        assert_eq!(OM::reference_state(soft), ReferenceState::Cleared);
        assert_eq!(OM::referent_slot(soft).load(), None);
        let stats = scheme.stats();
        assert_eq!(stats.references_cleared, 1);
        // No queue on this one, so nothing was reported.
        assert_eq!(stats.references_enqueued, 0);
    }

    #[test]
    fn a_phantom_whose_referent_survives_stays_active_and_is_remembered() {
        let fixture = MarkFixture::new();
        let scheme = fixture.scheme();
        let region_size = fixture.manager.region_size();
        let mut writer = fixture.writer();
        writer.seek(fixture.manager.heap_start() + region_size);
        let referent = writer.leaf(1);
        let keeper = writer.scalar(&[Some(referent)]);
        writer.seek(fixture.manager.heap_start());
        let phantom = writer.reference(ReferenceKind::Phantom, Some(referent), false);

        trace_and_process(
            &fixture,
            &scheme,
            &[phantom, keeper],
            ReferenceKind::Phantom,
        );

        // Phantoms never keep their referent alive themselves.
        assert!(fixture.mark_map.is_marked(referent));
        assert_eq!(OM::reference_state(phantom), ReferenceState::Active);
        assert_eq!(OM::referent_slot(phantom).load(), Some(referent));
        // The surviving referent slot crosses regions; the processing pass
        // put it back in the remembered set.
        assert!(fixture
            .remset
            .is_reference_remembered(&fixture.manager, phantom, referent));
        assert_eq!(scheme.stats().references_cleared, 0);
    }

    #[test]
    fn duplicate_discovery_settles_each_reference_once() {
        let fixture = MarkFixture::new();
        let scheme = fixture.scheme();
        let mut writer = fixture.writer();
        let referent = writer.leaf(1);
        let weak = writer.reference(ReferenceKind::Weak, Some(referent), false);
        // Simulate a card rescan rediscovering the same reference.
        fixture
            .manager
            .region_containing(weak)
            .add_discovered_reference(ReferenceKind::Weak, weak);

        trace_and_process(&fixture, &scheme, &[weak], ReferenceKind::Weak);

        assert_eq!(OM::reference_state(weak), ReferenceState::Cleared);
        assert_eq!(scheme.stats().references_cleared, 1);
    }

    #[test]
    fn unrelated_kinds_wait_for_their_own_pass() {
        let fixture = MarkFixture::new();
        let scheme = fixture.scheme();
        let mut writer = fixture.writer();
        let referent = writer.leaf(1);
        let weak = writer.reference(ReferenceKind::Weak, Some(referent), false);

        // A soft pass must not touch weak references.
        trace_and_process(&fixture, &scheme, &[weak], ReferenceKind::Soft);

        assert_eq!(OM::reference_state(weak), ReferenceState::Active);
        assert_eq!(OM::referent_slot(weak).load(), Some(referent));
        assert_eq!(scheme.stats().references_cleared, 0);
        // The weak discovery is still parked on its region.
        assert_eq!(
            fixture
                .manager
                .region_containing(weak)
                .take_discovered(ReferenceKind::Weak),
            vec![weak]
        );
    }
}
