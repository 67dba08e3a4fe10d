//! The mark delegate: sequences the phases of a cycle across pauses.
//!
//! A global collection runs every phase in one call. A global mark phase is
//! resumable: each [`GlobalMarkDelegate::perform_mark_incremental`] call
//! advances the state machine until its deadline, and concurrent slices can
//! drain packets in between without touching the state at all.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use crate::mark::scheme::{CycleKind, GlobalMarkingScheme, MarkEnv, ScanBudget};
use crate::scheduler::TaskRunner;
use crate::vm::VMBinding;

/// Where an incremental global mark currently stands.
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub enum MarkDelegateState {
    /// No cycle underway.
    Idle,
    /// Cycle begun; the mark map still needs clearing.
    MapInit,
    /// Map cleared; the initial root walk is next.
    InitialRoots,
    /// Roots queued; packets drain across increments and concurrent slices.
    ProcessPackets,
    /// The queue drained once; only the final remark remains.
    FinalRootsComplete,
}

/// What one concurrent marking slice accomplished.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ConcurrentMarkOutcome {
    pub bytes_scanned: usize,
    /// True when the slice stopped on its budget or an external request
    /// rather than draining the queue.
    pub early_exit: bool,
}

pub struct GlobalMarkDelegate {
    state: MarkDelegateState,
    cycle_start: Option<Instant>,
}

impl GlobalMarkDelegate {
    pub(crate) fn new() -> GlobalMarkDelegate {
        GlobalMarkDelegate {
            state: MarkDelegateState::Idle,
            cycle_start: None,
        }
    }

    pub fn state(&self) -> MarkDelegateState {
        self.state
    }

    fn begin_mark_cycle<VM: VMBinding>(
        &mut self,
        kind: CycleKind,
        scheme: &GlobalMarkingScheme<VM>,
    ) {
        scheme.begin_cycle();
        self.cycle_start = Some(Instant::now());
        probe!(regmark, mark_cycle_begin);
        debug!("{} mark cycle starting", kind);
    }

    fn finish_mark_cycle<VM: VMBinding>(
        &mut self,
        env: MarkEnv,
        kind: CycleKind,
        scheme: &GlobalMarkingScheme<VM>,
    ) {
        env.remset.set_regions_as_rebuilding_complete(env.manager);
        let stats = scheme.stats();
        let millis = self
            .cycle_start
            .take()
            .map(|start| start.elapsed().as_millis() as usize)
            .unwrap_or(0);
        let marked = stats.objects_marked as usize;
        probe!(regmark, mark_cycle_end, marked, millis);
        info!("{} mark cycle complete in {} ms: {}", kind, millis, stats);
    }

    /// The whole mark of a stop-the-world global collection, in one call.
    pub(crate) fn perform_mark_for_global_gc<VM: VMBinding>(
        &mut self,
        env: MarkEnv,
        runner: &TaskRunner,
        scheme: &GlobalMarkingScheme<VM>,
    ) {
        assert_eq!(self.state, MarkDelegateState::Idle);
        let kind = CycleKind::GlobalCollection;
        self.begin_mark_cycle(kind, scheme);
        runner.run(|worker| {
            let mut stream = scheme.stream(env);
            scheme.init_mark_map(env, kind, worker, &mut stream);
            scheme.mark_roots(env, worker, &mut stream);
            let drained =
                scheme.complete_scan(env, kind, worker, &mut stream, ScanBudget::unbounded());
            debug_assert!(drained);
            scheme.complete_marking(env, kind, worker, &mut stream);
            stream.flush();
        });
        self.finish_mark_cycle(env, kind, scheme);
    }

    /// Advance a global mark phase until the deadline passes. Starts a new
    /// cycle when idle. Returns whether the cycle finished.
    ///
    /// The first increment always gets as far as queueing the initial
    /// roots; the final remark, once begun, runs as one unit.
    pub(crate) fn perform_mark_incremental<VM: VMBinding>(
        &mut self,
        env: MarkEnv,
        runner: &TaskRunner,
        scheme: &GlobalMarkingScheme<VM>,
        deadline: Instant,
    ) -> bool {
        let kind = CycleKind::GlobalMarkPhase;
        let mut timed_out = false;
        while !timed_out {
            match self.state {
                MarkDelegateState::Idle => {
                    self.begin_mark_cycle(kind, scheme);
                    self.state = MarkDelegateState::MapInit;
                }
                MarkDelegateState::MapInit => {
                    runner.run(|worker| {
                        let mut stream = scheme.stream(env);
                        scheme.init_mark_map(env, kind, worker, &mut stream);
                        stream.flush();
                    });
                    self.state = MarkDelegateState::InitialRoots;
                }
                MarkDelegateState::InitialRoots => {
                    runner.run(|worker| {
                        let mut stream = scheme.stream(env);
                        scheme.mark_roots(env, worker, &mut stream);
                        stream.flush();
                    });
                    self.state = MarkDelegateState::ProcessPackets;
                    timed_out = Instant::now() >= deadline;
                }
                MarkDelegateState::ProcessPackets => {
                    let drained = AtomicBool::new(true);
                    runner.run(|worker| {
                        let mut stream = scheme.stream(env);
                        let done = scheme.complete_scan(
                            env,
                            kind,
                            worker,
                            &mut stream,
                            ScanBudget::with_deadline(deadline),
                        );
                        if !done {
                            drained.store(false, Ordering::Relaxed);
                        }
                        stream.flush();
                    });
                    if drained.load(Ordering::Relaxed) {
                        self.state = MarkDelegateState::FinalRootsComplete;
                    } else {
                        timed_out = true;
                    }
                }
                MarkDelegateState::FinalRootsComplete => {
                    runner.run(|worker| {
                        let mut stream = scheme.stream(env);
                        scheme.complete_marking(env, kind, worker, &mut stream);
                        stream.flush();
                    });
                    self.finish_mark_cycle(env, kind, scheme);
                    self.state = MarkDelegateState::Idle;
                    return true;
                }
            }
        }
        false
    }

    /// Drain up to `bytes_to_scan` bytes of queued packets outside a pause.
    /// Never advances the state machine; `force_exit` aborts the slice at
    /// the next budget check.
    pub(crate) fn perform_mark_concurrent<VM: VMBinding>(
        &self,
        env: MarkEnv,
        runner: &TaskRunner,
        scheme: &GlobalMarkingScheme<VM>,
        bytes_to_scan: usize,
        force_exit: &AtomicBool,
    ) -> ConcurrentMarkOutcome {
        assert_eq!(self.state, MarkDelegateState::ProcessPackets);
        scheme.scanned_burst.store(0, Ordering::SeqCst);
        let drained = AtomicBool::new(true);
        runner.run(|worker| {
            let mut stream = scheme.stream(env);
            let done = scheme.complete_scan(
                env,
                CycleKind::GlobalMarkPhase,
                worker,
                &mut stream,
                ScanBudget::concurrent(bytes_to_scan, force_exit),
            );
            if !done {
                drained.store(false, Ordering::Relaxed);
            }
            stream.flush();
        });
        ConcurrentMarkOutcome {
            bytes_scanned: scheme.scanned_burst.load(Ordering::SeqCst),
            early_exit: !drained.load(Ordering::Relaxed),
        }
    }

    /// Scrub cards between increments, until done or the deadline passes.
    /// Returns whether the whole table was covered.
    pub(crate) fn scrub_cards_while_marking<VM: VMBinding>(
        &self,
        env: MarkEnv,
        runner: &TaskRunner,
        scheme: &GlobalMarkingScheme<VM>,
        deadline: Instant,
    ) -> bool {
        assert_eq!(self.state, MarkDelegateState::ProcessPackets);
        let covered = AtomicBool::new(true);
        runner.run(|worker| {
            if !scheme.scrub_cards(env, worker, deadline) {
                covered.store(false, Ordering::Relaxed);
            }
        });
        covered.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::mark::testing::MarkFixture;
    use crate::util::test_util::serial_test;
    use crate::util::test_util::toy_vm;
    use crate::util::ObjectReference;

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    #[test]
    fn a_global_collection_marks_in_one_call_and_stays_idle() {
        serial_test(|| {
            toy_vm::reset();
            let fixture = MarkFixture::new();
            let scheme = fixture.scheme();
            let mut delegate = GlobalMarkDelegate::new();
            let mut writer = fixture.writer();
            let b = writer.leaf(1);
            let a = writer.scalar(&[Some(b)]);
            let holder = writer.scalar(&[Some(a)]);
            toy_vm::add_root(writer.slot_addr(holder, 0));

            delegate.perform_mark_for_global_gc(fixture.env(), &fixture.runner, &scheme);

            assert_eq!(delegate.state(), MarkDelegateState::Idle);
            assert!(fixture.mark_map.is_marked(a));
            assert!(fixture.mark_map.is_marked(b));
            // The holder stands in for a stack frame; only its slot counts.
            assert!(!fixture.mark_map.is_marked(holder));
            assert_eq!(scheme.stats().objects_marked, 2);
        });
    }

    #[test]
    fn an_incremental_cycle_stops_at_the_deadline_and_resumes() {
        serial_test(|| {
            toy_vm::reset();
            let fixture = MarkFixture::new();
            let scheme = fixture.scheme();
            let mut delegate = GlobalMarkDelegate::new();
            let mut writer = fixture.writer();
            const CHAIN: usize = 2000;
            let tail = writer.scalar(&[None]);
            let mut next = tail;
            for _ in 1..CHAIN {
                next = writer.scalar(&[Some(next)]);
            }
            let holder = writer.scalar(&[Some(next)]);
            toy_vm::add_root(writer.slot_addr(holder, 0));

            // An already-passed deadline still gets the cycle to the point
            // where packets exist, then reports it unfinished.
            let finished = delegate.perform_mark_incremental(
                fixture.env(),
                &fixture.runner,
                &scheme,
                Instant::now(),
            );
            assert!(!finished);
            assert_eq!(delegate.state(), MarkDelegateState::ProcessPackets);
            assert!(!fixture.mark_map.is_marked(tail));

            let finished = delegate.perform_mark_incremental(
                fixture.env(),
                &fixture.runner,
                &scheme,
                far_deadline(),
            );
            assert!(finished);
            assert_eq!(delegate.state(), MarkDelegateState::Idle);
            assert!(fixture.mark_map.is_marked(tail));
            assert_eq!(scheme.stats().objects_marked, CHAIN as u64);
        });
    }

    #[test]
    fn concurrent_slices_drain_packets_without_advancing_the_cycle() {
        serial_test(|| {
            toy_vm::reset();
            let fixture = MarkFixture::new();
            let scheme = fixture.scheme();
            let mut delegate = GlobalMarkDelegate::new();
            let mut writer = fixture.writer();
            const CHAIN: usize = 2000;
            let mut next: Option<ObjectReference> = None;
            for _ in 0..CHAIN {
                next = Some(writer.scalar(&[next]));
            }
            let holder = writer.scalar(&[next]);
            toy_vm::add_root(writer.slot_addr(holder, 0));

            assert!(!delegate.perform_mark_incremental(
                fixture.env(),
                &fixture.runner,
                &scheme,
                Instant::now(),
            ));
            assert_eq!(delegate.state(), MarkDelegateState::ProcessPackets);

            // A bounded slice scans roughly its quota and stops early.
            let force_exit = AtomicBool::new(false);
            let outcome = delegate.perform_mark_concurrent(
                fixture.env(),
                &fixture.runner,
                &scheme,
                4096,
                &force_exit,
            );
            assert!(outcome.early_exit);
            assert!(outcome.bytes_scanned >= 4096);
            assert_eq!(delegate.state(), MarkDelegateState::ProcessPackets);

            // An external stop request ends a slice with quota to spare.
            force_exit.store(true, Ordering::SeqCst);
            let outcome = delegate.perform_mark_concurrent(
                fixture.env(),
                &fixture.runner,
                &scheme,
                usize::MAX,
                &force_exit,
            );
            assert!(outcome.early_exit);

            // The pause-side increment still owns cycle completion.
            assert!(delegate.perform_mark_incremental(
                fixture.env(),
                &fixture.runner,
                &scheme,
                far_deadline(),
            ));
            assert_eq!(delegate.state(), MarkDelegateState::Idle);
            assert_eq!(scheme.stats().objects_marked, CHAIN as u64);
        });
    }

    #[test]
    fn delegate_states_render_snake_case() {
        assert_eq!(MarkDelegateState::ProcessPackets.to_string(), "process_packets");
        assert_eq!(MarkDelegateState::Idle.to_string(), "idle");
    }
}
