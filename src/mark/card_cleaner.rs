//! Card cleaning policies and the card scrubber.
//!
//! Cleaning consumes card states at fixed points of a cycle; which
//! transition each state takes is a [`CardCleaner`] policy. Scrubbing is the
//! cheaper cousin: it runs between increments and retires a card without
//! scanning it, but only once every reference under the card is provably
//! already covered by the mark map and the remembered set.

use std::sync::atomic::Ordering;
use std::time::Instant;

use crate::heap::CardState;
use crate::mark::scheme::{GlobalMarkingScheme, MarkEnv};
use crate::scheduler::GCWorker;
use crate::util::constants::SCRUB_YIELD_CHECK_INTERVAL;
use crate::util::ObjectReference;
use crate::vm::{ObjectKind, ObjectModel, Scanning, Slot, VMBinding};

/// How one pass over the card table treats each state.
///
/// `None` leaves the card alone. Otherwise the card moves to the returned
/// state, and the marked objects under it are rescanned when the flag says
/// their references still need collecting.
pub(crate) trait CardCleaner {
    fn disposition(&self, state: CardState) -> Option<(CardState, bool)>;
}

/// Final-remark cleaner, run before reference processing in every cycle.
///
/// Mutations since the last increment (`Dirty`) and cards deferred by
/// earlier increments (`GmpMustScan` variants) are rescanned now; the card
/// keeps whatever obligation outlives the mark, which is the partial-collect
/// scan for dirty cards and the remembered status for remembered ones.
pub(crate) struct GlobalMarkCardCleaner;

impl CardCleaner for GlobalMarkCardCleaner {
    fn disposition(&self, state: CardState) -> Option<(CardState, bool)> {
        match state {
            CardState::Dirty => Some((CardState::PgcMustScan, true)),
            CardState::GmpMustScan => Some((CardState::Clean, true)),
            CardState::RememberedAndGmpScan => Some((CardState::Remembered, true)),
            CardState::Clean | CardState::PgcMustScan | CardState::Remembered => None,
        }
    }
}

/// Cycle-init cleaner for a global collection. The trace about to run
/// supersedes every recorded obligation, so all cards reset to `Clean`
/// without rescanning.
pub(crate) struct GlobalCollectionCardCleaner;

impl CardCleaner for GlobalCollectionCardCleaner {
    fn disposition(&self, state: CardState) -> Option<(CardState, bool)> {
        match state {
            CardState::Clean => None,
            _ => Some((CardState::Clean, false)),
        }
    }
}

/// Where scrubbing moves a card it managed to prove quiet.
fn scrubbed_state(state: CardState) -> Option<CardState> {
    match state {
        CardState::Dirty => Some(CardState::PgcMustScan),
        CardState::GmpMustScan => Some(CardState::Clean),
        CardState::RememberedAndGmpScan => Some(CardState::Remembered),
        CardState::Clean | CardState::PgcMustScan | CardState::Remembered => None,
    }
}

/// Deadline polled while scrubbing. Reads the clock only once per
/// [`SCRUB_YIELD_CHECK_INTERVAL`] charged references; once it trips it
/// stays tripped.
struct ScrubDeadline {
    deadline: Instant,
    until_check: usize,
    timed_out: bool,
}

impl ScrubDeadline {
    fn new(deadline: Instant) -> ScrubDeadline {
        ScrubDeadline {
            deadline,
            until_check: 0,
            timed_out: false,
        }
    }

    fn charge(&mut self, references: usize) {
        self.until_check = self.until_check.saturating_sub(references);
    }

    fn expired(&mut self) -> bool {
        if self.timed_out {
            return true;
        }
        if self.until_check == 0 {
            self.until_check = SCRUB_YIELD_CHECK_INTERVAL;
            self.timed_out = Instant::now() >= self.deadline;
        }
        self.timed_out
    }
}

impl<VM: VMBinding> GlobalMarkingScheme<VM> {
    /// Retire cards whose eventual rescan would find nothing new, until the
    /// table is walked or the deadline passes. Returns whether this worker
    /// got through its whole share.
    ///
    /// A card can be proven quiet without scanning when every reference
    /// slot under it holds null, or a marked target that is either in the
    /// same region or already in the target's remembered set. States move
    /// exactly as in [`scrubbed_state`]; nothing is ever rescanned.
    pub(super) fn scrub_cards(
        &self,
        env: MarkEnv,
        worker: &mut GCWorker,
        deadline: Instant,
    ) -> bool {
        let ordinal = worker.ordinal();
        if env.sync.synchronize_and_release_single(ordinal) {
            env.manager.reset_work_units();
            env.sync.release_synchronized(ordinal);
        }
        let mut clock = ScrubDeadline::new(deadline);
        while let Some(index) = env.manager.claim_next() {
            let region = env.manager.region(index);
            if !region.contains_objects() {
                continue;
            }
            for card in env.card_table.indices_of(region.range()) {
                let Some(to) = scrubbed_state(env.card_table.state(card)) else {
                    continue;
                };
                if clock.expired() {
                    return false;
                }
                if self.card_references_are_remembered(env, card, &mut clock) {
                    env.card_table.set_state(card, to);
                    self.counters.cards_scrubbed.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        true
    }

    /// The scrub proof for one card. False also when the deadline cuts the
    /// proof short; the card simply stays for the cleaner.
    fn card_references_are_remembered(
        &self,
        env: MarkEnv,
        card: usize,
        clock: &mut ScrubDeadline,
    ) -> bool {
        for object in env.mark_map.marked_objects(env.card_table.range_of(card)) {
            match VM::VMObjectModel::object_kind(object) {
                ObjectKind::Leaf => {}
                ObjectKind::Scalar => {
                    if !self.object_slots_covered(env, object, clock) {
                        return false;
                    }
                }
                ObjectKind::Reference(_) => {
                    if !self.object_slots_covered(env, object, clock) {
                        return false;
                    }
                    let referent = VM::VMObjectModel::referent_slot(object).load();
                    clock.charge(1);
                    if !self.slot_is_covered(env, object, referent) {
                        return false;
                    }
                }
                ObjectKind::ObjectArray => {
                    let length = VM::VMObjectModel::array_length(object);
                    let mut start = 0;
                    while start < length {
                        if clock.expired() {
                            return false;
                        }
                        let end = std::cmp::min(start + env.options.array_split_maximum, length);
                        let mut covered = true;
                        VM::VMScanning::scan_array_range(
                            object,
                            start..end,
                            &mut |slot: VM::VMSlot| {
                                covered &= self.slot_is_covered(env, object, slot.load());
                            },
                        );
                        clock.charge(end - start);
                        if !covered {
                            return false;
                        }
                        start = end;
                    }
                }
            }
            if clock.expired() {
                return false;
            }
        }
        true
    }

    fn object_slots_covered(
        &self,
        env: MarkEnv,
        object: ObjectReference,
        clock: &mut ScrubDeadline,
    ) -> bool {
        let mut covered = true;
        let mut slots = 0;
        VM::VMScanning::scan_object(object, &mut |slot: VM::VMSlot| {
            slots += 1;
            covered &= self.slot_is_covered(env, object, slot.load());
        });
        clock.charge(slots);
        covered
    }

    fn slot_is_covered(
        &self,
        env: MarkEnv,
        source: ObjectReference,
        target: Option<ObjectReference>,
    ) -> bool {
        let Some(target) = target else {
            return true;
        };
        if !env.mark_map.is_marked(target) {
            return false;
        }
        if (source.to_raw_address() ^ target.to_raw_address()) < env.manager.region_size() {
            return true;
        }
        // A list mid-rebuild only holds the edges traced so far; membership
        // proves nothing about this one.
        if env
            .manager
            .region_containing(target)
            .remembered_set()
            .is_being_rebuilt()
        {
            return false;
        }
        env.remset.is_reference_remembered(env.manager, source, target)
    }
}
