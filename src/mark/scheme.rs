//! The tracing core shared by global mark phases and global collections.
//!
//! All marking flows through [`GlobalMarkingScheme`]: the packet queue, the
//! region overflow fallback, the per-cycle counters and the parallel phase
//! drivers. The scheme itself is stateless about cycle progress; the mark
//! delegate sequences the phases and owns the state machine.

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use enum_map::EnumMap;
use itertools::Itertools;
use portable_atomic::AtomicU64;

use crate::heap::{CardTable, OverflowKind, RegionManager};
use crate::mark::card_cleaner::{CardCleaner, GlobalCollectionCardCleaner, GlobalMarkCardCleaner};
use crate::mark::overflow::RegionBasedOverflow;
use crate::mark::work_packets::{WorkItem, WorkPackets};
use crate::remset::InterRegionRememberedSet;
use crate::scheduler::{GCWorker, TaskSync};
use crate::util::constants::{BYTES_IN_ADDRESS, WORK_PACKET_CAPACITY};
use crate::util::conversions::bytes_to_formatted_string;
use crate::util::mark_map::MarkMap;
use crate::util::options::Options;
use crate::util::ObjectReference;
use crate::vm::{
    ObjectKind, ObjectModel, ReferenceKind, ReferenceState, RootsWorkFactory, Scanning, Slot,
    VMBinding,
};

/// Items processed between checks of the scan budget.
const BUDGET_CHECK_INTERVAL: usize = 128;

/// What a mark cycle is for. A global mark phase runs in increments and
/// rebuilds only the overflowed remembered-set lists; a global collection
/// runs in one pause and rebuilds every list from scratch.
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub(crate) enum CycleKind {
    GlobalMarkPhase,
    GlobalCollection,
}

/// Why an object was scanned. Keyed into the per-cycle counters.
#[derive(Copy, Clone, Debug, PartialEq, Eq, enum_map::Enum, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ScanReason {
    /// Popped off the work packet queue.
    Packet,
    /// Rescanned under a card during card cleaning.
    DirtyCard,
    /// Rescanned from the mark map of an overflowed region.
    OverflowedRegion,
}

/// Borrowed context threaded through every parallel mark operation.
#[derive(Copy, Clone)]
pub(crate) struct MarkEnv<'a> {
    pub manager: &'a RegionManager,
    pub card_table: &'a CardTable,
    pub mark_map: &'a MarkMap,
    pub remset: &'a InterRegionRememberedSet,
    pub options: &'a Options,
    pub sync: &'a TaskSync,
}

/// Bounds on how much one scan call may do before yielding.
#[derive(Copy, Clone)]
pub(crate) struct ScanBudget<'a> {
    deadline: Option<Instant>,
    byte_quota: Option<usize>,
    force_exit: Option<&'a AtomicBool>,
}

impl<'a> ScanBudget<'a> {
    pub fn unbounded() -> Self {
        ScanBudget {
            deadline: None,
            byte_quota: None,
            force_exit: None,
        }
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        ScanBudget {
            deadline: Some(deadline),
            byte_quota: None,
            force_exit: None,
        }
    }

    /// Budget for a concurrent slice: a byte quota plus an external stop
    /// request the driver polls between bursts.
    pub fn concurrent(byte_quota: usize, force_exit: &'a AtomicBool) -> Self {
        ScanBudget {
            deadline: None,
            byte_quota: Some(byte_quota),
            force_exit: Some(force_exit),
        }
    }

    fn exhausted(&self, burst_bytes: usize) -> bool {
        if let Some(force_exit) = self.force_exit {
            if force_exit.load(Ordering::Relaxed) {
                return true;
            }
        }
        if let Some(quota) = self.byte_quota {
            if burst_bytes >= quota {
                return true;
            }
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return true;
            }
        }
        false
    }
}

/// Per-cycle marking counters, updated by all workers.
#[derive(Default)]
pub(crate) struct MarkCounters {
    pub objects_scanned: EnumMap<ScanReason, AtomicU64>,
    pub bytes_scanned: EnumMap<ScanReason, AtomicU64>,
    pub objects_marked: AtomicU64,
    pub cards_cleaned: AtomicU64,
    pub cards_scrubbed: AtomicU64,
    pub packet_overflows: AtomicU64,
    pub references_cleared: AtomicU64,
    pub references_enqueued: AtomicU64,
}

impl MarkCounters {
    fn reset(&self) {
        for counter in self.objects_scanned.values() {
            counter.store(0, Ordering::Relaxed);
        }
        for counter in self.bytes_scanned.values() {
            counter.store(0, Ordering::Relaxed);
        }
        self.objects_marked.store(0, Ordering::Relaxed);
        self.cards_cleaned.store(0, Ordering::Relaxed);
        self.cards_scrubbed.store(0, Ordering::Relaxed);
        self.packet_overflows.store(0, Ordering::Relaxed);
        self.references_cleared.store(0, Ordering::Relaxed);
        self.references_enqueued.store(0, Ordering::Relaxed);
    }

    fn snapshot(&self) -> MarkStats {
        MarkStats {
            objects_scanned: EnumMap::from_fn(|reason| {
                self.objects_scanned[reason].load(Ordering::Relaxed)
            }),
            bytes_scanned: EnumMap::from_fn(|reason| {
                self.bytes_scanned[reason].load(Ordering::Relaxed)
            }),
            objects_marked: self.objects_marked.load(Ordering::Relaxed),
            cards_cleaned: self.cards_cleaned.load(Ordering::Relaxed),
            cards_scrubbed: self.cards_scrubbed.load(Ordering::Relaxed),
            packet_overflows: self.packet_overflows.load(Ordering::Relaxed),
            references_cleared: self.references_cleared.load(Ordering::Relaxed),
            references_enqueued: self.references_enqueued.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time marking accounting, for cycle logs and tests.
///
/// Scan counts are per [`ScanReason`]; array slices count as individual
/// scan items.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MarkStats {
    pub objects_scanned: EnumMap<ScanReason, u64>,
    pub bytes_scanned: EnumMap<ScanReason, u64>,
    pub objects_marked: u64,
    pub cards_cleaned: u64,
    pub cards_scrubbed: u64,
    pub packet_overflows: u64,
    pub references_cleared: u64,
    pub references_enqueued: u64,
}

impl fmt::Display for MarkStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scanned = self
            .objects_scanned
            .iter()
            .map(|(reason, objects)| {
                format!(
                    "{}={}/{}",
                    reason,
                    objects,
                    bytes_to_formatted_string(self.bytes_scanned[reason] as usize)
                )
            })
            .join(" ");
        write!(
            f,
            "{} marked, scanned [{}], {} cards cleaned, {} scrubbed, \
             {} packet overflows, references {} cleared / {} enqueued",
            self.objects_marked,
            scanned,
            self.cards_cleaned,
            self.cards_scrubbed,
            self.packet_overflows,
            self.references_cleared,
            self.references_enqueued
        )
    }
}

/// Buffers root slot batches reported by the binding so the whole gang can
/// trace them in parallel. The binding may clone the factory into helper
/// threads; clones share one batch list.
#[derive(Clone)]
struct CollectRootSlots<SL: Slot> {
    batches: Arc<spin::Mutex<Vec<Vec<SL>>>>,
}

impl<SL: Slot + 'static> RootsWorkFactory<SL> for CollectRootSlots<SL> {
    fn create_process_roots_work(&mut self, slots: Vec<SL>) {
        if !slots.is_empty() {
            self.batches.lock().push(slots);
        }
    }
}

/// A worker's view of the packet queue: a resident output packet, with the
/// shared pool behind it and region overflow as the last resort.
///
/// The stream must be flushed at the end of a parallel pass; a non-empty
/// output is published so queued work survives into the next increment.
pub(crate) struct WorkStream<'a> {
    packets: &'a WorkPackets,
    overflow: &'a RegionBasedOverflow,
    manager: &'a RegionManager,
    counters: &'a MarkCounters,
    output: Vec<WorkItem>,
}

impl<'a> WorkStream<'a> {
    fn new(
        packets: &'a WorkPackets,
        overflow: &'a RegionBasedOverflow,
        manager: &'a RegionManager,
        counters: &'a MarkCounters,
    ) -> Self {
        // The pool holds at least one packet per worker, but the free queue
        // can be momentarily empty while other workers swap; work pending
        // from an earlier increment serves just as well.
        let output = loop {
            if let Some(packet) = packets.acquire_empty() {
                break packet;
            }
            if let Some(packet) = packets.fetch() {
                break packet;
            }
            std::thread::yield_now();
        };
        WorkStream {
            packets,
            overflow,
            manager,
            counters,
            output,
        }
    }

    pub fn push(&mut self, item: WorkItem) {
        if self.output.len() >= WORK_PACKET_CAPACITY {
            if let Some(empty) = self.packets.acquire_empty() {
                let full = std::mem::replace(&mut self.output, empty);
                self.packets.publish(full);
            } else {
                self.counters.packet_overflows.fetch_add(1, Ordering::Relaxed);
                self.overflow.empty_to_overflow(self.manager, &mut self.output);
            }
        }
        self.output.push(item);
    }

    pub fn pop(&mut self) -> Option<WorkItem> {
        if let Some(item) = self.output.pop() {
            return Some(item);
        }
        let full = self.packets.fetch()?;
        let empty = std::mem::replace(&mut self.output, full);
        self.packets.release_empty(empty);
        self.output.pop()
    }

    pub fn flush(self) {
        if self.output.is_empty() {
            self.packets.release_empty(self.output);
        } else {
            self.packets.publish(self.output);
        }
    }
}

/// The marking engine: one per heap, shared by every worker.
pub struct GlobalMarkingScheme<VM: VMBinding> {
    pub(super) packets: WorkPackets,
    pub(super) overflow: RegionBasedOverflow,
    pub(super) counters: MarkCounters,
    /// Bytes scanned since the current budgeted call began.
    pub(super) scanned_burst: AtomicUsize,
    /// Raised when the budget runs out; every worker stops at its next check.
    pub(super) halt: AtomicBool,
    /// Decision of the last termination round: run overflow recovery or stop.
    pub(super) recovery_round: AtomicBool,
    pub(super) root_batches: Arc<spin::Mutex<Vec<Vec<VM::VMSlot>>>>,
    _p: PhantomData<VM>,
}

impl<VM: VMBinding> GlobalMarkingScheme<VM> {
    pub(crate) fn new(options: &Options) -> Self {
        // Every worker keeps one resident packet.
        let packet_count = std::cmp::max(options.packet_count(), options.threads);
        GlobalMarkingScheme {
            packets: WorkPackets::new(packet_count),
            overflow: RegionBasedOverflow::new(OverflowKind::Global),
            counters: MarkCounters::default(),
            scanned_burst: AtomicUsize::new(0),
            halt: AtomicBool::new(false),
            recovery_round: AtomicBool::new(false),
            root_batches: Arc::new(spin::Mutex::new(Vec::new())),
            _p: PhantomData,
        }
    }

    /// Reset per-cycle state. The previous cycle must have fully drained.
    pub(super) fn begin_cycle(&self) {
        debug_assert!(!self.packets.has_pending());
        debug_assert!(self.root_batches.lock().is_empty());
        self.counters.reset();
        self.scanned_burst.store(0, Ordering::SeqCst);
        self.halt.store(false, Ordering::SeqCst);
        self.recovery_round.store(false, Ordering::SeqCst);
    }

    pub(crate) fn stats(&self) -> MarkStats {
        self.counters.snapshot()
    }

    pub(super) fn stream<'e>(&'e self, env: MarkEnv<'e>) -> WorkStream<'e> {
        WorkStream::new(&self.packets, &self.overflow, env.manager, &self.counters)
    }

    fn record_scan(&self, worker: &mut GCWorker, reason: ScanReason, bytes: usize) {
        worker.note_scanned(bytes);
        self.counters.objects_scanned[reason].fetch_add(1, Ordering::Relaxed);
        self.counters.bytes_scanned[reason].fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn mark_and_queue(&self, env: MarkEnv, stream: &mut WorkStream, target: ObjectReference) {
        if env.mark_map.mark_atomic(target) {
            self.counters.objects_marked.fetch_add(1, Ordering::Relaxed);
            // Leaves have nothing to scan; the mark bit is all they need.
            if VM::VMObjectModel::object_kind(target) != ObjectKind::Leaf {
                stream.push(WorkItem::Object(target));
            }
        }
    }

    pub(super) fn trace_root(&self, env: MarkEnv, stream: &mut WorkStream, target: ObjectReference) {
        self.mark_and_queue(env, stream, target);
    }

    /// Trace one reference found in `source`. Marks and queues the target,
    /// and feeds the remembered-set rebuild when the edge crosses regions.
    fn trace_edge(
        &self,
        env: MarkEnv,
        kind: CycleKind,
        worker: &mut GCWorker,
        stream: &mut WorkStream,
        source: ObjectReference,
        target: ObjectReference,
    ) {
        self.mark_and_queue(env, stream, target);
        if (source.to_raw_address() ^ target.to_raw_address()) >= env.manager.region_size() {
            env.remset.remember_reference_for_mark(
                env.manager,
                &mut worker.remset,
                source,
                target,
                kind == CycleKind::GlobalMarkPhase,
            );
        }
    }

    fn scan_work_item(
        &self,
        env: MarkEnv,
        kind: CycleKind,
        worker: &mut GCWorker,
        stream: &mut WorkStream,
        item: WorkItem,
        reason: ScanReason,
    ) {
        match item {
            WorkItem::Object(object) => self.scan_object(env, kind, worker, stream, object, reason),
            WorkItem::ArraySplit { array, start } => {
                self.scan_array_slice(env, kind, worker, stream, array, start, reason)
            }
        }
    }

    pub(super) fn scan_object(
        &self,
        env: MarkEnv,
        kind: CycleKind,
        worker: &mut GCWorker,
        stream: &mut WorkStream,
        object: ObjectReference,
        reason: ScanReason,
    ) {
        debug_assert!(env.mark_map.is_marked(object));
        match VM::VMObjectModel::object_kind(object) {
            ObjectKind::Scalar => {
                VM::VMScanning::scan_object(object, &mut |slot: VM::VMSlot| {
                    if let Some(target) = slot.load() {
                        self.trace_edge(env, kind, worker, stream, object, target);
                    }
                });
                self.record_scan(worker, reason, VM::VMObjectModel::object_size(object));
            }
            ObjectKind::ObjectArray => {
                self.scan_array_slice(env, kind, worker, stream, object, 0, reason)
            }
            ObjectKind::Leaf => {
                // Mark map walks (card cleaning, overflow recovery) deliver
                // every marked object, so leaves do arrive here.
                self.record_scan(worker, reason, VM::VMObjectModel::object_size(object));
            }
            ObjectKind::Reference(ref_kind) => {
                self.scan_reference(env, kind, worker, stream, object, ref_kind, reason)
            }
        }
    }

    fn scan_array_slice(
        &self,
        env: MarkEnv,
        kind: CycleKind,
        worker: &mut GCWorker,
        stream: &mut WorkStream,
        array: ObjectReference,
        start: usize,
        reason: ScanReason,
    ) {
        let length = VM::VMObjectModel::array_length(array);
        let end = std::cmp::min(start + env.options.array_split_maximum, length);
        if end < length {
            // Publish the remainder first so other workers can help with a
            // large array right away.
            stream.push(WorkItem::ArraySplit { array, start: end });
        }
        VM::VMScanning::scan_array_range(array, start..end, &mut |slot: VM::VMSlot| {
            if let Some(target) = slot.load() {
                self.trace_edge(env, kind, worker, stream, array, target);
            }
        });
        self.record_scan(worker, reason, (end - start) * BYTES_IN_ADDRESS);
    }

    /// Scan a soft, weak or phantom reference object.
    ///
    /// Ordinary fields trace as usual. An active reference is discovered on
    /// its region for the processing passes; its referent is traced only
    /// while the reference policy treats it as strong (soft references
    /// younger than the age limit). Cleared and enqueued references keep
    /// whatever their referent field still holds alive.
    fn scan_reference(
        &self,
        env: MarkEnv,
        kind: CycleKind,
        worker: &mut GCWorker,
        stream: &mut WorkStream,
        object: ObjectReference,
        ref_kind: ReferenceKind,
        reason: ScanReason,
    ) {
        VM::VMScanning::scan_object(object, &mut |slot: VM::VMSlot| {
            if let Some(target) = slot.load() {
                self.trace_edge(env, kind, worker, stream, object, target);
            }
        });
        let state = VM::VMObjectModel::reference_state(object);
        if state == ReferenceState::Active {
            env.manager
                .region_containing(object)
                .add_discovered_reference(ref_kind, object);
        }
        let treat_strong = state != ReferenceState::Active
            || (ref_kind == ReferenceKind::Soft
                && VM::VMObjectModel::soft_reference_age(object)
                    < env.options.max_soft_reference_age as usize);
        if treat_strong {
            if let Some(referent) = VM::VMObjectModel::referent_slot(object).load() {
                self.trace_edge(env, kind, worker, stream, object, referent);
            }
        }
        self.record_scan(worker, reason, VM::VMObjectModel::object_size(object));
    }

    /// Clear the mark map and prepare the remembered set for the cycle.
    /// A global collection also wipes every card: the trace it is about to
    /// run supersedes all recorded obligations.
    pub(super) fn init_mark_map(
        &self,
        env: MarkEnv,
        kind: CycleKind,
        worker: &mut GCWorker,
        stream: &mut WorkStream,
    ) {
        let ordinal = worker.ordinal();
        if env.sync.synchronize_and_release_single(ordinal) {
            match kind {
                CycleKind::GlobalCollection => env.remset.prepare_regions_for_global_collect(
                    env.manager,
                    &mut worker.remset,
                    false,
                ),
                CycleKind::GlobalMarkPhase => env
                    .remset
                    .prepare_overflowed_regions_for_rebuilding(env.manager, &mut worker.remset),
            }
            env.manager.reset_work_units();
            env.sync.release_synchronized(ordinal);
        }
        while let Some(index) = env.manager.claim_next() {
            let region = env.manager.region(index);
            if !region.take_mark_map_cleared() {
                env.mark_map.clear_range(region.range());
            }
            // A stale flag from an aborted cycle would corrupt the first
            // recovery round.
            region.clear_overflow_mark(OverflowKind::Global);
        }
        if kind == CycleKind::GlobalCollection {
            self.clean_cards(env, kind, worker, stream, &GlobalCollectionCardCleaner);
        }
    }

    /// Walk the binding's root set and trace every root slot.
    pub(super) fn mark_roots(&self, env: MarkEnv, worker: &mut GCWorker, stream: &mut WorkStream) {
        let ordinal = worker.ordinal();
        if env.sync.synchronize_and_release_single(ordinal) {
            let factory = CollectRootSlots::<VM::VMSlot> {
                batches: Arc::clone(&self.root_batches),
            };
            VM::VMScanning::scan_roots(factory);
            env.sync.release_synchronized(ordinal);
        }
        loop {
            let batch = self.root_batches.lock().pop();
            let Some(batch) = batch else { break };
            for slot in batch {
                if let Some(target) = slot.load() {
                    self.trace_root(env, stream, target);
                }
            }
        }
    }

    /// Flush this worker's scanned bytes into the shared burst and decide
    /// whether the budget is spent. The first worker to notice raises the
    /// halt flag for everyone.
    fn check_budget(&self, worker: &mut GCWorker, budget: ScanBudget) -> bool {
        self.scanned_burst
            .fetch_add(worker.take_scanned(), Ordering::Relaxed);
        if self.halt.load(Ordering::Relaxed) {
            return true;
        }
        if budget.exhausted(self.scanned_burst.load(Ordering::Relaxed)) {
            self.halt.store(true, Ordering::SeqCst);
            return true;
        }
        false
    }

    /// Pop and scan until the queue is empty, the budget runs out, or
    /// another worker halts the pass.
    fn drain(
        &self,
        env: MarkEnv,
        kind: CycleKind,
        worker: &mut GCWorker,
        stream: &mut WorkStream,
        budget: ScanBudget,
    ) {
        let mut until_check = BUDGET_CHECK_INTERVAL;
        while !self.halt.load(Ordering::Relaxed) {
            let Some(item) = stream.pop() else { break };
            self.scan_work_item(env, kind, worker, stream, item, ScanReason::Packet);
            until_check -= 1;
            if until_check == 0 {
                until_check = BUDGET_CHECK_INTERVAL;
                if self.check_budget(worker, budget) {
                    break;
                }
            }
        }
        self.scanned_burst
            .fetch_add(worker.take_scanned(), Ordering::Relaxed);
    }

    /// Re-derive work for regions whose queued items were demoted to
    /// overflow marks: every marked object in a flagged region is rescanned.
    /// Objects scanned twice re-trace edges already traced, which is sound;
    /// the mark bit still admits each target only once.
    fn rescan_overflowed_regions(
        &self,
        env: MarkEnv,
        kind: CycleKind,
        worker: &mut GCWorker,
        stream: &mut WorkStream,
        budget: ScanBudget,
    ) {
        let overflow_kind = self.overflow.kind();
        while let Some(index) = env.manager.claim_next() {
            if self.halt.load(Ordering::Relaxed) {
                // Flagged regions may remain unclaimed; keep the latch up so
                // the next pass runs another recovery round.
                self.overflow.raise_latch();
                return;
            }
            let region = env.manager.region(index);
            if !region.contains_objects() || !region.is_overflow_marked(overflow_kind) {
                continue;
            }
            // Clear before scanning: a demotion hitting this region while we
            // walk it re-raises the flag and the latch, and the next round
            // picks it up.
            region.clear_overflow_mark(overflow_kind);
            let mut until_check = BUDGET_CHECK_INTERVAL;
            for object in env.mark_map.marked_objects(region.range()) {
                self.scan_object(env, kind, worker, stream, object, ScanReason::OverflowedRegion);
                until_check -= 1;
                if until_check == 0 {
                    until_check = BUDGET_CHECK_INTERVAL;
                    if self.check_budget(worker, budget) {
                        region.set_overflow_mark(overflow_kind);
                        self.overflow.raise_latch();
                        return;
                    }
                }
            }
        }
        self.scanned_burst
            .fetch_add(worker.take_scanned(), Ordering::Relaxed);
    }

    /// Drain the queue to a globally observed empty state.
    ///
    /// Workers that run out of work rendezvous; the last to arrive proves the
    /// queue quiescent, then decides between terminating and an overflow
    /// recovery round. Returns false if the budget halted the scan first, in
    /// which case queue state persists for the next call.
    pub(super) fn complete_scan(
        &self,
        env: MarkEnv,
        kind: CycleKind,
        worker: &mut GCWorker,
        stream: &mut WorkStream,
        budget: ScanBudget,
    ) -> bool {
        let ordinal = worker.ordinal();
        if env.sync.synchronize_and_release_single(ordinal) {
            // A previous budgeted call may have left the flag raised.
            self.halt.store(false, Ordering::SeqCst);
            env.sync.release_synchronized(ordinal);
        }
        loop {
            self.drain(env, kind, worker, stream, budget);
            env.sync.synchronize(ordinal);
            if self.halt.load(Ordering::SeqCst) {
                return false;
            }
            if env.sync.synchronize_and_release_single(ordinal) {
                self.recovery_round
                    .store(self.overflow.take_latch(), Ordering::SeqCst);
                env.manager.reset_work_units();
                env.sync.release_synchronized(ordinal);
            }
            if !self.recovery_round.load(Ordering::SeqCst) {
                return true;
            }
            self.rescan_overflowed_regions(env, kind, worker, stream, budget);
        }
    }

    /// The final stretch of a mark: consume card obligations accumulated
    /// while marking ran, re-walk the roots, then process references.
    pub(super) fn complete_marking(
        &self,
        env: MarkEnv,
        kind: CycleKind,
        worker: &mut GCWorker,
        stream: &mut WorkStream,
    ) {
        self.clean_cards(env, kind, worker, stream, &GlobalMarkCardCleaner);
        self.mark_roots(env, worker, stream);
        self.complete_scan(env, kind, worker, stream, ScanBudget::unbounded());
        self.process_reference_pass(env, kind, worker, ReferenceKind::Soft);
        self.process_reference_pass(env, kind, worker, ReferenceKind::Weak);
        self.complete_scan(env, kind, worker, stream, ScanBudget::unbounded());
        self.process_reference_pass(env, kind, worker, ReferenceKind::Phantom);
        self.complete_scan(env, kind, worker, stream, ScanBudget::unbounded());
    }

    /// Consume card states under `cleaner`, rescanning the marked objects of
    /// each card whose disposition asks for it.
    pub(super) fn clean_cards(
        &self,
        env: MarkEnv,
        kind: CycleKind,
        worker: &mut GCWorker,
        stream: &mut WorkStream,
        cleaner: &impl CardCleaner,
    ) {
        let ordinal = worker.ordinal();
        if env.sync.synchronize_and_release_single(ordinal) {
            env.manager.reset_work_units();
            env.sync.release_synchronized(ordinal);
        }
        while let Some(index) = env.manager.claim_next() {
            let region = env.manager.region(index);
            if !region.contains_objects() {
                continue;
            }
            for card in env.card_table.indices_of(region.range()) {
                let Some((to, rescan)) = cleaner.disposition(env.card_table.state(card)) else {
                    continue;
                };
                env.card_table.set_state(card, to);
                self.counters.cards_cleaned.fetch_add(1, Ordering::Relaxed);
                if rescan {
                    for object in env.mark_map.marked_objects(env.card_table.range_of(card)) {
                        self.scan_object(env, kind, worker, stream, object, ScanReason::DirtyCard);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mark::testing::MarkFixture;
    use crate::util::test_util::toy_vm::ToyVM;

    fn run_trace(
        fixture: &MarkFixture,
        scheme: &GlobalMarkingScheme<ToyVM>,
        kind: CycleKind,
        roots: &[ObjectReference],
    ) -> bool {
        let env = fixture.env();
        let complete = AtomicBool::new(false);
        fixture.runner.run(|worker| {
            let mut stream = scheme.stream(env);
            scheme.init_mark_map(env, kind, worker, &mut stream);
            // Worker 0 traces the roots so mark counts stay exact.
            if worker.ordinal() == 0 {
                for root in roots {
                    scheme.trace_root(env, &mut stream, *root);
                }
            }
            let done = scheme.complete_scan(env, kind, worker, &mut stream, ScanBudget::unbounded());
            if worker.ordinal() == 0 {
                complete.store(done, Ordering::Relaxed);
            }
            stream.flush();
        });
        complete.load(Ordering::Relaxed)
    }

    #[test]
    fn trace_marks_the_reachable_graph() {
        let fixture = MarkFixture::new();
        let scheme = fixture.scheme();
        let mut writer = fixture.writer();
        let d = writer.leaf(2);
        let c = writer.scalar(&[Some(d)]);
        let b = writer.leaf(1);
        let a = writer.scalar(&[Some(b), Some(c)]);
        let unreachable = writer.leaf(1);

        scheme.begin_cycle();
        assert!(run_trace(
            &fixture,
            &scheme,
            CycleKind::GlobalCollection,
            &[a]
        ));

        for object in [a, b, c, d] {
            assert!(fixture.mark_map.is_marked(object));
        }
        assert!(!fixture.mark_map.is_marked(unreachable));

        let stats = scheme.stats();
        assert_eq!(stats.objects_marked, 4);
        // Only the two scalars produce queue items; leaves mark in place.
        assert_eq!(stats.objects_scanned[ScanReason::Packet], 2);
        assert!(stats.bytes_scanned[ScanReason::Packet] > 0);
    }

    #[test]
    fn large_arrays_are_scanned_in_slices() {
        let fixture = MarkFixture::with_options(|options| {
            assert!(options.set_from_str("array_split_maximum", "64"));
        });
        let scheme = fixture.scheme();
        let mut writer = fixture.writer();
        const LEN: usize = 300;
        let array = writer.array(LEN);
        let elements: Vec<ObjectReference> = (0..LEN).map(|_| writer.leaf(1)).collect();
        for (i, element) in elements.iter().enumerate() {
            writer.set_slot(array, i, *element);
        }

        scheme.begin_cycle();
        assert!(run_trace(
            &fixture,
            &scheme,
            CycleKind::GlobalCollection,
            &[array]
        ));

        assert!(elements.iter().all(|e| fixture.mark_map.is_marked(*e)));
        let stats = scheme.stats();
        assert_eq!(stats.objects_marked, (LEN + 1) as u64);
        // 300 slots in 64-slot slices: the base item plus four splits.
        assert_eq!(stats.objects_scanned[ScanReason::Packet], 5);
        assert_eq!(
            stats.bytes_scanned[ScanReason::Packet],
            (LEN * BYTES_IN_ADDRESS) as u64
        );
    }

    #[test]
    fn cross_region_edges_feed_the_remembered_set() {
        let fixture = MarkFixture::new();
        let scheme = fixture.scheme();
        let region_size = fixture.manager.region_size();
        let mut writer = fixture.writer();
        let source = writer.scalar(&[None]);
        writer.seek(fixture.manager.heap_start() + region_size);
        let target = writer.leaf(1);
        writer.set_slot(source, 0, target);

        scheme.begin_cycle();
        assert!(run_trace(
            &fixture,
            &scheme,
            CycleKind::GlobalCollection,
            &[source]
        ));

        // A global collection rebuilds every list, so the edge must be there.
        assert!(fixture
            .remset
            .is_reference_remembered(&fixture.manager, source, target));
    }

    #[test]
    fn global_mark_phase_skips_lists_not_being_rebuilt() {
        let fixture = MarkFixture::new();
        let scheme = fixture.scheme();
        let region_size = fixture.manager.region_size();
        let mut writer = fixture.writer();
        let source = writer.scalar(&[None]);
        writer.seek(fixture.manager.heap_start() + region_size);
        let target = writer.leaf(1);
        writer.set_slot(source, 0, target);

        scheme.begin_cycle();
        assert!(run_trace(
            &fixture,
            &scheme,
            CycleKind::GlobalMarkPhase,
            &[source]
        ));

        assert!(fixture.mark_map.is_marked(target));
        // No list was flagged for rebuilding, so nothing was appended.
        assert_eq!(fixture.manager.region(1).remembered_set().size(), 0);
    }

    #[test]
    fn packet_pool_exhaustion_recovers_through_region_overflow() {
        let fixture = MarkFixture::with_options(|options| {
            assert!(options.set_from_str("work_packet_count", "2"));
        });
        let scheme = fixture.scheme();
        let mut writer = fixture.writer();
        const FANOUT: usize = 1500;
        let array = writer.array(FANOUT);
        let children: Vec<ObjectReference> = (0..FANOUT).map(|_| writer.scalar(&[None])).collect();
        for (i, child) in children.iter().enumerate() {
            writer.set_slot(array, i, *child);
        }

        scheme.begin_cycle();
        assert!(run_trace(
            &fixture,
            &scheme,
            CycleKind::GlobalCollection,
            &[array]
        ));

        assert!(children.iter().all(|c| fixture.mark_map.is_marked(*c)));
        let stats = scheme.stats();
        assert_eq!(stats.objects_marked, (FANOUT + 1) as u64);
        assert!(stats.packet_overflows > 0);
        assert!(stats.objects_scanned[ScanReason::OverflowedRegion] > 0);
        // Recovery consumed every flag and the latch.
        assert!(!scheme.overflow.is_latched());
        for region in fixture.manager.regions() {
            assert!(!region.is_overflow_marked(OverflowKind::Global));
        }
    }

    #[test]
    fn an_expired_deadline_halts_the_scan_and_a_later_call_finishes() {
        let fixture = MarkFixture::new();
        let scheme = fixture.scheme();
        let mut writer = fixture.writer();
        const CHAIN: usize = 2000;
        let tail = writer.scalar(&[None]);
        let mut next = tail;
        for _ in 1..CHAIN {
            next = writer.scalar(&[Some(next)]);
        }
        let head = next;

        scheme.begin_cycle();
        let env = fixture.env();
        let halted = AtomicBool::new(false);
        fixture.runner.run(|worker| {
            let mut stream = scheme.stream(env);
            scheme.init_mark_map(env, CycleKind::GlobalCollection, worker, &mut stream);
            if worker.ordinal() == 0 {
                scheme.trace_root(env, &mut stream, head);
            }
            let done = scheme.complete_scan(
                env,
                CycleKind::GlobalCollection,
                worker,
                &mut stream,
                ScanBudget::with_deadline(Instant::now()),
            );
            if worker.ordinal() == 0 {
                halted.store(!done, Ordering::Relaxed);
            }
            stream.flush();
        });
        assert!(halted.load(Ordering::Relaxed));
        // The chain is far longer than one budget check interval, so the
        // tail cannot have been reached before the halt.
        assert!(!fixture.mark_map.is_marked(tail));

        // Queue state persisted; an unbounded call finishes the trace.
        let complete = AtomicBool::new(false);
        fixture.runner.run(|worker| {
            let mut stream = scheme.stream(env);
            let done = scheme.complete_scan(
                env,
                CycleKind::GlobalCollection,
                worker,
                &mut stream,
                ScanBudget::unbounded(),
            );
            if worker.ordinal() == 0 {
                complete.store(done, Ordering::Relaxed);
            }
            stream.flush();
        });
        assert!(complete.load(Ordering::Relaxed));
        assert!(fixture.mark_map.is_marked(tail));
        assert_eq!(scheme.stats().objects_marked, CHAIN as u64);
    }

    #[test]
    fn a_byte_quota_stops_a_concurrent_burst() {
        let fixture = MarkFixture::new();
        let scheme = fixture.scheme();
        let mut writer = fixture.writer();
        const CHAIN: usize = 2000;
        let mut next: Option<ObjectReference> = None;
        for _ in 0..CHAIN {
            next = Some(writer.scalar(&[next]));
        }
        let head = next.unwrap();

        scheme.begin_cycle();
        let env = fixture.env();
        let force_exit = AtomicBool::new(false);
        let done = AtomicBool::new(true);
        fixture.runner.run(|worker| {
            let mut stream = scheme.stream(env);
            scheme.init_mark_map(env, CycleKind::GlobalCollection, worker, &mut stream);
            if worker.ordinal() == 0 {
                scheme.trace_root(env, &mut stream, head);
            }
            let finished = scheme.complete_scan(
                env,
                CycleKind::GlobalCollection,
                worker,
                &mut stream,
                ScanBudget::concurrent(4096, &force_exit),
            );
            if worker.ordinal() == 0 {
                done.store(finished, Ordering::Relaxed);
            }
            stream.flush();
        });
        assert!(!done.load(Ordering::Relaxed));
        let burst = scheme.scanned_burst.load(Ordering::Relaxed);
        assert!(burst >= 4096, "burst {} never reached the quota", burst);
        // The flag alone stops a scan even with quota to spare.
        force_exit.store(true, Ordering::SeqCst);
        scheme.scanned_burst.store(0, Ordering::SeqCst);
        let done = AtomicBool::new(true);
        fixture.runner.run(|worker| {
            let mut stream = scheme.stream(env);
            let finished = scheme.complete_scan(
                env,
                CycleKind::GlobalCollection,
                worker,
                &mut stream,
                ScanBudget::concurrent(usize::MAX, &force_exit),
            );
            if worker.ordinal() == 0 {
                done.store(finished, Ordering::Relaxed);
            }
            stream.flush();
        });
        assert!(!done.load(Ordering::Relaxed));
    }

    #[test]
    fn mark_stats_render_one_line() {
        let stats = MarkStats {
            objects_marked: 12,
            cards_cleaned: 3,
            ..Default::default()
        };
        let line = stats.to_string();
        assert!(line.contains("12 marked"));
        assert!(line.contains("packet=0"));
        assert!(line.contains("3 cards cleaned"));
    }
}
