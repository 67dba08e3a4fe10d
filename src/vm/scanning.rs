use std::ops::Range;

use crate::util::ObjectReference;
use crate::vm::slot::Slot;
use crate::vm::VMBinding;

/// Callback trait of scanning functions that report reference slots.
pub trait SlotVisitor<SL: Slot> {
    /// Call this function for each reference slot.
    fn visit_slot(&mut self, slot: SL);
}

/// This lets us use closures as SlotVisitor.
impl<SL: Slot, F: FnMut(SL)> SlotVisitor<SL> for F {
    fn visit_slot(&mut self, slot: SL) {
        self(slot)
    }
}

/// Root-scanning methods use this trait to turn batches of root slots into
/// tracing work.
///
/// `Clone` is required because the VM may divide one root-scanning call into
/// multiple batches reported from different threads.  `Send + 'static` is
/// required because the batches become work packets executed on GC workers.
pub trait RootsWorkFactory<SL: Slot>: Clone + Send + 'static {
    /// Create tracing work for a batch of root slots.
    fn create_process_roots_work(&mut self, slots: Vec<SL>);
}

/// VM-specific methods for scanning roots and objects.
pub trait Scanning<VM: VMBinding> {
    /// Delegated scanning of an object, visiting each reference field.
    ///
    /// The VM shall call `slot_visitor.visit_slot` on each reference field.
    /// It may skip fields holding null or tagged non-reference values.
    ///
    /// For a reference object the referent field must NOT be visited here.
    /// The tracer applies its own policy to the referent, via
    /// [`crate::vm::ObjectModel::referent_slot`].
    ///
    /// Object arrays are never passed to this method; they go through
    /// [`Scanning::scan_array_range`] instead.
    fn scan_object<SV: SlotVisitor<VM::VMSlot>>(object: ObjectReference, slot_visitor: &mut SV);

    /// Delegated scanning of the slots `range` of an object array, visiting
    /// each slot in the range.  Workers scan disjoint ranges of the same
    /// array in parallel.
    fn scan_array_range<SV: SlotVisitor<VM::VMSlot>>(
        object: ObjectReference,
        range: Range<usize>,
        slot_visitor: &mut SV,
    );

    /// Scan VM roots.  The VM shall report every root slot through the
    /// factory, possibly in multiple batches.
    fn scan_roots(factory: impl RootsWorkFactory<VM::VMSlot>);

    /// Hand cleared reference objects back to the VM so it can append them
    /// to their reference queues.  Called once per phase that clears
    /// references, with the reference objects whose
    /// [`crate::vm::ObjectModel::has_reference_queue`] returned true.
    fn enqueue_cleared_references(references: &[ObjectReference]);
}
