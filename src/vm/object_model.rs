use crate::util::ObjectReference;
use crate::vm::VMBinding;

/// The shape of an object as far as tracing is concerned.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ObjectKind {
    /// An object with a fixed set of reference fields.
    Scalar,
    /// An array of reference slots.  Large instances are split into index
    /// ranges so multiple workers can scan one array.
    ObjectArray,
    /// An object with no reference fields.  It is marked but never scanned.
    Leaf,
    /// A soft, weak or phantom reference object.  Its referent field is not
    /// traced like an ordinary field.
    Reference(ReferenceKind),
}

/// Reference strength, ordered from strongest to weakest.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, enum_map::Enum)]
pub enum ReferenceKind {
    /// Cleared only when the referent has not survived enough collections.
    Soft,
    /// Cleared as soon as the referent is found unreachable.
    Weak,
    /// Cleared after everything else, in a dedicated phase at the end of
    /// marking.
    Phantom,
}

/// Lifecycle state stored in a reference object's header.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReferenceState {
    /// The referent has not been cleared.
    Active,
    /// The referent was found dead and the referent field was nulled.
    Cleared,
    /// The reference has been handed to the VM's reference queue.
    Enqueued,
}

/// VM-specific methods for accessing object layout and headers.
///
/// The tracer never inspects object memory directly.  Object sizes, shapes
/// and the state bits of a `java.lang.ref` style reference all go through
/// this trait.
pub trait ObjectModel<VM: VMBinding> {
    /// Return the size of the object in bytes, including the header.  Used
    /// for scanned-bytes accounting.
    fn object_size(object: ObjectReference) -> usize;

    /// Classify the object for tracing.
    fn object_kind(object: ObjectReference) -> ObjectKind;

    /// Return the number of reference slots in an object array.
    ///
    /// The object must be of kind [`ObjectKind::ObjectArray`].
    fn array_length(object: ObjectReference) -> usize;

    /// Return the slot holding the referent of a reference object.
    ///
    /// The object must be of kind [`ObjectKind::Reference`].
    fn referent_slot(object: ObjectReference) -> VM::VMSlot;

    /// Read the lifecycle state of a reference object.
    fn reference_state(object: ObjectReference) -> ReferenceState;

    /// Update the lifecycle state of a reference object.
    fn set_reference_state(object: ObjectReference, state: ReferenceState);

    /// Read the age of a soft reference.  The age counts the consecutive
    /// collections in which the referent was kept alive only softly.
    fn soft_reference_age(object: ObjectReference) -> usize;

    /// Update the age of a soft reference.
    fn set_soft_reference_age(object: ObjectReference, age: usize);

    /// Return true if the reference object was constructed with a reference
    /// queue.  Cleared references without a queue are not enqueued.
    fn has_reference_queue(object: ObjectReference) -> bool;
}
