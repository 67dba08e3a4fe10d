//! The traits a VM must implement to be traced by this crate.
//!
//! The tracer is VM-neutral.  Everything it needs from a VM, from object
//! shape down to where the roots are, is expressed through the
//! [`VMBinding`] trait and its associated types.  A VM binding implements
//! these traits with static methods; no trait object is ever constructed.

mod object_model;
mod scanning;
/// Reference slot abstraction.
pub mod slot;

pub use self::object_model::ObjectKind;
pub use self::object_model::ObjectModel;
pub use self::object_model::ReferenceKind;
pub use self::object_model::ReferenceState;
pub use self::scanning::RootsWorkFactory;
pub use self::scanning::Scanning;
pub use self::scanning::SlotVisitor;
pub use self::slot::SimpleSlot;
pub use self::slot::Slot;

/// The `VMBinding` trait associates a VM with the types it plugs into the
/// tracer.  It is intended to be implemented by a zero-sized type, and that
/// type parameterizes the whole crate.
pub trait VMBinding
where
    Self: Sized + 'static + Send + Sync + Default,
{
    /// The object layout and header access methods of this VM.
    type VMObjectModel: ObjectModel<Self>;
    /// The object and root scanning methods of this VM.
    type VMScanning: Scanning<Self>;
    /// The reference slot type of this VM.
    type VMSlot: Slot;
}
