//! The [`Slot`] trait, through which the tracer loads and updates object references without
//! knowing how the VM encodes them in memory.

use std::fmt::Debug;
use std::hash::Hash;

use atomic::Atomic;

use crate::util::{Address, ObjectReference};

/// A handle on one place in memory that may hold an object reference.
///
/// Slots live in object fields, on stacks and in globals, and VMs encode references in them in
/// different ways: direct pointers, compressed pointers, tagged or offsetted pointers.  This
/// trait hides the encoding; the tracer only ever sees the decoded `ObjectReference`.
///
/// A `Slot` value *points to* a slot rather than being the slot itself, so copying one yields
/// another handle on the same memory.
///
/// Implementations sit on the hottest paths of the tracer and should stay cheap.
pub trait Slot: Copy + Send + Debug + PartialEq + Eq + Hash {
    /// Decode the object reference currently in the slot, or `None` if the slot holds a
    /// non-reference value such as null or a tagged immediate.
    fn load(&self) -> Option<ObjectReference>;

    /// Encode `object` into the slot.  Any tag bits the slot carries alongside the reference
    /// must be preserved.
    fn store(&self, object: ObjectReference);

    /// Write the null value into the slot.  Reference processing uses this to sever the referent
    /// field of a cleared soft, weak or phantom reference.
    fn clear(&self);
}

/// A word-sized slot holding the raw address of an `ObjectReference`, with 0 standing for null.
/// Suitable as the slot type for VMs that store references as plain pointers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct SimpleSlot {
    slot_addr: *mut Atomic<Address>,
}

impl SimpleSlot {
    /// Create a handle on the word at `address`.
    pub fn from_address(address: Address) -> Self {
        Self {
            slot_addr: address.to_mut_ptr(),
        }
    }

    /// The address of the word this slot reads and writes.
    pub fn as_address(&self) -> Address {
        Address::from_mut_ptr(self.slot_addr)
    }
}

unsafe impl Send for SimpleSlot {}

impl Slot for SimpleSlot {
    fn load(&self) -> Option<ObjectReference> {
        let addr = unsafe { (*self.slot_addr).load(atomic::Ordering::Relaxed) };
        ObjectReference::from_raw_address(addr)
    }

    fn store(&self, object: ObjectReference) {
        unsafe { (*self.slot_addr).store(object.to_raw_address(), atomic::Ordering::Relaxed) }
    }

    fn clear(&self) {
        unsafe { (*self.slot_addr).store(Address::ZERO, atomic::Ordering::Relaxed) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_slot_is_pointer_sized() {
        assert_eq!(
            std::mem::size_of::<SimpleSlot>(),
            std::mem::size_of::<*mut libc::c_void>()
        );
    }

    #[test]
    fn load_store_clear() {
        let mut cell: usize = 0;
        let slot = SimpleSlot::from_address(Address::from_mut_ptr(&mut cell));
        assert_eq!(slot.load(), None);
        let fake_object =
            ObjectReference::from_raw_address(unsafe { Address::from_usize(0x1000) }).unwrap();
        slot.store(fake_object);
        assert_eq!(slot.load(), Some(fake_object));
        slot.clear();
        assert_eq!(slot.load(), None);
    }
}
