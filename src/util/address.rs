use bytemuck::NoUninit;

use std::fmt;
use std::num::NonZeroUsize;
use std::ops::*;

use crate::util::constants::MIN_OBJECT_ALIGNMENT;

/// A size in bytes.
pub type ByteSize = usize;

/// An arbitrary heap address. `Address` keeps address arithmetic explicit
/// and zero-cost while confining the actually dangerous operations (raw
/// loads and stores) behind `unsafe`. The split between a free-form address
/// type and a restricted object reference type follows the VEE09 paper
/// High-level Low-level Programming and JikesRVM.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, Hash, PartialOrd, Ord, PartialEq, NoUninit)]
pub struct Address(usize);

impl Add<ByteSize> for Address {
    type Output = Address;
    fn add(self, offset: ByteSize) -> Address {
        Address(self.0 + offset)
    }
}

impl AddAssign<ByteSize> for Address {
    fn add_assign(&mut self, offset: ByteSize) {
        self.0 += offset;
    }
}

/// Distance between two addresses. The left operand must be the higher one.
impl Sub<Address> for Address {
    type Output = ByteSize;
    fn sub(self, other: Address) -> ByteSize {
        debug_assert!(
            self.0 >= other.0,
            "for (addr_a - addr_b), a({}) needs to be larger than b({})",
            self,
            other
        );
        self.0 - other.0
    }
}

/// Address ^ Address. Two addresses lie in the same naturally-aligned
/// power-of-two region iff their xor is below the region size.
impl BitXor<Address> for Address {
    type Output = usize;
    fn bitxor(self, other: Address) -> usize {
        self.0 ^ other.0
    }
}

/// Address >> shift, for deriving table indices.
impl Shr<usize> for Address {
    type Output = usize;
    fn shr(self, shift: usize) -> usize {
        self.0 >> shift
    }
}

impl Address {
    /// The lowest possible address.
    pub const ZERO: Self = Address(0);

    /// The address of the first byte `ptr` points to.
    pub fn from_ptr<T>(ptr: *const T) -> Address {
        Address(ptr as usize)
    }

    /// The address of the first byte `ptr` points to.
    pub fn from_mut_ptr<T>(ptr: *mut T) -> Address {
        Address(ptr as usize)
    }

    /// Wrap a raw integer as an address.
    /// # Safety
    /// Nothing checks that the value is a meaningful address; the caller
    /// owns every later dereference.
    pub const unsafe fn from_usize(raw: usize) -> Address {
        Address(raw)
    }

    /// Read a `T` from this address.
    /// # Safety
    /// The address must be valid for a read of `T`.
    pub unsafe fn load<T: Copy>(self) -> T {
        *(self.0 as *mut T)
    }

    /// Write a `T` to this address.
    /// # Safety
    /// The address must be valid for a write of `T`.
    pub unsafe fn store<T>(self, value: T) {
        // ptr.write() rather than assignment: the destination holds
        // arbitrary bytes, not a valid T to drop.
        (self.0 as *mut T).write(value);
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Round up to the given power-of-two alignment.
    pub const fn align_up(self, align: ByteSize) -> Address {
        use crate::util::conversions;
        Address(conversions::raw_align_up(self.0, align))
    }

    /// Round down to the given power-of-two alignment.
    pub const fn align_down(self, align: ByteSize) -> Address {
        use crate::util::conversions;
        Address(conversions::raw_align_down(self.0, align))
    }

    pub const fn is_aligned_to(self, align: usize) -> bool {
        use crate::util::conversions;
        conversions::raw_is_aligned(self.0, align)
    }

    pub fn to_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    pub fn to_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// The address as a pointer-sized integer.
    pub const fn as_usize(self) -> usize {
        self.0
    }
}

/// Addresses print as hex with a 0x prefix.
impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// The address of an object. Unlike [`Address`] it permits no arithmetic;
/// holders can only compare it or convert it back to a raw address. The
/// distinction comes from the same VEE09 / JikesRVM lineage as `Address`.
///
/// An `ObjectReference` is never null and always aligned to the minimal
/// object alignment (the mark map keeps one bit per alignment slot, so an
/// unaligned reference could not be marked). Slots that may hold "no
/// object" use `Option<ObjectReference>`, which stays word-sized thanks to
/// the non-zero niche.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, Hash, PartialOrd, Ord, PartialEq, NoUninit)]
pub struct ObjectReference(NonZeroUsize);

impl ObjectReference {
    /// Minimal alignment of the raw address behind every reference.
    /// Constructors assert it in debug builds.
    pub const ALIGNMENT: usize = MIN_OBJECT_ALIGNMENT;

    pub fn to_raw_address(self) -> Address {
        Address(self.0.get())
    }

    /// Wrap an aligned raw address, or `None` if it is zero.
    pub fn from_raw_address(addr: Address) -> Option<ObjectReference> {
        debug_assert!(
            addr.is_aligned_to(Self::ALIGNMENT),
            "ObjectReference is required to be aligned to {}, but {} is not",
            Self::ALIGNMENT,
            addr
        );
        NonZeroUsize::new(addr.0).map(ObjectReference)
    }

    /// Like `from_raw_address`, but skips the null check.
    ///
    /// # Safety
    /// The `addr` must not be zero.
    pub unsafe fn from_raw_address_unchecked(addr: Address) -> ObjectReference {
        debug_assert!(!addr.is_zero());
        debug_assert!(
            addr.is_aligned_to(Self::ALIGNMENT),
            "ObjectReference is required to be aligned to {}, but {} is not",
            Self::ALIGNMENT,
            addr
        );
        ObjectReference(NonZeroUsize::new_unchecked(addr.0))
    }
}

/// References print as the hex address they wrap.
impl fmt::Display for ObjectReference {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Debug for ObjectReference {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
