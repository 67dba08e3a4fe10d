//! A synthetic VM binding for tests and benchmarks.
//!
//! Toy objects are self-describing: a fixed header at the object address
//! encodes the kind, the slot count and the reference state, and the
//! reference slots follow the header in memory.  No type registry is needed,
//! so any number of heaps can coexist in one process.
//!
//! Roots and the cleared-reference queue are process-global, therefore tests
//! that use them must run under [`super::serial_test`].

use std::sync::Mutex;

use crate::util::constants::BYTES_IN_ADDRESS;
use crate::util::{Address, ObjectReference};
use crate::vm::{
    ObjectKind, ObjectModel, ReferenceKind, ReferenceState, RootsWorkFactory, Scanning,
    SimpleSlot, SlotVisitor, VMBinding,
};

const TAG_SCALAR: usize = 0;
const TAG_ARRAY: usize = 1;
const TAG_LEAF: usize = 2;
const TAG_SOFT: usize = 3;
const TAG_WEAK: usize = 4;
const TAG_PHANTOM: usize = 5;

const STATE_ACTIVE: usize = 0;
const STATE_CLEARED: usize = 1;
const STATE_ENQUEUED: usize = 2;

/// The header present at the start of every toy object.
#[repr(C)]
struct Header {
    tag: usize,
    /// Reference slots for scalar and array objects, payload words for leaf
    /// objects.  Reference objects count their ordinary slots here; the
    /// referent slot is extra.
    len: usize,
    state: usize,
    age: usize,
    /// Nonzero if the reference was registered with a queue.
    queue: usize,
}

pub const HEADER_BYTES: usize = std::mem::size_of::<Header>();

fn header<'a>(object: ObjectReference) -> &'a Header {
    unsafe { &*object.to_raw_address().to_ptr::<Header>() }
}

#[allow(clippy::mut_from_ref)]
fn header_mut<'a>(object: ObjectReference) -> &'a mut Header {
    unsafe { &mut *object.to_raw_address().to_mut_ptr::<Header>() }
}

fn is_reference(tag: usize) -> bool {
    matches!(tag, TAG_SOFT | TAG_WEAK | TAG_PHANTOM)
}

/// Address of the first ordinary slot.  For reference objects this skips the
/// referent slot.
pub fn slots_base(object: ObjectReference) -> Address {
    let referent_words = usize::from(is_reference(header(object).tag));
    object.to_raw_address() + HEADER_BYTES + referent_words * BYTES_IN_ADDRESS
}

/// The `index`-th ordinary slot of a scalar, array or reference object.
pub fn slot_of(object: ObjectReference, index: usize) -> SimpleSlot {
    debug_assert!(index < header(object).len);
    SimpleSlot::from_address(slots_base(object) + index * BYTES_IN_ADDRESS)
}

/// Lay out a header at `addr`.  Used by the heap fixtures.
pub(super) fn write_header(
    addr: Address,
    tag: usize,
    len: usize,
    with_queue: bool,
) -> ObjectReference {
    unsafe {
        addr.store(Header {
            tag,
            len,
            state: STATE_ACTIVE,
            age: 0,
            queue: usize::from(with_queue),
        });
        ObjectReference::from_raw_address_unchecked(addr)
    }
}

pub(super) fn tag_for(kind: ReferenceKind) -> usize {
    match kind {
        ReferenceKind::Soft => TAG_SOFT,
        ReferenceKind::Weak => TAG_WEAK,
        ReferenceKind::Phantom => TAG_PHANTOM,
    }
}

/// Total object footprint in bytes.
pub fn footprint(tag_is_reference: bool, len: usize) -> usize {
    HEADER_BYTES + (len + usize::from(tag_is_reference)) * BYTES_IN_ADDRESS
}

lazy_static! {
    static ref ROOTS: Mutex<Vec<Address>> = Mutex::new(Vec::new());
    static ref ENQUEUED: Mutex<Vec<ObjectReference>> = Mutex::new(Vec::new());
}

/// Register the address of a root slot.
pub fn add_root(slot_addr: Address) {
    ROOTS.lock().unwrap().push(slot_addr);
}

/// Drain the references handed to `enqueue_cleared_references` so far.
pub fn take_enqueued() -> Vec<ObjectReference> {
    std::mem::take(&mut *ENQUEUED.lock().unwrap())
}

/// Clear the global root list and reference queue.  Call at the start of
/// every test that uses them.
pub fn reset() {
    ROOTS.lock().unwrap().clear();
    ENQUEUED.lock().unwrap().clear();
}

#[derive(Default)]
pub struct ToyVM;

impl VMBinding for ToyVM {
    type VMObjectModel = ToyObjectModel;
    type VMScanning = ToyScanning;
    type VMSlot = SimpleSlot;
}

pub struct ToyObjectModel;

impl ObjectModel<ToyVM> for ToyObjectModel {
    fn object_size(object: ObjectReference) -> usize {
        let h = header(object);
        footprint(is_reference(h.tag), h.len)
    }

    fn object_kind(object: ObjectReference) -> ObjectKind {
        match header(object).tag {
            TAG_SCALAR => ObjectKind::Scalar,
            TAG_ARRAY => ObjectKind::ObjectArray,
            TAG_LEAF => ObjectKind::Leaf,
            TAG_SOFT => ObjectKind::Reference(ReferenceKind::Soft),
            TAG_WEAK => ObjectKind::Reference(ReferenceKind::Weak),
            TAG_PHANTOM => ObjectKind::Reference(ReferenceKind::Phantom),
            tag => unreachable!("corrupt toy object header: tag {}", tag),
        }
    }

    fn array_length(object: ObjectReference) -> usize {
        debug_assert_eq!(header(object).tag, TAG_ARRAY);
        header(object).len
    }

    fn referent_slot(object: ObjectReference) -> SimpleSlot {
        debug_assert!(is_reference(header(object).tag));
        SimpleSlot::from_address(object.to_raw_address() + HEADER_BYTES)
    }

    fn reference_state(object: ObjectReference) -> ReferenceState {
        match header(object).state {
            STATE_ACTIVE => ReferenceState::Active,
            STATE_CLEARED => ReferenceState::Cleared,
            STATE_ENQUEUED => ReferenceState::Enqueued,
            state => unreachable!("corrupt toy reference state: {}", state),
        }
    }

    fn set_reference_state(object: ObjectReference, state: ReferenceState) {
        header_mut(object).state = match state {
            ReferenceState::Active => STATE_ACTIVE,
            ReferenceState::Cleared => STATE_CLEARED,
            ReferenceState::Enqueued => STATE_ENQUEUED,
        };
    }

    fn soft_reference_age(object: ObjectReference) -> usize {
        header(object).age
    }

    fn set_soft_reference_age(object: ObjectReference, age: usize) {
        header_mut(object).age = age;
    }

    fn has_reference_queue(object: ObjectReference) -> bool {
        header(object).queue != 0
    }
}

pub struct ToyScanning;

impl Scanning<ToyVM> for ToyScanning {
    fn scan_object<SV: SlotVisitor<SimpleSlot>>(object: ObjectReference, slot_visitor: &mut SV) {
        let h = header(object);
        debug_assert!(h.tag != TAG_ARRAY && h.tag != TAG_LEAF);
        let base = slots_base(object);
        for i in 0..h.len {
            slot_visitor.visit_slot(SimpleSlot::from_address(base + i * BYTES_IN_ADDRESS));
        }
    }

    fn scan_array_range<SV: SlotVisitor<SimpleSlot>>(
        object: ObjectReference,
        range: std::ops::Range<usize>,
        slot_visitor: &mut SV,
    ) {
        let h = header(object);
        debug_assert_eq!(h.tag, TAG_ARRAY);
        debug_assert!(range.end <= h.len);
        let base = slots_base(object);
        for i in range {
            slot_visitor.visit_slot(SimpleSlot::from_address(base + i * BYTES_IN_ADDRESS));
        }
    }

    fn scan_roots(mut factory: impl RootsWorkFactory<SimpleSlot>) {
        let roots = ROOTS.lock().unwrap();
        factory.create_process_roots_work(
            roots.iter().map(|a| SimpleSlot::from_address(*a)).collect(),
        );
    }

    fn enqueue_cleared_references(references: &[ObjectReference]) {
        ENQUEUED.lock().unwrap().extend_from_slice(references);
    }
}
