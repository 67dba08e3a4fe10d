// This module is compiled into the library whenever the test_binding feature
// is on, so a build without tests sees some of these helpers unused. We simply
// allow dead code in this module.
#![allow(dead_code)]

use std::ops::Range;

use crate::util::constants::BYTES_IN_ADDRESS;
use crate::util::memory;
use crate::util::test_util::toy_vm;
use crate::util::{Address, ObjectReference};
use crate::vm::{ReferenceKind, Slot};

/// An anonymous mapping released on drop.  Tests and benchmarks build toy
/// heaps inside one of these.
pub struct MappedHeap {
    pub start: Address,
    pub extent: usize,
}

impl MappedHeap {
    pub fn new(extent: usize) -> MappedHeap {
        let start = memory::dzmmap_anywhere(extent).unwrap();
        MappedHeap { start, extent }
    }

    pub fn range(&self) -> Range<Address> {
        self.start..self.start + self.extent
    }
}

impl Drop for MappedHeap {
    fn drop(&mut self) {
        memory::munmap(self.start, self.extent).unwrap();
    }
}

/// Bump-allocates toy objects into a mapped range.
pub struct ToyHeapWriter {
    cursor: Address,
    limit: Address,
}

impl ToyHeapWriter {
    pub fn new(range: Range<Address>) -> ToyHeapWriter {
        ToyHeapWriter {
            cursor: range.start,
            limit: range.end,
        }
    }

    /// Move the cursor to `addr`.  Tests use this to place objects in a
    /// specific region or card; keeping new objects clear of old ones is the
    /// caller's business.
    pub fn seek(&mut self, addr: Address) {
        assert!(addr < self.limit);
        self.cursor = addr;
    }

    fn bump(&mut self, bytes: usize) -> Address {
        let addr = self.cursor;
        self.cursor += bytes;
        assert!(self.cursor <= self.limit, "toy heap exhausted");
        addr
    }

    /// A scalar object whose slots hold the given targets.
    pub fn scalar(&mut self, targets: &[Option<ObjectReference>]) -> ObjectReference {
        let addr = self.bump(toy_vm::footprint(false, targets.len()));
        let object = toy_vm::write_header(addr, 0, targets.len(), false);
        for (i, target) in targets.iter().enumerate() {
            if let Some(target) = target {
                toy_vm::slot_of(object, i).store(*target);
            }
        }
        object
    }

    /// An object array with `len` null slots.  Fill them with `set_slot`.
    pub fn array(&mut self, len: usize) -> ObjectReference {
        let addr = self.bump(toy_vm::footprint(false, len));
        toy_vm::write_header(addr, 1, len, false)
    }

    /// An object with no reference slots and `payload_words` words of data.
    pub fn leaf(&mut self, payload_words: usize) -> ObjectReference {
        let addr = self.bump(toy_vm::footprint(false, payload_words));
        toy_vm::write_header(addr, 2, payload_words, false)
    }

    /// A reference object of the given strength.
    pub fn reference(
        &mut self,
        kind: ReferenceKind,
        referent: Option<ObjectReference>,
        with_queue: bool,
    ) -> ObjectReference {
        let addr = self.bump(toy_vm::footprint(true, 0));
        let object = toy_vm::write_header(addr, toy_vm::tag_for(kind), 0, with_queue);
        if let Some(referent) = referent {
            crate::vm::SimpleSlot::from_address(object.to_raw_address() + toy_vm::HEADER_BYTES)
                .store(referent);
        }
        object
    }

    pub fn set_slot(&self, object: ObjectReference, index: usize, target: ObjectReference) {
        toy_vm::slot_of(object, index).store(target);
    }

    /// Address of the `index`-th slot, for registering roots.
    pub fn slot_addr(&self, object: ObjectReference, index: usize) -> Address {
        toy_vm::slot_of(object, index).as_address()
    }
}
