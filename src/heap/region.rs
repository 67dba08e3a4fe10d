use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};

use enum_map::EnumMap;

use crate::remset::RememberedSetCardList;
use crate::util::{Address, ObjectReference};
use crate::vm::ReferenceKind;

/// Which work-packet overflow bit a cycle uses. Partial collections and
/// global traces recover overflow independently, so a region carries one bit
/// for each.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OverflowKind {
    Partial,
    Global,
}

/// Descriptor of one fixed-size heap region.
///
/// All descriptor state is either atomic or internally locked; descriptors
/// are shared by reference across GC workers for the lifetime of the
/// [`super::RegionManager`] that owns them.
pub struct HeapRegion {
    index: usize,
    start: Address,
    extent: usize,
    committed: AtomicBool,
    contains_objects: AtomicBool,
    /// Collection-set membership for the current partial collection.
    should_mark: AtomicBool,
    overflow_partial: AtomicBool,
    overflow_global: AtomicBool,
    /// True while the mark map range of this region is known to be all
    /// zero, letting mark init skip the clear.
    mark_map_cleared: AtomicBool,
    rscl: RememberedSetCardList,
    /// Reference objects of each strength discovered while tracing this
    /// region, consumed by the clearable phases at the end of marking.
    discovered: EnumMap<ReferenceKind, spin::Mutex<Vec<ObjectReference>>>,
}

impl HeapRegion {
    pub(super) fn new(index: usize, start: Address, extent: usize, workers: usize) -> HeapRegion {
        HeapRegion {
            index,
            start,
            extent,
            committed: AtomicBool::new(false),
            contains_objects: AtomicBool::new(false),
            should_mark: AtomicBool::new(false),
            overflow_partial: AtomicBool::new(false),
            overflow_global: AtomicBool::new(false),
            mark_map_cleared: AtomicBool::new(false),
            rscl: RememberedSetCardList::new(workers),
            discovered: EnumMap::default(),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn start(&self) -> Address {
        self.start
    }

    pub fn end(&self) -> Address {
        self.start + self.extent
    }

    pub fn extent(&self) -> usize {
        self.extent
    }

    pub fn range(&self) -> Range<Address> {
        self.start..self.end()
    }

    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.start && addr < self.end()
    }

    pub fn remembered_set(&self) -> &RememberedSetCardList {
        &self.rscl
    }

    pub fn is_committed(&self) -> bool {
        self.committed.load(Ordering::Relaxed)
    }

    pub fn set_committed(&self, committed: bool) {
        self.committed.store(committed, Ordering::Relaxed);
        self.contains_objects.store(committed, Ordering::Relaxed);
    }

    pub fn contains_objects(&self) -> bool {
        self.contains_objects.load(Ordering::Relaxed)
    }

    /// Cleared when a sweep leaves the region with no live objects; such a
    /// region stays committed but card passes skip it.
    pub fn set_contains_objects(&self, contains_objects: bool) {
        self.contains_objects.store(contains_objects, Ordering::Relaxed);
    }

    pub fn should_mark(&self) -> bool {
        self.should_mark.load(Ordering::Relaxed)
    }

    /// Set or clear collection-set membership for the next partial
    /// collection.
    pub fn set_should_mark(&self, should_mark: bool) {
        self.should_mark.store(should_mark, Ordering::Relaxed);
    }

    fn overflow_bit(&self, kind: OverflowKind) -> &AtomicBool {
        match kind {
            OverflowKind::Partial => &self.overflow_partial,
            OverflowKind::Global => &self.overflow_global,
        }
    }

    /// Raise the overflow bit. Returns true if this call raised it.
    pub fn set_overflow_mark(&self, kind: OverflowKind) -> bool {
        !self.overflow_bit(kind).swap(true, Ordering::SeqCst)
    }

    /// Lower the overflow bit. Returns true if it was raised.
    pub fn clear_overflow_mark(&self, kind: OverflowKind) -> bool {
        self.overflow_bit(kind).swap(false, Ordering::SeqCst)
    }

    pub fn is_overflow_marked(&self, kind: OverflowKind) -> bool {
        self.overflow_bit(kind).load(Ordering::SeqCst)
    }

    /// Consume the "mark map already clear" latch. Returns true if the
    /// caller may skip clearing this region's map range.
    pub fn take_mark_map_cleared(&self) -> bool {
        self.mark_map_cleared.swap(false, Ordering::Relaxed)
    }

    pub fn set_mark_map_cleared(&self) {
        self.mark_map_cleared.store(true, Ordering::Relaxed);
    }

    /// Record a reference object found while tracing, for the clearable
    /// phases.
    pub fn add_discovered_reference(&self, kind: ReferenceKind, object: ObjectReference) {
        self.discovered[kind].lock().push(object);
    }

    /// Take this region's discovered list for one strength, leaving it
    /// empty. The caller owns the returned list.
    pub fn take_discovered(&self, kind: ReferenceKind) -> Vec<ObjectReference> {
        std::mem::take(&mut *self.discovered[kind].lock())
    }
}
