use std::ops::Range;

use atomic::{Atomic, Ordering};
use bytemuck::NoUninit;

use crate::util::constants::*;
use crate::util::conversions;
use crate::util::memory;
use crate::util::{Address, ObjectReference};

/// State of one card. The numeric values are load-bearing: a freshly mapped
/// (zeroed) table reads as all-clean.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, NoUninit, strum::Display, strum::EnumIter)]
pub enum CardState {
    /// No work is associated with the card.
    Clean = 0,
    /// A mutator wrote to the card since it was last scanned.
    Dirty = 1,
    /// A partial collection must scan the card, but its cross-region
    /// references are already accurately remembered.
    PgcMustScan = 2,
    /// A global mark phase must scan the card before its cycle can finish.
    GmpMustScan = 3,
    /// The card was scanned and found to hold cross-region references.
    Remembered = 4,
    /// Remembered, and additionally owed a scan by the in-progress global
    /// mark phase.
    RememberedAndGmpScan = 5,
}

impl CardState {
    /// Whether a partial collection's card scan would visit this card anyway,
    /// making an individually remembered entry for it redundant.
    pub fn is_dirty_for_partial_collect(self) -> bool {
        match self {
            CardState::Clean | CardState::GmpMustScan => false,
            CardState::Dirty
            | CardState::PgcMustScan
            | CardState::Remembered
            | CardState::RememberedAndGmpScan => true,
        }
    }
}

/// The card table: one byte of state per card of heap address space.
///
/// The mutator-facing dirty store is a relaxed atomic byte write. All other
/// transitions happen inside cleaning passes where regions are claimed
/// exclusively, so they need no stronger ordering either.
pub struct CardTable {
    table: Address,
    heap_start: Address,
    card_count: usize,
}

impl CardTable {
    pub fn new(heap_start: Address, heap_extent: usize) -> std::io::Result<CardTable> {
        debug_assert!(heap_start.is_aligned_to(BYTES_IN_CARD));
        debug_assert!(conversions::raw_is_aligned(heap_extent, BYTES_IN_CARD));
        let card_count = heap_extent >> LOG_BYTES_IN_CARD;
        let table =
            memory::dzmmap_anywhere(conversions::raw_align_up(card_count, BYTES_IN_PAGE))?;
        Ok(CardTable {
            table,
            heap_start,
            card_count,
        })
    }

    pub fn card_count(&self) -> usize {
        self.card_count
    }

    /// Index of the card covering `addr`.
    pub fn index_of(&self, addr: Address) -> usize {
        debug_assert!(addr >= self.heap_start);
        let index = (addr - self.heap_start) >> LOG_BYTES_IN_CARD;
        debug_assert!(index < self.card_count);
        index
    }

    /// Heap address of the first byte the card covers.
    pub fn address_of(&self, index: usize) -> Address {
        debug_assert!(index < self.card_count);
        self.heap_start + (index << LOG_BYTES_IN_CARD)
    }

    /// The card-aligned address used as a remembered-set entry for `object`.
    pub fn card_of_object(object: ObjectReference) -> Address {
        conversions::card_align_down(object.to_raw_address())
    }

    /// The heap range the card covers.
    pub fn range_of(&self, index: usize) -> Range<Address> {
        let start = self.address_of(index);
        start..start + BYTES_IN_CARD
    }

    /// Card indices covering the given heap range (a region, usually).
    pub fn indices_of(&self, range: Range<Address>) -> Range<usize> {
        debug_assert!(range.start.is_aligned_to(BYTES_IN_CARD));
        debug_assert!(range.end.is_aligned_to(BYTES_IN_CARD));
        self.index_of(range.start)..(range.end - self.heap_start) >> LOG_BYTES_IN_CARD
    }

    fn entry(&self, index: usize) -> &Atomic<CardState> {
        debug_assert!(index < self.card_count);
        unsafe { &*(self.table + index).to_ptr::<Atomic<CardState>>() }
    }

    pub fn state(&self, index: usize) -> CardState {
        self.entry(index).load(Ordering::Relaxed)
    }

    pub fn set_state(&self, index: usize, to: CardState) {
        self.entry(index).store(to, Ordering::Relaxed);
    }

    /// Write-barrier entry: mark the card holding `addr` dirty. Dirty
    /// overwrites every other state; a later cleaning or flush pass restores
    /// the remembered/GMP semantics the overwrite folded in.
    pub fn dirty_card_for(&self, addr: Address) {
        let entry = self.entry(self.index_of(addr));
        if entry.load(Ordering::Relaxed) != CardState::Dirty {
            entry.store(CardState::Dirty, Ordering::Relaxed);
        }
    }

    pub fn dirty_object_card(&self, object: ObjectReference) {
        self.dirty_card_for(object.to_raw_address());
    }

    /// Partial-collection flush of a card recorded in a collection-set
    /// region's remembered set, where the card itself lies outside the
    /// collection set. Folds the "this card references the collection set"
    /// fact into the table so the collection scans it; a concurrently active
    /// global mark phase keeps its must-scan claim.
    pub fn flush_card(&self, index: usize, gmp_active: bool) {
        let from = self.state(index);
        let to = match from {
            CardState::Dirty => {
                if gmp_active {
                    CardState::RememberedAndGmpScan
                } else {
                    CardState::Remembered
                }
            }
            CardState::GmpMustScan => CardState::RememberedAndGmpScan,
            _ => from,
        };
        if to != from {
            self.set_state(index, to);
        }
    }

    /// Direct reset of a card inside the collection set. The collection
    /// rebuilds remembered state for these regions from scratch, so the
    /// remembered bits drop; a global mark phase keeps its claim on cards it
    /// has not yet scanned.
    pub fn reset_collection_set_card(&self, index: usize, gmp_active: bool) {
        let from = self.state(index);
        let to = match from {
            CardState::PgcMustScan => CardState::Clean,
            CardState::Remembered => CardState::Clean,
            CardState::RememberedAndGmpScan => CardState::GmpMustScan,
            CardState::Dirty => {
                if gmp_active {
                    CardState::GmpMustScan
                } else {
                    CardState::Clean
                }
            }
            CardState::Clean | CardState::GmpMustScan => from,
        };
        if to != from {
            self.set_state(index, to);
        }
    }

    /// Reset the cards covering `range` to clean. Used when a region is
    /// committed over possibly recycled address space.
    pub fn clear_range(&self, range: Range<Address>) {
        let indices = self.indices_of(range);
        memory::zero(self.table + indices.start, indices.end - indices.start);
    }
}

impl Drop for CardTable {
    fn drop(&mut self) {
        let len = conversions::raw_align_up(self.card_count, BYTES_IN_PAGE);
        memory::munmap(self.table, len).unwrap_or_else(|e| {
            warn!("Failed to unmap card table: {}", e);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    fn table_over(extent: usize) -> (Address, CardTable) {
        let heap = memory::dzmmap_anywhere(extent).unwrap();
        let table = CardTable::new(heap, extent).unwrap();
        (heap, table)
    }

    #[test]
    fn starts_clean_and_dirties() {
        let (heap, table) = table_over(1 << 16);
        assert!(CardState::iter().count() == 6);
        for i in 0..table.card_count() {
            assert_eq!(table.state(i), CardState::Clean);
        }
        table.dirty_card_for(heap + 700usize);
        assert_eq!(table.state(0), CardState::Clean);
        assert_eq!(table.state(1), CardState::Dirty);
        memory::munmap(heap, 1 << 16).unwrap();
    }

    #[test]
    fn index_address_round_trip() {
        let (heap, table) = table_over(1 << 16);
        for i in [0usize, 1, 77, table.card_count() - 1] {
            assert_eq!(table.index_of(table.address_of(i)), i);
        }
        assert_eq!(table.indices_of(heap..heap + (4 << LOG_BYTES_IN_CARD)), 0..4);
        memory::munmap(heap, 1 << 16).unwrap();
    }

    macro_rules! transition_tests {
        ($method:ident, $gmp:expr, $($name:ident: $from:ident => $to:ident;)*) => {
            $(paste::paste! {
                #[test]
                fn [<$method _ $name>]() {
                    let (heap, table) = table_over(1 << 16);
                    table.set_state(3, CardState::$from);
                    table.$method(3, $gmp);
                    assert_eq!(table.state(3), CardState::$to);
                    memory::munmap(heap, 1 << 16).unwrap();
                }
            })*
        };
    }

    transition_tests! { flush_card, false,
        dirty: Dirty => Remembered;
        gmp_must_scan: GmpMustScan => RememberedAndGmpScan;
        clean: Clean => Clean;
        remembered: Remembered => Remembered;
        remembered_and_gmp: RememberedAndGmpScan => RememberedAndGmpScan;
        pgc_must_scan: PgcMustScan => PgcMustScan;
    }

    transition_tests! { flush_card, true,
        dirty_while_gmp: Dirty => RememberedAndGmpScan;
        gmp_must_scan_while_gmp: GmpMustScan => RememberedAndGmpScan;
    }

    transition_tests! { reset_collection_set_card, false,
        pgc_must_scan: PgcMustScan => Clean;
        remembered: Remembered => Clean;
        remembered_and_gmp: RememberedAndGmpScan => GmpMustScan;
        dirty: Dirty => Clean;
        gmp_must_scan: GmpMustScan => GmpMustScan;
        clean: Clean => Clean;
    }

    transition_tests! { reset_collection_set_card, true,
        dirty_while_gmp: Dirty => GmpMustScan;
    }
}
