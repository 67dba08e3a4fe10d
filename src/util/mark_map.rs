use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::util::constants::*;
use crate::util::conversions;
use crate::util::memory;
use crate::util::{Address, ObjectReference};

/// The mark bitmap: one bit per minimum-object-alignment slot across the heap
/// range. A reference is live in the current trace iff its bit is set. All
/// updates go through atomic fetch-or, so the first setter wins and exactly
/// one thread enqueues a given object for scanning.
pub struct MarkMap {
    map: Address,
    heap_start: Address,
    words: usize,
}

/// Number of heap bytes covered by one mark map word.
pub const BYTES_PER_MAP_WORD: usize = MIN_OBJECT_ALIGNMENT * BITS_IN_WORD;

impl MarkMap {
    pub fn new(heap_start: Address, heap_extent: usize) -> std::io::Result<MarkMap> {
        debug_assert!(heap_start.is_aligned_to(BYTES_PER_MAP_WORD));
        debug_assert!(conversions::raw_is_aligned(heap_extent, BYTES_PER_MAP_WORD));
        let words = heap_extent / BYTES_PER_MAP_WORD;
        let map = memory::dzmmap_anywhere(conversions::raw_align_up(
            words * BYTES_IN_WORD,
            BYTES_IN_PAGE,
        ))?;
        Ok(MarkMap {
            map,
            heap_start,
            words,
        })
    }

    fn word_index(&self, addr: Address) -> usize {
        (addr - self.heap_start) / BYTES_PER_MAP_WORD
    }

    fn word(&self, index: usize) -> &AtomicUsize {
        debug_assert!(index < self.words);
        unsafe { &*(self.map + (index << LOG_BYTES_IN_WORD)).to_ptr::<AtomicUsize>() }
    }

    fn bit_mask(addr: Address) -> usize {
        let slot = addr >> (LOG_MIN_OBJECT_ALIGNMENT as usize);
        1 << (slot & (BITS_IN_WORD - 1))
    }

    /// Query the mark bit.
    pub fn is_marked(&self, object: ObjectReference) -> bool {
        let addr = object.to_raw_address();
        self.word(self.word_index(addr)).load(Ordering::Relaxed) & Self::bit_mask(addr) != 0
    }

    /// Atomically set the mark bit. Returns true if this call set it (the
    /// object was unmarked before).
    pub fn mark_atomic(&self, object: ObjectReference) -> bool {
        let addr = object.to_raw_address();
        let mask = Self::bit_mask(addr);
        let prev = self
            .word(self.word_index(addr))
            .fetch_or(mask, Ordering::SeqCst);
        prev & mask == 0
    }

    /// Zero the map for the given heap range. The range must be aligned to
    /// map-word coverage (region bounds always are).
    pub fn clear_range(&self, range: Range<Address>) {
        debug_assert!(range.start.is_aligned_to(BYTES_PER_MAP_WORD));
        debug_assert!(range.end.is_aligned_to(BYTES_PER_MAP_WORD));
        let start_word = self.word_index(range.start);
        let end_word = self.word_index(range.end);
        memory::zero(
            self.map + (start_word << LOG_BYTES_IN_WORD),
            (end_word - start_word) << LOG_BYTES_IN_WORD,
        );
    }

    /// Iterate the marked objects whose addresses fall in the given heap
    /// range, in ascending address order. The range must be aligned to
    /// map-word coverage.
    pub fn marked_objects(&self, range: Range<Address>) -> MarkedObjectIterator<'_> {
        debug_assert!(range.start.is_aligned_to(BYTES_PER_MAP_WORD));
        debug_assert!(range.end.is_aligned_to(BYTES_PER_MAP_WORD));
        let start_word = self.word_index(range.start);
        let end_word = self.word_index(range.end);
        MarkedObjectIterator {
            map: self,
            base: range.start,
            cursor: start_word,
            end: end_word,
            bits: 0,
            word_base: range.start,
        }
    }
}

impl Drop for MarkMap {
    fn drop(&mut self) {
        let len = conversions::raw_align_up(self.words * BYTES_IN_WORD, BYTES_IN_PAGE);
        memory::munmap(self.map, len).unwrap_or_else(|e| {
            warn!("Failed to unmap mark map: {}", e);
        });
    }
}

/// Walks set bits of a mark map range, yielding the object each bit covers.
/// Used by card cleaning (rescan marked objects on a card) and overflow
/// recovery (re-derive work for a region from the map instead of the queue).
pub struct MarkedObjectIterator<'a> {
    map: &'a MarkMap,
    base: Address,
    cursor: usize,
    end: usize,
    bits: usize,
    word_base: Address,
}

impl Iterator for MarkedObjectIterator<'_> {
    type Item = ObjectReference;

    fn next(&mut self) -> Option<ObjectReference> {
        while self.bits == 0 {
            if self.cursor >= self.end {
                return None;
            }
            self.bits = self.map.word(self.cursor).load(Ordering::Relaxed);
            self.word_base = self.base
                + (self.cursor - self.map.word_index(self.base)) * BYTES_PER_MAP_WORD;
            self.cursor += 1;
        }
        let bit = self.bits.trailing_zeros() as usize;
        self.bits &= self.bits - 1;
        let addr = self.word_base + (bit << (LOG_MIN_OBJECT_ALIGNMENT as usize));
        // The bit was set for an aligned, non-null object address.
        Some(unsafe { ObjectReference::from_raw_address_unchecked(addr) })
    }
}
