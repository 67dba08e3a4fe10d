//! A single worker's append log within one region's remembered-set card list.
//!
//! A bucket chains card buffers newest-first through the pool's index links.
//! Only the newest buffer is partially filled; the write cursor never moves
//! backwards except through [`RememberedSetCardBucket::compact`]. During
//! marking a bucket is written by its owning worker alone, so entries are
//! plain relaxed atomics. Deletion and compaction run in exclusive phases.

use std::sync::atomic::{AtomicUsize, Ordering};

use super::pool::{BufferCache, CardBufferPool, NIL_BLOCK};
use crate::util::constants::CARD_BUFFER_SIZE;
use crate::util::Address;

#[derive(Debug, PartialEq, Eq)]
pub(super) enum AddResult {
    Added,
    /// The card equals the most recently appended entry.
    Duplicate,
    /// No room in the newest buffer; the caller must acquire one.
    NeedsBuffer,
}

pub(super) struct RememberedSetCardBucket {
    /// Newest block in the chain, `NIL_BLOCK` when the bucket holds nothing.
    current: AtomicUsize,
    /// Write cursor within the newest block.
    next_entry: AtomicUsize,
    buffer_count: AtomicUsize,
}

impl RememberedSetCardBucket {
    pub fn new() -> Self {
        RememberedSetCardBucket {
            current: AtomicUsize::new(NIL_BLOCK),
            next_entry: AtomicUsize::new(0),
            buffer_count: AtomicUsize::new(0),
        }
    }

    pub fn buffer_count(&self) -> usize {
        self.buffer_count.load(Ordering::Relaxed)
    }

    /// Card count assuming no entries were deleted since the last compact:
    /// every buffer but the newest is full.
    pub fn size(&self) -> usize {
        let current = self.current.load(Ordering::Relaxed);
        if current == NIL_BLOCK {
            return 0;
        }
        (self.buffer_count() - 1) * CARD_BUFFER_SIZE + self.next_entry.load(Ordering::Relaxed)
    }

    pub fn add(&self, pool: &CardBufferPool, card: Address) -> AddResult {
        debug_assert!(!card.is_zero());
        let current = self.current.load(Ordering::Relaxed);
        let cursor = self.next_entry.load(Ordering::Relaxed);

        if current != NIL_BLOCK && cursor > 0 {
            let last = pool.card_slot(current, cursor - 1).load(Ordering::Relaxed);
            if last == card.as_usize() {
                return AddResult::Duplicate;
            }
        }
        if current == NIL_BLOCK || cursor == CARD_BUFFER_SIZE {
            return AddResult::NeedsBuffer;
        }

        pool.card_slot(current, cursor)
            .store(card.as_usize(), Ordering::Relaxed);
        self.next_entry.store(cursor + 1, Ordering::Relaxed);
        AddResult::Added
    }

    /// Make `block` the newest buffer. The caller has taken it from the pool.
    pub fn install_buffer(&self, pool: &CardBufferPool, block: usize) {
        pool.set_next(block, self.current.load(Ordering::Relaxed));
        self.current.store(block, Ordering::Relaxed);
        self.next_entry.store(0, Ordering::Relaxed);
        self.buffer_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Detach the whole chain, leaving the bucket empty. Returns the chain
    /// head and the number of buffers in it.
    pub fn take_chain(&self) -> (usize, usize) {
        let head = self.current.swap(NIL_BLOCK, Ordering::Relaxed);
        self.next_entry.store(0, Ordering::Relaxed);
        let count = self.buffer_count.swap(0, Ordering::Relaxed);
        (head, count)
    }

    /// Blocks in insertion order, oldest first.
    fn blocks(&self, pool: &CardBufferPool) -> Vec<usize> {
        let mut blocks = Vec::with_capacity(self.buffer_count());
        let mut block = self.current.load(Ordering::Relaxed);
        while block != NIL_BLOCK {
            blocks.push(block);
            block = pool.next_of(block);
        }
        blocks.reverse();
        blocks
    }

    fn entry_limit(&self, position: usize, block_total: usize) -> usize {
        if position + 1 == block_total {
            self.next_entry.load(Ordering::Relaxed)
        } else {
            CARD_BUFFER_SIZE
        }
    }

    pub fn is_remembered(&self, pool: &CardBufferPool, card: Address) -> bool {
        let mut block = self.current.load(Ordering::Relaxed);
        let mut limit = self.next_entry.load(Ordering::Relaxed);
        while block != NIL_BLOCK {
            for entry in 0..limit {
                if pool.card_slot(block, entry).load(Ordering::Relaxed) == card.as_usize() {
                    return true;
                }
            }
            block = pool.next_of(block);
            limit = CARD_BUFFER_SIZE;
        }
        false
    }

    /// Visit every live card, oldest first.
    pub fn for_each(&self, pool: &CardBufferPool, f: &mut impl FnMut(Address)) {
        let blocks = self.blocks(pool);
        for (position, &block) in blocks.iter().enumerate() {
            for entry in 0..self.entry_limit(position, blocks.len()) {
                let raw = pool.card_slot(block, entry).load(Ordering::Relaxed);
                if raw != 0 {
                    f(unsafe { Address::from_usize(raw) });
                }
            }
        }
    }

    /// Delete every live card the predicate rejects. Returns the number of
    /// deletions; the caller is expected to compact afterwards.
    pub fn retain(&self, pool: &CardBufferPool, f: &mut impl FnMut(Address) -> bool) -> usize {
        let mut removed = 0;
        let blocks = self.blocks(pool);
        for (position, &block) in blocks.iter().enumerate() {
            for entry in 0..self.entry_limit(position, blocks.len()) {
                let slot = pool.card_slot(block, entry);
                let raw = slot.load(Ordering::Relaxed);
                if raw != 0 && !f(unsafe { Address::from_usize(raw) }) {
                    slot.store(0, Ordering::Relaxed);
                    removed += 1;
                }
            }
        }
        removed
    }

    /// Squeeze deleted entries out, shifting survivors left across buffer
    /// boundaries, and release buffers that end up empty. Returns the number
    /// of buffers released.
    pub fn compact(&self, pool: &CardBufferPool, cache: &mut BufferCache) -> usize {
        let blocks = self.blocks(pool);
        if blocks.is_empty() {
            return 0;
        }

        let mut write_block = 0;
        let mut write_entry = 0;
        for (position, &block) in blocks.iter().enumerate() {
            for entry in 0..self.entry_limit(position, blocks.len()) {
                let raw = pool.card_slot(block, entry).load(Ordering::Relaxed);
                if raw == 0 {
                    continue;
                }
                if write_block != position || write_entry != entry {
                    pool.card_slot(blocks[write_block], write_entry)
                        .store(raw, Ordering::Relaxed);
                }
                write_entry += 1;
                if write_entry == CARD_BUFFER_SIZE {
                    write_block += 1;
                    write_entry = 0;
                }
            }
        }

        let survivors = if write_entry == 0 {
            write_block
        } else {
            write_block + 1
        };
        let released = blocks.len() - survivors;

        if survivors == 0 {
            self.current.store(NIL_BLOCK, Ordering::Relaxed);
            self.next_entry.store(0, Ordering::Relaxed);
        } else {
            if released > 0 {
                // The released buffers are the newest-first prefix of the
                // chain, already linked; terminate it before the newest
                // survivor.
                pool.set_next(blocks[survivors], NIL_BLOCK);
            }
            self.current.store(blocks[survivors - 1], Ordering::Relaxed);
            let cursor = if write_entry == 0 {
                CARD_BUFFER_SIZE
            } else {
                write_entry
            };
            self.next_entry.store(cursor, Ordering::Relaxed);
        }
        self.buffer_count.store(survivors, Ordering::Relaxed);

        if released > 0 {
            // blocks.last() is the old newest buffer, the head of the
            // released prefix.
            pool.release_chain(cache, blocks[blocks.len() - 1]);
        }
        released
    }
}
