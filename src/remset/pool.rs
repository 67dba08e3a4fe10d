//! The buffer pool backing every region's remembered-set card list.
//!
//! Control blocks for the whole heap are preallocated in one arena at startup
//! and addressed by index. The card payload a block describes is mapped per
//! region when that region is first committed, so an uncommitted region costs
//! two words per block and no payload. Free blocks circulate through a global
//! list guarded by a spin lock, fronted by a small per-worker cache.

use std::io::Result;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::util::constants::{BYTES_IN_ADDRESS, CARD_BUFFER_SIZE, MAX_LOCAL_BUFFER_CACHE};
use crate::util::memory;
use crate::util::Address;

/// Index link terminator for block chains.
pub(crate) const NIL_BLOCK: usize = usize::MAX;

/// Header for one card buffer: the payload address, and the link that threads
/// the block through whichever list currently holds it.
#[repr(C)]
struct BufferControlBlock {
    /// Base address of the block's card slots. Zero while the owning region's
    /// payload slab is unmapped.
    card_base: AtomicUsize,
    next: AtomicUsize,
}

struct FreeBlockList {
    head: usize,
    count: usize,
}

/// A worker's private stash of free buffers, bounded so one worker cannot
/// starve the rest of the pool.
pub struct BufferCache {
    head: usize,
    tail: usize,
    count: usize,
}

impl Default for BufferCache {
    fn default() -> Self {
        BufferCache {
            head: NIL_BLOCK,
            tail: NIL_BLOCK,
            count: 0,
        }
    }
}

impl BufferCache {
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn pop(&mut self, pool: &CardBufferPool) -> Option<usize> {
        if self.head == NIL_BLOCK {
            return None;
        }
        let block = self.head;
        self.head = pool.next_of(block);
        self.count -= 1;
        if self.head == NIL_BLOCK {
            debug_assert_eq!(self.count, 0);
            self.tail = NIL_BLOCK;
        }
        Some(block)
    }

    /// Push one block, failing when the cache is at capacity.
    fn push(&mut self, pool: &CardBufferPool, block: usize) -> bool {
        if self.count >= MAX_LOCAL_BUFFER_CACHE {
            return false;
        }
        pool.set_next(block, self.head);
        if self.head == NIL_BLOCK {
            self.tail = block;
        }
        self.head = block;
        self.count += 1;
        true
    }

    fn take(&mut self) -> (usize, usize, usize) {
        let taken = (self.head, self.tail, self.count);
        self.head = NIL_BLOCK;
        self.tail = NIL_BLOCK;
        self.count = 0;
        taken
    }
}

/// The global pool of card buffers, sized for the worst case of every region
/// holding a full remembered-set card list.
pub(crate) struct CardBufferPool {
    arena: Address,
    arena_bytes: usize,
    block_count: usize,
    blocks_per_region: usize,
    payload_bytes_per_region: usize,
    /// Payload slab base per region, zero while unmapped.
    region_slabs: Vec<AtomicUsize>,
    free: spin::Mutex<FreeBlockList>,
    /// Blocks whose payload is currently mapped.
    total_buffers: AtomicUsize,
}

impl CardBufferPool {
    pub fn new(region_count: usize, max_cards_per_list: usize) -> Result<Self> {
        let blocks_per_region = max_cards_per_list / CARD_BUFFER_SIZE;
        assert!(blocks_per_region > 0);
        let block_count = blocks_per_region * region_count;
        let arena_bytes = block_count * std::mem::size_of::<BufferControlBlock>();
        // The mapping arrives zeroed: every block starts unbacked and in no
        // list, which is exactly the initial state.
        let arena = memory::dzmmap_anywhere(arena_bytes)?;
        Ok(CardBufferPool {
            arena,
            arena_bytes,
            block_count,
            blocks_per_region,
            payload_bytes_per_region: blocks_per_region * CARD_BUFFER_SIZE * BYTES_IN_ADDRESS,
            region_slabs: (0..region_count).map(|_| AtomicUsize::new(0)).collect(),
            free: spin::Mutex::new(FreeBlockList {
                head: NIL_BLOCK,
                count: 0,
            }),
            total_buffers: AtomicUsize::new(0),
        })
    }

    fn block(&self, index: usize) -> &BufferControlBlock {
        debug_assert!(index < self.block_count);
        unsafe { &*self.arena.to_ptr::<BufferControlBlock>().add(index) }
    }

    pub(super) fn next_of(&self, block: usize) -> usize {
        self.block(block).next.load(Ordering::Relaxed)
    }

    pub(super) fn set_next(&self, block: usize, next: usize) {
        self.block(block).next.store(next, Ordering::Relaxed)
    }

    /// The region whose commit supplied this block's payload.
    pub(crate) fn owning_region(&self, block: usize) -> usize {
        block / self.blocks_per_region
    }

    pub(crate) fn blocks_per_region(&self) -> usize {
        self.blocks_per_region
    }

    /// One card slot of a backed buffer. Slots hold raw card addresses; zero
    /// marks a deleted entry.
    pub(super) fn card_slot(&self, block: usize, entry: usize) -> &AtomicUsize {
        debug_assert!(entry < CARD_BUFFER_SIZE);
        let base = self.block(block).card_base.load(Ordering::Relaxed);
        debug_assert!(base != 0, "card buffer {} used while unbacked", block);
        unsafe { &*(Address::from_usize(base) + entry * BYTES_IN_ADDRESS).to_ptr::<AtomicUsize>() }
    }

    /// Map the region's payload slab and hand its blocks to the free pool.
    /// A region whose slab is still mapped from an earlier commit keeps it.
    pub(crate) fn back_region(&self, region: usize) -> Result<()> {
        if self.region_slabs[region].load(Ordering::Relaxed) != 0 {
            return Ok(());
        }
        let slab = memory::dzmmap_anywhere(self.payload_bytes_per_region)?;
        self.region_slabs[region].store(slab.as_usize(), Ordering::Relaxed);

        let first = region * self.blocks_per_region;
        let last = first + self.blocks_per_region;
        for i in first..last {
            let base = slab + (i - first) * CARD_BUFFER_SIZE * BYTES_IN_ADDRESS;
            self.block(i).card_base.store(base.as_usize(), Ordering::Relaxed);
            self.block(i).next.store(i + 1, Ordering::Relaxed);
        }

        let mut free = self.free.lock();
        self.set_next(last - 1, free.head);
        free.head = first;
        free.count += self.blocks_per_region;
        self.total_buffers
            .fetch_add(self.blocks_per_region, Ordering::Relaxed);
        #[cfg(feature = "extreme_assertions")]
        self.verify_free_list(&free);
        Ok(())
    }

    /// Pop a free buffer, refilling the worker cache from the global list
    /// when it runs dry. None means the global pool is exhausted.
    pub(super) fn allocate(&self, cache: &mut BufferCache) -> Option<usize> {
        if let Some(block) = cache.pop(self) {
            return Some(block);
        }
        self.refill_cache(cache);
        cache.pop(self)
    }

    fn refill_cache(&self, cache: &mut BufferCache) {
        debug_assert!(cache.is_empty());
        let mut free = self.free.lock();
        while cache.count < MAX_LOCAL_BUFFER_CACHE && free.head != NIL_BLOCK {
            let block = free.head;
            free.head = self.next_of(block);
            free.count -= 1;
            let pushed = cache.push(self, block);
            debug_assert!(pushed);
        }
    }

    /// Return a whole chain to the worker cache, spilling to the global list
    /// once the cache is full. Returns the number of blocks released.
    pub(super) fn release_chain(&self, cache: &mut BufferCache, head: usize) -> usize {
        let mut released = 0;
        let mut spill_head = NIL_BLOCK;
        let mut spill_tail = NIL_BLOCK;
        let mut spill_count = 0;

        let mut current = head;
        while current != NIL_BLOCK {
            let next = self.next_of(current);
            released += 1;
            if !cache.push(self, current) {
                if spill_head == NIL_BLOCK {
                    spill_tail = current;
                }
                self.set_next(current, spill_head);
                spill_head = current;
                spill_count += 1;
            }
            current = next;
        }

        if spill_head != NIL_BLOCK {
            let mut free = self.free.lock();
            self.set_next(spill_tail, free.head);
            free.head = spill_head;
            free.count += spill_count;
            #[cfg(feature = "extreme_assertions")]
            self.verify_free_list(&free);
        }
        released
    }

    /// Spill everything in the worker cache to the global free list.
    pub(super) fn drain_cache(&self, cache: &mut BufferCache) {
        let (head, tail, count) = cache.take();
        if head != NIL_BLOCK {
            let mut free = self.free.lock();
            self.set_next(tail, free.head);
            free.head = head;
            free.count += count;
            #[cfg(feature = "extreme_assertions")]
            self.verify_free_list(&free);
        }
    }

    /// Cull free blocks of uncommitted regions and unmap any payload slab all
    /// of whose blocks are back in the free list. A decommitted region's
    /// blocks still held by other lists keep its slab alive until a later
    /// pass finds them freed. Returns the number of blocks culled.
    pub(crate) fn release_decommitted(&self, is_committed: impl Fn(usize) -> bool) -> usize {
        let region_count = self.region_slabs.len();
        let mut free_per_region = vec![0usize; region_count];
        let mut free = self.free.lock();

        let mut current = free.head;
        while current != NIL_BLOCK {
            free_per_region[self.owning_region(current)] += 1;
            current = self.next_of(current);
        }

        let mut reclaim = vec![false; region_count];
        let mut any = false;
        for region in 0..region_count {
            if self.region_slabs[region].load(Ordering::Relaxed) != 0
                && !is_committed(region)
                && free_per_region[region] == self.blocks_per_region
            {
                reclaim[region] = true;
                any = true;
            }
        }
        if !any {
            return 0;
        }

        let mut culled = 0;
        let mut prev = NIL_BLOCK;
        let mut current = free.head;
        while current != NIL_BLOCK {
            let next = self.next_of(current);
            if reclaim[self.owning_region(current)] {
                if prev == NIL_BLOCK {
                    free.head = next;
                } else {
                    self.set_next(prev, next);
                }
                free.count -= 1;
                culled += 1;
            } else {
                prev = current;
            }
            current = next;
        }
        #[cfg(feature = "extreme_assertions")]
        self.verify_free_list(&free);
        drop(free);

        for region in 0..region_count {
            if !reclaim[region] {
                continue;
            }
            let slab = self.region_slabs[region].swap(0, Ordering::Relaxed);
            let first = region * self.blocks_per_region;
            for i in first..first + self.blocks_per_region {
                self.block(i).card_base.store(0, Ordering::Relaxed);
            }
            self.total_buffers
                .fetch_sub(self.blocks_per_region, Ordering::Relaxed);
            let slab = unsafe { Address::from_usize(slab) };
            if let Err(e) = memory::munmap(slab, self.payload_bytes_per_region) {
                warn!("failed to unmap card buffer slab: {:?}", e);
            }
        }
        culled
    }

    pub(crate) fn free_buffer_count(&self) -> usize {
        self.free.lock().count
    }

    pub(crate) fn total_buffer_count(&self) -> usize {
        self.total_buffers.load(Ordering::Relaxed)
    }

    #[cfg(feature = "extreme_assertions")]
    fn verify_free_list(&self, free: &FreeBlockList) {
        let mut count = 0;
        let mut current = free.head;
        while current != NIL_BLOCK {
            count += 1;
            current = self.next_of(current);
        }
        assert_eq!(count, free.count, "free list length diverged from its count");
    }
}

impl Drop for CardBufferPool {
    fn drop(&mut self) {
        for slab in &self.region_slabs {
            let base = slab.load(Ordering::Relaxed);
            if base != 0 {
                let slab = unsafe { Address::from_usize(base) };
                if let Err(e) = memory::munmap(slab, self.payload_bytes_per_region) {
                    warn!("failed to unmap card buffer slab: {:?}", e);
                }
            }
        }
        if let Err(e) = memory::munmap(self.arena, self.arena_bytes) {
            warn!("failed to unmap buffer control block arena: {:?}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(regions: usize, cards_per_list: usize) -> CardBufferPool {
        CardBufferPool::new(regions, cards_per_list).unwrap()
    }

    #[test]
    fn backing_a_region_fills_the_free_list() {
        let pool = pool(2, 4 * CARD_BUFFER_SIZE);
        assert_eq!(pool.free_buffer_count(), 0);
        pool.back_region(0).unwrap();
        assert_eq!(pool.free_buffer_count(), 4);
        assert_eq!(pool.total_buffer_count(), 4);
        // Re-backing a mapped region changes nothing.
        pool.back_region(0).unwrap();
        assert_eq!(pool.free_buffer_count(), 4);
        pool.back_region(1).unwrap();
        assert_eq!(pool.total_buffer_count(), 8);
    }

    #[test]
    fn allocate_refills_a_bounded_cache() {
        let pool = pool(1, 64 * CARD_BUFFER_SIZE);
        pool.back_region(0).unwrap();
        let mut cache = BufferCache::default();
        let block = pool.allocate(&mut cache).unwrap();
        assert_eq!(cache.len(), MAX_LOCAL_BUFFER_CACHE - 1);
        assert_eq!(pool.free_buffer_count(), 64 - MAX_LOCAL_BUFFER_CACHE);

        pool.set_next(block, NIL_BLOCK);
        pool.release_chain(&mut cache, block);
        assert_eq!(cache.len(), MAX_LOCAL_BUFFER_CACHE);

        pool.drain_cache(&mut cache);
        assert!(cache.is_empty());
        assert_eq!(pool.free_buffer_count(), 64);
    }

    #[test]
    fn exhaustion_returns_none() {
        let pool = pool(1, CARD_BUFFER_SIZE);
        pool.back_region(0).unwrap();
        let mut cache = BufferCache::default();
        let only = pool.allocate(&mut cache).unwrap();
        assert!(pool.allocate(&mut cache).is_none());
        pool.set_next(only, NIL_BLOCK);
        pool.release_chain(&mut cache, only);
        assert!(pool.allocate(&mut cache).is_some());
    }

    #[test]
    fn card_slots_hold_addresses() {
        let pool = pool(1, CARD_BUFFER_SIZE);
        pool.back_region(0).unwrap();
        let mut cache = BufferCache::default();
        let block = pool.allocate(&mut cache).unwrap();
        pool.card_slot(block, 0).store(0x1000, Ordering::Relaxed);
        pool.card_slot(block, CARD_BUFFER_SIZE - 1)
            .store(0x2000, Ordering::Relaxed);
        assert_eq!(pool.card_slot(block, 0).load(Ordering::Relaxed), 0x1000);
        assert_eq!(
            pool.card_slot(block, CARD_BUFFER_SIZE - 1)
                .load(Ordering::Relaxed),
            0x2000
        );
    }

    #[test]
    fn decommit_reclaims_only_fully_freed_slabs() {
        let pool = pool(2, 2 * CARD_BUFFER_SIZE);
        pool.back_region(0).unwrap();
        pool.back_region(1).unwrap();
        let mut cache = BufferCache::default();

        let held = pool.allocate(&mut cache).unwrap();
        pool.drain_cache(&mut cache);

        // Both regions decommitted, but the held block pins its region's slab.
        let culled = pool.release_decommitted(|_| false);
        assert_eq!(culled, 2);
        assert_eq!(pool.total_buffer_count(), 2);
        assert_eq!(pool.free_buffer_count(), 1);

        pool.set_next(held, NIL_BLOCK);
        pool.release_chain(&mut cache, held);
        pool.drain_cache(&mut cache);
        assert_eq!(pool.release_decommitted(|_| false), 2);
        assert_eq!(pool.total_buffer_count(), 0);
        assert_eq!(pool.free_buffer_count(), 0);
    }

    #[test]
    fn recommit_after_reclaim_remaps() {
        let pool = pool(1, 2 * CARD_BUFFER_SIZE);
        pool.back_region(0).unwrap();
        pool.release_decommitted(|_| false);
        assert_eq!(pool.total_buffer_count(), 0);
        pool.back_region(0).unwrap();
        assert_eq!(pool.total_buffer_count(), 2);
        assert_eq!(pool.free_buffer_count(), 2);
    }
}
