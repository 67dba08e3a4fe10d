//! One region's list of remembered cards: the addresses of cards holding
//! references into the region.
//!
//! The list is split into one bucket per worker so marking appends without
//! synchronization. A shared buffer count enforces the per-region cap; a
//! list that would exceed it degrades to overflowed and drops its entries,
//! after which the region's two overflow bits carry the coarse state.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

use super::bucket::{AddResult, RememberedSetCardBucket};
use super::pool::{BufferCache, CardBufferPool};
use super::NIL_REGION;
use crate::util::constants::CARD_BUFFER_SIZE;
use crate::util::Address;

const OVERFLOW_NONE: u8 = 0;
const OVERFLOW_FULL: u8 = 1;
/// Overflowed for being dense rather than full; distinguished for statistics.
const OVERFLOW_STABLE: u8 = 2;

pub struct RememberedSetCardList {
    buckets: Box<[RememberedSetCardBucket]>,
    /// Buffers across all buckets, bounded by the per-region card cap.
    buffer_count: AtomicUsize,
    overflowed: AtomicU8,
    being_rebuilt: AtomicBool,
    /// Link in the global overflowed-list chain, a region index.
    pub(super) overflowed_next: AtomicUsize,
}

impl RememberedSetCardList {
    pub fn new(workers: usize) -> Self {
        RememberedSetCardList {
            buckets: (0..workers).map(|_| RememberedSetCardBucket::new()).collect(),
            buffer_count: AtomicUsize::new(0),
            overflowed: AtomicU8::new(OVERFLOW_NONE),
            being_rebuilt: AtomicBool::new(false),
            overflowed_next: AtomicUsize::new(NIL_REGION),
        }
    }

    pub(super) fn bucket(&self, ordinal: usize) -> &RememberedSetCardBucket {
        &self.buckets[ordinal]
    }

    /// True once the list stopped tracking individual cards, whether from
    /// hitting its cap or from being declared stable.
    pub fn is_overflowed(&self) -> bool {
        self.overflowed.load(Ordering::SeqCst) != OVERFLOW_NONE
    }

    pub fn is_stable(&self) -> bool {
        self.overflowed.load(Ordering::SeqCst) == OVERFLOW_STABLE
    }

    /// An accurate list still tracks every remembered card.
    pub fn is_accurate(&self) -> bool {
        !self.is_overflowed() && !self.is_being_rebuilt()
    }

    pub fn is_being_rebuilt(&self) -> bool {
        self.being_rebuilt.load(Ordering::SeqCst)
    }

    pub(super) fn set_as_being_rebuilt(&self) {
        self.being_rebuilt.store(true, Ordering::SeqCst);
    }

    pub(super) fn set_as_rebuilding_complete(&self) {
        self.being_rebuilt.store(false, Ordering::SeqCst);
    }

    /// Flip to overflowed. Only the first caller since the last clear gets
    /// true and with it the duty to publish the list for buffer reclamation.
    pub(super) fn try_set_overflowed(&self) -> bool {
        self.overflowed
            .compare_exchange(
                OVERFLOW_NONE,
                OVERFLOW_FULL,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    pub(super) fn set_as_stable(&self) {
        debug_assert!(self.is_accurate());
        self.overflowed.store(OVERFLOW_STABLE, Ordering::SeqCst);
    }

    /// A list with no buffers and no overflow holds nothing worth clearing.
    pub fn is_empty(&self) -> bool {
        !self.is_overflowed() && self.buffer_count() == 0
    }

    pub fn buffer_count(&self) -> usize {
        self.buffer_count.load(Ordering::SeqCst)
    }

    /// Card count over all buckets. Meaningful only while no thread appends,
    /// and an overcount between a deletion pass and the following compact.
    pub fn size(&self) -> usize {
        self.buckets.iter().map(|b| b.size()).sum()
    }

    pub(super) fn add_to_bucket(
        &self,
        pool: &CardBufferPool,
        ordinal: usize,
        card: Address,
    ) -> AddResult {
        self.buckets[ordinal].add(pool, card)
    }

    /// Account one more buffer against the region cap. False means the cap
    /// is hit; the count is rolled back and the caller must overflow the
    /// list instead.
    pub(super) fn try_reserve_buffer(&self, max_cards: usize) -> bool {
        let new_count = self.buffer_count.fetch_add(1, Ordering::SeqCst) + 1;
        if new_count * CARD_BUFFER_SIZE > max_cards {
            self.buffer_count.fetch_sub(1, Ordering::SeqCst);
            return false;
        }
        true
    }

    /// Roll back a reservation that could not be filled with a buffer.
    pub(super) fn unreserve_buffer(&self) {
        self.buffer_count.fetch_sub(1, Ordering::SeqCst);
    }

    pub(super) fn install_reserved_buffer(
        &self,
        pool: &CardBufferPool,
        ordinal: usize,
        block: usize,
    ) {
        self.buckets[ordinal].install_buffer(pool, block);
    }

    /// Release one worker's bucket back to the pool. Returns the number of
    /// buffers released.
    pub(super) fn release_bucket(
        &self,
        pool: &CardBufferPool,
        cache: &mut BufferCache,
        ordinal: usize,
    ) -> usize {
        let (head, count) = self.buckets[ordinal].take_chain();
        if count > 0 {
            pool.release_chain(cache, head);
            self.buffer_count.fetch_sub(count, Ordering::SeqCst);
        }
        count
    }

    pub(super) fn release_all_buckets(&self, pool: &CardBufferPool, cache: &mut BufferCache) -> usize {
        let mut released = 0;
        for ordinal in 0..self.buckets.len() {
            released += self.release_bucket(pool, cache, ordinal);
        }
        released
    }

    /// Reset to an empty, accurate list. The rebuilding flag survives; it is
    /// managed by the global-mark rebuild protocol.
    pub(super) fn clear(&self, pool: &CardBufferPool, cache: &mut BufferCache) {
        self.release_all_buckets(pool, cache);
        debug_assert_eq!(self.buffer_count(), 0);
        self.overflowed.store(OVERFLOW_NONE, Ordering::SeqCst);
    }

    /// Exact membership test; only meaningful while the list is accurate.
    pub fn is_card_remembered(&self, pool: &CardBufferPool, card: Address) -> bool {
        self.buckets.iter().any(|b| b.is_remembered(pool, card))
    }

    pub(super) fn for_each_card(&self, pool: &CardBufferPool, f: &mut impl FnMut(Address)) {
        for bucket in self.buckets.iter() {
            bucket.for_each(pool, f);
        }
    }

    /// Delete cards the predicate rejects, then squeeze the buckets. Returns
    /// (cards deleted, buffers released).
    pub(super) fn retain_cards(
        &self,
        pool: &CardBufferPool,
        cache: &mut BufferCache,
        f: &mut impl FnMut(Address) -> bool,
    ) -> (usize, usize) {
        let mut removed = 0;
        for bucket in self.buckets.iter() {
            removed += bucket.retain(pool, f);
        }
        let mut released = 0;
        if removed > 0 {
            for bucket in self.buckets.iter() {
                released += bucket.compact(pool, cache);
            }
            if released > 0 {
                self.buffer_count.fetch_sub(released, Ordering::SeqCst);
            }
        }
        (removed, released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::constants::BYTES_IN_CARD;

    fn card(i: usize) -> Address {
        unsafe { Address::from_usize(0x2000_0000 + i * BYTES_IN_CARD) }
    }

    struct Fixture {
        pool: CardBufferPool,
        cache: BufferCache,
        list: RememberedSetCardList,
    }

    impl Fixture {
        fn new(workers: usize, max_cards: usize) -> Self {
            let pool = CardBufferPool::new(1, max_cards).unwrap();
            pool.back_region(0).unwrap();
            Fixture {
                pool,
                cache: BufferCache::default(),
                list: RememberedSetCardList::new(workers),
            }
        }

        fn add(&mut self, ordinal: usize, card: Address) {
            loop {
                match self.list.add_to_bucket(&self.pool, ordinal, card) {
                    AddResult::Added | AddResult::Duplicate => return,
                    AddResult::NeedsBuffer => {
                        assert!(self.list.try_reserve_buffer(usize::MAX));
                        let block = self.pool.allocate(&mut self.cache).unwrap();
                        self.list.install_reserved_buffer(&self.pool, ordinal, block);
                    }
                }
            }
        }
    }

    #[test]
    fn buckets_append_independently_into_one_count() {
        let mut f = Fixture::new(2, 8 * CARD_BUFFER_SIZE);
        for i in 0..CARD_BUFFER_SIZE + 1 {
            f.add(0, card(i));
        }
        for i in 0..4 {
            f.add(1, card(100 + i));
        }
        assert_eq!(f.list.size(), CARD_BUFFER_SIZE + 1 + 4);
        assert_eq!(f.list.buffer_count(), 3);
        assert!(f.list.is_card_remembered(&f.pool, card(0)));
        assert!(f.list.is_card_remembered(&f.pool, card(103)));
        assert!(!f.list.is_card_remembered(&f.pool, card(999)));
    }

    #[test]
    fn buffer_reservation_respects_the_cap() {
        let f = Fixture::new(1, 8 * CARD_BUFFER_SIZE);
        let max_cards = 2 * CARD_BUFFER_SIZE;
        assert!(f.list.try_reserve_buffer(max_cards));
        assert!(f.list.try_reserve_buffer(max_cards));
        // The third buffer would exceed the cap; the count is rolled back.
        assert!(!f.list.try_reserve_buffer(max_cards));
        assert_eq!(f.list.buffer_count(), 2);
    }

    #[test]
    fn overflow_is_first_setter_and_clear_resets_it() {
        let mut f = Fixture::new(1, 8 * CARD_BUFFER_SIZE);
        f.add(0, card(1));
        assert!(f.list.try_set_overflowed());
        assert!(!f.list.try_set_overflowed());
        assert!(f.list.is_overflowed());
        assert!(!f.list.is_stable());
        assert!(!f.list.is_empty());

        f.list.clear(&f.pool, &mut f.cache);
        assert!(!f.list.is_overflowed());
        assert_eq!(f.list.buffer_count(), 0);
        assert!(f.list.is_empty());
        assert!(f.list.try_set_overflowed());
    }

    #[test]
    fn stable_reads_as_overflowed_but_keeps_its_kind() {
        let f = Fixture::new(1, 8 * CARD_BUFFER_SIZE);
        f.list.set_as_stable();
        assert!(f.list.is_overflowed());
        assert!(f.list.is_stable());
        // A racing capacity overflow must not demote the stable state.
        assert!(!f.list.try_set_overflowed());
        assert!(f.list.is_stable());
    }

    #[test]
    fn rebuilding_flag_survives_clear() {
        let mut f = Fixture::new(1, 8 * CARD_BUFFER_SIZE);
        assert!(f.list.try_set_overflowed());
        f.list.clear(&f.pool, &mut f.cache);
        f.list.set_as_being_rebuilt();
        assert!(f.list.is_being_rebuilt());
        assert!(!f.list.is_accurate());
        f.list.clear(&f.pool, &mut f.cache);
        assert!(f.list.is_being_rebuilt());
        f.list.set_as_rebuilding_complete();
        assert!(f.list.is_accurate());
    }

    #[test]
    fn retain_cards_updates_the_buffer_count() {
        let mut f = Fixture::new(2, 8 * CARD_BUFFER_SIZE);
        for i in 0..2 * CARD_BUFFER_SIZE {
            f.add(0, card(i));
        }
        for i in 0..CARD_BUFFER_SIZE {
            f.add(1, card(1000 + i));
        }
        assert_eq!(f.list.buffer_count(), 3);

        // Drop everything worker 1 recorded and half of worker 0's cards.
        let keep_below = card(CARD_BUFFER_SIZE).as_usize();
        let (removed, released) = {
            let pool = &f.pool;
            f.list
                .retain_cards(pool, &mut f.cache, &mut |c| c.as_usize() < keep_below)
        };
        assert_eq!(removed, 2 * CARD_BUFFER_SIZE);
        assert_eq!(released, 2);
        assert_eq!(f.list.buffer_count(), 1);
        assert_eq!(f.list.size(), CARD_BUFFER_SIZE);
        assert!(f.list.is_card_remembered(&f.pool, card(0)));
        assert!(!f.list.is_card_remembered(&f.pool, card(1000)));
    }
}
