//! The bounded pool of marking work packets.
//!
//! Marking work circulates as packets, each a vector of [`WorkItem`]s with a
//! fixed capacity. The pool size is fixed up front: empty packets live in a
//! lock-free array queue, published packets in an injector any worker can
//! steal from. When a worker needs an empty packet and none is free, the
//! caller falls back to region-based overflow instead of allocating.

use crossbeam::deque::{Injector, Steal};
use crossbeam::queue::ArrayQueue;

use crate::util::constants::WORK_PACKET_CAPACITY;
use crate::util::ObjectReference;

/// One unit of marking work.
///
/// Object arrays are scanned in bounded slices so a huge array cannot stall
/// the gang; the remainder goes back into the queue as an `ArraySplit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkItem {
    /// Scan every reference slot of this object.
    Object(ObjectReference),
    /// Scan one slice of an object array, starting at `start` elements.
    ArraySplit { array: ObjectReference, start: usize },
}

impl WorkItem {
    /// The object this item refers to, with array splits degraded to their
    /// base array. Used when an item is demoted to a region overflow mark,
    /// which can only record whole objects.
    pub fn base_object(&self) -> ObjectReference {
        match *self {
            WorkItem::Object(object) => object,
            WorkItem::ArraySplit { array, .. } => array,
        }
    }
}

pub type Packet = Vec<WorkItem>;

/// The shared packet pool: a fixed set of packets circulating between the
/// free queue and the published injector.
pub struct WorkPackets {
    free: ArrayQueue<Packet>,
    full: Injector<Packet>,
}

impl WorkPackets {
    pub fn new(packet_count: usize) -> Self {
        debug_assert!(packet_count > 0);
        let free = ArrayQueue::new(packet_count);
        for _ in 0..packet_count {
            let result = free.push(Vec::with_capacity(WORK_PACKET_CAPACITY));
            debug_assert!(result.is_ok());
        }
        WorkPackets {
            free,
            full: Injector::new(),
        }
    }

    pub fn packet_count(&self) -> usize {
        self.free.capacity()
    }

    /// Take an empty packet, or `None` if the pool is exhausted.
    pub fn acquire_empty(&self) -> Option<Packet> {
        self.free.pop()
    }

    /// Publish a packet of work for any worker to steal.
    pub fn publish(&self, packet: Packet) {
        debug_assert!(!packet.is_empty());
        self.full.push(packet);
    }

    /// Steal a published packet, or `None` if none are pending.
    pub fn fetch(&self) -> Option<Packet> {
        loop {
            match self.full.steal() {
                Steal::Success(packet) => return Some(packet),
                Steal::Empty => return None,
                Steal::Retry => continue,
            }
        }
    }

    /// Whether any published packets are waiting to be fetched.
    pub fn has_pending(&self) -> bool {
        !self.full.is_empty()
    }

    /// Return a drained packet to the free queue.
    pub fn release_empty(&self, mut packet: Packet) {
        debug_assert!(packet.capacity() >= WORK_PACKET_CAPACITY);
        packet.clear();
        let result = self.free.push(packet);
        debug_assert!(result.is_ok());
    }

    /// Number of packets currently in the free queue. Test visibility.
    pub fn free_count(&self) -> usize {
        self.free.len()
    }
}
