//! Region-based work packet overflow.
//!
//! When the packet pool is exhausted, marking keeps its no-allocation
//! guarantee by demoting queued work to a per-region flag: every item in the
//! packet being discarded is individually flagged on the region holding its
//! object. A latch records that the demotion happened; the termination check
//! in `complete_scan` consumes it and schedules a recovery round that rescans
//! every marked object in the flagged regions. Array splits degrade to their
//! base array, so a recovery round rescans such arrays from element zero.

use std::sync::atomic::{fence, AtomicBool, Ordering};

use crate::heap::{OverflowKind, RegionManager};
use crate::mark::work_packets::Packet;

pub struct RegionBasedOverflow {
    kind: OverflowKind,
    latch: AtomicBool,
}

impl RegionBasedOverflow {
    pub fn new(kind: OverflowKind) -> Self {
        RegionBasedOverflow {
            kind,
            latch: AtomicBool::new(false),
        }
    }

    pub fn kind(&self) -> OverflowKind {
        self.kind
    }

    /// Demote every item in `packet` to an overflow mark on its object's
    /// region, leaving the packet empty for reuse.
    pub fn empty_to_overflow(&self, manager: &RegionManager, packet: &mut Packet) {
        debug_assert!(!packet.is_empty());
        let items = packet.len();
        if !self.latch.swap(true, Ordering::SeqCst) {
            debug!("Work packet pool exhausted, demoting {} items to region overflow", items);
            probe!(regmark, packet_overflow, items);
        }
        let mut flagged = 0;
        for item in packet.drain(..) {
            let region = manager.region_containing(item.base_object());
            if region.set_overflow_mark(self.kind) {
                flagged += 1;
            }
        }
        // Overflow marks must be visible before the drained packet is reused.
        fence(Ordering::Release);
        trace!("Overflow run flagged {} regions", flagged);
    }

    /// Consume the latch. True if any packet was demoted since the last call.
    pub fn take_latch(&self) -> bool {
        self.latch.swap(false, Ordering::SeqCst)
    }

    /// Re-arm the latch without demoting anything. Used when a recovery
    /// round stops early and flagged regions remain unscanned.
    pub fn raise_latch(&self) {
        self.latch.store(true, Ordering::SeqCst);
    }

    pub fn is_latched(&self) -> bool {
        self.latch.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mark::work_packets::WorkItem;
    use crate::util::options::Options;
    use crate::util::ObjectReference;

    fn manager() -> RegionManager {
        let mut options = Options::default();
        assert!(options.set_from_str("threads", "2"));
        assert!(options.set_from_str("heap_size", "2m"));
        assert!(options.set_from_str("region_log", "19"));
        RegionManager::new(&options).unwrap()
    }

    fn object_in(manager: &RegionManager, region: usize, offset: usize) -> ObjectReference {
        let addr = manager.heap_start() + manager.region_size() * region + offset;
        ObjectReference::from_raw_address(addr).unwrap()
    }

    #[test]
    fn demoted_items_flag_their_regions() {
        let manager = manager();
        let overflow = RegionBasedOverflow::new(OverflowKind::Global);
        let mut packet = vec![
            WorkItem::Object(object_in(&manager, 0, 64)),
            WorkItem::Object(object_in(&manager, 2, 128)),
            WorkItem::ArraySplit {
                array: object_in(&manager, 2, 512),
                start: 4096,
            },
        ];
        overflow.empty_to_overflow(&manager, &mut packet);

        assert!(packet.is_empty());
        assert!(manager.region(0).is_overflow_marked(OverflowKind::Global));
        assert!(!manager.region(1).is_overflow_marked(OverflowKind::Global));
        assert!(manager.region(2).is_overflow_marked(OverflowKind::Global));
        // The flag records the region's kind only, not the partial one.
        assert!(!manager.region(2).is_overflow_marked(OverflowKind::Partial));
    }

    #[test]
    fn latch_reports_each_demotion_epoch_once() {
        let manager = manager();
        let overflow = RegionBasedOverflow::new(OverflowKind::Global);
        assert!(!overflow.take_latch());

        let mut packet = vec![WorkItem::Object(object_in(&manager, 1, 64))];
        overflow.empty_to_overflow(&manager, &mut packet);
        assert!(overflow.is_latched());
        assert!(overflow.take_latch());
        assert!(!overflow.take_latch());

        let mut packet = vec![WorkItem::Object(object_in(&manager, 3, 64))];
        overflow.empty_to_overflow(&manager, &mut packet);
        assert!(overflow.take_latch());
    }

    #[test]
    fn kinds_keep_separate_latches_and_marks() {
        let manager = manager();
        let partial = RegionBasedOverflow::new(OverflowKind::Partial);
        let mut packet = vec![WorkItem::Object(object_in(&manager, 0, 64))];
        partial.empty_to_overflow(&manager, &mut packet);

        assert!(manager.region(0).is_overflow_marked(OverflowKind::Partial));
        assert!(!manager.region(0).is_overflow_marked(OverflowKind::Global));

        let global = RegionBasedOverflow::new(OverflowKind::Global);
        assert!(!global.take_latch());
        assert!(partial.take_latch());
    }
}
