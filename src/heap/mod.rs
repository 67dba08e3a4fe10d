//! The heap model: fixed-size regions over one contiguous mapped range, and
//! the card table summarizing mutator writes.

mod card_table;
mod region;

pub use card_table::CardState;
pub use card_table::CardTable;
pub use region::HeapRegion;
pub use region::OverflowKind;

use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::util::conversions;
use crate::util::memory;
use crate::util::options::Options;
use crate::util::{Address, ObjectReference};

/// Owns the heap range and the region descriptor table.
///
/// The whole range is reserved at initialization; committing a region is a
/// logical state change on its descriptor (plus resource setup done by the
/// caller). The manager also carries the atomic work-unit counter that
/// parallel passes use to claim regions exclusively.
pub struct RegionManager {
    heap_start: Address,
    heap_extent: usize,
    map_base: Address,
    map_extent: usize,
    log_region_size: usize,
    regions: Vec<HeapRegion>,
    work_unit: AtomicUsize,
}

impl RegionManager {
    pub fn new(options: &Options) -> std::io::Result<RegionManager> {
        let region_size = options.region_size();
        let heap_extent = conversions::raw_align_up(options.heap_size.0, region_size);
        // Over-map by one region so the usable range can start
        // region-aligned; the cross-region fast path tests
        // `(a ^ b) >= region_size`.
        let map_extent = heap_extent + region_size;
        let map_base = memory::dzmmap_anywhere(map_extent)?;
        let heap_start = map_base.align_up(region_size);
        let region_count = heap_extent / region_size;
        let regions = (0..region_count)
            .map(|i| HeapRegion::new(i, heap_start + i * region_size, region_size, options.threads))
            .collect();
        Ok(RegionManager {
            heap_start,
            heap_extent,
            map_base,
            map_extent,
            log_region_size: options.region_log,
            regions,
            work_unit: AtomicUsize::new(0),
        })
    }

    pub fn heap_start(&self) -> Address {
        self.heap_start
    }

    pub fn heap_extent(&self) -> usize {
        self.heap_extent
    }

    pub fn heap_range(&self) -> Range<Address> {
        self.heap_start..self.heap_start + self.heap_extent
    }

    pub fn region_size(&self) -> usize {
        1 << self.log_region_size
    }

    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    pub fn region(&self, index: usize) -> &HeapRegion {
        &self.regions[index]
    }

    pub fn index_for_address(&self, addr: Address) -> usize {
        debug_assert!(self.heap_range().contains(&addr));
        (addr - self.heap_start) >> self.log_region_size
    }

    pub fn region_for_address(&self, addr: Address) -> &HeapRegion {
        &self.regions[self.index_for_address(addr)]
    }

    pub fn region_containing(&self, object: ObjectReference) -> &HeapRegion {
        self.region_for_address(object.to_raw_address())
    }

    pub fn regions(&self) -> impl Iterator<Item = &HeapRegion> {
        self.regions.iter()
    }

    pub fn committed_regions(&self) -> impl Iterator<Item = &HeapRegion> {
        self.regions.iter().filter(|r| r.is_committed())
    }

    /// Reset the work-unit counter. Call from a single worker between
    /// barriers, before a parallel pass claims regions.
    pub fn reset_work_units(&self) {
        self.work_unit.store(0, Ordering::SeqCst);
    }

    /// Claim the next region index for an exclusive parallel pass.
    pub fn claim_next(&self) -> Option<usize> {
        let unit = self.work_unit.fetch_add(1, Ordering::SeqCst);
        (unit < self.regions.len()).then_some(unit)
    }
}

impl Drop for RegionManager {
    fn drop(&mut self) {
        memory::munmap(self.map_base, self.map_extent).unwrap_or_else(|e| {
            warn!("Failed to unmap heap: {}", e);
        });
    }
}
