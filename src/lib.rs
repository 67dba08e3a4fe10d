//! Regmark is the marking and remembered-set core of a region-based garbage
//! collector. The managed heap is one contiguous range carved into fixed-size
//! power-of-two regions; a card table summarizes mutator writes at card
//! granularity; and every region carries a remembered set of the cards outside
//! it that hold references into it, so a collection of any subset of regions
//! can find its incoming references without walking the whole heap.
//!
//! The crate does not allocate, move or sweep objects. It computes the two
//! inputs a region-based collector needs before it can do any of those: a
//! global mark state (per-object liveness in a side bitmap, plus reference
//! processing) and accurate remembered sets. Both are maintained by a global
//! mark phase that can run in one stop-the-world pass, in bounded increments,
//! or concurrently with the mutator against the card-table write barrier.
//!
//! Logically, this crate includes these major parts:
//! * The heap model. [`heap`] owns the region descriptor table and the card
//!   table over one reserved address range.
//! * The remembered set. [`remset`] keeps a per-region card list fed through
//!   per-worker buckets, with a bounded buffer pool and an overflowed mode
//!   that answers membership conservatively until the next global mark
//!   rebuilds the list.
//! * The marking engine. [`mark`] has the parallel tracing scheme, its work
//!   packet queue, card cleaning and scrubbing, the reference passes, and the
//!   delegate state machine that slices a mark cycle into increments.
//! * The worker pool. [`scheduler`] fans passes out over a fixed set of GC
//!   threads.
//!
//! A host runtime implements [`vm::VMBinding`] to describe its object layout
//! and roots, constructs one [`RegMark`] instance per managed heap, routes its
//! write barrier through the instance, and drives collection through the
//! `perform_mark_*` entry points.

#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate log;
#[macro_use]
extern crate probe;

mod regmark;
pub use crate::regmark::RegMark;

pub mod build_info;
pub mod heap;
pub mod mark;
pub mod remset;
pub mod scheduler;
pub mod util;
pub mod vm;

#[cfg(test)]
mod tests;
