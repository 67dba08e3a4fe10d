//! Region-based global marking: the packet queue, the tracing scheme, card
//! cleaning and scrubbing, reference passes, and the incremental delegate.

mod card_cleaner;
mod delegate;
mod overflow;
mod references;
mod scheme;
#[cfg(test)]
pub(crate) mod testing;
mod work_packets;

pub use delegate::{ConcurrentMarkOutcome, GlobalMarkDelegate, MarkDelegateState};
pub use scheme::{GlobalMarkingScheme, MarkStats, ScanReason};
pub(crate) use scheme::{CycleKind, MarkEnv};
