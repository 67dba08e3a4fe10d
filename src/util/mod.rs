//! Utilities used across the crate: address arithmetic, the mark bitmap,
//! memory mapping, options and logging.

/// Abstract heap addresses and object references.
pub mod address;
/// Numeric constants for cards, buffers and work packets.
pub mod constants;
/// Alignment and unit conversions.
pub mod conversions;
/// Logger initialization.
pub mod logger;
/// The atomic mark bitmap.
pub mod mark_map;
/// Memory mapping and zeroing.
pub(crate) mod memory;
/// User-settable options.
pub mod options;
/// A synthetic object binding and heap fixtures for tests and benchmarks.
#[cfg(any(test, feature = "test_binding"))]
pub mod test_util;

pub use self::address::Address;
pub use self::address::ObjectReference;
