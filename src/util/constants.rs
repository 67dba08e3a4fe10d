use static_assertions::const_assert;

/// log2 of the number of bits in a byte
pub const LOG_BITS_IN_BYTE: u8 = 3;
/// The number of bits in a byte
pub const BITS_IN_BYTE: usize = 1 << LOG_BITS_IN_BYTE;

/// log2 of the number of bytes in a kilobyte
pub const LOG_BYTES_IN_KBYTE: u8 = 10;
/// The number of bytes in a kilobyte
pub const BYTES_IN_KBYTE: usize = 1 << LOG_BYTES_IN_KBYTE;

/// log2 of the number of bytes in a megabyte
pub const LOG_BYTES_IN_MBYTE: u8 = 20;
/// The number of bytes in a megabyte
pub const BYTES_IN_MBYTE: usize = 1 << LOG_BYTES_IN_MBYTE;

#[cfg(target_pointer_width = "32")]
/// log2 of the number of bytes in an address
pub const LOG_BYTES_IN_ADDRESS: u8 = 2;
#[cfg(target_pointer_width = "64")]
/// log2 of the number of bytes in an address
pub const LOG_BYTES_IN_ADDRESS: u8 = 3;
/// The number of bytes in an address
pub const BYTES_IN_ADDRESS: usize = 1 << LOG_BYTES_IN_ADDRESS;

/// log2 of the number of bytes in a word
pub const LOG_BYTES_IN_WORD: u8 = LOG_BYTES_IN_ADDRESS;
/// The number of bytes in a word
pub const BYTES_IN_WORD: usize = 1 << LOG_BYTES_IN_WORD;
/// log2 of the number of bits in a word
pub const LOG_BITS_IN_WORD: usize = LOG_BITS_IN_BYTE as usize + LOG_BYTES_IN_WORD as usize;
/// The number of bits in a word
pub const BITS_IN_WORD: usize = 1 << LOG_BITS_IN_WORD;

/// log2 of the number of bytes in a page
pub const LOG_BYTES_IN_PAGE: u8 = 12;
/// The number of bytes in a page
pub const BYTES_IN_PAGE: usize = 1 << LOG_BYTES_IN_PAGE;

/// log2 of the minimal object alignment in bytes. The mark map keeps one bit
/// per alignment slot, so this also fixes the mark map's granularity.
pub const LOG_MIN_OBJECT_ALIGNMENT: u8 = LOG_BYTES_IN_WORD;
/// The minimal object alignment in bytes.
pub const MIN_OBJECT_ALIGNMENT: usize = 1 << LOG_MIN_OBJECT_ALIGNMENT;

/// log2 of the number of bytes in a card. Cards are the granularity of both
/// the write-barrier card table and remembered-set entries.
pub const LOG_BYTES_IN_CARD: u8 = 9;
/// The number of bytes in a card
pub const BYTES_IN_CARD: usize = 1 << LOG_BYTES_IN_CARD;

/// The number of remembered-set card entries in one buffer block.
pub const CARD_BUFFER_SIZE: usize = 32;

/// The number of buffer blocks a worker may cache locally before spilling
/// back to the global pool.
pub const MAX_LOCAL_BUFFER_CACHE: usize = 16;

/// The number of work items held by one mark work packet.
pub const WORK_PACKET_CAPACITY: usize = 512;

/// How many references the card scrubber examines between deadline checks.
pub const SCRUB_YIELD_CHECK_INTERVAL: usize = 128;

// A card must cover at least one mark map word's worth of alignment slots so
// that card cleaning can walk whole map words.
const_assert!(BYTES_IN_CARD >= MIN_OBJECT_ALIGNMENT * BITS_IN_WORD);
// Buffer geometry used by the control-block arena index arithmetic.
const_assert!(CARD_BUFFER_SIZE.is_power_of_two());
