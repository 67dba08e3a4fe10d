use crate::util::constants::*;
use crate::util::Address;

/* Alignment */

pub const fn card_align_down(addr: Address) -> Address {
    addr.align_down(BYTES_IN_CARD)
}

pub const fn raw_align_up(val: usize, align: usize) -> usize {
    // See https://github.com/rust-lang/rust/blob/e620d0f337d0643c757bab791fc7d88d63217704/src/libcore/alloc.rs#L192
    val.wrapping_add(align).wrapping_sub(1) & !align.wrapping_sub(1)
}

pub const fn raw_align_down(val: usize, align: usize) -> usize {
    val & !align.wrapping_sub(1)
}

pub const fn raw_is_aligned(val: usize, align: usize) -> bool {
    val & align.wrapping_sub(1) == 0
}

/* Conversion */

/// Format a byte count with a binary-unit suffix, for log output.
pub fn bytes_to_formatted_string(bytes: usize) -> String {
    if bytes >= BYTES_IN_MBYTE && raw_is_aligned(bytes, BYTES_IN_MBYTE) {
        format!("{}M", bytes >> LOG_BYTES_IN_MBYTE)
    } else if bytes >= BYTES_IN_KBYTE && raw_is_aligned(bytes, BYTES_IN_KBYTE) {
        format!("{}K", bytes >> LOG_BYTES_IN_KBYTE)
    } else {
        format!("{}", bytes)
    }
}

#[cfg(test)]
mod tests {
    use crate::util::conversions::*;
    use crate::util::Address;

    #[test]
    fn test_card_align() {
        let addr = unsafe { Address::from_usize(0x123456789) };
        assert_eq!(card_align_down(addr), unsafe {
            Address::from_usize(0x123456600)
        });
    }

    #[test]
    fn test_formatted_bytes() {
        assert_eq!(bytes_to_formatted_string(64 * BYTES_IN_MBYTE), "64M");
        assert_eq!(bytes_to_formatted_string(512 * BYTES_IN_KBYTE), "512K");
        assert_eq!(bytes_to_formatted_string(100), "100");
    }
}
