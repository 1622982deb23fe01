//! Checksum primitives shared by the image model, the patch engine and the
//! loader frames.

/// Mask applied to the whole-image text checksum (the low 24 bits).
pub const TEXT_CHECKSUM_MASK: u32 = 0x00FF_FFFF;

const HEX_DIGITS: &[u8; 16] = b"0123456789ABCDEF";

/// Wrapping sum of all bytes, truncated to a byte.
pub fn byte_sum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// The two's complement check byte for the given bytes, such that adding it
/// to the byte sum yields zero.
pub fn check_byte(bytes: &[u8]) -> u8 {
    byte_sum(bytes).wrapping_neg()
}

/// Sum of the character codes of a piece of text.
pub fn text_sum(text: &[u8]) -> u32 {
    text.iter().fold(0u32, |acc, &b| acc.wrapping_add(b.into()))
}

/// Sum of the two upper-case hex digits a byte is serialized as.
pub fn hex_text_sum(byte: u8) -> u32 {
    let hi = HEX_DIGITS[usize::from(byte >> 4)];
    let lo = HEX_DIGITS[usize::from(byte & 0x0F)];
    u32::from(hi) + u32::from(lo)
}

/// Range of values [`hex_text_sum`] can take ("00" to "FF").
pub const HEX_TEXT_SUM_MIN: u32 = (b'0' as u32) * 2;
pub const HEX_TEXT_SUM_MAX: u32 = (b'F' as u32) * 2;
