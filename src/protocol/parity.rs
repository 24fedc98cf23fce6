//! # Frame Parity
//!
//! Even parity over the full 32-bit OpenTherm word.
//!
//! The parity bit (bit 31) is chosen so that the total number of set bits in
//! the frame is even.

/// Parity bit value for the 31 low bits of `word`
///
/// # Examples
///
/// ```
/// use opentherm_gateway::protocol::parity::parity_bit;
///
/// assert!(!parity_bit(0x0018_0000)); // id 24 has two bits set
/// assert!(parity_bit(0x0019_0000)); // id 25 has three
/// ```
pub fn parity_bit(word: u32) -> bool {
    (word & 0x7FFF_FFFF).count_ones() % 2 == 1
}

/// Whether the full 32-bit word has an even number of set bits
pub fn has_even_parity(word: u32) -> bool {
    word.count_ones() % 2 == 0
}

/// Set bit 31 of `word` so the word has even parity
pub fn with_parity(word: u32) -> u32 {
    let body = word & 0x7FFF_FFFF;
    if parity_bit(body) {
        body | 0x8000_0000
    } else {
        body
    }
}
