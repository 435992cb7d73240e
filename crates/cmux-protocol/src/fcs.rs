//! Frame Check Sequence
//!
//! GSM 07.10 uses a reflected CRC-8 (polynomial x^8 + x^2 + x + 1, reversed
//! form `0xE0`) computed over the address, control and length octets only.
//! The transmitted value is the ones' complement of the running register.

/// Initial value of the FCS register
pub const FCS_INIT: u8 = 0xFF;

/// Register value left after running a valid header plus its FCS
pub const FCS_GOOD: u8 = 0xCF;

const fn build_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x01 != 0 {
                (crc >> 1) ^ 0xE0
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// 256-entry lookup table for the reversed `0xE0` polynomial
pub static FCS_TABLE: [u8; 256] = build_table();

fn run(seed: u8, bytes: &[u8]) -> u8 {
    bytes
        .iter()
        .fold(seed, |acc, &b| FCS_TABLE[usize::from(acc ^ b)])
}

/// Compute the FCS to transmit for the given header bytes
pub fn fcs(bytes: &[u8]) -> u8 {
    0xFF - run(FCS_INIT, bytes)
}

/// Check a received FCS against the header bytes it covers
pub fn verify_fcs(bytes: &[u8], received: u8) -> bool {
    FCS_TABLE[usize::from(run(FCS_INIT, bytes) ^ received)] == FCS_GOOD
}
