//! CRC-CCITT as used by P25 PDU data headers.
//!
//! Polynomial 0x1021, zero preset, MSB first, result inverted and stored
//! big-endian in the last two octets of the covered block.

const POLY: u16 = 0x1021;

/// Compute the inverted CRC-CCITT over `data`.
pub fn ccitt16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ POLY
            } else {
                crc << 1
            };
        }
    }
    !crc
}

/// Write the CRC of `block[..len - 2]` into the trailing two octets.
///
/// Blocks shorter than three octets have nothing to cover and are left alone.
pub fn write_ccitt16(block: &mut [u8]) {
    let len = block.len();
    if len < 3 {
        return;
    }
    let crc = ccitt16(&block[..len - 2]);
    block[len - 2..].copy_from_slice(&crc.to_be_bytes());
}

/// Check the trailing CRC of `block`.
pub fn check_ccitt16(block: &[u8]) -> bool {
    let len = block.len();
    if len < 3 {
        return false;
    }
    let stored = u16::from_be_bytes([block[len - 2], block[len - 1]]);
    ccitt16(&block[..len - 2]) == stored
}
