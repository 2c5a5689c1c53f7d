// src/checksums.rs
//
// CRC calculation for UART telemetry frame validation.

// ============================================================================
// Core
// ============================================================================

/// Parameterised CRC-16 calculation (non-reflected, MSB-first).
///
/// Each byte is XORed into the high half of the register, then eight
/// shift rounds test the top bit and fold in `polynomial` when it is set.
pub fn crc16_parameterised(data: &[u8], polynomial: u16, init: u16, xor_out: u16) -> u16 {
    let mut crc = init;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ polynomial;
            } else {
                crc <<= 1;
            }
        }
    }
    crc ^ xor_out
}

/// CRC-16 with polynomial 0x1021 and initial register 0xFFFF (CCITT-FALSE).
/// This is the checksum carried by every telemetry frame.
pub fn crc16_ccitt_checksum(data: &[u8]) -> u16 {
    crc16_parameterised(data, 0x1021, 0xFFFF, 0x0000)
}

/// Check a big-endian CRC-16 stored at `crc_offset` against `data[range]`.
pub fn validate_crc16_be(frame: &[u8], range: std::ops::Range<usize>, crc_offset: usize) -> Option<(u16, u16)> {
    if range.end > frame.len() || crc_offset + 2 > frame.len() {
        return None;
    }
    let calculated = crc16_ccitt_checksum(&frame[range]);
    let stored = u16::from_be_bytes([frame[crc_offset], frame[crc_offset + 1]]);
    Some((calculated, stored))
}

// ============================================================================
// Tests
// ============================================================================
