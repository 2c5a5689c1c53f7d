// src/io/uart/codec.rs
//
// Checksum validation, payload decoding and request building for the
// UART telemetry frames located by the synchronizer.

use serde::Serialize;
use thiserror::Error;

use super::framer::{FrameCandidate, FrameFamily, FRAME_SIZE, MARKER_LEN};
use crate::checksums::{crc16_ccitt_checksum, validate_crc16_be};

/// UART frame layout constants
pub mod constants {
    pub const COMMAND_OFFSET: usize = 4;
    pub const STATUS_OFFSET: usize = 5;
    pub const LENGTH_OFFSET: usize = 6;
    pub const PAYLOAD_OFFSET: usize = 7;
    pub const PAYLOAD_LEN: usize = 55;
    pub const CRC_OFFSET: usize = 62;

    /// Status byte for a well-formed request
    pub const STATUS_OK: u8 = 0x00;
    /// Begin acquisition
    pub const CMD_START: u8 = 0x3A;
    /// Request the latest reading of a family
    pub const CMD_READ: u8 = 0x3B;
}

use constants::*;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TelemetryError {
    #[error("checksum mismatch (calculated {calculated:04X}, received {received:04X})")]
    ChecksumMismatch { calculated: u16, received: u16 },
    #[error("unknown frame family marker {}", hex::encode(.0))]
    UnknownFamily([u8; MARKER_LEN]),
    #[error("invalid frame length {0}")]
    InvalidLength(usize),
}

/// Decoded scalar fields, keyed the way UI clients expect them.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TelemetryFields {
    Temperature {
        #[serde(rename = "tempNormal1")]
        temp_normal_1: f64,
        #[serde(rename = "tempNormal2")]
        temp_normal_2: f64,
    },
    HighTemperature {
        temp600_1: f64,
        temp600_2: f64,
    },
    Traction {
        thrust1: f64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetrySample {
    pub family: FrameFamily,
    pub command: u8,
    pub status: u8,
    pub payload_len: u8,
    #[serde(flatten)]
    pub fields: TelemetryFields,
}

/// Latest value of every telemetry field, merged across frame families.
/// Fields no frame has reported yet read 0.0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TelemetrySnapshot {
    #[serde(rename = "tempNormal1")]
    pub temp_normal_1: f64,
    #[serde(rename = "tempNormal2")]
    pub temp_normal_2: f64,
    pub temp600_1: f64,
    pub temp600_2: f64,
    pub thrust1: f64,
    /// Capture time of the most recent frame merged in
    #[serde(rename = "timestamp_us", skip_serializing_if = "Option::is_none")]
    pub updated_us: Option<u64>,
}

impl TelemetrySnapshot {
    pub fn apply(&mut self, sample: &TelemetrySample, timestamp_us: u64) {
        match sample.fields {
            TelemetryFields::Temperature { temp_normal_1, temp_normal_2 } => {
                self.temp_normal_1 = temp_normal_1;
                self.temp_normal_2 = temp_normal_2;
            }
            TelemetryFields::HighTemperature { temp600_1, temp600_2 } => {
                self.temp600_1 = temp600_1;
                self.temp600_2 = temp600_2;
            }
            TelemetryFields::Traction { thrust1 } => self.thrust1 = thrust1,
        }
        self.updated_us = Some(timestamp_us);
    }

    /// `{"type":"sensor_data","data":{...}}`, the same envelope as a live frame.
    pub fn to_envelope(&self) -> serde_json::Value {
        serde_json::json!({ "type": "sensor_data", "data": self })
    }
}

// ============================================================================
// Decoding
// ============================================================================

/// Validate the CRC of a located frame and decode its payload.
pub fn validate_and_decode(candidate: &FrameCandidate) -> Result<TelemetrySample, TelemetryError> {
    let frame = candidate.bytes();
    let (calculated, received) = validate_crc16_be(frame, COMMAND_OFFSET..CRC_OFFSET, CRC_OFFSET)
        .ok_or(TelemetryError::InvalidLength(frame.len()))?;
    if calculated != received {
        return Err(TelemetryError::ChecksumMismatch { calculated, received });
    }

    let payload = &frame[PAYLOAD_OFFSET..PAYLOAD_OFFSET + PAYLOAD_LEN];
    let fields = match candidate.family() {
        FrameFamily::Temperature => TelemetryFields::Temperature {
            temp_normal_1: u16::from_le_bytes([payload[0], payload[1]]) as f64 / 100.0,
            temp_normal_2: u16::from_le_bytes([payload[2], payload[3]]) as f64 / 100.0,
        },
        FrameFamily::HighTemperature => TelemetryFields::HighTemperature {
            temp600_1: f32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]) as f64,
            temp600_2: f32::from_le_bytes([payload[4], payload[5], payload[6], payload[7]]) as f64,
        },
        FrameFamily::Traction => TelemetryFields::Traction {
            thrust1: u16::from_le_bytes([payload[2], payload[3]]) as f64 / 1000.0,
        },
    };

    Ok(TelemetrySample {
        family: candidate.family(),
        command: frame[COMMAND_OFFSET],
        status: frame[STATUS_OFFSET],
        payload_len: frame[LENGTH_OFFSET],
        fields,
    })
}

/// Decode a raw 64-byte slice that did not come through the synchronizer.
pub fn decode_frame(bytes: &[u8]) -> Result<TelemetrySample, TelemetryError> {
    if bytes.len() != FRAME_SIZE {
        return Err(TelemetryError::InvalidLength(bytes.len()));
    }
    let candidate = FrameCandidate::from_bytes(bytes).ok_or_else(|| {
        let mut marker = [0u8; MARKER_LEN];
        marker.copy_from_slice(&bytes[..MARKER_LEN]);
        TelemetryError::UnknownFamily(marker)
    })?;
    validate_and_decode(&candidate)
}

// ============================================================================
// Building
// ============================================================================

/// Build a request frame with an empty payload.
pub fn build_frame(family: FrameFamily, command: u8) -> [u8; FRAME_SIZE] {
    let mut frame = [0u8; FRAME_SIZE];
    frame[..MARKER_LEN].copy_from_slice(&family.marker());
    frame[COMMAND_OFFSET] = command;
    frame[STATUS_OFFSET] = STATUS_OK;
    frame[LENGTH_OFFSET] = 0;
    seal(&mut frame);
    frame
}

/// Build a frame carrying up to 55 payload bytes (zero padded).
pub fn build_frame_with_payload(
    family: FrameFamily,
    command: u8,
    status: u8,
    payload: &[u8],
) -> Result<[u8; FRAME_SIZE], TelemetryError> {
    if payload.len() > PAYLOAD_LEN {
        return Err(TelemetryError::InvalidLength(payload.len()));
    }
    let mut frame = [0u8; FRAME_SIZE];
    frame[..MARKER_LEN].copy_from_slice(&family.marker());
    frame[COMMAND_OFFSET] = command;
    frame[STATUS_OFFSET] = status;
    frame[LENGTH_OFFSET] = payload.len() as u8;
    frame[PAYLOAD_OFFSET..PAYLOAD_OFFSET + payload.len()].copy_from_slice(payload);
    seal(&mut frame);
    Ok(frame)
}

fn seal(frame: &mut [u8; FRAME_SIZE]) {
    let crc = crc16_ccitt_checksum(&frame[COMMAND_OFFSET..CRC_OFFSET]);
    frame[CRC_OFFSET..].copy_from_slice(&crc.to_be_bytes());
}

// ============================================================================
// Tests
// ============================================================================
