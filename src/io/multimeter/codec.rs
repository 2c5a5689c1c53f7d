// src/io/multimeter/codec.rs
//
// UT803 multimeter packet decoding. Two wire formats share one entry point:
// the 11-byte binary "super-decimal" packet and the legacy `value;code`
// ASCII line.

use serde::Serialize;
use thiserror::Error;

/// Length of a binary super-decimal packet
pub const PACKET_LEN: usize = 11;

/// Overload sentinel reported in place of a numeric value
pub const OVERLOAD: &str = "OL";

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MultimeterError {
    #[error("unknown data format: {0}")]
    UnknownFormat(String),
    #[error("unknown measurement type '{0}'")]
    UnknownMeasurementKind(char),
    #[error("invalid binary packet length {0}")]
    InvalidPacketLength(usize),
}

/// Raw sample as it came off the link.
#[derive(Debug, Clone, Copy)]
pub enum DecoderInput<'a> {
    Bytes(&'a [u8]),
    Text(&'a str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MeasurementKind {
    Diode,
    Frequency,
    Resistance,
    Temperature,
    Continuity,
    Capacitance,
    Current,
    Voltage,
    Hfe,
}

impl MeasurementKind {
    /// Human-readable name sent to clients as `measure_type`.
    pub fn label(self) -> &'static str {
        match self {
            MeasurementKind::Diode => "Diode Test",
            MeasurementKind::Frequency => "Frequency",
            MeasurementKind::Resistance => "Resistance",
            MeasurementKind::Temperature => "Temperature",
            MeasurementKind::Continuity => "Continuity",
            MeasurementKind::Capacitance => "Capacitance",
            MeasurementKind::Current => "Current",
            MeasurementKind::Voltage => "Voltage",
            MeasurementKind::Hfe => "hFE",
        }
    }
}

/// Entry of the measurement-type table: kind, unit and decimal offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TypeInfo {
    kind: MeasurementKind,
    unit: &'static str,
    offset: i32,
}

fn type_info(type_char: char) -> Option<TypeInfo> {
    use MeasurementKind::*;
    let (kind, unit, offset) = match type_char {
        '1' => (Diode, "V", 0),
        '2' => (Frequency, "Hz", 0),
        '3' => (Resistance, "Ω", 1),
        '4' => (Temperature, "°C", 0),
        '5' => (Continuity, "Ω", 1),
        '6' => (Capacitance, "nF", 12),
        '9' => (Current, "A", 2),
        ';' => (Voltage, "V", 3),
        '=' => (Current, "µA", 1),
        '|' => (Hfe, "", 0),
        '>' => (Current, "mA", 2),
        _ => return None,
    };
    Some(TypeInfo { kind, unit, offset })
}

/// Decoded fields kept alongside the normalized value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MultimeterRaw {
    Binary {
        packet: Vec<u8>,
        exponent: u8,
        base_value: u32,
        measurement_type: char,
        flags: [u8; 3],
        is_negative: bool,
        is_overload: bool,
        is_auto_range: bool,
        is_ac: bool,
        is_dc: bool,
    },
    Ascii {
        text: String,
        function_code: String,
    },
}

/// Normalized multimeter measurement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MultimeterSample {
    /// Formatted value, or `OL` on overload
    pub value: String,
    pub unit: String,
    pub mode: String,
    pub range_str: String,
    pub measure_type: String,
    #[serde(skip)]
    pub kind: MeasurementKind,
    pub raw_data: MultimeterRaw,
}

impl MultimeterSample {
    pub fn is_overload(&self) -> bool {
        self.value == OVERLOAD
    }
}

// ============================================================================
// Decoding
// ============================================================================

/// Decode a sample in either wire format.
pub fn decode(input: &DecoderInput<'_>) -> Result<MultimeterSample, MultimeterError> {
    match *input {
        DecoderInput::Bytes(bytes) if bytes.len() == PACKET_LEN => decode_packet(bytes),
        DecoderInput::Text(text) => {
            if text.chars().count() == PACKET_LEN && text.chars().all(|c| (c as u32) <= 0xFF) {
                let bytes: Vec<u8> = text.chars().map(|c| c as u32 as u8).collect();
                return decode_packet(&bytes);
            }
            if text.contains(';') {
                return decode_ascii(text);
            }
            Err(MultimeterError::UnknownFormat("no packet and no ';' separator".into()))
        }
        DecoderInput::Bytes(bytes) => {
            let text: String = bytes.iter().filter(|b| b.is_ascii()).map(|&b| b as char).collect();
            let text = text.trim();
            if text.contains(';') {
                decode_ascii(text)
            } else {
                Err(MultimeterError::UnknownFormat(format!(
                    "{} bytes without ';' separator",
                    bytes.len()
                )))
            }
        }
    }
}

/// Super-decimal digit. Two overlapping encodings are seen in the field.
fn sd(b: u8) -> u8 {
    match b {
        0x30..=0x3F => b - 0x30,
        0x0A..=0x29 => b - 0x0A,
        _ => 0,
    }
}

/// Decode the 11-byte binary packet.
pub fn decode_packet(packet: &[u8]) -> Result<MultimeterSample, MultimeterError> {
    if packet.len() != PACKET_LEN {
        return Err(MultimeterError::InvalidPacketLength(packet.len()));
    }

    let exponent = sd(packet[0]);
    let base_value = packet[1..5]
        .iter()
        .fold(0u32, |acc, &b| acc * 10 + sd(b) as u32);
    let type_char = if (32..=127).contains(&packet[5]) { packet[5] as char } else { '?' };
    let flags = [sd(packet[6]), sd(packet[7]), sd(packet[8])];

    let info = type_info(type_char).ok_or(MultimeterError::UnknownMeasurementKind(type_char))?;

    let is_negative = flags[0] & 0x4 != 0;
    let is_overload = flags[0] & 0x1 != 0;
    let is_auto_range = flags[2] & 0x2 != 0;
    let is_ac = flags[2] & 0x4 != 0;
    let is_dc = flags[2] & 0x8 != 0;

    let mut value = if info.kind == MeasurementKind::Capacitance {
        base_value as f64 / 1000.0
    } else {
        base_value as f64 * 10f64.powi(exponent as i32 - info.offset)
    };
    if is_negative {
        value = -value;
    }

    let mode = match info.kind {
        MeasurementKind::Voltage | MeasurementKind::Current if is_ac => "AC",
        MeasurementKind::Temperature => "°C",
        _ => "DC",
    };

    Ok(MultimeterSample {
        value: if is_overload { OVERLOAD.to_string() } else { format_value(value) },
        unit: info.unit.to_string(),
        mode: mode.to_string(),
        range_str: if is_auto_range { "AUTO" } else { "MANUAL" }.to_string(),
        measure_type: info.kind.label().to_string(),
        kind: info.kind,
        raw_data: MultimeterRaw::Binary {
            packet: packet.to_vec(),
            exponent,
            base_value,
            measurement_type: type_char,
            flags,
            is_negative,
            is_overload,
            is_auto_range,
            is_ac,
            is_dc,
        },
    })
}

/// Decode a legacy `value;function_code` line. Only the voltage function
/// family (codes starting with `8`) is defined for this format.
pub fn decode_ascii(text: &str) -> Result<MultimeterSample, MultimeterError> {
    let text = text.trim();
    let parts: Vec<&str> = text.split(';').collect();
    if parts.len() != 2 {
        return Err(MultimeterError::UnknownFormat(format!(
            "expected 2 fields, got {}",
            parts.len()
        )));
    }

    let value_field = parts[0].trim_matches('@');
    let function_code = parts[1];
    if !function_code.starts_with('8') {
        return Err(MultimeterError::UnknownFormat(format!(
            "unsupported function code '{}'",
            function_code
        )));
    }

    let value = if value_field.starts_with('?') {
        OVERLOAD.to_string()
    } else {
        let raw: f64 = value_field.trim().parse().map_err(|_| {
            MultimeterError::UnknownFormat(format!("invalid value '{}'", value_field))
        })?;
        format!("{:.3}", raw / 1000.0)
    };

    let mode = if function_code.contains("06") { "AC" } else { "DC" };

    Ok(MultimeterSample {
        value,
        unit: "V".to_string(),
        mode: mode.to_string(),
        range_str: "AUTO".to_string(),
        measure_type: MeasurementKind::Voltage.label().to_string(),
        kind: MeasurementKind::Voltage,
        raw_data: MultimeterRaw::Ascii {
            text: text.to_string(),
            function_code: function_code.to_string(),
        },
    })
}

/// Six decimals with trailing zeros (and a bare point) removed.
fn format_value(value: f64) -> String {
    let formatted = format!("{:.6}", value);
    let trimmed = formatted.trim_end_matches('0').trim_end_matches('.');
    if trimmed == "-0" {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

// ============================================================================
// Tests
// ============================================================================
