// src/io/serial/utils.rs
//
// Serial line settings and port opening shared by the UART listener
// and the multimeter link.

use serde::{Deserialize, Serialize};
use serialport::{DataBits, Parity as SpParity, SerialPort, StopBits};
use std::time::Duration;

use crate::io::error::IoError;

// ============================================================================
// Types
// ============================================================================

/// Parity setting for serial port configuration
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

/// Everything needed to open one serial line.
#[derive(Clone, Debug, PartialEq)]
pub struct SerialLineConfig {
    pub port: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub parity: Parity,
    pub stop_bits: u8,
    pub timeout: Duration,
    /// Modem control lines to drive after opening (DTR, RTS)
    pub dtr: Option<bool>,
    pub rts: Option<bool>,
}

impl SerialLineConfig {
    /// 8N1 with no modem line changes.
    pub fn new(port: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port: port.into(),
            baud_rate,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: 1,
            timeout: Duration::from_millis(50),
            dtr: None,
            rts: None,
        }
    }

    /// Short "19200 7-O-1" style description for log lines.
    pub fn describe(&self) -> String {
        format!(
            "{} at {} baud ({}-{}-{})",
            self.port,
            self.baud_rate,
            self.data_bits,
            match self.parity {
                Parity::None => 'N',
                Parity::Odd => 'O',
                Parity::Even => 'E',
            },
            self.stop_bits
        )
    }
}

// ============================================================================
// Line Parameters
// ============================================================================

impl From<Parity> for SpParity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => SpParity::None,
            Parity::Odd => SpParity::Odd,
            Parity::Even => SpParity::Even,
        }
    }
}

impl SerialLineConfig {
    /// Framing as the serialport crate wants it. Values a UART cannot do
    /// (9 data bits, 0 stop bits) are refused instead of rounded.
    fn framing(&self) -> Result<(DataBits, StopBits), IoError> {
        let data_bits = match self.data_bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            8 => DataBits::Eight,
            other => {
                return Err(IoError::unavailable(&self.port, format!("unsupported data bits {}", other)))
            }
        };
        let stop_bits = match self.stop_bits {
            1 => StopBits::One,
            2 => StopBits::Two,
            other => {
                return Err(IoError::unavailable(&self.port, format!("unsupported stop bits {}", other)))
            }
        };
        Ok((data_bits, stop_bits))
    }
}

// ============================================================================
// Port Access
// ============================================================================

/// Open and configure a serial port. Blocking; call from a worker thread.
pub fn open_serial(config: &SerialLineConfig) -> Result<Box<dyn SerialPort>, IoError> {
    let (data_bits, stop_bits) = config.framing()?;
    let mut port = serialport::new(&config.port, config.baud_rate)
        .data_bits(data_bits)
        .stop_bits(stop_bits)
        .parity(config.parity.into())
        .timeout(config.timeout)
        .open()
        .map_err(|e| IoError::unavailable(&config.port, e.to_string()))?;

    if let Some(level) = config.dtr {
        port.write_data_terminal_ready(level)
            .map_err(|e| IoError::unavailable(&config.port, format!("set DTR: {}", e)))?;
    }
    if let Some(level) = config.rts {
        port.write_request_to_send(level)
            .map_err(|e| IoError::unavailable(&config.port, format!("set RTS: {}", e)))?;
    }
    port.clear(serialport::ClearBuffer::All)
        .map_err(|e| IoError::unavailable(&config.port, format!("clear buffers: {}", e)))?;

    Ok(port)
}

/// First enumerated port whose name mentions USB (USB-to-RS232 adapters).
pub fn find_usb_port() -> Option<String> {
    let ports = serialport::available_ports().ok()?;
    pick_usb_port(ports.iter().map(|p| p.port_name.as_str()))
}

fn pick_usb_port<'a>(names: impl Iterator<Item = &'a str>) -> Option<String> {
    names
        .into_iter()
        .find(|name| name.to_uppercase().contains("USB"))
        .map(str::to_string)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parity_from_settings() {
        assert_eq!(Parity::default(), Parity::None);
        let parsed: Parity = serde_json::from_str("\"odd\"").unwrap();
        assert!(matches!(SpParity::from(parsed), SpParity::Odd));
        assert!(matches!(SpParity::from(Parity::Even), SpParity::Even));
    }

    #[test]
    fn test_framing_accepts_meter_line_and_refuses_nonsense() {
        let mut config = SerialLineConfig::new("/dev/ttyUSB0", 19_200);
        config.data_bits = 7;
        config.parity = Parity::Odd;
        let (data_bits, stop_bits) = config.framing().unwrap();
        assert!(matches!(data_bits, DataBits::Seven));
        assert!(matches!(stop_bits, StopBits::One));

        config.data_bits = 9;
        assert!(matches!(config.framing(), Err(IoError::DeviceUnavailable { .. })));
        config.data_bits = 8;
        config.stop_bits = 0;
        let err = config.framing().unwrap_err();
        assert!(err.to_string().contains("unsupported stop bits 0"));
    }

    #[test]
    fn test_describe_line() {
        let mut config = SerialLineConfig::new("/dev/ttyUSB0", 19_200);
        config.data_bits = 7;
        config.parity = Parity::Odd;
        assert_eq!(config.describe(), "/dev/ttyUSB0 at 19200 baud (7-O-1)");
    }

    #[test]
    fn test_pick_usb_port() {
        let names = ["/dev/ttyS0", "/dev/ttyUSB3", "/dev/ttyUSB0"];
        assert_eq!(pick_usb_port(names.into_iter()), Some("/dev/ttyUSB3".to_string()));
        assert_eq!(pick_usb_port(["COM1"].into_iter()), None);
    }
}
