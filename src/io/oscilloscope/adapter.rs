// src/io/oscilloscope/adapter.rs
//
// SCPI waveform capture over a raw TCP socket (Rigol-style command set).
// All calls block; the poller runs them on the worker pool.

use serde::Serialize;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::io::error::IoError;

/// Number of analog inputs queried on every capture
pub const CHANNEL_COUNT: u8 = 4;

const DEVICE: &str = "oscilloscope";

/// Floor for the waveform block size accepted from the device
pub const MIN_BLOCK_LIMIT: usize = 1 << 20;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ChannelSettings {
    pub time_base: f64,
    pub time_offset: f64,
    pub trigger_level: f64,
    pub volts_per_div: f64,
    pub offset: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelCapture {
    pub channel: u8,
    pub time: Vec<f64>,
    pub voltage: Vec<f64>,
    pub settings: ChannelSettings,
}

/// One capture across all displayed channels.
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct OscilloscopeFrame {
    pub channels: Vec<ChannelCapture>,
}

/// Scaling parameters returned by `:WAV:PRE?`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Preamble {
    pub points: usize,
    pub x_increment: f64,
    pub x_origin: f64,
    pub x_reference: f64,
    pub y_increment: f64,
    pub y_origin: f64,
    pub y_reference: f64,
}

impl Preamble {
    /// Convert raw sample bytes into (time, voltage) vectors.
    pub fn scale(&self, samples: &[u8]) -> (Vec<f64>, Vec<f64>) {
        let time = (0..samples.len())
            .map(|i| (i as f64 - self.x_reference) * self.x_increment + self.x_origin)
            .collect();
        let voltage = samples
            .iter()
            .map(|&b| (b as f64 - self.y_origin - self.y_reference) * self.y_increment)
            .collect();
        (time, voltage)
    }
}

/// Parse the ten comma-separated preamble fields:
/// format, type, points, count, xinc, xorigin, xref, yinc, yorigin, yref.
pub fn parse_preamble(line: &str) -> Result<Preamble, IoError> {
    let fields: Vec<&str> = line.trim().split(',').map(str::trim).collect();
    if fields.len() < 10 {
        return Err(IoError::protocol(
            DEVICE,
            format!("preamble has {} fields, expected 10", fields.len()),
        ));
    }
    let num = |i: usize| -> Result<f64, IoError> {
        fields[i]
            .parse::<f64>()
            .map_err(|_| IoError::protocol(DEVICE, format!("bad preamble field {}: '{}'", i, fields[i])))
    };
    Ok(Preamble {
        points: num(2)? as usize,
        x_increment: num(4)?,
        x_origin: num(5)?,
        x_reference: num(6)?,
        y_increment: num(7)?,
        y_origin: num(8)?,
        y_reference: num(9)?,
    })
}

/// Read an IEEE 488.2 definite-length block (`#N<len><bytes>`). Blocks
/// announcing more than `max_len` bytes are refused before anything is
/// allocated for them.
pub fn read_tmc_block<R: BufRead>(reader: &mut R, max_len: usize) -> Result<Vec<u8>, IoError> {
    let read_err = |e: std::io::Error| IoError::read(DEVICE, e.to_string());

    let mut header = [0u8; 2];
    reader.read_exact(&mut header).map_err(read_err)?;
    if header[0] != b'#' || !header[1].is_ascii_digit() || header[1] == b'0' {
        return Err(IoError::protocol(
            DEVICE,
            format!("bad block header {}", hex::encode(header)),
        ));
    }
    let digits = (header[1] - b'0') as usize;
    let mut len_field = vec![0u8; digits];
    reader.read_exact(&mut len_field).map_err(read_err)?;
    let len: usize = std::str::from_utf8(&len_field)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| IoError::protocol(DEVICE, "bad block length"))?;
    if len > max_len {
        return Err(IoError::protocol(
            DEVICE,
            format!("block of {} bytes exceeds limit of {}", len, max_len),
        ));
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).map_err(read_err)?;

    // Trailing terminator
    let mut rest = String::new();
    reader.read_line(&mut rest).map_err(read_err)?;
    Ok(data)
}

// ============================================================================
// Adapter
// ============================================================================

/// Blocking access to a waveform source.
pub trait OscilloscopeAdapter: Send {
    fn capture_active_channels(&mut self) -> Result<OscilloscopeFrame, IoError>;
    fn describe(&self) -> String;
}

pub struct ScpiOscilloscope {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    address: String,
    identity: String,
    block_limit: usize,
}

impl ScpiOscilloscope {
    pub fn connect(address: &str, points: u32, timeout: Duration) -> Result<Self, IoError> {
        let socket = address
            .to_socket_addrs()
            .map_err(|e| IoError::unavailable(address, e.to_string()))?
            .next()
            .ok_or_else(|| IoError::unavailable(address, "address did not resolve"))?;
        let stream = TcpStream::connect_timeout(&socket, timeout)
            .map_err(|e| IoError::unavailable(address, e.to_string()))?;
        stream
            .set_read_timeout(Some(timeout))
            .and_then(|_| stream.set_write_timeout(Some(timeout)))
            .map_err(|e| IoError::unavailable(address, e.to_string()))?;
        let writer = stream
            .try_clone()
            .map_err(|e| IoError::unavailable(address, e.to_string()))?;

        let mut scope = Self {
            reader: BufReader::new(stream),
            writer,
            address: address.to_string(),
            identity: String::new(),
            block_limit: (points as usize).saturating_mul(2).max(MIN_BLOCK_LIMIT),
        };
        scope.identity = scope.query("*IDN?")?;
        scope.write(":WAV:FORM BYTE")?;
        scope.write(":WAV:MODE NORM")?;
        scope.write(&format!(":WAV:POIN {}", points))?;
        tlog!("[oscilloscope] Connected to {} ({})", scope.address, scope.identity);
        Ok(scope)
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    fn write(&mut self, command: &str) -> Result<(), IoError> {
        self.writer
            .write_all(command.as_bytes())
            .and_then(|_| self.writer.write_all(b"\n"))
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                    IoError::timeout(&self.address, command)
                }
                _ => IoError::write(&self.address, e.to_string()),
            })
    }

    fn query(&mut self, command: &str) -> Result<String, IoError> {
        self.write(command)?;
        let mut line = String::new();
        match self.reader.read_line(&mut line) {
            Ok(0) => Err(IoError::read(&self.address, "connection closed")),
            Ok(_) => Ok(line.trim().to_string()),
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
                ) =>
            {
                Err(IoError::timeout(&self.address, command))
            }
            Err(e) => Err(IoError::read(&self.address, e.to_string())),
        }
    }

    fn query_f64(&mut self, command: &str) -> Result<f64, IoError> {
        let reply = self.query(command)?;
        reply
            .parse()
            .map_err(|_| IoError::protocol(&self.address, format!("{} returned '{}'", command, reply)))
    }

    fn capture_channel(&mut self, channel: u8) -> Result<ChannelCapture, IoError> {
        self.write(&format!(":WAV:SOUR CHAN{}", channel))?;
        let preamble = parse_preamble(&self.query(":WAV:PRE?")?)?;
        self.write(":WAV:DATA?")?;
        let samples = read_tmc_block(&mut self.reader, self.block_limit)?;
        if samples.len() != preamble.points {
            tlog!(
                "[oscilloscope] CHAN{}: preamble announced {} points, block held {}",
                channel,
                preamble.points,
                samples.len()
            );
        }
        let (time, voltage) = preamble.scale(&samples);

        let settings = ChannelSettings {
            time_base: self.query_f64(":TIM:SCAL?")?,
            time_offset: self.query_f64(":TIM:OFFS?")?,
            trigger_level: self.query_f64(":TRIG:EDGE:LEV?")?,
            volts_per_div: self.query_f64(&format!(":CHAN{}:SCAL?", channel))?,
            offset: self.query_f64(&format!(":CHAN{}:OFFS?", channel))?,
        };
        Ok(ChannelCapture { channel, time, voltage, settings })
    }
}

impl OscilloscopeAdapter for ScpiOscilloscope {
    fn capture_active_channels(&mut self) -> Result<OscilloscopeFrame, IoError> {
        let mut frame = OscilloscopeFrame::default();
        for channel in 1..=CHANNEL_COUNT {
            let displayed = self.query(&format!(":CHAN{}:DISP?", channel))?;
            if displayed == "1" || displayed.eq_ignore_ascii_case("ON") {
                frame.channels.push(self.capture_channel(channel)?);
            }
        }
        Ok(frame)
    }

    fn describe(&self) -> String {
        format!("{} ({})", self.address, self.identity)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::net::TcpListener;

    const PREAMBLE: &str = "0,0,4,1,1.000000e-03,-2.000000e-03,0,4.000000e-02,0,127\n";

    #[test]
    fn test_parse_preamble() {
        let preamble = parse_preamble(PREAMBLE).unwrap();
        assert_eq!(preamble.points, 4);
        assert_eq!(preamble.x_increment, 0.001);
        assert_eq!(preamble.x_origin, -0.002);
        assert_eq!(preamble.y_reference, 127.0);

        assert!(parse_preamble("0,0,4").is_err());
        assert!(parse_preamble("0,0,x,1,1,1,1,1,1,1").is_err());
    }

    #[test]
    fn test_scale_samples() {
        let preamble = parse_preamble(PREAMBLE).unwrap();
        let (time, voltage) = preamble.scale(&[127, 152, 102, 127]);
        assert_eq!(time.len(), 4);
        assert!((time[0] + 0.002).abs() < 1e-12);
        assert!((time[3] - 0.001).abs() < 1e-12);
        assert_eq!(voltage[0], 0.0);
        assert!((voltage[1] - 1.0).abs() < 1e-9);
        assert!((voltage[2] + 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_read_tmc_block() {
        let mut cursor = Cursor::new(b"#9000000004\x01\x02\x03\x04\n*next".to_vec());
        assert_eq!(read_tmc_block(&mut cursor, 16).unwrap(), vec![1, 2, 3, 4]);
        let mut rest = String::new();
        cursor.read_to_string(&mut rest).unwrap();
        assert_eq!(rest, "*next");

        let mut short = Cursor::new(b"#14ab".to_vec());
        assert!(read_tmc_block(&mut short, 16).is_err());
        let mut bad = Cursor::new(b"X14abcd\n".to_vec());
        assert!(matches!(read_tmc_block(&mut bad, 16), Err(IoError::Protocol { .. })));
    }

    #[test]
    fn test_read_tmc_block_refuses_oversized_length() {
        let mut huge = Cursor::new(b"#9999999999\x01\x02".to_vec());
        match read_tmc_block(&mut huge, MIN_BLOCK_LIMIT) {
            Err(IoError::Protocol { reason, .. }) => assert!(reason.contains("999999999")),
            other => panic!("expected protocol error, got {:?}", other),
        }

        let mut at_limit = Cursor::new(b"#14\x01\x02\x03\x04\n".to_vec());
        assert_eq!(read_tmc_block(&mut at_limit, 4).unwrap().len(), 4);
        let mut over = Cursor::new(b"#15\x01\x02\x03\x04\x05\n".to_vec());
        assert!(matches!(read_tmc_block(&mut over, 4), Err(IoError::Protocol { .. })));
    }

    /// Minimal SCPI responder with channel 2 displayed.
    fn spawn_fake_scope() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut writer = stream.try_clone().unwrap();
            let reader = BufReader::new(stream);
            for line in reader.lines() {
                let Ok(line) = line else { break };
                let reply: Option<Vec<u8>> = match line.as_str() {
                    "*IDN?" => Some(b"RIGOL TECHNOLOGIES,DS1104Z,FAKE,00.04\n".to_vec()),
                    ":CHAN2:DISP?" => Some(b"1\n".to_vec()),
                    l if l.ends_with(":DISP?") => Some(b"0\n".to_vec()),
                    ":WAV:PRE?" => Some(PREAMBLE.as_bytes().to_vec()),
                    ":WAV:DATA?" => Some(b"#14\x7F\x98\x66\x7F\n".to_vec()),
                    ":TIM:SCAL?" => Some(b"5.0e-04\n".to_vec()),
                    ":TIM:OFFS?" => Some(b"0.0\n".to_vec()),
                    ":TRIG:EDGE:LEV?" => Some(b"1.5\n".to_vec()),
                    ":CHAN2:SCAL?" => Some(b"0.5\n".to_vec()),
                    ":CHAN2:OFFS?" => Some(b"-0.25\n".to_vec()),
                    _ => None,
                };
                if let Some(reply) = reply {
                    writer.write_all(&reply).unwrap();
                }
            }
        });
        address
    }

    #[test]
    fn test_capture_over_tcp() {
        let address = spawn_fake_scope();
        let mut scope = ScpiOscilloscope::connect(&address, 1200, Duration::from_secs(2)).unwrap();
        assert!(scope.identity().starts_with("RIGOL"));

        let frame = scope.capture_active_channels().unwrap();
        assert_eq!(frame.channels.len(), 1);
        let capture = &frame.channels[0];
        assert_eq!(capture.channel, 2);
        assert_eq!(capture.voltage.len(), 4);
        assert!((capture.voltage[1] - 1.0).abs() < 1e-9);
        assert_eq!(capture.settings.volts_per_div, 0.5);
        assert_eq!(capture.settings.offset, -0.25);
        assert_eq!(capture.settings.trigger_level, 1.5);

        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["channels"][0]["settings"]["time_base"], 0.0005);
    }

    #[test]
    fn test_connect_refused_is_unavailable() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);
        let err = ScpiOscilloscope::connect(&address, 1200, Duration::from_millis(200)).err().unwrap();
        assert!(matches!(err, IoError::DeviceUnavailable { .. }));
    }
}
