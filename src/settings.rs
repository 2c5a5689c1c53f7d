// src/settings.rs
//
// Daemon configuration, loaded from a TOML file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::io::serial::Parity;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ServerSettings {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct StorageSettings {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_database_file")]
    pub database_file: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct UartSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Candidate ports, tried in order
    #[serde(default = "default_uart_ports")]
    pub ports: Vec<String>,
    #[serde(default = "default_uart_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_request_interval_ms")]
    pub request_interval_ms: u64,
    #[serde(default = "default_warmup_ms")]
    pub warmup_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct MultimeterSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Serial port path, or "auto" to pick the first USB serial adapter
    #[serde(default = "default_multimeter_port")]
    pub port: String,
    #[serde(default = "default_multimeter_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_multimeter_data_bits")]
    pub data_bits: u8,
    #[serde(default = "default_multimeter_parity")]
    pub parity: Parity,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    #[serde(default = "default_sample_delay_ms")]
    pub sample_delay_ms: u64,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct OscilloscopeSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// SCPI socket address, e.g. "192.168.1.50:5555". None = not configured.
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default = "default_osc_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_osc_points")]
    pub points: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RetrySettings {
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct LoggingSettings {
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    /// Run logs kept in `log_dir`; older ones are deleted at startup
    #[serde(default = "default_keep_log_files")]
    pub keep_files: usize,
}

fn default_keep_log_files() -> usize {
    20
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            log_dir: None,
            keep_files: default_keep_log_files(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct DaemonSettings {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub uart: UartSettings,
    #[serde(default)]
    pub multimeter: MultimeterSettings,
    #[serde(default)]
    pub oscilloscope: OscilloscopeSettings,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

fn default_true() -> bool {
    true
}
fn default_bind_address() -> String {
    "0.0.0.0:8767".to_string()
}
fn default_send_timeout_ms() -> u64 {
    2000
}
fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("benchtap")
}
fn default_database_file() -> String {
    "benchtap.db".to_string()
}
fn default_uart_ports() -> Vec<String> {
    vec!["/dev/ttyUSB1".to_string(), "/dev/ttyUSB0".to_string()]
}
fn default_uart_baud_rate() -> u32 {
    115_200
}
fn default_request_interval_ms() -> u64 {
    1000
}
fn default_warmup_ms() -> u64 {
    5000
}
fn default_multimeter_port() -> String {
    "/dev/ttyUSB0".to_string()
}
fn default_multimeter_baud_rate() -> u32 {
    19_200
}
fn default_multimeter_data_bits() -> u8 {
    7
}
fn default_multimeter_parity() -> Parity {
    Parity::Odd
}
fn default_stop_bits() -> u8 {
    1
}
fn default_sample_delay_ms() -> u64 {
    20
}
fn default_read_timeout_ms() -> u64 {
    1000
}
fn default_osc_interval_ms() -> u64 {
    100
}
fn default_osc_points() -> u32 {
    1200
}
fn default_initial_backoff_ms() -> u64 {
    500
}
fn default_max_backoff_ms() -> u64 {
    10_000
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            send_timeout_ms: default_send_timeout_ms(),
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            database_file: default_database_file(),
        }
    }
}

impl Default for UartSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            ports: default_uart_ports(),
            baud_rate: default_uart_baud_rate(),
            request_interval_ms: default_request_interval_ms(),
            warmup_ms: default_warmup_ms(),
        }
    }
}

impl Default for MultimeterSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_multimeter_port(),
            baud_rate: default_multimeter_baud_rate(),
            data_bits: default_multimeter_data_bits(),
            parity: default_multimeter_parity(),
            stop_bits: default_stop_bits(),
            sample_delay_ms: default_sample_delay_ms(),
            read_timeout_ms: default_read_timeout_ms(),
        }
    }
}

impl Default for OscilloscopeSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            address: None,
            interval_ms: default_osc_interval_ms(),
            points: default_osc_points(),
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            storage: StorageSettings::default(),
            uart: UartSettings::default(),
            multimeter: MultimeterSettings::default(),
            oscilloscope: OscilloscopeSettings::default(),
            retry: RetrySettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl DaemonSettings {
    /// Full path of the SQLite database file.
    pub fn database_path(&self) -> PathBuf {
        self.storage.data_dir.join(&self.storage.database_file)
    }
}

/// Default config location: `<config dir>/benchtap/benchtap.toml`.
pub fn default_settings_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("benchtap")
        .join("benchtap.toml")
}

pub fn parse_settings(content: &str) -> Result<DaemonSettings, String> {
    toml::from_str(content).map_err(|e| format!("Failed to parse settings: {}", e))
}

/// Load settings from `path`. On first run the defaults are written out.
pub fn load_settings(path: &Path) -> Result<DaemonSettings, String> {
    if path.exists() {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read settings: {}", e))?;
        parse_settings(&content)
    } else {
        let settings = DaemonSettings::default();
        save_settings(path, &settings)?;
        tlog!("[settings] Wrote default settings to {:?}", path);
        Ok(settings)
    }
}

pub fn save_settings(path: &Path, settings: &DaemonSettings) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create settings dir: {}", e))?;
    }
    let content = toml::to_string_pretty(settings)
        .map_err(|e| format!("Failed to serialize settings: {}", e))?;
    std::fs::write(path, content).map_err(|e| format!("Failed to write settings: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_yields_defaults() {
        let settings = parse_settings("").unwrap();
        assert_eq!(settings, DaemonSettings::default());
        assert_eq!(settings.multimeter.baud_rate, 19_200);
        assert_eq!(settings.multimeter.parity, Parity::Odd);
        assert_eq!(settings.oscilloscope.interval_ms, 100);
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let settings = parse_settings(
            r#"
            [uart]
            ports = ["/dev/ttyACM0"]

            [oscilloscope]
            address = "10.0.0.5:5555"
            "#,
        )
        .unwrap();
        assert_eq!(settings.uart.ports, vec!["/dev/ttyACM0".to_string()]);
        assert_eq!(settings.uart.baud_rate, 115_200);
        assert_eq!(settings.oscilloscope.address.as_deref(), Some("10.0.0.5:5555"));
        assert_eq!(settings.server.bind_address, "0.0.0.0:8767");
    }

    #[test]
    fn test_load_writes_defaults_on_first_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("benchtap.toml");
        let settings = load_settings(&path).unwrap();
        assert!(path.exists());
        assert_eq!(load_settings(&path).unwrap(), settings);
    }

    #[test]
    fn test_invalid_toml_is_reported() {
        let err = parse_settings("[server\nbind_address = 1").unwrap_err();
        assert!(err.starts_with("Failed to parse settings"));
    }
}
