// src/io/mod.rs
//
// Device abstraction for bench instruments.
// Each device family owns one connection and produces normalized readings
// that flow to the daemon loop as `SourceMessage`s.

pub mod error;
pub mod multimeter;
pub mod oscilloscope;
pub mod serial;
pub mod types;
pub mod uart;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;

pub use error::IoError;
pub use multimeter::MultimeterSample;
pub use oscilloscope::OscilloscopeFrame;
pub use types::SourceMessage;
pub use uart::TelemetrySample;

// ============================================================================
// Readings
// ============================================================================

/// Get current time in microseconds since UNIX epoch
pub fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Local wall-clock rendering used in client payloads.
pub fn format_timestamp_us(timestamp_us: u64) -> String {
    chrono::DateTime::from_timestamp_micros(timestamp_us as i64)
        .map(|dt| {
            dt.with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M:%S%.3f")
                .to_string()
        })
        .unwrap_or_default()
}

/// Which physical instrument a reading or poller belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    #[serde(alias = "telemetry")]
    Uart,
    Multimeter,
    Oscilloscope,
}

impl DeviceKind {
    pub const ALL: [DeviceKind; 3] = [DeviceKind::Uart, DeviceKind::Multimeter, DeviceKind::Oscilloscope];

    pub fn name(self) -> &'static str {
        match self {
            DeviceKind::Uart => "uart",
            DeviceKind::Multimeter => "multimeter",
            DeviceKind::Oscilloscope => "oscilloscope",
        }
    }

    /// Storage partition family for this device's readings.
    pub fn partition_prefix(self) -> &'static str {
        match self {
            DeviceKind::Uart => "telemetry",
            DeviceKind::Multimeter => "multimeter",
            DeviceKind::Oscilloscope => "oscilloscope",
        }
    }
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReadingPayload {
    Telemetry(TelemetrySample),
    Multimeter(MultimeterSample),
    Oscilloscope(OscilloscopeFrame),
}

/// A normalized, immutable measurement with its capture time.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub timestamp_us: u64,
    pub payload: ReadingPayload,
}

impl Reading {
    pub fn new(payload: ReadingPayload) -> Self {
        Self::at(now_us(), payload)
    }

    pub fn at(timestamp_us: u64, payload: ReadingPayload) -> Self {
        Self { timestamp_us, payload }
    }

    pub fn device(&self) -> DeviceKind {
        match self.payload {
            ReadingPayload::Telemetry(_) => DeviceKind::Uart,
            ReadingPayload::Multimeter(_) => DeviceKind::Multimeter,
            ReadingPayload::Oscilloscope(_) => DeviceKind::Oscilloscope,
        }
    }

    /// Message envelope sent to subscribers. Also the stored row document.
    pub fn to_envelope(&self) -> serde_json::Value {
        match &self.payload {
            ReadingPayload::Telemetry(sample) => {
                let mut data = serde_json::to_value(sample).unwrap_or_default();
                if let serde_json::Value::Object(ref mut map) = data {
                    map.insert("timestamp_us".into(), self.timestamp_us.into());
                }
                serde_json::json!({ "type": "sensor_data", "data": data })
            }
            ReadingPayload::Multimeter(sample) => {
                let mut data = serde_json::to_value(sample).unwrap_or_default();
                if let serde_json::Value::Object(ref mut map) = data {
                    map.insert("timestamp".into(), format_timestamp_us(self.timestamp_us).into());
                    map.insert("timestamp_us".into(), self.timestamp_us.into());
                }
                serde_json::json!({ "type": "multimeter", "data": data })
            }
            ReadingPayload::Oscilloscope(frame) => serde_json::json!({
                "type": "oscilloscope",
                "timestamp_us": self.timestamp_us,
                "channels": frame.channels,
            }),
        }
    }
}

// ============================================================================
// Pollers
// ============================================================================

/// Current state of a device poller
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "message")]
pub enum PollerState {
    Stopped,
    Running,
}

/// Trait for all device pollers (UART listener, multimeter, oscilloscope).
#[async_trait]
pub trait DevicePoller: Send {
    fn kind(&self) -> DeviceKind;

    /// Start polling. Returns false if it was already running.
    async fn start(&mut self) -> bool;

    /// Clear the run flag. Returns false if it was already stopped.
    /// The poller releases its device on its next loop iteration.
    fn stop(&mut self) -> bool;

    fn state(&self) -> PollerState;
}

/// Run flag plus task handle shared by every poller implementation.
/// Each run gets a fresh flag so a draining task can never be revived.
pub struct PollerTask {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Default for PollerTask {
    fn default() -> Self {
        Self::new()
    }
}

impl PollerTask {
    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
            && self.handle.as_ref().map(|h| !h.is_finished()).unwrap_or(false)
    }

    /// Spawn `run` with a fresh run flag. The previous task (if any) is
    /// awaited first so only one task ever holds the device.
    pub async fn spawn<F, Fut>(&mut self, run: F) -> bool
    where
        F: FnOnce(Arc<AtomicBool>) -> Fut + Send,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.is_running() {
            return false;
        }
        self.running.store(false, Ordering::Relaxed);
        if let Some(previous) = self.handle.take() {
            let _ = previous.await;
        }
        let flag = Arc::new(AtomicBool::new(true));
        self.running = flag.clone();
        self.handle = Some(tokio::spawn(run(flag)));
        true
    }

    pub fn stop(&mut self) -> bool {
        let was_running = self.is_running();
        self.running.store(false, Ordering::Relaxed);
        was_running
    }

    pub fn state(&self) -> PollerState {
        if self.is_running() {
            PollerState::Running
        } else {
            PollerState::Stopped
        }
    }
}

/// Exponential reconnect delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max, current: initial }
    }

    pub fn from_settings(settings: &crate::settings::RetrySettings) -> Self {
        Self::new(
            Duration::from_millis(settings.initial_backoff_ms),
            Duration::from_millis(settings.max_backoff_ms),
        )
    }

    /// Delay to wait now; doubles the next one up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Sleep in short slices on a worker thread, returning early once the flag clears.
pub fn sleep_while_running(running: &AtomicBool, total: Duration) {
    let slice = Duration::from_millis(20);
    let deadline = std::time::Instant::now() + total;
    while running.load(Ordering::Relaxed) {
        let now = std::time::Instant::now();
        if now >= deadline {
            break;
        }
        std::thread::sleep(slice.min(deadline - now));
    }
}

/// Async counterpart of [`sleep_while_running`].
pub async fn sleep_while_running_async(running: &AtomicBool, total: Duration) {
    let slice = Duration::from_millis(20);
    let deadline = tokio::time::Instant::now() + total;
    while running.load(Ordering::Relaxed) {
        let now = tokio::time::Instant::now();
        if now >= deadline {
            break;
        }
        tokio::time::sleep(slice.min(deadline - now)).await;
    }
}

// ============================================================================
// Tests
// ============================================================================
