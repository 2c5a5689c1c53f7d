// src/io/uart/listener.rs
//
// UART telemetry listener. Owns the link, writes periodic request frames,
// feeds received bytes through the synchronizer and forwards decoded
// samples to the daemon loop.

use async_trait::async_trait;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use super::codec::{build_frame, constants::CMD_READ, constants::CMD_START, validate_and_decode};
use super::codec::{TelemetryError, TelemetrySample};
use super::framer::{FrameFamily, FrameSynchronizer, FRAME_SIZE};
use crate::io::error::IoError;
use crate::io::serial::{open_serial, SerialLineConfig};
use crate::io::types::SourceMessage;
use crate::io::{
    sleep_while_running, Backoff, DeviceKind, DevicePoller, PollerState, PollerTask, Reading,
    ReadingPayload,
};
use crate::settings::{RetrySettings, UartSettings};

// ============================================================================
// Link
// ============================================================================

/// Raw byte link to the microcontroller. Blocking; driven from a worker thread.
pub trait UartLink: Send {
    /// Read available bytes. `Ok(0)` means nothing arrived before the timeout.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, IoError>;
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), IoError>;
    fn describe(&self) -> String;
}

pub type UartOpener = Arc<dyn Fn() -> Result<Box<dyn UartLink>, IoError> + Send + Sync>;

pub struct SerialUartLink {
    port: Box<dyn serialport::SerialPort>,
    name: String,
}

impl UartLink for SerialUartLink {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, IoError> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(IoError::read(&self.name, e.to_string())),
        }
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), IoError> {
        self.port
            .write_all(bytes)
            .and_then(|_| self.port.flush())
            .map_err(|e| IoError::write(&self.name, e.to_string()))
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}

/// Opener that tries each configured port in order.
pub fn serial_opener(settings: &UartSettings) -> UartOpener {
    let ports = settings.ports.clone();
    let baud_rate = settings.baud_rate;
    Arc::new(move || {
        let mut last_error = IoError::unavailable("uart", "no ports configured");
        for port in &ports {
            let config = SerialLineConfig::new(port.as_str(), baud_rate);
            match open_serial(&config) {
                Ok(handle) => {
                    return Ok(Box::new(SerialUartLink {
                        port: handle,
                        name: config.describe(),
                    }) as Box<dyn UartLink>)
                }
                Err(e) => last_error = e,
            }
        }
        Err(last_error)
    })
}

// ============================================================================
// Request scheduling
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestSchedule {
    /// Wait after the start command before the first read request
    pub warmup: Duration,
    /// Time between read request rounds
    pub interval: Duration,
}

impl RequestSchedule {
    pub fn from_settings(settings: &UartSettings) -> Self {
        Self {
            warmup: Duration::from_millis(settings.warmup_ms),
            interval: Duration::from_millis(settings.request_interval_ms),
        }
    }
}

/// Emits the start command once, then a round of read requests per interval.
struct RequestScheduler {
    schedule: RequestSchedule,
    next_at: Option<Instant>,
}

impl RequestScheduler {
    fn new(schedule: RequestSchedule) -> Self {
        Self { schedule, next_at: None }
    }

    fn due(&mut self, now: Instant) -> Vec<[u8; FRAME_SIZE]> {
        match self.next_at {
            None => {
                self.next_at = Some(now + self.schedule.warmup);
                vec![build_frame(FrameFamily::Temperature, CMD_START)]
            }
            Some(at) if now >= at => {
                self.next_at = Some(now + self.schedule.interval);
                [FrameFamily::Temperature, FrameFamily::Traction, FrameFamily::HighTemperature]
                    .into_iter()
                    .map(|family| build_frame(family, CMD_READ))
                    .collect()
            }
            Some(_) => Vec::new(),
        }
    }
}

// ============================================================================
// Decoding
// ============================================================================

/// Feed bytes and decode every complete frame, applying the one-byte
/// discard policy to frames that fail their checksum.
pub fn drain_samples(sync: &mut FrameSynchronizer, bytes: &[u8]) -> Vec<TelemetrySample> {
    let mut samples = Vec::new();
    let mut candidates = sync.feed(bytes);
    while let Some(candidate) = candidates.next() {
        match validate_and_decode(&candidate) {
            Ok(sample) => samples.push(sample),
            Err(TelemetryError::ChecksumMismatch { calculated, received }) => {
                tlog!(
                    "[uart] Invalid CRC (got {:04X}, calc {:04X}), discarding one byte",
                    received,
                    calculated
                );
                candidates.reject();
            }
            Err(e) => {
                tlog!("[uart] Dropping frame: {}", e);
            }
        }
    }
    samples
}

// ============================================================================
// Listener
// ============================================================================

pub struct UartListener {
    opener: UartOpener,
    schedule: RequestSchedule,
    retry: RetrySettings,
    tx: mpsc::Sender<SourceMessage>,
    task: PollerTask,
}

impl UartListener {
    pub fn new(
        opener: UartOpener,
        schedule: RequestSchedule,
        retry: RetrySettings,
        tx: mpsc::Sender<SourceMessage>,
    ) -> Self {
        Self {
            opener,
            schedule,
            retry,
            tx,
            task: PollerTask::new(),
        }
    }
}

#[async_trait]
impl DevicePoller for UartListener {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Uart
    }

    async fn start(&mut self) -> bool {
        let opener = self.opener.clone();
        let schedule = self.schedule;
        let backoff = Backoff::from_settings(&self.retry);
        let tx = self.tx.clone();
        self.task
            .spawn(move |running| async move {
                let result = tokio::task::spawn_blocking(move || {
                    run_listener_blocking(opener, schedule, backoff, running, tx)
                })
                .await;
                if let Err(e) = result {
                    tlog!("[uart] Listener task panicked: {:?}", e);
                }
            })
            .await
    }

    fn stop(&mut self) -> bool {
        self.task.stop()
    }

    fn state(&self) -> PollerState {
        self.task.state()
    }
}

/// Blocking listener loop. Reconnects with backoff until the run flag clears.
fn run_listener_blocking(
    opener: UartOpener,
    schedule: RequestSchedule,
    mut backoff: Backoff,
    running: Arc<AtomicBool>,
    tx: mpsc::Sender<SourceMessage>,
) {
    let mut buf = [0u8; 256];

    'connect: while running.load(Ordering::Relaxed) {
        let mut link = match opener() {
            Ok(link) => link,
            Err(e) => {
                let delay = backoff.next_delay();
                tlog!("[uart] {} (retrying in {:?})", e, delay);
                let _ = tx.blocking_send(SourceMessage::Error(DeviceKind::Uart, e.to_string()));
                sleep_while_running(&running, delay);
                continue;
            }
        };
        tlog!("[uart] Connected: {}", link.describe());
        let _ = tx.blocking_send(SourceMessage::Connected(DeviceKind::Uart, link.describe()));

        let mut sync = FrameSynchronizer::new();
        let mut scheduler = RequestScheduler::new(schedule);

        while running.load(Ordering::Relaxed) {
            for request in scheduler.due(Instant::now()) {
                if let Err(e) = link.write_all(&request) {
                    let delay = backoff.next_delay();
                    tlog!("[uart] {} (reconnecting in {:?})", e, delay);
                    let _ = tx.blocking_send(SourceMessage::Error(DeviceKind::Uart, e.to_string()));
                    sleep_while_running(&running, delay);
                    continue 'connect;
                }
            }

            match link.read(&mut buf) {
                Ok(0) => {}
                Ok(n) => {
                    let samples = drain_samples(&mut sync, &buf[..n]);
                    // The link only counts as healthy once it delivers a valid frame
                    if !samples.is_empty() {
                        backoff.reset();
                    }
                    for sample in samples {
                        let reading = Reading::new(ReadingPayload::Telemetry(sample));
                        if tx.blocking_send(SourceMessage::Reading(reading)).is_err() {
                            // Daemon loop is gone
                            return;
                        }
                    }
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    tlog!("[uart] {} (reconnecting in {:?})", e, delay);
                    let _ = tx.blocking_send(SourceMessage::Error(DeviceKind::Uart, e.to_string()));
                    sleep_while_running(&running, delay);
                    continue 'connect;
                }
            }
        }
    }

    tlog!("[uart] Listener stopped");
    let _ = tx.blocking_send(SourceMessage::Ended(DeviceKind::Uart, "stopped".to_string()));
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::uart::codec::build_frame_with_payload;
    use crate::io::uart::TelemetryFields;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Link that replays scripted chunks and records written frames.
    struct ScriptedLink {
        chunks: VecDeque<Vec<u8>>,
        written: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl UartLink for ScriptedLink {
        fn read(&mut self, buf: &mut [u8]) -> Result<usize, IoError> {
            match self.chunks.pop_front() {
                Some(chunk) => {
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    Ok(chunk.len())
                }
                None => {
                    std::thread::sleep(Duration::from_millis(5));
                    Ok(0)
                }
            }
        }

        fn write_all(&mut self, bytes: &[u8]) -> Result<(), IoError> {
            self.written.lock().unwrap().push(bytes.to_vec());
            Ok(())
        }

        fn describe(&self) -> String {
            "scripted".to_string()
        }
    }

    fn fast_retry() -> RetrySettings {
        RetrySettings { initial_backoff_ms: 10, max_backoff_ms: 20 }
    }

    #[test]
    fn test_scheduler_sends_start_then_rounds() {
        let schedule = RequestSchedule {
            warmup: Duration::from_secs(5),
            interval: Duration::from_secs(1),
        };
        let mut scheduler = RequestScheduler::new(schedule);
        let t0 = Instant::now();

        let first = scheduler.due(t0);
        assert_eq!(first, vec![build_frame(FrameFamily::Temperature, CMD_START)]);
        assert!(scheduler.due(t0 + Duration::from_secs(4)).is_empty());

        let round = scheduler.due(t0 + Duration::from_secs(5));
        assert_eq!(round.len(), 3);
        assert_eq!(round[1], build_frame(FrameFamily::Traction, CMD_READ));
        assert!(scheduler.due(t0 + Duration::from_millis(5500)).is_empty());
        assert_eq!(scheduler.due(t0 + Duration::from_secs(6)).len(), 3);
    }

    #[test]
    fn test_drain_samples_skips_corrupted_frame() {
        let mut corrupted = build_frame(FrameFamily::HighTemperature, CMD_READ).to_vec();
        corrupted[40] ^= 0x01;
        let good = build_frame_with_payload(FrameFamily::Temperature, CMD_READ, 0, &[0x10, 0x27, 0x00, 0x00]).unwrap();
        let mut stream = corrupted;
        stream.extend_from_slice(&good);

        let mut sync = FrameSynchronizer::new();
        let samples = drain_samples(&mut sync, &stream);
        assert_eq!(samples.len(), 1);
        assert_eq!(
            samples[0].fields,
            TelemetryFields::Temperature { temp_normal_1: 100.0, temp_normal_2: 0.0 }
        );
        assert_eq!(sync.stats().rejected, 1);
    }

    #[tokio::test]
    async fn test_listener_delivers_readings_and_requests() {
        let written = Arc::new(Mutex::new(Vec::new()));
        let frame = build_frame_with_payload(FrameFamily::Traction, CMD_READ, 0, &[0, 0, 0xD0, 0x07]).unwrap();
        let script: VecDeque<Vec<u8>> = vec![frame[..20].to_vec(), frame[20..].to_vec()].into();

        let written_for_link = written.clone();
        let script = Arc::new(Mutex::new(Some(script)));
        let opener: UartOpener = Arc::new(move || {
            let chunks = script.lock().unwrap().take().unwrap_or_default();
            Ok(Box::new(ScriptedLink { chunks, written: written_for_link.clone() }) as Box<dyn UartLink>)
        });

        let (tx, mut rx) = mpsc::channel(16);
        let schedule = RequestSchedule { warmup: Duration::from_secs(60), interval: Duration::from_secs(60) };
        let mut listener = UartListener::new(opener, schedule, fast_retry(), tx);
        assert!(listener.start().await);
        assert!(!listener.start().await);

        let mut thrust = None;
        while thrust.is_none() {
            match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap() {
                SourceMessage::Reading(reading) => match reading.payload {
                    ReadingPayload::Telemetry(sample) => thrust = Some(sample.fields),
                    other => panic!("unexpected payload {:?}", other),
                },
                _ => {}
            }
        }
        assert_eq!(thrust, Some(TelemetryFields::Traction { thrust1: 2.0 }));

        assert!(listener.stop());
        loop {
            match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap() {
                Some(SourceMessage::Ended(DeviceKind::Uart, _)) | None => break,
                _ => {}
            }
        }
        let written = written.lock().unwrap();
        assert_eq!(written[0], build_frame(FrameFamily::Temperature, CMD_START).to_vec());
    }

    #[tokio::test]
    async fn test_listener_retries_unavailable_device() {
        let attempts = Arc::new(Mutex::new(0u32));
        let counter = attempts.clone();
        let opener: UartOpener = Arc::new(move || {
            *counter.lock().unwrap() += 1;
            Err(IoError::unavailable("/dev/null0", "not present"))
        });
        let (tx, mut rx) = mpsc::channel(16);
        let schedule = RequestSchedule { warmup: Duration::ZERO, interval: Duration::from_secs(1) };
        let mut listener = UartListener::new(opener, schedule, fast_retry(), tx);
        listener.start().await;

        for _ in 0..2 {
            match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap() {
                Some(SourceMessage::Error(DeviceKind::Uart, message)) => {
                    assert!(message.contains("device unavailable"))
                }
                other => panic!("unexpected message {:?}", other),
            }
        }
        listener.stop();
        assert!(*attempts.lock().unwrap() >= 2);
    }

    /// Opens fine, refuses every write.
    struct WriteRejectingLink;

    impl UartLink for WriteRejectingLink {
        fn read(&mut self, _buf: &mut [u8]) -> Result<usize, IoError> {
            Ok(0)
        }

        fn write_all(&mut self, _bytes: &[u8]) -> Result<(), IoError> {
            Err(IoError::write("/dev/ttyUSB0", "device disconnected"))
        }

        fn describe(&self) -> String {
            "write-rejecting".to_string()
        }
    }

    #[tokio::test]
    async fn test_write_failure_backs_off_before_reopening() {
        let opens = Arc::new(Mutex::new(0u32));
        let counter = opens.clone();
        let opener: UartOpener = Arc::new(move || {
            *counter.lock().unwrap() += 1;
            Ok(Box::new(WriteRejectingLink) as Box<dyn UartLink>)
        });
        // Roomy channel so a spinning loop would not be throttled by it
        let (tx, mut rx) = mpsc::channel(4096);
        let schedule = RequestSchedule { warmup: Duration::ZERO, interval: Duration::from_secs(1) };
        let retry = RetrySettings { initial_backoff_ms: 50, max_backoff_ms: 100 };
        let mut listener = UartListener::new(opener, schedule, retry, tx);
        listener.start().await;

        tokio::time::sleep(Duration::from_millis(300)).await;
        listener.stop();
        let attempts = *opens.lock().unwrap();
        // 50 + 100 + 100 ms of backoff fit in the window, plus scheduling slack
        assert!(attempts >= 2, "opened {} times", attempts);
        assert!(attempts <= 8, "opened {} times", attempts);

        let mut errors = 0;
        while let Ok(message) = rx.try_recv() {
            if matches!(message, SourceMessage::Error(DeviceKind::Uart, _)) {
                errors += 1;
            }
        }
        assert!(errors <= 8);
    }
}
