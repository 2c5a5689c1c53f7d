// src/io/multimeter/reader.rs
//
// Multimeter poller. Blocking link reads run on the worker pool and their
// results come back to the poller task through the join handle; decoding
// and de-duplication happen on the async side.

use async_trait::async_trait;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use super::codec::{decode, DecoderInput, PACKET_LEN};
use crate::io::error::IoError;
use crate::io::serial::{find_usb_port, open_serial, SerialLineConfig};
use crate::io::types::SourceMessage;
use crate::io::{
    sleep_while_running_async, Backoff, DeviceKind, DevicePoller, PollerState, PollerTask,
    Reading, ReadingPayload,
};
use crate::settings::{MultimeterSettings, RetrySettings};

// ============================================================================
// Link
// ============================================================================

/// One raw sample as read from the meter.
#[derive(Debug, Clone, PartialEq)]
pub enum RawSample {
    Bytes(Vec<u8>),
    Text(String),
}

impl RawSample {
    pub fn as_input(&self) -> DecoderInput<'_> {
        match self {
            RawSample::Bytes(bytes) => DecoderInput::Bytes(bytes),
            RawSample::Text(text) => DecoderInput::Text(text),
        }
    }
}

/// Blocking access to the meter. Serial today; HID would be another impl.
pub trait MultimeterLink: Send {
    /// Read one sample. `Ok(None)` when nothing arrived in time.
    fn read_sample(&mut self) -> Result<Option<RawSample>, IoError>;
    fn describe(&self) -> String;
}

pub type MultimeterOpener =
    Arc<dyn Fn() -> Result<Box<dyn MultimeterLink>, IoError> + Send + Sync>;

pub struct SerialMultimeterLink {
    port: Box<dyn serialport::SerialPort>,
    name: String,
}

impl SerialMultimeterLink {
    pub fn open(settings: &MultimeterSettings) -> Result<Self, IoError> {
        let port = if settings.port == "auto" {
            find_usb_port().ok_or_else(|| IoError::unavailable("multimeter", "no USB serial port found"))?
        } else {
            settings.port.clone()
        };
        let config = SerialLineConfig {
            data_bits: settings.data_bits,
            parity: settings.parity,
            stop_bits: settings.stop_bits,
            timeout: Duration::from_millis(settings.read_timeout_ms),
            dtr: Some(true),
            rts: Some(false),
            ..SerialLineConfig::new(port, settings.baud_rate)
        };
        let handle = open_serial(&config)?;
        Ok(Self { port: handle, name: config.describe() })
    }

    fn read_line(&mut self) -> Result<Vec<u8>, IoError> {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            match self.port.read(&mut byte) {
                Ok(0) => break,
                Ok(_) => {
                    line.push(byte[0]);
                    if byte[0] == b'\n' {
                        break;
                    }
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => break,
                Err(e) => return Err(IoError::read(&self.name, e.to_string())),
            }
        }
        Ok(line)
    }
}

impl MultimeterLink for SerialMultimeterLink {
    fn read_sample(&mut self) -> Result<Option<RawSample>, IoError> {
        self.port
            .clear(serialport::ClearBuffer::Input)
            .map_err(|e| IoError::read(&self.name, e.to_string()))?;

        let mut packet = [0u8; PACKET_LEN];
        let mut filled = 0;
        while filled < PACKET_LEN {
            match self.port.read(&mut packet[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => break,
                Err(e) => return Err(IoError::read(&self.name, e.to_string())),
            }
        }
        if filled == PACKET_LEN {
            return Ok(Some(RawSample::Bytes(packet.to_vec())));
        }

        // Short read: the meter may be speaking the line-based format
        let mut line = packet[..filled].to_vec();
        if !line.ends_with(b"\n") {
            line.extend(self.read_line()?);
        }
        if line.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(None);
        }
        match String::from_utf8(line) {
            Ok(text) => Ok(Some(RawSample::Text(text.trim().to_string()))),
            Err(_) => Ok(None),
        }
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}

pub fn serial_opener(settings: &MultimeterSettings) -> MultimeterOpener {
    let settings = settings.clone();
    Arc::new(move || {
        SerialMultimeterLink::open(&settings).map(|link| Box::new(link) as Box<dyn MultimeterLink>)
    })
}

// ============================================================================
// Poller
// ============================================================================

pub struct MultimeterPoller {
    opener: MultimeterOpener,
    sample_delay: Duration,
    retry: RetrySettings,
    paused: watch::Receiver<bool>,
    tx: mpsc::Sender<SourceMessage>,
    task: PollerTask,
}

impl MultimeterPoller {
    pub fn new(
        opener: MultimeterOpener,
        sample_delay: Duration,
        retry: RetrySettings,
        paused: watch::Receiver<bool>,
        tx: mpsc::Sender<SourceMessage>,
    ) -> Self {
        Self {
            opener,
            sample_delay,
            retry,
            paused,
            tx,
            task: PollerTask::new(),
        }
    }
}

#[async_trait]
impl DevicePoller for MultimeterPoller {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Multimeter
    }

    async fn start(&mut self) -> bool {
        let opener = self.opener.clone();
        let sample_delay = self.sample_delay;
        let backoff = Backoff::from_settings(&self.retry);
        let paused = self.paused.clone();
        let tx = self.tx.clone();
        self.task
            .spawn(move |running| run_multimeter(opener, sample_delay, backoff, paused, running, tx))
            .await
    }

    fn stop(&mut self) -> bool {
        self.task.stop()
    }

    fn state(&self) -> PollerState {
        self.task.state()
    }
}

async fn run_multimeter(
    opener: MultimeterOpener,
    sample_delay: Duration,
    mut backoff: Backoff,
    paused: watch::Receiver<bool>,
    running: Arc<AtomicBool>,
    tx: mpsc::Sender<SourceMessage>,
) {
    let mut link: Option<Box<dyn MultimeterLink>> = None;
    let mut last_value: Option<String> = None;

    while running.load(Ordering::Relaxed) {
        let is_paused = *paused.borrow();
        if is_paused {
            sleep_while_running_async(&running, sample_delay.max(Duration::from_millis(50))).await;
            continue;
        }

        let current = match link.take() {
            Some(current) => current,
            None => {
                let opener = opener.clone();
                match tokio::task::spawn_blocking(move || opener()).await {
                    Ok(Ok(opened)) => {
                        tlog!("[multimeter] Connected: {}", opened.describe());
                        let _ = tx
                            .send(SourceMessage::Connected(DeviceKind::Multimeter, opened.describe()))
                            .await;
                        opened
                    }
                    Ok(Err(e)) => {
                        let delay = backoff.next_delay();
                        tlog!("[multimeter] {} (retrying in {:?})", e, delay);
                        let _ = tx.send(SourceMessage::Error(DeviceKind::Multimeter, e.to_string())).await;
                        sleep_while_running_async(&running, delay).await;
                        continue;
                    }
                    Err(e) => {
                        tlog!("[multimeter] Open task failed: {}", e);
                        sleep_while_running_async(&running, backoff.next_delay()).await;
                        continue;
                    }
                }
            }
        };

        let handoff = tokio::task::spawn_blocking(move || {
            let mut current = current;
            let result = current.read_sample();
            (current, result)
        })
        .await;

        let (current, result) = match handoff {
            Ok(pair) => pair,
            Err(e) => {
                let delay = backoff.next_delay();
                tlog!("[multimeter] Read task failed: {} (reopening in {:?})", e, delay);
                sleep_while_running_async(&running, delay).await;
                continue;
            }
        };

        match result {
            Ok(Some(raw)) => {
                backoff.reset();
                link = Some(current);
                match decode(&raw.as_input()) {
                    Ok(sample) => {
                        if last_value.as_deref() == Some(sample.value.as_str()) {
                            // Unchanged value
                        } else {
                            last_value = Some(sample.value.clone());
                            let reading = Reading::new(ReadingPayload::Multimeter(sample));
                            if tx.send(SourceMessage::Reading(reading)).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        // A garbled packet breaks the run of identical values
                        last_value = None;
                        tlog!("[multimeter] Undecodable sample {:?}: {}", raw, e);
                    }
                }
            }
            Ok(None) => link = Some(current),
            Err(e) => {
                if !e.needs_reconnect() {
                    link = Some(current);
                }
                let delay = backoff.next_delay();
                tlog!("[multimeter] {} (retrying in {:?})", e, delay);
                let _ = tx.send(SourceMessage::Error(DeviceKind::Multimeter, e.to_string())).await;
                sleep_while_running_async(&running, delay).await;
                continue;
            }
        }

        sleep_while_running_async(&running, sample_delay).await;
    }

    tlog!("[multimeter] Poller stopped");
    let _ = tx
        .send(SourceMessage::Ended(DeviceKind::Multimeter, "stopped".to_string()))
        .await;
}

// ============================================================================
// Tests
// ============================================================================
