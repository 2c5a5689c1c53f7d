// src/io/oscilloscope/poller.rs
//
// Interval-gated oscilloscope capture. Captures only while someone is
// subscribed and acquisition is not paused.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use super::adapter::{OscilloscopeAdapter, ScpiOscilloscope};
use crate::io::error::IoError;
use crate::io::types::SourceMessage;
use crate::io::{
    sleep_while_running_async, Backoff, DeviceKind, DevicePoller, PollerState, PollerTask,
    Reading, ReadingPayload,
};
use crate::settings::{OscilloscopeSettings, RetrySettings};

pub type OscilloscopeOpener =
    Arc<dyn Fn() -> Result<Box<dyn OscilloscopeAdapter>, IoError> + Send + Sync>;

/// Opener for the configured SCPI address. Fails every attempt when no
/// address is configured.
pub fn scpi_opener(settings: &OscilloscopeSettings) -> OscilloscopeOpener {
    let address = settings.address.clone();
    let points = settings.points;
    Arc::new(move || match &address {
        Some(address) => ScpiOscilloscope::connect(address, points, Duration::from_secs(2))
            .map(|scope| Box::new(scope) as Box<dyn OscilloscopeAdapter>),
        None => Err(IoError::unavailable("oscilloscope", "no address configured")),
    })
}

/// Inputs that decide whether a capture is worth taking.
#[derive(Clone)]
pub struct CaptureGate {
    pub subscribers: watch::Receiver<usize>,
    pub paused: watch::Receiver<bool>,
}

impl CaptureGate {
    fn is_open(&self) -> bool {
        *self.subscribers.borrow() > 0 && !*self.paused.borrow()
    }
}

pub struct OscilloscopePoller {
    opener: OscilloscopeOpener,
    interval: Duration,
    retry: RetrySettings,
    gate: CaptureGate,
    tx: mpsc::Sender<SourceMessage>,
    task: PollerTask,
}

impl OscilloscopePoller {
    pub fn new(
        opener: OscilloscopeOpener,
        interval: Duration,
        retry: RetrySettings,
        gate: CaptureGate,
        tx: mpsc::Sender<SourceMessage>,
    ) -> Self {
        Self {
            opener,
            interval,
            retry,
            gate,
            tx,
            task: PollerTask::new(),
        }
    }
}

#[async_trait]
impl DevicePoller for OscilloscopePoller {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Oscilloscope
    }

    async fn start(&mut self) -> bool {
        let opener = self.opener.clone();
        let interval = self.interval;
        let backoff = Backoff::from_settings(&self.retry);
        let gate = self.gate.clone();
        let tx = self.tx.clone();
        self.task
            .spawn(move |running| run_oscilloscope(opener, interval, backoff, gate, running, tx))
            .await
    }

    fn stop(&mut self) -> bool {
        self.task.stop()
    }

    fn state(&self) -> PollerState {
        self.task.state()
    }
}

async fn run_oscilloscope(
    opener: OscilloscopeOpener,
    interval: Duration,
    mut backoff: Backoff,
    gate: CaptureGate,
    running: Arc<AtomicBool>,
    tx: mpsc::Sender<SourceMessage>,
) {
    let mut adapter: Option<Box<dyn OscilloscopeAdapter>> = None;

    while running.load(Ordering::Relaxed) {
        if !gate.is_open() {
            sleep_while_running_async(&running, interval).await;
            continue;
        }

        let current = match adapter.take() {
            Some(current) => current,
            None => {
                let opener = opener.clone();
                match tokio::task::spawn_blocking(move || opener()).await {
                    Ok(Ok(opened)) => {
                        let _ = tx
                            .send(SourceMessage::Connected(DeviceKind::Oscilloscope, opened.describe()))
                            .await;
                        opened
                    }
                    Ok(Err(e)) => {
                        let delay = backoff.next_delay();
                        tlog!("[oscilloscope] {} (retrying in {:?})", e, delay);
                        let _ = tx.send(SourceMessage::Error(DeviceKind::Oscilloscope, e.to_string())).await;
                        sleep_while_running_async(&running, delay).await;
                        continue;
                    }
                    Err(e) => {
                        tlog!("[oscilloscope] Connect task failed: {}", e);
                        sleep_while_running_async(&running, backoff.next_delay()).await;
                        continue;
                    }
                }
            }
        };

        let handoff = tokio::task::spawn_blocking(move || {
            let mut current = current;
            let result = current.capture_active_channels();
            (current, result)
        })
        .await;

        match handoff {
            Ok((current, Ok(frame))) => {
                backoff.reset();
                adapter = Some(current);
                if !frame.channels.is_empty() {
                    let reading = Reading::new(ReadingPayload::Oscilloscope(frame));
                    if tx.send(SourceMessage::Reading(reading)).await.is_err() {
                        return;
                    }
                }
                sleep_while_running_async(&running, interval).await;
            }
            Ok((_, Err(e))) => {
                // A failed exchange leaves the SCPI stream out of step; reconnect
                let delay = backoff.next_delay();
                tlog!("[oscilloscope] Capture failed: {} (reconnecting in {:?})", e, delay);
                let _ = tx.send(SourceMessage::Error(DeviceKind::Oscilloscope, e.to_string())).await;
                sleep_while_running_async(&running, delay).await;
            }
            Err(e) => {
                let delay = backoff.next_delay();
                tlog!("[oscilloscope] Capture task failed: {} (reconnecting in {:?})", e, delay);
                sleep_while_running_async(&running, delay).await;
            }
        }
    }

    tlog!("[oscilloscope] Poller stopped");
    let _ = tx
        .send(SourceMessage::Ended(DeviceKind::Oscilloscope, "stopped".to_string()))
        .await;
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::oscilloscope::{ChannelCapture, ChannelSettings, OscilloscopeFrame};
    use std::sync::Mutex;

    struct FakeScope {
        captures: Arc<Mutex<u32>>,
    }

    impl OscilloscopeAdapter for FakeScope {
        fn capture_active_channels(&mut self) -> Result<OscilloscopeFrame, IoError> {
            *self.captures.lock().unwrap() += 1;
            Ok(OscilloscopeFrame {
                channels: vec![ChannelCapture {
                    channel: 1,
                    time: vec![0.0, 0.001],
                    voltage: vec![0.5, 0.75],
                    settings: ChannelSettings {
                        time_base: 0.001,
                        time_offset: 0.0,
                        trigger_level: 0.0,
                        volts_per_div: 1.0,
                        offset: 0.0,
                    },
                }],
            })
        }

        fn describe(&self) -> String {
            "fake scope".to_string()
        }
    }

    fn retry() -> RetrySettings {
        RetrySettings { initial_backoff_ms: 10, max_backoff_ms: 20 }
    }

    #[tokio::test]
    async fn test_captures_only_with_subscribers_and_unpaused() {
        let captures = Arc::new(Mutex::new(0u32));
        let counter = captures.clone();
        let opener: OscilloscopeOpener = Arc::new(move || {
            Ok(Box::new(FakeScope { captures: counter.clone() }) as Box<dyn OscilloscopeAdapter>)
        });
        let (subs_tx, subs_rx) = watch::channel(0usize);
        let (pause_tx, pause_rx) = watch::channel(false);
        let gate = CaptureGate { subscribers: subs_rx, paused: pause_rx };
        let (tx, mut rx) = mpsc::channel(64);
        let mut poller = OscilloscopePoller::new(opener, Duration::from_millis(10), retry(), gate, tx);
        poller.start().await;

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(*captures.lock().unwrap(), 0);

        subs_tx.send(1).unwrap();
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
            if let SourceMessage::Reading(reading) = msg {
                assert_eq!(reading.device(), DeviceKind::Oscilloscope);
                break;
            }
        }

        pause_tx.send(true).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let paused_at = *captures.lock().unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(*captures.lock().unwrap(), paused_at);

        assert!(poller.stop());
    }

    #[tokio::test]
    async fn test_unconfigured_address_reports_error() {
        let settings = OscilloscopeSettings { address: None, ..OscilloscopeSettings::default() };
        let (_subs_tx, subs_rx) = watch::channel(1usize);
        let (_pause_tx, pause_rx) = watch::channel(false);
        let gate = CaptureGate { subscribers: subs_rx, paused: pause_rx };
        let (tx, mut rx) = mpsc::channel(8);
        let mut poller =
            OscilloscopePoller::new(scpi_opener(&settings), Duration::from_millis(10), retry(), gate, tx);
        poller.start().await;

        match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap() {
            Some(SourceMessage::Error(DeviceKind::Oscilloscope, message)) => {
                assert!(message.contains("no address configured"))
            }
            other => panic!("unexpected message {:?}", other),
        }
        poller.stop();
    }

    struct PanickingScope;

    impl OscilloscopeAdapter for PanickingScope {
        fn capture_active_channels(&mut self) -> Result<OscilloscopeFrame, IoError> {
            panic!("driver bug");
        }

        fn describe(&self) -> String {
            "panicking scope".to_string()
        }
    }

    #[tokio::test]
    async fn test_crashed_capture_task_backs_off() {
        let opens = Arc::new(Mutex::new(0u32));
        let counter = opens.clone();
        let opener: OscilloscopeOpener = Arc::new(move || {
            *counter.lock().unwrap() += 1;
            Ok(Box::new(PanickingScope) as Box<dyn OscilloscopeAdapter>)
        });
        let (_subs_tx, subs_rx) = watch::channel(1usize);
        let (_pause_tx, pause_rx) = watch::channel(false);
        let gate = CaptureGate { subscribers: subs_rx, paused: pause_rx };
        let (tx, _rx) = mpsc::channel(64);
        let retry = RetrySettings { initial_backoff_ms: 50, max_backoff_ms: 100 };
        let mut poller = OscilloscopePoller::new(opener, Duration::from_millis(1), retry, gate, tx);
        poller.start().await;

        tokio::time::sleep(Duration::from_millis(300)).await;
        poller.stop();
        let attempts = *opens.lock().unwrap();
        assert!(attempts >= 2, "opened {} times", attempts);
        assert!(attempts <= 8, "opened {} times", attempts);
    }
}
