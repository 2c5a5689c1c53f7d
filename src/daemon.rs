// src/daemon.rs
//
// The daemon loop. One task owns the hub, the session manager and the
// device pollers; everything else talks to it through channels.

use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::hub::{ClientId, Hub, SubscriberTransport};
use crate::io::multimeter::{self, MultimeterPoller};
use crate::io::oscilloscope::{self, CaptureGate, OscilloscopePoller};
use crate::io::uart::{self, RequestSchedule, TelemetrySnapshot, UartListener};
use crate::io::{DeviceKind, DevicePoller, PollerState, Reading, ReadingPayload, SourceMessage};
use crate::sessions::{append_to_current, Session, SessionManager};
use crate::settings::DaemonSettings;
use crate::storage::StorageEngine;

/// Queue depth between the daemon loop and the recorder
pub const RECORDER_QUEUE: usize = 1024;

// ============================================================================
// Events and commands
// ============================================================================

/// Client control command, tagged by `action` on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ControlCommand {
    StartSession,
    StopSession,
    StartDevice { device: DeviceKind },
    StopDevice { device: DeviceKind },
    GetLatest { device: DeviceKind },
    GetUartData,
    StartMeasurements,
    StopMeasurements,
}

pub fn parse_control(text: &str) -> Result<ControlCommand, serde_json::Error> {
    serde_json::from_str(text)
}

pub enum DaemonEvent {
    ClientConnected {
        id: ClientId,
        transport: Arc<dyn SubscriberTransport>,
    },
    ClientDisconnected(ClientId),
    Control {
        client: ClientId,
        command: ControlCommand,
    },
    Source(SourceMessage),
    Shutdown,
}

/// `{"type":"status","data":{"status":code, ...extra}}`
pub fn status_message(code: &str, extra: serde_json::Value) -> String {
    let mut data = json!({ "status": code });
    if let (Some(map), serde_json::Value::Object(extra)) = (data.as_object_mut(), extra) {
        map.extend(extra);
    }
    json!({ "type": "status", "data": data }).to_string()
}

fn error_message(message: impl std::fmt::Display) -> String {
    status_message("error", json!({ "message": message.to_string() }))
}

// ============================================================================
// Recorder
// ============================================================================

/// Storage consumer. Routes each reading by the session current at the
/// time it is recorded; runs independently of the broadcast path.
pub fn spawn_recorder(
    storage: Arc<dyn StorageEngine>,
    session: watch::Receiver<Session>,
    mut readings: mpsc::Receiver<Reading>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut failures: u64 = 0;
        while let Some(reading) = readings.recv().await {
            match append_to_current(&session, storage.as_ref(), &reading) {
                Ok(_) => failures = 0,
                Err(e) => {
                    failures += 1;
                    // Log the first failure and every 100th after it
                    if failures == 1 || failures % 100 == 0 {
                        tlog!("[storage] {} append failed ({}x): {}", reading.device(), failures, e);
                    }
                }
            }
        }
        tlog!("[storage] Recorder stopped");
    })
}

// ============================================================================
// Daemon
// ============================================================================

pub struct Daemon {
    hub: Hub,
    sessions: SessionManager,
    storage: Arc<dyn StorageEngine>,
    pollers: HashMap<DeviceKind, Box<dyn DevicePoller>>,
    paused: watch::Sender<bool>,
    recorder: mpsc::Sender<Reading>,
    telemetry: TelemetrySnapshot,
}

impl Daemon {
    pub fn new(storage: Arc<dyn StorageEngine>, recorder: mpsc::Sender<Reading>) -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            hub: Hub::new(),
            sessions: SessionManager::new(storage.clone()),
            storage,
            pollers: HashMap::new(),
            paused,
            recorder,
            telemetry: TelemetrySnapshot::default(),
        }
    }

    /// Subscriber count and pause flag, for the oscilloscope poller.
    pub fn capture_gate(&self) -> CaptureGate {
        CaptureGate {
            subscribers: self.hub.watch_subscriber_count(),
            paused: self.paused.subscribe(),
        }
    }

    pub fn watch_paused(&self) -> watch::Receiver<bool> {
        self.paused.subscribe()
    }

    pub fn watch_session(&self) -> watch::Receiver<Session> {
        self.sessions.subscribe()
    }

    pub fn add_poller(&mut self, poller: Box<dyn DevicePoller>) {
        self.pollers.insert(poller.kind(), poller);
    }

    /// Build the pollers for every enabled device.
    pub fn add_configured_pollers(&mut self, settings: &DaemonSettings, sources: mpsc::Sender<SourceMessage>) {
        if settings.uart.enabled {
            self.add_poller(Box::new(UartListener::new(
                uart::listener::serial_opener(&settings.uart),
                RequestSchedule::from_settings(&settings.uart),
                settings.retry.clone(),
                sources.clone(),
            )));
        }
        if settings.multimeter.enabled {
            self.add_poller(Box::new(MultimeterPoller::new(
                multimeter::serial_opener(&settings.multimeter),
                Duration::from_millis(settings.multimeter.sample_delay_ms),
                settings.retry.clone(),
                self.watch_paused(),
                sources.clone(),
            )));
        }
        if settings.oscilloscope.enabled {
            self.add_poller(Box::new(OscilloscopePoller::new(
                oscilloscope::scpi_opener(&settings.oscilloscope),
                Duration::from_millis(settings.oscilloscope.interval_ms),
                settings.retry.clone(),
                self.capture_gate(),
                sources,
            )));
        }
    }

    pub async fn start_all(&mut self) {
        for (kind, poller) in self.pollers.iter_mut() {
            if poller.start().await {
                tlog!("[daemon] Started {} poller", kind);
            }
        }
    }

    pub fn stop_all(&mut self) {
        for (kind, poller) in self.pollers.iter_mut() {
            if poller.stop() {
                tlog!("[daemon] Stopped {} poller", kind);
            }
        }
    }

    /// Process events until shutdown or until both channels close.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<DaemonEvent>,
        mut sources: mpsc::Receiver<SourceMessage>,
    ) {
        tlog!("[daemon] Event loop running with {} device(s)", self.pollers.len());
        loop {
            let event = tokio::select! {
                Some(event) = events.recv() => event,
                Some(message) = sources.recv() => DaemonEvent::Source(message),
                else => break,
            };
            if !self.handle_event(event).await {
                break;
            }
        }
        self.stop_all();
        tlog!("[daemon] Event loop finished");
    }

    /// Apply one event. Returns false on shutdown.
    pub async fn handle_event(&mut self, event: DaemonEvent) -> bool {
        match event {
            DaemonEvent::ClientConnected { id, transport } => {
                self.hub.register(id, transport);
                let _ = self.hub.send_to(&id, self.telemetry.to_envelope().to_string()).await;
            }
            DaemonEvent::ClientDisconnected(id) => {
                self.hub.unregister(&id);
            }
            DaemonEvent::Control { client, command } => self.handle_control(client, command).await,
            DaemonEvent::Source(message) => self.handle_source(message).await,
            DaemonEvent::Shutdown => return false,
        }
        true
    }

    async fn handle_source(&mut self, message: SourceMessage) {
        match message {
            SourceMessage::Reading(reading) => {
                if let ReadingPayload::Telemetry(sample) = &reading.payload {
                    self.telemetry.apply(sample, reading.timestamp_us);
                }
                if let Err(e) = self.recorder.try_send(reading.clone()) {
                    tlog!("[daemon] Reading not recorded: {}", e);
                }
                self.hub.broadcast(&reading).await;
            }
            SourceMessage::Connected(kind, description) => {
                tlog!("[daemon] {} connected: {}", kind, description)
            }
            SourceMessage::Error(kind, reason) => tlog!("[daemon] {} error: {}", kind, reason),
            SourceMessage::Ended(kind, reason) => tlog!("[daemon] {} poller ended: {}", kind, reason),
        }
    }

    async fn handle_control(&mut self, client: ClientId, command: ControlCommand) {
        tlog!("[daemon] {} from {}", command_name(&command), client);
        let replies: Vec<String> = match command {
            ControlCommand::StartSession => match self.sessions.start_new_test() {
                Ok(session) => vec![
                    json!({ "type": "test_started", "test_number": session.id }).to_string(),
                    status_message("session_started", json!({ "test_number": session.id })),
                ],
                Err(e) => vec![error_message(e)],
            },
            ControlCommand::StopSession => match self.sessions.stop_session() {
                Some(id) => vec![status_message("session_stopped", json!({ "test_number": id }))],
                None => vec![status_message("session_stopped", json!({}))],
            },
            ControlCommand::StartDevice { device } => match self.pollers.get_mut(&device) {
                Some(poller) => {
                    let started = poller.start().await;
                    vec![status_message(
                        &format!("{}_started", device),
                        json!({ "already_running": !started }),
                    )]
                }
                None => vec![error_message(format!("{} is not configured", device))],
            },
            ControlCommand::StopDevice { device } => match self.pollers.get_mut(&device) {
                Some(poller) => {
                    let stopped = poller.stop();
                    vec![status_message(
                        &format!("{}_stopped", device),
                        json!({ "was_running": stopped }),
                    )]
                }
                None => vec![error_message(format!("{} is not configured", device))],
            },
            ControlCommand::GetLatest { device: DeviceKind::Uart } | ControlCommand::GetUartData => {
                vec![self.telemetry.to_envelope().to_string()]
            }
            ControlCommand::GetLatest { device } => {
                let partition = self.sessions.current().partitions.for_kind(device).clone();
                match self.storage.latest(&partition) {
                    Ok(Some(row)) => vec![row.document.to_string()],
                    Ok(None) => vec![error_message(format!("no {} data in {}", device, partition))],
                    Err(e) => vec![error_message(e)],
                }
            }
            ControlCommand::StartMeasurements => {
                self.paused.send_replace(false);
                vec![status_message("measurements_started", json!({}))]
            }
            ControlCommand::StopMeasurements => {
                self.paused.send_replace(true);
                vec![status_message("measurements_stopped", json!({}))]
            }
        };

        for reply in replies {
            if self.hub.send_to(&client, reply).await.is_err() {
                break;
            }
        }
    }

    pub fn poller_state(&self, kind: DeviceKind) -> Option<PollerState> {
        self.pollers.get(&kind).map(|poller| poller.state())
    }
}

fn command_name(command: &ControlCommand) -> &'static str {
    match command {
        ControlCommand::StartSession => "start_session",
        ControlCommand::StopSession => "stop_session",
        ControlCommand::StartDevice { .. } => "start_device",
        ControlCommand::StopDevice { .. } => "stop_device",
        ControlCommand::GetLatest { .. } => "get_latest",
        ControlCommand::GetUartData => "get_uart_data",
        ControlCommand::StartMeasurements => "start_measurements",
        ControlCommand::StopMeasurements => "stop_measurements",
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::tests::RecordingTransport;
    use crate::io::multimeter::{MultimeterLink, MultimeterOpener, RawSample};
    use crate::io::oscilloscope::{OscilloscopeAdapter, OscilloscopeOpener};
    use crate::io::uart::{build_frame_with_payload, FrameFamily, UartLink, UartOpener};
    use crate::io::IoError;
    use crate::settings::RetrySettings;
    use crate::storage::{MemoryStorage, PartitionHandle};
    use uuid::Uuid;

    fn retry() -> RetrySettings {
        RetrySettings { initial_backoff_ms: 10, max_backoff_ms: 40 }
    }

    struct LoopingUart;

    impl UartLink for LoopingUart {
        fn read(&mut self, buf: &mut [u8]) -> Result<usize, IoError> {
            std::thread::sleep(Duration::from_millis(5));
            let frame = build_frame_with_payload(FrameFamily::Temperature, 0x3B, 0, &[0xC4, 0x09, 0, 0])
                .map_err(|e| IoError::protocol("uart", e.to_string()))?;
            buf[..frame.len()].copy_from_slice(&frame);
            Ok(frame.len())
        }

        fn write_all(&mut self, _bytes: &[u8]) -> Result<(), IoError> {
            Ok(())
        }

        fn describe(&self) -> String {
            "looping uart".into()
        }
    }

    struct CountingMeter(u8);

    impl MultimeterLink for CountingMeter {
        fn read_sample(&mut self) -> Result<Option<RawSample>, IoError> {
            self.0 = self.0 % 9 + 1;
            Ok(Some(RawSample::Text(format!("{}000;80", self.0))))
        }

        fn describe(&self) -> String {
            "counting meter".into()
        }
    }

    struct Harness {
        daemon: Daemon,
        storage: Arc<MemoryStorage>,
        sources_tx: mpsc::Sender<SourceMessage>,
        sources_rx: mpsc::Receiver<SourceMessage>,
        _recorder: JoinHandle<()>,
    }

    fn harness() -> Harness {
        let storage = Arc::new(MemoryStorage::new());
        let (recorder_tx, recorder_rx) = mpsc::channel(RECORDER_QUEUE);
        let daemon = Daemon::new(storage.clone(), recorder_tx);
        let recorder = spawn_recorder(storage.clone(), daemon.watch_session(), recorder_rx);
        let (sources_tx, sources_rx) = mpsc::channel(256);
        Harness { daemon, storage, sources_tx, sources_rx, _recorder: recorder }
    }

    fn types(client: &RecordingTransport) -> Vec<String> {
        client
            .messages()
            .iter()
            .map(|m| m["type"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    async fn control(daemon: &mut Daemon, client: ClientId, command: ControlCommand) {
        daemon.handle_event(DaemonEvent::Control { client, command }).await;
    }

    #[test]
    fn test_parse_control_commands() {
        assert_eq!(parse_control(r#"{"action":"start_session"}"#).unwrap(), ControlCommand::StartSession);
        assert_eq!(
            parse_control(r#"{"action":"start_device","device":"multimeter"}"#).unwrap(),
            ControlCommand::StartDevice { device: DeviceKind::Multimeter }
        );
        assert_eq!(
            parse_control(r#"{"action":"get_latest","device":"telemetry"}"#).unwrap(),
            ControlCommand::GetLatest { device: DeviceKind::Uart }
        );
        assert_eq!(parse_control(r#"{"action":"get_uart_data"}"#).unwrap(), ControlCommand::GetUartData);
        assert!(parse_control(r#"{"action":"launch"}"#).is_err());
        assert!(parse_control("not json").is_err());
    }

    #[test]
    fn test_status_message_shape() {
        let message: serde_json::Value =
            serde_json::from_str(&status_message("session_started", json!({ "test_number": 4 }))).unwrap();
        assert_eq!(message["type"], "status");
        assert_eq!(message["data"]["status"], "session_started");
        assert_eq!(message["data"]["test_number"], 4);
    }

    #[tokio::test]
    async fn test_session_commands_and_latest() {
        let Harness { mut daemon, storage, .. } = harness();
        let client = Arc::new(RecordingTransport::default());
        let id = Uuid::new_v4();
        daemon
            .handle_event(DaemonEvent::ClientConnected { id, transport: client.clone() })
            .await;

        control(&mut daemon, id, ControlCommand::GetLatest { device: DeviceKind::Multimeter }).await;
        control(&mut daemon, id, ControlCommand::StartSession).await;

        let sample = multimeter::decode(&multimeter::DecoderInput::Text("3000;80")).unwrap();
        let reading = Reading::at(42, crate::io::ReadingPayload::Multimeter(sample));
        daemon.handle_event(DaemonEvent::Source(SourceMessage::Reading(reading))).await;

        // Recorder is asynchronous
        let partition = PartitionHandle::session(1, DeviceKind::Multimeter);
        for _ in 0..100 {
            if storage.count(&partition).unwrap() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        control(&mut daemon, id, ControlCommand::GetLatest { device: DeviceKind::Multimeter }).await;
        control(&mut daemon, id, ControlCommand::StopSession).await;

        let messages = client.messages();
        assert_eq!(messages[0]["type"], "sensor_data");
        assert_eq!(messages[1]["data"]["status"], "error");
        assert_eq!(messages[2]["type"], "test_started");
        assert_eq!(messages[2]["test_number"], 1);
        assert_eq!(messages[3]["data"]["status"], "session_started");
        assert_eq!(messages[4]["type"], "multimeter");
        assert_eq!(messages[5]["type"], "multimeter");
        assert_eq!(messages[5]["data"]["value"], "3.000");
        assert_eq!(messages[6]["data"]["status"], "session_stopped");
        assert_eq!(messages[6]["data"]["test_number"], 1);
    }

    #[tokio::test]
    async fn test_device_and_pause_commands() {
        let Harness { mut daemon, .. } = harness();
        let client = Arc::new(RecordingTransport::default());
        let id = Uuid::new_v4();
        daemon
            .handle_event(DaemonEvent::ClientConnected { id, transport: client.clone() })
            .await;
        let paused = daemon.watch_paused();

        control(&mut daemon, id, ControlCommand::StartDevice { device: DeviceKind::Oscilloscope }).await;
        control(&mut daemon, id, ControlCommand::StopMeasurements).await;
        assert!(*paused.borrow());
        control(&mut daemon, id, ControlCommand::StartMeasurements).await;
        assert!(!*paused.borrow());

        let messages = client.messages();
        assert_eq!(messages[1]["data"]["status"], "error");
        assert_eq!(messages[2]["data"]["status"], "measurements_stopped");
        assert_eq!(messages[3]["data"]["status"], "measurements_started");
    }

    fn telemetry_reading(family: FrameFamily, payload: &[u8], timestamp_us: u64) -> DaemonEvent {
        let frame = build_frame_with_payload(family, 0x3B, 0, payload).unwrap();
        let sample = uart::decode_frame(&frame).unwrap();
        DaemonEvent::Source(SourceMessage::Reading(Reading::at(timestamp_us, ReadingPayload::Telemetry(sample))))
    }

    #[tokio::test]
    async fn test_new_client_receives_merged_telemetry() {
        let Harness { mut daemon, .. } = harness();
        // 2345 -> 23.45, 10000 -> 100.00, thrust 2000 -> 2.0
        daemon
            .handle_event(telemetry_reading(FrameFamily::Temperature, &[0x29, 0x09, 0x10, 0x27], 10))
            .await;
        daemon
            .handle_event(telemetry_reading(FrameFamily::Traction, &[0, 0, 0xD0, 0x07], 20))
            .await;

        let client = Arc::new(RecordingTransport::default());
        let id = Uuid::new_v4();
        daemon
            .handle_event(DaemonEvent::ClientConnected { id, transport: client.clone() })
            .await;
        control(&mut daemon, id, ControlCommand::GetLatest { device: DeviceKind::Uart }).await;
        control(&mut daemon, id, ControlCommand::GetUartData).await;

        let messages = client.messages();
        assert_eq!(messages.len(), 3);
        for message in &messages {
            assert_eq!(message["type"], "sensor_data");
            let data = &message["data"];
            assert_eq!(data["tempNormal1"], 23.45);
            assert_eq!(data["tempNormal2"], 100.0);
            assert_eq!(data["temp600_1"], 0.0);
            assert_eq!(data["temp600_2"], 0.0);
            assert_eq!(data["thrust1"], 2.0);
            assert_eq!(data["timestamp_us"], 20);
        }
    }

    #[tokio::test]
    async fn test_oscilloscope_failure_does_not_stop_other_devices() {
        let Harness { mut daemon, storage, sources_tx, sources_rx, .. } = harness();

        let uart_opener: UartOpener = Arc::new(|| Ok(Box::new(LoopingUart) as Box<dyn UartLink>));
        let meter_opener: MultimeterOpener =
            Arc::new(|| Ok(Box::new(CountingMeter(0)) as Box<dyn MultimeterLink>));
        let scope_opener: OscilloscopeOpener = Arc::new(|| {
            Err::<Box<dyn OscilloscopeAdapter>, _>(IoError::unavailable("oscilloscope", "powered off"))
        });

        let schedule = RequestSchedule { warmup: Duration::ZERO, interval: Duration::from_millis(50) };
        daemon.add_poller(Box::new(UartListener::new(uart_opener, schedule, retry(), sources_tx.clone())));
        daemon.add_poller(Box::new(MultimeterPoller::new(
            meter_opener,
            Duration::from_millis(5),
            retry(),
            daemon.watch_paused(),
            sources_tx.clone(),
        )));
        daemon.add_poller(Box::new(OscilloscopePoller::new(
            scope_opener,
            Duration::from_millis(10),
            retry(),
            daemon.capture_gate(),
            sources_tx,
        )));

        let client = Arc::new(RecordingTransport::default());
        let (events_tx, events_rx) = mpsc::channel(16);
        events_tx
            .send(DaemonEvent::ClientConnected { id: Uuid::new_v4(), transport: client.clone() })
            .await
            .unwrap();
        daemon.start_all().await;
        assert_eq!(daemon.poller_state(DeviceKind::Oscilloscope), Some(PollerState::Running));
        let running = tokio::spawn(daemon.run(events_rx, sources_rx));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let seen = types(&client);
            let telemetry = seen.iter().filter(|t| *t == "sensor_data").count();
            let meter = seen.iter().filter(|t| *t == "multimeter").count();
            if telemetry >= 3 && meter >= 3 {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "devices stalled: {:?}", seen);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!types(&client).iter().any(|t| t == "oscilloscope"));

        events_tx.send(DaemonEvent::Shutdown).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), running).await.unwrap().unwrap();
        assert!(storage.count(&PartitionHandle::live(DeviceKind::Uart)).unwrap() > 0);
    }
}
