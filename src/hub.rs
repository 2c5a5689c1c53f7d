// src/hub.rs
//
// Acquisition hub: the registry of connected clients and the fan-out of
// readings to them. Owned and mutated only by the daemon loop.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use uuid::Uuid;

use crate::io::{Reading, ReadingPayload};

pub type ClientId = Uuid;

/// Delivery failure for one client (the client is then dropped).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("transport closed")]
    Closed,
    #[error("send timed out")]
    Timeout,
}

/// Outbound half of a client connection.
#[async_trait]
pub trait SubscriberTransport: Send + Sync {
    async fn send(&self, message: String) -> Result<(), SendError>;
    fn is_closed(&self) -> bool;
}

/// Registry entry. The last multimeter value is remembered per client.
pub struct ClientSubscription {
    pub id: ClientId,
    transport: Arc<dyn SubscriberTransport>,
    last_multimeter_value: Option<String>,
}

/// Outcome of one broadcast.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub suppressed: usize,
    pub removed: Vec<ClientId>,
}

pub struct Hub {
    clients: HashMap<ClientId, ClientSubscription>,
    subscriber_count: watch::Sender<usize>,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

impl Hub {
    pub fn new() -> Self {
        let (subscriber_count, _) = watch::channel(0);
        Self {
            clients: HashMap::new(),
            subscriber_count,
        }
    }

    /// Receiver that tracks the number of registered clients.
    pub fn watch_subscriber_count(&self) -> watch::Receiver<usize> {
        self.subscriber_count.subscribe()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn contains(&self, id: &ClientId) -> bool {
        self.clients.contains_key(id)
    }

    pub fn register(&mut self, id: ClientId, transport: Arc<dyn SubscriberTransport>) {
        self.clients.insert(
            id,
            ClientSubscription {
                id,
                transport,
                last_multimeter_value: None,
            },
        );
        tlog!("[hub] Client {} registered ({} connected)", id, self.clients.len());
        self.publish_count();
    }

    pub fn unregister(&mut self, id: &ClientId) -> bool {
        let removed = self.clients.remove(id).is_some();
        if removed {
            tlog!("[hub] Client {} removed ({} connected)", id, self.clients.len());
            self.publish_count();
        }
        removed
    }

    /// Deliver a reading to every registered client. Multimeter values that
    /// repeat the last value sent to a client are skipped for that client.
    /// Clients that fail or report a closed transport are removed once all
    /// sends have finished.
    pub async fn broadcast(&mut self, reading: &Reading) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        if self.clients.is_empty() {
            return report;
        }

        let multimeter_value = match &reading.payload {
            ReadingPayload::Multimeter(sample) => Some(sample.value.as_str()),
            _ => None,
        };
        let message = reading.to_envelope().to_string();

        let mut targets = Vec::with_capacity(self.clients.len());
        for client in self.clients.values() {
            if client.transport.is_closed() {
                report.removed.push(client.id);
                continue;
            }
            if multimeter_value.is_some() && client.last_multimeter_value.as_deref() == multimeter_value {
                report.suppressed += 1;
                continue;
            }
            targets.push((client.id, client.transport.clone()));
        }

        let sends = targets.iter().map(|(_, transport)| transport.send(message.clone()));
        let results = futures::future::join_all(sends).await;

        for ((id, _), result) in targets.iter().zip(results) {
            match result {
                Ok(()) => {
                    report.delivered += 1;
                    if let (Some(value), Some(client)) = (multimeter_value, self.clients.get_mut(id)) {
                        client.last_multimeter_value = Some(value.to_string());
                    }
                }
                Err(e) => {
                    tlog!("[hub] Send to {} failed: {}", id, e);
                    report.removed.push(*id);
                }
            }
        }

        for id in &report.removed {
            self.unregister(id);
        }
        report
    }

    /// Send one message to one client (acknowledgments, query replies).
    /// A failed client is removed like in a broadcast.
    pub async fn send_to(&mut self, id: &ClientId, message: String) -> Result<(), SendError> {
        let transport = match self.clients.get(id) {
            Some(client) if !client.transport.is_closed() => client.transport.clone(),
            Some(_) => {
                self.unregister(id);
                return Err(SendError::Closed);
            }
            None => return Err(SendError::Closed),
        };
        let result = transport.send(message).await;
        if result.is_err() {
            self.unregister(id);
        }
        result
    }

    fn publish_count(&self) {
        self.subscriber_count.send_replace(self.clients.len());
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::io::multimeter::{decode, DecoderInput};
    use crate::io::uart::{build_frame, decode_frame, FrameFamily};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// Transport that records everything it is sent.
    #[derive(Default)]
    pub(crate) struct RecordingTransport {
        pub sent: Mutex<Vec<String>>,
        pub closed: AtomicBool,
        pub fail: AtomicBool,
    }

    impl RecordingTransport {
        pub fn messages(&self) -> Vec<serde_json::Value> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|m| serde_json::from_str(m).unwrap())
                .collect()
        }
    }

    #[async_trait]
    impl SubscriberTransport for RecordingTransport {
        async fn send(&self, message: String) -> Result<(), SendError> {
            if self.fail.load(Ordering::Relaxed) {
                return Err(SendError::Timeout);
            }
            self.sent.lock().unwrap().push(message);
            Ok(())
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::Relaxed)
        }
    }

    fn meter(value_text: &str) -> Reading {
        let sample = decode(&DecoderInput::Text(value_text)).unwrap();
        Reading::at(1, ReadingPayload::Multimeter(sample))
    }

    fn telemetry() -> Reading {
        let sample = decode_frame(&build_frame(FrameFamily::Temperature, 0x3B)).unwrap();
        Reading::at(2, ReadingPayload::Telemetry(sample))
    }

    fn values(transport: &RecordingTransport) -> Vec<String> {
        transport
            .messages()
            .iter()
            .map(|m| m["data"]["value"].as_str().unwrap().to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_per_client_multimeter_dedup() {
        let mut hub = Hub::new();
        let a = Arc::new(RecordingTransport::default());
        let b = Arc::new(RecordingTransport::default());
        let (id_a, id_b) = (Uuid::new_v4(), Uuid::new_v4());

        hub.register(id_a, a.clone());
        hub.broadcast(&meter("1000;80")).await;
        // B joins between the two identical values
        hub.register(id_b, b.clone());
        let report = hub.broadcast(&meter("1000;80")).await;
        assert_eq!(report.suppressed, 1);
        assert_eq!(report.delivered, 1);
        hub.broadcast(&meter("2000;80")).await;

        assert_eq!(values(&a), vec!["1.000", "2.000"]);
        assert_eq!(values(&b), vec!["1.000", "2.000"]);
    }

    #[tokio::test]
    async fn test_telemetry_is_never_suppressed() {
        let mut hub = Hub::new();
        let a = Arc::new(RecordingTransport::default());
        hub.register(Uuid::new_v4(), a.clone());
        hub.broadcast(&telemetry()).await;
        hub.broadcast(&telemetry()).await;
        let messages = a.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["type"], "sensor_data");
    }

    #[tokio::test]
    async fn test_failures_are_isolated_and_removed() {
        let mut hub = Hub::new();
        let count = hub.watch_subscriber_count();
        let good = Arc::new(RecordingTransport::default());
        let failing = Arc::new(RecordingTransport::default());
        failing.fail.store(true, Ordering::Relaxed);
        let closed = Arc::new(RecordingTransport::default());
        closed.closed.store(true, Ordering::Relaxed);

        let (id_good, id_failing, id_closed) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        hub.register(id_good, good.clone());
        hub.register(id_failing, failing.clone());
        hub.register(id_closed, closed.clone());
        assert_eq!(*count.borrow(), 3);

        let report = hub.broadcast(&telemetry()).await;
        assert_eq!(report.delivered, 1);
        assert_eq!(report.removed.len(), 2);
        assert!(hub.contains(&id_good));
        assert!(!hub.contains(&id_failing));
        assert!(!hub.contains(&id_closed));
        assert_eq!(*count.borrow(), 1);
        assert_eq!(good.messages().len(), 1);
        assert!(closed.messages().is_empty());
    }

    #[tokio::test]
    async fn test_send_to_and_unregister() {
        let mut hub = Hub::new();
        let a = Arc::new(RecordingTransport::default());
        let id = Uuid::new_v4();
        hub.register(id, a.clone());
        hub.send_to(&id, "{\"type\":\"status\"}".into()).await.unwrap();
        assert_eq!(a.messages()[0]["type"], "status");

        assert!(hub.unregister(&id));
        assert!(!hub.unregister(&id));
        assert_eq!(hub.send_to(&id, "{}".into()).await, Err(SendError::Closed));
        assert!(hub.is_empty());
    }
}
