// src/server.rs
//
// WebSocket front end. Each connection gets a client id and a bounded
// outbound queue; inbound text frames are parsed as control commands and
// forwarded to the daemon loop.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::daemon::{parse_control, DaemonEvent};
use crate::hub::{SendError, SubscriberTransport};

/// Outbound messages buffered per client before sends start timing out
const CLIENT_QUEUE: usize = 64;

/// Hub-side handle for one WebSocket client.
pub struct WsSubscriber {
    outbound: mpsc::Sender<Message>,
    send_timeout: Duration,
}

impl WsSubscriber {
    pub fn new(outbound: mpsc::Sender<Message>, send_timeout: Duration) -> Self {
        Self { outbound, send_timeout }
    }
}

#[async_trait]
impl SubscriberTransport for WsSubscriber {
    async fn send(&self, message: String) -> Result<(), SendError> {
        match tokio::time::timeout(self.send_timeout, self.outbound.send(Message::text(message))).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(SendError::Closed),
            Err(_) => Err(SendError::Timeout),
        }
    }

    fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }
}

/// Accept connections until the shutdown flag flips to true.
pub async fn serve(
    listener: TcpListener,
    events: mpsc::Sender<DaemonEvent>,
    send_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    if let Ok(addr) = listener.local_addr() {
        tlog!("[server] Listening on ws://{}", addr);
    }
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let events = events.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, addr, events, send_timeout).await {
                            tlog!("[server] {}: {}", addr, e);
                        }
                    });
                }
                Err(e) => tlog!("[server] Accept failed: {}", e),
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    tlog!("[server] Accept loop stopped");
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    events: mpsc::Sender<DaemonEvent>,
    send_timeout: Duration,
) -> Result<(), String> {
    let ws = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|e| format!("Failed to complete WebSocket handshake: {}", e))?;
    let (mut sink, mut source) = ws.split();

    let id = Uuid::new_v4();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Message>(CLIENT_QUEUE);
    let transport = Arc::new(WsSubscriber::new(outbound_tx, send_timeout));
    events
        .send(DaemonEvent::ClientConnected { id, transport })
        .await
        .map_err(|_| "Daemon loop is not running".to_string())?;
    tlog!("[server] Client {} connected from {}", id, addr);

    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(frame) = source.next().await {
        match frame {
            Ok(Message::Text(text)) => match parse_control(text.as_str()) {
                Ok(command) => {
                    if events.send(DaemonEvent::Control { client: id, command }).await.is_err() {
                        break;
                    }
                }
                Err(e) => tlog!("[server] Ignoring malformed message from {}: {}", id, e),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tlog!("[server] Client {} read error: {}", id, e);
                break;
            }
        }
    }

    let _ = events.send(DaemonEvent::ClientDisconnected(id)).await;
    writer.abort();
    tlog!("[server] Client {} disconnected", id);
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
