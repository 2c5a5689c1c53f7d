// src/sessions.rs
//
// Test session tracking. The active session decides which partitions the
// recorder writes to; it is published through a watch channel so readers
// always see one consistent version.

use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

use crate::io::{DeviceKind, Reading};
use crate::storage::{PartitionHandle, StorageEngine, StorageError};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("failed to allocate session {session_id}: {reason}")]
    Allocation { session_id: u64, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Active,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPartitions {
    pub telemetry: PartitionHandle,
    pub multimeter: PartitionHandle,
    pub oscilloscope: PartitionHandle,
}

impl SessionPartitions {
    fn live() -> Self {
        Self {
            telemetry: PartitionHandle::live(DeviceKind::Uart),
            multimeter: PartitionHandle::live(DeviceKind::Multimeter),
            oscilloscope: PartitionHandle::live(DeviceKind::Oscilloscope),
        }
    }

    pub fn for_kind(&self, kind: DeviceKind) -> &PartitionHandle {
        match kind {
            DeviceKind::Uart => &self.telemetry,
            DeviceKind::Multimeter => &self.multimeter,
            DeviceKind::Oscilloscope => &self.oscilloscope,
        }
    }
}

/// Immutable snapshot of where readings go. Replaced, never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// 0 while idle
    pub id: u64,
    pub state: SessionState,
    pub partitions: SessionPartitions,
}

impl Session {
    pub fn idle() -> Self {
        Self {
            id: 0,
            state: SessionState::Idle,
            partitions: SessionPartitions::live(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }
}

/// Single writer of the active session. Owned by the daemon loop.
pub struct SessionManager {
    storage: Arc<dyn StorageEngine>,
    current: watch::Sender<Session>,
    last_id: u64,
}

impl SessionManager {
    pub fn new(storage: Arc<dyn StorageEngine>) -> Self {
        let (current, _) = watch::channel(Session::idle());
        Self { storage, current, last_id: 0 }
    }

    /// Receiver for the recorder and anyone else routing by session.
    pub fn subscribe(&self) -> watch::Receiver<Session> {
        self.current.subscribe()
    }

    pub fn current(&self) -> Session {
        self.current.borrow().clone()
    }

    /// Allocate the next session and make it active. All-or-nothing: on
    /// failure every partition created here is dropped again and the
    /// previous session stays in effect.
    pub fn start_new_test(&mut self) -> Result<Session, SessionError> {
        let fail = |session_id: u64, reason: String| SessionError::Allocation { session_id, reason };

        let session_id = self
            .storage
            .next_session_id()
            .map_err(|e| fail(self.last_id + 1, e.to_string()))?
            .max(self.last_id + 1);

        let mut created: Vec<PartitionHandle> = Vec::with_capacity(DeviceKind::ALL.len());
        for kind in DeviceKind::ALL {
            match self.storage.create_partition(session_id, kind) {
                Ok(partition) => created.push(partition),
                Err(e) => {
                    self.roll_back(&created);
                    tlog!("[sessions] Could not create {} partition for session {}: {}", kind, session_id, e);
                    return Err(fail(session_id, e.to_string()));
                }
            }
        }

        let session = Session {
            id: session_id,
            state: SessionState::Active,
            partitions: SessionPartitions {
                telemetry: created[0].clone(),
                multimeter: created[1].clone(),
                oscilloscope: created[2].clone(),
            },
        };

        // Move and swap under the watch write lock, so an append made through
        // `append_to_current` lands either before the move or in the new session.
        let storage = &self.storage;
        let mut moved = Ok(0);
        self.current.send_if_modified(|current| {
            moved = storage.move_live_rows(session_id);
            if moved.is_ok() {
                *current = session.clone();
            }
            moved.is_ok()
        });
        match moved {
            Ok(0) => {}
            Ok(rows) => tlog!("[sessions] Moved {} live rows into session {}", rows, session_id),
            Err(e) => {
                self.roll_back(&created);
                return Err(fail(session_id, e.to_string()));
            }
        }

        self.last_id = session_id;
        tlog!("[sessions] Session {} started", session_id);
        Ok(session)
    }

    /// Return to idle. Returns the id of the session that was active.
    pub fn stop_session(&mut self) -> Option<u64> {
        let previous = self.current();
        if !previous.is_active() {
            return None;
        }
        self.current.send_replace(Session::idle());
        tlog!("[sessions] Session {} stopped", previous.id);
        Some(previous.id)
    }

    fn roll_back(&self, created: &[PartitionHandle]) {
        for partition in created {
            if let Err(e) = self.storage.drop_partition(partition) {
                tlog!("[sessions] Failed to drop {} during rollback: {}", partition, e);
            }
        }
    }
}

/// Append a reading to the partition of the session current right now. The
/// session stays read-locked for the duration of the append.
pub fn append_to_current(
    session: &watch::Receiver<Session>,
    storage: &dyn StorageEngine,
    reading: &Reading,
) -> Result<PartitionHandle, StorageError> {
    let current = session.borrow();
    let partition = current.partitions.for_kind(reading.device());
    storage.append(partition, reading)?;
    Ok(partition.clone())
}

// ============================================================================
// Tests
// ============================================================================
