// src/io/types.rs
//
// Messages from device pollers to the daemon loop.

use super::{DeviceKind, Reading};

/// Internal message from pollers to the daemon loop
#[derive(Debug, Clone)]
pub enum SourceMessage {
    /// A decoded reading ready for broadcast and storage
    Reading(Reading),
    /// Device opened (kind, human-readable description)
    Connected(DeviceKind, String),
    /// Recoverable device error; the poller keeps retrying
    Error(DeviceKind, String),
    /// Poller loop exited (kind, reason)
    Ended(DeviceKind, String),
}

impl SourceMessage {
    pub fn device(&self) -> DeviceKind {
        match self {
            SourceMessage::Reading(reading) => reading.device(),
            SourceMessage::Connected(kind, _)
            | SourceMessage::Error(kind, _)
            | SourceMessage::Ended(kind, _) => *kind,
        }
    }
}
