// src/io/uart/mod.rs
//
// Microcontroller telemetry link: 64-byte CRC-protected frames in three
// families, requested periodically and decoded as they arrive.

pub mod codec;
pub mod framer;
pub mod listener;

pub use codec::{
    build_frame, build_frame_with_payload, decode_frame, validate_and_decode, TelemetryError,
    TelemetryFields, TelemetrySample, TelemetrySnapshot,
};
pub use framer::{FrameCandidate, FrameFamily, FrameSynchronizer, SyncStats};
pub use listener::{RequestSchedule, SerialUartLink, UartLink, UartListener, UartOpener};
