// src/io/uart/framer.rs
//
// Start-marker synchronizer for the 64-byte UART telemetry frames.
//
// Frame layout:
//   [0:4]   start marker (selects the frame family)
//   [4]     command
//   [5]     status
//   [6]     payload length
//   [7:62]  payload (55 bytes)
//   [62:64] CRC-16, big-endian, over [4:62]

use serde::{Deserialize, Serialize};

// =============================================================================
// Constants
// =============================================================================

pub const FRAME_SIZE: usize = 64;
pub const MARKER_LEN: usize = 4;

/// Bytes dropped per feed when no marker is buffered
pub const NOISE_DISCARD: usize = 10;

/// Upper bound on marker-less buffered bytes before the cursor is flushed
const MAX_UNSYNCED: usize = 512;

const TEMPERATURE_MARKER: [u8; MARKER_LEN] = [0x01, 0x02, 0x03, 0x04];
const HIGH_TEMPERATURE_MARKER: [u8; MARKER_LEN] = [0x03, 0x03, 0x03, 0x03];
const TRACTION_MARKER: [u8; MARKER_LEN] = [0x05, 0x02, 0x03, 0x04];

// =============================================================================
// Types
// =============================================================================

/// Telemetry frame family, selected by the 4-byte start marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameFamily {
    Temperature,
    HighTemperature,
    Traction,
}

impl FrameFamily {
    pub const ALL: [FrameFamily; 3] = [
        FrameFamily::Temperature,
        FrameFamily::HighTemperature,
        FrameFamily::Traction,
    ];

    pub fn marker(self) -> [u8; MARKER_LEN] {
        match self {
            FrameFamily::Temperature => TEMPERATURE_MARKER,
            FrameFamily::HighTemperature => HIGH_TEMPERATURE_MARKER,
            FrameFamily::Traction => TRACTION_MARKER,
        }
    }

    pub fn from_marker(bytes: &[u8]) -> Option<Self> {
        let head = bytes.get(..MARKER_LEN)?;
        Self::ALL.into_iter().find(|f| f.marker() == head)
    }
}

/// A 64-byte window starting at a known marker. Only the synchronizer
/// (or [`FrameCandidate::from_bytes`]) creates these, so the marker
/// always matches the family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameCandidate {
    family: FrameFamily,
    bytes: [u8; FRAME_SIZE],
}

impl FrameCandidate {
    /// Wrap a raw 64-byte slice. `None` if the length or marker is wrong.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let family = FrameFamily::from_marker(bytes)?;
        let bytes: [u8; FRAME_SIZE] = bytes.try_into().ok()?;
        Some(Self { family, bytes })
    }

    pub fn family(&self) -> FrameFamily {
        self.family
    }

    pub fn bytes(&self) -> &[u8; FRAME_SIZE] {
        &self.bytes
    }
}

/// Counters for discarded and delivered data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Bytes dropped because no marker was buffered
    pub noise_discarded: u64,
    /// Bytes dropped ahead of a found marker
    pub pre_marker_discarded: u64,
    pub candidates: u64,
    /// Candidates the caller rejected (checksum failures)
    pub rejected: u64,
}

enum SyncOutcome {
    /// Cursor starts with a marker
    Aligned,
    /// Nothing buffered
    Empty,
    /// No marker found; noise was discarded
    NoMarker,
}

// =============================================================================
// Synchronizer
// =============================================================================

/// Stateful byte accumulator for one physical link.
#[derive(Debug, Default)]
pub struct FrameSynchronizer {
    cursor: Vec<u8>,
    pending: Option<FrameFamily>,
    stats: SyncStats,
}

impl FrameSynchronizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `bytes` and return a lazy sequence of candidates.
    ///
    /// Each yielded candidate is consumed (64 bytes removed) when the next
    /// one is requested or the sequence is dropped, unless the caller calls
    /// [`Candidates::reject`] first, in which case only one leading byte is
    /// dropped and synchronization restarts from there.
    pub fn feed(&mut self, bytes: &[u8]) -> Candidates<'_> {
        self.cursor.extend_from_slice(bytes);
        Candidates {
            sync: self,
            outstanding: false,
            exhausted: false,
        }
    }

    pub fn buffered(&self) -> usize {
        self.cursor.len()
    }

    pub fn stats(&self) -> SyncStats {
        self.stats
    }

    fn find_marker(&self) -> Option<(usize, FrameFamily)> {
        if self.cursor.len() < MARKER_LEN {
            return None;
        }
        self.cursor
            .windows(MARKER_LEN)
            .enumerate()
            .find_map(|(pos, window)| FrameFamily::from_marker(window).map(|f| (pos, f)))
    }

    /// Length of a trailing partial marker that may complete on the next feed.
    fn partial_marker_tail(&self) -> usize {
        let len = self.cursor.len();
        for k in (1..MARKER_LEN).rev() {
            if len < k {
                continue;
            }
            let tail = &self.cursor[len - k..];
            if FrameFamily::ALL.iter().any(|f| f.marker()[..k] == *tail) {
                return k;
            }
        }
        0
    }

    fn synchronize(&mut self) -> SyncOutcome {
        if self.cursor.is_empty() {
            self.pending = None;
            return SyncOutcome::Empty;
        }
        if let Some(family) = self.pending {
            if self.cursor.starts_with(&family.marker()) {
                return SyncOutcome::Aligned;
            }
            self.pending = None;
        }

        match self.find_marker() {
            Some((pos, family)) => {
                if pos > 0 {
                    tlog!("[uart] Discarding {} bytes before start marker", pos);
                    self.cursor.drain(..pos);
                    self.stats.pre_marker_discarded += pos as u64;
                }
                self.pending = Some(family);
                SyncOutcome::Aligned
            }
            None => {
                let tail = self.partial_marker_tail();
                let len = self.cursor.len();
                let drop = if len > MAX_UNSYNCED {
                    len - tail
                } else if len > NOISE_DISCARD {
                    NOISE_DISCARD.min(len - tail)
                } else {
                    len - tail
                };
                if drop > 0 {
                    tlog!(
                        "[uart] No start marker found. Discarding {} bytes. Sample: {}",
                        drop,
                        hex::encode(&self.cursor[..drop.min(NOISE_DISCARD)])
                    );
                    self.cursor.drain(..drop);
                    self.stats.noise_discarded += drop as u64;
                }
                SyncOutcome::NoMarker
            }
        }
    }

    fn peek_candidate(&self) -> Option<FrameCandidate> {
        let family = self.pending?;
        if self.cursor.len() < FRAME_SIZE {
            return None;
        }
        let mut bytes = [0u8; FRAME_SIZE];
        bytes.copy_from_slice(&self.cursor[..FRAME_SIZE]);
        Some(FrameCandidate { family, bytes })
    }

    fn consume_frame(&mut self) {
        let n = FRAME_SIZE.min(self.cursor.len());
        self.cursor.drain(..n);
        self.pending = None;
    }

    fn skip_byte(&mut self) {
        if !self.cursor.is_empty() {
            self.cursor.remove(0);
        }
        self.pending = None;
        self.stats.rejected += 1;
    }
}

/// Lazy candidate sequence returned by [`FrameSynchronizer::feed`].
pub struct Candidates<'a> {
    sync: &'a mut FrameSynchronizer,
    /// A candidate was yielded and not yet consumed or rejected
    outstanding: bool,
    /// The one noise discard for this feed already happened
    exhausted: bool,
}

impl Candidates<'_> {
    /// Reject the most recently yielded candidate: drop exactly one byte
    /// and resynchronize on the remainder.
    pub fn reject(&mut self) {
        if self.outstanding {
            self.outstanding = false;
            self.sync.skip_byte();
        }
    }
}

impl Iterator for Candidates<'_> {
    type Item = FrameCandidate;

    fn next(&mut self) -> Option<FrameCandidate> {
        if self.outstanding {
            self.outstanding = false;
            self.sync.consume_frame();
        }
        if self.exhausted {
            return None;
        }
        match self.sync.synchronize() {
            SyncOutcome::Aligned => {
                let candidate = self.sync.peek_candidate()?;
                self.outstanding = true;
                self.sync.stats.candidates += 1;
                Some(candidate)
            }
            SyncOutcome::Empty => None,
            SyncOutcome::NoMarker => {
                self.exhausted = true;
                None
            }
        }
    }
}

impl Drop for Candidates<'_> {
    fn drop(&mut self) {
        if self.outstanding {
            self.sync.consume_frame();
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
