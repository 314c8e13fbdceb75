//! MJPEG frame assembly.
//!
//! The ingestion feed delivers an unbounded byte stream cut at arbitrary points.
//! Frames are segmented with a single heuristic: the accumulated bytes form a
//! complete frame when they end with the JPEG End-Of-Image marker.
//!
//! - `is_frame_complete`: the boundary check (pure).
//! - `ByteAccumulator`: append-only buffer owned by one session.
//! - `CompletedFrame`: a finished frame, moved out of the accumulator by value.
//!
//! Interior markers are never scanned for. A stream that does not end its chunks
//! on image boundaries keeps accumulating until one does.

use std::fmt;

/// Buffered size that first triggers an oversize warning.
pub const OVERSIZE_WARN_BYTES: usize = 16 * 1024 * 1024;

/// JPEG Start-Of-Image marker.
pub const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];

/// JPEG End-Of-Image marker. A frame is complete when the buffer ends with it.
pub const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];

/// Returns true iff `buffer` is at least two bytes long and ends with `JPEG_EOI`.
pub fn is_frame_complete(buffer: &[u8]) -> bool {
    trailing_marker(buffer) == Some(JPEG_EOI)
}

/// Last two bytes of `buffer`, if there are at least two.
pub fn trailing_marker(buffer: &[u8]) -> Option<[u8; 2]> {
    match buffer {
        [.., a, b] => Some([*a, *b]),
        _ => None,
    }
}

/// Append-only byte buffer for one stream session.
///
/// Between resets it holds exactly the bytes received since the last reset,
/// in arrival order. Growth is never capped, but each doubling past the
/// warning size is logged so a stream that lost frame sync is visible.
pub struct ByteAccumulator {
    data: Vec<u8>,
    frames_taken: u64,
    warn_at: usize,
    next_warning: usize,
}

impl Default for ByteAccumulator {
    fn default() -> Self {
        Self::with_size_warning(OVERSIZE_WARN_BYTES)
    }
}

impl ByteAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accumulator that warns once its contents reach `bytes`.
    pub fn with_size_warning(bytes: usize) -> Self {
        let warn_at = bytes.max(1);
        Self {
            data: Vec::new(),
            frames_taken: 0,
            warn_at,
            next_warning: warn_at,
        }
    }

    /// Append `chunk`. Returns true when this append crossed a warning size.
    pub fn append(&mut self, chunk: &[u8]) -> bool {
        self.data.extend_from_slice(chunk);
        if self.data.len() < self.next_warning {
            return false;
        }
        log::warn!(
            "{} bytes buffered without a frame boundary; the stream may have lost frame sync",
            self.data.len()
        );
        while self.next_warning <= self.data.len() {
            self.next_warning = self.next_warning.saturating_mul(2);
        }
        true
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn is_frame_complete(&self) -> bool {
        is_frame_complete(&self.data)
    }

    pub fn trailing_marker(&self) -> Option<[u8; 2]> {
        trailing_marker(&self.data)
    }

    /// Move the buffered bytes out as a completed frame, leaving the
    /// accumulator empty for the next frame.
    pub fn take_frame(&mut self) -> CompletedFrame {
        self.frames_taken += 1;
        self.next_warning = self.warn_at;
        CompletedFrame {
            sequence: self.frames_taken,
            bytes: std::mem::take(&mut self.data),
        }
    }

    /// Discard buffered bytes without producing a frame.
    pub fn clear(&mut self) {
        self.data.clear();
        self.next_warning = self.warn_at;
    }

    /// Number of frames handed out by `take_frame` so far.
    pub fn frames_taken(&self) -> u64 {
        self.frames_taken
    }
}

impl fmt::Debug for ByteAccumulator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteAccumulator")
            .field("len", &self.data.len())
            .field("frames_taken", &self.frames_taken)
            .finish()
    }
}

/// One complete encoded frame, owned by the dispatch that processes it.
pub struct CompletedFrame {
    /// 1-based position of this frame in the session.
    pub sequence: u64,
    pub bytes: Vec<u8>,
}

impl CompletedFrame {
    /// True when the frame also starts with a JPEG SOI marker.
    /// Informational only; segmentation never depends on it.
    pub fn starts_with_soi(&self) -> bool {
        self.bytes.starts_with(&JPEG_SOI)
    }
}

impl fmt::Debug for CompletedFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletedFrame")
            .field("sequence", &self.sequence)
            .field("len", &self.bytes.len())
            .finish()
    }
}
