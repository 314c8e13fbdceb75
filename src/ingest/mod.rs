//! Byte stream sources.
//!
//! A source produces an unbounded sequence of byte chunks cut at arbitrary
//! points. It reports a failed producer with `ExitWithError` and a clean end of
//! stream with `Closed`.
//!
//! - `FfmpegSource`: an ffmpeg subprocess transcoding RTSP into MJPEG (or MPEG-1
//!   for the secondary relay).
//! - `ChannelSource`: an in-process feed for callers that already own a stream.

use std::sync::mpsc::Receiver;

use anyhow::Result;
use serde::Serialize;

pub mod channel;
pub mod ffmpeg;

pub use channel::{ChannelSource, FeedHandle};
pub use ffmpeg::{FfmpegProfile, FfmpegSource};

/// Size of one read from a subprocess pipe.
pub const READ_CHUNK_BYTES: usize = 64 * 1024;

#[derive(Debug)]
pub enum SourceEvent {
    Data(Vec<u8>),
    /// The producer died. The message describes why.
    ExitWithError(String),
    Closed,
}

/// Description of a source, echoed in `start` / `load` events.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StreamInfo {
    pub kind: String,
    pub url: Option<String>,
}

pub trait StreamSource: Send {
    fn describe(&self) -> StreamInfo;

    /// Start producing. Called at most once per source.
    fn open(&mut self) -> Result<Receiver<SourceEvent>>;

    /// Release the producer. Idempotent. The receiver returned by `open`
    /// disconnects once the producer is gone.
    fn close(&mut self);
}
