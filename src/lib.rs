//! Face detection over RTSP camera streams.
//!
//! A session consumes the MJPEG byte stream produced by an ffmpeg subprocess
//! (or any other [`StreamSource`]), cuts it into complete JPEG frames, runs a
//! face detector on each frame and publishes lifecycle events.
//!
//! # Module Structure
//!
//! - `frame`: JPEG boundary detection and the byte accumulator
//! - `ingest`: byte stream sources (ffmpeg subprocess, in-process channel)
//! - `detect`: detector trait, result types, backends and registry
//! - `dispatch`: per-frame detection and per-face `detect` events
//! - `events`: event payloads and the session event bus
//! - `session`: the `FaceStream` facade and its state machine
//! - `relay`: WebSocket binary push to live viewers
//! - `codec`: JPEG decode, encode, crop and annotation
//! - `config`: defaults, config file and environment overrides

use std::thread::JoinHandle;

pub mod codec;
pub mod config;
pub mod detect;
pub mod dispatch;
pub mod events;
pub mod frame;
pub mod ingest;
pub mod relay;
pub mod session;

pub use config::{random_session_name, StreamConfig};
pub use detect::{
    BackendRegistry, DetectorOptions, FaceBox, FaceDetection, FaceDetector, ImageDims,
    SharedDetector, StubDetector,
};
pub use dispatch::{ClampedBox, DispatchContext, DispatchOutcome, Dispatcher};
pub use events::{
    DetectEvent, DetectionData, ErrorEvent, EventBus, EventEmitter, EventKind, FrameBytes,
    Handler, ListenerId, SessionEvent,
};
pub use frame::{is_frame_complete, ByteAccumulator, CompletedFrame, JPEG_EOI, JPEG_SOI};
pub use ingest::{ChannelSource, FeedHandle, FfmpegProfile, FfmpegSource, StreamSource};
pub use relay::{RelayConfig, RelayHandle, RelayPublisher, RelayServer};
pub use session::{FaceStream, FaceStreamBuilder, SessionHandle, SessionState, SessionStats};

/// Join a worker thread unless it is the calling thread.
///
/// Teardown may be triggered from inside an event handler running on the
/// worker itself; joining there would deadlock.
pub(crate) fn join_unless_current(handle: Option<JoinHandle<()>>) {
    let Some(handle) = handle else { return };
    if handle.thread().id() == std::thread::current().id() {
        return;
    }
    if handle.join().is_err() {
        log::warn!("worker thread panicked");
    }
}
