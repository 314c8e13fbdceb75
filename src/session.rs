//! `FaceStream`: one consumer session over one camera stream.
//!
//! State machine:
//!
//! ```text
//! Idle -> Loading -> Listening <-> Detecting
//!   \________\__________\___________\______-> Stopped
//! Error is reachable from Loading and Listening (fatal faults only).
//! ```
//!
//! Threads per started session:
//! - listener: receives source chunks, grows the accumulator, emits `data` /
//!   `warn`, and hands completed frames to the bounded detection queue.
//! - worker: drains the queue one frame at a time through the `Dispatcher`.
//!
//! The listener never waits for detection. When the queue is full the newest
//! frame is dropped with a `warn`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Result};

use crate::config::StreamConfig;
use crate::detect::SharedDetector;
use crate::dispatch::{DispatchContext, Dispatcher};
use crate::events::{
    lock_or_recover, DataEvent, ErrorEvent, EventBus, EventEmitter, EventKind, FrameBytes,
    Handler, LifecycleEvent, ListenerId, SessionEvent, StopEvent, WarnEvent,
};
use crate::frame::{ByteAccumulator, CompletedFrame, JPEG_EOI};
use crate::ingest::{FfmpegProfile, FfmpegSource, SourceEvent, StreamInfo, StreamSource};
use crate::join_unless_current;
use crate::relay::{RelayConfig, RelayHandle, RelayPublisher, RelayServer, SourceRelay};

const SOURCE_POLL: Duration = Duration::from_millis(50);

/// `url` reported in `detect` payloads of sessions built from a stream.
pub const STREAM_URL_PLACEHOLDER: &str = "stream";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Loading,
    Listening,
    Detecting,
    Stopped,
    Error,
}

impl SessionState {
    fn is_terminal(self) -> bool {
        matches!(self, SessionState::Stopped | SessionState::Error)
    }
}

/// Counters since construction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub chunks: u64,
    pub bytes: u64,
    /// Chunks shorter than two bytes.
    pub chunks_rejected: u64,
    pub frames_completed: u64,
    pub frames_dispatched: u64,
    /// Frames dropped because the queue was full or the session stopped.
    pub frames_dropped: u64,
    pub detections_emitted: u64,
}

#[derive(Default)]
struct Counters {
    chunks: AtomicU64,
    bytes: AtomicU64,
    chunks_rejected: AtomicU64,
    frames_completed: AtomicU64,
    frames_dispatched: AtomicU64,
    frames_dropped: AtomicU64,
    detections_emitted: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> SessionStats {
        SessionStats {
            chunks: self.chunks.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            chunks_rejected: self.chunks_rejected.load(Ordering::Relaxed),
            frames_completed: self.frames_completed.load(Ordering::Relaxed),
            frames_dispatched: self.frames_dispatched.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            detections_emitted: self.detections_emitted.load(Ordering::Relaxed),
        }
    }
}

#[derive(Default)]
struct Runtime {
    source: Option<Box<dyn StreamSource>>,
    listener: Option<JoinHandle<()>>,
    worker: Option<JoinHandle<()>>,
    relay: Option<RelayHandle>,
    jsmpeg_relay: Option<RelayHandle>,
    jsmpeg_source: Option<SourceRelay>,
}

struct Inner {
    config: StreamConfig,
    stream_info: StreamInfo,
    url_backed: bool,
    bus: Arc<EventBus>,
    detector: SharedDetector,
    ffmpeg_program: String,
    state: Mutex<SessionState>,
    stopped: AtomicBool,
    accumulator: Mutex<ByteAccumulator>,
    /// Sending side of the detection queue. Taken by `stop` so the worker's
    /// receive loop ends even when the listener thread is the one stopping.
    queue: Mutex<Option<SyncSender<CompletedFrame>>>,
    counters: Counters,
    runtime: Mutex<Runtime>,
}

/// Builder for [`FaceStream`].
pub struct FaceStreamBuilder {
    config: StreamConfig,
    stream: Option<Box<dyn StreamSource>>,
    detector: Option<SharedDetector>,
    ffmpeg_program: String,
}

impl FaceStreamBuilder {
    /// Consume an already running stream instead of spawning ffmpeg.
    /// Ignored when the config carries a `url`.
    pub fn stream<S: StreamSource + 'static>(mut self, source: S) -> Self {
        self.stream = Some(Box::new(source));
        self
    }

    pub fn detector(mut self, detector: SharedDetector) -> Self {
        self.detector = Some(detector);
        self
    }

    /// ffmpeg executable used for URL-backed sessions.
    pub fn ffmpeg_program(mut self, program: &str) -> Self {
        self.ffmpeg_program = program.to_string();
        self
    }

    pub fn build(self) -> Result<FaceStream> {
        self.config.validate()?;
        let detector = self
            .detector
            .ok_or_else(|| anyhow!("face stream loading failed: no face detector configured"))?;

        let (source, url_backed): (Box<dyn StreamSource>, bool) =
            match (&self.config.url, self.stream) {
                (Some(url), _) => (
                    Box::new(
                        FfmpegSource::new(url, FfmpegProfile::Mjpeg)
                            .with_program(&self.ffmpeg_program),
                    ),
                    true,
                ),
                (None, Some(stream)) => (stream, false),
                (None, None) => {
                    return Err(anyhow!(
                        "face stream loading failed: neither url nor stream configured"
                    ))
                }
            };

        let stream_info = source.describe();
        log::info!(
            "session {} created for {} source",
            self.config.name,
            stream_info.kind
        );
        Ok(FaceStream {
            inner: Arc::new(Inner {
                config: self.config,
                stream_info,
                url_backed,
                bus: Arc::new(EventBus::new()),
                detector,
                ffmpeg_program: self.ffmpeg_program,
                state: Mutex::new(SessionState::Idle),
                stopped: AtomicBool::new(false),
                accumulator: Mutex::new(ByteAccumulator::new()),
                queue: Mutex::new(None),
                counters: Counters::default(),
                runtime: Mutex::new(Runtime {
                    source: Some(source),
                    ..Runtime::default()
                }),
            }),
        })
    }
}

/// A face detection session. Dropping it stops the session.
pub struct FaceStream {
    inner: Arc<Inner>,
}

/// Cloneable control handle, usable from event handlers and other threads.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<Inner>,
}

impl SessionHandle {
    pub fn stop(&self) {
        self.inner.stop();
    }

    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }
}

impl FaceStream {
    pub fn builder(config: StreamConfig) -> FaceStreamBuilder {
        FaceStreamBuilder {
            config,
            stream: None,
            detector: None,
            ffmpeg_program: "ffmpeg".to_string(),
        }
    }

    /// URL-backed session using `detector`.
    pub fn new(config: StreamConfig, detector: SharedDetector) -> Result<Self> {
        Self::builder(config).detector(detector).build()
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn config(&self) -> &StreamConfig {
        &self.inner.config
    }

    pub fn stream_info(&self) -> &StreamInfo {
        &self.inner.stream_info
    }

    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    pub fn stats(&self) -> SessionStats {
        self.inner.counters.snapshot()
    }

    /// Channel receiving every event emitted from now on.
    pub fn events(&self) -> Receiver<SessionEvent> {
        self.inner.bus.subscribe()
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            inner: self.inner.clone(),
        }
    }

    /// Emit `start`, load the detector, emit `load`, then begin consuming the
    /// stream. Only valid once, from `Idle`.
    pub fn start(&self) -> Result<()> {
        self.inner.clone().start()
    }

    /// Emit `stop`, clear buffered bytes and release the stream, relays and
    /// threads. Emits exactly one `stop` no matter how often it is called.
    pub fn stop(&self) {
        self.inner.stop();
    }
}

impl EventEmitter for FaceStream {
    fn on(&self, kind: EventKind, handler: Handler) -> ListenerId {
        self.inner.bus.on(kind, handler)
    }

    fn off(&self, id: ListenerId) -> bool {
        self.inner.bus.off(id)
    }

    fn emit(&self, event: SessionEvent) {
        self.inner.bus.emit(event);
    }
}

impl Drop for FaceStream {
    fn drop(&mut self) {
        self.inner.stop();
    }
}

impl Inner {
    fn state(&self) -> SessionState {
        *lock_or_recover(&self.state)
    }

    /// Move to `next` unless the session already ended.
    fn advance(&self, next: SessionState) {
        let mut state = lock_or_recover(&self.state);
        if !state.is_terminal() {
            *state = next;
        }
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn lifecycle(&self) -> LifecycleEvent {
        LifecycleEvent {
            name: self.config.name.clone(),
            stream: self.stream_info.clone(),
        }
    }

    fn emit_error(&self, message: String, buffer: Option<FrameBytes>, fatal: bool) {
        if fatal {
            log::error!("session {}: {}", self.config.name, message);
        } else {
            log::warn!("session {}: {}", self.config.name, message);
        }
        self.bus.emit(SessionEvent::Error(ErrorEvent {
            name: Some(self.config.name.clone()),
            message,
            buffer,
            fatal,
        }));
    }

    fn fail(&self, message: String, buffer: Option<FrameBytes>) {
        self.advance(SessionState::Error);
        self.emit_error(message, buffer, true);
    }

    fn start(self: Arc<Self>) -> Result<()> {
        {
            let mut state = lock_or_recover(&self.state);
            if *state != SessionState::Idle {
                return Err(anyhow!(
                    "session {} cannot start from state {:?}",
                    self.config.name,
                    *state
                ));
            }
            *state = SessionState::Loading;
        }
        self.bus.emit(SessionEvent::Start(self.lifecycle()));

        if let Err(err) = self.load_detector() {
            let message = format!("face stream loading failed: {:#}", err);
            self.fail(message.clone(), None);
            return Err(anyhow!(message));
        }
        if self.is_stopped() {
            log::info!("session {} stopped while loading", self.config.name);
            return Ok(());
        }
        self.advance(SessionState::Listening);
        self.bus.emit(SessionEvent::Load(self.lifecycle()));

        let source = lock_or_recover(&self.runtime).source.take();
        let Some(mut source) = source else {
            return Err(anyhow!("session {} has no stream source", self.config.name));
        };
        let chunks = match source.open() {
            Ok(rx) => rx,
            Err(err) => {
                let message = format!("failed to open {} stream: {:#}", self.stream_info.kind, err);
                self.fail(message.clone(), None);
                lock_or_recover(&self.runtime).source = Some(source);
                return Err(anyhow!(message));
            }
        };

        let relay = if self.url_backed {
            self.spawn_relay(self.config.port)
        } else {
            None
        };
        let (jsmpeg_relay, jsmpeg_source) = self.spawn_jsmpeg_relay();

        let (frame_tx, frame_rx) = mpsc::sync_channel(self.config.queue_depth);
        *lock_or_recover(&self.queue) = Some(frame_tx);
        let dispatcher = Dispatcher::new(
            DispatchContext {
                name: self.config.name.clone(),
                url: self
                    .config
                    .url
                    .clone()
                    .unwrap_or_else(|| STREAM_URL_PLACEHOLDER.to_string()),
                port: self.config.port,
                threshold: self.config.score,
            },
            self.detector.clone(),
            self.bus.clone(),
        );

        let worker_inner = self.clone();
        let worker = std::thread::spawn(move || worker_inner.run_worker(dispatcher, frame_rx));
        let listener_inner = self.clone();
        let publisher = relay.as_ref().map(RelayHandle::publisher);
        let listener = std::thread::spawn(move || listener_inner.run_listener(chunks, publisher));

        let mut runtime = lock_or_recover(&self.runtime);
        runtime.source = Some(source);
        runtime.listener = Some(listener);
        runtime.worker = Some(worker);
        runtime.relay = relay;
        runtime.jsmpeg_relay = jsmpeg_relay;
        runtime.jsmpeg_source = jsmpeg_source;
        if self.is_stopped() {
            // stop() ran before the runtime was published; release it here.
            let released = std::mem::take(&mut *runtime);
            drop(runtime);
            lock_or_recover(&self.queue).take();
            release(released);
            return Ok(());
        }
        log::info!(
            "session {} listening on {} source",
            self.config.name,
            self.stream_info.kind
        );
        Ok(())
    }

    fn load_detector(&self) -> Result<()> {
        let mut detector = self
            .detector
            .lock()
            .map_err(|_| anyhow!("detector lock poisoned"))?;
        log::info!(
            "loading {} detector from {}",
            detector.name(),
            self.config.weights_dir.display()
        );
        detector.load(&self.config.weights_dir, &self.config.detector)
    }

    fn spawn_relay(&self, port: u16) -> Option<RelayHandle> {
        match RelayServer::new(RelayConfig::new(&self.config.relay_bind, port)).spawn() {
            Ok(handle) => Some(handle),
            Err(err) => {
                self.emit_error(format!("relay unavailable: {:#}", err), None, false);
                None
            }
        }
    }

    fn spawn_jsmpeg_relay(&self) -> (Option<RelayHandle>, Option<SourceRelay>) {
        let (Some(port), Some(url)) = (self.config.jsmpeg_port, self.config.url.as_deref()) else {
            return (None, None);
        };
        let Some(handle) = self.spawn_relay(port) else {
            return (None, None);
        };
        let source = FfmpegSource::new(url, FfmpegProfile::Mpeg1).with_program(&self.ffmpeg_program);
        match SourceRelay::start(Box::new(source), handle.publisher()) {
            Ok(relay) => (Some(handle), Some(relay)),
            Err(err) => {
                self.emit_error(format!("mpeg1 relay unavailable: {:#}", err), None, false);
                (None, None)
            }
        }
    }

    fn run_listener(&self, chunks: Receiver<SourceEvent>, publisher: Option<RelayPublisher>) {
        loop {
            if self.is_stopped() {
                break;
            }
            match chunks.recv_timeout(SOURCE_POLL) {
                Ok(SourceEvent::Data(chunk)) => {
                    if let Some(publisher) = &publisher {
                        publisher.publish(&chunk);
                    }
                    self.handle_chunk(&chunk);
                }
                Ok(SourceEvent::ExitWithError(reason)) => {
                    if self.is_stopped() {
                        break;
                    }
                    let buffer = FrameBytes::from(lock_or_recover(&self.accumulator).as_bytes());
                    self.fail(
                        format!("stream exited with error, stream closed: {}", reason),
                        Some(buffer),
                    );
                    break;
                }
                Ok(SourceEvent::Closed) | Err(RecvTimeoutError::Disconnected) => {
                    log::info!("session {}: stream ended", self.config.name);
                    break;
                }
                Err(RecvTimeoutError::Timeout) => continue,
            }
        }
    }

    /// Accumulate one chunk and act on the frame boundary.
    fn handle_chunk(&self, chunk: &[u8]) {
        self.counters.chunks.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes
            .fetch_add(chunk.len() as u64, Ordering::Relaxed);

        if chunk.len() < 2 {
            self.counters.chunks_rejected.fetch_add(1, Ordering::Relaxed);
            self.emit_error(
                format!(
                    "camera data is shorter than 2 bytes ({} byte chunk discarded)",
                    chunk.len()
                ),
                Some(FrameBytes::from(chunk)),
                false,
            );
            return;
        }

        let want_data = self.bus.has_listeners(EventKind::Data);
        let (snapshot, outcome) = {
            let mut accumulator = lock_or_recover(&self.accumulator);
            accumulator.append(chunk);
            let snapshot = want_data.then(|| FrameBytes::from(accumulator.as_bytes()));
            let outcome = if accumulator.is_frame_complete() {
                Ok(accumulator.take_frame())
            } else {
                Err(accumulator.trailing_marker())
            };
            (snapshot, outcome)
        };

        if let Some(buffer) = snapshot {
            self.bus.emit(SessionEvent::Data(DataEvent {
                name: self.config.name.clone(),
                buffer,
            }));
        }

        match outcome {
            Ok(frame) => {
                self.counters.frames_completed.fetch_add(1, Ordering::Relaxed);
                self.enqueue(frame);
            }
            Err(marker) => {
                let [a, b] = marker.unwrap_or([0, 0]);
                self.bus.emit(SessionEvent::Warn(WarnEvent {
                    name: self.config.name.clone(),
                    message: format!(
                        "frame boundary not found: trailing bytes {:02x} {:02x} != {:02x} {:02x}, continue consuming",
                        a, b, JPEG_EOI[0], JPEG_EOI[1]
                    ),
                }));
            }
        }
    }

    fn enqueue(&self, frame: CompletedFrame) {
        let sent = match lock_or_recover(&self.queue).as_ref() {
            Some(queue) => queue.try_send(frame),
            None => Err(TrySendError::Disconnected(frame)),
        };
        match sent {
            Ok(()) => {}
            Err(TrySendError::Full(frame)) => {
                self.counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
                self.bus.emit(SessionEvent::Warn(WarnEvent {
                    name: self.config.name.clone(),
                    message: format!(
                        "detection queue full ({} pending), dropping frame {}",
                        self.config.queue_depth, frame.sequence
                    ),
                }));
            }
            Err(TrySendError::Disconnected(frame)) => {
                self.counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
                log::debug!("detection worker gone, dropping frame {}", frame.sequence);
            }
        }
    }

    fn run_worker(&self, dispatcher: Dispatcher, frames: Receiver<CompletedFrame>) {
        for frame in frames {
            if self.is_stopped() {
                self.counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            self.advance(SessionState::Detecting);
            self.counters.frames_dispatched.fetch_add(1, Ordering::Relaxed);
            let sequence = frame.sequence;
            match dispatcher.dispatch(frame) {
                Ok(outcome) => {
                    self.counters
                        .detections_emitted
                        .fetch_add(outcome.emitted as u64, Ordering::Relaxed);
                }
                Err(err) => {
                    self.emit_error(
                        format!("detection failed on frame {}: {:#}", sequence, err),
                        None,
                        false,
                    );
                }
            }
            self.advance(SessionState::Listening);
        }
    }

    fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let buffer = {
            let mut accumulator = lock_or_recover(&self.accumulator);
            let buffer = FrameBytes::from(accumulator.as_bytes());
            accumulator.clear();
            buffer
        };
        *lock_or_recover(&self.state) = SessionState::Stopped;
        self.bus.close_with(SessionEvent::Stop(StopEvent {
            name: self.config.name.clone(),
            buffer,
        }));
        log::info!("session {} stopped", self.config.name);

        lock_or_recover(&self.queue).take();
        let released = std::mem::take(&mut *lock_or_recover(&self.runtime));
        release(released);
    }
}

/// Close sources and relays, then wait for session threads.
fn release(mut runtime: Runtime) {
    if let Some(mut source) = runtime.source.take() {
        source.close();
    }
    if let Some(mut relay) = runtime.jsmpeg_source.take() {
        relay.stop();
    }
    for relay in [runtime.relay.take(), runtime.jsmpeg_relay.take()]
        .into_iter()
        .flatten()
    {
        if let Err(err) = relay.stop() {
            log::warn!("relay shutdown: {}", err);
        }
    }
    join_unless_current(runtime.listener.take());
    join_unless_current(runtime.worker.take());
}
