//! Session lifecycle events and the bus that delivers them.
//!
//! One producer (the session) publishes to any number of consumers. Required
//! relative ordering per session:
//!
//! `start` → `load` → any interleaving of `data` / `warn` / `detect` → `stop`
//!
//! `error` may appear anywhere. Within one frame, `detect` events for different
//! faces may arrive in any order. Once `stop` has been delivered the bus is closed
//! and later emissions are dropped.

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, ThreadId};

use chrono::{DateTime, Local, SecondsFormat};

use crate::detect::FaceDetection;
use crate::dispatch::ClampedBox;
use crate::ingest::StreamInfo;

/// Event names, as consumers subscribe to them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    Start,
    Load,
    Data,
    Warn,
    Detect,
    Error,
    Stop,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Start => "start",
            EventKind::Load => "load",
            EventKind::Data => "data",
            EventKind::Warn => "warn",
            EventKind::Detect => "detect",
            EventKind::Error => "error",
            EventKind::Stop => "stop",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable, cheaply cloned byte payload.
#[derive(Clone, PartialEq, Eq)]
pub struct FrameBytes(Arc<[u8]>);

impl FrameBytes {
    pub fn empty() -> Self {
        Self(Arc::from(Vec::new()))
    }
}

impl Deref for FrameBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for FrameBytes {
    fn from(bytes: Vec<u8>) -> Self {
        Self(Arc::from(bytes))
    }
}

impl From<&[u8]> for FrameBytes {
    fn from(bytes: &[u8]) -> Self {
        Self(Arc::from(bytes))
    }
}

impl fmt::Debug for FrameBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FrameBytes({} bytes)", self.0.len())
    }
}

/// Payload of `start` and `load`.
#[derive(Clone, Debug)]
pub struct LifecycleEvent {
    pub name: String,
    pub stream: StreamInfo,
}

/// Payload of `data`: the accumulated bytes after the chunk was appended.
#[derive(Clone, Debug)]
pub struct DataEvent {
    pub name: String,
    pub buffer: FrameBytes,
}

#[derive(Clone, Debug)]
pub struct WarnEvent {
    pub name: String,
    pub message: String,
}

/// Everything downstream consumers need about one detected face.
#[derive(Clone, Debug)]
pub struct DetectionData {
    /// Source URL, or `"stream"` when the session was given a stream directly.
    pub url: String,
    pub port: u16,
    pub detected_at: DateTime<Local>,
    /// Full frame, encoded once and shared by every face of the frame.
    pub image: FrameBytes,
    /// The face region cropped from `image`.
    pub image_cropped: FrameBytes,
    /// Region used for `image_cropped`.
    pub out: ClampedBox,
    pub face: FaceDetection,
}

impl DetectionData {
    pub fn detected_at_rfc3339(&self) -> String {
        self.detected_at.to_rfc3339_opts(SecondsFormat::Secs, false)
    }
}

/// Payload of `detect`.
#[derive(Clone, Debug)]
pub struct DetectEvent {
    pub name: String,
    /// Sequence number of the frame this face was found in.
    pub frame: u64,
    /// The frame bytes exactly as assembled from the stream.
    pub buffer: FrameBytes,
    pub data: DetectionData,
}

#[derive(Clone, Debug)]
pub struct ErrorEvent {
    pub name: Option<String>,
    pub message: String,
    pub buffer: Option<FrameBytes>,
    /// The session cannot continue after a fatal error.
    pub fatal: bool,
}

#[derive(Clone, Debug)]
pub struct StopEvent {
    pub name: String,
    /// Bytes that were still buffered when the session stopped.
    pub buffer: FrameBytes,
}

#[derive(Clone, Debug)]
pub enum SessionEvent {
    Start(LifecycleEvent),
    Load(LifecycleEvent),
    Data(DataEvent),
    Warn(WarnEvent),
    Detect(Box<DetectEvent>),
    Error(ErrorEvent),
    Stop(StopEvent),
}

impl SessionEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            SessionEvent::Start(_) => EventKind::Start,
            SessionEvent::Load(_) => EventKind::Load,
            SessionEvent::Data(_) => EventKind::Data,
            SessionEvent::Warn(_) => EventKind::Warn,
            SessionEvent::Detect(_) => EventKind::Detect,
            SessionEvent::Error(_) => EventKind::Error,
            SessionEvent::Stop(_) => EventKind::Stop,
        }
    }

    /// Session name carried by the payload, if any.
    pub fn name(&self) -> Option<&str> {
        match self {
            SessionEvent::Start(e) | SessionEvent::Load(e) => Some(&e.name),
            SessionEvent::Data(e) => Some(&e.name),
            SessionEvent::Warn(e) => Some(&e.name),
            SessionEvent::Detect(e) => Some(&e.name),
            SessionEvent::Error(e) => e.name.as_deref(),
            SessionEvent::Stop(e) => Some(&e.name),
        }
    }
}

/// Identifies a registered handler for `off`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

pub type Handler = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

/// Publish/subscribe contract of a session.
pub trait EventEmitter {
    /// Register `handler` for events of `kind`.
    fn on(&self, kind: EventKind, handler: Handler) -> ListenerId;

    /// Remove a handler. Returns false when it was not registered.
    fn off(&self, id: ListenerId) -> bool;

    /// Deliver `event` to every matching handler and subscriber.
    fn emit(&self, event: SessionEvent);
}

struct Listener {
    id: ListenerId,
    kind: Option<EventKind>,
    handler: Handler,
}

/// Deliveries in progress and whether the bus is closed.
#[derive(Default)]
struct Gate {
    closed: bool,
    delivering: Vec<ThreadId>,
}

/// In-process event bus.
///
/// Handlers run synchronously on the emitting thread, outside any bus lock,
/// so a handler may call back into the session (for example to stop it).
/// `close_with` waits for deliveries running on other threads, so nothing
/// reaches a handler after the final event.
#[derive(Default)]
pub struct EventBus {
    listeners: Mutex<Vec<Listener>>,
    subscribers: Mutex<Vec<Sender<SessionEvent>>>,
    next_id: AtomicU64,
    gate: Mutex<Gate>,
    drained: Condvar,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a closure for one event kind.
    pub fn listen<F>(&self, kind: EventKind, handler: F) -> ListenerId
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.register(Some(kind), Arc::new(handler))
    }

    /// Register a closure for every event kind.
    pub fn listen_all<F>(&self, handler: F) -> ListenerId
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.register(None, Arc::new(handler))
    }

    /// Channel receiving every event from now on. Dropping the receiver
    /// unsubscribes it on the next emission.
    pub fn subscribe(&self) -> Receiver<SessionEvent> {
        let (tx, rx) = mpsc::channel();
        lock_or_recover(&self.subscribers).push(tx);
        rx
    }

    /// True when anything would receive an event of `kind`.
    pub fn has_listeners(&self, kind: EventKind) -> bool {
        if !lock_or_recover(&self.subscribers).is_empty() {
            return true;
        }
        lock_or_recover(&self.listeners)
            .iter()
            .any(|l| l.kind.is_none() || l.kind == Some(kind))
    }

    /// Close the bus after delivering `last`. Later emissions are dropped.
    /// Returns false (and delivers nothing) if the bus was already closed.
    ///
    /// Blocks until deliveries on other threads have returned. A delivery on
    /// the calling thread (a handler closing the bus) is not waited for.
    pub fn close_with(&self, last: SessionEvent) -> bool {
        let me = thread::current().id();
        {
            let mut gate = lock_or_recover(&self.gate);
            if gate.closed {
                return false;
            }
            gate.closed = true;
            while gate.delivering.iter().any(|id| *id != me) {
                gate = match self.drained.wait(gate) {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
            }
        }
        self.deliver(&last);
        lock_or_recover(&self.subscribers).clear();
        true
    }

    pub fn is_closed(&self) -> bool {
        lock_or_recover(&self.gate).closed
    }

    /// Deliver `event` unless the bus is closed. Returns whether it was
    /// delivered.
    pub fn publish(&self, event: SessionEvent) -> bool {
        let me = thread::current().id();
        {
            let mut gate = lock_or_recover(&self.gate);
            if gate.closed {
                log::trace!("event bus closed; dropping {} event", event.kind());
                return false;
            }
            gate.delivering.push(me);
        }
        let _delivery = Delivery { bus: self, id: me };
        self.deliver(&event);
        true
    }

    fn register(&self, kind: Option<EventKind>, handler: Handler) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        lock_or_recover(&self.listeners).push(Listener { id, kind, handler });
        id
    }

    fn deliver(&self, event: &SessionEvent) {
        let kind = event.kind();
        let handlers: Vec<Handler> = lock_or_recover(&self.listeners)
            .iter()
            .filter(|l| l.kind.is_none() || l.kind == Some(kind))
            .map(|l| l.handler.clone())
            .collect();
        for handler in handlers {
            handler(event);
        }
        lock_or_recover(&self.subscribers).retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// Marks one delivery in progress; released even if a handler panics.
struct Delivery<'a> {
    bus: &'a EventBus,
    id: ThreadId,
}

impl Drop for Delivery<'_> {
    fn drop(&mut self) {
        let mut gate = lock_or_recover(&self.bus.gate);
        if let Some(pos) = gate.delivering.iter().position(|id| *id == self.id) {
            gate.delivering.swap_remove(pos);
        }
        self.bus.drained.notify_all();
    }
}

impl EventEmitter for EventBus {
    fn on(&self, kind: EventKind, handler: Handler) -> ListenerId {
        self.register(Some(kind), handler)
    }

    fn off(&self, id: ListenerId) -> bool {
        let mut listeners = lock_or_recover(&self.listeners);
        let before = listeners.len();
        listeners.retain(|l| l.id != id);
        listeners.len() != before
    }

    fn emit(&self, event: SessionEvent) {
        self.publish(event);
    }
}

// A panicking holder leaves the guarded data usable; keep going with it.
pub(crate) fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
