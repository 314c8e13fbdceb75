use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use image::{Rgb, RgbImage};

use facestream::codec::encode_jpeg;
use facestream::{
    ChannelSource, EventEmitter, EventKind, FaceBox, FaceDetection, FaceDetector, FaceStream,
    FeedHandle, ImageDims, SessionEvent, SessionState, SharedDetector, StreamConfig,
    StubDetector,
};

const WAIT: Duration = Duration::from_secs(10);

fn jpeg_frame() -> Vec<u8> {
    let image = RgbImage::from_fn(64, 48, |x, y| Rgb([(x * 4) as u8, (y * 5) as u8, 128]));
    encode_jpeg(&image).expect("encode test frame")
}

fn face(score: f32, x: f32, y: f32, width: f32, height: f32) -> FaceDetection {
    FaceDetection::new(
        score,
        FaceBox {
            x,
            y,
            width,
            height,
        },
        ImageDims {
            width: 64,
            height: 48,
        },
    )
}

fn session_with(detector: SharedDetector, queue_depth: usize) -> (FaceStream, FeedHandle) {
    let (source, feed) = ChannelSource::new("test-feed");
    let mut config = StreamConfig::default();
    config.name = "cam-test".to_string();
    config.queue_depth = queue_depth;
    let stream = FaceStream::builder(config)
        .stream(source)
        .detector(detector)
        .build()
        .expect("build session");
    (stream, feed)
}

fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(5));
    }
}

/// Receive events up to and including the first one of `kind`.
fn recv_until(rx: &Receiver<SessionEvent>, kind: EventKind) -> Vec<SessionEvent> {
    let mut seen = Vec::new();
    loop {
        let event = rx
            .recv_timeout(WAIT)
            .unwrap_or_else(|_| panic!("no {} event; saw {:?}", kind, kinds(&seen)));
        let done = event.kind() == kind;
        seen.push(event);
        if done {
            return seen;
        }
    }
}

fn kinds(events: &[SessionEvent]) -> Vec<EventKind> {
    events.iter().map(SessionEvent::kind).collect()
}

fn calls(stub: &Arc<Mutex<StubDetector>>) -> u64 {
    stub.lock().unwrap().calls()
}

#[test]
fn split_frame_is_dispatched_exactly_once() {
    let frame = jpeg_frame();
    assert_eq!(
        frame.windows(2).filter(|w| *w == [0xFF, 0xD9]).count(),
        1,
        "test frame must contain a single end-of-image marker"
    );

    for n in 1..=10usize {
        let stub = Arc::new(Mutex::new(StubDetector::new()));
        let (stream, feed) = session_with(stub.clone(), 2);
        let events = stream.events();
        stream.start().unwrap();

        let mut cuts: Vec<usize> = (1..n).map(|i| frame.len() * i / n).collect();
        if n == 2 {
            // Last chunk is exactly the end-of-image marker.
            cuts = vec![frame.len() - 2];
        }
        let mut start = 0;
        for cut in cuts.into_iter().chain(std::iter::once(frame.len())) {
            assert!(feed.push(frame[start..cut].to_vec()));
            start = cut;
        }

        wait_until("dispatch", || {
            calls(&stub) == 1 && stream.state() == SessionState::Listening
        });
        stream.stop();

        let seen = recv_until(&events, EventKind::Stop);
        let mut expected = vec![EventKind::Start, EventKind::Load];
        for i in 0..n {
            expected.push(EventKind::Data);
            if i + 1 < n {
                expected.push(EventKind::Warn);
            }
        }
        expected.push(EventKind::Stop);
        assert_eq!(kinds(&seen), expected, "split into {} chunks", n);
        assert_eq!(calls(&stub), 1);

        let stats = stream.stats();
        assert_eq!(stats.chunks, n as u64);
        assert_eq!(stats.bytes, frame.len() as u64);
        assert_eq!(stats.frames_completed, 1);
        assert_eq!(stats.frames_dispatched, 1);
        assert_eq!(stats.detections_emitted, 0);
    }
}

#[test]
fn data_event_carries_accumulated_bytes() {
    let frame = jpeg_frame();
    let stub = Arc::new(Mutex::new(StubDetector::new()));
    let (stream, feed) = session_with(stub, 2);
    let events = stream.events();
    stream.start().unwrap();

    let mid = frame.len() / 2;
    feed.push(frame[..mid].to_vec());
    feed.push(frame[mid..].to_vec());

    let seen = recv_until(&events, EventKind::Data);
    let SessionEvent::Data(first) = &seen[seen.len() - 1] else {
        panic!("expected data");
    };
    assert_eq!(&first.buffer[..], &frame[..mid]);

    let seen = recv_until(&events, EventKind::Warn);
    let SessionEvent::Warn(warn) = &seen[0] else {
        panic!("expected warn");
    };
    assert!(warn.message.contains("frame boundary not found"));

    let seen = recv_until(&events, EventKind::Data);
    let SessionEvent::Data(second) = &seen[0] else {
        panic!("expected data");
    };
    assert_eq!(&second.buffer[..], &frame[..]);
}

#[test]
fn frame_without_faces_emits_no_detect() {
    let stub = Arc::new(Mutex::new(StubDetector::new()));
    let (stream, feed) = session_with(stub.clone(), 2);
    let events = stream.events();
    stream.start().unwrap();

    feed.push(jpeg_frame());
    wait_until("dispatch", || {
        calls(&stub) == 1 && stream.state() == SessionState::Listening
    });
    stream.stop();

    let seen = recv_until(&events, EventKind::Stop);
    assert!(!kinds(&seen).contains(&EventKind::Detect));
    let SessionEvent::Stop(stop) = &seen[seen.len() - 1] else {
        panic!("expected stop");
    };
    assert!(stop.buffer.is_empty(), "accumulator not cleared");
}

#[test]
fn low_confidence_edge_face_is_not_emitted() {
    let faces = vec![
        face(0.9, 10.0, 8.0, 20.0, 20.0),
        face(0.2, 0.0, 10.0, 16.0, 16.0),
        face(0.75, 30.0, 12.0, 24.0, 30.0),
    ];
    let stub = Arc::new(Mutex::new(StubDetector::with_faces(faces)));
    let (stream, feed) = session_with(stub.clone(), 2);
    let events = stream.events();
    stream.start().unwrap();

    feed.push(jpeg_frame());
    wait_until("dispatch", || {
        calls(&stub) == 1 && stream.state() == SessionState::Listening
    });
    stream.stop();

    let seen = recv_until(&events, EventKind::Stop);
    let detects: Vec<_> = seen
        .iter()
        .filter_map(|event| match event {
            SessionEvent::Detect(detect) => Some(detect),
            _ => None,
        })
        .collect();
    assert_eq!(detects.len(), 2);
    for detect in &detects {
        assert_eq!(detect.name, "cam-test");
        assert_eq!(detect.frame, 1);
        assert_eq!(detect.data.url, "stream");
        assert_eq!(detect.data.port, 6789);
        assert!(detect.data.face.score >= 0.5);
        assert!(detect.data.out.right() <= 64 && detect.data.out.bottom() <= 48);
        assert!(!detect.data.image_cropped.is_empty());
    }
    // The full frame is encoded once and shared by every face.
    assert_eq!(detects[0].data.image, detects[1].data.image);
    assert_eq!(stream.stats().detections_emitted, 2);
}

#[test]
fn consecutive_frames_are_numbered() {
    let stub = Arc::new(Mutex::new(StubDetector::with_faces(vec![face(
        0.9, 10.0, 10.0, 20.0, 20.0,
    )])));
    let (stream, feed) = session_with(stub.clone(), 4);
    let events = stream.events();
    stream.start().unwrap();

    feed.push(jpeg_frame());
    feed.push(jpeg_frame());
    wait_until("two dispatches", || {
        calls(&stub) == 2 && stream.state() == SessionState::Listening
    });

    let mut frames = Vec::new();
    for _ in 0..2 {
        let seen = recv_until(&events, EventKind::Detect);
        if let Some(SessionEvent::Detect(detect)) = seen.last() {
            frames.push(detect.frame);
        }
    }
    assert_eq!(frames, vec![1, 2]);
}

#[test]
fn short_chunk_is_reported_and_skipped() {
    let stub = Arc::new(Mutex::new(StubDetector::new()));
    let (stream, feed) = session_with(stub.clone(), 2);
    let events = stream.events();
    stream.start().unwrap();

    feed.push(vec![0xD9]);
    let seen = recv_until(&events, EventKind::Error);
    let SessionEvent::Error(error) = &seen[seen.len() - 1] else {
        panic!("expected error");
    };
    assert!(!error.fatal);
    assert_eq!(error.name.as_deref(), Some("cam-test"));
    assert!(error.message.contains("shorter than 2 bytes"));
    assert_eq!(stream.state(), SessionState::Listening);

    feed.push(jpeg_frame());
    wait_until("dispatch", || calls(&stub) == 1);
    let stats = stream.stats();
    assert_eq!(stats.chunks_rejected, 1);
    assert_eq!(stats.frames_completed, 1);
}

#[test]
fn source_failure_is_fatal() {
    let stub = Arc::new(Mutex::new(StubDetector::new()));
    let (stream, feed) = session_with(stub, 2);
    let events = stream.events();
    stream.start().unwrap();

    feed.push(vec![0xFF, 0xD8, 0x00, 0x10]);
    feed.fail("ffmpeg exited with status 1");

    let seen = recv_until(&events, EventKind::Error);
    let SessionEvent::Error(error) = &seen[seen.len() - 1] else {
        panic!("expected error");
    };
    assert!(error.fatal);
    assert!(error.message.contains("ffmpeg exited with status 1"));
    assert_eq!(
        error.buffer.as_deref(),
        Some(&[0xFF, 0xD8, 0x00, 0x10][..])
    );
    wait_until("error state", || stream.state() == SessionState::Error);

    stream.stop();
    let seen = recv_until(&events, EventKind::Stop);
    let SessionEvent::Stop(stop) = &seen[seen.len() - 1] else {
        panic!("expected stop");
    };
    assert_eq!(&stop.buffer[..], &[0xFF, 0xD8, 0x00, 0x10]);
    assert_eq!(stream.state(), SessionState::Stopped);
}

#[test]
fn stop_during_loading_emits_single_stop() {
    let stub = Arc::new(Mutex::new(StubDetector::new()));
    let (stream, _feed) = session_with(stub, 2);
    let events = stream.events();
    let handle = stream.handle();
    stream.on(
        EventKind::Start,
        Arc::new(move |_: &SessionEvent| handle.stop()),
    );

    stream.start().unwrap();
    stream.stop();

    let seen: Vec<SessionEvent> = events.try_iter().collect();
    assert_eq!(kinds(&seen), vec![EventKind::Start, EventKind::Stop]);
    assert_eq!(stream.state(), SessionState::Stopped);
}

#[test]
fn stop_from_detect_handler_ends_session() {
    let stub = Arc::new(Mutex::new(StubDetector::with_faces(vec![face(
        0.9, 10.0, 10.0, 20.0, 20.0,
    )])));
    let (stream, feed) = session_with(stub, 2);
    let events = stream.events();
    let handle = stream.handle();
    stream.on(
        EventKind::Detect,
        Arc::new(move |_: &SessionEvent| handle.stop()),
    );
    stream.start().unwrap();

    feed.push(jpeg_frame());
    let seen = recv_until(&events, EventKind::Stop);
    assert_eq!(kinds(&seen).iter().filter(|k| **k == EventKind::Stop).count(), 1);
    assert_eq!(stream.state(), SessionState::Stopped);

    feed.push(jpeg_frame());
    thread::sleep(Duration::from_millis(100));
    assert_eq!(events.try_iter().count(), 0);
}

struct GateDetector {
    entered: mpsc::Sender<()>,
    release: mpsc::Receiver<()>,
}

impl FaceDetector for GateDetector {
    fn name(&self) -> &'static str {
        "gate"
    }

    fn detect(&mut self, _image: &RgbImage) -> anyhow::Result<Vec<FaceDetection>> {
        let _ = self.entered.send(());
        let _ = self.release.recv();
        Ok(Vec::new())
    }
}

#[test]
fn full_queue_drops_newest_frame() {
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let gate = Arc::new(Mutex::new(GateDetector {
        entered: entered_tx,
        release: release_rx,
    }));
    let (stream, feed) = session_with(gate, 1);
    let events = stream.events();
    stream.start().unwrap();

    feed.push(jpeg_frame());
    entered_rx.recv_timeout(WAIT).expect("first frame reached detector");
    feed.push(jpeg_frame());
    feed.push(jpeg_frame());

    let seen = recv_until(&events, EventKind::Warn);
    let SessionEvent::Warn(warn) = &seen[seen.len() - 1] else {
        panic!("expected warn");
    };
    assert!(warn.message.contains("queue full"), "{}", warn.message);
    assert!(warn.message.contains("frame 3"), "{}", warn.message);

    drop(release_tx);
    wait_until("queued frame dispatched", || {
        let stats = stream.stats();
        stats.frames_dispatched == 2 && stream.state() == SessionState::Listening
    });
    let stats = stream.stats();
    assert_eq!(stats.frames_completed, 3);
    assert_eq!(stats.frames_dropped, 1);
}

#[test]
fn detector_failure_becomes_error_event() {
    let stub = Arc::new(Mutex::new(StubDetector::new().failing_detect("inference crashed")));
    let (stream, feed) = session_with(stub, 2);
    let events = stream.events();
    stream.start().unwrap();

    feed.push(jpeg_frame());
    let seen = recv_until(&events, EventKind::Error);
    let SessionEvent::Error(error) = &seen[seen.len() - 1] else {
        panic!("expected error");
    };
    assert!(!error.fatal);
    assert!(error.message.contains("inference crashed"), "{}", error.message);
    wait_until("listening", || stream.state() == SessionState::Listening);
}

#[test]
fn missing_ffmpeg_fails_start() {
    let stub = Arc::new(Mutex::new(StubDetector::new()));
    let mut config = StreamConfig::for_url("rtsp://127.0.0.1:1/none");
    config.relay_bind = "127.0.0.1".to_string();
    let stream = FaceStream::builder(config)
        .detector(stub)
        .ffmpeg_program("ffmpeg-not-installed-facestream")
        .build()
        .unwrap();
    assert_eq!(stream.stream_info().kind, "ffmpeg-mjpeg");
    let events = stream.events();

    assert!(stream.start().is_err());
    assert_eq!(stream.state(), SessionState::Error);
    let seen: Vec<SessionEvent> = events.try_iter().collect();
    assert_eq!(
        kinds(&seen),
        vec![EventKind::Start, EventKind::Load, EventKind::Error]
    );
}

fn stop_inside_handler(kind: EventKind, chunk: Vec<u8>) {
    let stub = Arc::new(Mutex::new(StubDetector::new()));
    let (stream, feed) = session_with(stub, 2);
    let events = stream.events();
    let handle = stream.handle();
    let (done_tx, done_rx) = mpsc::channel();
    let done_tx = Mutex::new(done_tx);
    stream.on(
        kind,
        Arc::new(move |_: &SessionEvent| {
            handle.stop();
            let _ = done_tx.lock().unwrap().send(());
        }),
    );
    stream.start().unwrap();

    feed.push(chunk);
    done_rx
        .recv_timeout(WAIT)
        .unwrap_or_else(|_| panic!("stop() inside {} handler did not return", kind));
    let seen = recv_until(&events, EventKind::Stop);
    assert_eq!(kinds(&seen).last(), Some(&EventKind::Stop));
    assert_eq!(stream.state(), SessionState::Stopped);

    feed.push(jpeg_frame());
    thread::sleep(Duration::from_millis(100));
    assert_eq!(events.try_iter().count(), 0);
}

#[test]
fn stop_from_data_handler_returns() {
    stop_inside_handler(EventKind::Data, vec![0xFF, 0xD8, 0x00]);
}

#[test]
fn stop_from_warn_handler_returns() {
    stop_inside_handler(EventKind::Warn, vec![0xFF, 0xD8, 0x00]);
}

#[test]
fn stop_from_error_handler_returns() {
    stop_inside_handler(EventKind::Error, vec![0x01]);
}

#[test]
fn stop_waits_for_detect_in_flight() {
    let stub = Arc::new(Mutex::new(StubDetector::with_faces(vec![
        face(0.9, 10.0, 10.0, 20.0, 20.0),
        face(0.8, 30.0, 12.0, 20.0, 20.0),
    ])));
    let (stream, feed) = session_with(stub, 2);
    let (entered_tx, entered_rx) = mpsc::channel();
    let entered_tx = Mutex::new(entered_tx);
    stream.on(
        EventKind::Detect,
        Arc::new(move |_: &SessionEvent| {
            let _ = entered_tx.lock().unwrap().send(());
            thread::sleep(Duration::from_millis(300));
        }),
    );
    let seen = Arc::new(Mutex::new(Vec::new()));
    for kind in [EventKind::Detect, EventKind::Stop] {
        let record = seen.clone();
        stream.on(
            kind,
            Arc::new(move |event: &SessionEvent| record.lock().unwrap().push(event.kind())),
        );
    }
    stream.start().unwrap();

    feed.push(jpeg_frame());
    entered_rx.recv_timeout(WAIT).expect("detect delivery started");
    stream.stop();
    thread::sleep(Duration::from_millis(100));

    assert_eq!(
        *seen.lock().unwrap(),
        vec![EventKind::Detect, EventKind::Stop]
    );
    assert_eq!(stream.stats().detections_emitted, 1);
}

#[cfg(unix)]
mod relays {
    use super::*;

    use std::fs;
    use std::net::{SocketAddr, TcpListener, TcpStream};
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};

    use tungstenite::{Message, WebSocket};

    /// Stand-in for ffmpeg: repeats a JPEG for the MJPEG profile and a fixed
    /// marker for the MPEG-1 profile until killed.
    fn fake_ffmpeg(dir: &Path, frame: &[u8]) -> PathBuf {
        let frame_path = dir.join("frame.jpg");
        fs::write(&frame_path, frame).unwrap();
        let script = dir.join("fake-ffmpeg");
        fs::write(
            &script,
            format!(
                "#!/bin/sh\n\
                 case \"$*\" in\n\
                 *mpeg1video*) while true; do printf 'mpeg1-ts'; sleep 0.05; done ;;\n\
                 *) while true; do cat '{}'; sleep 0.05; done ;;\n\
                 esac\n",
                frame_path.display()
            ),
        )
        .unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        script
    }

    fn free_ports() -> (u16, u16) {
        let a = TcpListener::bind("127.0.0.1:0").unwrap();
        let b = TcpListener::bind("127.0.0.1:0").unwrap();
        (
            a.local_addr().unwrap().port(),
            b.local_addr().unwrap().port(),
        )
    }

    fn connect(port: u16) -> WebSocket<TcpStream> {
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        let deadline = Instant::now() + WAIT;
        loop {
            if let Ok(stream) = TcpStream::connect(addr) {
                stream.set_read_timeout(Some(WAIT)).unwrap();
                let url = format!("ws://{}/", addr);
                let (socket, _) = tungstenite::client(url.as_str(), stream)
                    .unwrap_or_else(|e| panic!("handshake on {} failed: {}", port, e));
                return socket;
            }
            assert!(Instant::now() < deadline, "relay on {} never came up", port);
            thread::sleep(Duration::from_millis(20));
        }
    }

    /// Read binary messages until their concatenation contains `needle`.
    fn read_until_contains(socket: &mut WebSocket<TcpStream>, needle: &[u8]) {
        let mut received = Vec::new();
        let deadline = Instant::now() + WAIT;
        while !received.windows(needle.len()).any(|w| w == needle) {
            assert!(Instant::now() < deadline, "relay never sent {:?}", needle);
            match socket.read().unwrap() {
                Message::Binary(bytes) => received.extend_from_slice(&bytes),
                other => panic!("expected a binary message, got {:?}", other),
            }
        }
    }

    #[test]
    fn url_session_relays_mjpeg_and_mpeg1() {
        let dir = tempfile::tempdir().unwrap();
        let frame = jpeg_frame();
        let program = fake_ffmpeg(dir.path(), &frame);

        let mut config = StreamConfig::for_url("rtsp://camera.local/stream");
        config.name = "relay-test".to_string();
        config.relay_bind = "127.0.0.1".to_string();
        let (port, jsmpeg_port) = free_ports();
        config.port = port;
        config.jsmpeg_port = Some(jsmpeg_port);

        let stub = Arc::new(Mutex::new(StubDetector::new()));
        let stream = FaceStream::builder(config)
            .detector(stub.clone())
            .ffmpeg_program(&program.display().to_string())
            .build()
            .unwrap();
        stream.start().unwrap();
        assert_eq!(stream.state(), SessionState::Listening);

        let mut mjpeg = connect(port);
        read_until_contains(&mut mjpeg, &[0xFF, 0xD9]);
        let mut mpeg1 = connect(jsmpeg_port);
        read_until_contains(&mut mpeg1, b"mpeg1-ts");
        wait_until("frames detected", || calls(&stub) >= 1);

        stream.stop();
        assert_eq!(stream.state(), SessionState::Stopped);
        for port in [port, jsmpeg_port] {
            assert!(
                TcpStream::connect(SocketAddr::from(([127, 0, 0, 1], port))).is_err(),
                "relay on {} still accepting after stop",
                port
            );
        }
    }
}
