//! facestreamd - face detection over an RTSP camera stream
//!
//! This daemon:
//! 1. Loads the session config (file, environment, then command line)
//! 2. Spawns ffmpeg to pull the camera as MJPEG and relays it on `--port`
//! 3. Runs the selected detector on every complete frame
//! 4. Logs lifecycle and detection events
//! 5. Publishes annotated detection frames on `--annotated-port`, if set
//! 6. Stops on Ctrl-C or on a fatal session error

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;

use facestream::codec::{decode_frame, draw_box, encode_jpeg};
use facestream::{
    BackendRegistry, EventEmitter, EventKind, FaceStream, RelayConfig, RelayPublisher,
    RelayServer, SessionEvent, StreamConfig, StubDetector,
};

#[derive(Parser, Debug)]
#[command(
    name = "facestreamd",
    version,
    about = "Detect faces in an RTSP camera stream"
)]
struct Args {
    /// Config file (JSON, or TOML with a .toml extension).
    #[arg(long, env = "FACESTREAM_CONFIG")]
    config: Option<PathBuf>,

    /// RTSP source address.
    #[arg(long)]
    url: Option<String>,

    /// Session name echoed in every event.
    #[arg(long)]
    name: Option<String>,

    /// Relay port for the MJPEG stream.
    #[arg(long)]
    port: Option<u16>,

    /// Relay port for a secondary MPEG-1 stream.
    #[arg(long)]
    jsmpeg_port: Option<u16>,

    /// Confidence below which edge detections are dropped.
    #[arg(long)]
    score: Option<f32>,

    /// Directory holding detector model files.
    #[arg(long)]
    weights_dir: Option<PathBuf>,

    /// Detector backend name.
    #[arg(long, env = "FACESTREAM_BACKEND")]
    backend: Option<String>,

    /// Relay port for frames annotated with detection boxes.
    #[arg(long, env = "FACESTREAM_ANNOTATED_PORT")]
    annotated_port: Option<u16>,

    /// Path to the ffmpeg executable.
    #[arg(long, env = "FACESTREAM_FFMPEG", default_value = "ffmpeg")]
    ffmpeg: String,

    /// List registered detector backends and exit.
    #[arg(long)]
    list_backends: bool,
}

enum Shutdown {
    Signal,
    Fatal(String),
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let registry = build_registry();
    if args.list_backends {
        for name in registry.list() {
            println!("{}", name);
        }
        return Ok(());
    }

    let config = resolve_config(&args)?;
    if config.url.is_none() {
        return Err(anyhow!(
            "no RTSP url configured (use --url or FACESTREAM_RTSP_URL)"
        ));
    }
    let detector = registry.select(args.backend.as_deref())?;
    let selected = detector
        .lock()
        .map_err(|_| anyhow!("detector lock poisoned"))?
        .name();
    if let Some(warning) = implicit_stub_warning(args.backend.as_deref(), selected) {
        log::warn!("{}", warning);
    }

    let session = FaceStream::builder(config)
        .detector(detector)
        .ffmpeg_program(&args.ffmpeg)
        .build()?;

    let annotated = match args.annotated_port {
        Some(port) => {
            let handle =
                RelayServer::new(RelayConfig::new(&session.config().relay_bind, port)).spawn()?;
            log::info!("annotated frames on {}", handle.addr);
            Some(handle)
        }
        None => None,
    };

    let (tx, rx) = mpsc::channel();
    register_logging(&session, annotated.as_ref().map(|h| h.publisher()), tx.clone());

    let signal_tx = tx.clone();
    ctrlc::set_handler(move || {
        let _ = signal_tx.send(Shutdown::Signal);
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    session.start()?;
    log::info!(
        "facestreamd running session {} (Ctrl-C to stop)",
        session.name()
    );

    let outcome = rx.recv().unwrap_or(Shutdown::Signal);
    session.stop();
    if let Some(handle) = annotated {
        handle.stop()?;
    }
    let stats = session.stats();
    log::info!(
        "chunks={} bytes={} frames={} dispatched={} dropped={} detections={}",
        stats.chunks,
        stats.bytes,
        stats.frames_completed,
        stats.frames_dispatched,
        stats.frames_dropped,
        stats.detections_emitted
    );

    match outcome {
        Shutdown::Signal => Ok(()),
        Shutdown::Fatal(message) => Err(anyhow!(message)),
    }
}

fn build_registry() -> BackendRegistry {
    let mut registry = BackendRegistry::new();
    #[cfg(feature = "backend-tract")]
    registry.register(facestream::detect::TractDetector::new());
    registry.register(StubDetector::new());
    registry
}

/// Warning for a daemon that fell back to the stub backend without being
/// asked for it.
fn implicit_stub_warning(requested: Option<&str>, selected: &str) -> Option<String> {
    if requested.is_some() || selected != StubDetector::NAME {
        return None;
    }
    Some(format!(
        "no detection backend compiled in; using '{}', which reports no faces \
         (build with --features backend-tract, or pass --backend {} to silence this)",
        selected, selected
    ))
}

fn resolve_config(args: &Args) -> Result<StreamConfig> {
    let mut config = StreamConfig::load_from(args.config.as_deref())?;
    if let Some(url) = &args.url {
        config.url = Some(url.clone());
    }
    if let Some(name) = &args.name {
        config.name = name.clone();
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(port) = args.jsmpeg_port {
        config.jsmpeg_port = Some(port);
    }
    if let Some(score) = args.score {
        config.score = score;
    }
    if let Some(dir) = &args.weights_dir {
        config.weights_dir = dir.clone();
    }
    config.validate()?;
    Ok(config)
}

fn register_logging(
    session: &FaceStream,
    annotated: Option<RelayPublisher>,
    shutdown: mpsc::Sender<Shutdown>,
) {
    session.on(
        EventKind::Start,
        Arc::new(|event: &SessionEvent| {
            if let SessionEvent::Start(e) = event {
                log::info!("[{}] start ({})", e.name, e.stream.kind);
            }
        }),
    );
    session.on(
        EventKind::Load,
        Arc::new(|event: &SessionEvent| {
            if let SessionEvent::Load(e) = event {
                log::info!("[{}] detector loaded", e.name);
            }
        }),
    );
    session.on(
        EventKind::Warn,
        Arc::new(|event: &SessionEvent| {
            if let SessionEvent::Warn(e) = event {
                log::trace!("[{}] {}", e.name, e.message);
            }
        }),
    );
    session.on(
        EventKind::Detect,
        Arc::new(move |event: &SessionEvent| {
            let SessionEvent::Detect(e) = event else {
                return;
            };
            log::info!(
                "[{}] frame {} face score={:.3} box={}x{}+{}+{} at {}",
                e.name,
                e.frame,
                e.data.face.score,
                e.data.out.width,
                e.data.out.height,
                e.data.out.left,
                e.data.out.top,
                e.data.detected_at_rfc3339()
            );
            if let Some(publisher) = &annotated {
                if let Err(err) = publish_annotated(publisher, e) {
                    log::warn!("[{}] annotate frame {}: {:#}", e.name, e.frame, err);
                }
            }
        }),
    );
    session.on(
        EventKind::Error,
        Arc::new(move |event: &SessionEvent| {
            let SessionEvent::Error(e) = event else {
                return;
            };
            if e.fatal {
                let _ = shutdown.send(Shutdown::Fatal(e.message.clone()));
            }
        }),
    );
}

fn publish_annotated(publisher: &RelayPublisher, event: &facestream::DetectEvent) -> Result<()> {
    if publisher.client_count() == 0 {
        return Ok(());
    }
    let mut image = decode_frame(&event.data.image)?;
    draw_box(&mut image, event.data.out);
    publisher.publish(&encode_jpeg(&image)?);
    Ok(())
}
