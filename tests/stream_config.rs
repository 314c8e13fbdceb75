use std::path::PathBuf;
use std::sync::Mutex;

use tempfile::{Builder, NamedTempFile};

use facestream::config::StreamConfig;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "FACESTREAM_CONFIG",
        "FACESTREAM_RTSP_URL",
        "FACESTREAM_NAME",
        "FACESTREAM_PORT",
        "FACESTREAM_JSMPEG_PORT",
        "FACESTREAM_SCORE",
        "FACESTREAM_WEIGHTS_DIR",
        "FACESTREAM_QUEUE_DEPTH",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_json_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "url": "rtsp://camera-1/stream",
        "name": "lobby",
        "port": 7001,
        "jsmpegPort": 7002,
        "score": 0.65,
        "weightsDir": "/srv/models",
        "mtcnn": {
            "min_face_size": 40
        }
    }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("FACESTREAM_CONFIG", file.path());
    std::env::set_var("FACESTREAM_NAME", "lobby-east");
    std::env::set_var("FACESTREAM_QUEUE_DEPTH", "4");

    let cfg = StreamConfig::load().expect("load config");

    assert_eq!(cfg.url.as_deref(), Some("rtsp://camera-1/stream"));
    assert_eq!(cfg.name, "lobby-east");
    assert_eq!(cfg.port, 7001);
    assert_eq!(cfg.jsmpeg_port, Some(7002));
    assert_eq!(cfg.score, 0.65);
    assert_eq!(cfg.weights_dir, PathBuf::from("/srv/models"));
    assert_eq!(cfg.queue_depth, 4);
    assert_eq!(cfg.detector.min_face_size, 40);
    assert_eq!(cfg.detector.max_num_scales, 10);
    assert_eq!(cfg.detector.score_thresholds, vec![0.6, 0.7, 0.7]);

    clear_env();
}

#[test]
fn loads_toml_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp config");
    let toml = r#"
url = "rtsp://camera-2"
score = 0.4
relay_bind = "127.0.0.1"

[detector]
score_thresholds = [0.5, 0.6, 0.8]
"#;
    std::io::Write::write_all(&mut file, toml.as_bytes()).expect("write config");

    let cfg = StreamConfig::load_from(Some(file.path())).expect("load config");
    assert_eq!(cfg.url.as_deref(), Some("rtsp://camera-2"));
    assert_eq!(cfg.score, 0.4);
    assert_eq!(cfg.relay_bind, "127.0.0.1");
    assert_eq!(cfg.port, 6789);
    assert!(cfg.name.starts_with("FacialApi_RTSP_"));
    assert_eq!(cfg.detector.final_threshold(), 0.8);

    clear_env();
}

#[test]
fn env_only_config_uses_defaults() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("FACESTREAM_RTSP_URL", "rtsp://camera-3");
    std::env::set_var("FACESTREAM_WEIGHTS_DIR", "/opt/weights");

    let cfg = StreamConfig::load().expect("load config");
    assert_eq!(cfg.url.as_deref(), Some("rtsp://camera-3"));
    assert_eq!(cfg.weights_dir, PathBuf::from("/opt/weights"));
    assert_eq!(cfg.score, 0.5);
    assert_eq!(cfg.queue_depth, 2);
    assert_eq!(cfg.jsmpeg_port, None);

    clear_env();
}

#[test]
fn rejects_invalid_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("FACESTREAM_SCORE", "1.7");
    assert!(StreamConfig::load().is_err());
    clear_env();

    std::env::set_var("FACESTREAM_PORT", "not-a-port");
    assert!(StreamConfig::load().is_err());
    clear_env();

    std::env::set_var("FACESTREAM_QUEUE_DEPTH", "0");
    assert!(StreamConfig::load().is_err());
    clear_env();
}

#[test]
fn rejects_malformed_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut file, b"{ not json").expect("write config");
    let err = StreamConfig::load_from(Some(file.path())).unwrap_err();
    assert!(err.to_string().contains("invalid config file"));

    assert!(StreamConfig::load_from(Some(std::path::Path::new("/nonexistent/facestream.json"))).is_err());

    clear_env();
}
