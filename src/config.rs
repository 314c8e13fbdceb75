use anyhow::{anyhow, Context, Result};
use rand::Rng;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::detect::DetectorOptions;

pub const DEFAULT_PORT: u16 = 6789;
pub const DEFAULT_SCORE: f32 = 0.5;
const DEFAULT_QUEUE_DEPTH: usize = 2;
const DEFAULT_RELAY_BIND: &str = "0.0.0.0";
const DEFAULT_WEIGHTS_DIR: &str = "weights";
const SESSION_NAME_PREFIX: &str = "FacialApi_RTSP_";

#[derive(Debug, Deserialize, Default)]
struct StreamConfigFile {
    url: Option<String>,
    name: Option<String>,
    port: Option<u16>,
    #[serde(alias = "jsmpegPort")]
    jsmpeg_port: Option<u16>,
    score: Option<f32>,
    #[serde(alias = "weightsDir")]
    weights_dir: Option<PathBuf>,
    queue_depth: Option<usize>,
    relay_bind: Option<String>,
    #[serde(alias = "mtcnn")]
    detector: Option<DetectorOptions>,
}

/// Session configuration with defaults applied.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    /// RTSP source. Required unless a stream source is supplied directly.
    pub url: Option<String>,
    /// Session identifier echoed in every event.
    pub name: String,
    /// Relay port for the primary MJPEG stream.
    pub port: u16,
    /// When set, a second ffmpeg process relays MPEG-1 video on this port.
    pub jsmpeg_port: Option<u16>,
    /// Confidence below which edge detections are not emitted.
    pub score: f32,
    pub weights_dir: PathBuf,
    /// Completed frames waiting for detection; further frames are dropped.
    pub queue_depth: usize,
    /// Interface the relays bind to.
    pub relay_bind: String,
    pub detector: DetectorOptions,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self::from_file(StreamConfigFile::default())
    }
}

impl StreamConfig {
    pub fn for_url(url: &str) -> Self {
        Self {
            url: Some(url.to_string()),
            ..Self::default()
        }
    }

    /// Defaults, then the file named by `FACESTREAM_CONFIG`, then environment
    /// overrides, then validation.
    pub fn load() -> Result<Self> {
        let path = std::env::var("FACESTREAM_CONFIG")
            .ok()
            .filter(|path| !path.trim().is_empty())
            .map(PathBuf::from);
        Self::load_from(path.as_deref())
    }

    /// Like [`StreamConfig::load`], with an explicit config file.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => StreamConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load a config file (`.toml`, otherwise JSON) without environment overrides.
    pub fn from_path(path: &Path) -> Result<Self> {
        let cfg = Self::from_file(read_config_file(path)?);
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: StreamConfigFile) -> Self {
        Self {
            url: file.url.filter(|url| !url.trim().is_empty()),
            name: file
                .name
                .filter(|name| !name.trim().is_empty())
                .unwrap_or_else(random_session_name),
            port: file.port.unwrap_or(DEFAULT_PORT),
            jsmpeg_port: file.jsmpeg_port,
            score: file.score.unwrap_or(DEFAULT_SCORE),
            weights_dir: resolve_weights_dir(file.weights_dir.as_deref()),
            queue_depth: file.queue_depth.unwrap_or(DEFAULT_QUEUE_DEPTH),
            relay_bind: file
                .relay_bind
                .unwrap_or_else(|| DEFAULT_RELAY_BIND.to_string()),
            detector: file.detector.unwrap_or_default(),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(url) = std::env::var("FACESTREAM_RTSP_URL") {
            if !url.trim().is_empty() {
                self.url = Some(url);
            }
        }
        if let Ok(name) = std::env::var("FACESTREAM_NAME") {
            if !name.trim().is_empty() {
                self.name = name;
            }
        }
        if let Ok(port) = std::env::var("FACESTREAM_PORT") {
            self.port = port
                .parse()
                .map_err(|_| anyhow!("FACESTREAM_PORT must be a port number"))?;
        }
        if let Ok(port) = std::env::var("FACESTREAM_JSMPEG_PORT") {
            self.jsmpeg_port = Some(
                port.parse()
                    .map_err(|_| anyhow!("FACESTREAM_JSMPEG_PORT must be a port number"))?,
            );
        }
        if let Ok(score) = std::env::var("FACESTREAM_SCORE") {
            self.score = score
                .parse()
                .map_err(|_| anyhow!("FACESTREAM_SCORE must be a number between 0 and 1"))?;
        }
        if let Ok(dir) = std::env::var("FACESTREAM_WEIGHTS_DIR") {
            if !dir.trim().is_empty() {
                self.weights_dir = PathBuf::from(dir);
            }
        }
        if let Ok(depth) = std::env::var("FACESTREAM_QUEUE_DEPTH") {
            self.queue_depth = depth
                .parse()
                .map_err(|_| anyhow!("FACESTREAM_QUEUE_DEPTH must be a positive integer"))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(anyhow!("session name must not be empty"));
        }
        if !(0.0..=1.0).contains(&self.score) {
            return Err(anyhow!("score must be within 0..=1, got {}", self.score));
        }
        if self.queue_depth == 0 {
            return Err(anyhow!("queue_depth must be greater than zero"));
        }
        if self.port == 0 {
            return Err(anyhow!("port must be non-zero"));
        }
        if self.jsmpeg_port == Some(0) {
            return Err(anyhow!("jsmpeg_port must be non-zero"));
        }
        if self.jsmpeg_port == Some(self.port) {
            return Err(anyhow!(
                "jsmpeg_port and port must differ (both {})",
                self.port
            ));
        }
        Ok(())
    }
}

/// `FacialApi_RTSP_<n>` with a random `n`.
pub fn random_session_name() -> String {
    let n: u32 = rand::thread_rng().gen_range(0..10_000);
    format!("{}{}", SESSION_NAME_PREFIX, n)
}

/// Explicit path if given; otherwise `./weights` when it exists, then
/// `weights` next to the executable, falling back to `./weights`.
pub fn resolve_weights_dir(explicit: Option<&Path>) -> PathBuf {
    if let Some(dir) = explicit {
        return dir.to_path_buf();
    }
    let local = PathBuf::from(DEFAULT_WEIGHTS_DIR);
    if local.is_dir() {
        return local;
    }
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(DEFAULT_WEIGHTS_DIR)))
        .filter(|dir| dir.is_dir())
        .unwrap_or(local)
}

fn read_config_file(path: &Path) -> Result<StreamConfigFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
