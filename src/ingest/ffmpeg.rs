//! ffmpeg subprocess source.
//!
//! ffmpeg pulls the RTSP stream and writes the transcoded output to stdout.
//! stdout is pumped in fixed-size reads; stderr is logged and its tail kept
//! for the exit-with-error report.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use anyhow::{anyhow, Context, Result};

use super::{SourceEvent, StreamInfo, StreamSource, READ_CHUNK_BYTES};
use crate::join_unless_current;

const STDERR_TAIL_LINES: usize = 20;

/// Output encoding requested from ffmpeg.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FfmpegProfile {
    /// Consecutive JPEG images, one per video frame. Feeds face detection.
    Mjpeg,
    /// MPEG-TS with MPEG-1 video, for browser players that decode MPEG-1.
    Mpeg1,
}

impl FfmpegProfile {
    fn output_args(&self) -> &'static [&'static str] {
        match self {
            FfmpegProfile::Mjpeg => &["-stats", "-f", "image2", "-vcodec", "mjpeg", "-update", "1"],
            FfmpegProfile::Mpeg1 => &[
                "-f",
                "mpegts",
                "-codec:v",
                "mpeg1video",
                "-b:v",
                "1000k",
                "-bf",
                "0",
            ],
        }
    }

    fn label(&self) -> &'static str {
        match self {
            FfmpegProfile::Mjpeg => "ffmpeg-mjpeg",
            FfmpegProfile::Mpeg1 => "ffmpeg-mpeg1",
        }
    }
}

/// Full ffmpeg argument list for `url` (program name excluded).
pub fn ffmpeg_args(url: &str, profile: FfmpegProfile) -> Vec<String> {
    let mut args = vec!["-i".to_string(), url.to_string()];
    args.extend(profile.output_args().iter().map(|a| a.to_string()));
    args.push("-".to_string());
    args
}

pub struct FfmpegSource {
    url: String,
    profile: FfmpegProfile,
    program: String,
    child: Option<Arc<Mutex<Child>>>,
    closing: Arc<AtomicBool>,
    stdout_thread: Option<JoinHandle<()>>,
    stderr_thread: Option<JoinHandle<()>>,
}

impl FfmpegSource {
    pub fn new(url: &str, profile: FfmpegProfile) -> Self {
        Self {
            url: url.to_string(),
            profile,
            program: "ffmpeg".to_string(),
            child: None,
            closing: Arc::new(AtomicBool::new(false)),
            stdout_thread: None,
            stderr_thread: None,
        }
    }

    /// Use a different ffmpeg executable.
    pub fn with_program(mut self, program: &str) -> Self {
        self.program = program.to_string();
        self
    }

    pub fn args(&self) -> Vec<String> {
        ffmpeg_args(&self.url, self.profile)
    }
}

impl StreamSource for FfmpegSource {
    fn describe(&self) -> StreamInfo {
        StreamInfo {
            kind: self.profile.label().to_string(),
            url: Some(self.url.clone()),
        }
    }

    fn open(&mut self) -> Result<Receiver<SourceEvent>> {
        if self.child.is_some() {
            return Err(anyhow!("ffmpeg source for {} already opened", self.url));
        }
        let args = self.args();
        log::info!("spawning {} {}", self.program, args.join(" "));
        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    anyhow!("'{}' not found; install ffmpeg or set its path", self.program)
                } else {
                    anyhow!("failed to spawn {}: {}", self.program, e)
                }
            })?;

        let stdout = child.stdout.take().context("ffmpeg stdout not captured")?;
        let stderr = child.stderr.take().context("ffmpeg stderr not captured")?;
        let child = Arc::new(Mutex::new(child));
        let tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        let (tx, rx) = mpsc::channel();

        let stderr_tail = tail.clone();
        self.stderr_thread = Some(std::thread::spawn(move || {
            for line in BufReader::new(stderr).lines() {
                let Ok(line) = line else { break };
                log::debug!("[ffmpeg] {}", line);
                if let Ok(mut tail) = stderr_tail.lock() {
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            }
        }));

        let pump = Pump {
            child: child.clone(),
            closing: self.closing.clone(),
            tail,
            tx,
        };
        self.stdout_thread = Some(std::thread::spawn(move || pump.run(stdout)));
        self.child = Some(child);
        Ok(rx)
    }

    fn close(&mut self) {
        self.closing.store(true, Ordering::SeqCst);
        if let Some(child) = self.child.take() {
            let mut child = match child.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Err(e) = child.kill() {
                log::debug!("ffmpeg kill: {}", e);
            }
            let _ = child.wait();
        }
        join_unless_current(self.stdout_thread.take());
        join_unless_current(self.stderr_thread.take());
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        self.close();
    }
}

struct Pump {
    child: Arc<Mutex<Child>>,
    closing: Arc<AtomicBool>,
    tail: Arc<Mutex<VecDeque<String>>>,
    tx: Sender<SourceEvent>,
}

impl Pump {
    fn run(self, mut stdout: impl Read) {
        let mut buf = vec![0u8; READ_CHUNK_BYTES];
        loop {
            match stdout.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if self.tx.send(SourceEvent::Data(buf[..n].to_vec())).is_err() {
                        return;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("ffmpeg stdout read failed: {}", e);
                    break;
                }
            }
        }

        let _ = self.tx.send(self.exit_event());
    }

    fn exit_event(&self) -> SourceEvent {
        if self.closing.load(Ordering::SeqCst) {
            return SourceEvent::Closed;
        }
        let status = match self.child.lock() {
            Ok(mut child) => child.wait(),
            Err(_) => return SourceEvent::ExitWithError("ffmpeg handle poisoned".to_string()),
        };
        match status {
            Ok(status) if status.success() => SourceEvent::Closed,
            Ok(status) => {
                let tail = self
                    .tail
                    .lock()
                    .map(|t| t.iter().cloned().collect::<Vec<_>>().join("\n"))
                    .unwrap_or_default();
                SourceEvent::ExitWithError(format!("ffmpeg exited with {}: {}", status, tail))
            }
            Err(e) => SourceEvent::ExitWithError(format!("ffmpeg wait failed: {}", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mjpeg_args_request_images_on_stdout() {
        let args = ffmpeg_args("rtsp://cam/1", FfmpegProfile::Mjpeg);
        assert_eq!(
            args,
            vec![
                "-i", "rtsp://cam/1", "-stats", "-f", "image2", "-vcodec", "mjpeg", "-update",
                "1", "-"
            ]
        );
    }

    #[test]
    fn mpeg1_args_target_mpegts() {
        let args = ffmpeg_args("rtsp://cam/1", FfmpegProfile::Mpeg1);
        assert!(args.windows(2).any(|w| w == ["-codec:v", "mpeg1video"]));
        assert_eq!(args.last().map(String::as_str), Some("-"));
    }

    #[test]
    fn missing_program_is_reported() {
        let mut source =
            FfmpegSource::new("rtsp://cam/1", FfmpegProfile::Mjpeg).with_program("ffmpeg-does-not-exist-42");
        let err = source.open().unwrap_err();
        assert!(err.to_string().contains("not found"));
        assert_eq!(source.describe().kind, "ffmpeg-mjpeg");
    }
}
