use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use image::RgbImage;

use crate::detect::backend::{DetectorOptions, FaceDetector};
use crate::detect::result::{FaceDetection, ImageDims};

/// Scripted backend for tests and dry runs.
///
/// Each `detect` call returns the next scripted response, or the fallback
/// response once the script is exhausted. Reported `image_dims` are always
/// rewritten to the dimensions of the frame actually passed in.
#[derive(Debug, Default)]
pub struct StubDetector {
    script: VecDeque<Vec<FaceDetection>>,
    fallback: Vec<FaceDetection>,
    load_error: Option<String>,
    detect_error: Option<String>,
    loaded_from: Option<PathBuf>,
    calls: u64,
}

impl StubDetector {
    /// Registry name of this backend.
    pub const NAME: &'static str = "stub";

    pub fn new() -> Self {
        Self::default()
    }

    /// Return `faces` for every frame.
    pub fn with_faces(faces: Vec<FaceDetection>) -> Self {
        Self {
            fallback: faces,
            ..Self::default()
        }
    }

    /// Queue a response for the next unscripted call.
    pub fn push_response(&mut self, faces: Vec<FaceDetection>) {
        self.script.push_back(faces);
    }

    /// Make `load` fail with `message`.
    pub fn failing_load(mut self, message: &str) -> Self {
        self.load_error = Some(message.to_string());
        self
    }

    /// Make every `detect` fail with `message`.
    pub fn failing_detect(mut self, message: &str) -> Self {
        self.detect_error = Some(message.to_string());
        self
    }

    /// Number of `detect` calls so far.
    pub fn calls(&self) -> u64 {
        self.calls
    }

    pub fn loaded_from(&self) -> Option<&Path> {
        self.loaded_from.as_deref()
    }
}

impl FaceDetector for StubDetector {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn load(&mut self, weights_dir: &Path, _options: &DetectorOptions) -> Result<()> {
        if let Some(message) = &self.load_error {
            return Err(anyhow!("{}", message));
        }
        self.loaded_from = Some(weights_dir.to_path_buf());
        Ok(())
    }

    fn detect(&mut self, image: &RgbImage) -> Result<Vec<FaceDetection>> {
        self.calls += 1;
        if self.loaded_from.is_none() {
            return Err(anyhow!("stub detector used before load"));
        }
        if let Some(message) = &self.detect_error {
            return Err(anyhow!("{}", message));
        }
        let dims = ImageDims {
            width: image.width(),
            height: image.height(),
        };
        let mut faces = self
            .script
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        for face in &mut faces {
            face.image_dims = dims;
        }
        Ok(faces)
    }
}
