use std::path::Path;

use anyhow::Result;
use image::RgbImage;
use serde::{Deserialize, Serialize};

use crate::detect::result::FaceDetection;

/// Detector tuning shared by all backends.
///
/// Backends use what applies to them and ignore the rest. Field names are also
/// accepted in the camelCase form of existing `mtcnn` config blocks.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorOptions {
    /// Number of scaled image copies passed through the first stage of an
    /// image-pyramid detector. Neither bundled backend builds a pyramid, so
    /// this is accepted for config compatibility only.
    #[serde(alias = "maxNumScales")]
    pub max_num_scales: u32,
    /// Scale step between pyramid levels. Config compatibility only, like
    /// `max_num_scales`.
    #[serde(alias = "scaleFactor")]
    pub scale_factor: f32,
    /// Per-stage score thresholds; the last one gates final detections.
    #[serde(alias = "scoreThresholds")]
    pub score_thresholds: Vec<f32>,
    /// Smallest face side in pixels that is reported.
    #[serde(alias = "minFaceSize")]
    pub min_face_size: u32,
}

impl Default for DetectorOptions {
    fn default() -> Self {
        Self {
            max_num_scales: 10,
            scale_factor: 0.709,
            score_thresholds: vec![0.6, 0.7, 0.7],
            min_face_size: 20,
        }
    }
}

impl DetectorOptions {
    /// Threshold applied to final detections.
    pub fn final_threshold(&self) -> f32 {
        self.score_thresholds.last().copied().unwrap_or(0.0)
    }
}

/// Face detector backend.
///
/// The session treats a backend as a black box: resources are loaded once
/// before listening starts, then `detect` is called once per completed frame.
/// Calls are serialised by the session; implementations need not be reentrant.
pub trait FaceDetector: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Load model resources from `weights_dir`. Called once, before any `detect`.
    fn load(&mut self, weights_dir: &Path, options: &DetectorOptions) -> Result<()> {
        let _ = (weights_dir, options);
        Ok(())
    }

    /// Find all faces in a decoded frame.
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<FaceDetection>>;
}
