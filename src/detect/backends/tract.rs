#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::FilterType;
use image::RgbImage;
use tract_onnx::prelude::*;

use crate::detect::backend::{DetectorOptions, FaceDetector};
use crate::detect::result::{FaceBox, FaceDetection, ImageDims};

/// Model file expected inside the weights directory.
pub const MODEL_FILE: &str = "version-RFB-320.onnx";

const INPUT_WIDTH: u32 = 320;
const INPUT_HEIGHT: u32 = 240;
const NMS_IOU: f32 = 0.3;

/// Tract-based face detector for UltraFace-style ONNX models.
///
/// The model takes a 1x3x240x320 RGB tensor normalised to roughly -1..1 and
/// returns per-anchor scores `[1, N, 2]` and corner boxes `[1, N, 4]` in
/// normalised image coordinates. Only boxes are produced; landmarks,
/// expressions and age/gender stay empty.
pub struct TractDetector {
    model: Option<SimplePlan<TypedFact, Box<dyn TypedOp>>>,
    threshold: f32,
    min_face_size: u32,
}

impl TractDetector {
    pub fn new() -> Self {
        Self {
            model: None,
            threshold: DetectorOptions::default().final_threshold(),
            min_face_size: DetectorOptions::default().min_face_size,
        }
    }

    fn build_input(&self, image: &RgbImage) -> Tensor {
        let resized = image::imageops::resize(image, INPUT_WIDTH, INPUT_HEIGHT, FilterType::Triangle);
        let input = tract_ndarray::Array4::from_shape_fn(
            (1, 3, INPUT_HEIGHT as usize, INPUT_WIDTH as usize),
            |(_, channel, y, x)| {
                let pixel = resized.get_pixel(x as u32, y as u32);
                (pixel[channel] as f32 - 127.0) / 128.0
            },
        );
        input.into_tensor()
    }

    fn extract_faces(&self, outputs: TVec<TValue>, dims: ImageDims) -> Result<Vec<FaceDetection>> {
        let scores = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no score output"))?
            .to_array_view::<f32>()
            .context("score tensor was not f32")?
            .into_dimensionality::<tract_ndarray::Ix3>()
            .context("score tensor must be [1, N, 2]")?;
        let boxes = outputs
            .get(1)
            .ok_or_else(|| anyhow!("model produced no box output"))?
            .to_array_view::<f32>()
            .context("box tensor was not f32")?
            .into_dimensionality::<tract_ndarray::Ix3>()
            .context("box tensor must be [1, N, 4]")?;

        let anchors = scores.shape()[1].min(boxes.shape()[1]);
        let width = dims.width as f32;
        let height = dims.height as f32;
        let min_side = self.min_face_size as f32;

        let mut candidates = Vec::new();
        for i in 0..anchors {
            let score = scores[[0, i, 1]];
            if score < self.threshold {
                continue;
            }
            let x1 = boxes[[0, i, 0]] * width;
            let y1 = boxes[[0, i, 1]] * height;
            let x2 = boxes[[0, i, 2]] * width;
            let y2 = boxes[[0, i, 3]] * height;
            let bbox = FaceBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
            };
            if bbox.width < min_side || bbox.height < min_side {
                continue;
            }
            candidates.push(FaceDetection::new(score, bbox, dims));
        }

        Ok(non_max_suppression(candidates, NMS_IOU))
    }
}

impl Default for TractDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl FaceDetector for TractDetector {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn load(&mut self, weights_dir: &Path, options: &DetectorOptions) -> Result<()> {
        let model_path = weights_dir.join(MODEL_FILE);
        let model = tract_onnx::onnx()
            .model_for_path(&model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, 3, INPUT_HEIGHT as usize, INPUT_WIDTH as usize),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        self.model = Some(model);
        self.threshold = options.final_threshold();
        self.min_face_size = options.min_face_size;
        log::info!(
            "tract detector loaded {} (threshold={:.2}, min_face_size={})",
            model_path.display(),
            self.threshold,
            self.min_face_size
        );
        Ok(())
    }

    fn detect(&mut self, image: &RgbImage) -> Result<Vec<FaceDetection>> {
        let model = self
            .model
            .as_ref()
            .ok_or_else(|| anyhow!("tract detector used before load"))?;
        let dims = ImageDims {
            width: image.width(),
            height: image.height(),
        };
        let input = self.build_input(image);
        let outputs = model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        self.extract_faces(outputs, dims)
    }
}

fn iou(a: &FaceBox, b: &FaceBox) -> f32 {
    let left = a.x.max(b.x);
    let top = a.y.max(b.y);
    let right = (a.x + a.width).min(b.x + b.width);
    let bottom = (a.y + a.height).min(b.y + b.height);
    let inter = (right - left).max(0.0) * (bottom - top).max(0.0);
    let union = a.width * a.height + b.width * b.height - inter;
    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}

/// Greedy NMS, highest score first.
fn non_max_suppression(mut candidates: Vec<FaceDetection>, max_iou: f32) -> Vec<FaceDetection> {
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
    let mut kept: Vec<FaceDetection> = Vec::new();
    for candidate in candidates {
        if kept.iter().all(|k| iou(&k.bbox, &candidate.bbox) <= max_iou) {
            kept.push(candidate);
        }
    }
    kept
}
