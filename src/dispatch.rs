//! Detection dispatch: one completed frame in, zero or more `detect` events out.
//!
//! 1. Decode the frame.
//! 2. Run the detector.
//! 3. For frames with faces, encode the full frame once and fan out one worker
//!    per face: compute the crop region, apply the low-confidence edge rule,
//!    crop.
//! 4. Once every face worker has finished, emit one `detect` per kept face from
//!    the dispatching thread. Handlers therefore never run on a face worker and
//!    may stop the session.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Local};
use image::RgbImage;
use serde::{Deserialize, Serialize};

use crate::codec::{crop_jpeg, decode_frame, encode_jpeg};
use crate::detect::{FaceBox, FaceDetection, ImageDims, SharedDetector};
use crate::events::{DetectEvent, DetectionData, EventBus, FrameBytes, SessionEvent};
use crate::frame::CompletedFrame;

/// Box after the rounding heuristic, before it is fitted to the image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RoundedBox {
    pub left: i64,
    pub top: i64,
    pub width: i64,
    pub height: i64,
}

/// Integer crop region fully inside `[0, width] x [0, height]` of its image.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClampedBox {
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
}

/// Round half toward positive infinity.
fn round_half_up(value: f32) -> i64 {
    (value as f64 + 0.5).floor() as i64
}

/// Round a detector box into the crop heuristic used for `detect` payloads.
///
/// The origin is floored at 1. An overflowing box keeps only its overflow as
/// width (inclusive comparison) or height (strict comparison).
pub fn round_box(bbox: &FaceBox, dims: ImageDims) -> RoundedBox {
    let width = dims.width as f32;
    let height = dims.height as f32;
    RoundedBox {
        left: round_half_up(bbox.x.max(1.0)),
        top: round_half_up(bbox.y.max(1.0)),
        width: if bbox.x + bbox.width <= width {
            round_half_up(bbox.width)
        } else {
            round_half_up(bbox.x + bbox.width - width)
        },
        height: if bbox.y + bbox.height < height {
            round_half_up(bbox.height)
        } else {
            round_half_up(bbox.y + bbox.height - height)
        },
    }
}

impl ClampedBox {
    /// Rounded heuristic box for `bbox`, fitted inside `dims`.
    pub fn new(bbox: &FaceBox, dims: ImageDims) -> Self {
        Self::fit(round_box(bbox, dims), dims)
    }

    /// Fit a rounded box inside `dims`; width and height are at least 1.
    pub fn fit(rounded: RoundedBox, dims: ImageDims) -> Self {
        let max_w = i64::from(dims.width.max(1));
        let max_h = i64::from(dims.height.max(1));
        let left = rounded.left.clamp(0, max_w - 1);
        let top = rounded.top.clamp(0, max_h - 1);
        let width = rounded.width.clamp(1, max_w - left);
        let height = rounded.height.clamp(1, max_h - top);
        Self {
            left: left as u32,
            top: top as u32,
            width: width as u32,
            height: height as u32,
        }
    }

    pub fn right(&self) -> u32 {
        self.left + self.width
    }

    pub fn bottom(&self) -> u32 {
        self.top + self.height
    }
}

/// Low-confidence detections touching the top or left edge are not emitted.
///
/// Both conditions are required: a confident edge face and a weak interior
/// face are both kept. The edge test uses the detector's raw origin.
pub fn is_low_confidence_edge(face: &FaceDetection, threshold: f32) -> bool {
    face.score < threshold && (face.bbox.y < 1.0 || face.bbox.x < 1.0)
}

/// Identity stamped into every `detect` payload.
#[derive(Clone, Debug)]
pub struct DispatchContext {
    pub name: String,
    pub url: String,
    pub port: u16,
    pub threshold: f32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub faces: usize,
    pub emitted: usize,
    pub skipped: usize,
}

/// Turns completed frames into `detect` events.
pub struct Dispatcher {
    ctx: DispatchContext,
    detector: SharedDetector,
    bus: Arc<EventBus>,
}

struct FrameShared<'a> {
    sequence: u64,
    image: &'a RgbImage,
    full: &'a FrameBytes,
    buffer: &'a FrameBytes,
    detected_at: DateTime<Local>,
}

impl Dispatcher {
    pub fn new(ctx: DispatchContext, detector: SharedDetector, bus: Arc<EventBus>) -> Self {
        Self { ctx, detector, bus }
    }

    pub fn context(&self) -> &DispatchContext {
        &self.ctx
    }

    /// Process one frame to completion.
    ///
    /// Face workers run concurrently; the call returns after all of them.
    /// A failing face does not stop the others; the first failure is returned
    /// once every worker has finished.
    pub fn dispatch(&self, frame: CompletedFrame) -> Result<DispatchOutcome> {
        let detected_at = Local::now();
        let sequence = frame.sequence;
        let image = decode_frame(&frame.bytes).with_context(|| format!("frame {}", sequence))?;

        let faces = {
            let mut detector = self
                .detector
                .lock()
                .map_err(|_| anyhow!("detector lock poisoned"))?;
            detector
                .detect(&image)
                .with_context(|| format!("face detection on frame {}", sequence))?
        };

        let mut outcome = DispatchOutcome {
            faces: faces.len(),
            ..DispatchOutcome::default()
        };
        if faces.is_empty() {
            log::trace!("frame {}: no faces", sequence);
            return Ok(outcome);
        }

        let full = FrameBytes::from(encode_jpeg(&image)?);
        let buffer = FrameBytes::from(frame.bytes);
        let shared = FrameShared {
            sequence,
            image: &image,
            full: &full,
            buffer: &buffer,
            detected_at,
        };
        let shared = &shared;

        let results: Vec<Result<Option<DetectEvent>>> = std::thread::scope(|scope| {
            let workers: Vec<_> = faces
                .into_iter()
                .map(|face| scope.spawn(move || self.process_face(face, shared)))
                .collect();
            workers
                .into_iter()
                .map(|worker| {
                    worker
                        .join()
                        .unwrap_or_else(|_| Err(anyhow!("face worker panicked")))
                })
                .collect()
        });

        let mut first_error = None;
        for result in results {
            match result {
                Ok(Some(event)) => {
                    if self.bus.publish(SessionEvent::Detect(Box::new(event))) {
                        outcome.emitted += 1;
                    }
                }
                Ok(None) => outcome.skipped += 1,
                Err(err) => {
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }
        log::debug!(
            "frame {}: {} face(s), {} emitted, {} skipped",
            sequence,
            outcome.faces,
            outcome.emitted,
            outcome.skipped
        );
        match first_error {
            Some(err) => Err(err),
            None => Ok(outcome),
        }
    }

    /// The `detect` payload for `face`, or `None` when it is skipped.
    fn process_face(
        &self,
        face: FaceDetection,
        frame: &FrameShared<'_>,
    ) -> Result<Option<DetectEvent>> {
        if is_low_confidence_edge(&face, self.ctx.threshold) {
            log::debug!(
                "frame {}: skipping edge face score={:.3} x={:.1} y={:.1}",
                frame.sequence,
                face.score,
                face.bbox.x,
                face.bbox.y
            );
            return Ok(None);
        }

        let actual = ImageDims {
            width: frame.image.width(),
            height: frame.image.height(),
        };
        let out = ClampedBox::fit(round_box(&face.bbox, face.image_dims), actual);
        let cropped = crop_jpeg(frame.image, out)?;

        Ok(Some(DetectEvent {
            name: self.ctx.name.clone(),
            frame: frame.sequence,
            buffer: frame.buffer.clone(),
            data: DetectionData {
                url: self.ctx.url.clone(),
                port: self.ctx.port,
                detected_at: frame.detected_at,
                image: frame.full.clone(),
                image_cropped: FrameBytes::from(cropped),
                out,
                face,
            },
        }))
    }
}
