use serde::{Deserialize, Serialize};

/// Pixel dimensions of the image a detection was computed against.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDims {
    pub width: u32,
    pub height: u32,
}

/// Image-relative bounding box in pixels, as reported by the detector.
/// May extend past the image on any side.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct FaceBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

/// Expression probabilities.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Expressions {
    pub neutral: f32,
    pub happy: f32,
    pub sad: f32,
    pub angry: f32,
    pub fearful: f32,
    pub disgusted: f32,
    pub surprised: f32,
}

impl Expressions {
    /// Name and probability of the strongest expression.
    pub fn dominant(&self) -> (&'static str, f32) {
        [
            ("neutral", self.neutral),
            ("happy", self.happy),
            ("sad", self.sad),
            ("angry", self.angry),
            ("fearful", self.fearful),
            ("disgusted", self.disgusted),
            ("surprised", self.surprised),
        ]
        .into_iter()
        .fold(("neutral", f32::NEG_INFINITY), |best, cur| {
            if cur.1 > best.1 {
                cur
            } else {
                best
            }
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgeGender {
    pub age: f32,
    pub gender: Gender,
    pub gender_probability: f32,
}

/// One face found by a detector in one frame. Immutable once produced.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FaceDetection {
    /// Detection confidence in 0..1.
    pub score: f32,
    pub bbox: FaceBox,
    pub image_dims: ImageDims,
    /// Landmark points (68 for full landmark models, empty when unsupported).
    #[serde(default)]
    pub landmarks: Vec<Point>,
    #[serde(default)]
    pub expressions: Option<Expressions>,
    #[serde(default)]
    pub age_gender: Option<AgeGender>,
}

impl FaceDetection {
    /// Detection with only a score and a box.
    pub fn new(score: f32, bbox: FaceBox, image_dims: ImageDims) -> Self {
        Self {
            score,
            bbox,
            image_dims,
            landmarks: Vec::new(),
            expressions: None,
            age_gender: None,
        }
    }
}
