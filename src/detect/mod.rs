mod backend;
mod backends;
mod registry;
mod result;

pub use backend::{DetectorOptions, FaceDetector};
pub use backends::StubDetector;
#[cfg(feature = "backend-tract")]
pub use backends::TractDetector;
pub use registry::{BackendRegistry, SharedDetector};
pub use result::{AgeGender, Expressions, FaceBox, FaceDetection, Gender, ImageDims, Point};
