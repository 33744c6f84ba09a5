//! Face detector capability.
//!
//! The neural detector/embedder is an external black box. The pipeline only
//! needs "image bytes in, at most one detection out", so any backend (ONNX,
//! a sidecar process, a test double) plugs in through [`FaceDetector`].

use crate::types::FaceDetection;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("no face detected")]
    NoFaceFound,
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
    #[error("detector backend failed: {0}")]
    Backend(String),
}

/// Per-call hints forwarded to the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DetectOptions {
    pub skip_frontality_check: bool,
    pub skip_quality_check: bool,
}

impl DetectOptions {
    pub const ATTENDANCE: Self = Self {
        skip_frontality_check: false,
        skip_quality_check: false,
    };

    pub const REGISTRATION: Self = Self {
        skip_frontality_check: true,
        skip_quality_check: false,
    };
}

/// Detect the single most prominent face in an encoded image.
///
/// Called from a blocking worker thread, so implementations may run heavy
/// inference synchronously. A panic is contained to the frame being analysed.
pub trait FaceDetector: Send + Sync {
    fn detect(&self, image: &[u8], options: DetectOptions) -> Result<FaceDetection, DetectorError>;
}
