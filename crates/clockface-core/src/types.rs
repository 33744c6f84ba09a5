use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("frame is empty")]
    Empty,
    #[error("unreadable image: {0}")]
    Unreadable(String),
}

/// One submitted camera frame: encoded image bytes plus pixel dimensions.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Encoded image bytes (JPEG/PNG), handed to the detector untouched.
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Self {
        Self { data, width, height }
    }

    /// Build a frame from encoded image bytes, probing the header for dimensions.
    ///
    /// Only the header is parsed; pixel data is not decoded.
    pub fn decode(data: Vec<u8>) -> Result<Self, FrameError> {
        let (width, height) = Self::read_dimensions(&data)?;
        Ok(Self { data, width, height })
    }

    /// Pixel dimensions from an encoded image header.
    pub fn read_dimensions(data: &[u8]) -> Result<(u32, u32), FrameError> {
        if data.is_empty() {
            return Err(FrameError::Empty);
        }

        let (width, height) = image::ImageReader::new(Cursor::new(data))
            .with_guessed_format()
            .map_err(|e| FrameError::Unreadable(e.to_string()))?
            .into_dimensions()
            .map_err(|e| FrameError::Unreadable(e.to_string()))?;

        if width == 0 || height == 0 {
            return Err(FrameError::Empty);
        }
        Ok((width, height))
    }
}

/// Axis-aligned face bounding box in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }
}

/// Face embedding vector (128-dimensional for dlib-style models, 512 for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding.
    #[serde(default)]
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Compute Euclidean distance between two embeddings.
    ///
    /// Callers must check lengths first; extra trailing dimensions are ignored.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// A single detector result for one frame. Produced once, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceDetection {
    pub bounding_box: BoundingBox,
    /// Detector confidence in [0, 1].
    pub confidence: f32,
    /// Ordered landmark points. Either the 5-point layout
    /// [left_eye, right_eye, nose, left_mouth, right_mouth] or the 68-point iBUG layout.
    #[serde(default)]
    pub landmarks: Vec<(f32, f32)>,
    pub embedding: Embedding,
}

/// A registered reference embedding, owned by the registration subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredIdentity {
    pub identity_id: String,
    pub reference_embedding: Embedding,
    pub registered_at: DateTime<Utc>,
}
