//! Liveness aggregation over a burst of frames.
//!
//! A replayed photo tends to produce few usable detections across a burst,
//! while a live subject yields consistent valid frames. The score is the
//! fraction of a saturation count reached by valid frames, and the averaged
//! embedding of those frames becomes the probe descriptor.
//!
//! Frame analysis stops early once `min_valid_frames` are collected. That
//! caps latency but also caps the score (2 / 10 = 0.2), so under the default
//! policy the pipeline gates on the valid-frame count and reports `passed`
//! for information only. [`LivenessPolicy::strict`] disables the early exit
//! and gates on `passed` itself.

use crate::matcher::MatchError;
use crate::quality::QualityVerdict;
use crate::types::Embedding;
use serde::{Deserialize, Serialize};

// --- Named constants ---
pub const DEFAULT_MIN_VALID_FRAMES: usize = 2;
pub const DEFAULT_MIN_LIVENESS_SCORE: f32 = 0.3;
/// Valid frame count at which the score saturates at 1.0.
pub const DEFAULT_SATURATION_FRAMES: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivenessPolicy {
    pub min_valid_frames: usize,
    pub min_score: f32,
    pub saturation_frames: usize,
    /// Stop analysing frames as soon as `min_valid_frames` are collected.
    pub early_exit: bool,
    /// Gate on `LivenessResult::passed` instead of the valid-frame count.
    /// Implies no early exit.
    pub strict: bool,
}

impl Default for LivenessPolicy {
    fn default() -> Self {
        Self {
            min_valid_frames: DEFAULT_MIN_VALID_FRAMES,
            min_score: DEFAULT_MIN_LIVENESS_SCORE,
            saturation_frames: DEFAULT_SATURATION_FRAMES,
            early_exit: true,
            strict: false,
        }
    }
}

/// What happened to one submitted frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FrameOutcome {
    /// Face found and every enabled quality check passed.
    Valid {
        index: usize,
        embedding: Embedding,
        verdict: QualityVerdict,
    },
    /// Face found but quality checks failed.
    Rejected { index: usize, verdict: QualityVerdict },
    NoFace { index: usize },
    /// Detector errored or panicked on this frame.
    Faulted { index: usize, reason: String },
}

impl FrameOutcome {
    pub fn index(&self) -> usize {
        match self {
            Self::Valid { index, .. }
            | Self::Rejected { index, .. }
            | Self::NoFace { index }
            | Self::Faulted { index, .. } => *index,
        }
    }

    pub fn embedding(&self) -> Option<&Embedding> {
        match self {
            Self::Valid { embedding, .. } => Some(embedding),
            _ => None,
        }
    }

    pub fn verdict(&self) -> Option<&QualityVerdict> {
        match self {
            Self::Valid { verdict, .. } | Self::Rejected { verdict, .. } => Some(verdict),
            _ => None,
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LivenessResult {
    pub frames_analyzed: usize,
    pub valid_frame_count: usize,
    /// `min(1, valid / saturation_frames)`.
    pub liveness_score: f32,
    pub passed: bool,
}

/// Liveness verdict plus the averaged probe embedding.
#[derive(Debug, Clone)]
pub struct LivenessAssessment {
    pub result: LivenessResult,
    /// Element-wise mean of valid embeddings; `None` when no frame was valid.
    pub average_embedding: Option<Embedding>,
}

#[derive(Debug, Clone, Default)]
pub struct LivenessAggregator {
    policy: LivenessPolicy,
}

impl LivenessAggregator {
    pub fn new(policy: LivenessPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &LivenessPolicy {
        &self.policy
    }

    pub fn score(&self, valid_frames: usize) -> f32 {
        let saturation = self.policy.saturation_frames.max(1);
        (valid_frames as f32 / saturation as f32).min(1.0)
    }

    pub fn evaluate(&self, frames_analyzed: usize, valid_frames: usize) -> LivenessResult {
        let liveness_score = self.score(valid_frames);
        LivenessResult {
            frames_analyzed,
            valid_frame_count: valid_frames,
            liveness_score,
            passed: valid_frames >= self.policy.min_valid_frames
                && liveness_score > self.policy.min_score,
        }
    }

    /// Whether the frame sweep may stop after collecting `valid_frames`.
    pub fn is_satisfied(&self, valid_frames: usize) -> bool {
        self.policy.early_exit
            && !self.policy.strict
            && valid_frames >= self.policy.min_valid_frames
    }

    /// Gate applied at the pipeline's liveness stage.
    pub fn gate(&self, result: &LivenessResult) -> bool {
        if self.policy.strict {
            result.passed
        } else {
            result.valid_frame_count >= self.policy.min_valid_frames
        }
    }

    pub fn aggregate(&self, outcomes: &[FrameOutcome]) -> Result<LivenessAssessment, MatchError> {
        let embeddings: Vec<&Embedding> = outcomes.iter().filter_map(FrameOutcome::embedding).collect();
        let result = self.evaluate(outcomes.len(), embeddings.len());

        let average_embedding = if embeddings.is_empty() {
            None
        } else {
            Some(average_embedding(&embeddings)?)
        };

        Ok(LivenessAssessment {
            result,
            average_embedding,
        })
    }
}

/// Element-wise mean. A single embedding is returned unchanged.
pub fn average_embedding(embeddings: &[&Embedding]) -> Result<Embedding, MatchError> {
    let (first, rest) = embeddings.split_first().ok_or(MatchError::Empty)?;
    if rest.is_empty() {
        return Ok((*first).clone());
    }

    let dim = first.len();
    let mut sum = vec![0.0f32; dim];
    for e in embeddings {
        if e.len() != dim {
            return Err(MatchError::LengthMismatch {
                probe: e.len(),
                reference: dim,
            });
        }
        for (acc, v) in sum.iter_mut().zip(&e.values) {
            *acc += v;
        }
    }

    let n = embeddings.len() as f32;
    Ok(Embedding {
        values: sum.into_iter().map(|v| v / n).collect(),
        model_version: first.model_version.clone(),
    })
}
