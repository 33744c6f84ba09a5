//! Euclidean descriptor matching between a probe and a reference embedding.

use crate::types::Embedding;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Euclidean distance below which two descriptors are the same person.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.45;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatchError {
    #[error("embedding length mismatch: {probe} vs {reference}")]
    LengthMismatch { probe: usize, reference: usize },
    #[error("embedding is empty")]
    Empty,
}

/// Result of comparing two descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchVerdict {
    pub matched: bool,
    pub distance: f32,
    /// `max(0, 1 - distance)`.
    pub similarity: f32,
    /// `1 - distance / threshold` for a match, 0 otherwise.
    pub confidence: f32,
}

#[derive(Debug, Clone, Copy)]
pub struct DescriptorMatcher {
    threshold: f32,
}

impl DescriptorMatcher {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn compare(&self, probe: &Embedding, reference: &Embedding) -> Result<MatchVerdict, MatchError> {
        if probe.len() != reference.len() {
            return Err(MatchError::LengthMismatch {
                probe: probe.len(),
                reference: reference.len(),
            });
        }
        if probe.is_empty() {
            return Err(MatchError::Empty);
        }

        let distance = probe.euclidean_distance(reference);
        // NaN components never match.
        let matched = distance < self.threshold;
        let confidence = if matched {
            1.0 - distance / self.threshold
        } else {
            0.0
        };

        Ok(MatchVerdict {
            matched,
            distance,
            similarity: (1.0 - distance).max(0.0),
            confidence,
        })
    }
}

impl Default for DescriptorMatcher {
    fn default() -> Self {
        Self::new(DEFAULT_MATCH_THRESHOLD)
    }
}
