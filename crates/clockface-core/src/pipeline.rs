//! Attendance verification and registration pipeline.
//!
//! One verification attempt walks a fixed state machine:
//!
//! ```text
//! RECEIVED -> ADMITTED -> LIVENESS_CHECK -> IDENTITY_MATCH -> LOCATION_CHECK -> PASSED
//!     \            \              \                 \                 \
//!      `------------`--------------`-----------------`-----------------`--> FAILED(reason)
//! ```
//!
//! Frames are analysed one at a time on the blocking pool, with a yield after
//! each so concurrent attempts interleave even on a current-thread runtime.

use crate::admission::{AdmissionController, CapacityError};
use crate::cache::EmbeddingCache;
use crate::detector::{DetectOptions, DetectorError, FaceDetector};
use crate::geo::{Coordinate, GeoError, Geofence};
use crate::liveness::{FrameOutcome, LivenessAggregator, LivenessPolicy, LivenessResult};
use crate::matcher::{DescriptorMatcher, MatchError, DEFAULT_MATCH_THRESHOLD};
use crate::progress::{NoopSink, ProgressEvent, ProgressSink};
use crate::quality::{FrameQualityAssessor, IssueCode, PoseHint, QualityChecks, QualityConfig};
use crate::store::{IdentityStore, StoreError};
use crate::types::{Embedding, Frame};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    AdmissionRejected,
    InsufficientFrames,
    LivenessFailed,
    NoStoredIdentity,
    FaceMismatch,
    OutOfRange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineState {
    Received,
    Admitted,
    LivenessCheck,
    IdentityMatch,
    LocationCheck,
    Passed,
    Failed(FailureReason),
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Passed | Self::Failed(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Passed,
    Failed(FailureReason),
}

impl From<Verdict> for PipelineState {
    fn from(v: Verdict) -> Self {
        match v {
            Verdict::Passed => Self::Passed,
            Verdict::Failed(reason) => Self::Failed(reason),
        }
    }
}

/// Malformed input, rejected before any frame is analysed.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("too few frames: got {submitted}, need at least {required}")]
    TooFewFrames { submitted: usize, required: usize },
    #[error("only {valid} usable frames, need at least {required}")]
    TooFewValidFrames { valid: usize, required: usize },
    #[error("identity id is empty")]
    EmptyIdentity,
    #[error(transparent)]
    Coordinate(#[from] GeoError),
    #[error(transparent)]
    Embedding(#[from] MatchError),
}

#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Capacity(#[from] CapacityError),
    #[error("identity store: {0}")]
    Store(#[from] StoreError),
}

impl VerifyError {
    /// The state-machine failure this error corresponds to, if any.
    pub fn reason(&self) -> Option<FailureReason> {
        match self {
            Self::Capacity(_) => Some(FailureReason::AdmissionRejected),
            Self::Validation(
                ValidationError::TooFewFrames { .. } | ValidationError::TooFewValidFrames { .. },
            ) => Some(FailureReason::InsufficientFrames),
            _ => None,
        }
    }

    /// Whether the caller may retry later with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Capacity(CapacityError::Busy { .. }))
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub quality: QualityConfig,
    pub match_threshold: f32,
    pub liveness: LivenessPolicy,
    pub geofence: Geofence,
}

impl PipelineConfig {
    /// Defaults for everything except the site-specific geofence.
    pub fn new(geofence: Geofence) -> Self {
        Self {
            quality: QualityConfig::default(),
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            liveness: LivenessPolicy::default(),
            geofence,
        }
    }
}

/// Result of a verification attempt that ran to a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationOutcome {
    pub attempt_id: Uuid,
    pub verdict: Verdict,
    pub matched: bool,
    pub similarity: f32,
    /// Euclidean descriptor distance, once the identity stage ran.
    pub distance: Option<f32>,
    pub liveness_passed: bool,
    pub location_matched: bool,
    /// Distance from the geofence anchor, once the location stage ran.
    pub distance_meters: Option<f64>,
    pub liveness: LivenessResult,
}

impl VerificationOutcome {
    pub fn is_passed(&self) -> bool {
        self.verdict == Verdict::Passed
    }

    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self.verdict {
            Verdict::Passed => None,
            Verdict::Failed(reason) => Some(reason),
        }
    }
}

/// Quality report for one registration pose.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoseQuality {
    pub frame_index: usize,
    pub face_found: bool,
    pub passed: bool,
    pub score: f32,
    pub issues: BTreeSet<IssueCode>,
    pub hint: Option<PoseHint>,
}

impl From<&FrameOutcome> for PoseQuality {
    fn from(outcome: &FrameOutcome) -> Self {
        let frame_index = outcome.index();
        match outcome.verdict() {
            Some(v) => Self {
                frame_index,
                face_found: true,
                passed: outcome.is_valid(),
                score: v.score,
                issues: v.issues.clone(),
                hint: v.hint,
            },
            None => Self {
                frame_index,
                face_found: false,
                passed: false,
                score: 0.0,
                issues: BTreeSet::new(),
                hint: None,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationOutcome {
    pub attempt_id: Uuid,
    /// Mean of every valid pose's embedding; the new reference.
    pub embedding: Embedding,
    pub valid_frames: usize,
    pub poses: Vec<PoseQuality>,
}

/// Accumulates stage results until a verdict is reached.
struct OutcomeDraft {
    attempt_id: Uuid,
    liveness: LivenessResult,
    liveness_passed: bool,
    matched: bool,
    similarity: f32,
    distance: Option<f32>,
    location_matched: bool,
    distance_meters: Option<f64>,
}

impl OutcomeDraft {
    fn new(attempt_id: Uuid, liveness: LivenessResult) -> Self {
        Self {
            attempt_id,
            liveness,
            liveness_passed: false,
            matched: false,
            similarity: 0.0,
            distance: None,
            location_matched: false,
            distance_meters: None,
        }
    }

    fn finish(self, verdict: Verdict) -> VerificationOutcome {
        VerificationOutcome {
            attempt_id: self.attempt_id,
            verdict,
            matched: self.matched,
            similarity: self.similarity,
            distance: self.distance,
            liveness_passed: self.liveness_passed,
            location_matched: self.location_matched,
            distance_meters: self.distance_meters,
            liveness: self.liveness,
        }
    }
}

/// How a frame sweep is run.
#[derive(Debug, Clone, Copy)]
struct SweepMode {
    options: DetectOptions,
    checks: QualityChecks,
    early_exit: bool,
}

pub struct VerificationPipeline {
    detector: Arc<dyn FaceDetector>,
    store: Arc<dyn IdentityStore>,
    cache: Arc<EmbeddingCache>,
    admission: Arc<AdmissionController>,
    progress: Arc<dyn ProgressSink>,
    assessor: FrameQualityAssessor,
    matcher: DescriptorMatcher,
    liveness: LivenessAggregator,
    geofence: Geofence,
}

impl VerificationPipeline {
    pub fn new(
        config: PipelineConfig,
        detector: Arc<dyn FaceDetector>,
        store: Arc<dyn IdentityStore>,
        cache: Arc<EmbeddingCache>,
        admission: Arc<AdmissionController>,
    ) -> Self {
        Self {
            detector,
            store,
            cache,
            admission,
            progress: Arc::new(NoopSink),
            assessor: FrameQualityAssessor::new(config.quality),
            matcher: DescriptorMatcher::new(config.match_threshold),
            liveness: LivenessAggregator::new(config.liveness),
            geofence: config.geofence,
        }
    }

    pub fn with_progress_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = sink;
        self
    }

    pub fn cache(&self) -> &Arc<EmbeddingCache> {
        &self.cache
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    pub fn geofence(&self) -> &Geofence {
        &self.geofence
    }

    /// Fewest valid frames an attempt can succeed with.
    pub fn min_valid_frames(&self) -> usize {
        self.liveness.policy().min_valid_frames.max(1)
    }

    /// Verify that `frames` show the live, registered `identity` at an authorized location.
    ///
    /// Business failures (liveness, mismatch, out of range, ...) come back as
    /// `Ok` with a failed verdict; `Err` is reserved for malformed input,
    /// load shedding, and store faults.
    pub async fn verify_frames(
        &self,
        frames: Vec<Frame>,
        identity: &str,
        location: Coordinate,
    ) -> Result<VerificationOutcome, VerifyError> {
        let attempt_id = Uuid::new_v4();
        self.emit(attempt_id, PipelineState::Received, None, 0);

        let result = self.run_verification(attempt_id, frames, identity, location).await;

        match &result {
            Ok(outcome) => {
                self.emit(attempt_id, outcome.verdict.into(), None, outcome.liveness.valid_frame_count);
                tracing::info!(
                    %attempt_id,
                    identity,
                    verdict = ?outcome.verdict,
                    distance = ?outcome.distance,
                    distance_m = ?outcome.distance_meters,
                    "verification finished"
                );
            }
            Err(e) => {
                if let Some(reason) = e.reason() {
                    self.emit(attempt_id, PipelineState::Failed(reason), None, 0);
                }
                tracing::warn!(%attempt_id, identity, error = %e, "verification rejected");
            }
        }

        result
    }

    async fn run_verification(
        &self,
        attempt_id: Uuid,
        frames: Vec<Frame>,
        identity: &str,
        location: Coordinate,
    ) -> Result<VerificationOutcome, VerifyError> {
        self.validate(&frames, identity)?;
        location.validate().map_err(ValidationError::from)?;

        // Held until this function returns, on every path.
        let _ticket = self.admission.try_acquire()?;
        self.emit(attempt_id, PipelineState::Admitted, None, 0);

        let outcomes = self
            .sweep(
                attempt_id,
                frames,
                SweepMode {
                    options: DetectOptions::ATTENDANCE,
                    checks: QualityChecks::ALL,
                    early_exit: true,
                },
            )
            .await;

        let assessment = self.liveness.aggregate(&outcomes).map_err(ValidationError::from)?;
        let valid = assessment.result.valid_frame_count;
        let mut draft = OutcomeDraft::new(attempt_id, assessment.result);

        let probe = match assessment.average_embedding {
            Some(probe) if valid >= self.liveness.policy().min_valid_frames => probe,
            _ => return Ok(draft.finish(Verdict::Failed(FailureReason::InsufficientFrames))),
        };

        self.emit(attempt_id, PipelineState::LivenessCheck, None, valid);
        draft.liveness_passed = self.liveness.gate(&draft.liveness);
        if !draft.liveness_passed {
            return Ok(draft.finish(Verdict::Failed(FailureReason::LivenessFailed)));
        }

        self.emit(attempt_id, PipelineState::IdentityMatch, None, valid);
        let Some(reference) = self.reference_for(identity).await? else {
            return Ok(draft.finish(Verdict::Failed(FailureReason::NoStoredIdentity)));
        };

        let verdict = self
            .matcher
            .compare(&probe, &reference)
            .map_err(ValidationError::from)?;
        draft.matched = verdict.matched;
        draft.similarity = verdict.similarity;
        draft.distance = Some(verdict.distance);
        tracing::debug!(
            %attempt_id,
            distance = verdict.distance,
            confidence = verdict.confidence,
            matched = verdict.matched,
            "descriptor compared"
        );
        if !verdict.matched {
            return Ok(draft.finish(Verdict::Failed(FailureReason::FaceMismatch)));
        }

        self.emit(attempt_id, PipelineState::LocationCheck, None, valid);
        let (meters, inside) = self.geofence.check(location).map_err(ValidationError::from)?;
        draft.distance_meters = Some(meters);
        draft.location_matched = inside;
        if !inside {
            return Ok(draft.finish(Verdict::Failed(FailureReason::OutOfRange)));
        }

        Ok(draft.finish(Verdict::Passed))
    }

    /// Build a reference embedding from a set of registration poses.
    ///
    /// Every frame is analysed (no early exit) with frontality skipped, since
    /// poses are deliberately turned. Identity match and location are not run.
    pub async fn register_frames(
        &self,
        frames: Vec<Frame>,
        identity: &str,
    ) -> Result<RegistrationOutcome, VerifyError> {
        let attempt_id = Uuid::new_v4();
        self.emit(attempt_id, PipelineState::Received, None, 0);

        let result = self.run_registration(attempt_id, frames, identity).await;

        match &result {
            Ok(outcome) => {
                self.emit(attempt_id, PipelineState::Passed, None, outcome.valid_frames);
                tracing::info!(
                    %attempt_id,
                    identity,
                    valid_frames = outcome.valid_frames,
                    poses = outcome.poses.len(),
                    "registration embedding built"
                );
            }
            Err(e) => {
                if let Some(reason) = e.reason() {
                    self.emit(attempt_id, PipelineState::Failed(reason), None, 0);
                }
                tracing::warn!(%attempt_id, identity, error = %e, "registration rejected");
            }
        }

        result
    }

    async fn run_registration(
        &self,
        attempt_id: Uuid,
        frames: Vec<Frame>,
        identity: &str,
    ) -> Result<RegistrationOutcome, VerifyError> {
        self.validate(&frames, identity)?;

        let _ticket = self.admission.try_acquire()?;
        self.emit(attempt_id, PipelineState::Admitted, None, 0);

        let outcomes = self
            .sweep(
                attempt_id,
                frames,
                SweepMode {
                    options: DetectOptions::REGISTRATION,
                    checks: QualityChecks::REGISTRATION,
                    early_exit: false,
                },
            )
            .await;

        let assessment = self.liveness.aggregate(&outcomes).map_err(ValidationError::from)?;
        let valid = assessment.result.valid_frame_count;
        let required = self.liveness.policy().min_valid_frames;

        let embedding = match assessment.average_embedding {
            Some(e) if valid >= required => e,
            _ => {
                return Err(ValidationError::TooFewValidFrames { valid, required }.into());
            }
        };

        Ok(RegistrationOutcome {
            attempt_id,
            embedding,
            valid_frames: valid,
            poses: outcomes.iter().map(PoseQuality::from).collect(),
        })
    }

    fn validate(&self, frames: &[Frame], identity: &str) -> Result<(), ValidationError> {
        if identity.trim().is_empty() {
            return Err(ValidationError::EmptyIdentity);
        }
        let required = self.min_valid_frames();
        if frames.len() < required {
            return Err(ValidationError::TooFewFrames {
                submitted: frames.len(),
                required,
            });
        }
        Ok(())
    }

    /// Cache first, then the store. A store hit is written back to the cache
    /// unless the identity was invalidated while the store read was pending.
    async fn reference_for(&self, identity: &str) -> Result<Option<Embedding>, StoreError> {
        let generation = self.cache.generation(identity);
        if let Some(hit) = self.cache.get(identity) {
            tracing::debug!(identity, "reference embedding cache hit");
            return Ok(Some(hit));
        }

        let stored = self.store.reference_embedding(identity).await?;
        if let Some(reference) = &stored {
            self.cache.put_if_generation(identity, generation, reference.clone());
        }
        Ok(stored)
    }

    /// Analyse frames in order, yielding after each one.
    async fn sweep(&self, attempt_id: Uuid, frames: Vec<Frame>, mode: SweepMode) -> Vec<FrameOutcome> {
        let total = frames.len();
        let mut outcomes = Vec::with_capacity(total);
        let mut valid = 0usize;
        // Fixed by the first valid frame; later frames must agree.
        let mut dimensions: Option<usize> = None;

        for (index, frame) in frames.into_iter().enumerate() {
            if mode.early_exit && self.liveness.is_satisfied(valid) {
                tracing::debug!(%attempt_id, analysed = index, total, "enough valid frames, stopping early");
                break;
            }

            let mut outcome = self.analyse_frame(index, frame, mode).await;
            match (outcome.embedding().map(Embedding::len), dimensions) {
                (Some(0), _) => {
                    outcome = FrameOutcome::Faulted {
                        index,
                        reason: "detector returned an empty embedding".into(),
                    };
                }
                (Some(len), Some(expected)) if len != expected => {
                    outcome = FrameOutcome::Faulted {
                        index,
                        reason: format!("embedding has {len} dimensions, expected {expected}"),
                    };
                }
                (Some(len), None) => dimensions = Some(len),
                _ => {}
            }

            match &outcome {
                FrameOutcome::Valid { .. } => valid += 1,
                FrameOutcome::Rejected { verdict, .. } => {
                    tracing::debug!(%attempt_id, frame = index, issues = ?verdict.issues, "frame rejected");
                }
                FrameOutcome::NoFace { .. } => {
                    tracing::debug!(%attempt_id, frame = index, "no face in frame");
                }
                FrameOutcome::Faulted { reason, .. } => {
                    tracing::warn!(%attempt_id, frame = index, reason = %reason, "frame faulted");
                }
            }
            outcomes.push(outcome);

            self.emit(attempt_id, PipelineState::LivenessCheck, Some(index), valid);
            tokio::task::yield_now().await;
        }

        outcomes
    }

    async fn analyse_frame(&self, index: usize, frame: Frame, mode: SweepMode) -> FrameOutcome {
        if frame.width == 0 || frame.height == 0 {
            return FrameOutcome::Faulted {
                index,
                reason: "frame could not be decoded".into(),
            };
        }

        let detector = Arc::clone(&self.detector);
        let (width, height) = (frame.width, frame.height);
        let options = mode.options;

        let joined = tokio::task::spawn_blocking(move || detector.detect(&frame.data, options)).await;

        match joined {
            Ok(Ok(detection)) => {
                let verdict = self.assessor.assess(&detection, width, height, mode.checks);
                if verdict.passed {
                    FrameOutcome::Valid {
                        index,
                        embedding: detection.embedding,
                        verdict,
                    }
                } else {
                    FrameOutcome::Rejected { index, verdict }
                }
            }
            Ok(Err(DetectorError::NoFaceFound)) => FrameOutcome::NoFace { index },
            Ok(Err(e)) => FrameOutcome::Faulted {
                index,
                reason: e.to_string(),
            },
            Err(e) => FrameOutcome::Faulted {
                index,
                reason: format!("detector task failed: {e}"),
            },
        }
    }

    fn emit(&self, attempt_id: Uuid, state: PipelineState, frame_index: Option<usize>, valid_frames: usize) {
        self.progress.emit(ProgressEvent {
            attempt_id,
            state,
            frame_index,
            valid_frames,
        });
    }
}
