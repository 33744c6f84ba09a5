//! clockface-core: biometric attendance verification pipeline.
//!
//! Given a short burst of camera frames and a GPS fix, decides whether the
//! frames show a live face matching a registered identity and whether the
//! device is inside the authorized geofence. Face detection and embedding
//! are delegated to an injected [`FaceDetector`].

pub mod admission;
pub mod cache;
pub mod detector;
pub mod geo;
pub mod liveness;
pub mod matcher;
pub mod pipeline;
pub mod progress;
pub mod quality;
pub mod store;
pub mod types;

pub use admission::{AdmissionController, AdmissionTicket, CapacityError};
pub use cache::EmbeddingCache;
pub use detector::{DetectOptions, DetectorError, FaceDetector};
pub use geo::{Coordinate, GeoError, Geofence};
pub use liveness::{LivenessAggregator, LivenessPolicy, LivenessResult};
pub use matcher::{DescriptorMatcher, MatchError, MatchVerdict};
pub use pipeline::{
    FailureReason, PipelineConfig, PipelineState, RegistrationOutcome, ValidationError,
    VerificationOutcome, VerificationPipeline, Verdict, VerifyError,
};
pub use progress::{ChannelSink, NoopSink, ProgressEvent, ProgressSink, TracingSink};
pub use quality::{FrameQualityAssessor, IssueCode, QualityConfig, QualityVerdict};
pub use store::{IdentityStore, MemoryIdentityStore, StoreError};
pub use types::{BoundingBox, Embedding, FaceDetection, Frame, StoredIdentity};
