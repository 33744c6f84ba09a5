use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use clockface_core::detector::{DetectOptions, DetectorError, FaceDetector};
use clockface_core::liveness::LivenessPolicy;
use clockface_core::pipeline::ValidationError;
use clockface_core::{
    AdmissionController, BoundingBox, ChannelSink, Coordinate, Embedding, EmbeddingCache,
    FaceDetection, FailureReason, Frame, Geofence, IdentityStore, MemoryIdentityStore,
    PipelineConfig, PipelineState, ProgressEvent, StoreError, Verdict, VerificationPipeline,
    VerifyError,
};
use tokio::sync::Notify;

const OFFICE: Coordinate = Coordinate {
    latitude: 28.6139,
    longitude: 77.2090,
};
const EMPLOYEE: &str = "emp-0042";
const REFERENCE: [f32; 4] = [0.1, 0.2, 0.3, 0.4];
const STRANGER: [f32; 4] = [0.9, 0.9, 0.9, 0.9];

/// ~50 m north of the office.
fn near_office() -> Coordinate {
    Coordinate::new(OFFICE.latitude + 0.00045, OFFICE.longitude)
}

/// ~150 m north of the office.
fn far_from_office() -> Coordinate {
    Coordinate::new(OFFICE.latitude + 0.00135, OFFICE.longitude)
}

/// Detector double driven by the first byte of each frame:
/// `G` good face, `X` good face of a stranger, `T` good face turned sideways,
/// `L` low confidence, `N` no face, `E` backend error, `P` panic,
/// `S` good face with a 3-dimensional embedding.
#[derive(Default)]
struct ScriptedDetector {
    calls: AtomicUsize,
}

impl ScriptedDetector {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

fn face(values: &[f32], confidence: f32, nose_shift: f32) -> FaceDetection {
    // 256px face centered in a 640x480 frame.
    let (cx, cy, s) = (320.0, 240.0, 102.4);
    FaceDetection {
        bounding_box: BoundingBox { x: 192.0, y: 112.0, width: 256.0, height: 256.0 },
        confidence,
        landmarks: vec![
            (cx - s / 2.0, cy - s / 4.0),
            (cx + s / 2.0, cy - s / 4.0),
            (cx + nose_shift, cy),
            (cx - s / 3.0, cy + s / 3.0),
            (cx + s / 3.0, cy + s / 3.0),
        ],
        embedding: Embedding::new(values.to_vec()),
    }
}

impl FaceDetector for ScriptedDetector {
    fn detect(&self, image: &[u8], _options: DetectOptions) -> Result<FaceDetection, DetectorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match image.first() {
            Some(b'G') => Ok(face(&REFERENCE, 0.95, 0.0)),
            Some(b'X') => Ok(face(&STRANGER, 0.95, 0.0)),
            Some(b'T') => Ok(face(&REFERENCE, 0.95, -30.0)),
            Some(b'L') => Ok(face(&REFERENCE, 0.4, 0.0)),
            Some(b'S') => Ok(face(&REFERENCE[..3], 0.95, 0.0)),
            Some(b'N') => Err(DetectorError::NoFaceFound),
            Some(b'E') => Err(DetectorError::Backend("model crashed".into())),
            Some(b'P') => panic!("detector blew up"),
            _ => Err(DetectorError::InvalidFrame("unknown script".into())),
        }
    }
}

fn frames(script: &str) -> Vec<Frame> {
    script.bytes().map(|b| Frame::new(vec![b], 640, 480)).collect()
}

struct Fixture {
    pipeline: VerificationPipeline,
    detector: Arc<ScriptedDetector>,
    store: Arc<MemoryIdentityStore>,
}

fn fixture_with(max_concurrent: usize, liveness: LivenessPolicy) -> Fixture {
    let detector = Arc::new(ScriptedDetector::default());
    let store = Arc::new(MemoryIdentityStore::new());
    store.insert(EMPLOYEE, Embedding::new(REFERENCE.to_vec()));

    let mut config = PipelineConfig::new(Geofence::new(OFFICE, 100.0));
    config.liveness = liveness;

    let pipeline = VerificationPipeline::new(
        config,
        detector.clone(),
        store.clone(),
        Arc::new(EmbeddingCache::default()),
        Arc::new(AdmissionController::new(max_concurrent)),
    );

    Fixture {
        pipeline,
        detector,
        store,
    }
}

fn fixture() -> Fixture {
    fixture_with(5, LivenessPolicy::default())
}

#[tokio::test]
async fn matching_face_near_office_passes() {
    let f = fixture();
    let outcome = f
        .pipeline
        .verify_frames(frames("GGG"), EMPLOYEE, near_office())
        .await
        .unwrap();

    assert_eq!(outcome.verdict, Verdict::Passed);
    assert!(outcome.is_passed());
    assert!(outcome.matched);
    assert!(outcome.liveness_passed);
    assert!(outcome.location_matched);
    assert_eq!(outcome.distance, Some(0.0));
    assert_eq!(outcome.similarity, 1.0);
    let meters = outcome.distance_meters.unwrap();
    assert!((meters - 50.0).abs() < 1.0, "{meters}");

    // Early exit after two valid frames.
    assert_eq!(outcome.liveness.frames_analyzed, 2);
    assert_eq!(outcome.liveness.valid_frame_count, 2);
    assert_eq!(f.detector.calls(), 2);
    assert_eq!(f.pipeline.admission().in_flight(), 0);
}

#[tokio::test]
async fn outside_radius_fails_with_match_intact() {
    let f = fixture();
    let outcome = f
        .pipeline
        .verify_frames(frames("GGG"), EMPLOYEE, far_from_office())
        .await
        .unwrap();

    assert_eq!(outcome.verdict, Verdict::Failed(FailureReason::OutOfRange));
    assert!(outcome.matched);
    assert!(!outcome.location_matched);
    assert!(outcome.distance_meters.unwrap() > 100.0);
}

#[tokio::test]
async fn one_detectable_face_is_insufficient() {
    let f = fixture();
    let outcome = f
        .pipeline
        .verify_frames(frames("NGN"), EMPLOYEE, near_office())
        .await
        .unwrap();

    assert_eq!(outcome.failure_reason(), Some(FailureReason::InsufficientFrames));
    assert_eq!(outcome.liveness.frames_analyzed, 3);
    assert_eq!(outcome.liveness.valid_frame_count, 1);
    assert!(!outcome.liveness_passed);
    assert!(!outcome.matched);
    assert!(outcome.distance.is_none());
}

#[tokio::test]
async fn stranger_fails_match_but_passes_liveness() {
    let f = fixture();
    let outcome = f
        .pipeline
        .verify_frames(frames("XXX"), EMPLOYEE, near_office())
        .await
        .unwrap();

    assert_eq!(outcome.verdict, Verdict::Failed(FailureReason::FaceMismatch));
    assert!(outcome.liveness_passed);
    assert!(!outcome.matched);
    assert!(outcome.distance.unwrap() > 0.45);
    assert!(outcome.distance_meters.is_none());
}

#[tokio::test]
async fn unknown_identity_has_no_stored_reference() {
    let f = fixture();
    let outcome = f
        .pipeline
        .verify_frames(frames("GG"), "emp-9999", near_office())
        .await
        .unwrap();
    assert_eq!(outcome.failure_reason(), Some(FailureReason::NoStoredIdentity));
    assert!(outcome.liveness_passed);
}

#[tokio::test]
async fn low_quality_frames_do_not_count() {
    let f = fixture();
    let outcome = f
        .pipeline
        .verify_frames(frames("LTL"), EMPLOYEE, near_office())
        .await
        .unwrap();
    // Low confidence and a turned head both fail attendance quality checks.
    assert_eq!(outcome.failure_reason(), Some(FailureReason::InsufficientFrames));
    assert_eq!(outcome.liveness.valid_frame_count, 0);
}

#[tokio::test]
async fn detector_panic_and_error_are_contained_to_their_frame() {
    let f = fixture();
    let outcome = f
        .pipeline
        .verify_frames(frames("PEGG"), EMPLOYEE, near_office())
        .await
        .unwrap();

    assert!(outcome.is_passed());
    assert_eq!(outcome.liveness.frames_analyzed, 4);
    assert_eq!(outcome.liveness.valid_frame_count, 2);
    assert_eq!(f.pipeline.admission().available(), 5);
}

#[tokio::test]
async fn embedding_of_a_different_size_faults_only_its_frame() {
    let f = fixture();
    let outcome = f
        .pipeline
        .verify_frames(frames("GSG"), EMPLOYEE, near_office())
        .await
        .unwrap();

    assert!(outcome.is_passed());
    assert_eq!(outcome.liveness.frames_analyzed, 3);
    assert_eq!(outcome.liveness.valid_frame_count, 2);
    assert_eq!(outcome.distance, Some(0.0));
}

#[tokio::test]
async fn first_valid_frame_fixes_embedding_size() {
    let f = fixture();
    let outcome = f
        .pipeline
        .verify_frames(frames("SGG"), EMPLOYEE, near_office())
        .await
        .unwrap();

    // The later 4-dimensional frames disagree with the first and are dropped.
    assert_eq!(outcome.failure_reason(), Some(FailureReason::InsufficientFrames));
    assert_eq!(outcome.liveness.valid_frame_count, 1);
}

#[tokio::test]
async fn undecodable_frame_is_skipped_without_detection() {
    let f = fixture();
    let mut burst = frames("GGG");
    burst[0] = Frame::new(b"G garbage".to_vec(), 0, 0);

    let outcome = f
        .pipeline
        .verify_frames(burst, EMPLOYEE, near_office())
        .await
        .unwrap();

    assert!(outcome.is_passed());
    assert_eq!(outcome.liveness.frames_analyzed, 3);
    assert_eq!(outcome.liveness.valid_frame_count, 2);
    assert_eq!(f.detector.calls(), 2);
}

#[tokio::test]
async fn too_few_frames_rejected_before_detection() {
    let f = fixture();
    let err = f
        .pipeline
        .verify_frames(frames("G"), EMPLOYEE, near_office())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        VerifyError::Validation(ValidationError::TooFewFrames { submitted: 1, required: 2 })
    ));
    assert_eq!(err.reason(), Some(FailureReason::InsufficientFrames));
    assert_eq!(f.detector.calls(), 0);
}

#[tokio::test]
async fn non_finite_location_rejected() {
    let f = fixture();
    let err = f
        .pipeline
        .verify_frames(frames("GG"), EMPLOYEE, Coordinate::new(f64::NAN, 77.0))
        .await
        .unwrap_err();

    assert!(matches!(err, VerifyError::Validation(ValidationError::Coordinate(_))));
    assert_eq!(f.detector.calls(), 0);
    assert_eq!(f.pipeline.admission().available(), 5);
}

#[tokio::test]
async fn busy_service_sheds_load_and_recovers() {
    let f = fixture_with(1, LivenessPolicy::default());
    let held = f.pipeline.admission().try_acquire().unwrap();

    let err = f
        .pipeline
        .verify_frames(frames("GG"), EMPLOYEE, near_office())
        .await
        .unwrap_err();
    assert!(matches!(err, VerifyError::Capacity(_)));
    assert_eq!(err.reason(), Some(FailureReason::AdmissionRejected));
    assert!(err.is_retryable());
    assert_eq!(f.detector.calls(), 0);

    drop(held);
    let outcome = f
        .pipeline
        .verify_frames(frames("GG"), EMPLOYEE, near_office())
        .await
        .unwrap();
    assert!(outcome.is_passed());
    assert_eq!(f.pipeline.admission().available(), 1);
}

#[tokio::test]
async fn reference_is_read_through_cache_and_invalidated() {
    let f = fixture();
    assert!(f.pipeline.cache().get(EMPLOYEE).is_none());

    f.pipeline
        .verify_frames(frames("GG"), EMPLOYEE, near_office())
        .await
        .unwrap();
    assert_eq!(
        f.pipeline.cache().get(EMPLOYEE),
        Some(Embedding::new(REFERENCE.to_vec()))
    );

    // Re-registration upstream: the store changes, the cache still holds the old reference.
    f.store.insert(EMPLOYEE, Embedding::new(STRANGER.to_vec()));
    let stale = f
        .pipeline
        .verify_frames(frames("GG"), EMPLOYEE, near_office())
        .await
        .unwrap();
    assert!(stale.is_passed());

    f.pipeline.cache().invalidate(EMPLOYEE);
    let fresh = f
        .pipeline
        .verify_frames(frames("GG"), EMPLOYEE, near_office())
        .await
        .unwrap();
    assert_eq!(fresh.failure_reason(), Some(FailureReason::FaceMismatch));
}

/// Store whose read snapshots the current reference, then parks until released.
struct GatedStore {
    inner: MemoryIdentityStore,
    reading: Notify,
    release: Notify,
}

#[async_trait]
impl IdentityStore for GatedStore {
    async fn reference_embedding(&self, identity: &str) -> Result<Option<Embedding>, StoreError> {
        let snapshot = self.inner.reference_embedding(identity).await;
        self.reading.notify_one();
        self.release.notified().await;
        snapshot
    }
}

#[tokio::test(flavor = "current_thread")]
async fn invalidation_during_store_read_is_not_undone() {
    let store = Arc::new(GatedStore {
        inner: MemoryIdentityStore::new(),
        reading: Notify::new(),
        release: Notify::new(),
    });
    store.inner.insert(EMPLOYEE, Embedding::new(REFERENCE.to_vec()));

    let pipeline = VerificationPipeline::new(
        PipelineConfig::new(Geofence::new(OFFICE, 100.0)),
        Arc::new(ScriptedDetector::default()),
        store.clone(),
        Arc::new(EmbeddingCache::default()),
        Arc::new(AdmissionController::new(5)),
    );

    let (outcome, ()) = tokio::join!(
        pipeline.verify_frames(frames("GG"), EMPLOYEE, near_office()),
        async {
            store.reading.notified().await;
            // Re-registration lands while the read above is still pending.
            store.inner.insert(EMPLOYEE, Embedding::new(STRANGER.to_vec()));
            pipeline.cache().invalidate(EMPLOYEE);
            store.release.notify_one();
        },
    );

    // The in-flight attempt used the reference it read...
    assert!(outcome.unwrap().is_passed());
    // ...but that reference must not be cached over the invalidation.
    assert_eq!(pipeline.cache().get(EMPLOYEE), None);
}

#[tokio::test]
async fn strict_liveness_analyses_every_frame() {
    let strict = LivenessPolicy {
        strict: true,
        ..LivenessPolicy::default()
    };

    let f = fixture_with(5, strict.clone());
    let outcome = f
        .pipeline
        .verify_frames(frames("GGGGG"), EMPLOYEE, near_office())
        .await
        .unwrap();
    assert!(outcome.is_passed());
    assert_eq!(outcome.liveness.frames_analyzed, 5);
    assert!((outcome.liveness.liveness_score - 0.5).abs() < 1e-6);
    assert!(outcome.liveness.passed);

    let f = fixture_with(5, strict);
    let outcome = f
        .pipeline
        .verify_frames(frames("GGG"), EMPLOYEE, near_office())
        .await
        .unwrap();
    assert_eq!(outcome.failure_reason(), Some(FailureReason::LivenessFailed));
    assert!(!outcome.liveness_passed);
}

#[tokio::test]
async fn registration_scores_every_pose_and_averages() {
    let f = fixture();
    let outcome = f
        .pipeline
        .register_frames(frames("GTNL"), "emp-new")
        .await
        .unwrap();

    assert_eq!(outcome.poses.len(), 4);
    // The turned pose is accepted: registration skips frontality.
    assert!(outcome.poses[0].passed);
    assert!(outcome.poses[1].passed);
    assert!(!outcome.poses[2].face_found);
    assert!(outcome.poses[3].face_found);
    assert!(!outcome.poses[3].passed);
    assert_eq!(outcome.valid_frames, 2);
    assert_eq!(outcome.embedding.values, REFERENCE.to_vec());
    assert_eq!(f.detector.calls(), 4);
}

#[tokio::test]
async fn registration_without_usable_poses_fails() {
    let f = fixture();
    let err = f
        .pipeline
        .register_frames(frames("NLG"), "emp-new")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        VerifyError::Validation(ValidationError::TooFewValidFrames { valid: 1, required: 2 })
    ));
    assert_eq!(f.pipeline.admission().available(), 5);
}

fn drain(rx: &mut tokio::sync::mpsc::Receiver<ProgressEvent>) -> Vec<ProgressEvent> {
    let mut events = Vec::new();
    while let Ok(e) = rx.try_recv() {
        events.push(e);
    }
    events
}

#[tokio::test]
async fn progress_events_follow_state_machine() {
    let (sink, mut rx) = ChannelSink::channel(64);
    let f = fixture();
    let pipeline = f.pipeline.with_progress_sink(Arc::new(sink));

    let outcome = pipeline
        .verify_frames(frames("NGG"), EMPLOYEE, near_office())
        .await
        .unwrap();
    let events = drain(&mut rx);

    assert!(events.iter().all(|e| e.attempt_id == outcome.attempt_id));
    let states: Vec<PipelineState> = events.iter().map(|e| e.state).collect();
    assert_eq!(states.first(), Some(&PipelineState::Received));
    assert_eq!(states[1], PipelineState::Admitted);
    assert_eq!(states.last(), Some(&PipelineState::Passed));
    assert!(states.contains(&PipelineState::IdentityMatch));
    assert!(states.contains(&PipelineState::LocationCheck));

    let frame_events: Vec<(usize, usize)> = events
        .iter()
        .filter_map(|e| e.frame_index.map(|i| (i, e.valid_frames)))
        .collect();
    assert_eq!(frame_events, vec![(0, 0), (1, 1), (2, 2)]);
}

#[tokio::test]
async fn full_progress_channel_never_blocks() {
    let (sink, _rx) = ChannelSink::channel(1);
    let f = fixture();
    let pipeline = f.pipeline.with_progress_sink(Arc::new(sink));

    let outcome = pipeline
        .verify_frames(frames("GGG"), EMPLOYEE, near_office())
        .await
        .unwrap();
    assert!(outcome.is_passed());
}

#[tokio::test(flavor = "current_thread")]
async fn attempts_interleave_on_a_single_thread() {
    let (sink, mut rx) = ChannelSink::channel(256);
    let f = fixture();
    let pipeline = f.pipeline.with_progress_sink(Arc::new(sink));

    let (a, b) = tokio::join!(
        pipeline.verify_frames(frames("GGG"), EMPLOYEE, near_office()),
        pipeline.verify_frames(frames("GGG"), EMPLOYEE, far_from_office()),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert!(a.is_passed());
    assert_eq!(b.failure_reason(), Some(FailureReason::OutOfRange));

    let events = drain(&mut rx);
    let first_b = events.iter().position(|e| e.attempt_id == b.attempt_id).unwrap();
    let a_done = events
        .iter()
        .position(|e| e.attempt_id == a.attempt_id && e.state.is_terminal())
        .unwrap();
    assert!(first_b < a_done, "attempt B should start before A finishes");
}
