//! Per-frame usability scoring: confidence, face size, centering, frontality.
//!
//! Each check is independently togglable. Attendance enforces all of them;
//! registration captures deliberate head turns and so skips frontality.

use crate::types::FaceDetection;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

// --- Named constants ---
pub const DEFAULT_MIN_CONFIDENCE: f32 = 0.7;
pub const DEFAULT_MIN_WIDTH_RATIO: f32 = 0.2;
pub const DEFAULT_MAX_WIDTH_RATIO: f32 = 0.8;
/// Max distance of the face center from the image center, as a fraction of each axis.
pub const DEFAULT_MAX_CENTER_OFFSET: f32 = 0.3;
pub const DEFAULT_SYMMETRY_TOLERANCE: f32 = 0.15;
pub const DEFAULT_TILT_TOLERANCE: f32 = 0.10;

// Landmark indices for the two supported layouts.
const FIVE_POINT: [usize; 5] = [0, 1, 2, 3, 4];
const IBUG_68_POINT: [usize; 5] = [36, 45, 30, 48, 54];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueCode {
    LowConfidence,
    TooFar,
    TooClose,
    NotCentered,
    NotFrontal,
}

/// Corrective hint attached to `NOT_FRONTAL`. Directions are in image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoseHint {
    TurnLeft,
    TurnRight,
    LevelHead,
}

/// Which checks run for a given frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityChecks {
    pub confidence: bool,
    pub size: bool,
    pub centering: bool,
    pub frontality: bool,
}

impl QualityChecks {
    /// Attendance: every check enforced.
    pub const ALL: Self = Self {
        confidence: true,
        size: true,
        centering: true,
        frontality: true,
    };

    /// Registration: poses are intentionally turned, so frontality is skipped.
    pub const REGISTRATION: Self = Self {
        confidence: true,
        size: true,
        centering: true,
        frontality: false,
    };
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityConfig {
    pub min_confidence: f32,
    pub min_width_ratio: f32,
    pub max_width_ratio: f32,
    pub max_center_offset: f32,
    pub symmetry_tolerance: f32,
    pub tilt_tolerance: f32,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            min_confidence: DEFAULT_MIN_CONFIDENCE,
            min_width_ratio: DEFAULT_MIN_WIDTH_RATIO,
            max_width_ratio: DEFAULT_MAX_WIDTH_RATIO,
            max_center_offset: DEFAULT_MAX_CENTER_OFFSET,
            symmetry_tolerance: DEFAULT_SYMMETRY_TOLERANCE,
            tilt_tolerance: DEFAULT_TILT_TOLERANCE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityVerdict {
    pub passed: bool,
    /// Minimum of the enabled sub-scores, in [0, 1].
    pub score: f32,
    pub issues: BTreeSet<IssueCode>,
    pub hint: Option<PoseHint>,
}

/// Frontality measurements from five landmarks.
#[derive(Debug, Clone, Copy)]
struct PoseRatios {
    /// Left/right asymmetry of eye and mouth spans around the nose, 0 = symmetric.
    symmetry: f32,
    /// Vertical eye offset relative to inter-eye distance, 0 = level.
    tilt: f32,
    /// True when the nose sits closer to the left eye in the image.
    leans_left: bool,
}

pub struct FrameQualityAssessor {
    config: QualityConfig,
}

impl FrameQualityAssessor {
    pub fn new(config: QualityConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &QualityConfig {
        &self.config
    }

    /// Score one detection against the frame it came from.
    pub fn assess(
        &self,
        detection: &FaceDetection,
        frame_width: u32,
        frame_height: u32,
        checks: QualityChecks,
    ) -> QualityVerdict {
        let mut issues = BTreeSet::new();
        let mut score = 1.0f32;
        let mut hint = None;

        if checks.confidence {
            let confidence = if detection.confidence.is_finite() {
                detection.confidence.clamp(0.0, 1.0)
            } else {
                0.0
            };
            if confidence < self.config.min_confidence {
                issues.insert(IssueCode::LowConfidence);
            }
            score = score.min(confidence);
        }

        if checks.size {
            let ratio = match detection.bounding_box.width / frame_width as f32 {
                r if frame_width > 0 && r.is_finite() => r,
                _ => 0.0,
            };
            let sub = if ratio < self.config.min_width_ratio {
                issues.insert(IssueCode::TooFar);
                ratio.max(0.0) / self.config.min_width_ratio
            } else if ratio > self.config.max_width_ratio {
                issues.insert(IssueCode::TooClose);
                self.config.max_width_ratio / ratio
            } else {
                1.0
            };
            score = score.min(sub);
        }

        if checks.centering {
            let offset = if frame_width > 0 && frame_height > 0 {
                let (cx, cy) = detection.bounding_box.center();
                let dx = (cx - frame_width as f32 / 2.0).abs() / frame_width as f32;
                let dy = (cy - frame_height as f32 / 2.0).abs() / frame_height as f32;
                dx.max(dy)
            } else {
                1.0
            };
            if offset.is_nan() || offset > self.config.max_center_offset {
                issues.insert(IssueCode::NotCentered);
            }
            score = score.min(1.0 - offset.min(1.0));
        }

        if checks.frontality {
            match pose_ratios(&detection.landmarks) {
                Some(pose) => {
                    let turned = pose.symmetry > self.config.symmetry_tolerance;
                    let tilted = pose.tilt > self.config.tilt_tolerance;
                    if turned || tilted {
                        issues.insert(IssueCode::NotFrontal);
                        hint = Some(directional_hint(&pose, turned));
                    }
                    score = score.min(1.0 - pose.symmetry.max(pose.tilt).min(1.0));
                }
                None => {
                    issues.insert(IssueCode::NotFrontal);
                    score = 0.0;
                }
            }
        }

        let score = if score.is_finite() { score.clamp(0.0, 1.0) } else { 0.0 };

        QualityVerdict {
            passed: issues.is_empty(),
            score,
            issues,
            hint,
        }
    }
}

impl Default for FrameQualityAssessor {
    fn default() -> Self {
        Self::new(QualityConfig::default())
    }
}

fn directional_hint(pose: &PoseRatios, turned: bool) -> PoseHint {
    if turned {
        // Nose drifted toward the left eye: the face is rotated toward image-left.
        if pose.leans_left {
            PoseHint::TurnRight
        } else {
            PoseHint::TurnLeft
        }
    } else {
        PoseHint::LevelHead
    }
}

/// Pick the five frontality landmarks out of a supported layout.
fn frontal_points(points: &[(f32, f32)]) -> Option<[(f32, f32); 5]> {
    let indices = match points.len() {
        5 => FIVE_POINT,
        68 => IBUG_68_POINT,
        _ => return None,
    };
    Some(indices.map(|i| points[i]))
}

fn pose_ratios(points: &[(f32, f32)]) -> Option<PoseRatios> {
    let [left_eye, right_eye, nose, left_mouth, right_mouth] = frontal_points(points)?;
    if points.iter().any(|(x, y)| !x.is_finite() || !y.is_finite()) {
        return None;
    }

    let eye_left_span = nose.0 - left_eye.0;
    let eye_right_span = right_eye.0 - nose.0;
    let mouth_left_span = nose.0 - left_mouth.0;
    let mouth_right_span = right_mouth.0 - nose.0;

    let symmetry = (asymmetry(eye_left_span, eye_right_span)
        + asymmetry(mouth_left_span, mouth_right_span))
        / 2.0;

    let dx = right_eye.0 - left_eye.0;
    let dy = right_eye.1 - left_eye.1;
    let eye_distance = (dx * dx + dy * dy).sqrt();
    if eye_distance <= f32::EPSILON {
        return None;
    }

    Some(PoseRatios {
        symmetry,
        tilt: dy.abs() / eye_distance,
        leans_left: eye_left_span < eye_right_span,
    })
}

/// |l - r| / (l + r); a nose outside the eye/mouth span counts as fully turned.
fn asymmetry(left: f32, right: f32) -> f32 {
    if left <= 0.0 || right <= 0.0 {
        return 1.0;
    }
    (left - right).abs() / (left + right)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BoundingBox, Embedding};

    const W: u32 = 640;
    const H: u32 = 480;

    /// Symmetric five-point face centered at (cx, cy) with eye span `s`.
    fn five_points(cx: f32, cy: f32, s: f32) -> Vec<(f32, f32)> {
        vec![
            (cx - s / 2.0, cy - s / 4.0),
            (cx + s / 2.0, cy - s / 4.0),
            (cx, cy),
            (cx - s / 3.0, cy + s / 3.0),
            (cx + s / 3.0, cy + s / 3.0),
        ]
    }

    fn detection(x: f32, y: f32, w: f32, h: f32, conf: f32) -> FaceDetection {
        let (cx, cy) = (x + w / 2.0, y + h / 2.0);
        FaceDetection {
            bounding_box: BoundingBox { x, y, width: w, height: h },
            confidence: conf,
            landmarks: five_points(cx, cy, w * 0.4),
            embedding: Embedding::new(vec![0.0; 4]),
        }
    }

    fn good() -> FaceDetection {
        // 256px wide face (ratio 0.4), centered.
        detection(192.0, 112.0, 256.0, 256.0, 0.95)
    }

    #[test]
    fn test_good_frame_passes() {
        let v = FrameQualityAssessor::default().assess(&good(), W, H, QualityChecks::ALL);
        assert!(v.passed, "issues: {:?}", v.issues);
        assert!(v.issues.is_empty());
        assert!(v.hint.is_none());
        assert!((v.score - 0.95).abs() < 1e-6);
    }

    #[test]
    fn test_low_confidence() {
        let mut det = good();
        det.confidence = 0.5;
        let v = FrameQualityAssessor::default().assess(&det, W, H, QualityChecks::ALL);
        assert!(!v.passed);
        assert_eq!(v.issues, BTreeSet::from([IssueCode::LowConfidence]));
        assert!((v.score - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_too_far_and_too_close() {
        let far = detection(288.0, 208.0, 64.0, 64.0, 0.9); // ratio 0.1
        let v = FrameQualityAssessor::default().assess(&far, W, H, QualityChecks::ALL);
        assert!(v.issues.contains(&IssueCode::TooFar));
        assert!((v.score - 0.5).abs() < 1e-6);

        let close = detection(0.0, 0.0, 576.0, 480.0, 0.9); // ratio 0.9
        let v = FrameQualityAssessor::default().assess(&close, W, H, QualityChecks::ALL);
        assert!(v.issues.contains(&IssueCode::TooClose));
        assert!(!v.issues.contains(&IssueCode::TooFar));
    }

    #[test]
    fn test_not_centered() {
        // Face center at x=544: offset 224/640 = 0.35.
        let det = detection(416.0, 112.0, 256.0, 256.0, 0.9);
        let v = FrameQualityAssessor::default().assess(&det, W, H, QualityChecks::ALL);
        assert_eq!(v.issues, BTreeSet::from([IssueCode::NotCentered]));
        assert!((v.score - 0.65).abs() < 1e-5);
    }

    #[test]
    fn test_turned_face_gets_directional_hint() {
        let mut det = good();
        // Shift the nose 30px toward the left eye.
        det.landmarks[2].0 -= 30.0;
        let v = FrameQualityAssessor::default().assess(&det, W, H, QualityChecks::ALL);
        assert!(v.issues.contains(&IssueCode::NotFrontal));
        assert_eq!(v.hint, Some(PoseHint::TurnRight));

        let mut det = good();
        det.landmarks[2].0 += 30.0;
        let v = FrameQualityAssessor::default().assess(&det, W, H, QualityChecks::ALL);
        assert_eq!(v.hint, Some(PoseHint::TurnLeft));
    }

    #[test]
    fn test_tilted_face_asks_to_level() {
        let mut det = good();
        // Eye span is ~102px; a 20px drop gives tilt ≈ 0.19.
        det.landmarks[1].1 += 20.0;
        let v = FrameQualityAssessor::default().assess(&det, W, H, QualityChecks::ALL);
        assert_eq!(v.issues, BTreeSet::from([IssueCode::NotFrontal]));
        assert_eq!(v.hint, Some(PoseHint::LevelHead));
    }

    #[test]
    fn test_registration_skips_frontality() {
        let mut det = good();
        det.landmarks[2].0 -= 30.0;
        let v = FrameQualityAssessor::default().assess(&det, W, H, QualityChecks::REGISTRATION);
        assert!(v.passed);
    }

    #[test]
    fn test_missing_landmarks_fail_frontality() {
        let mut det = good();
        det.landmarks.clear();
        let v = FrameQualityAssessor::default().assess(&det, W, H, QualityChecks::ALL);
        assert!(v.issues.contains(&IssueCode::NotFrontal));
        assert_eq!(v.score, 0.0);
        assert!(v.hint.is_none());
    }

    #[test]
    fn test_ibug_68_layout_supported() {
        let base = good();
        let mut points = vec![(320.0f32, 240.0f32); 68];
        for (slot, idx) in IBUG_68_POINT.iter().enumerate() {
            points[*idx] = base.landmarks[slot];
        }
        let det = FaceDetection { landmarks: points, ..base };
        let v = FrameQualityAssessor::default().assess(&det, W, H, QualityChecks::ALL);
        assert!(v.passed, "issues: {:?}", v.issues);
    }

    #[test]
    fn test_multiple_issues_score_is_minimum() {
        let det = detection(560.0, 400.0, 64.0, 64.0, 0.75);
        let v = FrameQualityAssessor::default().assess(&det, W, H, QualityChecks::ALL);
        assert!(v.issues.contains(&IssueCode::TooFar));
        assert!(v.issues.contains(&IssueCode::NotCentered));
        // Size sub-score 0.1 / 0.2 = 0.5 is lower than confidence 0.75.
        assert!(v.score <= 0.5 + 1e-6);
    }

    #[test]
    fn test_no_checks_always_passes() {
        let none = QualityChecks {
            confidence: false,
            size: false,
            centering: false,
            frontality: false,
        };
        let det = detection(0.0, 0.0, 10.0, 10.0, 0.1);
        let v = FrameQualityAssessor::default().assess(&det, W, H, none);
        assert!(v.passed);
        assert_eq!(v.score, 1.0);
    }

    #[test]
    fn test_zero_dimension_frame_fails() {
        let v = FrameQualityAssessor::default().assess(&good(), 0, 0, QualityChecks::ALL);
        assert!(v.issues.contains(&IssueCode::TooFar));
        assert!(v.issues.contains(&IssueCode::NotCentered));
    }

    #[test]
    fn test_issue_codes_serialize_screaming() {
        let json = serde_json::to_string(&IssueCode::NotFrontal).unwrap();
        assert_eq!(json, "\"NOT_FRONTAL\"");
    }
}
