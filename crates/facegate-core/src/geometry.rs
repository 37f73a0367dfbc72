//! Frame geometry evaluation.
//!
//! Decides, from one detector result and the current video dimensions,
//! whether the face is close enough, not too close, and facing the camera.
//! Pure: the same inputs always give the same classification.

use crate::types::FaceDetection;
use serde::{Deserialize, Serialize};

pub const DEFAULT_MIN_FACE_RATIO: f32 = 0.05;
pub const DEFAULT_MAX_FACE_RATIO: f32 = 0.40;
pub const DEFAULT_ALIGNMENT_TOLERANCE: f32 = 0.15;
/// Tip of the 9-point nose contour in the 68-point landmark scheme.
pub const DEFAULT_NOSE_TIP_INDEX: usize = 3;

/// Verdict for a single polled frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameStatus {
    NoFace,
    TooFar,
    TooClose,
    Misaligned,
    Ready,
}

impl FrameStatus {
    pub fn is_ready(self) -> bool {
        self == FrameStatus::Ready
    }

    /// Live hint shown next to the camera preview.
    pub fn message(self) -> &'static str {
        match self {
            FrameStatus::NoFace => "No face detected",
            FrameStatus::TooFar => "Face too far, move closer",
            FrameStatus::TooClose => "Face too close, move back a little",
            FrameStatus::Misaligned => "Face the camera directly, don't tilt",
            FrameStatus::Ready => "Position is good, ready to capture",
        }
    }
}

impl std::fmt::Display for FrameStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FrameStatus::NoFace => "no_face",
            FrameStatus::TooFar => "too_far",
            FrameStatus::TooClose => "too_close",
            FrameStatus::Misaligned => "misaligned",
            FrameStatus::Ready => "ready",
        };
        f.write_str(name)
    }
}

/// Classification plus the measurements that produced it.
///
/// Only `status` drives admission; the metrics are carried for logging and
/// diagnostics and are `None` when evaluation stopped before computing them.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrameClassification {
    pub status: FrameStatus,
    pub face_ratio: Option<f32>,
    pub deviation: Option<f32>,
    pub tolerance: Option<f32>,
}

impl FrameClassification {
    fn bare(status: FrameStatus) -> Self {
        Self {
            status,
            face_ratio: None,
            deviation: None,
            tolerance: None,
        }
    }

    pub fn no_face() -> Self {
        Self::bare(FrameStatus::NoFace)
    }
}

/// Which landmark points stand for the outer eye corners and the nose tip.
///
/// `right_eye_outer = None` selects the last point of the right eye set.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LandmarkIndices {
    pub left_eye_outer: usize,
    pub right_eye_outer: Option<usize>,
    pub nose_tip: usize,
}

impl Default for LandmarkIndices {
    fn default() -> Self {
        Self {
            left_eye_outer: 0,
            right_eye_outer: None,
            nose_tip: DEFAULT_NOSE_TIP_INDEX,
        }
    }
}

/// Tunable policy thresholds for the evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluatorConfig {
    /// Face area / frame area below this is too far.
    pub min_face_ratio: f32,
    /// Face area / frame area above this is too close.
    pub max_face_ratio: f32,
    /// Allowed nose offset from the eye midpoint, as a fraction of box width.
    pub alignment_tolerance: f32,
    pub landmarks: LandmarkIndices,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            min_face_ratio: DEFAULT_MIN_FACE_RATIO,
            max_face_ratio: DEFAULT_MAX_FACE_RATIO,
            alignment_tolerance: DEFAULT_ALIGNMENT_TOLERANCE,
            landmarks: LandmarkIndices::default(),
        }
    }
}

/// Stateless frame geometry evaluator.
#[derive(Debug, Clone, Default)]
pub struct FrameEvaluator {
    config: EvaluatorConfig,
}

impl FrameEvaluator {
    pub fn new(config: EvaluatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EvaluatorConfig {
        &self.config
    }

    /// Classify one detector result against the current video dimensions.
    pub fn evaluate(
        &self,
        detection: Option<&FaceDetection>,
        video_width: u32,
        video_height: u32,
    ) -> FrameClassification {
        let Some(detection) = detection else {
            return FrameClassification::no_face();
        };
        let Some(bbox) = detection.valid_box() else {
            return FrameClassification::no_face();
        };

        let video_area = video_width as f32 * video_height as f32;
        if !(video_area.is_finite() && video_area > 0.0) {
            // Video not ready yet: no metadata to compare against.
            return FrameClassification::no_face();
        }

        let face_ratio = bbox.area() / video_area;
        let mut result = FrameClassification {
            face_ratio: Some(face_ratio),
            ..FrameClassification::no_face()
        };

        if face_ratio < self.config.min_face_ratio {
            result.status = FrameStatus::TooFar;
            return result;
        }
        if face_ratio > self.config.max_face_ratio {
            result.status = FrameStatus::TooClose;
            return result;
        }

        let tolerance = bbox.width * self.config.alignment_tolerance;
        result.tolerance = Some(tolerance);

        let Some(deviation) = self.nose_deviation(detection) else {
            result.status = FrameStatus::Misaligned;
            return result;
        };
        result.deviation = Some(deviation);

        result.status = if deviation > tolerance {
            FrameStatus::Misaligned
        } else {
            FrameStatus::Ready
        };
        result
    }

    /// Horizontal distance between the nose tip and the outer-eye midpoint.
    ///
    /// `None` when a required landmark is missing or not finite.
    fn nose_deviation(&self, detection: &FaceDetection) -> Option<f32> {
        let idx = &self.config.landmarks;
        let lm = &detection.landmarks;

        let left = lm.left_eye.get(idx.left_eye_outer)?;
        let right = match idx.right_eye_outer {
            Some(i) => lm.right_eye.get(i)?,
            None => lm.right_eye.last()?,
        };
        let nose = lm.nose.get(idx.nose_tip)?;

        if ![left, right, nose].iter().all(|p| p.is_finite()) {
            return None;
        }

        let eye_center_x = (left.x + right.x) / 2.0;
        Some((nose.x - eye_center_x).abs())
    }
}
