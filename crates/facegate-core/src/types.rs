use serde::{Deserialize, Deserializer, Serialize};
use std::time::Instant;

/// A 2D point in video-pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

/// Bounding box of a detected face in video-pixel coordinates.
///
/// A JSON `null` in any field deserializes to NaN so that a half-initialised
/// detector result is rejected by [`BoundingBox::is_valid`] instead of failing
/// the whole parse.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    #[serde(deserialize_with = "nullable_f32")]
    pub x: f32,
    #[serde(deserialize_with = "nullable_f32")]
    pub y: f32,
    #[serde(deserialize_with = "nullable_f32")]
    pub width: f32,
    #[serde(deserialize_with = "nullable_f32")]
    pub height: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self { x, y, width, height }
    }

    /// All four fields are finite numbers.
    pub fn is_valid(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.width.is_finite() && self.height.is_finite()
    }

    pub fn area(&self) -> f32 {
        self.width * self.height
    }
}

fn nullable_f32<'de, D>(deserializer: D) -> Result<f32, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<f32>::deserialize(deserializer)?.unwrap_or(f32::NAN))
}

/// Named landmark point sets produced by the detector oracle.
///
/// With the 68-point scheme the nose holds 9 points (bridge then base) and
/// each eye holds 6 points starting at the outer corner.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Landmarks {
    #[serde(default)]
    pub nose: Vec<Point>,
    #[serde(default)]
    pub left_eye: Vec<Point>,
    #[serde(default)]
    pub right_eye: Vec<Point>,
}

/// One face-detection result for a single polled frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceDetection {
    #[serde(default)]
    pub bounding_box: Option<BoundingBox>,
    #[serde(default)]
    pub landmarks: Landmarks,
    /// Detector score, informational only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

impl FaceDetection {
    /// The bounding box, if present and made of finite numbers.
    pub fn valid_box(&self) -> Option<&BoundingBox> {
        self.bounding_box.as_ref().filter(|b| b.is_valid())
    }
}

/// A still image accepted by the admission controller, JPEG-encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedImage {
    pub jpeg: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub captured_at: Instant,
}
