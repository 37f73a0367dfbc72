//! Face-capture admission: frame geometry, capture gating and registration sessions.
//!
//! Classifies each polled frame's face geometry, decides when a capture is
//! admitted (manual cooldown or automatic interval), and accumulates the
//! three-photo registration session. The face detector and the submission
//! sinks are external collaborators behind traits.

pub mod admission;
pub mod countdown;
pub mod detector;
pub mod geometry;
pub mod overlay;
pub mod session;
pub mod sink;
pub mod types;

pub use admission::{AdmissionController, CaptureMode, CaptureTrigger, Rejection};
pub use detector::{DetectorError, FaceDetector, ReplayDetector};
pub use geometry::{FrameClassification, FrameEvaluator, FrameStatus};
pub use session::{CaptureSession, FormError, RegistrationForm, SessionError};
pub use sink::{AttendanceReceipt, AttendanceSink, Identity, RegistrationSink, SubmissionError};
pub use types::{BoundingBox, CapturedImage, FaceDetection, Landmarks, Point};
