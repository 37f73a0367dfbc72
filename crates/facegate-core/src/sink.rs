//! Submission sinks for accepted captures.
//!
//! Both sinks are remote or disk-backed collaborators, so their methods
//! return boxed futures; that keeps the traits object-safe and lets the
//! engine hold them as `Arc<dyn ...>`.

use crate::session::FormError;
use crate::types::CapturedImage;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

pub type SinkFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, SubmissionError>> + Send + 'a>>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubmissionError {
    #[error("{0} is already registered")]
    DuplicateIdentity(String),
    /// Sink-provided message, shown to the user verbatim.
    #[error("{0}")]
    SubmissionFailed(String),
    #[error("registration incomplete: {0}")]
    Invalid(#[from] FormError),
}

/// Result of a successful attendance submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceReceipt {
    /// Display name of the recognised person.
    pub identity_label: String,
}

/// A registered user as echoed back by the registration sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub identifier: String,
    pub display_name: String,
}

/// Everything a registration sink needs: credentials plus exactly three photos.
#[derive(Clone)]
pub struct RegistrationRequest {
    pub identifier: String,
    pub credential: String,
    pub display_name: String,
    pub photos: Vec<CapturedImage>,
}

impl std::fmt::Debug for RegistrationRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrationRequest")
            .field("identifier", &self.identifier)
            .field("credential", &"<redacted>")
            .field("display_name", &self.display_name)
            .field("photos", &self.photos.len())
            .finish()
    }
}

/// Recognition service that marks attendance from a single face image.
pub trait AttendanceSink: Send + Sync {
    /// `context` identifies the room or session the kiosk serves, if any.
    fn submit<'a>(
        &'a self,
        image: &'a CapturedImage,
        context: Option<&'a str>,
    ) -> SinkFuture<'a, AttendanceReceipt>;
}

/// User registry that enrols a new identity with its face photos.
pub trait RegistrationSink: Send + Sync {
    fn register<'a>(&'a self, request: &'a RegistrationRequest) -> SinkFuture<'a, Identity>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_debug_redacts_credential() {
        let req = RegistrationRequest {
            identifier: "jdoe".into(),
            credential: "hunter22".into(),
            display_name: "Jane Doe".into(),
            photos: Vec::new(),
        };
        let dbg = format!("{req:?}");
        assert!(dbg.contains("jdoe"));
        assert!(!dbg.contains("hunter22"));
    }

    #[test]
    fn test_failure_message_is_verbatim() {
        let err = SubmissionError::SubmissionFailed("Face not recognised".into());
        assert_eq!(err.to_string(), "Face not recognised");
    }
}
