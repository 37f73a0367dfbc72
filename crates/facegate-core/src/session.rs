//! Registration capture session: exactly three accepted photos plus the
//! account form, submitted together.

use crate::geometry::FrameStatus;
use crate::sink::{Identity, RegistrationRequest, RegistrationSink, SubmissionError};
use crate::types::CapturedImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const REQUIRED_PHOTOS: usize = 3;
pub const MIN_CREDENTIAL_LEN: usize = 6;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("face position not accepted: {0}")]
    NotReady(FrameStatus),
    #[error("maximum number of photos already taken")]
    SessionFull,
    #[error("no photo at index {index} (session holds {len})")]
    IndexOutOfRange { index: usize, len: usize },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormError {
    #[error("{0} is required")]
    MissingField(&'static str),
    #[error("password must be at least {min} characters")]
    CredentialTooShort { min: usize },
    #[error("{have} of {need} photos taken")]
    PhotosIncomplete { have: usize, need: usize },
}

/// Account details entered alongside the photos.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct RegistrationForm {
    /// Login identifier (e-mail in the reference deployment).
    pub identifier: String,
    pub credential: String,
    pub display_name: String,
}

impl RegistrationForm {
    pub fn new(
        identifier: impl Into<String>,
        credential: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            credential: credential.into(),
            display_name: display_name.into(),
        }
    }

    fn missing_field(&self) -> Option<&'static str> {
        [
            ("identifier", &self.identifier),
            ("password", &self.credential),
            ("name", &self.display_name),
        ]
        .into_iter()
        .find(|(_, value)| value.trim().is_empty())
        .map(|(name, _)| name)
    }

    fn check_credential(&self) -> Result<(), FormError> {
        if self.credential.chars().count() < MIN_CREDENTIAL_LEN {
            return Err(FormError::CredentialTooShort {
                min: MIN_CREDENTIAL_LEN,
            });
        }
        Ok(())
    }

    /// Field checks that do not depend on the photos, so a bad form can be
    /// rejected before any capture starts.
    pub fn validate(&self) -> Result<(), FormError> {
        if let Some(name) = self.missing_field() {
            return Err(FormError::MissingField(name));
        }
        self.check_credential()
    }
}

impl std::fmt::Debug for RegistrationForm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrationForm")
            .field("identifier", &self.identifier)
            .field("credential", &"<redacted>")
            .field("display_name", &self.display_name)
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct CaptureSession {
    photos: Vec<CapturedImage>,
    form: RegistrationForm,
}

impl CaptureSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_form(form: RegistrationForm) -> Self {
        Self {
            photos: Vec::with_capacity(REQUIRED_PHOTOS),
            form,
        }
    }

    pub fn form(&self) -> &RegistrationForm {
        &self.form
    }

    pub fn set_form(&mut self, form: RegistrationForm) {
        self.form = form;
    }

    pub fn photos(&self) -> &[CapturedImage] {
        &self.photos
    }

    pub fn len(&self) -> usize {
        self.photos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.photos.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.photos.len() >= REQUIRED_PHOTOS
    }

    /// Append a photo taken while the frame classified as `status`.
    ///
    /// Returns the new photo count.
    pub fn add_photo(
        &mut self,
        image: CapturedImage,
        status: FrameStatus,
    ) -> Result<usize, SessionError> {
        if !status.is_ready() {
            return Err(SessionError::NotReady(status));
        }
        if self.is_full() {
            return Err(SessionError::SessionFull);
        }
        self.photos.push(image);
        tracing::debug!(count = self.photos.len(), "registration photo added");
        Ok(self.photos.len())
    }

    /// Remove the photo at `index`; later photos shift left.
    pub fn remove_photo(&mut self, index: usize) -> Result<CapturedImage, SessionError> {
        if index >= self.photos.len() {
            return Err(SessionError::IndexOutOfRange {
                index,
                len: self.photos.len(),
            });
        }
        Ok(self.photos.remove(index))
    }

    pub fn clear(&mut self) {
        self.photos.clear();
    }

    /// Why the session cannot be submitted yet, if it cannot.
    pub fn validate(&self) -> Result<(), FormError> {
        if let Some(name) = self.form.missing_field() {
            return Err(FormError::MissingField(name));
        }
        if self.photos.len() != REQUIRED_PHOTOS {
            return Err(FormError::PhotosIncomplete {
                have: self.photos.len(),
                need: REQUIRED_PHOTOS,
            });
        }
        self.form.check_credential()
    }

    pub fn can_submit(&self) -> bool {
        self.validate().is_ok()
    }

    /// Snapshot of the session as a sink request.
    pub fn request(&self) -> Result<RegistrationRequest, FormError> {
        self.validate()?;
        Ok(RegistrationRequest {
            identifier: self.form.identifier.trim().to_string(),
            credential: self.form.credential.clone(),
            display_name: self.form.display_name.trim().to_string(),
            photos: self.photos.clone(),
        })
    }

    /// Hand the three photos and the form to `sink`. Photos are kept on
    /// failure so the user can retry.
    pub async fn submit(&self, sink: &dyn RegistrationSink) -> Result<Identity, SubmissionError> {
        let request = self.request()?;
        tracing::info!(identifier = %request.identifier, "submitting registration");

        match sink.register(&request).await {
            Ok(identity) => {
                tracing::info!(id = %identity.id, identifier = %identity.identifier, "registration accepted");
                Ok(identity)
            }
            Err(err) => {
                tracing::warn!(error = %err, identifier = %request.identifier, "registration rejected");
                Err(err)
            }
        }
    }
}
