//! Attendance and registration sinks backed by the remote face service.

use base64::Engine as _;
use facegate_core::sink::{
    AttendanceReceipt, AttendanceSink, Identity, RegistrationRequest, RegistrationSink,
    SinkFuture, SubmissionError,
};
use facegate_core::types::CapturedImage;
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

pub const ATTENDANCE_PATH: &str = "/api/attendance";
pub const REGISTER_PATH: &str = "/api/register";
pub const REGISTRATION_ROLE: &str = "mahasiswa";
const ATTENDANCE_FAILED: &str = "Attendance failed. Please try again.";
const REGISTRATION_FAILED: &str = "Registration failed. Please try again.";
const UNKNOWN_IDENTITY: &str = "Unknown";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum HttpSinkError {
    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

fn build_client() -> Result<reqwest::Client, HttpSinkError> {
    Ok(reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?)
}

fn endpoint(api_url: &str, path: &str) -> String {
    format!("{}{}", api_url.trim_end_matches('/'), path)
}

/// JPEG screenshot as plain standard base64, without a `data:` prefix.
pub fn image_base64(image: &CapturedImage) -> String {
    base64::engine::general_purpose::STANDARD.encode(&image.jpeg)
}

/// The service's own error message, or `fallback`.
fn failure_message(body: Option<&Value>, fallback: &str) -> String {
    body.and_then(|b| b.get("message"))
        .and_then(Value::as_str)
        .filter(|m| !m.trim().is_empty())
        .map(String::from)
        .unwrap_or_else(|| fallback.to_string())
}

/// Display name of the recognised person, wherever the service put it.
fn identity_label(body: &Value) -> String {
    const KEYS: &[&str] = &["name", "label", "identity"];
    let scopes = [Some(body), body.get("data"), body.get("user")];

    scopes
        .into_iter()
        .flatten()
        .flat_map(|scope| KEYS.iter().filter_map(move |k| scope.get(*k)))
        .find_map(Value::as_str)
        .unwrap_or(UNKNOWN_IDENTITY)
        .to_string()
}

#[derive(Serialize)]
struct AttendancePayload<'a> {
    image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    room: Option<&'a str>,
}

pub struct HttpAttendanceSink {
    client: reqwest::Client,
    url: String,
}

impl HttpAttendanceSink {
    pub fn new(api_url: &str) -> Result<Self, HttpSinkError> {
        Ok(Self {
            client: build_client()?,
            url: endpoint(api_url, ATTENDANCE_PATH),
        })
    }

    async fn post(
        &self,
        image: &CapturedImage,
        context: Option<&str>,
    ) -> Result<AttendanceReceipt, SubmissionError> {
        let payload = AttendancePayload {
            image: image_base64(image),
            room: context,
        };
        tracing::debug!(url = %self.url, bytes = image.jpeg.len(), room = ?context, "posting attendance");

        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                tracing::warn!(error = %e, url = %self.url, "attendance request failed");
                SubmissionError::SubmissionFailed(ATTENDANCE_FAILED.to_string())
            })?;

        let status = response.status();
        let body = response.json::<Value>().await.ok();

        if !status.is_success() {
            tracing::warn!(status = status.as_u16(), "attendance rejected");
            return Err(SubmissionError::SubmissionFailed(failure_message(
                body.as_ref(),
                ATTENDANCE_FAILED,
            )));
        }

        let label = body
            .as_ref()
            .map(identity_label)
            .unwrap_or_else(|| UNKNOWN_IDENTITY.to_string());
        tracing::info!(identity = %label, "attendance recorded");
        Ok(AttendanceReceipt {
            identity_label: label,
        })
    }
}

impl AttendanceSink for HttpAttendanceSink {
    fn submit<'a>(
        &'a self,
        image: &'a CapturedImage,
        context: Option<&'a str>,
    ) -> SinkFuture<'a, AttendanceReceipt> {
        Box::pin(self.post(image, context))
    }
}

#[derive(Serialize)]
struct RegisterPayload<'a> {
    email: &'a str,
    password: &'a str,
    name: &'a str,
    role: &'a str,
    photos: Vec<String>,
}

pub struct HttpRegistrationSink {
    client: reqwest::Client,
    url: String,
}

impl HttpRegistrationSink {
    pub fn new(api_url: &str) -> Result<Self, HttpSinkError> {
        Ok(Self {
            client: build_client()?,
            url: endpoint(api_url, REGISTER_PATH),
        })
    }

    async fn post(&self, request: &RegistrationRequest) -> Result<Identity, SubmissionError> {
        let payload = RegisterPayload {
            email: &request.identifier,
            password: &request.credential,
            name: &request.display_name,
            role: REGISTRATION_ROLE,
            photos: request.photos.iter().map(image_base64).collect(),
        };

        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                tracing::warn!(error = %e, url = %self.url, "registration request failed");
                SubmissionError::SubmissionFailed(REGISTRATION_FAILED.to_string())
            })?;

        let status = response.status();
        let body = response.json::<Value>().await.ok();

        if status == StatusCode::CONFLICT {
            return Err(SubmissionError::DuplicateIdentity(request.identifier.clone()));
        }
        if !status.is_success() {
            tracing::warn!(status = status.as_u16(), "registration rejected");
            return Err(SubmissionError::SubmissionFailed(failure_message(
                body.as_ref(),
                REGISTRATION_FAILED,
            )));
        }

        parse_identity(body.as_ref(), request)
    }
}

fn parse_identity(
    body: Option<&Value>,
    request: &RegistrationRequest,
) -> Result<Identity, SubmissionError> {
    let user = body.map(|b| b.get("user").unwrap_or(b));
    let field = |key: &str| user.and_then(|u| u.get(key)).and_then(Value::as_str);

    let id = field("id").ok_or_else(|| {
        SubmissionError::SubmissionFailed("registration response carried no user id".into())
    })?;
    Ok(Identity {
        id: id.to_string(),
        identifier: field("email").unwrap_or(&request.identifier).to_string(),
        display_name: field("name").unwrap_or(&request.display_name).to_string(),
    })
}

impl RegistrationSink for HttpRegistrationSink {
    fn register<'a>(&'a self, request: &'a RegistrationRequest) -> SinkFuture<'a, Identity> {
        Box::pin(self.post(request))
    }
}
