//! Error taxonomy for waking and probing, and JSON error responses for the admin API

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::time::Duration;

/// Failures recovered inside the coordinator and its poll tasks.
///
/// None of these reach the caller of `ensure_started`; they decide whether a
/// poll keeps waiting, whether the throttle is cleared, and what gets logged.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WakeError {
    /// The probe did not complete before its deadline
    #[error("probe of {backend} timed out after {timeout:?}")]
    ProbeTimeout { backend: String, timeout: Duration },

    /// The probe failed at the transport level
    #[error("probe of {backend} failed: {reason}")]
    ProbeTransportError { backend: String, reason: String },

    /// The wake endpoint answered with a non-success status
    #[error("wake request to {backend} rejected: {reason}")]
    WakeRejected { backend: String, reason: String },

    /// The wake endpoint could not be reached
    #[error("wake request to {backend} failed: {reason}")]
    WakeTransportError { backend: String, reason: String },

    /// The session vanished between scheduling and probing
    #[error("session {session} is no longer connected")]
    StaleSession { session: String },
}

/// Error codes for admin API errors
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdminErrorCode {
    /// Missing or wrong bearer token
    Unauthorized,
    /// Unknown backend name
    UnknownBackend,
    /// Malformed session id
    InvalidSession,
    /// Unknown route
    NotFound,
    /// Configuration reload failed
    ReloadFailed,
}

impl AdminErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            AdminErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            AdminErrorCode::UnknownBackend => StatusCode::NOT_FOUND,
            AdminErrorCode::InvalidSession => StatusCode::BAD_REQUEST,
            AdminErrorCode::NotFound => StatusCode::NOT_FOUND,
            AdminErrorCode::ReloadFailed => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Wakegate-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            AdminErrorCode::Unauthorized => "UNAUTHORIZED",
            AdminErrorCode::UnknownBackend => "UNKNOWN_BACKEND",
            AdminErrorCode::InvalidSession => "INVALID_SESSION",
            AdminErrorCode::NotFound => "NOT_FOUND",
            AdminErrorCode::ReloadFailed => "RELOAD_FAILED",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: AdminErrorCode,
    pub message: String,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: AdminErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Wakegate-Error header
pub fn json_error_response(code: AdminErrorCode, message: impl Into<String>) -> Response<Full<Bytes>> {
    let error = ErrorResponse::new(code, message);

    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "application/json")
        .header("X-Wakegate-Error", code.as_header_value())
        .body(Full::new(Bytes::from(error.to_json())))
        .expect("valid response with StatusCode enum and static headers")
}
