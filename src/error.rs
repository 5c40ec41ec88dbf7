//! Error types and HTTP error responses

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use thiserror::Error;

/// Body type shared by every response the gateway produces
pub type GatewayBody = BoxBody<Bytes, hyper::Error>;

/// Errors raised by the index, the resolution cache and the admin API
#[derive(Error, Debug)]
pub enum Error {
    /// A required field is missing or malformed
    #[error("validation failed: {0}")]
    Validation(String),

    /// The caller's app_id does not match the stored binding
    #[error("hostname {hostname} is not bound to the claimed app")]
    OwnershipMismatch { hostname: String },

    #[error("not found: {0}")]
    NotFound(String),

    /// Request body exceeded the configured limit
    #[error("request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    /// The directory service answered with a non-2xx status or an unreadable body
    #[error("upstream error: {message}")]
    Upstream { status: Option<u16>, message: String },

    #[error("store error: {0}")]
    Store(String),
}

/// Result alias for hostgate operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn upstream(status: Option<u16>, message: impl Into<String>) -> Self {
        Error::Upstream {
            status,
            message: message.into(),
        }
    }

    /// Get the error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Validation(_) => ErrorCode::ValidationError,
            Error::OwnershipMismatch { .. } => ErrorCode::OwnershipMismatch,
            Error::NotFound(_) => ErrorCode::NotFound,
            Error::PayloadTooLarge { .. } => ErrorCode::PayloadTooLarge,
            Error::Upstream { .. } => ErrorCode::UpstreamError,
            Error::Store(_) => ErrorCode::InternalError,
        }
    }

    /// HTTP status for this error; upstream errors keep the upstream status when known
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Upstream {
                status: Some(status),
                ..
            } => StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY),
            other => other.code().status_code(),
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Store(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::upstream(err.status().map(|s| s.as_u16()), err.to_string())
    }
}

/// Error codes reported in JSON error bodies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Missing or malformed request field
    ValidationError,
    /// Delete attempted by an app that does not own the hostname
    OwnershipMismatch,
    /// Unknown hostname or app
    NotFound,
    /// Admin request body too large
    PayloadTooLarge,
    /// Directory service failure
    UpstreamError,
    /// Failed to connect to the upstream proxy target
    ConnectionFailed,
    /// Upstream proxy target did not answer in time
    RequestTimeout,
    /// Internal gateway error
    InternalError,
}

impl ErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::ValidationError => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorCode::OwnershipMismatch => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ErrorCode::UpstreamError => StatusCode::BAD_GATEWAY,
            ErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Hostgate-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::OwnershipMismatch => "OWNERSHIP_MISMATCH",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            ErrorCode::UpstreamError => "UPSTREAM_ERROR",
            ErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ErrorCode, status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status: status.as_u16(),
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

/// Wrap bytes into the shared response body type
pub fn full_body(chunk: impl Into<Bytes>) -> GatewayBody {
    Full::new(chunk.into()).map_err(|never| match never {}).boxed()
}

/// Create a JSON error response with the X-Hostgate-Error header
pub fn json_error_response(code: ErrorCode, message: impl Into<String>) -> Response<GatewayBody> {
    json_error_with_status(code, code.status_code(), message)
}

fn json_error_with_status(
    code: ErrorCode,
    status: StatusCode,
    message: impl Into<String>,
) -> Response<GatewayBody> {
    let body = ErrorResponse::new(code, status, message).to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Hostgate-Error", code.as_header_value())
        .body(full_body(body))
        .expect("valid response with StatusCode enum and static headers")
}

/// Render an [`Error`] as a JSON error response
pub fn error_response(err: &Error) -> Response<GatewayBody> {
    json_error_with_status(err.code(), err.status_code(), err.to_string())
}

/// Create a plain-text response
pub fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<GatewayBody> {
    Response::builder()
        .status(status)
        .header("Content-Type", "text/plain")
        .body(full_body(body))
        .expect("valid response with StatusCode enum and static header")
}
