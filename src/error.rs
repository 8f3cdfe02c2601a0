//! Error handling and JSON error responses for the control plane

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Header carrying the machine-readable error code
pub const X_FASTPUSH_ERROR: &str = "x-fastpush-error";

/// Error codes returned by the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlErrorCode {
    /// Missing or wrong `x-auth-token` header
    Unauthorized,
    /// Known control path, unsupported method
    MethodNotAllowed,
    /// Request body could not be decoded
    MalformedBody,
    /// The backend could not be (re)started
    RestartFailed,
    /// The backend did not accept the forwarded request
    BackendUnavailable,
    /// Internal controller error
    InternalError,
}

impl ControlErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ControlErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ControlErrorCode::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ControlErrorCode::MalformedBody => StatusCode::BAD_REQUEST,
            ControlErrorCode::RestartFailed => StatusCode::INTERNAL_SERVER_ERROR,
            ControlErrorCode::BackendUnavailable => StatusCode::BAD_GATEWAY,
            ControlErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Fastpush-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ControlErrorCode::Unauthorized => "UNAUTHORIZED",
            ControlErrorCode::MethodNotAllowed => "METHOD_NOT_ALLOWED",
            ControlErrorCode::MalformedBody => "MALFORMED_BODY",
            ControlErrorCode::RestartFailed => "RESTART_FAILED",
            ControlErrorCode::BackendUnavailable => "BACKEND_UNAVAILABLE",
            ControlErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ControlErrorCode,
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ControlErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

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

/// Create a JSON error response with X-Fastpush-Error header
pub fn json_error_response(
    code: ControlErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);

    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "application/json")
        .header(X_FASTPUSH_ERROR, code.as_header_value())
        .body(Full::new(Bytes::from(error.to_json())).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
