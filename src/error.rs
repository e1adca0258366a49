//! Error types and HTTP error response formatting.

use axum::response::{IntoResponse, Response};
use http::StatusCode;
use thiserror::Error;

/// Error codes for delta service operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    // Store errors
    NotFound,
    AlreadyExists,
    Conflict,
    PreconditionFailed,
    HistoryExpired,

    // Proxy errors
    UpstreamUnavailable,
    DecodeError,

    // Codec errors
    FormatError,
    InvalidOffset,

    // Request errors
    InvalidInput,
    Canceled,
    InternalError,
}

impl ErrorCode {
    /// Returns the string representation of the error code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NotFound => "NotFound",
            ErrorCode::AlreadyExists => "AlreadyExists",
            ErrorCode::Conflict => "Conflict",
            ErrorCode::PreconditionFailed => "PreconditionFailed",
            ErrorCode::HistoryExpired => "HistoryExpired",
            ErrorCode::UpstreamUnavailable => "UpstreamUnavailable",
            ErrorCode::DecodeError => "DecodeError",
            ErrorCode::FormatError => "FormatError",
            ErrorCode::InvalidOffset => "InvalidOffset",
            ErrorCode::InvalidInput => "InvalidInput",
            ErrorCode::Canceled => "Canceled",
            ErrorCode::InternalError => "InternalError",
        }
    }

    /// Returns the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::NotFound => StatusCode::NOT_FOUND,

            ErrorCode::AlreadyExists | ErrorCode::Conflict => StatusCode::CONFLICT,

            ErrorCode::PreconditionFailed => StatusCode::PRECONDITION_FAILED,

            // The watch start point was compacted away; clients must re-list.
            ErrorCode::HistoryExpired => StatusCode::GONE,

            ErrorCode::FormatError | ErrorCode::InvalidOffset | ErrorCode::InvalidInput => {
                StatusCode::BAD_REQUEST
            }

            ErrorCode::UpstreamUnavailable => StatusCode::BAD_GATEWAY,

            ErrorCode::DecodeError | ErrorCode::Canceled | ErrorCode::InternalError => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Returns the default message for this error code.
    pub fn default_message(&self) -> &'static str {
        match self {
            ErrorCode::NotFound => "The specified resource does not exist.",
            ErrorCode::AlreadyExists => "The specified resource already exists.",
            ErrorCode::Conflict => {
                "The operation lost a race with a concurrent writer. Please retry the request."
            }
            ErrorCode::PreconditionFailed => {
                "The supplied uid or resourceVersion precondition did not match the stored resource."
            }
            ErrorCode::HistoryExpired => {
                "The requested watch start point is no longer available. Re-list and watch from the returned resourceVersion."
            }
            ErrorCode::UpstreamUnavailable => "The driver backend could not be reached.",
            ErrorCode::DecodeError => "The driver backend returned a malformed response.",
            ErrorCode::FormatError => "The bitmap payload does not match its declared dimensions.",
            ErrorCode::InvalidOffset => "A block offset is not aligned to the block size.",
            ErrorCode::InvalidInput => "The request body or parameters are invalid.",
            ErrorCode::Canceled => "The operation was canceled before it completed.",
            ErrorCode::InternalError => {
                "The server encountered an internal error. Please retry the request."
            }
        }
    }
}

/// Delta service error with code and message.
#[derive(Debug, Error)]
#[error("{code:?}: {message}")]
pub struct DeltaError {
    pub code: ErrorCode,
    pub message: String,
    pub request_id: Option<String>,
}

impl DeltaError {
    /// Creates a new error with the given code and default message.
    pub fn new(code: ErrorCode) -> Self {
        Self {
            message: code.default_message().to_string(),
            code,
            request_id: None,
        }
    }

    /// Creates a new error with a custom message.
    pub fn with_message(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            request_id: None,
        }
    }

    /// Sets the request ID for this error.
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

impl IntoResponse for DeltaError {
    fn into_response(self) -> Response {
        let status = self.code.status_code();
        let request_id = self
            .request_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let body = serde_json::json!({
            "error": {
                "code": self.code.as_str(),
                "message": self.message,
                "requestId": request_id,
                "time": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            }
        });

        let mut response = axum::Json(body).into_response();
        *response.status_mut() = status;
        if let Ok(value) = request_id.parse() {
            response.headers_mut().insert("x-request-id", value);
        }
        if let Ok(value) = self.code.as_str().parse() {
            response.headers_mut().insert("x-error-code", value);
        }
        response
    }
}

/// Result type alias for delta service operations.
pub type DeltaResult<T> = Result<T, DeltaError>;
