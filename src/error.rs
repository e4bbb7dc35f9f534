//! # Error Handling
//!
//! This module defines the two error families used by the service and how they
//! are converted to HTTP responses.
//!
//! ## Two layers of errors:
//! - **VoiceError**: raised by the voice core (codec, recognition, synthesis,
//!   call orchestration). Each variant tells the caller *what to do next*:
//!   drop a frame, reconnect, fall back, or fail the call.
//! - **AppError**: raised by HTTP handlers. Every `VoiceError` converts into an
//!   `AppError` so handlers can simply use `?`.
//!
//! ## Key Rust Concepts for Error Handling:
//!
//! ### thiserror
//! - **#[derive(Error)]**: generates `std::error::Error` + `Display` from the
//!   `#[error("...")]` attribute on each variant
//! - **Structured variants**: `ExhaustedRetry { attempts }` carries data that the
//!   caller can inspect instead of parsing strings
//!
//! ### Traits for Error Conversion
//! - **From trait**: Automatically converts between error types
//! - **ResponseError trait**: Converts errors to HTTP responses
//! - **Display trait**: Defines how errors are formatted as strings

use actix_web::{HttpResponse, ResponseError};  // Web framework error handling
use serde_json::json;                          // For creating JSON error responses
use std::fmt;                                  // For implementing Display trait

/// Errors raised by the voice pipeline.
///
/// ## Recovery rules:
/// - **Format**: the offending frame is logged and dropped, the call continues
/// - **Transport**: triggers the recognition reconnect protocol
/// - **Timeout**: the dialogue engine or synthesizer was too slow, speak the fallback
/// - **ExhaustedRetry**: the reconnect budget is spent, the call is failed over
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum VoiceError {
    /// Bytes could not be interpreted in the declared audio format
    #[error("audio format error: {0}")]
    Format(String),

    /// A remote recognition/synthesis channel rejected an operation
    #[error("transport error: {0}")]
    Transport(String),

    /// An awaited operation did not complete in time
    #[error("timed out waiting for {0}")]
    Timeout(String),

    /// Reconnect attempts are exhausted until an explicit reset
    #[error("recognition unavailable after {attempts} consecutive failures")]
    ExhaustedRetry { attempts: u32 },

    /// A reconnect was requested inside the cooldown window
    #[error("reconnect cooling down, {remaining_ms} ms remaining")]
    Cooldown { remaining_ms: u64 },

    /// Synthesis produced no audio after every attempt
    #[error("synthesis produced no audio after {attempts} attempts")]
    SynthesisUnavailable { attempts: u32 },

    /// The dialogue engine returned an error or an unusable reply
    #[error("dialogue engine error: {0}")]
    Dialogue(String),

    /// The surrounding call was torn down while the operation was running
    #[error("operation cancelled")]
    Cancelled,

    #[error("call not found: {0}")]
    CallNotFound(String),

    #[error("call already exists: {0}")]
    CallExists(String),

    #[error("maximum concurrent calls ({0}) reached")]
    CapacityReached(usize),

    #[error("call {0} has ended")]
    CallEnded(String),
}

/// Shorthand for results produced by the voice core.
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Custom error types for the HTTP layer.
///
/// ## Error Categories:
/// - **Internal**: Server-side problems (500 errors)
/// - **BadRequest**: Client sent invalid data (400 errors)
/// - **NotFound**: Requested resource doesn't exist (404 errors)
/// - **Conflict**: Resource already exists or is in the wrong state (409 errors)
/// - **Unavailable**: A capacity limit or upstream service refused the work (503 errors)
/// - **ConfigError**: Configuration problems (500 errors)
/// - **ValidationError**: Data validation failed (400 errors)
///
/// ## Usage Example:
/// ```rust
/// return Err(AppError::BadRequest("Invalid JSON".to_string()));
/// ```
#[derive(Debug)]
pub enum AppError {
    /// Internal server errors
    Internal(String),

    /// Client sent invalid or malformed data
    BadRequest(String),

    /// Requested resource was not found
    NotFound(String),

    /// Requested change conflicts with current state
    Conflict(String),

    /// Capacity exhausted or upstream service unavailable
    Unavailable(String),

    /// Configuration file or environment variable problems
    ConfigError(String),

    /// User input failed validation rules
    ValidationError(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::Conflict(msg) => write!(f, "Conflict: {}", msg),
            AppError::Unavailable(msg) => write!(f, "Service unavailable: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

/// Implementation of the ResponseError trait for AppError.
///
/// ## JSON Response Format:
/// All errors return JSON with a consistent structure:
/// ```json
/// {
///   "error": {
///     "type": "not_found",
///     "message": "call not found: call-42",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        use actix_web::http::StatusCode;

        let (status, error_type, message) = match self {
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.clone()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg.clone()),
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable", msg.clone()),
            AppError::ConfigError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error", msg.clone()),
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg.clone()),
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,           // Machine-readable error type
                "message": message,           // Human-readable error message
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

/// Map voice-core failures onto HTTP semantics.
///
/// ## Mapping:
/// - Format → 400, CallNotFound → 404
/// - CallExists / CallEnded → 409
/// - CapacityReached, Transport, Timeout, retry exhaustion → 503
/// - anything else → 500
impl From<VoiceError> for AppError {
    fn from(err: VoiceError) -> Self {
        let message = err.to_string();
        match err {
            VoiceError::Format(_) => AppError::BadRequest(message),
            VoiceError::CallNotFound(_) => AppError::NotFound(message),
            VoiceError::CallExists(_) | VoiceError::CallEnded(_) => AppError::Conflict(message),
            VoiceError::CapacityReached(_)
            | VoiceError::Transport(_)
            | VoiceError::Timeout(_)
            | VoiceError::ExhaustedRetry { .. }
            | VoiceError::Cooldown { .. }
            | VoiceError::SynthesisUnavailable { .. } => AppError::Unavailable(message),
            VoiceError::Dialogue(_) | VoiceError::Cancelled => AppError::Internal(message),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// JSON parsing errors are almost always the client's fault, so they map to 400.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

/// Inbound audio arrives base64-encoded in call events.
impl From<base64::DecodeError> for AppError {
    fn from(err: base64::DecodeError) -> Self {
        AppError::BadRequest(format!("Invalid base64 audio payload: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

/// Type alias for Results that use our HTTP error type.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::http::StatusCode;

    #[test]
    fn test_voice_error_status_mapping() {
        let cases = [
            (VoiceError::Format("odd length".into()), StatusCode::BAD_REQUEST),
            (VoiceError::CallNotFound("c1".into()), StatusCode::NOT_FOUND),
            (VoiceError::CallExists("c1".into()), StatusCode::CONFLICT),
            (VoiceError::CapacityReached(2), StatusCode::SERVICE_UNAVAILABLE),
            (VoiceError::ExhaustedRetry { attempts: 3 }, StatusCode::SERVICE_UNAVAILABLE),
            (VoiceError::Cancelled, StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (voice_error, expected) in cases {
            let app_error: AppError = voice_error.into();
            assert_eq!(app_error.error_response().status(), expected);
        }
    }

    #[test]
    fn test_voice_error_messages() {
        assert_eq!(
            VoiceError::Cooldown { remaining_ms: 1500 }.to_string(),
            "reconnect cooling down, 1500 ms remaining"
        );
        assert_eq!(
            VoiceError::ExhaustedRetry { attempts: 3 }.to_string(),
            "recognition unavailable after 3 consecutive failures"
        );
    }
}
