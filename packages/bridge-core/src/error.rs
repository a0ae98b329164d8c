//! Centralized error types for the media bridge core library.
//!
//! This module provides a unified error handling system that:
//! - Defines structured error types using `thiserror`
//! - Maps errors to appropriate HTTP status codes
//! - Implements `IntoResponse` for automatic JSON error responses where an
//!   error genuinely crosses an HTTP boundary (the `/status` endpoint).
//!
//! The seven kinds below correspond 1:1 to the error handling design: kinds
//! `Transport`/`Timeout` propagate out of a call's tasks to end the call,
//! `Protocol`/`CommitEmpty`/`ResourceOverflow` are handled locally (drop and
//! count, or adapt and continue) and never unwind, `FormatMismatch` triggers
//! a local resampler reconfiguration, and `Configuration` is fatal at
//! startup only.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Trait for error types that provide machine-readable error codes.
pub trait ErrorCode {
    /// Returns a machine-readable error code for API responses.
    fn code(&self) -> &'static str;
}

/// Application-wide error type for the media bridge.
#[derive(Debug, Error, Serialize, Clone)]
#[serde(tag = "type", content = "details")]
pub enum BridgeError {
    /// Websocket read/write failure on either leg. Ends the call.
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed frame from either peer. Dropped, never crashes the socket.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The speech service rejected a commit as empty.
    #[error("commit rejected as empty: {0}")]
    CommitEmpty(String),

    /// The speech service reported an unexpected or missing sample rate.
    #[error("audio format mismatch: {0}")]
    FormatMismatch(String),

    /// A bounded queue overflowed and dropped frames.
    #[error("resource overflow: {0}")]
    ResourceOverflow(String),

    /// Ack watchdog, call wall-clock, or idle timeout fired.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Missing or invalid configuration at startup. Fatal.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Catch-all for invariant violations that are bugs, not expected conditions.
    #[error("internal error: {0}")]
    Internal(String),
}

impl BridgeError {
    /// Returns a machine-readable error code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport_error",
            Self::Protocol(_) => "protocol_error",
            Self::CommitEmpty(_) => "commit_empty",
            Self::FormatMismatch(_) => "format_mismatch",
            Self::ResourceOverflow(_) => "resource_overflow",
            Self::Timeout(_) => "timeout",
            Self::Configuration(_) => "configuration_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Maps the error to an appropriate HTTP status code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Configuration(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Transport(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl ErrorCode for BridgeError {
    fn code(&self) -> &'static str {
        BridgeError::code(self)
    }
}

/// Convenient Result alias for application-wide operations.
pub type BridgeResult<T> = Result<T, BridgeError>;

/// JSON response body for error responses.
#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
    status: u16,
}

impl IntoResponse for BridgeError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: self.code(),
            message: self.to_string(),
            status: status.as_u16(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_error_is_service_unavailable() {
        let err = BridgeError::Configuration("missing SPEECH_SERVICE_ENDPOINT".into());
        assert_eq!(err.code(), "configuration_error");
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn timeout_error_is_gateway_timeout() {
        let err = BridgeError::Timeout("commit ack watchdog expired".into());
        assert_eq!(err.code(), "timeout");
        assert_eq!(err.status_code(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn commit_empty_is_internal_not_fatal_kind() {
        let err = BridgeError::CommitEmpty("input_audio_buffer_commit_empty".into());
        assert_eq!(err.code(), "commit_empty");
    }
}
