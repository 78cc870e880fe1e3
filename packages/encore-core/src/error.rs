//! Centralized error types for the Encore core library.
//!
//! This module provides a unified error handling system that:
//! - Defines structured error types using `thiserror`
//! - Maps errors to appropriate HTTP status codes
//! - Implements `IntoResponse` for automatic JSON error responses
//!
//! Broker failures are absent here: they live in
//! [`BrokerError`](crate::broker::BrokerError) and are only logged or retried,
//! never rendered to an HTTP client.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use crate::broker::consumer::HistoryError;
use crate::catalog::CatalogError;
use crate::source::SourceError;

/// Trait for error types that provide machine-readable error codes.
pub trait ErrorCode {
    /// Returns a machine-readable error code for API responses.
    fn code(&self) -> &'static str;
}

impl ErrorCode for SourceError {
    fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "audio_not_found",
            Self::Io(_) => "audio_io_error",
            Self::Http(_) => "object_storage_error",
            Self::Unsupported(_) => "unsupported_source",
        }
    }
}

impl ErrorCode for CatalogError {
    fn code(&self) -> &'static str {
        match self {
            Self::SongNotFound(_) => "song_not_found",
            Self::Manifest(_) => "catalog_manifest_error",
        }
    }
}

/// Application-wide error type for HTTP-facing operations.
#[derive(Debug, Error)]
pub enum EncoreError {
    /// Missing or invalid authenticated principal.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Unknown song, or the song's audio bytes are missing.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Missing or invalid request parameters (e.g. song identifier).
    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// Requested range starts beyond the resource or is inverted.
    #[error("Range not satisfiable for resource of {size} bytes")]
    RangeNotSatisfiable { size: i64 },

    /// Internal server error (I/O failures opening a source and similar).
    #[error("Internal error: {0}")]
    Internal(String),

    /// Server configuration error (missing required settings).
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl EncoreError {
    /// Returns a machine-readable error code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "unauthorized",
            Self::NotFound(_) => "not_found",
            Self::BadRequest(_) => "invalid_request",
            Self::RangeNotSatisfiable { .. } => "range_not_satisfiable",
            Self::Internal(_) => "internal_error",
            Self::Configuration(_) => "configuration_error",
        }
    }

    /// Maps the error to an appropriate HTTP status code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::RangeNotSatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            Self::Configuration(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Convenient Result alias for HTTP-facing operations.
pub type EncoreResult<T> = Result<T, EncoreError>;

/// JSON response body for error responses.
#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
    status: u16,
}

impl IntoResponse for EncoreError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let unsatisfied_size = match &self {
            Self::RangeNotSatisfiable { size } => Some(*size),
            _ => None,
        };
        let body = ErrorResponse {
            error: self.code(),
            message: self.to_string(),
            status: status.as_u16(),
        };
        let mut response = (status, Json(body)).into_response();

        // RFC 9110: a 416 carries the current length as `bytes */<size>`
        if let Some(size) = unsatisfied_size {
            if let Ok(value) = HeaderValue::from_str(&format!("bytes */{}", size)) {
                response.headers_mut().insert(header::CONTENT_RANGE, value);
            }
        }
        response
    }
}

impl From<SourceError> for EncoreError {
    fn from(err: SourceError) -> Self {
        match err {
            SourceError::NotFound(_) => Self::NotFound(err.to_string()),
            SourceError::Unsupported(_) => Self::Configuration(err.to_string()),
            _ => Self::Internal(err.to_string()),
        }
    }
}

impl From<CatalogError> for EncoreError {
    fn from(err: CatalogError) -> Self {
        match err {
            CatalogError::SongNotFound(_) => Self::NotFound(err.to_string()),
            CatalogError::Manifest(_) => Self::Internal(err.to_string()),
        }
    }
}

impl From<HistoryError> for EncoreError {
    fn from(err: HistoryError) -> Self {
        Self::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_not_satisfiable_sets_content_range() {
        let response = EncoreError::RangeNotSatisfiable { size: 100 }.into_response();
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(
            response.headers().get(header::CONTENT_RANGE).unwrap(),
            "bytes */100"
        );
    }

    #[test]
    fn missing_audio_maps_to_not_found() {
        let err: EncoreError = SourceError::NotFound("songs/1.mp3".into()).into();
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(err.code(), "not_found");
    }

    #[test]
    fn source_io_failure_maps_to_internal() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: EncoreError = SourceError::Io(io).into();
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn unknown_song_maps_to_not_found() {
        let err: EncoreError = CatalogError::SongNotFound(42).into();
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(CatalogError::SongNotFound(42).code(), "song_not_found");
    }

    #[test]
    fn history_failure_maps_to_internal() {
        let err: EncoreError = HistoryError::Unavailable("journal locked".into()).into();
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.code(), "internal_error");
    }

    #[test]
    fn unauthorized_returns_401() {
        let err = EncoreError::Unauthorized("missing token".into());
        assert_eq!(err.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(err.code(), "unauthorized");
    }
}
