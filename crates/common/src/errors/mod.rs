//! Error types for LexForge services
//!
//! Provides a comprehensive error handling system with:
//! - Distinct error types for routing, retrieval, generation and caching failures
//! - HTTP status code mapping
//! - Structured error responses
//! - Error codes for client handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

/// Error codes for machine-readable error identification
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Validation errors (1xxx)
    ValidationError,
    EmptyQuery,
    InvalidRating,

    // Rate limiting (6xxx)
    RateLimited,

    // Database errors (7xxx)
    DatabaseError,
    ConnectionError,

    // External service errors (8xxx)
    UpstreamError,
    RoutingError,
    RetrievalUnavailable,
    EmbeddingError,
    RerankError,
    GenerationError,
    GenerationExhausted,
    CircuitBreakerOpen,
    Timeout,
    CacheComputeError,
    CacheError,

    // Internal errors (9xxx)
    InternalError,
    ConfigurationError,
    SerializationError,

    // Service unavailable
    ServiceUnavailable,
}

impl ErrorCode {
    /// Get the numeric code for this error
    pub fn as_code(&self) -> u16 {
        match self {
            // Validation (1xxx)
            ErrorCode::ValidationError => 1001,
            ErrorCode::EmptyQuery => 1002,
            ErrorCode::InvalidRating => 1003,

            // Rate limits (6xxx)
            ErrorCode::RateLimited => 6001,

            // Database (7xxx)
            ErrorCode::DatabaseError => 7001,
            ErrorCode::ConnectionError => 7002,

            // External (8xxx)
            ErrorCode::UpstreamError => 8001,
            ErrorCode::RoutingError => 8002,
            ErrorCode::RetrievalUnavailable => 8003,
            ErrorCode::EmbeddingError => 8004,
            ErrorCode::RerankError => 8005,
            ErrorCode::GenerationError => 8006,
            ErrorCode::GenerationExhausted => 8007,
            ErrorCode::CircuitBreakerOpen => 8008,
            ErrorCode::Timeout => 8009,
            ErrorCode::CacheComputeError => 8010,
            ErrorCode::CacheError => 8011,

            // Internal (9xxx)
            ErrorCode::InternalError => 9001,
            ErrorCode::ConfigurationError => 9002,
            ErrorCode::SerializationError => 9003,

            ErrorCode::ServiceUnavailable => 9999,
        }
    }
}

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    // Validation errors
    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        field: Option<String>
    },

    #[error("Query text must not be empty")]
    EmptyQuery,

    #[error("Rating must be between 1 and 5, got {rating}")]
    InvalidRating { rating: u8 },

    // Rate limiting
    #[error("Rate limit exceeded: {limit} requests per second")]
    RateLimited { limit: u32 },

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("Database connection error: {message}")]
    DatabaseConnection { message: String },

    // External service errors
    #[error("Query routing failed: {message}")]
    Routing { message: String },

    #[error("Document index unavailable: {message}")]
    RetrievalUnavailable { message: String },

    #[error("Embedding service error: {message}")]
    EmbeddingError { message: String },

    #[error("Rerank service error: {message}")]
    Rerank { message: String },

    #[error("Generation provider '{provider}' failed: {message}")]
    Generation { provider: String, message: String, retryable: bool },

    #[error("All generation providers exhausted after {attempts} attempts: {last_error}")]
    GenerationExhausted { attempts: usize, last_error: String },

    #[error("Circuit breaker open for service: {service}")]
    CircuitBreakerOpen { service: String },

    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Computation for cache key {key} failed: {source}")]
    CacheCompute {
        key: String,
        #[source]
        source: Arc<AppError>,
    },

    #[error("Cache error: {message}")]
    CacheError { message: String },

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    // Internal errors
    #[error("Internal server error: {message}")]
    Internal { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Service unavailable: {message}")]
    ServiceUnavailable { message: String },

    // Generic
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl AppError {
    /// Build a timeout error for the named operation
    pub fn timeout(operation: impl Into<String>, timeout: std::time::Duration) -> Self {
        AppError::Timeout {
            operation: operation.into(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    /// Get the error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            AppError::Validation { .. } => ErrorCode::ValidationError,
            AppError::EmptyQuery => ErrorCode::EmptyQuery,
            AppError::InvalidRating { .. } => ErrorCode::InvalidRating,
            AppError::RateLimited { .. } => ErrorCode::RateLimited,
            AppError::Database(_) => ErrorCode::DatabaseError,
            AppError::DatabaseConnection { .. } => ErrorCode::ConnectionError,
            AppError::Routing { .. } => ErrorCode::RoutingError,
            AppError::RetrievalUnavailable { .. } => ErrorCode::RetrievalUnavailable,
            AppError::EmbeddingError { .. } => ErrorCode::EmbeddingError,
            AppError::Rerank { .. } => ErrorCode::RerankError,
            AppError::Generation { .. } => ErrorCode::GenerationError,
            AppError::GenerationExhausted { .. } => ErrorCode::GenerationExhausted,
            AppError::CircuitBreakerOpen { .. } => ErrorCode::CircuitBreakerOpen,
            AppError::Timeout { .. } => ErrorCode::Timeout,
            AppError::CacheCompute { .. } => ErrorCode::CacheComputeError,
            AppError::CacheError { .. } => ErrorCode::CacheError,
            AppError::HttpClient(_) => ErrorCode::UpstreamError,
            AppError::Internal { .. } => ErrorCode::InternalError,
            AppError::Configuration { .. } => ErrorCode::ConfigurationError,
            AppError::Serialization(_) => ErrorCode::SerializationError,
            AppError::ServiceUnavailable { .. } => ErrorCode::ServiceUnavailable,
            AppError::Other(_) => ErrorCode::InternalError,
        }
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            AppError::Validation { .. } |
            AppError::EmptyQuery |
            AppError::InvalidRating { .. } => StatusCode::BAD_REQUEST,

            // 429 Too Many Requests
            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,

            // Waiters see the status of the failure they shared
            AppError::CacheCompute { source, .. } => source.status_code(),

            // 500 Internal Server Error
            AppError::Database(_) |
            AppError::DatabaseConnection { .. } |
            AppError::Internal { .. } |
            AppError::Configuration { .. } |
            AppError::Serialization(_) |
            AppError::CacheError { .. } |
            AppError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,

            // 502 Bad Gateway
            AppError::Routing { .. } |
            AppError::EmbeddingError { .. } |
            AppError::Rerank { .. } |
            AppError::Generation { .. } |
            AppError::GenerationExhausted { .. } |
            AppError::HttpClient(_) => StatusCode::BAD_GATEWAY,

            // 503 Service Unavailable
            AppError::RetrievalUnavailable { .. } |
            AppError::CircuitBreakerOpen { .. } |
            AppError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,

            // 504 Gateway Timeout
            AppError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Whether retrying the same call against the same upstream may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            AppError::Generation { retryable, .. } => *retryable,
            AppError::Timeout { .. } |
            AppError::HttpClient(_) |
            AppError::ServiceUnavailable { .. } => true,
            AppError::CacheCompute { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    /// Check if this error should be logged at error level
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }

    /// Check if this error is a client error
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }
}

/// Structured error response for API
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetails,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl From<&AppError> for ErrorResponse {
    fn from(err: &AppError) -> Self {
        let details = match err {
            AppError::Validation { field: Some(field), .. } => {
                Some(serde_json::json!({ "field": field }))
            }
            _ => None,
        };

        ErrorResponse {
            error: ErrorDetails {
                code: err.code(),
                message: err.to_string(),
                details,
                request_id: None,
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.code();

        // Log based on severity
        if self.is_server_error() {
            tracing::error!(
                error = %self,
                code = ?code,
                status = status.as_u16(),
                "Server error"
            );
        } else if self.is_client_error() {
            tracing::warn!(
                error = %self,
                code = ?code,
                status = status.as_u16(),
                "Client error"
            );
        }

        (status, Json(ErrorResponse::from(&self))).into_response()
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Internal {
            message: err.to_string()
        }
    }
}

impl From<redis::RedisError> for AppError {
    fn from(err: redis::RedisError) -> Self {
        AppError::CacheError {
            message: err.to_string()
        }
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Configuration {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_mapping() {
        let err = AppError::EmptyQuery;
        assert_eq!(err.code(), ErrorCode::EmptyQuery);
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert!(err.is_client_error());
    }

    #[test]
    fn test_exhausted_generation_is_server_error() {
        let err = AppError::GenerationExhausted {
            attempts: 2,
            last_error: "connection refused".into(),
        };
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
        assert!(err.is_server_error());
        assert_eq!(err.code().as_code(), 8007);
    }

    #[test]
    fn test_cache_compute_inherits_status() {
        let inner = Arc::new(AppError::timeout("generation", std::time::Duration::from_millis(250)));
        let err = AppError::CacheCompute {
            key: "abc".into(),
            source: inner,
        };
        assert_eq!(err.status_code(), StatusCode::GATEWAY_TIMEOUT);
        assert!(err.is_transient());
        assert!(err.to_string().contains("250ms"));
    }

    #[test]
    fn test_validation_details() {
        let err = AppError::Validation {
            message: "too long".into(),
            field: Some("query".into()),
        };
        let body = ErrorResponse::from(&err);
        assert_eq!(body.error.code, ErrorCode::ValidationError);
        assert_eq!(body.error.details.unwrap()["field"], "query");
    }
}
