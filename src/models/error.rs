//! Error types for tracedistill.
//!
//! Epistemic taxonomy:
//! - B_i falsified: Expected failures (missing corpus, invalid input)
//! - I^B materialized: Infrastructure failures (network, timeout, dropped stream)
//! - K_i violated: Internal invariant violations (bugs)
//!
//! Per-record failures never surface here as errors: a bad format or a wrong
//! answer is a discard reason on the trace, not an `Err`.

use std::time::Duration;
use thiserror::Error;

/// Top-level error type for tracedistill.
#[derive(Debug, Error)]
pub enum DistillError {
    // ═══════════════════════════════════════════════════════════════════
    // B_i FALSIFIED — Belief proven wrong (expected failures)
    // ═══════════════════════════════════════════════════════════════════

    #[error("Configuration error: {0}")]
    Config(#[from] super::ConfigError),

    #[error("Dataset unavailable: corpus '{corpus}', split '{split}': {reason}")]
    DataUnavailable {
        corpus: String,
        split: String,
        reason: String,
    },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    // ═══════════════════════════════════════════════════════════════════
    // I^B MATERIALIZED — Bounded ignorance became known-bad
    // ═══════════════════════════════════════════════════════════════════

    #[error("Endpoint error: {0}")]
    Api(#[from] ApiError),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Request timeout after {0:?}")]
    Timeout(Duration),

    #[error("Rate limited: retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: f64 },

    #[error("Stream transport failure: {0}")]
    StreamTransport(String),

    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // ═══════════════════════════════════════════════════════════════════
    // K_i VIOLATED — Invariant broken (bug, should not happen)
    // ═══════════════════════════════════════════════════════════════════

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors reported by the inference endpoint itself.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Authentication failed: invalid API key")]
    AuthenticationFailed,

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("API error (status {status}): {message}")]
    Status { status: u16, message: String },

    #[error("Request failed after {attempts} attempts: {last_error}")]
    MaxRetriesExceeded { attempts: u32, last_error: String },
}

impl DistillError {
    /// Create an IO error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Check if this error is worth another attempt at opening a stream.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::RateLimited { .. } | Self::Network(_) => true,
            Self::Api(ApiError::Status { status, .. }) => *status >= 500,
            _ => false,
        }
    }
}

/// Result type alias for tracedistill.
pub type Result<T> = std::result::Result<T, DistillError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(DistillError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(DistillError::RateLimited { retry_after_secs: 2.0 }.is_retryable());
        assert!(DistillError::Api(ApiError::Status {
            status: 503,
            message: "overloaded".to_string(),
        })
        .is_retryable());
        assert!(!DistillError::Api(ApiError::AuthenticationFailed).is_retryable());
        assert!(!DistillError::Api(ApiError::Status {
            status: 400,
            message: "bad request".to_string(),
        })
        .is_retryable());
    }
}
