//! Error types for Turnstile.

use thiserror::Error;

/// Main error type for Turnstile operations.
///
/// Exceeding a rate limit is not an error: it is reported as a denied
/// [`Decision`](crate::ratelimit::Decision).
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// The counting/blocking backend is unreachable, closed, or answered
    /// with something we could not interpret.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Limits that can never be satisfied, rejected when the limiter is built.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The caller's deadline passed or it cancelled the operation.
    #[error("Context cancelled: {0}")]
    ContextCancelled(&'static str),

    /// Configuration file or environment parsing errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
