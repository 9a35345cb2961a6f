//! Error types for the Turnstile service.

use std::time::Duration;

use thiserror::Error;

/// Main error type for Turnstile operations.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Remote counter store errors
    #[error("Store error: {0}")]
    Store(#[from] redis::RedisError),

    /// The remote counter store did not answer in time
    #[error("Store call timed out after {0:?}")]
    StoreTimeout(Duration),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<::config::ConfigError> for TurnstileError {
    fn from(err: ::config::ConfigError) -> Self {
        TurnstileError::Config(err.to_string())
    }
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
