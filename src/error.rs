//! Error types for forkpool.
//!
//! Only misuse of the API and failures of the pool's own plumbing are errors.
//! A task that fails inside its worker is reported as data, see
//! [`FailureRecord`](crate::FailureRecord).

use thiserror::Error;

/// Main error type for forkpool.
#[derive(Error, Debug)]
pub enum ForkPoolError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Failed to enqueue task: {0}")]
    Enqueue(String),

    #[error("fork() failed: {0}")]
    Fork(#[source] nix::Error),

    #[error("Signal setup failed: {0}")]
    Signal(#[source] nix::Error),

    #[error("Process error: {0}")]
    Process(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ForkPoolError {
    /// Shorthand for an [`ForkPoolError::InvalidArgument`].
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// Whether this error was caused by the caller passing a bad argument.
    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, Self::InvalidArgument(_))
    }
}

/// Result type alias for forkpool operations.
pub type Result<T> = std::result::Result<T, ForkPoolError>;
