//! Error types for matching.

use thiserror::Error;

/// Errors from the matching layer.
#[derive(Debug, Error)]
pub enum MatchError {
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),

    /// The remote provider failed or answered with unusable results.
    #[error("provider error: {0}")]
    Provider(String),
}

/// Result type for matching operations.
pub type Result<T> = std::result::Result<T, MatchError>;
