//! Error types for twinmesh core.

use thiserror::Error;

use crate::types::TwinId;

/// Core errors from encoding and key handling.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("encoding error: {0}")]
    EncodingError(String),

    #[error("decoding error: {0}")]
    DecodingError(String),
}

/// Structural rejections of a delta against a twin state.
///
/// A delta that fails validation is never partially applied.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("twin mismatch: expected {expected}, got {got}")]
    TwinMismatch { expected: TwinId, got: TwinId },

    #[error("base version mismatch: expected {expected}, got {got}")]
    VersionMismatch { expected: u64, got: u64 },

    #[error("delta has no changes")]
    EmptyDelta,

    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
