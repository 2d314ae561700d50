//! Error types for envelopes, QR payloads and wire messages.

use thiserror::Error;
use twinmesh_core::{CoreError, ValidationError};

/// Errors from sealing or opening envelopes.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("encryption error: {0}")]
    Encryption(String),

    /// Authentication tag mismatch, wrong key or tampered ciphertext.
    #[error("decryption failed")]
    Decryption,

    #[error("invalid signature")]
    InvalidSignature,

    #[error("payload expired at {expires_at} (now {now})")]
    Expired { expires_at: i64, now: i64 },

    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),

    #[error("key derivation error: {0}")]
    KeyDerivation(String),

    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),
}

/// Result type for envelope operations.
pub type Result<T> = std::result::Result<T, EnvelopeError>;
