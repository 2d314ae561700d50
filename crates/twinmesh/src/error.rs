//! Error types for the node facade.

use thiserror::Error;

use twinmesh_core::{CoreError, ValidationError};
use twinmesh_envelope::EnvelopeError;
use twinmesh_match::MatchError;
use twinmesh_store::StoreError;
use twinmesh_sync::SyncError;

/// Errors that can occur during node operations.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// Validation error.
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Sync error.
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("matching error: {0}")]
    Match(#[from] MatchError),

    #[error("invalid config: {0}")]
    Config(String),

    /// The vault holds no identity yet.
    #[error("no identity in vault")]
    NoIdentity,

    /// `create` on a vault that already holds an identity.
    #[error("vault already holds an identity")]
    VaultExists,

    #[error("wrong passphrase")]
    WrongPassphrase,

    /// Scanned QR payload was malformed, expired or badly signed.
    #[error("invalid QR payload")]
    InvalidQr,

    #[error("QR payload is for room {0}")]
    RoomMismatch(String),

    #[error("background task failed: {0}")]
    Task(String),
}

/// Result type for node operations.
pub type Result<T> = std::result::Result<T, NodeError>;
