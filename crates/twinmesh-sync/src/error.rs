//! Error types for the sync module.

use thiserror::Error;

use twinmesh_core::ValidationError;
use twinmesh_envelope::EnvelopeError;

/// Errors that can occur during peer sync and negotiation.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Protocol version mismatch with peer.
    #[error("protocol version mismatch: local={local}, peer={peer}")]
    VersionMismatch { local: u8, peer: u8 },

    /// Message failed a structural check.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// A message field is over its size limit.
    #[error("message limit exceeded: {0}")]
    LimitExceeded(&'static str),

    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(String),

    /// Decryption, signature or decoding failure on a wire shape.
    #[error("envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    /// Delta validation failed.
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// A message was signed by a key other than the one pinned for the peer.
    #[error("signer mismatch for peer {0}")]
    SignerMismatch(String),

    /// Peer is not connected.
    #[error("peer not connected: {0}")]
    PeerNotConnected(String),

    /// The negotiator was shut down.
    #[error("sync cancelled")]
    Cancelled,
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
