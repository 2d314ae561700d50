//! Peer protocol message types.
//!
//! Routing fields travel in the clear. Everything about a profile or an
//! interest level is inside an encrypted, signed wire shape.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use twinmesh_core::{limits, TwinId};
use twinmesh_envelope::{DeltaWire, EncryptedEnvelope, SnapshotWire};

use crate::error::{Result, SyncError};

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Transport-level identifier of a peer in a room.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// A random peer id.
    pub fn random() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Plaintext of an interest or ack envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterestSignal {
    /// Repeated inside the ciphertext so an envelope cannot be replayed
    /// under another negotiation.
    pub negotiation_id: Uuid,
    /// In `[0, 100]`.
    pub interest_level: u8,
}

/// Peer protocol messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PeerMessage {
    /// Sent to a peer once it joins: the hello-level preview.
    Hello {
        protocol_version: u8,
        snapshot: SnapshotWire,
    },

    /// A local profile change, broadcast to the room.
    Delta(DeltaWire),

    /// Opens a negotiation.
    Interest {
        negotiation_id: Uuid,
        envelope: EncryptedEnvelope,
    },

    /// Answers an [`PeerMessage::Interest`].
    Ack {
        negotiation_id: Uuid,
        envelope: EncryptedEnvelope,
    },

    /// Ask the owner of `twin_id` for its full state.
    CatchUpRequest { twin_id: TwinId, have_version: u64 },

    /// Full-state reply to a [`PeerMessage::CatchUpRequest`].
    CatchUp(DeltaWire),
}

impl PeerMessage {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            PeerMessage::Hello { .. } => "hello",
            PeerMessage::Delta(_) => "delta",
            PeerMessage::Interest { .. } => "interest",
            PeerMessage::Ack { .. } => "ack",
            PeerMessage::CatchUpRequest { .. } => "catch_up_request",
            PeerMessage::CatchUp(_) => "catch_up",
        }
    }

    /// Reject oversized messages before any decryption.
    pub fn validate_limits(&self) -> Result<()> {
        match self {
            PeerMessage::Hello { snapshot, .. } => {
                check_twin_id(&snapshot.twin_id)?;
                check_len(snapshot.encrypted_preview.len())
            }
            PeerMessage::Delta(wire) | PeerMessage::CatchUp(wire) => {
                check_twin_id(&wire.twin_id)?;
                check_len(wire.encrypted_delta.len())
            }
            PeerMessage::Interest { envelope, .. } | PeerMessage::Ack { envelope, .. } => {
                check_len(envelope.ciphertext.len())
            }
            PeerMessage::CatchUpRequest { twin_id, .. } => check_twin_id(twin_id),
        }
    }
}

fn check_len(len: usize) -> Result<()> {
    if len > limits::MAX_CIPHERTEXT_LEN {
        return Err(SyncError::LimitExceeded("ciphertext"));
    }
    Ok(())
}

fn check_twin_id(twin_id: &TwinId) -> Result<()> {
    if twin_id.as_str().len() > limits::MAX_TEXT_LEN {
        return Err(SyncError::LimitExceeded("twin id"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use twinmesh_core::{Keypair, RoomId};
    use twinmesh_envelope::SessionKey;

    fn envelope(len: usize) -> EncryptedEnvelope {
        let key = SessionKey::for_room(&RoomId::from_bytes([2u8; 16]));
        let mut env = EncryptedEnvelope::seal(b"x", &key, &Keypair::generate()).unwrap();
        env.ciphertext = vec![0u8; len];
        env
    }

    #[test]
    fn test_limits_accept_normal_messages() {
        let msg = PeerMessage::Interest {
            negotiation_id: Uuid::new_v4(),
            envelope: envelope(64),
        };
        assert!(msg.validate_limits().is_ok());
        assert_eq!(msg.kind(), "interest");
    }

    #[test]
    fn test_limits_reject_oversized() {
        let msg = PeerMessage::Ack {
            negotiation_id: Uuid::new_v4(),
            envelope: envelope(limits::MAX_CIPHERTEXT_LEN + 1),
        };
        assert!(matches!(
            msg.validate_limits(),
            Err(SyncError::LimitExceeded("ciphertext"))
        ));

        let msg = PeerMessage::CatchUpRequest {
            twin_id: TwinId::new("t".repeat(limits::MAX_TEXT_LEN + 1)),
            have_version: 0,
        };
        assert!(msg.validate_limits().is_err());
    }

    #[test]
    fn test_peer_id_display() {
        let id = PeerId::new("peer-a");
        assert_eq!(id.to_string(), "peer-a");
        assert_eq!(format!("{:?}", id), "PeerId(peer-a)");
        assert_ne!(PeerId::random(), PeerId::random());
    }
}
