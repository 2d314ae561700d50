//! Wire shapes for twin snapshots and deltas.
//!
//! Both carry their routing fields in the clear (twin id, versions) and the
//! profile data encrypted under the room session key. The signature binds
//! the clear fields to the ciphertext.

use ciborium::value::Value;
use serde::{Deserialize, Serialize};

use twinmesh_core::canonical::{self, bytes_vec, signing_bytes};
use twinmesh_core::{
    limits, Digest, Keypair, PublicKey, Signature, TwinDelta, TwinId, TwinProfile, TwinState,
};

use crate::crypto::{Iv, SessionKey};
use crate::error::{EnvelopeError, Result};

const SNAPSHOT_DOMAIN: &str = "twinmesh-v1-snapshot";
const DELTA_DOMAIN: &str = "twinmesh-v1-delta";

fn check_twin_id(twin_id: &TwinId) -> Result<()> {
    if twin_id.as_str().len() > limits::MAX_TEXT_LEN {
        return Err(EnvelopeError::LimitExceeded("twin id"));
    }
    Ok(())
}

fn check_ciphertext(ciphertext: &[u8]) -> Result<()> {
    if ciphertext.len() > limits::MAX_CIPHERTEXT_LEN {
        return Err(EnvelopeError::LimitExceeded("ciphertext"));
    }
    Ok(())
}

/// The hello-level view of a twin: encrypted name and headline plus the
/// embedding hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotWire {
    pub twin_id: TwinId,
    pub embedding_hash: Option<Digest>,
    pub signature: Signature,
    pub public_key: PublicKey,
    #[serde(with = "bytes_vec")]
    pub encrypted_preview: Vec<u8>,
    pub preview_iv: Iv,
    pub version: u64,
}

impl SnapshotWire {
    /// Seal the preview of `state`. Skills, interests and the raw embedding
    /// are not included.
    pub fn seal(state: &TwinState, key: &SessionKey, identity: &Keypair) -> Result<Self> {
        let plaintext = canonical::encode(&state.profile.preview())?;
        let sealed = key.encrypt(&plaintext)?;
        let mut wire = Self {
            twin_id: state.twin_id.clone(),
            embedding_hash: state.profile.embedding_hash(),
            signature: Signature::from_bytes([0u8; 64]),
            public_key: identity.public_key(),
            encrypted_preview: sealed.ciphertext,
            preview_iv: sealed.iv,
            version: state.version,
        };
        wire.signature = identity.sign(&wire.signed_message());
        Ok(wire)
    }

    pub fn verify(&self) -> bool {
        self.public_key.verify(&self.signed_message(), &self.signature)
    }

    /// Check limits and signature, then decrypt the preview.
    pub fn open(&self, key: &SessionKey) -> Result<TwinProfile> {
        check_twin_id(&self.twin_id)?;
        check_ciphertext(&self.encrypted_preview)?;
        if !self.verify() {
            return Err(EnvelopeError::InvalidSignature);
        }
        let plaintext = key.decrypt(&self.encrypted_preview, &self.preview_iv)?;
        let profile: TwinProfile = canonical::decode(&plaintext)?;
        // A hello never discloses more than the preview, whatever was sent.
        let preview = profile.preview();
        preview.check_limits()?;
        Ok(preview)
    }

    fn signed_message(&self) -> Vec<u8> {
        let embedding_hash = match &self.embedding_hash {
            Some(h) => Value::Bytes(h.as_bytes().to_vec()),
            None => Value::Null,
        };
        signing_bytes(
            SNAPSHOT_DOMAIN,
            vec![
                Value::Text(self.twin_id.as_str().to_string()),
                embedding_hash,
                Value::Bytes(self.public_key.as_bytes().to_vec()),
                Value::Bytes(self.preview_iv.as_bytes().to_vec()),
                Value::Bytes(self.encrypted_preview.clone()),
                Value::Integer(self.version.into()),
            ],
        )
    }
}

/// An encrypted, signed delta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaWire {
    pub twin_id: TwinId,
    pub base_version: u64,
    pub target_version: u64,
    #[serde(with = "bytes_vec")]
    pub encrypted_delta: Vec<u8>,
    pub delta_iv: Iv,
    pub signature: Signature,
    pub public_key: PublicKey,
    pub timestamp: i64,
}

impl DeltaWire {
    /// Seal an ordinary delta, targeting `base_version + 1`.
    pub fn seal(delta: &TwinDelta, key: &SessionKey, identity: &Keypair) -> Result<Self> {
        Self::seal_with_target(delta, delta.target_version(), key, identity)
    }

    /// Seal a delta with an explicit target version, as catch-up replies do.
    pub fn seal_with_target(
        delta: &TwinDelta,
        target_version: u64,
        key: &SessionKey,
        identity: &Keypair,
    ) -> Result<Self> {
        let plaintext = canonical::encode(delta)?;
        let sealed = key.encrypt(&plaintext)?;
        let mut wire = Self {
            twin_id: delta.twin_id.clone(),
            base_version: delta.base_version,
            target_version,
            encrypted_delta: sealed.ciphertext,
            delta_iv: sealed.iv,
            signature: Signature::from_bytes([0u8; 64]),
            public_key: identity.public_key(),
            timestamp: delta.timestamp,
        };
        wire.signature = identity.sign(&wire.signed_message());
        Ok(wire)
    }

    /// `"{twin_id}:{base_version}:{timestamp}"`.
    pub fn transport_key(&self) -> String {
        format!("{}:{}:{}", self.twin_id, self.base_version, self.timestamp)
    }

    pub fn verify(&self) -> bool {
        self.public_key.verify(&self.signed_message(), &self.signature)
    }

    /// Check limits and signature, decrypt, and confirm the inner delta
    /// agrees with the clear routing fields.
    pub fn open(&self, key: &SessionKey) -> Result<TwinDelta> {
        check_twin_id(&self.twin_id)?;
        check_ciphertext(&self.encrypted_delta)?;
        if !self.verify() {
            return Err(EnvelopeError::InvalidSignature);
        }
        let plaintext = key.decrypt(&self.encrypted_delta, &self.delta_iv)?;
        let delta: TwinDelta = canonical::decode(&plaintext)?;

        if delta.twin_id != self.twin_id
            || delta.base_version != self.base_version
            || delta.timestamp != self.timestamp
        {
            return Err(EnvelopeError::Malformed(
                "delta does not match its routing fields".into(),
            ));
        }
        if self.target_version < self.base_version {
            return Err(EnvelopeError::Malformed("target version behind base".into()));
        }
        delta.check_limits()?;
        Ok(delta)
    }

    fn signed_message(&self) -> Vec<u8> {
        signing_bytes(
            DELTA_DOMAIN,
            vec![
                Value::Text(self.twin_id.as_str().to_string()),
                Value::Integer(self.base_version.into()),
                Value::Integer(self.target_version.into()),
                Value::Bytes(self.delta_iv.as_bytes().to_vec()),
                Value::Bytes(self.encrypted_delta.clone()),
                Value::Bytes(self.public_key.as_bytes().to_vec()),
                Value::Integer(self.timestamp.into()),
            ],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use twinmesh_core::{compute_delta_at, RoomId};

    fn key() -> SessionKey {
        SessionKey::for_room(&RoomId::from_bytes([1u8; 16]))
    }

    fn state() -> TwinState {
        TwinState::new(
            TwinId::new("twin-a"),
            TwinProfile::new("Ada", "Engineer")
                .with_skills(["Rust"])
                .with_interests(["AI"])
                .with_embedding(vec![0.1, 0.2, 0.3]),
            1_000,
        )
    }

    #[test]
    fn test_snapshot_discloses_preview_only() {
        let identity = Keypair::generate();
        let wire = SnapshotWire::seal(&state(), &key(), &identity).unwrap();

        assert_eq!(wire.embedding_hash, state().profile.embedding_hash());
        let preview = wire.open(&key()).unwrap();
        assert_eq!(preview, TwinProfile::new("Ada", "Engineer"));
    }

    #[test]
    fn test_snapshot_version_tamper_rejected() {
        let identity = Keypair::generate();
        let mut wire = SnapshotWire::seal(&state(), &key(), &identity).unwrap();
        wire.version = 99;
        assert!(matches!(wire.open(&key()), Err(EnvelopeError::InvalidSignature)));
    }

    #[test]
    fn test_delta_wire_roundtrip() {
        let identity = Keypair::generate();
        let prev = state();
        let next = prev.with_profile(prev.profile.clone().with_skills(["Rust", "Go"]));
        let delta = compute_delta_at(&prev, &next, 2_000).unwrap();

        let wire = DeltaWire::seal(&delta, &key(), &identity).unwrap();
        assert_eq!(wire.base_version, 0);
        assert_eq!(wire.target_version, 1);
        assert_eq!(wire.transport_key(), "twin-a:0:2000");
        assert_eq!(wire.open(&key()).unwrap(), delta);
    }

    #[test]
    fn test_delta_wire_routing_tamper_rejected() {
        let identity = Keypair::generate();
        let prev = state();
        let next = prev.with_profile(prev.profile.clone().with_skills(["Go"]));
        let delta = compute_delta_at(&prev, &next, 2_000).unwrap();

        let mut wire = DeltaWire::seal(&delta, &key(), &identity).unwrap();
        wire.base_version = 5;
        assert!(matches!(wire.open(&key()), Err(EnvelopeError::InvalidSignature)));
    }

    #[test]
    fn test_delta_wire_oversized_rejected() {
        let identity = Keypair::generate();
        let prev = state();
        let next = prev.with_profile(prev.profile.clone().with_skills(["Go"]));
        let delta = compute_delta_at(&prev, &next, 2_000).unwrap();

        let mut wire = DeltaWire::seal(&delta, &key(), &identity).unwrap();
        wire.encrypted_delta = vec![0u8; limits::MAX_CIPHERTEXT_LEN + 1];
        assert!(matches!(wire.open(&key()), Err(EnvelopeError::LimitExceeded(_))));
    }
}
