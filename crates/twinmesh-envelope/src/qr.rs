//! QR session bootstrap payload.
//!
//! A QR code carries only what a scanning device needs to join the room and
//! pin the presenter's identity: the embedding hash, the presenter's public
//! key, the room capability and a validity window. Raw profile fields are
//! never included.
//!
//! Encoding: base64url (no padding) of `MAGIC || VERSION || CBOR`.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use ciborium::value::Value;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use twinmesh_core::canonical::{self, signing_bytes};
use twinmesh_core::{Digest, Keypair, PublicKey, RoomId, Signature};

use crate::error::{EnvelopeError, Result};

const QR_MAGIC: &[u8; 2] = b"TM";
const QR_VERSION: u8 = 1;
const QR_DOMAIN: &str = "twinmesh-v1-qr";

/// Longest string [`QrPayload::deserialize`] will look at.
pub const MAX_QR_LEN: usize = 1024;

/// How long a QR payload stays valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QrConfig {
    /// Time to live in milliseconds.
    pub ttl_ms: u64,
}

impl Default for QrConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 30 * 60 * 1000,
        }
    }
}

impl QrConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

/// The signed bootstrap payload shown as a QR code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QrPayload {
    pub embedding_hash: Digest,
    pub signature: Signature,
    pub public_key: PublicKey,
    pub room_id: RoomId,
    /// Unix milliseconds.
    pub issued_at: i64,
    /// Unix milliseconds.
    pub expires_at: i64,
}

impl QrPayload {
    /// Create a payload valid for the default TTL.
    pub fn create(identity: &Keypair, embedding_hash: Digest, room_id: RoomId, now: i64) -> Self {
        Self::create_with_ttl(identity, embedding_hash, room_id, now, QrConfig::default().ttl())
    }

    pub fn create_with_ttl(
        identity: &Keypair,
        embedding_hash: Digest,
        room_id: RoomId,
        now: i64,
        ttl: Duration,
    ) -> Self {
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let public_key = identity.public_key();
        let expires_at = now.saturating_add(ttl_ms);
        let message = signed_message(&embedding_hash, &public_key, &room_id, now, expires_at);
        Self {
            embedding_hash,
            signature: identity.sign(&message),
            public_key,
            room_id,
            issued_at: now,
            expires_at,
        }
    }

    /// Strictly past the expiry time.
    pub fn is_expired(&self, now: i64) -> bool {
        now > self.expires_at
    }

    pub fn verify_signature(&self) -> bool {
        let message = signed_message(
            &self.embedding_hash,
            &self.public_key,
            &self.room_id,
            self.issued_at,
            self.expires_at,
        );
        self.public_key.verify(&message, &self.signature)
    }

    /// Check expiry, then the validity window, then the signature.
    pub fn validate(&self, now: i64) -> Result<()> {
        if self.is_expired(now) {
            return Err(EnvelopeError::Expired {
                expires_at: self.expires_at,
                now,
            });
        }
        if self.issued_at > self.expires_at {
            return Err(EnvelopeError::Malformed("issued after expiry".into()));
        }
        if !self.verify_signature() {
            return Err(EnvelopeError::InvalidSignature);
        }
        Ok(())
    }

    /// Encode as a compact QR string.
    pub fn serialize(&self) -> Result<String> {
        let body = canonical::encode(self)?;
        let mut bytes = Vec::with_capacity(QR_MAGIC.len() + 1 + body.len());
        bytes.extend_from_slice(QR_MAGIC);
        bytes.push(QR_VERSION);
        bytes.extend_from_slice(&body);
        Ok(URL_SAFE_NO_PAD.encode(bytes))
    }

    /// Decode a QR string. Returns `None` for anything malformed.
    pub fn deserialize(data: &str) -> Option<Self> {
        let data = data.trim();
        if data.is_empty() || data.len() > MAX_QR_LEN {
            return None;
        }
        let bytes = URL_SAFE_NO_PAD.decode(data).ok()?;
        let body = bytes.strip_prefix(QR_MAGIC.as_slice())?;
        let (&version, body) = body.split_first()?;
        if version != QR_VERSION {
            debug!(version, "unsupported QR payload version");
            return None;
        }
        canonical::decode(body).ok()
    }

    /// Decode and validate a scanned QR string.
    ///
    /// `None` for malformed, expired or badly signed payloads.
    pub fn parse_scanned(data: &str, now: i64) -> Option<Self> {
        let payload = Self::deserialize(data)?;
        match payload.validate(now) {
            Ok(()) => Some(payload),
            Err(e) => {
                warn!(error = %e, "rejected scanned QR payload");
                None
            }
        }
    }
}

fn signed_message(
    embedding_hash: &Digest,
    public_key: &PublicKey,
    room_id: &RoomId,
    issued_at: i64,
    expires_at: i64,
) -> Vec<u8> {
    signing_bytes(
        QR_DOMAIN,
        vec![
            Value::Bytes(embedding_hash.as_bytes().to_vec()),
            Value::Bytes(public_key.as_bytes().to_vec()),
            Value::Bytes(room_id.as_bytes().to_vec()),
            Value::Integer(issued_at.into()),
            Value::Integer(expires_at.into()),
        ],
    )
}
