//! Signed and encrypted envelope for negotiation signals.
//!
//! The signature covers the IV and the ciphertext, so a receiver can reject
//! a forged or altered envelope before spending effort on decryption.

use ciborium::value::Value;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use twinmesh_core::canonical::{self, bytes_vec, signing_bytes};
use twinmesh_core::{limits, Keypair, PublicKey, Signature};

use crate::crypto::{Iv, SessionKey};
use crate::error::{EnvelopeError, Result};

const ENVELOPE_DOMAIN: &str = "twinmesh-v1-envelope";

/// An authenticated, encrypted payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    #[serde(with = "bytes_vec")]
    pub ciphertext: Vec<u8>,
    pub iv: Iv,
    pub signature: Signature,
    pub sender_public_key: PublicKey,
}

impl EncryptedEnvelope {
    /// Encrypt `plaintext` under the session key and sign it.
    pub fn seal(plaintext: &[u8], key: &SessionKey, identity: &Keypair) -> Result<Self> {
        let sealed = key.encrypt(plaintext)?;
        let sender_public_key = identity.public_key();
        let message = signed_message(&sealed.iv, &sealed.ciphertext, &sender_public_key);
        Ok(Self {
            signature: identity.sign(&message),
            ciphertext: sealed.ciphertext,
            iv: sealed.iv,
            sender_public_key,
        })
    }

    /// Encode `value` as CBOR, then [`seal`](Self::seal) it.
    pub fn seal_value<T: Serialize>(value: &T, key: &SessionKey, identity: &Keypair) -> Result<Self> {
        let plaintext = canonical::encode(value)?;
        Self::seal(&plaintext, key, identity)
    }

    /// Check the signature against the embedded sender key.
    pub fn verify(&self) -> bool {
        let message = signed_message(&self.iv, &self.ciphertext, &self.sender_public_key);
        self.sender_public_key.verify(&message, &self.signature)
    }

    /// Verify, then decrypt.
    pub fn open(&self, key: &SessionKey) -> Result<Vec<u8>> {
        if self.ciphertext.len() > limits::MAX_CIPHERTEXT_LEN {
            return Err(EnvelopeError::LimitExceeded("ciphertext"));
        }
        if !self.verify() {
            return Err(EnvelopeError::InvalidSignature);
        }
        key.decrypt(&self.ciphertext, &self.iv)
    }

    /// [`open`](Self::open) and decode the CBOR payload.
    pub fn open_value<T: DeserializeOwned>(&self, key: &SessionKey) -> Result<T> {
        let plaintext = self.open(key)?;
        Ok(canonical::decode(&plaintext)?)
    }
}

fn signed_message(iv: &Iv, ciphertext: &[u8], sender: &PublicKey) -> Vec<u8> {
    signing_bytes(
        ENVELOPE_DOMAIN,
        vec![
            Value::Bytes(iv.as_bytes().to_vec()),
            Value::Bytes(ciphertext.to_vec()),
            Value::Bytes(sender.as_bytes().to_vec()),
        ],
    )
}
