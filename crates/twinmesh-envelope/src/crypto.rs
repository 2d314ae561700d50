//! Symmetric encryption for the wire and for data at rest.
//!
//! Wire payloads use AES-256-GCM under a session key derived from the room
//! id, with a fresh 96-bit IV per message. Data at rest uses
//! ChaCha20-Poly1305 under a key derived from the user's passphrase with
//! Argon2id.

use aes_gcm::Aes256Gcm;
use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305,
};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

use twinmesh_core::canonical::bytes_fixed;
use twinmesh_core::RoomId;

use crate::error::{EnvelopeError, Result};

/// Length of an AEAD nonce in bytes.
pub const IV_LEN: usize = 12;

/// Length of a passphrase salt in bytes.
pub const SALT_LEN: usize = 16;

/// A 96-bit AEAD nonce.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Iv(#[serde(with = "bytes_fixed")] pub [u8; IV_LEN]);

impl Iv {
    /// A fresh random IV. Never reuse one under the same key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub const fn from_bytes(bytes: [u8; IV_LEN]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; IV_LEN] {
        &self.0
    }
}

impl fmt::Debug for Iv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Iv({})", hex::encode(self.0))
    }
}

/// Output of [`encrypt`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    /// Ciphertext with the authentication tag appended.
    pub ciphertext: Vec<u8>,
    pub iv: Iv,
}

/// A 256-bit AES-GCM key shared by the members of a room.
#[derive(Clone)]
pub struct SessionKey([u8; 32]);

impl SessionKey {
    /// Derive the session key for a room.
    ///
    /// Every holder of the room id derives the same key, so possession of
    /// the room id is the capability.
    pub fn for_room(room_id: &RoomId) -> Self {
        Self(blake3::derive_key("twinmesh-v1-room-session", room_id.as_bytes()))
    }

    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Sealed> {
        encrypt(plaintext, self)
    }

    pub fn decrypt(&self, ciphertext: &[u8], iv: &Iv) -> Result<Vec<u8>> {
        decrypt(ciphertext, iv, self)
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SessionKey").field(&"[REDACTED]").finish()
    }
}

/// Encrypt with AES-256-GCM under a fresh random IV.
pub fn encrypt(plaintext: &[u8], key: &SessionKey) -> Result<Sealed> {
    let cipher = Aes256Gcm::new_from_slice(&key.0)
        .map_err(|e| EnvelopeError::Encryption(e.to_string()))?;
    let iv = Iv::generate();
    let ciphertext = cipher
        .encrypt(aes_gcm::Nonce::from_slice(&iv.0), plaintext)
        .map_err(|e| EnvelopeError::Encryption(e.to_string()))?;
    Ok(Sealed { ciphertext, iv })
}

/// Decrypt AES-256-GCM ciphertext. Any tag mismatch is [`EnvelopeError::Decryption`].
pub fn decrypt(ciphertext: &[u8], iv: &Iv, key: &SessionKey) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(&key.0).map_err(|_| EnvelopeError::Decryption)?;
    cipher
        .decrypt(aes_gcm::Nonce::from_slice(&iv.0), ciphertext)
        .map_err(|_| EnvelopeError::Decryption)
}

/// Argon2id cost parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KdfParams {
    /// Memory cost in KiB.
    pub mem_cost_kib: u32,
    pub time_cost: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            mem_cost_kib: 65536,
            time_cost: 3,
            parallelism: 4,
        }
    }
}

impl KdfParams {
    /// Cheap parameters for tests. Never use for real data.
    pub fn insecure_fast() -> Self {
        Self {
            mem_cost_kib: 1024,
            time_cost: 1,
            parallelism: 1,
        }
    }
}

/// A fresh random salt for [`StorageKey::from_passphrase`].
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// A ChaCha20-Poly1305 key for sealing data at rest.
#[derive(Clone)]
pub struct StorageKey([u8; 32]);

impl StorageKey {
    /// Derive a storage key from a passphrase with Argon2id.
    pub fn from_passphrase(
        passphrase: &str,
        salt: &[u8; SALT_LEN],
        params: &KdfParams,
    ) -> Result<Self> {
        let argon2_params = Params::new(
            params.mem_cost_kib,
            params.time_cost,
            params.parallelism,
            Some(32),
        )
        .map_err(|e| EnvelopeError::KeyDerivation(e.to_string()))?;

        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params);
        let mut key = [0u8; 32];
        argon2
            .hash_password_into(passphrase.as_bytes(), salt, &mut key)
            .map_err(|e| EnvelopeError::KeyDerivation(e.to_string()))?;
        Ok(Self(key))
    }

    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Seal data as `nonce || ciphertext`.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let cipher = ChaCha20Poly1305::new_from_slice(&self.0)
            .map_err(|e| EnvelopeError::Encryption(e.to_string()))?;
        let nonce = Iv::generate();
        let ciphertext = cipher
            .encrypt(chacha20poly1305::Nonce::from_slice(&nonce.0), plaintext)
            .map_err(|e| EnvelopeError::Encryption(e.to_string()))?;

        let mut blob = Vec::with_capacity(IV_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce.0);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    /// Open a blob produced by [`StorageKey::seal`].
    pub fn open(&self, blob: &[u8]) -> Result<Vec<u8>> {
        if blob.len() < IV_LEN {
            return Err(EnvelopeError::Decryption);
        }
        let (nonce, ciphertext) = blob.split_at(IV_LEN);
        let cipher =
            ChaCha20Poly1305::new_from_slice(&self.0).map_err(|_| EnvelopeError::Decryption)?;
        cipher
            .decrypt(chacha20poly1305::Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| EnvelopeError::Decryption)
    }
}

impl fmt::Debug for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StorageKey").field(&"[REDACTED]").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = SessionKey::for_room(&RoomId::generate());
        let sealed = encrypt(b"hello, room", &key).unwrap();
        assert_eq!(decrypt(&sealed.ciphertext, &sealed.iv, &key).unwrap(), b"hello, room");
    }

    #[test]
    fn test_fresh_iv_per_call() {
        let key = SessionKey::for_room(&RoomId::generate());
        let a = key.encrypt(b"same").unwrap();
        let b = key.encrypt(b"same").unwrap();
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_tamper_and_wrong_key_fail() {
        let room = RoomId::generate();
        let key = SessionKey::for_room(&room);
        let mut sealed = key.encrypt(b"secret").unwrap();

        let other = SessionKey::for_room(&RoomId::generate());
        assert!(matches!(
            other.decrypt(&sealed.ciphertext, &sealed.iv),
            Err(EnvelopeError::Decryption)
        ));

        sealed.ciphertext[0] ^= 0x01;
        assert!(matches!(
            key.decrypt(&sealed.ciphertext, &sealed.iv),
            Err(EnvelopeError::Decryption)
        ));
    }

    #[test]
    fn test_same_room_same_key() {
        let room = RoomId::generate();
        let sealed = SessionKey::for_room(&room).encrypt(b"x").unwrap();
        assert!(SessionKey::for_room(&room)
            .decrypt(&sealed.ciphertext, &sealed.iv)
            .is_ok());
    }

    #[test]
    fn test_storage_key_deterministic_and_seals() {
        let salt = [3u8; SALT_LEN];
        let params = KdfParams::insecure_fast();
        let k1 = StorageKey::from_passphrase("correct horse", &salt, &params).unwrap();
        let k2 = StorageKey::from_passphrase("correct horse", &salt, &params).unwrap();

        let blob = k1.seal(b"seed bytes").unwrap();
        assert_eq!(k2.open(&blob).unwrap(), b"seed bytes");

        let wrong = StorageKey::from_passphrase("battery staple", &salt, &params).unwrap();
        assert!(wrong.open(&blob).is_err());
        assert!(k1.open(&blob[..4]).is_err());
    }

    #[test]
    fn test_key_debug_is_redacted() {
        let key = StorageKey::from_bytes([9u8; 32]);
        assert!(!format!("{:?}", key).contains('9'));
    }
}
