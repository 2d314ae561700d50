//! Identity keys, signatures, hashing and room capabilities.
//!
//! Wraps Ed25519 signing and BLAKE3 hashing with strong types. Symmetric
//! encryption lives in `twinmesh-envelope`.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ed25519_dalek::{Signature as DalekSignature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::Zeroize;

use crate::canonical::bytes_fixed;
use crate::error::CoreError;

/// A 32-byte BLAKE3 digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Digest(#[serde(with = "bytes_fixed")] pub [u8; 32]);

impl Digest {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", &self.to_hex()[..16])
    }
}

/// Hash arbitrary bytes.
pub fn hash(data: &[u8]) -> Digest {
    Digest(*blake3::hash(data).as_bytes())
}

/// Hash an embedding vector.
///
/// The encoding is the dimension count followed by each component as
/// little-endian f32, so equal vectors hash equally on every platform.
pub fn hash_embedding(embedding: &[f32]) -> Digest {
    let mut hasher = blake3::Hasher::new_derive_key("twinmesh-v1-embedding");
    hasher.update(&(embedding.len() as u64).to_le_bytes());
    for value in embedding {
        hasher.update(&value.to_le_bytes());
    }
    Digest(*hasher.finalize().as_bytes())
}

/// A 32-byte Ed25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey(#[serde(with = "bytes_fixed")] pub [u8; 32]);

impl PublicKey {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Verify a signature. Returns false for any invalid key or signature.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        let Ok(verifying_key) = VerifyingKey::from_bytes(&self.0) else {
            return false;
        };
        let sig = DalekSignature::from_bytes(&signature.0);
        verifying_key.verify(message, &sig).is_ok()
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", &self.to_hex()[..16])
    }
}

/// A 64-byte Ed25519 signature.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(#[serde(with = "bytes_fixed")] pub [u8; 64]);

impl Signature {
    pub const fn from_bytes(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({}...)", &self.to_hex()[..16])
    }
}

/// The device's long-lived signing keypair.
///
/// The secret never leaves the device. The seed is only ever lent to a
/// sealing function through [`Keypair::seal_seed`].
#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    /// Generate a new keypair from the OS RNG.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Rebuild a keypair from a sealed seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.signing_key.verifying_key().to_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.signing_key.sign(message).to_bytes())
    }

    /// Run `seal` over the secret seed and return its output.
    ///
    /// The seed copy is wiped once `seal` returns.
    pub fn seal_seed<R>(&self, seal: impl FnOnce(&[u8; 32]) -> R) -> R {
        let mut seed = self.signing_key.to_bytes();
        let sealed = seal(&seed);
        seed.zeroize();
        sealed
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Keypair({:?})", self.public_key())
    }
}

/// Verify a signature over raw, untrusted inputs.
///
/// Wrong lengths, invalid points and bad signatures all return false.
pub fn verify_signature(data: &[u8], signature: &[u8], public_key: &[u8]) -> bool {
    let Ok(signature): Result<[u8; 64], _> = signature.try_into() else {
        return false;
    };
    let Ok(public_key): Result<[u8; 32], _> = public_key.try_into() else {
        return false;
    };
    PublicKey(public_key).verify(data, &Signature(signature))
}

/// Encode a public key for exchange.
pub fn export_public_key(key: &PublicKey) -> String {
    BASE64.encode(key.0)
}

/// Decode an exported public key, rejecting anything that is not a valid point.
pub fn import_public_key(encoded: &str) -> Result<PublicKey, CoreError> {
    let bytes = BASE64
        .decode(encoded.trim())
        .map_err(|e| CoreError::DecodingError(e.to_string()))?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| CoreError::InvalidPublicKey)?;
    VerifyingKey::from_bytes(&bytes).map_err(|_| CoreError::InvalidPublicKey)?;
    Ok(PublicKey(bytes))
}

/// A 128-bit room capability token.
///
/// Knowing the room id is what lets a device join the room, so it is drawn
/// from the OS CSPRNG and never derived from a seed.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoomId(#[serde(with = "bytes_fixed")] pub [u8; 16]);

impl RoomId {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 16] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Self(arr))
    }
}

impl fmt::Debug for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RoomId({})", &self.to_hex()[..8])
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}
