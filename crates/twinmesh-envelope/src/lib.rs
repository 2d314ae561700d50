//! # twinmesh envelope
//!
//! Everything that protects twin data once it leaves the pure core.
//!
//! ## Encryption Model
//!
//! 1. **Session key**: AES-256-GCM, derived from the room id. Every message
//!    in a room is encrypted under it with a fresh IV.
//! 2. **Signatures**: every wire shape is signed with the sender's Ed25519
//!    identity over its clear fields and ciphertext.
//! 3. **Storage key**: ChaCha20-Poly1305, derived from the user's passphrase
//!    with Argon2id, for sealing the identity and snapshot at rest.
//!
//! ## Bootstrap
//!
//! [`QrPayload`] carries the room capability and the presenter's public key
//! for pinning, never profile fields.

pub mod crypto;
pub mod envelope;
pub mod error;
pub mod qr;
pub mod wire;

pub use crypto::{
    decrypt, encrypt, generate_salt, Iv, KdfParams, Sealed, SessionKey, StorageKey, SALT_LEN,
};
pub use envelope::EncryptedEnvelope;
pub use error::{EnvelopeError, Result};
pub use qr::{QrConfig, QrPayload};
pub use wire::{DeltaWire, SnapshotWire};
