//! # twinmesh core
//!
//! Pure primitives for twin synchronization: profiles and their versioned
//! state, typed deltas, identity keys and CBOR encoding.
//!
//! This crate contains no I/O, no storage, no networking.
//!
//! ## Key Types
//!
//! - [`TwinState`] - A versioned snapshot of one twin
//! - [`TwinDelta`] - A typed difference against one base version
//! - [`DeltaSync`] - Owner of a local state; validates before applying
//! - [`Keypair`] - The device's Ed25519 identity
//! - [`RoomId`] - Capability token for joining a room
//!
//! ## Deltas
//!
//! See the [`delta`] module for diff, apply, validate and merge.

pub mod canonical;
pub mod crypto;
pub mod delta;
pub mod error;
pub mod types;

pub use crypto::{
    export_public_key, hash, hash_embedding, import_public_key, verify_signature, Digest,
    Keypair, PublicKey, RoomId, Signature,
};
pub use delta::{
    apply_delta, compute_delta, compute_delta_at, diff_profiles, is_valid_delta, merge_delta,
    validate_delta, DeltaSync, TwinChange, TwinDelta,
};
pub use error::{CoreError, ValidationError};
pub use types::{limits, now_millis, TwinId, TwinProfile, TwinState};
