//! # twinmesh
//!
//! Privacy-preserving digital twins for people in the same place. Each
//! device holds its owner's profile, shares a minimal preview with nearby
//! peers, keeps them current with signed and encrypted deltas, and
//! negotiates mutual interest without revealing more than an interest level.
//!
//! ## Overview
//!
//! - **Twins**: versioned profiles that change only through typed deltas
//! - **Rooms**: a room id shared by QR code grants the session key
//! - **Negotiation**: interest/ack exchange, matched only when both sides agree
//! - **Matching**: on-device scoring, with remote refinement for large rooms
//! - **Vault**: identity and snapshot sealed under the user's passphrase
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use twinmesh::{DeviceVault, NodeConfig, TwinNode};
//! use twinmesh::core::{now_millis, RoomId, TwinId, TwinProfile, TwinState};
//! use twinmesh::store::SqliteStore;
//! use twinmesh::sync::{MemoryNetwork, PeerId};
//!
//! async fn example() -> twinmesh::Result<()> {
//!     let config = NodeConfig::default();
//!     let vault = DeviceVault::new(Arc::new(SqliteStore::open("twin.db")?));
//!     let identity = vault.unlock_or_create("passphrase", config.kdf).await?;
//!
//!     let network = MemoryNetwork::new();
//!     let transport = network.join(PeerId::random()).await;
//!     let twin = TwinState::new(TwinId::generate(), TwinProfile::new("Ada", "Engineer"), now_millis());
//!
//!     let node = TwinNode::start(config, vault, identity, RoomId::generate(), transport, twin).await?;
//!     let qr = node.qr_payload(now_millis()).await?;
//!     println!("scan me: {}", qr);
//!     node.lock().await
//! }
//! ```
//!
//! ## Re-exports
//!
//! - `twinmesh::core` - profiles, deltas, keys
//! - `twinmesh::envelope` - encryption, QR payloads, wire shapes
//! - `twinmesh::store` - sealed blob storage
//! - `twinmesh::matching` - scoring and hybrid ranking
//! - `twinmesh::sync` - peer protocol and negotiation

pub mod config;
pub mod error;
pub mod node;
pub mod vault;

pub use twinmesh_core as core;
pub use twinmesh_envelope as envelope;
pub use twinmesh_match as matching;
pub use twinmesh_store as store;
pub use twinmesh_sync as sync;

pub use config::NodeConfig;
pub use error::{NodeError, Result};
pub use node::TwinNode;
pub use vault::{DeviceVault, Identity};

pub use twinmesh_core::{TwinDelta, TwinId, TwinProfile, TwinState};
pub use twinmesh_match::{EventContext, RankedMatch};
pub use twinmesh_sync::{NegotiationResult, PeerId};
