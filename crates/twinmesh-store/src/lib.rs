//! # twinmesh store
//!
//! Persistence for sealed blobs behind the [`SecureStore`] trait, with
//! SQLite and in-memory implementations.
//!
//! ## Key Types
//!
//! - [`SecureStore`] - The async trait for get/put/delete of opaque blobs
//! - [`SqliteStore`] - SQLite-based persistent storage
//! - [`MemoryStore`] - In-memory storage for tests
//!
//! ## Usage
//!
//! ```rust,no_run
//! use twinmesh_store::{SecureStore, SqliteStore};
//!
//! async fn example() -> twinmesh_store::Result<()> {
//!     let store = SqliteStore::open("twin.db")?;
//!     store.put("snapshot", b"sealed bytes").await?;
//!     let blob = store.get("snapshot").await?;
//!     assert!(blob.is_some());
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod memory;
pub mod migration;
pub mod sqlite;
pub mod traits;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::SecureStore;
