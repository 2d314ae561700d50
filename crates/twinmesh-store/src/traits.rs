//! SecureStore trait: persistence of opaque, already-sealed blobs.
//!
//! The store never sees plaintext. Callers seal values before `put` and
//! open them after `get`.

use async_trait::async_trait;

use crate::error::Result;

/// Async key-value store for sealed blobs.
///
/// For SQLite, implementations use `spawn_blocking` internally to avoid
/// blocking the runtime.
#[async_trait]
pub trait SecureStore: Send + Sync {
    /// Get the blob stored under `key`.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store `value` under `key`, replacing any previous blob.
    async fn put(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Delete `key`. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Delete every key in `keys` as one atomic operation.
    ///
    /// Either all keys are gone afterwards or none were touched.
    async fn delete_all(&self, keys: &[&str]) -> Result<()>;

    /// Check whether `key` exists.
    async fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }
}
