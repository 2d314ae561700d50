//! Device vault: the identity seed and twin snapshot, sealed at rest.
//!
//! Both blobs are sealed with ChaCha20-Poly1305 under a key derived from
//! the user's passphrase. The salt and KDF parameters live next to them in
//! a small clear header.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use twinmesh_core::canonical::{self, bytes_fixed};
use twinmesh_core::{Keypair, PublicKey, TwinState};
use twinmesh_envelope::{generate_salt, EnvelopeError, KdfParams, StorageKey, SALT_LEN};
use twinmesh_store::SecureStore;

use crate::error::{NodeError, Result};

const HEADER_KEY: &str = "twinmesh/vault-header";
const IDENTITY_KEY: &str = "twinmesh/identity";
const SNAPSHOT_KEY: &str = "twinmesh/snapshot";

#[derive(Serialize, Deserialize)]
struct VaultHeader {
    #[serde(with = "bytes_fixed")]
    salt: [u8; SALT_LEN],
    kdf: KdfParams,
}

/// An unlocked device identity.
///
/// Dropping every clone is what locking means: the sealed seed stays in
/// the store.
#[derive(Clone)]
pub struct Identity {
    keypair: Arc<Keypair>,
    storage_key: StorageKey,
}

impl Identity {
    pub fn keypair(&self) -> &Arc<Keypair> {
        &self.keypair
    }

    pub fn public_key(&self) -> PublicKey {
        self.keypair.public_key()
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}

/// Sealed persistence for one device.
#[derive(Clone)]
pub struct DeviceVault {
    store: Arc<dyn SecureStore>,
}

impl DeviceVault {
    pub fn new(store: Arc<dyn SecureStore>) -> Self {
        Self { store }
    }

    /// Whether an identity has been created.
    pub async fn exists(&self) -> Result<bool> {
        Ok(self.store.contains(IDENTITY_KEY).await?)
    }

    /// Create a fresh identity sealed under `passphrase`.
    pub async fn create(&self, passphrase: &str, kdf: KdfParams) -> Result<Identity> {
        if self.exists().await? {
            return Err(NodeError::VaultExists);
        }
        let salt = generate_salt();
        let storage_key = derive_key(passphrase, salt, kdf).await?;
        let keypair = Keypair::generate();

        let header = canonical::encode(&VaultHeader { salt, kdf })?;
        let sealed_seed = keypair.seal_seed(|seed| storage_key.seal(seed))?;
        self.store.put(HEADER_KEY, &header).await?;
        self.store.put(IDENTITY_KEY, &sealed_seed).await?;

        info!(public_key = ?keypair.public_key(), "created device identity");
        Ok(Identity {
            keypair: Arc::new(keypair),
            storage_key,
        })
    }

    /// Unseal the identity with `passphrase`.
    pub async fn unlock(&self, passphrase: &str) -> Result<Identity> {
        let header = self.store.get(HEADER_KEY).await?.ok_or(NodeError::NoIdentity)?;
        let sealed_seed = self
            .store
            .get(IDENTITY_KEY)
            .await?
            .ok_or(NodeError::NoIdentity)?;
        let header: VaultHeader = canonical::decode(&header)?;

        let storage_key = derive_key(passphrase, header.salt, header.kdf).await?;
        let seed = match storage_key.open(&sealed_seed) {
            Ok(seed) => seed,
            Err(EnvelopeError::Decryption) => return Err(NodeError::WrongPassphrase),
            Err(e) => return Err(e.into()),
        };
        let seed: [u8; 32] = seed
            .try_into()
            .map_err(|_| EnvelopeError::Malformed("identity seed length".into()))?;

        let keypair = Keypair::from_seed(&seed);
        debug!(public_key = ?keypair.public_key(), "unlocked device identity");
        Ok(Identity {
            keypair: Arc::new(keypair),
            storage_key,
        })
    }

    /// Unlock if an identity exists, otherwise create one.
    pub async fn unlock_or_create(&self, passphrase: &str, kdf: KdfParams) -> Result<Identity> {
        if self.exists().await? {
            self.unlock(passphrase).await
        } else {
            self.create(passphrase, kdf).await
        }
    }

    pub async fn save_snapshot(&self, identity: &Identity, state: &TwinState) -> Result<()> {
        let plaintext = canonical::encode(state)?;
        let sealed = identity.storage_key.seal(&plaintext)?;
        self.store.put(SNAPSHOT_KEY, &sealed).await?;
        debug!(twin = %state.twin_id, version = state.version, "saved snapshot");
        Ok(())
    }

    pub async fn load_snapshot(&self, identity: &Identity) -> Result<Option<TwinState>> {
        let Some(sealed) = self.store.get(SNAPSHOT_KEY).await? else {
            return Ok(None);
        };
        let plaintext = identity.storage_key.open(&sealed)?;
        let state: TwinState = canonical::decode(&plaintext)?;
        state.profile.check_limits()?;
        Ok(Some(state))
    }

    /// Destroy the identity, its header and the snapshot in one step.
    pub async fn erase(&self) -> Result<()> {
        self.store
            .delete_all(&[HEADER_KEY, IDENTITY_KEY, SNAPSHOT_KEY])
            .await?;
        info!("erased device vault");
        Ok(())
    }
}

/// Argon2 runs on the blocking pool.
async fn derive_key(passphrase: &str, salt: [u8; SALT_LEN], kdf: KdfParams) -> Result<StorageKey> {
    let passphrase = passphrase.to_owned();
    tokio::task::spawn_blocking(move || StorageKey::from_passphrase(&passphrase, &salt, &kdf))
        .await
        .map_err(|e| NodeError::Task(e.to_string()))?
        .map_err(NodeError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use twinmesh_core::{TwinId, TwinProfile};
    use twinmesh_store::{MemoryStore, SqliteStore};

    fn vault() -> DeviceVault {
        DeviceVault::new(Arc::new(MemoryStore::new()))
    }

    fn state() -> TwinState {
        TwinState::new(
            TwinId::new("twin-a"),
            TwinProfile::new("Ada", "Engineer").with_skills(["Rust"]),
            1_000,
        )
    }

    #[tokio::test]
    async fn test_create_then_unlock_same_identity() {
        let vault = vault();
        assert!(!vault.exists().await.unwrap());

        let created = vault.create("hunter2", KdfParams::insecure_fast()).await.unwrap();
        assert!(vault.exists().await.unwrap());
        let unlocked = vault.unlock("hunter2").await.unwrap();
        assert_eq!(created.public_key(), unlocked.public_key());
    }

    #[tokio::test]
    async fn test_stored_identity_is_not_raw_seed() {
        let store = Arc::new(MemoryStore::new());
        let vault = DeviceVault::new(store.clone());
        let identity = vault.create("pw", KdfParams::insecure_fast()).await.unwrap();

        let blob = store.get(IDENTITY_KEY).await.unwrap().unwrap();
        let seed = identity.keypair().seal_seed(|s| *s);
        assert!(!blob.windows(seed.len()).any(|w| w == seed.as_slice()));
    }

    #[tokio::test]
    async fn test_wrong_passphrase() {
        let vault = vault();
        vault.create("right", KdfParams::insecure_fast()).await.unwrap();
        assert!(matches!(
            vault.unlock("wrong").await,
            Err(NodeError::WrongPassphrase)
        ));
    }

    #[tokio::test]
    async fn test_create_twice_rejected() {
        let vault = vault();
        vault.create("pw", KdfParams::insecure_fast()).await.unwrap();
        assert!(matches!(
            vault.create("pw", KdfParams::insecure_fast()).await,
            Err(NodeError::VaultExists)
        ));
    }

    #[tokio::test]
    async fn test_unlock_empty_vault() {
        assert!(matches!(vault().unlock("pw").await, Err(NodeError::NoIdentity)));
    }

    #[tokio::test]
    async fn test_snapshot_roundtrip_is_sealed() {
        let store = Arc::new(MemoryStore::new());
        let vault = DeviceVault::new(store.clone());
        let identity = vault.create("pw", KdfParams::insecure_fast()).await.unwrap();

        assert!(vault.load_snapshot(&identity).await.unwrap().is_none());
        vault.save_snapshot(&identity, &state()).await.unwrap();
        assert_eq!(vault.load_snapshot(&identity).await.unwrap(), Some(state()));

        let raw = store.get(SNAPSHOT_KEY).await.unwrap().unwrap();
        assert!(!raw.windows(3).any(|w| w == b"Ada"));
    }

    #[tokio::test]
    async fn test_erase_removes_everything() {
        let store = Arc::new(MemoryStore::new());
        let vault = DeviceVault::new(store.clone());
        let identity = vault.create("pw", KdfParams::insecure_fast()).await.unwrap();
        vault.save_snapshot(&identity, &state()).await.unwrap();
        assert_eq!(store.len(), 3);

        vault.erase().await.unwrap();
        assert!(store.is_empty());
        assert!(!vault.exists().await.unwrap());
        assert!(matches!(vault.unlock("pw").await, Err(NodeError::NoIdentity)));
    }

    #[tokio::test]
    async fn test_sqlite_vault_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault.db");

        let public_key = {
            let vault = DeviceVault::new(Arc::new(SqliteStore::open(&path).unwrap()));
            let identity = vault
                .unlock_or_create("pw", KdfParams::insecure_fast())
                .await
                .unwrap();
            vault.save_snapshot(&identity, &state()).await.unwrap();
            identity.public_key()
        };

        let vault = DeviceVault::new(Arc::new(SqliteStore::open(&path).unwrap()));
        let identity = vault
            .unlock_or_create("pw", KdfParams::insecure_fast())
            .await
            .unwrap();
        assert_eq!(identity.public_key(), public_key);
        assert_eq!(vault.load_snapshot(&identity).await.unwrap(), Some(state()));
    }
}
