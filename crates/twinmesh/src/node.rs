//! The node: one device's twin in one room.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use twinmesh_core::{now_millis, PublicKey, RoomId, TwinDelta, TwinId, TwinProfile, TwinState};
use twinmesh_envelope::QrPayload;
use twinmesh_match::{EventContext, HybridMatcher, MatchingProvider, RankedMatch};
use twinmesh_sync::{NegotiationResult, Negotiator, PeerId, PeerTwin, Transport};

use crate::config::NodeConfig;
use crate::error::{NodeError, Result};
use crate::vault::{DeviceVault, Identity};

/// Ties a device identity, its sealed vault, the room negotiator and the
/// matcher together.
pub struct TwinNode<T: Transport + 'static> {
    config: NodeConfig,
    room_id: RoomId,
    vault: DeviceVault,
    identity: Identity,
    negotiator: Arc<Negotiator<T>>,
    matcher: HybridMatcher,
    task: JoinHandle<twinmesh_sync::Result<()>>,
}

impl<T: Transport + 'static> TwinNode<T> {
    /// Start a node in `room_id`.
    ///
    /// The twin is restored from the vault snapshot when there is one,
    /// otherwise `initial` is used and saved.
    pub async fn start(
        config: NodeConfig,
        vault: DeviceVault,
        identity: Identity,
        room_id: RoomId,
        transport: T,
        initial: TwinState,
    ) -> Result<Self> {
        config.validate()?;
        let state = match vault.load_snapshot(&identity).await? {
            Some(state) => state,
            None => {
                initial.profile.check_limits()?;
                vault.save_snapshot(&identity, &initial).await?;
                initial
            }
        };

        info!(twin = %state.twin_id, version = state.version, room = %room_id, "starting node");
        let negotiator = Negotiator::new(
            transport,
            Arc::clone(identity.keypair()),
            &room_id,
            state,
            config.negotiator.clone(),
        );
        let task = negotiator.spawn();
        let matcher = HybridMatcher::new(config.hybrid.clone())?;

        Ok(Self {
            config,
            room_id,
            vault,
            identity,
            negotiator,
            matcher,
            task,
        })
    }

    /// Use `provider` for remote refinement of large candidate sets.
    pub fn with_provider(mut self, provider: Arc<dyn MatchingProvider>) -> Self {
        self.matcher = self.matcher.with_provider(provider);
        self
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn room_id(&self) -> RoomId {
        self.room_id
    }

    pub fn public_key(&self) -> PublicKey {
        self.identity.public_key()
    }

    pub fn peer_id(&self) -> PeerId {
        self.negotiator.local_peer_id()
    }

    pub async fn twin_id(&self) -> TwinId {
        self.negotiator.local_state().await.twin_id
    }

    pub async fn state(&self) -> TwinState {
        self.negotiator.local_state().await
    }

    pub fn negotiator(&self) -> &Arc<Negotiator<T>> {
        &self.negotiator
    }

    pub async fn peer(&self, peer_id: &PeerId) -> Option<PeerTwin> {
        self.negotiator.peer(peer_id).await
    }

    /// Replace the local profile. Broadcasts the delta and saves the
    /// snapshot. `None` when nothing changed.
    pub async fn update_profile(&self, profile: TwinProfile) -> Result<Option<TwinDelta>> {
        let delta = self
            .negotiator
            .update_local_profile(profile, now_millis())
            .await?;
        if delta.is_some() {
            let state = self.negotiator.local_state().await;
            self.vault.save_snapshot(&self.identity, &state).await?;
        }
        Ok(delta)
    }

    pub async fn negotiate_with(&self, peer: &PeerId) -> Result<Option<NegotiationResult>> {
        Ok(self.negotiator.negotiate_with(peer).await?)
    }

    /// Rank every connected peer against the local profile.
    pub async fn find_matches(&self, context: &EventContext) -> Vec<RankedMatch> {
        let user = self.negotiator.local_state().await.profile;
        let candidates = self.negotiator.candidates().await;
        self.matcher.find_matches(&user, &candidates, context).await
    }

    pub fn calculate_score(&self, a: &TwinProfile, b: &TwinProfile) -> u8 {
        self.matcher.calculate_score(a, b)
    }

    /// A QR string others can scan to join this room and pin this device.
    pub async fn qr_payload(&self, now: i64) -> Result<String> {
        let profile = self.negotiator.local_state().await.profile;
        let payload = QrPayload::create_with_ttl(
            self.identity.keypair(),
            profile.embedding_digest(),
            self.room_id,
            now,
            self.config.qr.ttl(),
        );
        Ok(payload.serialize()?)
    }

    /// Validate a scanned QR string without a running node, to learn which
    /// room to join.
    pub fn scan_qr(data: &str, now: i64) -> Result<QrPayload> {
        QrPayload::parse_scanned(data, now).ok_or(NodeError::InvalidQr)
    }

    /// Accept a scanned QR payload for this room.
    ///
    /// The presenter's key is remembered so its hello is marked verified.
    pub fn join_from_qr(&self, data: &str, now: i64) -> Result<QrPayload> {
        let payload = Self::scan_qr(data, now)?;
        if payload.room_id != self.room_id {
            return Err(NodeError::RoomMismatch(payload.room_id.to_hex()));
        }
        self.negotiator
            .expect_peer(payload.public_key, payload.embedding_hash);
        Ok(payload)
    }

    pub fn on_peer_connect(&self, callback: impl Fn(&PeerId) + Send + Sync + 'static) {
        self.negotiator.on_peer_connect(callback);
    }

    pub fn on_peer_disconnect(&self, callback: impl Fn(&PeerId) + Send + Sync + 'static) {
        self.negotiator.on_peer_disconnect(callback);
    }

    pub fn on_match(&self, callback: impl Fn(&NegotiationResult) + Send + Sync + 'static) {
        self.negotiator.on_match(callback);
    }

    /// Stop networking. In-flight negotiations resolve to no match.
    pub fn shutdown(&self) {
        self.negotiator.shutdown();
    }

    /// Save the snapshot, stop networking and drop the identity.
    pub async fn lock(self) -> Result<()> {
        let state = self.negotiator.local_state().await;
        self.vault.save_snapshot(&self.identity, &state).await?;
        self.stop().await?;
        info!(twin = %state.twin_id, "node locked");
        Ok(())
    }

    /// Stop networking and destroy everything in the vault.
    pub async fn erase(self) -> Result<()> {
        let vault = self.vault.clone();
        if let Err(e) = self.stop().await {
            warn!(error = %e, "negotiator ended with an error before erase");
        }
        vault.erase().await
    }

    async fn stop(self) -> Result<()> {
        self.negotiator.shutdown();
        self.task
            .await
            .map_err(|e| NodeError::Task(e.to_string()))??;
        Ok(())
    }
}
