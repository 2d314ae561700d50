//! Peer discovery, delta exchange and mutual-interest negotiation.
//!
//! A [`Negotiator`] owns the local twin state and everything this node
//! knows about its peers. One task drives [`Negotiator::run`]; any number
//! of callers may negotiate concurrently.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock as StdRwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use twinmesh_core::{
    hash_embedding, now_millis, DeltaSync, Digest, Keypair, PublicKey, RoomId, TwinDelta, TwinId,
    TwinProfile, TwinState,
};
use twinmesh_envelope::{DeltaWire, EncryptedEnvelope, SessionKey, SnapshotWire};
use twinmesh_match::calculate_score;

use crate::error::{Result, SyncError};
use crate::messages::{InterestSignal, PeerId, PeerMessage, PROTOCOL_VERSION};
use crate::peers::{FoldOutcome, PeerRegistry, PeerTwin};
use crate::transport::{Transport, TransportEvent};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NegotiatorConfig {
    /// Both sides' interest must reach this for a match.
    pub mutual_interest_threshold: u8,
    /// How long to wait for an ack.
    pub ack_timeout_ms: u64,
    /// Share full profiles with every connected peer of the room.
    ///
    /// When set, each newly connected peer is asked for its full state and
    /// any connected peer's catch-up request is answered. When clear, a
    /// hello discloses only the preview and catch-up is served only to
    /// peers that are behind after receiving one of our deltas.
    pub request_catch_up_on_hello: bool,
    /// Applied delta ids remembered per peer for deduplication.
    pub max_delta_history: usize,
}

impl Default for NegotiatorConfig {
    fn default() -> Self {
        Self {
            mutual_interest_threshold: 70,
            ack_timeout_ms: 10_000,
            request_catch_up_on_hello: false,
            max_delta_history: 256,
        }
    }
}

impl NegotiatorConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

/// A confirmed mutual match. Immutable once created.
#[derive(Debug, Clone, PartialEq)]
pub struct NegotiationResult {
    peer_id: PeerId,
    peer_twin_id: TwinId,
    peer_profile: TwinProfile,
    mutual_interest: u8,
    negotiated_at: i64,
}

impl NegotiationResult {
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn peer_twin_id(&self) -> &TwinId {
        &self.peer_twin_id
    }

    /// The peer's profile as known when the match was confirmed.
    pub fn peer_profile(&self) -> &TwinProfile {
        &self.peer_profile
    }

    /// The lower of the two interest levels.
    pub fn mutual_interest(&self) -> u8 {
        self.mutual_interest
    }

    /// Unix milliseconds.
    pub fn negotiated_at(&self) -> i64 {
        self.negotiated_at
    }
}

type PeerCallback = Arc<dyn Fn(&PeerId) + Send + Sync>;
type MatchCallback = Arc<dyn Fn(&NegotiationResult) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    connect: Vec<PeerCallback>,
    disconnect: Vec<PeerCallback>,
    matched: Vec<MatchCallback>,
}

struct Pending {
    peer: PeerId,
    reply: oneshot::Sender<u8>,
}

/// Runs the peer protocol for one room.
pub struct Negotiator<T: Transport> {
    transport: T,
    identity: Arc<Keypair>,
    session_key: SessionKey,
    config: NegotiatorConfig,
    local: RwLock<DeltaSync>,
    peers: RwLock<PeerRegistry>,
    pending: Mutex<HashMap<Uuid, Pending>>,
    peer_tokens: Mutex<HashMap<PeerId, CancellationToken>>,
    expected: Mutex<HashMap<PublicKey, Digest>>,
    matches: Mutex<HashMap<PeerId, NegotiationResult>>,
    callbacks: StdRwLock<Callbacks>,
    shutdown: CancellationToken,
}

fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<T: Transport + 'static> Negotiator<T> {
    pub fn new(
        transport: T,
        identity: Arc<Keypair>,
        room_id: &RoomId,
        local: TwinState,
        config: NegotiatorConfig,
    ) -> Arc<Self> {
        let max_history = config.max_delta_history;
        Arc::new(Self {
            transport,
            identity,
            session_key: SessionKey::for_room(room_id),
            config,
            local: RwLock::new(DeltaSync::new(local)),
            peers: RwLock::new(PeerRegistry::new(max_history)),
            pending: Mutex::new(HashMap::new()),
            peer_tokens: Mutex::new(HashMap::new()),
            expected: Mutex::new(HashMap::new()),
            matches: Mutex::new(HashMap::new()),
            callbacks: StdRwLock::new(Callbacks::default()),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &NegotiatorConfig {
        &self.config
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.transport.local_peer_id()
    }

    pub async fn local_state(&self) -> TwinState {
        self.local.read().await.state().clone()
    }

    pub async fn peer(&self, peer_id: &PeerId) -> Option<PeerTwin> {
        self.peers.read().await.get(peer_id).cloned()
    }

    pub async fn peers(&self) -> Vec<PeerTwin> {
        self.peers.read().await.iter().cloned().collect()
    }

    /// States of connected peers, for ranking.
    pub async fn candidates(&self) -> Vec<TwinState> {
        self.peers.read().await.connected_states()
    }

    /// The latest confirmed match per peer, oldest first.
    pub fn matches(&self) -> Vec<NegotiationResult> {
        let mut matches: Vec<_> = lock(&self.matches).values().cloned().collect();
        matches.sort_by_key(|m| m.negotiated_at);
        matches
    }

    pub fn on_peer_connect(&self, callback: impl Fn(&PeerId) + Send + Sync + 'static) {
        self.callbacks_mut().connect.push(Arc::new(callback));
    }

    pub fn on_peer_disconnect(&self, callback: impl Fn(&PeerId) + Send + Sync + 'static) {
        self.callbacks_mut().disconnect.push(Arc::new(callback));
    }

    pub fn on_match(&self, callback: impl Fn(&NegotiationResult) + Send + Sync + 'static) {
        self.callbacks_mut().matched.push(Arc::new(callback));
    }

    /// Remember a key from a scanned QR payload.
    ///
    /// A peer whose hello is signed by this key and carries the same
    /// embedding hash is marked `qr_verified`.
    pub fn expect_peer(&self, public_key: PublicKey, embedding_hash: Digest) {
        lock(&self.expected).insert(public_key, embedding_hash);
    }

    /// Spawn [`Negotiator::run`] on the current runtime.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<Result<()>> {
        tokio::spawn(Arc::clone(self).run())
    }

    /// Process transport events until shut down.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        info!(peer = %self.local_peer_id(), "negotiator started");
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!(peer = %self.local_peer_id(), "negotiator stopped");
                    return Ok(());
                }
                event = self.transport.recv() => self.handle_event(event?).await,
            }
        }
    }

    /// Stop the run loop and resolve every in-flight negotiation to no match.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        lock(&self.pending).clear();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Resolve in-flight negotiations with `peer` to no match.
    pub fn cancel_negotiations(&self, peer: &PeerId) {
        if let Some(token) = lock(&self.peer_tokens).remove(peer) {
            token.cancel();
        }
    }

    /// Handle one transport event. Rejected messages are logged and dropped.
    pub async fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::PeerJoined(peer) => self.on_joined(&peer).await,
            TransportEvent::PeerLeft(peer) => self.on_left(&peer).await,
            TransportEvent::Message { from, message } => {
                let kind = message.kind();
                if let Err(e) = self.handle_message(&from, message).await {
                    warn!(peer = %from, kind, error = %e, "dropped message");
                }
            }
        }
    }

    /// Commit a local profile edit and broadcast the delta.
    ///
    /// Returns `None` when nothing changed. A failed broadcast is logged;
    /// peers recover through catch-up on the next version gap.
    pub async fn update_local_profile(
        &self,
        profile: TwinProfile,
        now: i64,
    ) -> Result<Option<TwinDelta>> {
        let (delta, wire) = {
            let mut local = self.local.write().await;
            let Some(delta) = local.commit_local(profile, now)? else {
                return Ok(None);
            };
            let wire = DeltaWire::seal(&delta, &self.session_key, &self.identity)?;
            (delta, wire)
        };
        self.peers.write().await.mark_delta_shared();

        let version = delta.target_version();
        if let Err(e) = self.transport.broadcast(PeerMessage::Delta(wire)).await {
            warn!(error = %e, version, "delta broadcast failed");
        }
        Ok(Some(delta))
    }

    /// Run one negotiation with a connected peer.
    ///
    /// Sends our interest level and waits for theirs. Resolves to `None`
    /// on timeout, cancellation or when the lower of the two levels is
    /// under the threshold.
    pub async fn negotiate_with(&self, peer: &PeerId) -> Result<Option<NegotiationResult>> {
        if self.is_shut_down() {
            return Err(SyncError::Cancelled);
        }
        let peer_profile = self.connected_profile(peer).await?;
        let ours = {
            let local = self.local.read().await;
            calculate_score(&local.state().profile, &peer_profile)
        };

        let negotiation_id = Uuid::new_v4();
        let signal = InterestSignal {
            negotiation_id,
            interest_level: ours,
        };
        let envelope = EncryptedEnvelope::seal_value(&signal, &self.session_key, &self.identity)?;

        let token = self.token_for(peer);
        if token.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(
            negotiation_id,
            Pending {
                peer: peer.clone(),
                reply: tx,
            },
        );

        debug!(peer = %peer, %negotiation_id, interest = ours, "sending interest");
        let sent = self
            .transport
            .send(
                peer,
                PeerMessage::Interest {
                    negotiation_id,
                    envelope,
                },
            )
            .await;
        if let Err(e) = sent {
            lock(&self.pending).remove(&negotiation_id);
            return Err(e);
        }

        let theirs = tokio::select! {
            reply = rx => reply.ok(),
            _ = tokio::time::sleep(self.config.ack_timeout()) => {
                debug!(peer = %peer, %negotiation_id, "negotiation timed out");
                None
            }
            _ = token.cancelled() => {
                debug!(peer = %peer, %negotiation_id, "negotiation cancelled");
                None
            }
        };
        lock(&self.pending).remove(&negotiation_id);

        let Some(theirs) = theirs else {
            return Ok(None);
        };
        let mutual = ours.min(theirs);
        if mutual < self.config.mutual_interest_threshold {
            debug!(peer = %peer, ours, theirs, "no mutual interest");
            return Ok(None);
        }

        // Deltas may have arrived while we waited.
        let latest = self
            .peers
            .read()
            .await
            .get(peer)
            .and_then(|p| p.state.clone());
        let (twin_id, profile) = match latest {
            Some(state) => (state.twin_id, state.profile),
            None => return Ok(None),
        };
        Ok(Some(self.record_match(peer, twin_id, profile, mutual)))
    }

    async fn handle_message(&self, from: &PeerId, message: PeerMessage) -> Result<()> {
        message.validate_limits()?;
        match message {
            PeerMessage::Hello {
                protocol_version,
                snapshot,
            } => self.on_hello(from, protocol_version, snapshot).await,
            PeerMessage::Delta(wire) => self.on_delta(from, wire).await,
            PeerMessage::Interest {
                negotiation_id,
                envelope,
            } => self.on_interest(from, negotiation_id, envelope).await,
            PeerMessage::Ack {
                negotiation_id,
                envelope,
            } => self.on_ack(from, negotiation_id, envelope).await,
            PeerMessage::CatchUpRequest {
                twin_id,
                have_version,
            } => self.on_catch_up_request(from, twin_id, have_version).await,
            PeerMessage::CatchUp(wire) => self.on_catch_up(from, wire).await,
        }
    }

    async fn on_joined(&self, peer: &PeerId) {
        self.peers.write().await.entry(peer, now_millis());
        debug!(peer = %peer, "peer joined");
        if let Err(e) = self.send_hello(peer).await {
            warn!(peer = %peer, error = %e, "failed to send hello");
        }
    }

    async fn on_left(&self, peer: &PeerId) {
        let evicted = self.peers.write().await.evict(peer);
        self.cancel_negotiations(peer);
        lock(&self.pending).retain(|_, p| p.peer != *peer);

        if evicted.is_some() {
            info!(peer = %peer, "peer disconnected");
            let callbacks = self.callbacks().disconnect.clone();
            for callback in callbacks {
                callback(peer);
            }
        }
    }

    async fn send_hello(&self, peer: &PeerId) -> Result<()> {
        let snapshot = {
            let local = self.local.read().await;
            SnapshotWire::seal(local.state(), &self.session_key, &self.identity)?
        };
        self.transport
            .send(
                peer,
                PeerMessage::Hello {
                    protocol_version: PROTOCOL_VERSION,
                    snapshot,
                },
            )
            .await
    }

    async fn on_hello(&self, from: &PeerId, protocol_version: u8, snapshot: SnapshotWire) -> Result<()> {
        if protocol_version != PROTOCOL_VERSION {
            return Err(SyncError::VersionMismatch {
                local: PROTOCOL_VERSION,
                peer: protocol_version,
            });
        }
        let preview = snapshot.open(&self.session_key)?;
        let announced = snapshot
            .embedding_hash
            .unwrap_or_else(|| hash_embedding(&[]));
        let qr_verified = lock(&self.expected)
            .get(&snapshot.public_key)
            .is_some_and(|expected| *expected == announced);

        let now = now_millis();
        let (outcome, have_version) = {
            let mut peers = self.peers.write().await;
            let peer = peers.entry(from, now);
            let outcome = peer.on_hello(
                snapshot.public_key,
                snapshot.twin_id.clone(),
                snapshot.version,
                preview,
                snapshot.embedding_hash,
                now,
            )?;
            if qr_verified {
                peer.qr_verified = true;
            }
            let have_version = peer.state.as_ref().map_or(0, |s| s.version);
            (outcome, have_version)
        };

        if outcome.first {
            info!(peer = %from, twin = %snapshot.twin_id, qr_verified, "peer connected");
            let callbacks = self.callbacks().connect.clone();
            for callback in callbacks {
                callback(from);
            }
        }

        if outcome.needs_catch_up || (outcome.first && self.config.request_catch_up_on_hello) {
            self.request_catch_up(from, snapshot.twin_id, have_version).await?;
        }
        Ok(())
    }

    async fn on_delta(&self, from: &PeerId, wire: DeltaWire) -> Result<()> {
        if wire.target_version != wire.base_version.saturating_add(1) {
            return Err(SyncError::InvalidMessage(
                "delta must advance exactly one version".into(),
            ));
        }
        self.check_signer(from, &wire.public_key).await?;
        let delta = wire.open(&self.session_key)?;

        let outcome = {
            let mut peers = self.peers.write().await;
            peers.connected_mut(from)?.fold_delta(&delta, now_millis())?
        };
        match outcome {
            FoldOutcome::Applied { version } => {
                debug!(peer = %from, version, "applied peer delta");
            }
            FoldOutcome::Duplicate | FoldOutcome::Stale => {
                debug!(peer = %from, key = %wire.transport_key(), "ignored delta");
            }
            FoldOutcome::NeedsCatchUp { have_version } => {
                debug!(peer = %from, have_version, base = wire.base_version, "version gap");
                self.request_catch_up(from, delta.twin_id, have_version).await?;
            }
        }
        Ok(())
    }

    async fn on_interest(
        &self,
        from: &PeerId,
        negotiation_id: Uuid,
        envelope: EncryptedEnvelope,
    ) -> Result<()> {
        self.check_signer(from, &envelope.sender_public_key).await?;
        let signal: InterestSignal = envelope.open_value(&self.session_key)?;
        check_signal(&signal, negotiation_id)?;

        let state = self
            .peers
            .read()
            .await
            .connected(from)?
            .state
            .clone()
            .ok_or_else(|| SyncError::PeerNotConnected(from.to_string()))?;
        let ours = {
            let local = self.local.read().await;
            calculate_score(&local.state().profile, &state.profile)
        };

        let reply = InterestSignal {
            negotiation_id,
            interest_level: ours,
        };
        let envelope = EncryptedEnvelope::seal_value(&reply, &self.session_key, &self.identity)?;
        self.transport
            .send(
                from,
                PeerMessage::Ack {
                    negotiation_id,
                    envelope,
                },
            )
            .await?;

        let mutual = ours.min(signal.interest_level);
        debug!(peer = %from, %negotiation_id, ours, theirs = signal.interest_level, "answered interest");
        if mutual >= self.config.mutual_interest_threshold {
            self.record_match(from, state.twin_id, state.profile, mutual);
        }
        Ok(())
    }

    async fn on_ack(
        &self,
        from: &PeerId,
        negotiation_id: Uuid,
        envelope: EncryptedEnvelope,
    ) -> Result<()> {
        self.check_signer(from, &envelope.sender_public_key).await?;
        let signal: InterestSignal = envelope.open_value(&self.session_key)?;
        check_signal(&signal, negotiation_id)?;

        let pending = {
            let mut pending = lock(&self.pending);
            match pending.get(&negotiation_id) {
                Some(p) if p.peer == *from => pending.remove(&negotiation_id),
                _ => None,
            }
        };
        match pending {
            Some(p) => {
                let _ = p.reply.send(signal.interest_level);
            }
            None => debug!(peer = %from, %negotiation_id, "ack for no pending negotiation"),
        }
        Ok(())
    }

    async fn on_catch_up_request(
        &self,
        from: &PeerId,
        twin_id: TwinId,
        have_version: u64,
    ) -> Result<()> {
        let delta_shared = self.peers.read().await.connected(from)?.delta_shared;
        let wire = {
            let local = self.local.read().await;
            let state = local.state();
            if twin_id != state.twin_id {
                return Err(SyncError::InvalidMessage(format!(
                    "catch-up requested for {}",
                    twin_id
                )));
            }
            let behind = delta_shared && have_version < state.version;
            if !self.config.request_catch_up_on_hello && !behind {
                return Err(SyncError::InvalidMessage(
                    "catch-up without a version gap".into(),
                ));
            }
            let delta = local.catch_up_for(have_version.min(state.version));
            DeltaWire::seal_with_target(&delta, state.version, &self.session_key, &self.identity)?
        };
        debug!(peer = %from, have_version, target = wire.target_version, "sending catch-up");
        self.transport.send(from, PeerMessage::CatchUp(wire)).await
    }

    async fn on_catch_up(&self, from: &PeerId, wire: DeltaWire) -> Result<()> {
        self.check_signer(from, &wire.public_key).await?;
        let delta = wire.open(&self.session_key)?;
        let applied = {
            let mut peers = self.peers.write().await;
            peers
                .connected_mut(from)?
                .apply_catch_up(&delta, wire.target_version, now_millis())?
        };
        debug!(peer = %from, target = wire.target_version, applied, "caught up");
        Ok(())
    }

    async fn request_catch_up(&self, peer: &PeerId, twin_id: TwinId, have_version: u64) -> Result<()> {
        self.transport
            .send(
                peer,
                PeerMessage::CatchUpRequest {
                    twin_id,
                    have_version,
                },
            )
            .await
    }

    async fn check_signer(&self, from: &PeerId, key: &PublicKey) -> Result<()> {
        self.peers.read().await.connected(from)?.check_signer(key)
    }

    async fn connected_profile(&self, peer: &PeerId) -> Result<TwinProfile> {
        self.peers
            .read()
            .await
            .connected(peer)?
            .profile()
            .cloned()
            .ok_or_else(|| SyncError::PeerNotConnected(peer.to_string()))
    }

    fn record_match(
        &self,
        peer: &PeerId,
        peer_twin_id: TwinId,
        peer_profile: TwinProfile,
        mutual_interest: u8,
    ) -> NegotiationResult {
        let result = NegotiationResult {
            peer_id: peer.clone(),
            peer_twin_id,
            peer_profile,
            mutual_interest,
            negotiated_at: now_millis(),
        };
        info!(peer = %peer, twin = %result.peer_twin_id, mutual_interest, "mutual match");
        lock(&self.matches).insert(peer.clone(), result.clone());

        let callbacks = self.callbacks().matched.clone();
        for callback in callbacks {
            callback(&result);
        }
        result
    }

    fn token_for(&self, peer: &PeerId) -> CancellationToken {
        lock(&self.peer_tokens)
            .entry(peer.clone())
            .or_insert_with(|| self.shutdown.child_token())
            .clone()
    }

    fn callbacks(&self) -> std::sync::RwLockReadGuard<'_, Callbacks> {
        self.callbacks.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn callbacks_mut(&self) -> std::sync::RwLockWriteGuard<'_, Callbacks> {
        self.callbacks.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn check_signal(signal: &InterestSignal, negotiation_id: Uuid) -> Result<()> {
    if signal.negotiation_id != negotiation_id {
        return Err(SyncError::InvalidMessage(
            "interest signal bound to another negotiation".into(),
        ));
    }
    if signal.interest_level > 100 {
        return Err(SyncError::InvalidMessage("interest level out of range".into()));
    }
    Ok(())
}
