//! What this node knows about the other twins in the room.
//!
//! A peer's signing key is pinned by its first valid hello. Every later
//! message from that peer must verify under the pinned key.

use std::collections::{HashMap, HashSet, VecDeque};

use uuid::Uuid;

use twinmesh_core::{
    apply_delta, validate_delta, Digest, PublicKey, TwinDelta, TwinId, TwinProfile, TwinState,
    ValidationError,
};

use crate::error::{Result, SyncError};
use crate::messages::PeerId;

/// Connection lifecycle of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Present in the room, no valid hello yet.
    Connecting,
    /// Hello verified, key pinned.
    Connected,
    /// Left the room.
    Disconnected,
}

/// Result of folding a hello into a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HelloOutcome {
    /// This hello moved the peer to [`ConnectionState::Connected`].
    pub first: bool,
    /// Our cached state is behind the version the peer announced.
    pub needs_catch_up: bool,
}

/// Result of folding a delta into a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FoldOutcome {
    Applied { version: u64 },
    /// Already applied this delta id.
    Duplicate,
    /// Based on a version we are already past.
    Stale,
    /// Based on a version we have not reached yet.
    NeedsCatchUp { have_version: u64 },
}

/// A remote twin as seen from this node.
#[derive(Debug, Clone)]
pub struct PeerTwin {
    pub peer_id: PeerId,
    pub public_key: Option<PublicKey>,
    pub state: Option<TwinState>,
    pub embedding_hash: Option<Digest>,
    pub connection_state: ConnectionState,
    /// The pinned key matches a scanned QR payload for this twin.
    pub qr_verified: bool,
    /// Unix milliseconds.
    pub last_seen: i64,
    /// One of our deltas was broadcast while this peer was connected.
    pub delta_shared: bool,
    applied: VecDeque<Uuid>,
    applied_set: HashSet<Uuid>,
    max_history: usize,
}

impl PeerTwin {
    pub fn new(peer_id: PeerId, now: i64, max_history: usize) -> Self {
        Self {
            peer_id,
            public_key: None,
            state: None,
            embedding_hash: None,
            connection_state: ConnectionState::Connecting,
            qr_verified: false,
            last_seen: now,
            delta_shared: false,
            applied: VecDeque::new(),
            applied_set: HashSet::new(),
            max_history: max_history.max(1),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state == ConnectionState::Connected
    }

    pub fn twin_id(&self) -> Option<&TwinId> {
        self.state.as_ref().map(|s| &s.twin_id)
    }

    pub fn profile(&self) -> Option<&TwinProfile> {
        self.state.as_ref().map(|s| &s.profile)
    }

    /// Check `key` against the pinned key, if any.
    pub fn check_signer(&self, key: &PublicKey) -> Result<()> {
        match &self.public_key {
            Some(pinned) if pinned == key => Ok(()),
            Some(_) => Err(SyncError::SignerMismatch(self.peer_id.to_string())),
            None => Err(SyncError::PeerNotConnected(self.peer_id.to_string())),
        }
    }

    /// Fold a verified hello.
    ///
    /// The first hello pins the key and seeds the cached state with the
    /// preview. Later hellos must come from the same key and twin.
    pub fn on_hello(
        &mut self,
        public_key: PublicKey,
        twin_id: TwinId,
        version: u64,
        preview: TwinProfile,
        embedding_hash: Option<Digest>,
        now: i64,
    ) -> Result<HelloOutcome> {
        if let Some(pinned) = &self.public_key {
            if *pinned != public_key {
                return Err(SyncError::SignerMismatch(self.peer_id.to_string()));
            }
        }

        self.last_seen = now;
        self.embedding_hash = embedding_hash;

        if let Some(state) = &self.state {
            if state.twin_id != twin_id {
                return Err(ValidationError::TwinMismatch {
                    expected: state.twin_id.clone(),
                    got: twin_id,
                }
                .into());
            }
            let needs_catch_up = version > state.version;
            let first = self.connection_state != ConnectionState::Connected;
            self.connection_state = ConnectionState::Connected;
            return Ok(HelloOutcome {
                first,
                needs_catch_up,
            });
        }

        self.public_key = Some(public_key);
        self.state = Some(TwinState {
            twin_id,
            version,
            profile: preview,
            last_modified: now,
        });
        self.connection_state = ConnectionState::Connected;
        Ok(HelloOutcome {
            first: true,
            needs_catch_up: false,
        })
    }

    /// Validate and apply an ordinary delta from this peer.
    ///
    /// A delta whose result would break the profile limits is rejected and
    /// the cached state is kept.
    pub fn fold_delta(&mut self, delta: &TwinDelta, now: i64) -> Result<FoldOutcome> {
        let Some(state) = &self.state else {
            return Err(SyncError::PeerNotConnected(self.peer_id.to_string()));
        };
        if self.applied_set.contains(&delta.id) {
            return Ok(FoldOutcome::Duplicate);
        }

        match validate_delta(state, delta) {
            Ok(()) => {}
            Err(ValidationError::VersionMismatch { expected, got }) => {
                return Ok(if got < expected {
                    FoldOutcome::Stale
                } else {
                    FoldOutcome::NeedsCatchUp {
                        have_version: expected,
                    }
                });
            }
            Err(e) => return Err(e.into()),
        }

        let next = apply_delta(state, delta);
        next.profile.check_limits()?;
        let version = next.version;
        self.state = Some(next);
        self.last_seen = now;
        self.remember(delta.id);
        Ok(FoldOutcome::Applied { version })
    }

    /// Replace the cached state from a catch-up delta.
    ///
    /// Returns `false` when the reply is older than what we already hold.
    pub fn apply_catch_up(
        &mut self,
        delta: &TwinDelta,
        target_version: u64,
        now: i64,
    ) -> Result<bool> {
        let Some(state) = &self.state else {
            return Err(SyncError::PeerNotConnected(self.peer_id.to_string()));
        };
        if state.twin_id != delta.twin_id {
            return Err(ValidationError::TwinMismatch {
                expected: state.twin_id.clone(),
                got: delta.twin_id.clone(),
            }
            .into());
        }
        if target_version < state.version {
            return Ok(false);
        }

        let baseline = TwinState::baseline(delta.twin_id.clone(), delta.base_version);
        let mut next = apply_delta(&baseline, delta);
        next.version = target_version;
        next.profile.check_limits()?;
        self.state = Some(next);
        self.last_seen = now;
        self.remember(delta.id);
        Ok(true)
    }

    /// Whether a delta id has been applied recently.
    pub fn has_applied(&self, id: &Uuid) -> bool {
        self.applied_set.contains(id)
    }

    fn remember(&mut self, id: Uuid) {
        if self.applied_set.insert(id) {
            self.applied.push_back(id);
        }
        while self.applied.len() > self.max_history {
            if let Some(old) = self.applied.pop_front() {
                self.applied_set.remove(&old);
            }
        }
    }
}

/// Peers of one room, keyed by transport id.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: HashMap<PeerId, PeerTwin>,
    max_history: usize,
}

impl PeerRegistry {
    pub fn new(max_history: usize) -> Self {
        Self {
            peers: HashMap::new(),
            max_history,
        }
    }

    /// Get a peer, creating it in [`ConnectionState::Connecting`] if new.
    pub fn entry(&mut self, peer_id: &PeerId, now: i64) -> &mut PeerTwin {
        let max_history = self.max_history;
        self.peers
            .entry(peer_id.clone())
            .or_insert_with(|| PeerTwin::new(peer_id.clone(), now, max_history))
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<&PeerTwin> {
        self.peers.get(peer_id)
    }

    pub fn get_mut(&mut self, peer_id: &PeerId) -> Option<&mut PeerTwin> {
        self.peers.get_mut(peer_id)
    }

    /// A connected peer, or [`SyncError::PeerNotConnected`].
    pub fn connected(&self, peer_id: &PeerId) -> Result<&PeerTwin> {
        self.peers
            .get(peer_id)
            .filter(|p| p.is_connected())
            .ok_or_else(|| SyncError::PeerNotConnected(peer_id.to_string()))
    }

    pub fn connected_mut(&mut self, peer_id: &PeerId) -> Result<&mut PeerTwin> {
        self.peers
            .get_mut(peer_id)
            .filter(|p| p.is_connected())
            .ok_or_else(|| SyncError::PeerNotConnected(peer_id.to_string()))
    }

    /// Drop a peer entirely. Returns it marked disconnected.
    pub fn evict(&mut self, peer_id: &PeerId) -> Option<PeerTwin> {
        self.peers.remove(peer_id).map(|mut peer| {
            peer.connection_state = ConnectionState::Disconnected;
            peer
        })
    }

    /// Mark every connected peer as having been sent one of our deltas.
    pub fn mark_delta_shared(&mut self) {
        self.peers
            .values_mut()
            .filter(|p| p.is_connected())
            .for_each(|p| p.delta_shared = true);
    }

    /// States of all connected peers.
    pub fn connected_states(&self) -> Vec<TwinState> {
        self.peers
            .values()
            .filter(|p| p.is_connected())
            .filter_map(|p| p.state.clone())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerTwin> {
        self.peers.values()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use twinmesh_core::{compute_delta_at, DeltaSync, Keypair};

    fn owner() -> DeltaSync {
        DeltaSync::new(TwinState::new(
            TwinId::new("twin-b"),
            TwinProfile::new("Bo", "Designer")
                .with_skills(["Figma"])
                .with_interests(["Music"]),
            1_000,
        ))
    }

    fn connected_peer(owner: &DeltaSync, key: PublicKey) -> PeerTwin {
        let mut peer = PeerTwin::new(PeerId::new("b"), 0, 4);
        let s = owner.state();
        let outcome = peer
            .on_hello(key, s.twin_id.clone(), s.version, s.profile.preview(), None, 10)
            .unwrap();
        assert!(outcome.first);
        peer
    }

    #[test]
    fn test_hello_pins_key_and_seeds_preview() {
        let key = Keypair::generate().public_key();
        let peer = connected_peer(&owner(), key);

        assert!(peer.is_connected());
        assert_eq!(peer.public_key, Some(key));
        assert_eq!(peer.profile().unwrap(), &TwinProfile::new("Bo", "Designer"));
        assert!(peer.check_signer(&key).is_ok());
    }

    #[test]
    fn test_hello_from_other_key_rejected() {
        let owner = owner();
        let mut peer = connected_peer(&owner, Keypair::generate().public_key());
        let s = owner.state();
        let err = peer
            .on_hello(
                Keypair::generate().public_key(),
                s.twin_id.clone(),
                s.version,
                s.profile.preview(),
                None,
                20,
            )
            .unwrap_err();
        assert!(matches!(err, SyncError::SignerMismatch(_)));
        assert!(peer
            .check_signer(&Keypair::generate().public_key())
            .is_err());
    }

    #[test]
    fn test_fold_delta_advances_and_dedups() {
        let mut owner = owner();
        let mut peer = connected_peer(&owner, Keypair::generate().public_key());

        let mut next = owner.state().profile.clone();
        next.skills.insert("Rust".into());
        let delta = owner.commit_local(next, 2_000).unwrap().unwrap();

        assert_eq!(
            peer.fold_delta(&delta, 30).unwrap(),
            FoldOutcome::Applied { version: 1 }
        );
        assert!(peer.has_applied(&delta.id));
        assert_eq!(peer.fold_delta(&delta, 31).unwrap(), FoldOutcome::Duplicate);
        assert_eq!(peer.state.as_ref().unwrap().version, 1);
    }

    #[test]
    fn test_fold_delta_detects_gap_and_stale() {
        let mut owner = owner();
        let mut peer = connected_peer(&owner, Keypair::generate().public_key());

        let mut p1 = owner.state().profile.clone();
        p1.skills.insert("Rust".into());
        let d1 = owner.commit_local(p1.clone(), 2_000).unwrap().unwrap();
        let mut p2 = p1;
        p2.skills.insert("Go".into());
        let d2 = owner.commit_local(p2, 3_000).unwrap().unwrap();

        assert_eq!(
            peer.fold_delta(&d2, 40).unwrap(),
            FoldOutcome::NeedsCatchUp { have_version: 0 }
        );
        peer.fold_delta(&d1, 41).unwrap();
        peer.fold_delta(&d2, 42).unwrap();

        let old = compute_delta_at(
            &TwinState::baseline(TwinId::new("twin-b"), 0),
            &TwinState::baseline(TwinId::new("twin-b"), 0)
                .with_profile(TwinProfile::new("x", "")),
            50,
        )
        .unwrap();
        assert_eq!(peer.fold_delta(&old, 43).unwrap(), FoldOutcome::Stale);
    }

    #[test]
    fn test_fold_delta_keeps_state_when_limits_overflow() {
        let mut owner = owner();
        let mut peer = connected_peer(&owner, Keypair::generate().public_key());
        let with_skills = |prefix: &str, profile: &TwinProfile| {
            let mut next = profile.clone();
            next.skills.extend((0..200).map(|i| format!("{}{}", prefix, i)));
            next
        };

        let d1 = owner
            .commit_local(with_skills("a", &owner.state().profile), 2_000)
            .unwrap()
            .unwrap();
        assert_eq!(
            peer.fold_delta(&d1, 30).unwrap(),
            FoldOutcome::Applied { version: 1 }
        );

        // The second batch fits a delta but not the accumulated profile.
        let mut d2 = d1.clone();
        d2.id = Uuid::new_v4();
        d2.base_version = 1;
        d2.changes = vec![twinmesh_core::TwinChange::SkillsAdded(
            (0..200).map(|i| format!("b{}", i)).collect(),
        )];
        assert!(d2.check_limits().is_ok());

        let err = peer.fold_delta(&d2, 31).unwrap_err();
        assert!(matches!(
            err,
            SyncError::Validation(ValidationError::LimitExceeded(_))
        ));
        let state = peer.state.as_ref().unwrap();
        assert_eq!(state.version, 1);
        assert_eq!(state.profile.skills.len(), 201);
        assert!(!peer.has_applied(&d2.id));
    }

    #[test]
    fn test_mark_delta_shared_only_touches_connected() {
        let owner = owner();
        let mut registry = PeerRegistry::new(4);
        let s = owner.state();
        registry
            .entry(&PeerId::new("b"), 0)
            .on_hello(
                Keypair::generate().public_key(),
                s.twin_id.clone(),
                s.version,
                s.profile.preview(),
                None,
                10,
            )
            .unwrap();
        registry.entry(&PeerId::new("c"), 0);

        registry.mark_delta_shared();
        assert!(registry.get(&PeerId::new("b")).unwrap().delta_shared);
        assert!(!registry.get(&PeerId::new("c")).unwrap().delta_shared);
    }

    #[test]
    fn test_fold_delta_for_other_twin_rejected() {
        let owner = owner();
        let mut peer = connected_peer(&owner, Keypair::generate().public_key());

        let other = TwinState::new(TwinId::new("twin-z"), TwinProfile::default(), 0);
        let delta =
            compute_delta_at(&other, &other.with_profile(TwinProfile::new("z", "")), 5).unwrap();
        assert!(matches!(
            peer.fold_delta(&delta, 1),
            Err(SyncError::Validation(ValidationError::TwinMismatch { .. }))
        ));
    }

    #[test]
    fn test_catch_up_replaces_state() {
        let mut owner = owner();
        let mut peer = connected_peer(&owner, Keypair::generate().public_key());

        let mut next = owner.state().profile.clone();
        next.skills.insert("Rust".into());
        owner.commit_local(next, 2_000).unwrap();

        let catch_up = owner.catch_up_for(0);
        assert!(peer
            .apply_catch_up(&catch_up, owner.state().version, 60)
            .unwrap());

        let cached = peer.state.as_ref().unwrap();
        assert_eq!(cached.version, owner.state().version);
        assert_eq!(cached.profile, owner.state().profile);

        // An older reply is ignored.
        assert!(!peer.apply_catch_up(&catch_up, 0, 61).unwrap());
    }

    #[test]
    fn test_history_is_bounded() {
        let mut peer = PeerTwin::new(PeerId::new("p"), 0, 2);
        let ids: Vec<Uuid> = (0..3).map(Uuid::from_u128).collect();
        for id in &ids {
            peer.remember(*id);
        }
        assert!(!peer.has_applied(&ids[0]));
        assert!(peer.has_applied(&ids[1]));
        assert!(peer.has_applied(&ids[2]));
    }

    #[test]
    fn test_registry_evict() {
        let mut registry = PeerRegistry::new(16);
        let id = PeerId::new("p");
        registry.entry(&id, 0);
        assert_eq!(registry.len(), 1);
        assert!(registry.connected(&id).is_err());

        let evicted = registry.evict(&id).unwrap();
        assert_eq!(evicted.connection_state, ConnectionState::Disconnected);
        assert!(registry.is_empty());
        assert!(registry.evict(&id).is_none());
    }
}
