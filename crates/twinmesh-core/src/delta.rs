//! Delta computation, application, validation and merge.
//!
//! A [`TwinDelta`] is the minimal typed difference between two snapshots of
//! the same twin. All functions here are pure; [`DeltaSync`] is the only
//! stateful wrapper and gates every application through [`validate_delta`].

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::ValidationError;
use crate::types::{check_embedding, check_set, limits, now_millis, TwinId, TwinProfile, TwinState};

/// One typed change to a profile.
///
/// Variant order is the canonical emission order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum TwinChange {
    SkillsAdded(BTreeSet<String>),
    SkillsRemoved(BTreeSet<String>),
    InterestsAdded(BTreeSet<String>),
    InterestsRemoved(BTreeSet<String>),
    HeadlineChanged(String),
    NameChanged(String),
    EmbeddingUpdated(Vec<f32>),
}

impl TwinChange {
    fn check_limits(&self) -> Result<(), ValidationError> {
        match self {
            TwinChange::SkillsAdded(s) | TwinChange::SkillsRemoved(s) => check_set(s, "skills"),
            TwinChange::InterestsAdded(s) | TwinChange::InterestsRemoved(s) => {
                check_set(s, "interests")
            }
            TwinChange::HeadlineChanged(t) | TwinChange::NameChanged(t) => {
                if t.chars().count() > limits::MAX_TEXT_LEN {
                    Err(ValidationError::LimitExceeded("text too long"))
                } else {
                    Ok(())
                }
            }
            TwinChange::EmbeddingUpdated(e) => check_embedding(e),
        }
    }
}

/// A set of changes against one base version of a twin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TwinDelta {
    pub id: Uuid,
    pub twin_id: TwinId,
    pub base_version: u64,
    pub changes: Vec<TwinChange>,
    /// Unix milliseconds, used for last-writer-wins.
    pub timestamp: i64,
}

impl TwinDelta {
    /// The version a state reaches after applying this delta.
    pub fn target_version(&self) -> u64 {
        self.base_version.saturating_add(1)
    }

    /// Transport key: `"{twin_id}:{base_version}:{timestamp}"`.
    pub fn transport_key(&self) -> String {
        format!("{}:{}:{}", self.twin_id, self.base_version, self.timestamp)
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Check every change against the size limits.
    pub fn check_limits(&self) -> Result<(), ValidationError> {
        // One change per variant at most.
        if self.changes.len() > 7 {
            return Err(ValidationError::LimitExceeded("too many changes"));
        }
        self.changes.iter().try_for_each(TwinChange::check_limits)
    }
}

/// Compute the delta from `prev` to `next`, stamped with the current time.
pub fn compute_delta(prev: &TwinState, next: &TwinState) -> Option<TwinDelta> {
    compute_delta_at(prev, next, now_millis())
}

/// Compute the delta from `prev` to `next` with an explicit timestamp.
///
/// Returns `None` when the profiles do not differ.
pub fn compute_delta_at(prev: &TwinState, next: &TwinState, timestamp: i64) -> Option<TwinDelta> {
    let changes = diff_profiles(&prev.profile, &next.profile);
    if changes.is_empty() {
        return None;
    }
    Some(TwinDelta {
        id: Uuid::new_v4(),
        twin_id: prev.twin_id.clone(),
        base_version: prev.version,
        changes,
        timestamp,
    })
}

/// The changes that turn `prev` into `next`, in canonical order.
///
/// A removed embedding is not a change: only a present, different
/// embedding is emitted.
pub fn diff_profiles(prev: &TwinProfile, next: &TwinProfile) -> Vec<TwinChange> {
    let mut changes = Vec::new();

    let skills_added = difference(&next.skills, &prev.skills);
    if !skills_added.is_empty() {
        changes.push(TwinChange::SkillsAdded(skills_added));
    }
    let skills_removed = difference(&prev.skills, &next.skills);
    if !skills_removed.is_empty() {
        changes.push(TwinChange::SkillsRemoved(skills_removed));
    }
    let interests_added = difference(&next.interests, &prev.interests);
    if !interests_added.is_empty() {
        changes.push(TwinChange::InterestsAdded(interests_added));
    }
    let interests_removed = difference(&prev.interests, &next.interests);
    if !interests_removed.is_empty() {
        changes.push(TwinChange::InterestsRemoved(interests_removed));
    }
    if prev.headline != next.headline {
        changes.push(TwinChange::HeadlineChanged(next.headline.clone()));
    }
    if prev.name != next.name {
        changes.push(TwinChange::NameChanged(next.name.clone()));
    }
    if let Some(embedding) = &next.embedding {
        let unchanged = prev
            .embedding
            .as_deref()
            .is_some_and(|old| same_embedding(old, embedding));
        if !unchanged {
            changes.push(TwinChange::EmbeddingUpdated(embedding.clone()));
        }
    }

    changes
}

fn difference(a: &BTreeSet<String>, b: &BTreeSet<String>) -> BTreeSet<String> {
    a.difference(b).cloned().collect()
}

/// Bitwise comparison, so a NaN component compares equal to itself.
fn same_embedding(a: &[f32], b: &[f32]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.to_bits() == y.to_bits())
}

/// Apply a delta to a state.
///
/// Does not check `base_version`; callers gate with [`validate_delta`].
/// Always advances the version by one and sets `last_modified` to the
/// delta's timestamp.
pub fn apply_delta(state: &TwinState, delta: &TwinDelta) -> TwinState {
    let mut next = state.clone();
    for change in &delta.changes {
        let profile = &mut next.profile;
        match change {
            TwinChange::SkillsAdded(s) => profile.skills.extend(s.iter().cloned()),
            TwinChange::SkillsRemoved(s) => profile.skills.retain(|x| !s.contains(x)),
            TwinChange::InterestsAdded(s) => profile.interests.extend(s.iter().cloned()),
            TwinChange::InterestsRemoved(s) => profile.interests.retain(|x| !s.contains(x)),
            TwinChange::HeadlineChanged(h) => profile.headline = h.clone(),
            TwinChange::NameChanged(n) => profile.name = n.clone(),
            TwinChange::EmbeddingUpdated(e) => profile.embedding = Some(e.clone()),
        }
    }
    next.version = state.version.saturating_add(1);
    next.last_modified = delta.timestamp;
    next
}

/// Check a delta against a state.
pub fn validate_delta(state: &TwinState, delta: &TwinDelta) -> Result<(), ValidationError> {
    if delta.twin_id != state.twin_id {
        return Err(ValidationError::TwinMismatch {
            expected: state.twin_id.clone(),
            got: delta.twin_id.clone(),
        });
    }
    if delta.base_version != state.version {
        return Err(ValidationError::VersionMismatch {
            expected: state.version,
            got: delta.base_version,
        });
    }
    if delta.is_empty() {
        return Err(ValidationError::EmptyDelta);
    }
    delta.check_limits()
}

/// Whether a delta may be applied to a state.
pub fn is_valid_delta(state: &TwinState, delta: &TwinDelta) -> bool {
    validate_delta(state, delta).is_ok()
}

/// Merge two concurrent deltas on the same twin and base version.
///
/// Set changes union. Name, headline and embedding are last-writer-wins on
/// `timestamp`, ties going to the greater delta id. The result is the same
/// whichever order the arguments come in.
pub fn merge_delta(d1: &TwinDelta, d2: &TwinDelta) -> Result<TwinDelta, ValidationError> {
    if d1.twin_id != d2.twin_id {
        return Err(ValidationError::TwinMismatch {
            expected: d1.twin_id.clone(),
            got: d2.twin_id.clone(),
        });
    }
    if d1.base_version != d2.base_version {
        return Err(ValidationError::VersionMismatch {
            expected: d1.base_version,
            got: d2.base_version,
        });
    }

    let (older, newer) = if (d1.timestamp, d1.id) <= (d2.timestamp, d2.id) {
        (d1, d2)
    } else {
        (d2, d1)
    };

    let mut acc = MergeAcc::default();
    acc.absorb(older);
    acc.absorb(newer);

    Ok(TwinDelta {
        id: merged_id(d1.id, d2.id),
        twin_id: d1.twin_id.clone(),
        base_version: d1.base_version,
        changes: acc.into_changes(),
        timestamp: d1.timestamp.max(d2.timestamp),
    })
}

#[derive(Default)]
struct MergeAcc {
    skills_added: BTreeSet<String>,
    skills_removed: BTreeSet<String>,
    interests_added: BTreeSet<String>,
    interests_removed: BTreeSet<String>,
    headline: Option<String>,
    name: Option<String>,
    embedding: Option<Vec<f32>>,
}

impl MergeAcc {
    /// Fold in one delta; later calls overwrite scalars.
    fn absorb(&mut self, delta: &TwinDelta) {
        for change in &delta.changes {
            match change {
                TwinChange::SkillsAdded(s) => self.skills_added.extend(s.iter().cloned()),
                TwinChange::SkillsRemoved(s) => self.skills_removed.extend(s.iter().cloned()),
                TwinChange::InterestsAdded(s) => self.interests_added.extend(s.iter().cloned()),
                TwinChange::InterestsRemoved(s) => {
                    self.interests_removed.extend(s.iter().cloned())
                }
                TwinChange::HeadlineChanged(h) => self.headline = Some(h.clone()),
                TwinChange::NameChanged(n) => self.name = Some(n.clone()),
                TwinChange::EmbeddingUpdated(e) => self.embedding = Some(e.clone()),
            }
        }
    }

    fn into_changes(self) -> Vec<TwinChange> {
        let mut changes = Vec::new();
        if !self.skills_added.is_empty() {
            changes.push(TwinChange::SkillsAdded(self.skills_added));
        }
        if !self.skills_removed.is_empty() {
            changes.push(TwinChange::SkillsRemoved(self.skills_removed));
        }
        if !self.interests_added.is_empty() {
            changes.push(TwinChange::InterestsAdded(self.interests_added));
        }
        if !self.interests_removed.is_empty() {
            changes.push(TwinChange::InterestsRemoved(self.interests_removed));
        }
        if let Some(h) = self.headline {
            changes.push(TwinChange::HeadlineChanged(h));
        }
        if let Some(n) = self.name {
            changes.push(TwinChange::NameChanged(n));
        }
        if let Some(e) = self.embedding {
            changes.push(TwinChange::EmbeddingUpdated(e));
        }
        changes
    }
}

/// Deterministic id for a merge of two deltas, independent of argument order.
fn merged_id(a: Uuid, b: Uuid) -> Uuid {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    let mut hasher = blake3::Hasher::new_derive_key("twinmesh-v1-merged-delta-id");
    hasher.update(lo.as_bytes());
    hasher.update(hi.as_bytes());
    let digest = hasher.finalize();

    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest.as_bytes()[..16]);
    uuid::Builder::from_random_bytes(bytes).into_uuid()
}

/// Owner of a local twin state.
///
/// Every mutation either validates an inbound delta or derives one from a
/// local edit, so the version advances by exactly one per change.
#[derive(Debug, Clone)]
pub struct DeltaSync {
    state: TwinState,
}

impl DeltaSync {
    pub fn new(state: TwinState) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &TwinState {
        &self.state
    }

    pub fn into_state(self) -> TwinState {
        self.state
    }

    /// Validate then apply an inbound delta.
    ///
    /// The resulting profile must stay within limits; otherwise the state is
    /// left untouched.
    pub fn ingest(&mut self, delta: &TwinDelta) -> Result<&TwinState, ValidationError> {
        validate_delta(&self.state, delta)?;
        let next = apply_delta(&self.state, delta);
        next.profile.check_limits()?;
        self.state = next;
        debug!(twin = %self.state.twin_id, version = self.state.version, "ingested delta");
        Ok(&self.state)
    }

    /// Record a local edit.
    ///
    /// Returns the delta to broadcast, or `None` if nothing changed.
    pub fn commit_local(
        &mut self,
        next: TwinProfile,
        now: i64,
    ) -> Result<Option<TwinDelta>, ValidationError> {
        next.check_limits()?;
        let target = self.state.with_profile(next);
        let Some(delta) = compute_delta_at(&self.state, &target, now) else {
            return Ok(None);
        };
        self.state = apply_delta(&self.state, &delta);
        debug!(
            twin = %self.state.twin_id,
            version = self.state.version,
            changes = delta.changes.len(),
            "committed local edit"
        );
        Ok(Some(delta))
    }

    /// A delta that brings a peer at `known_version` to the current state.
    ///
    /// It is computed against an empty baseline, so it restates every field.
    /// The receiver resets to that baseline before applying and then adopts
    /// the current version. The change list is empty only when the profile
    /// itself is empty.
    pub fn catch_up_for(&self, known_version: u64) -> TwinDelta {
        let baseline = TwinState::baseline(self.state.twin_id.clone(), known_version);
        TwinDelta {
            id: Uuid::new_v4(),
            twin_id: self.state.twin_id.clone(),
            base_version: known_version,
            changes: diff_profiles(&baseline.profile, &self.state.profile),
            timestamp: self.state.last_modified,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(profile: TwinProfile) -> TwinState {
        TwinState::new(TwinId::new("twin-a"), profile, 1_000)
    }

    fn delta_with(ts: i64, id: u128, changes: Vec<TwinChange>) -> TwinDelta {
        TwinDelta {
            id: Uuid::from_u128(id),
            twin_id: TwinId::new("twin-a"),
            base_version: 0,
            changes,
            timestamp: ts,
        }
    }

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_identical_states_yield_no_delta() {
        let s = state(TwinProfile::new("Ada", "Engineer").with_skills(["Rust"]));
        assert!(compute_delta(&s, &s).is_none());
    }

    #[test]
    fn test_scenario_delta_is_exact() {
        let a = state(
            TwinProfile::new("Ada", "Engineer")
                .with_skills(["TypeScript"])
                .with_interests(["AI"]),
        );
        let b = a.with_profile(
            TwinProfile::new("Ada", "Engineer")
                .with_skills(["TypeScript", "React", "Node.js"])
                .with_interests(["AI", "Music"]),
        );

        let delta = compute_delta_at(&a, &b, 2_000).unwrap();
        assert_eq!(
            delta.changes,
            vec![
                TwinChange::SkillsAdded(set(&["React", "Node.js"])),
                TwinChange::InterestsAdded(set(&["Music"])),
            ]
        );
        assert_eq!(delta.base_version, 0);
        assert_eq!(delta.target_version(), 1);
        assert_eq!(delta.transport_key(), "twin-a:0:2000");
    }

    #[test]
    fn test_canonical_change_order() {
        let a = state(
            TwinProfile::new("Ada", "Engineer")
                .with_skills(["Go"])
                .with_interests(["Chess"]),
        );
        let b = a.with_profile(
            TwinProfile::new("Ada L", "CTO")
                .with_skills(["Rust"])
                .with_interests(["AI"])
                .with_embedding(vec![1.0, 0.0]),
        );

        let delta = compute_delta_at(&a, &b, 5).unwrap();
        let kinds: Vec<_> = delta
            .changes
            .iter()
            .map(|c| std::mem::discriminant(c))
            .collect();
        assert_eq!(kinds.len(), 7);
        assert!(matches!(delta.changes[0], TwinChange::SkillsAdded(_)));
        assert!(matches!(delta.changes[1], TwinChange::SkillsRemoved(_)));
        assert!(matches!(delta.changes[2], TwinChange::InterestsAdded(_)));
        assert!(matches!(delta.changes[3], TwinChange::InterestsRemoved(_)));
        assert!(matches!(delta.changes[4], TwinChange::HeadlineChanged(_)));
        assert!(matches!(delta.changes[5], TwinChange::NameChanged(_)));
        assert!(matches!(delta.changes[6], TwinChange::EmbeddingUpdated(_)));
    }

    #[test]
    fn test_removed_embedding_is_not_a_change() {
        let a = state(TwinProfile::new("Ada", "").with_embedding(vec![1.0]));
        let b = a.with_profile(TwinProfile::new("Ada", ""));
        assert!(compute_delta(&a, &b).is_none());
    }

    #[test]
    fn test_apply_reproduces_target() {
        let a = state(TwinProfile::new("Ada", "Engineer").with_skills(["Go", "Rust"]));
        let b = a.with_profile(
            TwinProfile::new("Ada", "Staff Engineer")
                .with_skills(["Rust", "Zig"])
                .with_interests(["AI"])
                .with_embedding(vec![0.5, 0.5]),
        );

        let delta = compute_delta_at(&a, &b, 9_999).unwrap();
        let applied = apply_delta(&a, &delta);
        assert_eq!(applied.profile, b.profile);
        assert_eq!(applied.version, 1);
        assert_eq!(applied.last_modified, 9_999);
    }

    #[test]
    fn test_reapplying_added_skill_does_not_duplicate() {
        let a = state(TwinProfile::new("Ada", "").with_skills(["Rust"]));
        let delta = delta_with(1, 1, vec![TwinChange::SkillsAdded(set(&["Rust"]))]);
        let applied = apply_delta(&a, &delta);
        assert_eq!(applied.profile.skills, set(&["Rust"]));
    }

    #[test]
    fn test_validation_errors() {
        let s = state(TwinProfile::new("Ada", ""));
        let good = delta_with(1, 1, vec![TwinChange::NameChanged("Bob".into())]);
        assert!(is_valid_delta(&s, &good));

        let mut wrong_twin = good.clone();
        wrong_twin.twin_id = TwinId::new("twin-b");
        assert!(matches!(
            validate_delta(&s, &wrong_twin),
            Err(ValidationError::TwinMismatch { .. })
        ));

        let mut wrong_version = good.clone();
        wrong_version.base_version = 3;
        assert_eq!(
            validate_delta(&s, &wrong_version),
            Err(ValidationError::VersionMismatch {
                expected: 0,
                got: 3
            })
        );

        let empty = delta_with(1, 1, vec![]);
        assert_eq!(validate_delta(&s, &empty), Err(ValidationError::EmptyDelta));
    }

    #[test]
    fn test_merge_unions_sets_and_is_commutative() {
        let d1 = delta_with(
            10,
            1,
            vec![
                TwinChange::SkillsAdded(set(&["Rust"])),
                TwinChange::HeadlineChanged("older".into()),
            ],
        );
        let d2 = delta_with(
            20,
            2,
            vec![
                TwinChange::SkillsAdded(set(&["Go"])),
                TwinChange::InterestsAdded(set(&["AI"])),
                TwinChange::HeadlineChanged("newer".into()),
            ],
        );

        let m12 = merge_delta(&d1, &d2).unwrap();
        let m21 = merge_delta(&d2, &d1).unwrap();
        assert_eq!(m12, m21);
        assert_eq!(m12.timestamp, 20);
        assert_eq!(
            m12.changes,
            vec![
                TwinChange::SkillsAdded(set(&["Go", "Rust"])),
                TwinChange::InterestsAdded(set(&["AI"])),
                TwinChange::HeadlineChanged("newer".into()),
            ]
        );
    }

    #[test]
    fn test_merge_tie_break_on_greater_id() {
        let low = delta_with(10, 1, vec![TwinChange::NameChanged("low".into())]);
        let high = delta_with(10, 2, vec![TwinChange::NameChanged("high".into())]);

        let merged = merge_delta(&low, &high).unwrap();
        assert_eq!(merged.changes, vec![TwinChange::NameChanged("high".into())]);
        assert_eq!(merge_delta(&high, &low).unwrap(), merged);
    }

    #[test]
    fn test_merge_scalar_only_in_older_survives() {
        let older = delta_with(5, 9, vec![TwinChange::NameChanged("kept".into())]);
        let newer = delta_with(6, 1, vec![TwinChange::HeadlineChanged("h".into())]);
        let merged = merge_delta(&older, &newer).unwrap();
        assert_eq!(
            merged.changes,
            vec![
                TwinChange::HeadlineChanged("h".into()),
                TwinChange::NameChanged("kept".into()),
            ]
        );
    }

    #[test]
    fn test_merge_rejects_mismatch() {
        let d1 = delta_with(1, 1, vec![TwinChange::NameChanged("a".into())]);
        let mut d2 = delta_with(1, 2, vec![TwinChange::NameChanged("b".into())]);
        d2.base_version = 1;
        assert!(matches!(
            merge_delta(&d1, &d2),
            Err(ValidationError::VersionMismatch { .. })
        ));

        d2.base_version = 0;
        d2.twin_id = TwinId::new("other");
        assert!(matches!(
            merge_delta(&d1, &d2),
            Err(ValidationError::TwinMismatch { .. })
        ));
    }

    #[test]
    fn test_delta_sync_ingest_gates_on_version() {
        let mut sync = DeltaSync::new(state(TwinProfile::new("Ada", "")));
        let d = delta_with(1, 1, vec![TwinChange::SkillsAdded(set(&["Rust"]))]);

        assert_eq!(sync.ingest(&d).unwrap().version, 1);
        // Same base version again is stale now.
        assert!(sync.ingest(&d).is_err());
        assert_eq!(sync.state().version, 1);
    }

    #[test]
    fn test_ingest_rejects_deltas_that_overflow_limits() {
        let mut sync = DeltaSync::new(state(TwinProfile::new("Ada", "")));
        let batch = |prefix: &str| -> BTreeSet<String> {
            (0..200).map(|i| format!("{}{}", prefix, i)).collect()
        };

        let first = delta_with(1, 1, vec![TwinChange::SkillsAdded(batch("a"))]);
        assert_eq!(sync.ingest(&first).unwrap().profile.skills.len(), 200);

        // Each delta is within bounds on its own; together they are not.
        let mut second = delta_with(2, 2, vec![TwinChange::SkillsAdded(batch("b"))]);
        second.base_version = 1;
        assert!(second.check_limits().is_ok());
        assert!(matches!(
            sync.ingest(&second),
            Err(ValidationError::LimitExceeded(_))
        ));
        assert_eq!(sync.state().version, 1);
        assert_eq!(sync.state().profile.skills.len(), 200);
    }

    #[test]
    fn test_commit_local() {
        let mut sync = DeltaSync::new(state(TwinProfile::new("Ada", "")));

        let unchanged = sync.commit_local(TwinProfile::new("Ada", ""), 5).unwrap();
        assert!(unchanged.is_none());
        assert_eq!(sync.state().version, 0);

        let delta = sync
            .commit_local(TwinProfile::new("Ada", "").with_skills(["Rust"]), 6)
            .unwrap()
            .unwrap();
        assert_eq!(delta.base_version, 0);
        assert_eq!(sync.state().version, 1);
        assert_eq!(sync.state().last_modified, 6);

        let too_long = TwinProfile::new("x".repeat(limits::MAX_TEXT_LEN + 1), "");
        assert!(sync.commit_local(too_long, 7).is_err());
        assert_eq!(sync.state().version, 1);
    }

    #[test]
    fn test_catch_up_restates_profile() {
        let mut sync = DeltaSync::new(state(TwinProfile::new("Ada", "Engineer")));
        sync.commit_local(
            TwinProfile::new("Ada", "Engineer")
                .with_skills(["Rust"])
                .with_interests(["AI"]),
            50,
        )
        .unwrap();
        sync.commit_local(
            TwinProfile::new("Ada", "CTO")
                .with_skills(["Rust", "Go"])
                .with_interests(["AI"]),
            60,
        )
        .unwrap();

        let catch_up = sync.catch_up_for(0);
        assert_eq!(catch_up.base_version, 0);
        assert_eq!(catch_up.timestamp, 60);

        let rebuilt = apply_delta(&TwinState::baseline(TwinId::new("twin-a"), 0), &catch_up);
        assert_eq!(rebuilt.profile, sync.state().profile);
    }

    #[test]
    fn test_delta_cbor_roundtrip() {
        let d = delta_with(
            42,
            7,
            vec![
                TwinChange::SkillsAdded(set(&["Rust"])),
                TwinChange::EmbeddingUpdated(vec![0.25, -0.5]),
            ],
        );
        let bytes = crate::canonical::encode(&d).unwrap();
        let decoded: TwinDelta = crate::canonical::decode(&bytes).unwrap();
        assert_eq!(decoded, d);
    }
}
