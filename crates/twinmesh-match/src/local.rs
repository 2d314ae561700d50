//! On-device similarity scoring.
//!
//! Pure functions: no I/O, nothing leaves the device.

use std::collections::BTreeSet;

use twinmesh_core::{TwinProfile, TwinState};

use crate::provider::{MatchSource, RankedMatch};

/// Base score of the overlap formula.
const OVERLAP_BASE: u32 = 30;
const PER_SHARED_SKILL: u32 = 15;
const PER_SHARED_INTEREST: u32 = 10;

/// Score how well two profiles match, in `[0, 100]`.
///
/// With usable embeddings on both sides this is cosine similarity mapped
/// onto the range (identical 100, orthogonal 50, opposite 0). Otherwise it
/// falls back to skill and interest overlap.
pub fn calculate_score(a: &TwinProfile, b: &TwinProfile) -> u8 {
    if let (Some(ea), Some(eb)) = (&a.embedding, &b.embedding) {
        if let Some(cos) = cosine_similarity(ea, eb) {
            return embedding_score(cos);
        }
    }
    overlap_score(
        intersect_ci(&a.skills, &b.skills).len(),
        intersect_ci(&a.interests, &b.interests).len(),
    )
}

/// `round(((cos + 1) / 2) * 100)`, clamped.
pub fn embedding_score(cosine: f64) -> u8 {
    let scaled = ((cosine + 1.0) / 2.0 * 100.0).round();
    scaled.clamp(0.0, 100.0) as u8
}

/// `min(100, 30 + 15 * skills + 10 * interests)`.
pub fn overlap_score(shared_skills: usize, shared_interests: usize) -> u8 {
    let skills = u32::try_from(shared_skills).unwrap_or(u32::MAX);
    let interests = u32::try_from(shared_interests).unwrap_or(u32::MAX);
    let score = OVERLAP_BASE
        .saturating_add(skills.saturating_mul(PER_SHARED_SKILL))
        .saturating_add(interests.saturating_mul(PER_SHARED_INTEREST));
    score.min(100) as u8
}

/// Cosine similarity, or `None` when it is not meaningful: mismatched or
/// empty dimensions, a zero vector, or any non-finite component.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f64> {
    if a.is_empty() || a.len() != b.len() {
        return None;
    }
    if a.iter().chain(b).any(|x| !x.is_finite()) {
        return None;
    }

    // Accumulate in f64 so long vectors do not lose precision.
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return None;
    }
    let cos = dot / (norm_a.sqrt() * norm_b.sqrt());
    cos.is_finite().then(|| cos.clamp(-1.0, 1.0))
}

/// Skills both profiles list, compared case-insensitively.
///
/// Returned in `a`'s spelling.
pub fn shared_skills(a: &TwinProfile, b: &TwinProfile) -> Vec<String> {
    intersect_ci(&a.skills, &b.skills)
}

/// Topics in common, where each side's topics are its interests and skills.
pub fn shared_interests(a: &TwinProfile, b: &TwinProfile) -> Vec<String> {
    let topics_a: BTreeSet<String> = a.interests.union(&a.skills).cloned().collect();
    let topics_b: BTreeSet<String> = b.interests.union(&b.skills).cloned().collect();
    intersect_ci(&topics_a, &topics_b)
}

fn intersect_ci(a: &BTreeSet<String>, b: &BTreeSet<String>) -> Vec<String> {
    let lowered: BTreeSet<String> = b.iter().map(|s| s.to_lowercase()).collect();
    let mut seen = BTreeSet::new();
    a.iter()
        .filter(|s| {
            let key = s.to_lowercase();
            lowered.contains(&key) && seen.insert(key)
        })
        .cloned()
        .collect()
}

/// Ranks candidates with the local algorithm only.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalMatcher;

impl LocalMatcher {
    pub fn new() -> Self {
        Self
    }

    /// Score a single candidate.
    pub fn score(&self, user: &TwinProfile, candidate: &TwinState) -> RankedMatch {
        RankedMatch {
            twin_id: candidate.twin_id.clone(),
            score: calculate_score(user, &candidate.profile),
            shared_skills: shared_skills(user, &candidate.profile),
            shared_interests: shared_interests(user, &candidate.profile),
            source: MatchSource::Local,
        }
    }

    /// Score every candidate, best first. Ties order by twin id.
    pub fn rank(&self, user: &TwinProfile, candidates: &[TwinState]) -> Vec<RankedMatch> {
        let mut ranked: Vec<RankedMatch> =
            candidates.iter().map(|c| self.score(user, c)).collect();
        ranked.sort_by(|x, y| y.score.cmp(&x.score).then_with(|| x.twin_id.cmp(&y.twin_id)));
        ranked
    }
}
