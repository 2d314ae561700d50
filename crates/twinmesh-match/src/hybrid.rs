//! Local/remote mode selection and the hybrid ranking pipeline.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use twinmesh_core::{TwinId, TwinProfile, TwinState};

use crate::error::{MatchError, Result};
use crate::local::{self, LocalMatcher};
use crate::provider::{EventContext, MatchSource, MatchingProvider, RankedMatch};

/// How a ranking request is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchingMode {
    /// On-device only. No network calls.
    Local,
    /// Local pre-filter to top-K, then remote refinement of that subset.
    Hybrid,
}

/// Pick the mode for a request.
///
/// Small candidate sets stay local. Large ones go hybrid only when the
/// remote side is ready.
pub fn select_mode(candidate_count: usize, cloud_threshold: usize, cloud_ready: bool) -> MatchingMode {
    if candidate_count >= cloud_threshold && cloud_ready {
        MatchingMode::Hybrid
    } else {
        MatchingMode::Local
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HybridConfig {
    /// Candidate count at which remote refinement kicks in.
    pub cloud_threshold: usize,
    /// How many local best candidates the remote provider sees.
    pub top_k: usize,
    pub cloud_enabled: bool,
}

impl Default for HybridConfig {
    fn default() -> Self {
        Self {
            cloud_threshold: 50,
            top_k: 20,
            cloud_enabled: true,
        }
    }
}

impl HybridConfig {
    pub fn validate(&self) -> Result<()> {
        if self.top_k == 0 {
            return Err(MatchError::InvalidConfig("top_k must be at least 1"));
        }
        Ok(())
    }
}

/// Ranks candidates locally, refining large sets through a remote provider.
pub struct HybridMatcher {
    config: HybridConfig,
    local: LocalMatcher,
    provider: Option<Arc<dyn MatchingProvider>>,
}

impl HybridMatcher {
    /// A matcher with no remote provider. Always local.
    pub fn new(config: HybridConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            local: LocalMatcher::new(),
            provider: None,
        })
    }

    pub fn with_provider(mut self, provider: Arc<dyn MatchingProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn config(&self) -> &HybridConfig {
        &self.config
    }

    /// Score two profiles. Always the local algorithm.
    pub fn calculate_score(&self, a: &TwinProfile, b: &TwinProfile) -> u8 {
        local::calculate_score(a, b)
    }

    /// The mode a request with `candidate_count` candidates would use now.
    pub async fn mode_for(&self, candidate_count: usize) -> MatchingMode {
        let ready = self.cloud_ready(candidate_count).await;
        select_mode(candidate_count, self.config.cloud_threshold, ready)
    }

    async fn cloud_ready(&self, candidate_count: usize) -> bool {
        // Skip the availability check when the count alone decides.
        if !self.config.cloud_enabled || candidate_count < self.config.cloud_threshold {
            return false;
        }
        match &self.provider {
            Some(provider) => provider.is_available().await,
            None => false,
        }
    }

    /// Rank `candidates` for `user`, best first.
    ///
    /// Never fails: a remote failure falls back to the local ranking.
    /// Every candidate appears exactly once. Subset members the provider
    /// leaves out follow its answer in local order, then the rest.
    pub async fn find_matches(
        &self,
        user: &TwinProfile,
        candidates: &[TwinState],
        context: &EventContext,
    ) -> Vec<RankedMatch> {
        let ranked = self.local.rank(user, candidates);
        let mode = self.mode_for(candidates.len()).await;
        debug!(candidates = candidates.len(), ?mode, "matching");

        let provider = match (mode, &self.provider) {
            (MatchingMode::Hybrid, Some(provider)) => provider,
            _ => return ranked,
        };

        let k = self.config.top_k.min(ranked.len());
        let subset: Vec<TwinState> = ranked[..k]
            .iter()
            .filter_map(|m| candidates.iter().find(|c| c.twin_id == m.twin_id))
            .cloned()
            .collect();

        match self.refine(provider.as_ref(), user, &subset, context).await {
            Ok(mut refined) => {
                let returned: HashSet<TwinId> =
                    refined.iter().map(|m| m.twin_id.clone()).collect();
                let mut rest = ranked.into_iter();
                let omitted: Vec<RankedMatch> = rest
                    .by_ref()
                    .take(k)
                    .filter(|m| !returned.contains(&m.twin_id))
                    .collect();
                if !omitted.is_empty() {
                    debug!(omitted = omitted.len(), "provider skipped candidates");
                }
                refined.extend(omitted);
                refined.extend(rest);
                refined
            }
            Err(e) => {
                warn!(error = %e, "remote matching failed, using local ranking");
                ranked
            }
        }
    }

    /// Ask the provider to re-rank `subset`.
    ///
    /// Only ids and scores are taken from the provider. Shared fields are
    /// recomputed locally.
    async fn refine(
        &self,
        provider: &dyn MatchingProvider,
        user: &TwinProfile,
        subset: &[TwinState],
        context: &EventContext,
    ) -> Result<Vec<RankedMatch>> {
        let remote = provider
            .find_matches(user, subset, context)
            .await
            .map_err(|e| MatchError::Provider(e.to_string()))?;

        let mut seen: HashSet<TwinId> = HashSet::new();
        let mut refined = Vec::with_capacity(remote.len());
        for m in remote {
            if m.score > 100 {
                return Err(MatchError::Provider(format!("score {} out of range", m.score)));
            }
            let Some(candidate) = subset.iter().find(|c| c.twin_id == m.twin_id) else {
                return Err(MatchError::Provider(format!("unknown candidate {}", m.twin_id)));
            };
            if !seen.insert(m.twin_id.clone()) {
                continue;
            }
            refined.push(RankedMatch {
                twin_id: m.twin_id,
                score: m.score,
                shared_skills: local::shared_skills(user, &candidate.profile),
                shared_interests: local::shared_interests(user, &candidate.profile),
                source: MatchSource::Remote,
            });
        }
        refined.sort_by(|x, y| y.score.cmp(&x.score).then_with(|| x.twin_id.cmp(&y.twin_id)));
        Ok(refined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Reverses the order it is given and counts calls.
    struct ReversingProvider {
        available: bool,
        fail: bool,
        /// Answer for at most this many candidates.
        keep: usize,
        calls: AtomicUsize,
        last_len: AtomicUsize,
    }

    impl ReversingProvider {
        fn new(available: bool, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                available,
                fail,
                keep: usize::MAX,
                calls: AtomicUsize::new(0),
                last_len: AtomicUsize::new(0),
            })
        }

        fn partial(keep: usize) -> Arc<Self> {
            Arc::new(Self {
                available: true,
                fail: false,
                keep,
                calls: AtomicUsize::new(0),
                last_len: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl MatchingProvider for ReversingProvider {
        async fn find_matches(
            &self,
            _user: &TwinProfile,
            candidates: &[TwinState],
            _context: &EventContext,
        ) -> anyhow::Result<Vec<RankedMatch>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.last_len.store(candidates.len(), Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("backend down");
            }
            Ok(candidates
                .iter()
                .rev()
                .take(self.keep)
                .enumerate()
                .map(|(i, c)| RankedMatch {
                    twin_id: c.twin_id.clone(),
                    score: 100u8.saturating_sub(i as u8),
                    shared_skills: vec!["ignored".into()],
                    shared_interests: vec![],
                    source: MatchSource::Remote,
                })
                .collect())
        }

        async fn is_available(&self) -> bool {
            self.available
        }
    }

    fn candidates(n: usize) -> Vec<TwinState> {
        (0..n)
            .map(|i| {
                let skills: Vec<String> = (0..(i % 5)).map(|s| format!("s{}", s)).collect();
                TwinState::new(
                    TwinId::new(format!("twin-{:03}", i)),
                    TwinProfile::new("p", "").with_skills(skills),
                    0,
                )
            })
            .collect()
    }

    fn user() -> TwinProfile {
        TwinProfile::new("me", "").with_skills(["s0", "s1", "s2", "s3"])
    }

    #[test]
    fn test_select_mode() {
        assert_eq!(select_mode(10, 50, true), MatchingMode::Local);
        assert_eq!(select_mode(60, 50, true), MatchingMode::Hybrid);
        assert_eq!(select_mode(60, 50, false), MatchingMode::Local);
        assert_eq!(select_mode(50, 50, true), MatchingMode::Hybrid);
    }

    #[test]
    fn test_zero_top_k_rejected() {
        let config = HybridConfig {
            top_k: 0,
            ..HybridConfig::default()
        };
        assert!(HybridMatcher::new(config).is_err());
    }

    #[tokio::test]
    async fn test_small_set_never_calls_provider() {
        let provider = ReversingProvider::new(true, false);
        let matcher = HybridMatcher::new(HybridConfig::default())
            .unwrap()
            .with_provider(provider.clone());

        let ranked = matcher
            .find_matches(&user(), &candidates(10), &EventContext::default())
            .await;
        assert_eq!(ranked.len(), 10);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
        assert!(ranked.iter().all(|m| m.source == MatchSource::Local));
    }

    #[tokio::test]
    async fn test_large_set_sends_only_top_k() {
        let provider = ReversingProvider::new(true, false);
        let matcher = HybridMatcher::new(HybridConfig::default())
            .unwrap()
            .with_provider(provider.clone());

        let all = candidates(60);
        let ranked = matcher
            .find_matches(&user(), &all, &EventContext::for_event("meetup"))
            .await;

        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert_eq!(provider.last_len.load(Ordering::SeqCst), 20);
        assert_eq!(ranked.len(), 60);
        assert!(ranked[..20].iter().all(|m| m.source == MatchSource::Remote));
        assert!(ranked[20..].iter().all(|m| m.source == MatchSource::Local));
        // Shared fields come from the local computation.
        assert!(ranked[..20]
            .iter()
            .all(|m| !m.shared_skills.contains(&"ignored".to_string())));
    }

    #[tokio::test]
    async fn test_partial_provider_answer_keeps_every_candidate() {
        let provider = ReversingProvider::partial(5);
        let matcher = HybridMatcher::new(HybridConfig::default())
            .unwrap()
            .with_provider(provider.clone());

        let all = candidates(60);
        let local = LocalMatcher::new().rank(&user(), &all);
        let ranked = matcher
            .find_matches(&user(), &all, &EventContext::default())
            .await;

        assert_eq!(ranked.len(), 60);
        let ids: HashSet<&TwinId> = ranked.iter().map(|m| &m.twin_id).collect();
        assert_eq!(ids.len(), 60);

        // The provider answered for the last five of the top 20.
        assert!(ranked[..5].iter().all(|m| m.source == MatchSource::Remote));
        let remote: HashSet<&TwinId> = ranked[..5].iter().map(|m| &m.twin_id).collect();
        let answered: HashSet<&TwinId> = local[15..20].iter().map(|m| &m.twin_id).collect();
        assert_eq!(remote, answered);
        assert_eq!(ranked[5..20], local[..15]);
        assert_eq!(ranked[20..], local[20..]);
    }

    #[tokio::test]
    async fn test_provider_failure_falls_back_to_local() {
        let provider = ReversingProvider::new(true, true);
        let matcher = HybridMatcher::new(HybridConfig::default())
            .unwrap()
            .with_provider(provider.clone());

        let all = candidates(60);
        let ranked = matcher
            .find_matches(&user(), &all, &EventContext::default())
            .await;

        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert_eq!(ranked, LocalMatcher::new().rank(&user(), &all));
    }

    #[tokio::test]
    async fn test_unavailable_or_disabled_stays_local() {
        let unavailable = ReversingProvider::new(false, false);
        let matcher = HybridMatcher::new(HybridConfig::default())
            .unwrap()
            .with_provider(unavailable.clone());
        assert_eq!(matcher.mode_for(60).await, MatchingMode::Local);

        let available = ReversingProvider::new(true, false);
        let disabled = HybridMatcher::new(HybridConfig {
            cloud_enabled: false,
            ..HybridConfig::default()
        })
        .unwrap()
        .with_provider(available.clone());
        disabled
            .find_matches(&user(), &candidates(60), &EventContext::default())
            .await;
        assert_eq!(available.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_calculate_score_is_local() {
        let matcher = HybridMatcher::new(HybridConfig::default()).unwrap();
        let a = TwinProfile::new("a", "").with_embedding(vec![1.0, 0.0]);
        let b = TwinProfile::new("b", "").with_embedding(vec![0.0, 1.0]);
        assert_eq!(matcher.calculate_score(&a, &b), 50);
    }

    #[test]
    fn test_config_from_json_uses_defaults() {
        let config: HybridConfig = serde_json::from_str(r#"{"top_k": 5}"#).unwrap();
        assert_eq!(config.top_k, 5);
        assert_eq!(config.cloud_threshold, 50);
        assert!(config.cloud_enabled);
    }
}
