//! The abstract remote matching backend.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use twinmesh_core::{TwinId, TwinProfile, TwinState};

/// Where a ranking came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchSource {
    Local,
    Remote,
}

/// One ranked candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankedMatch {
    pub twin_id: TwinId,
    /// In `[0, 100]`.
    pub score: u8,
    pub shared_skills: Vec<String>,
    pub shared_interests: Vec<String>,
    pub source: MatchSource,
}

/// Context of the event the matching runs for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventContext {
    pub event_id: Option<String>,
    pub tags: Vec<String>,
}

impl EventContext {
    pub fn for_event(event_id: impl Into<String>) -> Self {
        Self {
            event_id: Some(event_id.into()),
            tags: Vec::new(),
        }
    }
}

/// A remote scoring backend.
///
/// Only ever sees the pre-filtered candidate subset. Failures are opaque,
/// so the error type is `anyhow`.
#[async_trait]
pub trait MatchingProvider: Send + Sync {
    /// Rank `candidates` for `user`.
    async fn find_matches(
        &self,
        user: &TwinProfile,
        candidates: &[TwinState],
        context: &EventContext,
    ) -> anyhow::Result<Vec<RankedMatch>>;

    /// Whether the backend can take requests right now.
    async fn is_available(&self) -> bool;
}
