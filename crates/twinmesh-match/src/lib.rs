//! # twinmesh match
//!
//! Similarity scoring and the hybrid local/remote ranking pipeline.
//!
//! - [`local`]: pure on-device scoring (embedding cosine or overlap).
//! - [`MatchingProvider`]: the abstract remote backend.
//! - [`HybridMatcher`]: picks a [`MatchingMode`] per request and falls back
//!   to local ranking whenever the remote side fails.

pub mod error;
pub mod hybrid;
pub mod local;
pub mod provider;

pub use error::{MatchError, Result};
pub use hybrid::{select_mode, HybridConfig, HybridMatcher, MatchingMode};
pub use local::{calculate_score, shared_interests, shared_skills, LocalMatcher};
pub use provider::{EventContext, MatchSource, MatchingProvider, RankedMatch};
