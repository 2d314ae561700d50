//! Twin identifiers, profiles and state snapshots.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::crypto::{hash_embedding, Digest};
use crate::error::ValidationError;

/// Size limits applied to profiles and anything decoded from a peer.
pub mod limits {
    /// Max entries in a skills or interests set.
    pub const MAX_SET_LEN: usize = 256;
    /// Max characters in a name, headline, skill or interest.
    pub const MAX_TEXT_LEN: usize = 256;
    /// Max embedding dimensions.
    pub const MAX_EMBEDDING_DIMS: usize = 4096;
    /// Max ciphertext accepted from the wire.
    pub const MAX_CIPHERTEXT_LEN: usize = 64 * 1024;
}

/// Identifier of a twin. Assigned by the owning device, never by a server.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TwinId(String);

impl TwinId {
    /// Wrap an existing identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for TwinId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TwinId({})", self.0)
    }
}

impl fmt::Display for TwinId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The matchable part of a twin.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TwinProfile {
    pub name: String,
    pub headline: String,
    pub skills: BTreeSet<String>,
    pub interests: BTreeSet<String>,
    pub embedding: Option<Vec<f32>>,
}

impl TwinProfile {
    /// Create a profile with only the public preview fields set.
    pub fn new(name: impl Into<String>, headline: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            headline: headline.into(),
            ..Self::default()
        }
    }

    pub fn with_skills<I, S>(mut self, skills: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.skills = skills.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_interests<I, S>(mut self, interests: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.interests = interests.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    /// The hello-level view of this profile: name and headline only.
    pub fn preview(&self) -> Self {
        Self::new(self.name.clone(), self.headline.clone())
    }

    /// Hash of the embedding, the only form of it that leaves the device.
    pub fn embedding_hash(&self) -> Option<Digest> {
        self.embedding.as_deref().map(hash_embedding)
    }

    /// Like [`TwinProfile::embedding_hash`], hashing an empty embedding
    /// when there is none. QR payloads always carry a digest.
    pub fn embedding_digest(&self) -> Digest {
        hash_embedding(self.embedding.as_deref().unwrap_or(&[]))
    }

    /// Check the profile against [`limits`].
    pub fn check_limits(&self) -> Result<(), ValidationError> {
        if self.name.chars().count() > limits::MAX_TEXT_LEN {
            return Err(ValidationError::LimitExceeded("name too long"));
        }
        if self.headline.chars().count() > limits::MAX_TEXT_LEN {
            return Err(ValidationError::LimitExceeded("headline too long"));
        }
        check_set(&self.skills, "skills")?;
        check_set(&self.interests, "interests")?;
        if let Some(embedding) = &self.embedding {
            check_embedding(embedding)?;
        }
        Ok(())
    }
}

pub(crate) fn check_set(
    set: &BTreeSet<String>,
    what: &'static str,
) -> Result<(), ValidationError> {
    if set.len() > limits::MAX_SET_LEN {
        return Err(ValidationError::LimitExceeded(what));
    }
    if set.iter().any(|s| s.chars().count() > limits::MAX_TEXT_LEN) {
        return Err(ValidationError::LimitExceeded(what));
    }
    Ok(())
}

pub(crate) fn check_embedding(embedding: &[f32]) -> Result<(), ValidationError> {
    if embedding.len() > limits::MAX_EMBEDDING_DIMS {
        return Err(ValidationError::LimitExceeded("embedding dimensions"));
    }
    Ok(())
}

/// A versioned snapshot of a twin.
///
/// `version` advances by exactly one per applied delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TwinState {
    pub twin_id: TwinId,
    pub version: u64,
    pub profile: TwinProfile,
    /// Unix milliseconds of the last applied change.
    pub last_modified: i64,
}

impl TwinState {
    /// Create a fresh state at version 0.
    pub fn new(twin_id: TwinId, profile: TwinProfile, now: i64) -> Self {
        Self {
            twin_id,
            version: 0,
            profile,
            last_modified: now,
        }
    }

    /// An empty state at `version`, the baseline a catch-up delta is computed against.
    pub fn baseline(twin_id: TwinId, version: u64) -> Self {
        Self {
            twin_id,
            version,
            profile: TwinProfile::default(),
            last_modified: 0,
        }
    }

    /// Same twin and version, with a different profile.
    pub fn with_profile(&self, profile: TwinProfile) -> Self {
        Self {
            profile,
            ..self.clone()
        }
    }
}

/// Current time in Unix milliseconds.
pub fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
