//! Proptest generators for property-based testing.

use std::collections::BTreeSet;

use proptest::prelude::*;

use twinmesh_core::{Keypair, TwinId, TwinProfile, TwinState};

/// Generate a random keypair.
pub fn keypair() -> impl Strategy<Value = Keypair> {
    any::<[u8; 32]>().prop_map(|seed| Keypair::from_seed(&seed))
}

/// Generate a short tag such as a skill or interest.
pub fn tag() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("Rust".to_string()),
        Just("TypeScript".to_string()),
        Just("AI".to_string()),
        Just("Music".to_string()),
        "[a-z][a-z0-9.-]{0,11}",
    ]
}

/// Generate a set of up to `max` tags.
pub fn tag_set(max: usize) -> impl Strategy<Value = BTreeSet<String>> {
    prop::collection::btree_set(tag(), 0..=max)
}

/// Generate an embedding of finite components.
pub fn embedding(max_dims: usize) -> impl Strategy<Value = Vec<f32>> {
    prop::collection::vec(-1.0f32..=1.0, 1..=max_dims)
}

/// Generate a profile within the size limits.
pub fn profile() -> impl Strategy<Value = TwinProfile> {
    (
        "[A-Z][a-z]{0,9}",
        "[A-Za-z ]{0,24}",
        tag_set(6),
        tag_set(6),
        prop::option::of(embedding(8)),
    )
        .prop_map(|(name, headline, skills, interests, embedding)| TwinProfile {
            name,
            headline,
            skills,
            interests,
            embedding,
        })
}

/// Generate a twin state at an arbitrary version.
pub fn state() -> impl Strategy<Value = TwinState> {
    ("[a-z]{1,8}", 0u64..1_000, profile(), timestamp()).prop_map(
        |(id, version, profile, last_modified)| TwinState {
            twin_id: TwinId::new(id),
            version,
            profile,
            last_modified,
        },
    )
}

/// Generate a reasonable timestamp.
pub fn timestamp() -> impl Strategy<Value = i64> {
    0i64..=i64::MAX / 2
}
