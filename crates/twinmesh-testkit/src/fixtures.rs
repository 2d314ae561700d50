//! Test fixtures and helpers.
//!
//! Common setup code for integration tests.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use async_trait::async_trait;

use twinmesh_core::{Keypair, PublicKey, TwinId, TwinProfile, TwinState};
use twinmesh_match::{EventContext, MatchSource, MatchingProvider, RankedMatch};

/// A twin with its own device keypair.
pub struct TwinFixture {
    pub keypair: Arc<Keypair>,
    pub twin_id: TwinId,
    pub profile: TwinProfile,
}

impl TwinFixture {
    /// A fixture with a random keypair.
    pub fn new(twin_id: &str, profile: TwinProfile) -> Self {
        Self {
            keypair: Arc::new(Keypair::generate()),
            twin_id: TwinId::new(twin_id),
            profile,
        }
    }

    /// A fixture with a deterministic keypair.
    pub fn with_seed(seed: [u8; 32], twin_id: &str, profile: TwinProfile) -> Self {
        Self {
            keypair: Arc::new(Keypair::from_seed(&seed)),
            twin_id: TwinId::new(twin_id),
            profile,
        }
    }

    pub fn public_key(&self) -> PublicKey {
        self.keypair.public_key()
    }

    /// The twin at version 0.
    pub fn state(&self) -> TwinState {
        TwinState::new(self.twin_id.clone(), self.profile.clone(), 1_000)
    }

    /// The twin at `version`, with the fixture's profile.
    pub fn state_at(&self, version: u64) -> TwinState {
        let mut state = self.state();
        state.version = version;
        state
    }
}

/// Attendee A: one skill, one interest.
pub fn scenario_a() -> TwinProfile {
    TwinProfile::new("Alice", "Engineer")
        .with_skills(["TypeScript"])
        .with_interests(["AI"])
}

/// Attendee B: A plus two skills and one interest, same name and headline.
pub fn scenario_b() -> TwinProfile {
    TwinProfile::new("Alice", "Engineer")
        .with_skills(["TypeScript", "React", "Node.js"])
        .with_interests(["AI", "Music"])
}

/// A remote provider that returns a fixed score for every candidate.
///
/// Counts calls and can be switched unavailable or failing.
pub struct ScriptedProvider {
    score: u8,
    available: AtomicBool,
    failing: AtomicBool,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(score: u8) -> Arc<Self> {
        Arc::new(Self {
            score,
            available: AtomicBool::new(true),
            failing: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// How many ranking requests reached the provider.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MatchingProvider for ScriptedProvider {
    async fn find_matches(
        &self,
        _user: &TwinProfile,
        candidates: &[TwinState],
        _context: &EventContext,
    ) -> anyhow::Result<Vec<RankedMatch>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("scripted failure");
        }
        Ok(candidates
            .iter()
            .map(|c| RankedMatch {
                twin_id: c.twin_id.clone(),
                score: self.score,
                shared_skills: Vec::new(),
                shared_interests: Vec::new(),
                source: MatchSource::Remote,
            })
            .collect())
    }

    async fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }
}

static TRACING: Once = Once::new();

/// Route `tracing` output to the test harness. Safe to call from every test.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

/// Poll `check` every 10ms until it returns true or `timeout` passes.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
