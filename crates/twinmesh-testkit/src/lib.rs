//! # twinmesh testkit
//!
//! Testing utilities shared by the twinmesh crates.
//!
//! - **Fixtures**: ready-made twins, the two-attendee scenario profiles, a
//!   scripted remote matching provider and async polling helpers
//! - **Generators**: proptest strategies for profiles, states and
//!   embeddings
//!
//! ## Fixtures
//!
//! ```rust
//! use twinmesh_testkit::fixtures::{scenario_a, TwinFixture};
//!
//! let fixture = TwinFixture::new("twin-a", scenario_a());
//! let state = fixture.state();
//! assert_eq!(state.version, 0);
//! ```
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use twinmesh_testkit::generators::{profile, state};
//!
//! proptest! {
//!     #[test]
//!     fn no_change_no_delta(s in state()) {
//!         prop_assert!(twinmesh_core::compute_delta(&s, &s).is_none());
//!     }
//! }
//! ```

pub mod fixtures;
pub mod generators;

pub use fixtures::{init_tracing, scenario_a, scenario_b, wait_until, ScriptedProvider, TwinFixture};
