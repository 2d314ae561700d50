//! # twinmesh sync
//!
//! Peer protocol for one room: hellos, delta exchange, catch-up and
//! mutual-interest negotiation over a pluggable transport.
//!
//! ## Message Flow
//!
//! ```text
//! Node A                              Node B
//!   |-------- Hello ------------------>|   (encrypted preview, key pinned)
//!   |<------- Hello -------------------|
//!   |-------- CatchUpRequest --------->|
//!   |<------- CatchUp -----------------|   (full profile, encrypted)
//!   |<------- Delta -------------------|   (on every local edit)
//!   |-------- Interest --------------->|   (sealed interest level)
//!   |<------- Ack ---------------------|
//! ```
//!
//! A match is confirmed on both sides when the lower of the two interest
//! levels reaches the threshold. Nothing beyond the levels is exchanged.

pub mod error;
pub mod messages;
pub mod negotiator;
pub mod peers;
pub mod transport;

pub use error::{Result, SyncError};
pub use messages::{InterestSignal, PeerId, PeerMessage, PROTOCOL_VERSION};
pub use negotiator::{NegotiationResult, Negotiator, NegotiatorConfig};
pub use peers::{ConnectionState, FoldOutcome, HelloOutcome, PeerRegistry, PeerTwin};
pub use transport::{memory::MemoryNetwork, memory::MemoryTransport, Transport, TransportEvent};
