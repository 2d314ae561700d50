//! Transport abstraction for peer messaging.
//!
//! The negotiator is transport-agnostic. Implementations deliver
//! [`PeerMessage`]s between peers of one room and report presence.

use async_trait::async_trait;

use crate::error::Result;
use crate::messages::{PeerId, PeerMessage};

/// Something that happened on the transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A message from a peer.
    Message { from: PeerId, message: PeerMessage },
    /// A peer entered the room.
    PeerJoined(PeerId),
    /// A peer left the room or dropped.
    PeerLeft(PeerId),
}

/// Trait for sending and receiving peer messages.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a message to one peer.
    async fn send(&self, peer: &PeerId, message: PeerMessage) -> Result<()>;

    /// Send a message to every other peer in the room.
    async fn broadcast(&self, message: PeerMessage) -> Result<()>;

    /// Wait for the next event.
    async fn recv(&self) -> Result<TransportEvent>;

    /// This node's peer id.
    fn local_peer_id(&self) -> PeerId;

    /// Peers currently in the room.
    async fn connected_peers(&self) -> Result<Vec<PeerId>>;
}

/// In-memory transport for tests and single-process rooms.
pub mod memory {
    use super::*;
    use crate::error::SyncError;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio::sync::{mpsc, Mutex, RwLock};

    const CHANNEL_CAPACITY: usize = 1024;

    type Senders = HashMap<PeerId, mpsc::Sender<TransportEvent>>;

    /// A room shared by in-process peers.
    #[derive(Default)]
    pub struct MemoryNetwork {
        peers: RwLock<Senders>,
    }

    impl MemoryNetwork {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Join the room as `peer_id`.
        ///
        /// Every peer already present sees [`TransportEvent::PeerJoined`] for
        /// the newcomer, and the newcomer sees one for each of them.
        pub async fn join(self: &Arc<Self>, peer_id: PeerId) -> MemoryTransport {
            let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
            let mut peers = self.peers.write().await;

            for (existing, sender) in peers.iter() {
                let _ = sender.try_send(TransportEvent::PeerJoined(peer_id.clone()));
                let _ = tx.try_send(TransportEvent::PeerJoined(existing.clone()));
            }
            peers.insert(peer_id.clone(), tx);

            MemoryTransport {
                peer_id,
                network: Arc::clone(self),
                receiver: Mutex::new(rx),
            }
        }

        /// Remove `peer_id` from the room and tell everyone else.
        pub async fn leave(&self, peer_id: &PeerId) {
            let mut peers = self.peers.write().await;
            if peers.remove(peer_id).is_none() {
                return;
            }
            for sender in peers.values() {
                let _ = sender.try_send(TransportEvent::PeerLeft(peer_id.clone()));
            }
        }

        pub async fn peer_ids(&self) -> Vec<PeerId> {
            self.peers.read().await.keys().cloned().collect()
        }
    }

    /// One peer's endpoint on a [`MemoryNetwork`].
    pub struct MemoryTransport {
        peer_id: PeerId,
        network: Arc<MemoryNetwork>,
        receiver: Mutex<mpsc::Receiver<TransportEvent>>,
    }

    #[async_trait]
    impl Transport for MemoryTransport {
        async fn send(&self, peer: &PeerId, message: PeerMessage) -> Result<()> {
            let sender = {
                let peers = self.network.peers.read().await;
                peers
                    .get(peer)
                    .cloned()
                    .ok_or_else(|| SyncError::Transport(format!("unknown peer {}", peer)))?
            };
            sender
                .send(TransportEvent::Message {
                    from: self.peer_id.clone(),
                    message,
                })
                .await
                .map_err(|_| SyncError::Transport(format!("peer {} hung up", peer)))
        }

        async fn broadcast(&self, message: PeerMessage) -> Result<()> {
            let targets: Vec<(PeerId, mpsc::Sender<TransportEvent>)> = {
                let peers = self.network.peers.read().await;
                peers
                    .iter()
                    .filter(|(id, _)| **id != self.peer_id)
                    .map(|(id, tx)| (id.clone(), tx.clone()))
                    .collect()
            };
            for (_, sender) in targets {
                // One slow or departed peer does not block the rest.
                let _ = sender
                    .send(TransportEvent::Message {
                        from: self.peer_id.clone(),
                        message: message.clone(),
                    })
                    .await;
            }
            Ok(())
        }

        async fn recv(&self) -> Result<TransportEvent> {
            let mut rx = self.receiver.lock().await;
            rx.recv()
                .await
                .ok_or_else(|| SyncError::Transport("channel closed".into()))
        }

        fn local_peer_id(&self) -> PeerId {
            self.peer_id.clone()
        }

        async fn connected_peers(&self) -> Result<Vec<PeerId>> {
            let peers = self.network.peers.read().await;
            Ok(peers
                .keys()
                .filter(|id| **id != self.peer_id)
                .cloned()
                .collect())
        }
    }
}
