//! Per-room fan-out with backpressure.
//!
//! Uses a tokio broadcast channel: one send reaches every subscriber, and
//! each subscriber buffers up to `capacity` frames before it starts lagging.
//! Frames carry the originating connection so a sender can skip its own.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{PeerInfo, ProtocolError, SyncMessage};

/// An encoded message plus the connection that produced it.
#[derive(Debug, Clone)]
pub struct Frame {
    pub origin: Uuid,
    pub bytes: Arc<Vec<u8>>,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub active_peers: usize,
}

/// A broadcast group for a single room.
///
/// Peers are keyed by connection id, not by the peer id a client announces,
/// so two connections claiming the same identity stay distinct.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Frame>,
    peers: RwLock<HashMap<Uuid, PeerInfo>>,
    capacity: usize,
    messages_sent: AtomicU64,
}

impl BroadcastGroup {
    /// Create a new broadcast group with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            peers: RwLock::new(HashMap::new()),
            capacity,
            messages_sent: AtomicU64::new(0),
        }
    }

    /// Add a connection to this group and return its receiver.
    pub async fn add_peer(&self, connection_id: Uuid, info: PeerInfo) -> broadcast::Receiver<Frame> {
        let mut peers = self.peers.write().await;
        peers.insert(connection_id, info);
        self.sender.subscribe()
    }

    /// Replace the metadata of a connected peer. Returns false if unknown.
    pub async fn update_peer(&self, connection_id: &Uuid, info: PeerInfo) -> bool {
        match self.peers.write().await.get_mut(connection_id) {
            Some(slot) => {
                *slot = info;
                true
            }
            None => false,
        }
    }

    /// Remove a connection from this group.
    pub async fn remove_peer(&self, connection_id: &Uuid) -> Option<PeerInfo> {
        self.peers.write().await.remove(connection_id)
    }

    /// Encode and send a message to every subscriber.
    ///
    /// Returns the number of receivers; filtering the origin is the
    /// receiver's job.
    pub fn broadcast(&self, origin: Uuid, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let encoded = msg.encode()?;
        Ok(self.broadcast_raw(origin, Arc::new(encoded)))
    }

    /// Send pre-encoded bytes without re-serializing.
    pub fn broadcast_raw(&self, origin: Uuid, bytes: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(Frame { origin, bytes }).unwrap_or(0);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn has_peer(&self, connection_id: &Uuid) -> bool {
        self.peers.read().await.contains_key(connection_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            active_peers: self.peer_count().await,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_add_update_remove() {
        let group = BroadcastGroup::new(16);
        let conn = Uuid::new_v4();

        let _rx = group.add_peer(conn, PeerInfo::with_id(conn, "Anonymous")).await;
        assert_eq!(group.peer_count().await, 1);
        assert!(group.has_peer(&conn).await);

        assert!(group.update_peer(&conn, PeerInfo::new("Alice")).await);
        assert_eq!(group.peers().await[0].name, "Alice");

        group.remove_peer(&conn).await;
        assert_eq!(group.peer_count().await, 0);
        assert!(!group.update_peer(&conn, PeerInfo::new("Bob")).await);
    }

    #[tokio::test]
    async fn test_fan_out_carries_origin() {
        let group = BroadcastGroup::new(16);
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let mut rx_alice = group.add_peer(alice, PeerInfo::new("Alice")).await;
        let mut rx_bob = group.add_peer(bob, PeerInfo::new("Bob")).await;

        let msg = SyncMessage::delta(Uuid::new_v4(), 1, vec![1, 2, 3]);
        assert_eq!(group.broadcast(alice, &msg).unwrap(), 2);

        let seen_by_alice = rx_alice.recv().await.unwrap();
        let seen_by_bob = rx_bob.recv().await.unwrap();
        assert_eq!(seen_by_alice.origin, alice);
        assert_eq!(seen_by_bob.origin, alice);
        assert_eq!(SyncMessage::decode(&seen_by_bob.bytes).unwrap().payload, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_broadcast_without_subscribers() {
        let group = BroadcastGroup::new(4);
        assert_eq!(group.broadcast_raw(Uuid::new_v4(), Arc::new(vec![1])), 0);
        assert_eq!(group.stats().await.messages_sent, 1);
    }

    #[tokio::test]
    async fn test_lagging_receiver() {
        let group = BroadcastGroup::new(2);
        let conn = Uuid::new_v4();
        let mut rx = group.add_peer(conn, PeerInfo::new("Slow")).await;
        for i in 0..5u8 {
            group.broadcast_raw(conn, Arc::new(vec![i]));
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(3))
        ));
    }

    #[test]
    fn test_capacity() {
        assert_eq!(BroadcastGroup::new(32).capacity(), 32);
    }
}
