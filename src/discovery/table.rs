//! Peer table module
//!
//! Concurrent peer map and message de-duplication window used by the
//! discovery service. Both are safe to share between the receive, hello and
//! cleanup tasks.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, trace};

use crate::discovery::peer::PeerRecord;
use crate::protocol::message::{DiscoveryMessage, MessageKind};

/// Outcome of [`PeerTable::upsert`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    /// A new peer was added
    Inserted,
    /// An existing peer was refreshed
    Updated,
    /// The record described the local peer and was dropped
    Ignored,
}

/// Known peers keyed by peer id, never containing the local peer
#[derive(Debug)]
pub struct PeerTable {
    self_id: String,
    peers: RwLock<HashMap<String, PeerRecord>>,
}

impl PeerTable {
    /// Create an empty table for the given local peer id
    pub fn new(self_id: impl Into<String>) -> Self {
        Self {
            self_id: self_id.into(),
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Insert or refresh a peer. Last writer wins.
    pub async fn upsert(&self, record: PeerRecord) -> Upsert {
        if record.peer_id == self.self_id {
            trace!("Refusing to record the local peer");
            return Upsert::Ignored;
        }
        let mut peers = self.peers.write().await;
        match peers.insert(record.peer_id.clone(), record) {
            Some(_) => Upsert::Updated,
            None => Upsert::Inserted,
        }
    }

    /// Remove a peer by id
    pub async fn remove(&self, peer_id: &str) -> Option<PeerRecord> {
        self.peers.write().await.remove(peer_id)
    }

    /// Copy of every record, ordered by peer id
    pub async fn snapshot(&self) -> Vec<PeerRecord> {
        let mut peers: Vec<PeerRecord> = self.peers.read().await.values().cloned().collect();
        peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        peers
    }

    /// Number of known peers
    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Whether no peers are known
    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }

    /// Drop every peer silent for longer than `timeout` at `now`
    pub async fn sweep_expired(&self, now: Instant, timeout: Duration) -> Vec<PeerRecord> {
        let mut peers = self.peers.write().await;
        let expired: Vec<String> = peers
            .values()
            .filter(|p| p.is_expired(now, timeout))
            .map(|p| p.peer_id.clone())
            .collect();
        let removed: Vec<PeerRecord> = expired.iter().filter_map(|id| peers.remove(id)).collect();
        if !removed.is_empty() {
            debug!("Swept {} expired peers", removed.len());
        }
        removed
    }

    /// Forget every peer, returning how many were known
    pub async fn clear(&self) -> usize {
        let mut peers = self.peers.write().await;
        let count = peers.len();
        peers.clear();
        count
    }
}

/// Identity of a message for de-duplication purposes.
///
/// HELLO_ACKs reuse the id of the HELLO they answer, so the sender is part of
/// the key; otherwise acks from a second responder would be dropped.
type SeenKey = (MessageKind, String, String);

/// Recently seen message ids
#[derive(Debug)]
pub struct SeenMessages {
    retention: Duration,
    seen: RwLock<HashMap<SeenKey, Instant>>,
}

impl SeenMessages {
    /// Create a window remembering ids for `retention`
    pub fn new(retention: Duration) -> Self {
        Self {
            retention,
            seen: RwLock::new(HashMap::new()),
        }
    }

    /// Record a sighting. Returns `false` when the same message was already
    /// seen within the retention window.
    pub async fn first_sighting(&self, msg: &DiscoveryMessage, now: Instant) -> bool {
        let key = (msg.kind, msg.msg_id.clone(), msg.peer_id.clone());
        let mut seen = self.seen.write().await;
        match seen.get(&key) {
            Some(at) if now.saturating_duration_since(*at) < self.retention => false,
            _ => {
                seen.insert(key, now);
                true
            }
        }
    }

    /// Forget ids older than the retention window
    pub async fn prune(&self, now: Instant) -> usize {
        let mut seen = self.seen.write().await;
        let before = seen.len();
        seen.retain(|_, at| now.saturating_duration_since(*at) < self.retention);
        before - seen.len()
    }

    /// Number of remembered ids
    pub async fn len(&self) -> usize {
        self.seen.read().await.len()
    }

    /// Forget everything
    pub async fn clear(&self) {
        self.seen.write().await.clear();
    }
}
