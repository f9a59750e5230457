//! Network catalog
//!
//! Per-peer catalog snapshots, refreshed only when a peer's advertised
//! digest changes, and a merged view grouped by content hash.

use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::catalog::entry::ContentEntry;
use crate::discovery::peer::PeerRecord;
use crate::peer::client::PeerClient;

/// The catalog of one peer as last fetched
#[derive(Debug, Clone)]
pub struct CatalogSnapshot {
    pub peer_id: String,
    /// Digest the entries were fetched under
    pub digest: String,
    pub entries: Vec<ContentEntry>,
    pub fetched_at: Instant,
}

/// One content item as seen across the network
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkListing {
    pub hash: String,
    /// Lexicographically smallest alias
    pub primary_name: String,
    /// Every name the item is shared under
    pub names: BTreeSet<String>,
    pub size: u64,
    /// Distinct peers holding the item, the local peer included
    pub peer_count: usize,
}

impl NetworkListing {
    /// Name used for display, e.g. `clip.mp4 (+2 aliases)`
    pub fn display_name(&self) -> String {
        let aliases = self.names.len().saturating_sub(1);
        if aliases == 0 {
            self.primary_name.clone()
        } else {
            format!("{} (+{} aliases)", self.primary_name, aliases)
        }
    }
}

/// Cache of every known peer's catalog
#[derive(Debug)]
pub struct NetworkCatalog {
    self_id: String,
    snapshots: RwLock<HashMap<String, CatalogSnapshot>>,
}

impl NetworkCatalog {
    /// Create an empty cache for the local peer id
    pub fn new(self_id: impl Into<String>) -> Self {
        Self {
            self_id: self_id.into(),
            snapshots: RwLock::new(HashMap::new()),
        }
    }

    /// Replace the local peer's own snapshot
    pub async fn update_local(&self, digest: &str, entries: Vec<ContentEntry>) {
        self.snapshots.write().await.insert(
            self.self_id.clone(),
            CatalogSnapshot {
                peer_id: self.self_id.clone(),
                digest: digest.to_string(),
                entries,
                fetched_at: Instant::now(),
            },
        );
    }

    /// Fetch catalogs of peers whose digest differs from the cached one and
    /// drop snapshots of peers no longer known. Returns how many were fetched.
    ///
    /// A failed fetch keeps the previous snapshot.
    pub async fn refresh<C>(&self, peers: &[PeerRecord], client: &C) -> usize
    where
        C: PeerClient + ?Sized,
    {
        self.snapshots
            .write()
            .await
            .retain(|id, _| *id == self.self_id || peers.iter().any(|p| &p.peer_id == id));

        let mut fetched = 0;
        for peer in peers {
            if peer.peer_id == self.self_id {
                continue;
            }
            let cached = self
                .snapshots
                .read()
                .await
                .get(&peer.peer_id)
                .map(|s| s.digest.clone());
            if cached.as_deref() == Some(peer.digest.as_str()) {
                continue;
            }

            match client.fetch_catalog(peer.control_addr()).await {
                Ok(entries) => {
                    debug!("Fetched {} catalog entries from {}", entries.len(), peer.peer_id);
                    self.snapshots.write().await.insert(
                        peer.peer_id.clone(),
                        CatalogSnapshot {
                            peer_id: peer.peer_id.clone(),
                            digest: peer.digest.clone(),
                            entries,
                            fetched_at: Instant::now(),
                        },
                    );
                    fetched += 1;
                }
                Err(e) => warn!("Catalog fetch from {} failed: {}", peer.peer_id, e),
            }
        }
        if fetched > 0 {
            info!("Refreshed {} peer catalogs", fetched);
        }
        fetched
    }

    /// Cached snapshot of one peer
    pub async fn snapshot(&self, peer_id: &str) -> Option<CatalogSnapshot> {
        self.snapshots.read().await.get(peer_id).cloned()
    }

    /// Merged listing filtered by a case-insensitive substring of any alias.
    /// Entries without a hash are left out.
    pub async fn search(&self, query: &str) -> Vec<NetworkListing> {
        let query = query.trim().to_lowercase();
        let snapshots = self.snapshots.read().await;

        let mut grouped: HashMap<String, (BTreeSet<String>, u64, BTreeSet<&str>)> = HashMap::new();
        for snapshot in snapshots.values() {
            for entry in snapshot.entries.iter().filter(|e| e.has_hash()) {
                let slot = grouped
                    .entry(entry.hash.to_ascii_lowercase())
                    .or_insert_with(|| (BTreeSet::new(), entry.size, BTreeSet::new()));
                slot.0.insert(entry.name.clone());
                slot.2.insert(snapshot.peer_id.as_str());
            }
        }

        let mut listings: Vec<NetworkListing> = grouped
            .into_iter()
            .filter(|(_, (names, _, _))| query.is_empty() || names.iter().any(|n| n.to_lowercase().contains(&query)))
            .filter_map(|(hash, (names, size, peers))| {
                let primary_name = names.iter().next()?.clone();
                Some(NetworkListing {
                    hash,
                    primary_name,
                    names,
                    size,
                    peer_count: peers.len(),
                })
            })
            .collect();
        listings.sort_by(|a, b| a.primary_name.cmp(&b.primary_name).then_with(|| a.hash.cmp(&b.hash)));
        listings
    }
}
