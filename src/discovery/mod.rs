//! Discovery module
//!
//! Finds other peers on the LAN through UDP gossip and keeps a live table
//! of them.

pub mod bootstrap;
pub mod peer;
pub mod service;
pub mod table;

pub use bootstrap::{resolve_bootstrap, split_bootstrap};
pub use peer::PeerRecord;
pub use service::{DiscoveryConfig, DiscoveryService, DiscoveryTimings, PeerDirectory};
pub use table::{PeerTable, SeenMessages, Upsert};
