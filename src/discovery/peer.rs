//! Peer records
//!
//! What discovery knows about another peer on the LAN.

use serde::Serialize;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use crate::protocol::message::DiscoveryMessage;

/// A peer learned through discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerRecord {
    /// Opaque peer identifier
    pub peer_id: String,
    /// Address datagrams from this peer arrived from
    pub address: IpAddr,
    /// Control server port
    pub control_port: u16,
    /// Discovery port
    pub discovery_port: u16,
    /// Last advertised catalog digest
    pub digest: String,
    /// When we last heard from the peer
    #[serde(skip)]
    pub last_seen: Instant,
}

impl PeerRecord {
    /// Build a record from a received message and its source address
    pub fn from_message(msg: &DiscoveryMessage, address: IpAddr, now: Instant) -> Self {
        Self {
            peer_id: msg.peer_id.clone(),
            address,
            control_port: msg.tcp_port,
            discovery_port: msg.discovery_port,
            digest: msg.digest.clone(),
            last_seen: now,
        }
    }

    /// Endpoint of the peer's control server
    pub fn control_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.control_port)
    }

    /// Endpoint of the peer's discovery socket
    pub fn discovery_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.discovery_port)
    }

    /// Whether the peer has been silent for longer than `timeout` at `now`
    pub fn is_expired(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) > timeout
    }
}
