//! Node module
//!
//! One running peer: the control server, discovery, the network catalog
//! cache and the streaming scheduler, wired together from a `Config`.

use anyhow::Result;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::catalog::local::LocalCatalog;
use crate::catalog::network::{NetworkCatalog, NetworkListing};
use crate::cli::config::Config;
use crate::discovery::bootstrap::resolve_bootstrap;
use crate::discovery::peer::PeerRecord;
use crate::discovery::service::{DiscoveryService, PeerDirectory};
use crate::error::StreamError;
use crate::events::EventSink;
use crate::peer::client::{ControlClient, PeerClient};
use crate::peer::server::ControlServer;
use crate::stream::playback::PlaybackHook;
use crate::stream::scheduler::{SessionHandle, StreamManager};
use crate::stream::session::{SessionReport, Source, StreamRequest};

/// A running peer
pub struct Node {
    peer_id: String,
    catalog: Arc<LocalCatalog>,
    server: ControlServer,
    discovery: Arc<DiscoveryService>,
    network: NetworkCatalog,
    client: Arc<ControlClient>,
    streams: StreamManager,
}

impl Node {
    /// Start the control server and discovery and publish the local catalog
    pub async fn start(config: &Config, events: EventSink, playback: Arc<dyn PlaybackHook>) -> Result<Self> {
        info!("Starting peer {}", config.peer_id);
        let catalog = Arc::new(LocalCatalog::new(config.root.clone()));

        let control_bind = SocketAddr::new(config.bind_address, config.control_port);
        let server = ControlServer::start(control_bind, catalog.clone()).await.map_err(|e| {
            error!("Failed to start control server: {}", e);
            e
        })?;
        let control_port = server.local_addr().port();

        let bootstrap = resolve_bootstrap(&config.bootstrap).await;
        let discovery = Arc::new(DiscoveryService::new(
            config.discovery_config(control_port, bootstrap),
            events.clone(),
        ));
        let digest = catalog.digest().await;
        discovery.set_digest(digest.clone()).await;
        discovery.start().await.map_err(|e| {
            error!("Failed to start discovery: {}", e);
            StreamError::discovery_error_full(
                "Failed to start discovery",
                SocketAddr::new(config.bind_address, config.discovery_port).to_string(),
                e.to_string(),
            )
        })?;

        let network = NetworkCatalog::new(config.peer_id.clone());
        network.update_local(&digest, catalog.list_entries().await).await;

        let client = Arc::new(ControlClient::new());
        let local_ip = if config.bind_address.is_unspecified() {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        } else {
            config.bind_address
        };
        let streams = StreamManager::new(
            config.stream_config(),
            catalog.clone(),
            discovery.clone() as Arc<dyn PeerDirectory>,
            client.clone() as Arc<dyn PeerClient>,
        )
        .with_events(events)
        .with_playback(playback)
        .with_local_source(Source::new(config.peer_id.clone(), SocketAddr::new(local_ip, control_port)));

        Ok(Self {
            peer_id: config.peer_id.clone(),
            catalog,
            server,
            discovery,
            network,
            client,
            streams,
        })
    }

    /// Local peer id
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Bound control server address
    pub fn control_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    /// Bound discovery address
    pub async fn discovery_addr(&self) -> Option<SocketAddr> {
        self.discovery.local_addr().await
    }

    /// Locally shared content
    pub fn catalog(&self) -> &LocalCatalog {
        &self.catalog
    }

    /// Streaming scheduler
    pub fn streams(&self) -> &StreamManager {
        &self.streams
    }

    /// Known peers
    pub async fn peers(&self) -> Vec<PeerRecord> {
        self.discovery.peers().await
    }

    /// Rescan the content root, republish the digest and refresh our own
    /// catalog snapshot. Returns the new digest.
    pub async fn rescan(&self) -> String {
        let digest = self.catalog.digest().await;
        let entries = self.catalog.list_entries().await;
        debug!("Rescanned content root: {} entries, digest {}", entries.len(), digest);
        self.discovery.set_digest(digest.clone()).await;
        self.network.update_local(&digest, entries).await;
        digest
    }

    /// Fetch catalogs of peers whose digest changed
    pub async fn refresh_network(&self) -> usize {
        let peers = self.discovery.peers().await;
        self.network.refresh(&peers, self.client.as_ref()).await
    }

    /// Search the merged network catalog
    pub async fn search(&self, query: &str) -> Vec<NetworkListing> {
        self.network.search(query).await
    }

    /// Start a streaming session on its own task
    pub fn start_stream(&self, request: StreamRequest) -> Result<SessionHandle> {
        self.streams.start(request)
    }

    /// Run a streaming session to completion
    pub async fn stream(&self, request: StreamRequest) -> Result<SessionReport> {
        self.streams.run(request).await
    }

    /// Stop a running session
    pub fn stop_stream(&self, key: &str) -> bool {
        self.streams.stop(key)
    }

    /// Say goodbye to peers and stop serving
    pub async fn shutdown(&self) {
        info!("Shutting down peer {}", self.peer_id);
        for key in self.streams.active_keys() {
            self.streams.stop(&key);
        }
        self.discovery.stop().await;
        self.server.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::playback::NoPlayback;
    use sha2::{Digest, Sha256};
    use std::time::Duration;
    use tempfile::TempDir;

    fn loopback_config(peer_id: &str) -> Config {
        Config {
            peer_id: peer_id.to_string(),
            discovery_port: 0,
            control_port: 0,
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            broadcast: false,
            ..Config::default()
        }
    }

    async fn wait_for_peer(node: &Node, peer_id: &str) {
        for _ in 0..100 {
            if node.peers().await.iter().any(|p| p.peer_id == peer_id) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("{} never saw {}", node.peer_id(), peer_id);
    }

    #[tokio::test]
    async fn test_two_nodes_stream_over_loopback() {
        let root = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();
        let data: Vec<u8> = (0..700_000u32).map(|i| (i % 241) as u8).collect();
        std::fs::write(root.path().join("holiday.mp4"), &data).unwrap();

        let seeder = Node::start(
            &Config {
                root: Some(root.path().to_path_buf()),
                ..loopback_config("seeder")
            },
            EventSink::disabled(),
            Arc::new(NoPlayback),
        )
        .await
        .unwrap();
        let seeder_discovery = seeder.discovery_addr().await.unwrap();

        let viewer = Node::start(
            &Config {
                staging: Some(staging.path().to_path_buf()),
                bootstrap: vec![seeder_discovery.to_string()],
                ..loopback_config("viewer")
            },
            EventSink::disabled(),
            Arc::new(NoPlayback),
        )
        .await
        .unwrap();

        wait_for_peer(&viewer, "seeder").await;
        wait_for_peer(&seeder, "viewer").await;

        assert_eq!(viewer.refresh_network().await, 1);
        let listings = viewer.search("holiday").await;
        assert_eq!(listings.len(), 1);
        let hash = hex::encode(Sha256::digest(&data));
        assert_eq!(listings[0].hash, hash);

        let report = viewer
            .stream(StreamRequest::named(hash, listings[0].primary_name.clone()))
            .await
            .unwrap();
        assert_eq!(report.used_sources, vec!["seeder"]);
        assert_eq!(report.total_chunks, 3);
        assert_eq!(std::fs::read(&report.output).unwrap(), data);

        viewer.shutdown().await;
        seeder.shutdown().await;
    }

    #[tokio::test]
    async fn test_rescan_publishes_new_digest() {
        let root = TempDir::new().unwrap();
        let node = Node::start(
            &Config {
                root: Some(root.path().to_path_buf()),
                ..loopback_config("solo")
            },
            EventSink::disabled(),
            Arc::new(NoPlayback),
        )
        .await
        .unwrap();

        let before = node.rescan().await;
        std::fs::write(root.path().join("new.mkv"), b"fresh").unwrap();
        let after = node.rescan().await;
        assert_ne!(before, after);
        assert_eq!(node.search("new").await.len(), 1);
        node.shutdown().await;
    }
}
