//! Discovery service
//!
//! UDP gossip: periodic HELLOs to the broadcast address, bootstrap endpoints
//! and known peers; HELLO_ACK replies; bounded re-flooding by TTL; BYE on
//! shutdown; eviction of silent peers.

use anyhow::Result;
use async_trait::async_trait;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, trace, warn};

use crate::discovery::peer::PeerRecord;
use crate::discovery::table::{PeerTable, SeenMessages, Upsert};
use crate::error::StreamError;
use crate::events::{EventSink, NodeEvent};
use crate::protocol::constants::{
    CLEANUP_INTERVAL, DISCOVERY_PORT_DEFAULT, HELLO_INTERVAL, MAX_DATAGRAM_BYTES, PEER_TIMEOUT, SEEN_MESSAGE_TTL,
    TTL_DEFAULT,
};
use crate::protocol::message::{DiscoveryMessage, MessageKind};

/// Read access to the set of known peers
#[async_trait]
pub trait PeerDirectory: Send + Sync {
    /// Whether discovery is running
    fn is_online(&self) -> bool;

    /// Snapshot of known peers
    async fn peers(&self) -> Vec<PeerRecord>;
}

/// Discovery timers
#[derive(Debug, Clone, Copy)]
pub struct DiscoveryTimings {
    pub hello_interval: Duration,
    pub peer_timeout: Duration,
    pub cleanup_interval: Duration,
    pub seen_retention: Duration,
}

impl Default for DiscoveryTimings {
    fn default() -> Self {
        Self {
            hello_interval: HELLO_INTERVAL,
            peer_timeout: PEER_TIMEOUT,
            cleanup_interval: CLEANUP_INTERVAL,
            seen_retention: SEEN_MESSAGE_TTL,
        }
    }
}

/// Discovery configuration
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Local peer id
    pub peer_id: String,
    /// UDP bind address
    pub bind_addr: SocketAddr,
    /// Control server port advertised to peers
    pub control_port: u16,
    /// Extra HELLO destinations
    pub bootstrap: Vec<SocketAddr>,
    /// Send HELLOs to 255.255.255.255
    pub broadcast: bool,
    /// Hop budget of emitted HELLOs
    pub ttl: u32,
    pub timings: DiscoveryTimings,
}

impl DiscoveryConfig {
    /// Configuration with protocol defaults
    pub fn new(peer_id: impl Into<String>, control_port: u16) -> Self {
        Self {
            peer_id: peer_id.into(),
            bind_addr: SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), DISCOVERY_PORT_DEFAULT),
            control_port,
            bootstrap: Vec::new(),
            broadcast: true,
            ttl: TTL_DEFAULT,
            timings: DiscoveryTimings::default(),
        }
    }
}

struct Inner {
    config: DiscoveryConfig,
    table: PeerTable,
    seen: SeenMessages,
    digest: RwLock<String>,
    socket: RwLock<Option<Arc<UdpSocket>>>,
    running: AtomicBool,
    receiving: AtomicBool,
    events: EventSink,
}

/// LAN peer discovery over UDP gossip
pub struct DiscoveryService {
    inner: Arc<Inner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DiscoveryService {
    /// Create a stopped service
    pub fn new(config: DiscoveryConfig, events: EventSink) -> Self {
        let table = PeerTable::new(config.peer_id.clone());
        let seen = SeenMessages::new(config.timings.seen_retention);
        Self {
            inner: Arc::new(Inner {
                config,
                table,
                seen,
                digest: RwLock::new(String::new()),
                socket: RwLock::new(None),
                running: AtomicBool::new(false),
                receiving: AtomicBool::new(false),
                events,
            }),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Bind the socket, start the receive, hello and cleanup tasks and send
    /// an immediate HELLO. Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        if self.inner.running.load(Ordering::SeqCst) {
            return Err(StreamError::discovery_error("Discovery already running").into());
        }

        let bind_addr = self.inner.config.bind_addr;
        info!("Starting discovery on {}", bind_addr);
        let socket = UdpSocket::bind(bind_addr).await.map_err(|e| {
            error!("Failed to bind discovery socket to {}: {}", bind_addr, e);
            StreamError::discovery_error_full("Failed to bind discovery socket", bind_addr.to_string(), e.to_string())
        })?;
        if self.inner.config.broadcast {
            socket.set_broadcast(true).map_err(|e| {
                StreamError::discovery_error_full("Failed to enable broadcast", bind_addr.to_string(), e.to_string())
            })?;
        }
        let local_addr = socket.local_addr()?;
        let socket = Arc::new(socket);
        *self.inner.socket.write().await = Some(socket.clone());
        self.inner.running.store(true, Ordering::SeqCst);
        self.inner.receiving.store(true, Ordering::SeqCst);

        let mut tasks = self.tasks.lock().await;
        tasks.push(tokio::spawn(Inner::receive_loop(self.inner.clone(), socket.clone())));
        tasks.push(tokio::spawn(Inner::hello_loop(self.inner.clone(), socket.clone())));
        tasks.push(tokio::spawn(Inner::cleanup_loop(self.inner.clone())));
        drop(tasks);

        self.inner.send_hello(&socket).await;
        info!("Discovery running on {} as {}", local_addr, self.inner.config.peer_id);
        Ok(local_addr)
    }

    /// Send BYE to known peers, stop every task and forget all state
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Stopping discovery");
        self.inner.receiving.store(false, Ordering::SeqCst);

        if let Some(socket) = self.inner.socket.write().await.take() {
            let port = self.inner.advertised_port(&socket);
            let bye = DiscoveryMessage::bye(&self.inner.config.peer_id, self.inner.config.control_port, port);
            for target in self.inner.targets(port).await {
                self.inner.send(&socket, &bye, target).await;
            }
        }

        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }

        let removed = self.inner.table.clear().await;
        self.inner.seen.clear().await;
        if removed > 0 {
            self.inner.events.emit(NodeEvent::PeerCountChanged { count: 0 });
        }
    }

    /// Replace the digest advertised in subsequent HELLOs and acks
    pub async fn set_digest(&self, digest: impl Into<String>) {
        let digest = digest.into();
        debug!("Advertising catalog digest {}", digest);
        *self.inner.digest.write().await = digest;
    }

    /// Snapshot of known peers
    pub async fn peers(&self) -> Vec<PeerRecord> {
        self.inner.table.snapshot().await
    }

    /// Number of known peers
    pub async fn peer_count(&self) -> usize {
        self.inner.table.len().await
    }

    /// Whether the service has been started and not stopped
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Whether the receive loop is still reading datagrams. A socket error
    /// ends it for good; `stop` then `start` brings it back.
    pub fn is_receiving(&self) -> bool {
        self.inner.receiving.load(Ordering::SeqCst)
    }

    /// Bound socket address while running
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.inner
            .socket
            .read()
            .await
            .as_ref()
            .and_then(|s| s.local_addr().ok())
    }

    /// Local peer id
    pub fn peer_id(&self) -> &str {
        &self.inner.config.peer_id
    }
}

impl Drop for DiscoveryService {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

#[async_trait]
impl PeerDirectory for DiscoveryService {
    fn is_online(&self) -> bool {
        self.is_running() && self.is_receiving()
    }

    async fn peers(&self) -> Vec<PeerRecord> {
        DiscoveryService::peers(self).await
    }
}

impl Inner {
    fn advertised_port(&self, socket: &UdpSocket) -> u16 {
        socket
            .local_addr()
            .map(|a| a.port())
            .unwrap_or(self.config.bind_addr.port())
    }

    /// Broadcast address, bootstrap endpoints and known peers, without repeats
    async fn targets(&self, port: u16) -> Vec<SocketAddr> {
        let mut targets = Vec::new();
        if self.config.broadcast {
            targets.push(SocketAddr::new(Ipv4Addr::BROADCAST.into(), port));
        }
        for addr in &self.config.bootstrap {
            if !targets.contains(addr) {
                targets.push(*addr);
            }
        }
        for peer in self.table.snapshot().await {
            let addr = peer.discovery_addr();
            if !targets.contains(&addr) {
                targets.push(addr);
            }
        }
        targets
    }

    async fn send(&self, socket: &UdpSocket, msg: &DiscoveryMessage, target: SocketAddr) {
        let data = match msg.encode() {
            Ok(data) => data,
            Err(e) => {
                warn!("Not sending {}: {}", msg.kind, e);
                return;
            }
        };
        match socket.send_to(&data, target).await {
            Ok(_) => trace!("Sent {} {} to {}", msg.kind, msg.msg_id, target),
            Err(e) => debug!("Failed to send {} to {}: {}", msg.kind, target, e),
        }
    }

    async fn send_hello(&self, socket: &UdpSocket) {
        let port = self.advertised_port(socket);
        let digest = self.digest.read().await.clone();
        let hello = DiscoveryMessage::hello(&self.config.peer_id, self.config.ttl, self.config.control_port, port, &digest);
        for target in self.targets(port).await {
            self.send(socket, &hello, target).await;
        }
    }

    async fn receive_loop(self: Arc<Self>, socket: Arc<UdpSocket>) {
        let mut buffer = vec![0u8; MAX_DATAGRAM_BYTES * 2];
        loop {
            match socket.recv_from(&mut buffer).await {
                Ok((len, from)) => {
                    if len > MAX_DATAGRAM_BYTES {
                        trace!("Dropping oversize datagram ({} bytes) from {}", len, from);
                        continue;
                    }
                    if let Err(e) = self.handle_datagram(&socket, &buffer[..len], from).await {
                        trace!("Ignoring datagram from {}: {}", from, e);
                    }
                }
                Err(e) => {
                    self.receive_failed(&e);
                    break;
                }
            }
        }
    }

    /// Socket errors are not retried
    fn receive_failed(&self, e: &std::io::Error) {
        self.receiving.store(false, Ordering::SeqCst);
        if self.running.load(Ordering::SeqCst) {
            error!("Discovery receive loop stopped: {}", e);
        } else {
            debug!("Discovery receive loop ended: {}", e);
        }
    }

    async fn hello_loop(self: Arc<Self>, socket: Arc<UdpSocket>) {
        let mut ticker = interval(self.config.timings.hello_interval);
        // The first tick completes immediately; start() already sent a HELLO.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            self.send_hello(&socket).await;
        }
    }

    async fn cleanup_loop(self: Arc<Self>) {
        let mut ticker = interval(self.config.timings.cleanup_interval);
        loop {
            ticker.tick().await;
            let now = Instant::now();
            let removed = self.table.sweep_expired(now, self.config.timings.peer_timeout).await;
            if !removed.is_empty() {
                for peer in &removed {
                    info!("Peer {} timed out", peer.peer_id);
                }
                let count = self.table.len().await;
                self.events.emit(NodeEvent::PeerCountChanged { count });
            }
            let pruned = self.seen.prune(now).await;
            if pruned > 0 {
                trace!("Pruned {} seen message ids", pruned);
            }
        }
    }

    async fn handle_datagram(&self, socket: &UdpSocket, data: &[u8], from: SocketAddr) -> Result<()> {
        let msg = DiscoveryMessage::decode(data)?;
        if msg.peer_id == self.config.peer_id {
            return Ok(());
        }
        let now = Instant::now();
        if !self.seen.first_sighting(&msg, now).await {
            trace!("Duplicate {} {} from {}", msg.kind, msg.msg_id, msg.peer_id);
            return Ok(());
        }

        match msg.kind {
            MessageKind::Hello => {
                self.record_peer(&msg, from, now).await;

                let port = self.advertised_port(socket);
                let digest = self.digest.read().await.clone();
                let ack = DiscoveryMessage::hello_ack(&msg.msg_id, &self.config.peer_id, self.config.control_port, port, &digest);
                self.send(socket, &ack, SocketAddr::new(from.ip(), msg.discovery_port)).await;

                if let Some(forward) = msg.forwarded() {
                    let origin = SocketAddr::new(from.ip(), msg.discovery_port);
                    for peer in self.table.snapshot().await {
                        if peer.peer_id == msg.peer_id || peer.discovery_addr() == origin {
                            continue;
                        }
                        self.send(socket, &forward, peer.discovery_addr()).await;
                    }
                }
            }
            MessageKind::HelloAck => {
                self.record_peer(&msg, from, now).await;
            }
            MessageKind::Bye => {
                if self.table.remove(&msg.peer_id).await.is_some() {
                    info!("Peer {} left", msg.peer_id);
                    let count = self.table.len().await;
                    self.events.emit(NodeEvent::PeerCountChanged { count });
                }
            }
        }
        Ok(())
    }

    async fn record_peer(&self, msg: &DiscoveryMessage, from: SocketAddr, now: Instant) {
        let record = PeerRecord::from_message(msg, from.ip(), now);
        if self.table.upsert(record).await == Upsert::Inserted {
            info!("Discovered peer {} at {}", msg.peer_id, from.ip());
            let count = self.table.len().await;
            self.events.emit(NodeEvent::PeerCountChanged { count });
        }
    }
}
