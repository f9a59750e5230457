//! Streaming download scheduler
//!
//! Drives one session per content key through sourcing, metadata, an
//! in-order prefetch window, a shuffled first pass and bounded repair
//! rounds, then reassembles the output.

use anyhow::Result;
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, trace, warn};

use crate::catalog::local::LocalCatalog;
use crate::discovery::service::PeerDirectory;
use crate::error::StreamError;
use crate::events::{EventSink, NodeEvent, SessionOutcome};
use crate::peer::client::{ContentMeta, PeerClient};
use crate::protocol::constants::{PLAYBACK_THRESHOLD_PCT, PREFETCH_WINDOW, REPAIR_ROUNDS};
use crate::storage::chunk::ChunkLayout;
use crate::storage::staging::StagingArea;
use crate::stream::order::{first_pass_order, prefetch_len, repair_order, session_rng, FaultInjection};
use crate::stream::playback::{NoPlayback, PlaybackHook};
use crate::stream::session::{SessionReport, SessionState, Source, StreamRequest};

/// Scheduler settings
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Where chunk directories and output files are written
    pub staging_dir: Option<PathBuf>,
    /// Leading chunks fetched strictly in order
    pub prefetch_window: u32,
    /// Percent of chunks on disk before playback is signaled
    pub playback_threshold_pct: u8,
    /// Extra passes over missing chunks after the first pass
    pub repair_rounds: u32,
    pub faults: FaultInjection,
    /// Seed for chunk ordering and fault injection
    pub seed: Option<u64>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            staging_dir: None,
            prefetch_window: PREFETCH_WINDOW,
            playback_threshold_pct: PLAYBACK_THRESHOLD_PCT,
            repair_rounds: REPAIR_ROUNDS,
            faults: FaultInjection::disabled(),
            seed: None,
        }
    }
}

impl StreamConfig {
    /// Defaults with a staging directory
    pub fn with_staging(staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            staging_dir: Some(staging_dir.into()),
            ..Self::default()
        }
    }
}

type ActiveSessions = Arc<Mutex<HashMap<String, Arc<AtomicBool>>>>;

/// Holds a key in the active-session registry until dropped
struct ActiveSlot {
    registry: ActiveSessions,
    key: String,
    stop: Arc<AtomicBool>,
}

impl Drop for ActiveSlot {
    fn drop(&mut self) {
        let mut active = self.registry.lock().unwrap_or_else(|p| p.into_inner());
        if active.get(&self.key).is_some_and(|flag| Arc::ptr_eq(flag, &self.stop)) {
            active.remove(&self.key);
            trace!("Released session slot for {}", self.key);
        }
    }
}

/// A session running on its own task
pub struct SessionHandle {
    key: String,
    stop: Arc<AtomicBool>,
    task: JoinHandle<Result<SessionReport>>,
}

impl SessionHandle {
    /// Content key of the session
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Ask the session to stop before its next chunk attempt
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Wait for the session to finish
    pub async fn wait(self) -> Result<SessionReport> {
        self.task.await?
    }
}

/// Mutable state of one session's chunk loop
struct Progress {
    present: BTreeSet<u32>,
    used_sources: Vec<String>,
    cursor: usize,
    playback_signaled: bool,
}

/// Starts and tracks streaming sessions
#[derive(Clone)]
pub struct StreamManager {
    config: StreamConfig,
    catalog: Arc<LocalCatalog>,
    directory: Arc<dyn PeerDirectory>,
    client: Arc<dyn PeerClient>,
    events: EventSink,
    playback: Arc<dyn PlaybackHook>,
    local_source: Option<Source>,
    active: ActiveSessions,
}

impl StreamManager {
    /// Create a manager with no event sink, no playback and no local source
    pub fn new(
        config: StreamConfig,
        catalog: Arc<LocalCatalog>,
        directory: Arc<dyn PeerDirectory>,
        client: Arc<dyn PeerClient>,
    ) -> Self {
        Self {
            config,
            catalog,
            directory,
            client,
            events: EventSink::disabled(),
            playback: Arc::new(NoPlayback),
            local_source: None,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Send progress to `events`
    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    /// Signal playback through `playback`
    pub fn with_playback(mut self, playback: Arc<dyn PlaybackHook>) -> Self {
        self.playback = playback;
        self
    }

    /// Serve locally held content through this peer's own control server
    pub fn with_local_source(mut self, source: Source) -> Self {
        self.local_source = Some(source);
        self
    }

    /// Scheduler settings
    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Keys with a running session
    pub fn active_keys(&self) -> Vec<String> {
        let active = self.active.lock().unwrap_or_else(|p| p.into_inner());
        let mut keys: Vec<String> = active.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Whether a session for `key` is running
    pub fn is_active(&self, key: &str) -> bool {
        self.active.lock().unwrap_or_else(|p| p.into_inner()).contains_key(key)
    }

    /// Ask the session for `key` to stop. Returns false if none is running.
    ///
    /// The slot is released once the session notices, between chunk
    /// attempts. Chunk files already written are kept.
    pub fn stop(&self, key: &str) -> bool {
        let active = self.active.lock().unwrap_or_else(|p| p.into_inner());
        match active.get(key) {
            Some(flag) => {
                info!("Stopping session {}", key);
                flag.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Validate and start a session on its own task.
    ///
    /// Configuration problems and a duplicate key are reported here, before
    /// any network traffic.
    pub fn start(&self, request: StreamRequest) -> Result<SessionHandle> {
        let slot = self.begin(&request)?;
        let stop = slot.stop.clone();
        let key = request.key.clone();
        let manager = self.clone();
        let task = tokio::spawn(async move { manager.drive(request, slot).await });
        Ok(SessionHandle { key, stop, task })
    }

    /// Validate and run a session to completion on the current task
    pub async fn run(&self, request: StreamRequest) -> Result<SessionReport> {
        let slot = self.begin(&request)?;
        self.drive(request, slot).await
    }

    fn begin(&self, request: &StreamRequest) -> Result<ActiveSlot> {
        debug!("Session {} -> {}", request.key, SessionState::Init);
        if self.config.staging_dir.is_none() {
            return Err(StreamError::config_error_with_field("No staging folder configured", "staging_dir").into());
        }
        if !self.directory.is_online() {
            return Err(StreamError::discovery_error("Not connected: discovery is not running").into());
        }

        let mut active = self.active.lock().unwrap_or_else(|p| p.into_inner());
        if active.contains_key(&request.key) {
            warn!("Session for {} is already active", request.key);
            return Err(StreamError::SessionActive {
                key: request.key.clone(),
            }
            .into());
        }
        let stop = Arc::new(AtomicBool::new(false));
        active.insert(request.key.clone(), stop.clone());
        Ok(ActiveSlot {
            registry: self.active.clone(),
            key: request.key.clone(),
            stop,
        })
    }

    async fn drive(&self, request: StreamRequest, slot: ActiveSlot) -> Result<SessionReport> {
        let result = self.execute(&request, &slot.stop).await;
        let outcome = match &result {
            Ok(report) => {
                debug!("Session {} -> {}", request.key, SessionState::Complete);
                info!(
                    "Stream of {} complete: {} chunks from {} sources",
                    request.key,
                    report.total_chunks,
                    report.used_sources.len()
                );
                SessionOutcome::Completed {
                    output: report.output.clone(),
                }
            }
            Err(e) => {
                debug!("Session {} -> {}", request.key, SessionState::Failed);
                error!("Stream of {} failed: {}", request.key, e);
                SessionOutcome::Failed { reason: e.to_string() }
            }
        };
        drop(slot);
        self.events.emit(NodeEvent::SessionFinished {
            key: request.key.clone(),
            outcome,
        });
        result
    }

    async fn execute(&self, request: &StreamRequest, stop: &AtomicBool) -> Result<SessionReport> {
        let key = request.key.as_str();
        let staging_dir = self
            .config
            .staging_dir
            .as_deref()
            .ok_or_else(|| StreamError::config_error_with_field("No staging folder configured", "staging_dir"))?;

        debug!("Session {} -> {}", key, SessionState::Sourcing);
        let sources = self.find_sources(key).await?;
        let meta = self.fetch_meta(key, &sources).await?;

        let layout = ChunkLayout::new(meta.size);
        let total = layout.count();
        let staging = StagingArea::new(staging_dir, key, &request.display_name, layout);
        debug!("Staging {} in {}", key, staging.session_dir().display());
        let present = staging.prepare().await?;

        self.events.emit(NodeEvent::SessionStarted {
            key: key.to_string(),
            sources: sources.len(),
            total_chunks: total,
        });
        info!("Streaming {} ({} bytes, {} chunks) from {} sources", key, meta.size, total, sources.len());

        let mut rng = session_rng(self.config.seed);
        let prefetch = prefetch_len(total, self.config.prefetch_window);
        let mut progress = Progress {
            present,
            used_sources: Vec::new(),
            cursor: 0,
            playback_signaled: false,
        };

        debug!("Session {} -> {}", key, SessionState::Downloading);
        for index in first_pass_order(total, self.config.prefetch_window, &mut rng) {
            check_stopped(key, stop)?;
            if progress.present.contains(&index) {
                continue;
            }
            if self.config.faults.should_skip(index, prefetch, &mut rng) {
                trace!("Injected loss: skipping chunk {} of {}", index, key);
                continue;
            }
            self.fetch_into(key, index, total, &sources, &staging, &mut progress).await?;
        }

        let mut repair_rounds = 0;
        for round in 1..=self.config.repair_rounds {
            let missing = missing_indices(total, &progress.present);
            if missing.is_empty() {
                break;
            }
            repair_rounds = round;
            debug!("Session {} -> {}", key, SessionState::Repairing { round });
            info!("Repair round {} for {}: {} chunks missing", round, key, missing.len());
            for index in repair_order(missing, &mut rng) {
                check_stopped(key, stop)?;
                self.fetch_into(key, index, total, &sources, &staging, &mut progress).await?;
            }
        }

        let missing = missing_indices(total, &progress.present);
        if !missing.is_empty() {
            return Err(StreamError::MissingChunks {
                key: key.to_string(),
                indices: missing,
            }
            .into());
        }

        let output = staging.reassemble().await?;
        Ok(SessionReport {
            key: key.to_string(),
            size: meta.size,
            total_chunks: total,
            sources,
            used_sources: progress.used_sources,
            repair_rounds,
            streaming_path: staging.streaming_path().to_path_buf(),
            output,
        })
    }

    /// Peers answering YES to HAS, in directory order, or the local peer
    async fn find_sources(&self, key: &str) -> Result<Vec<Source>> {
        let peers = self.directory.peers().await;
        let mut queries = JoinSet::new();
        for (position, peer) in peers.iter().enumerate() {
            let client = self.client.clone();
            let addr = peer.control_addr();
            let id = key.to_string();
            queries.spawn(async move { (position, client.has_content(addr, &id).await) });
        }

        let mut positive = Vec::new();
        while let Some(joined) = queries.join_next().await {
            match joined {
                Ok((position, Ok(true))) => positive.push(position),
                Ok((position, Ok(false))) => trace!("{} does not have {}", peers[position].peer_id, key),
                Ok((position, Err(e))) => debug!("HAS query to {} failed: {}", peers[position].peer_id, e),
                Err(e) => warn!("HAS query task failed: {}", e),
            }
        }
        positive.sort_unstable();
        let sources: Vec<Source> = positive
            .into_iter()
            .map(|position| Source::new(peers[position].peer_id.clone(), peers[position].control_addr()))
            .collect();
        if !sources.is_empty() {
            debug!("{} peers have {}", sources.len(), key);
            return Ok(sources);
        }

        if let Some(local) = &self.local_source {
            if let Some(found) = self.catalog.resolve(key).await {
                info!("No peer has {}; using local copy {}", key, found.path.display());
                return Ok(vec![local.clone()]);
            }
        }

        warn!("No peer has {}", key);
        Err(StreamError::NoSource { key: key.to_string() }.into())
    }

    /// First successful META answer from the sources, in order
    async fn fetch_meta(&self, key: &str, sources: &[Source]) -> Result<ContentMeta> {
        for source in sources {
            match self.client.fetch_meta(source.addr, key).await {
                Ok(meta) => {
                    debug!("META for {} from {}: {} bytes, {} chunks", key, source, meta.size, meta.chunks);
                    return Ok(meta);
                }
                Err(e) => debug!("META for {} from {} failed: {}", key, source, e),
            }
        }
        Err(StreamError::MetaUnavailable {
            key: key.to_string(),
            attempts: sources.len(),
        }
        .into())
    }

    /// Try every source once for one chunk, starting from the round-robin
    /// cursor. A chunk nobody served is left for the next pass.
    async fn fetch_into(
        &self,
        key: &str,
        index: u32,
        total: u32,
        sources: &[Source],
        staging: &StagingArea,
        progress: &mut Progress,
    ) -> Result<()> {
        let count = sources.len();
        if count == 0 {
            return Ok(());
        }
        let start = progress.cursor % count;
        progress.cursor = progress.cursor.wrapping_add(1);

        for attempt in 0..count {
            let source = &sources[(start + attempt) % count];
            let data = match self.client.fetch_chunk(source.addr, key, index).await {
                Ok(data) => data,
                Err(e) => {
                    debug!("Chunk {} of {} from {} failed: {}", index, key, source, e);
                    continue;
                }
            };
            if let Err(e) = staging.store_chunk(index, &data).await {
                if e.downcast_ref::<StreamError>().is_some_and(StreamError::is_transient) {
                    warn!("Rejected chunk {} of {} from {}: {}", index, key, source, e);
                    continue;
                }
                return Err(e);
            }

            progress.present.insert(index);
            if !progress.used_sources.contains(&source.peer_id) {
                progress.used_sources.push(source.peer_id.clone());
            }
            let percent = percent_of(progress.present.len(), total);
            self.events.emit(NodeEvent::ChunkStored {
                key: key.to_string(),
                index,
                total,
                percent,
                source: source.peer_id.clone(),
            });

            if !progress.playback_signaled && percent >= self.config.playback_threshold_pct {
                progress.playback_signaled = true;
                info!("Playback threshold reached for {} at {}%", key, percent);
                self.playback.open(staging.streaming_path());
                self.events.emit(NodeEvent::PlaybackReady {
                    key: key.to_string(),
                    path: staging.streaming_path().to_path_buf(),
                });
            }
            return Ok(());
        }
        Ok(())
    }
}

fn check_stopped(key: &str, stop: &AtomicBool) -> Result<()> {
    if stop.load(Ordering::SeqCst) {
        info!("Session {} stopped", key);
        return Err(StreamError::SessionStopped { key: key.to_string() }.into());
    }
    Ok(())
}

fn missing_indices(total: u32, present: &BTreeSet<u32>) -> Vec<u32> {
    (0..total).filter(|index| !present.contains(index)).collect()
}

fn percent_of(present: usize, total: u32) -> u8 {
    if total == 0 {
        return 100;
    }
    ((present as u64 * 100) / total as u64).min(100) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::entry::ContentEntry;
    use crate::discovery::peer::PeerRecord;
    use crate::protocol::constants::CHUNK_SIZE;
    use crate::protocol::message::DiscoveryMessage;
    use crate::storage::chunk::chunk_count;
    use async_trait::async_trait;
    use bytes::Bytes;
    use sha2::{Digest, Sha256};
    use std::collections::HashSet;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct FakeDirectory {
        online: bool,
        peers: Vec<PeerRecord>,
    }

    #[async_trait]
    impl PeerDirectory for FakeDirectory {
        fn is_online(&self) -> bool {
            self.online
        }

        async fn peers(&self) -> Vec<PeerRecord> {
            self.peers.clone()
        }
    }

    #[derive(Default)]
    struct FakeNetwork {
        holders: HashMap<SocketAddr, Vec<u8>>,
        broken_chunks: HashSet<SocketAddr>,
        short_chunks: HashSet<SocketAddr>,
        broken_meta: bool,
        lost_index: Option<u32>,
        delay: Option<Duration>,
        calls: AtomicUsize,
        chunk_log: Mutex<Vec<(SocketAddr, u32)>>,
    }

    impl FakeNetwork {
        fn content(&self, addr: SocketAddr) -> Result<&Vec<u8>> {
            self.holders
                .get(&addr)
                .ok_or_else(|| StreamError::network_error_full("Failed to connect", addr.to_string(), "connection refused").into())
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn chunk_log(&self) -> Vec<(SocketAddr, u32)> {
            self.chunk_log.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PeerClient for FakeNetwork {
        async fn fetch_catalog(&self, _addr: SocketAddr) -> Result<Vec<ContentEntry>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Vec::new())
        }

        async fn has_content(&self, addr: SocketAddr, _id: &str) -> Result<bool> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.holders.contains_key(&addr))
        }

        async fn fetch_meta(&self, addr: SocketAddr, _id: &str) -> Result<ContentMeta> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.broken_meta {
                anyhow::bail!("meta timed out");
            }
            let size = self.content(addr)?.len() as u64;
            Ok(ContentMeta {
                size,
                chunks: chunk_count(size, CHUNK_SIZE),
            })
        }

        async fn fetch_chunk(&self, addr: SocketAddr, _id: &str, index: u32) -> Result<Bytes> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.chunk_log.lock().unwrap().push((addr, index));
            if self.broken_chunks.contains(&addr) || self.lost_index == Some(index) {
                anyhow::bail!("connection reset");
            }
            let data = self.content(addr)?;
            let layout = ChunkLayout::new(data.len() as u64);
            let len = layout
                .len_of(index)
                .ok_or_else(|| StreamError::remote_error(crate::error::RemoteErrorCode::Range, addr.to_string()))?;
            let start = layout.offset(index) as usize;
            let end = if self.short_chunks.contains(&addr) {
                start + len as usize - 1
            } else {
                start + len as usize
            };
            Ok(Bytes::copy_from_slice(&data[start..end]))
        }
    }

    #[derive(Default)]
    struct CountingPlayback {
        opened: Mutex<Vec<PathBuf>>,
    }

    impl PlaybackHook for CountingPlayback {
        fn open(&self, path: &Path) {
            self.opened.lock().unwrap().push(path.to_path_buf());
        }
    }

    fn content(chunks: u64) -> Vec<u8> {
        let len = CHUNK_SIZE * (chunks - 1) + 777;
        (0..len).map(|i| (i % 253) as u8).collect()
    }

    fn hash_of(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    fn peer(id: &str, control_port: u16) -> PeerRecord {
        let msg = DiscoveryMessage::hello(id, 2, control_port, 40000, "");
        PeerRecord::from_message(&msg, IpAddr::V4(Ipv4Addr::LOCALHOST), Instant::now())
    }

    fn manager(config: StreamConfig, peers: Vec<PeerRecord>, network: Arc<FakeNetwork>) -> StreamManager {
        StreamManager::new(
            config,
            Arc::new(LocalCatalog::new(None)),
            Arc::new(FakeDirectory { online: true, peers }),
            network,
        )
    }

    fn drain(rx: &mut UnboundedReceiver<NodeEvent>) -> Vec<NodeEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_stream_from_single_peer() {
        let staging = TempDir::new().unwrap();
        let data = content(5);
        let network = Arc::new(FakeNetwork {
            holders: HashMap::from([(addr(1), data.clone())]),
            ..Default::default()
        });
        let (events, mut rx) = EventSink::channel();
        let manager = manager(StreamConfig::with_staging(staging.path()), vec![peer("peer-a", 1)], network)
            .with_events(events);

        let request = StreamRequest::named(hash_of(&data), "clip.mp4");
        let report = manager.run(request.clone()).await.unwrap();
        assert_eq!(report.total_chunks, 5);
        assert_eq!(report.size, data.len() as u64);
        assert_eq!(report.used_sources, vec!["peer-a"]);
        assert_eq!(report.repair_rounds, 0);
        assert_eq!(std::fs::read(&report.output).unwrap(), data);
        assert_eq!(std::fs::read(&report.streaming_path).unwrap(), data);
        assert!(report.output.ends_with("clip.mp4.complete"));
        assert!(!manager.is_active(&request.key));

        let events = drain(&mut rx);
        assert!(matches!(events.first(), Some(NodeEvent::SessionStarted { total_chunks: 5, .. })));
        let stored = events.iter().filter(|e| matches!(e, NodeEvent::ChunkStored { .. })).count();
        assert_eq!(stored, 5);
        assert!(matches!(
            events.last(),
            Some(NodeEvent::SessionFinished { outcome: SessionOutcome::Completed { .. }, .. })
        ));
    }

    #[tokio::test]
    async fn test_failing_source_is_never_credited() {
        let staging = TempDir::new().unwrap();
        let data = content(6);
        let network = Arc::new(FakeNetwork {
            holders: HashMap::from([(addr(1), data.clone()), (addr(2), data.clone())]),
            broken_chunks: HashSet::from([addr(1)]),
            ..Default::default()
        });
        let manager = manager(
            StreamConfig::with_staging(staging.path()),
            vec![peer("peer-a", 1), peer("peer-b", 2)],
            network.clone(),
        );

        let report = manager.run(StreamRequest::new(hash_of(&data))).await.unwrap();
        assert_eq!(report.sources.len(), 2);
        assert_eq!(report.used_sources, vec!["peer-b"]);
        assert_eq!(std::fs::read(&report.output).unwrap(), data);
        // the cursor alternates the first source, so peer-a is only tried on even chunks
        let tried: Vec<u32> = network
            .chunk_log()
            .into_iter()
            .filter(|(a, _)| *a == addr(1))
            .map(|(_, i)| i)
            .collect();
        assert_eq!(tried, vec![0, 2, 4]);
    }

    #[tokio::test]
    async fn test_truncated_chunk_moves_to_next_source() {
        let staging = TempDir::new().unwrap();
        let data = content(4);
        let network = Arc::new(FakeNetwork {
            holders: HashMap::from([(addr(1), data.clone()), (addr(2), data.clone())]),
            short_chunks: HashSet::from([addr(1)]),
            ..Default::default()
        });
        let manager = manager(
            StreamConfig::with_staging(staging.path()),
            vec![peer("peer-a", 1), peer("peer-b", 2)],
            network.clone(),
        );

        let report = manager.run(StreamRequest::new(hash_of(&data))).await.unwrap();
        assert_eq!(report.used_sources, vec!["peer-b"]);
        assert_eq!(report.repair_rounds, 0);
        assert_eq!(std::fs::read(&report.output).unwrap(), data);
    }

    #[tokio::test]
    async fn test_storage_failure_ends_session() {
        let staging = TempDir::new().unwrap();
        let data = content(3);
        let network = Arc::new(FakeNetwork {
            holders: HashMap::from([(addr(1), data.clone()), (addr(2), data.clone())]),
            delay: Some(Duration::from_millis(20)),
            ..Default::default()
        });
        let (events, mut rx) = EventSink::channel();
        let manager = manager(
            StreamConfig::with_staging(staging.path()),
            vec![peer("peer-a", 1), peer("peer-b", 2)],
            network.clone(),
        )
        .with_events(events);

        let key = hash_of(&data);
        let handle = manager.start(StreamRequest::new(key.clone())).unwrap();
        while let Some(event) = rx.recv().await {
            if matches!(event, NodeEvent::SessionStarted { .. }) {
                break;
            }
        }
        // a file where the chunk directory should be makes every write fail
        let chunks = staging.path().join(&key).join("chunks");
        std::fs::remove_dir_all(&chunks).unwrap();
        std::fs::write(&chunks, b"not a directory").unwrap();

        let err = handle.wait().await.unwrap_err();
        assert!(matches!(err.downcast_ref::<StreamError>(), Some(StreamError::StorageError { .. })));
        let fetched = network.chunk_log().len();
        assert_eq!(fetched, 1);
    }

    #[tokio::test]
    async fn test_duplicate_session_rejected_before_network() {
        let staging = TempDir::new().unwrap();
        let network = Arc::new(FakeNetwork::default());
        let manager = manager(StreamConfig::with_staging(staging.path()), vec![peer("peer-a", 1)], network.clone());
        let request = StreamRequest::new("clip.mp4");

        let _slot = manager.begin(&request).unwrap();
        let err = manager.run(request.clone()).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<StreamError>(), Some(StreamError::SessionActive { .. })));
        assert!(manager.start(request).is_err());
        assert_eq!(network.calls(), 0);
    }

    #[tokio::test]
    async fn test_init_checks() {
        let network = Arc::new(FakeNetwork::default());
        let unconfigured = manager(StreamConfig::default(), Vec::new(), network.clone());
        let err = unconfigured.run(StreamRequest::new("clip.mp4")).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<StreamError>(), Some(StreamError::ConfigError { .. })));

        let staging = TempDir::new().unwrap();
        let offline = StreamManager::new(
            StreamConfig::with_staging(staging.path()),
            Arc::new(LocalCatalog::new(None)),
            Arc::new(FakeDirectory {
                online: false,
                peers: Vec::new(),
            }),
            network.clone(),
        );
        let err = offline.run(StreamRequest::new("clip.mp4")).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<StreamError>(), Some(StreamError::DiscoveryError { .. })));
        assert_eq!(network.calls(), 0);
    }

    #[tokio::test]
    async fn test_no_source() {
        let staging = TempDir::new().unwrap();
        let network = Arc::new(FakeNetwork::default());
        let (events, mut rx) = EventSink::channel();
        let manager = manager(StreamConfig::with_staging(staging.path()), vec![peer("peer-a", 1)], network)
            .with_events(events);

        let err = manager.run(StreamRequest::new("missing.mp4")).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<StreamError>(), Some(StreamError::NoSource { .. })));
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            NodeEvent::SessionFinished { outcome: SessionOutcome::Failed { .. }, .. }
        ));
        assert!(!manager.is_active("missing.mp4"));
    }

    #[tokio::test]
    async fn test_local_copy_is_used_when_no_peer_has_it() {
        let root = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();
        let data = content(2);
        std::fs::write(root.path().join("mine.mkv"), &data).unwrap();

        let network = Arc::new(FakeNetwork {
            holders: HashMap::from([(addr(9), data.clone())]),
            ..Default::default()
        });
        let manager = StreamManager::new(
            StreamConfig::with_staging(staging.path()),
            Arc::new(LocalCatalog::new(Some(root.path().to_path_buf()))),
            Arc::new(FakeDirectory {
                online: true,
                peers: Vec::new(),
            }),
            network,
        )
        .with_local_source(Source::new("self", addr(9)));

        let report = manager.run(StreamRequest::new(hash_of(&data))).await.unwrap();
        assert_eq!(report.used_sources, vec!["self"]);
        assert_eq!(std::fs::read(&report.output).unwrap(), data);
    }

    #[tokio::test]
    async fn test_meta_unavailable() {
        let staging = TempDir::new().unwrap();
        let data = content(2);
        let network = Arc::new(FakeNetwork {
            holders: HashMap::from([(addr(1), data.clone()), (addr(2), data)]),
            broken_meta: true,
            ..Default::default()
        });
        let manager = manager(
            StreamConfig::with_staging(staging.path()),
            vec![peer("peer-a", 1), peer("peer-b", 2)],
            network,
        );

        let err = manager.run(StreamRequest::new("clip.mp4")).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StreamError>(),
            Some(StreamError::MetaUnavailable { attempts: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_playback_signaled_once() {
        let staging = TempDir::new().unwrap();
        let data = content(12);
        let network = Arc::new(FakeNetwork {
            holders: HashMap::from([(addr(1), data.clone())]),
            ..Default::default()
        });
        let playback = Arc::new(CountingPlayback::default());
        let (events, mut rx) = EventSink::channel();
        let manager = manager(StreamConfig::with_staging(staging.path()), vec![peer("peer-a", 1)], network)
            .with_events(events)
            .with_playback(playback.clone());

        let report = manager.run(StreamRequest::named("clip.mp4", "clip.mp4")).await.unwrap();
        let opened = playback.opened.lock().unwrap().clone();
        assert_eq!(opened, vec![report.streaming_path.clone()]);
        assert!(report.streaming_path.ends_with("clip.streaming.mp4"));

        let events = drain(&mut rx);
        let ready: Vec<usize> = events
            .iter()
            .enumerate()
            .filter(|(_, e)| matches!(e, NodeEvent::PlaybackReady { .. }))
            .map(|(i, _)| i)
            .collect();
        assert_eq!(ready.len(), 1);
        // 12 chunks at a 10% threshold: the second stored chunk crosses it
        assert!(matches!(events[ready[0] - 1], NodeEvent::ChunkStored { percent: 16, .. }));
    }

    #[tokio::test]
    async fn test_prefetch_window_is_fetched_in_order() {
        let staging = TempDir::new().unwrap();
        let data = content(20);
        let network = Arc::new(FakeNetwork {
            holders: HashMap::from([(addr(1), data.clone())]),
            ..Default::default()
        });
        let config = StreamConfig {
            prefetch_window: 6,
            seed: Some(11),
            ..StreamConfig::with_staging(staging.path())
        };
        let manager = manager(config, vec![peer("peer-a", 1)], network.clone());

        manager.run(StreamRequest::new("clip.mp4")).await.unwrap();
        let order: Vec<u32> = network.chunk_log().into_iter().map(|(_, i)| i).collect();
        assert_eq!(order.len(), 20);
        assert_eq!(&order[..6], &[0, 1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_injected_loss_is_repaired() {
        let staging = TempDir::new().unwrap();
        let data = content(10);
        let network = Arc::new(FakeNetwork {
            holders: HashMap::from([(addr(1), data.clone())]),
            ..Default::default()
        });
        let config = StreamConfig {
            prefetch_window: 3,
            faults: FaultInjection::with_loss_rate(1.0),
            seed: Some(5),
            ..StreamConfig::with_staging(staging.path())
        };
        let manager = manager(config, vec![peer("peer-a", 1)], network.clone());

        let report = manager.run(StreamRequest::new("clip.mp4")).await.unwrap();
        assert_eq!(report.repair_rounds, 1);
        assert_eq!(std::fs::read(&report.output).unwrap(), data);
        let order: Vec<u32> = network.chunk_log().into_iter().map(|(_, i)| i).collect();
        assert_eq!(&order[..3], &[0, 1, 2]);
        assert_eq!(order.len(), 10);
    }

    #[tokio::test]
    async fn test_missing_chunks_are_named() {
        let staging = TempDir::new().unwrap();
        let data = content(5);
        let network = Arc::new(FakeNetwork {
            holders: HashMap::from([(addr(1), data)]),
            lost_index: Some(3),
            ..Default::default()
        });
        let config = StreamConfig {
            repair_rounds: 2,
            ..StreamConfig::with_staging(staging.path())
        };
        let manager = manager(config, vec![peer("peer-a", 1)], network.clone());

        let err = manager.run(StreamRequest::new("clip.mp4")).await.unwrap_err();
        match err.downcast_ref::<StreamError>() {
            Some(StreamError::MissingChunks { indices, .. }) => assert_eq!(indices, &vec![3]),
            other => panic!("unexpected error: {:?}", other),
        }
        let attempts = network.chunk_log().into_iter().filter(|(_, i)| *i == 3).count();
        assert_eq!(attempts, 3);
        // partial chunks stay on disk
        let part = staging.path().join("clip.mp4").join("chunks");
        assert!(part.join("0.chk").exists());
        assert!(!part.join("3.chk").exists());
    }

    #[tokio::test]
    async fn test_stop_releases_slot_and_keeps_chunks() {
        let staging = TempDir::new().unwrap();
        let data = content(30);
        let network = Arc::new(FakeNetwork {
            holders: HashMap::from([(addr(1), data)]),
            delay: Some(Duration::from_millis(20)),
            ..Default::default()
        });
        let (events, mut rx) = EventSink::channel();
        let manager = manager(StreamConfig::with_staging(staging.path()), vec![peer("peer-a", 1)], network)
            .with_events(events);

        let handle = manager.start(StreamRequest::new("clip.mp4")).unwrap();
        assert_eq!(handle.key(), "clip.mp4");
        while let Some(event) = rx.recv().await {
            if matches!(event, NodeEvent::ChunkStored { .. }) {
                break;
            }
        }
        assert!(manager.stop("clip.mp4"));
        let err = handle.wait().await.unwrap_err();
        assert!(matches!(err.downcast_ref::<StreamError>(), Some(StreamError::SessionStopped { .. })));

        assert!(!manager.is_active("clip.mp4"));
        assert!(!manager.stop("clip.mp4"));
        assert!(staging.path().join("clip.mp4").join("chunks").join("0.chk").exists());
    }

    #[tokio::test]
    async fn test_concurrent_keys_with_one_name_keep_separate_files() {
        let staging = TempDir::new().unwrap();
        let data = content(6);
        let network = Arc::new(FakeNetwork {
            holders: HashMap::from([(addr(1), data.clone())]),
            delay: Some(Duration::from_millis(5)),
            ..Default::default()
        });
        let manager = manager(StreamConfig::with_staging(staging.path()), vec![peer("peer-a", 1)], network);

        let by_hash = manager.start(StreamRequest::named(hash_of(&data), "clip.mp4")).unwrap();
        let by_name = manager.start(StreamRequest::named("clip.mp4", "clip.mp4")).unwrap();
        assert_eq!(manager.active_keys().len(), 2);

        let first = by_hash.wait().await.unwrap();
        let second = by_name.wait().await.unwrap();
        assert_ne!(first.streaming_path, second.streaming_path);
        assert_ne!(first.output, second.output);
        for report in [&first, &second] {
            assert_eq!(std::fs::read(&report.streaming_path).unwrap(), data);
            assert_eq!(std::fs::read(&report.output).unwrap(), data);
        }
    }

    #[tokio::test]
    async fn test_resumed_session_skips_stored_chunks() {
        let staging = TempDir::new().unwrap();
        let data = content(4);
        let network = Arc::new(FakeNetwork {
            holders: HashMap::from([(addr(1), data.clone())]),
            ..Default::default()
        });
        let manager = manager(StreamConfig::with_staging(staging.path()), vec![peer("peer-a", 1)], network.clone());

        manager.run(StreamRequest::new("clip.mp4")).await.unwrap();
        assert_eq!(network.chunk_log().len(), 4);

        let report = manager.run(StreamRequest::new("clip.mp4")).await.unwrap();
        assert_eq!(network.chunk_log().len(), 4);
        assert!(report.used_sources.is_empty());
        assert_eq!(std::fs::read(&report.streaming_path).unwrap(), data);
    }

    #[test]
    fn test_percent_rounds_down() {
        assert_eq!(percent_of(1, 12), 8);
        assert_eq!(percent_of(2, 12), 16);
        assert_eq!(percent_of(12, 12), 100);
        assert_eq!(percent_of(0, 0), 100);
    }
}
