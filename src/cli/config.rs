//! CLI configuration module
//!
//! Built-in defaults, overlaid by an optional JSON file, overlaid by
//! command-line flags.

use crate::cli::args::CliArgs;
use crate::discovery::service::DiscoveryConfig;
use crate::error::StreamError;
use crate::protocol::constants::{
    CONTROL_PORT_DEFAULT, DISCOVERY_PORT_DEFAULT, PLAYBACK_THRESHOLD_PCT, PREFETCH_WINDOW, REPAIR_ROUNDS,
};
use crate::stream::order::FaultInjection;
use crate::stream::scheduler::StreamConfig;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info};

/// Configuration for a peer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Local peer id
    pub peer_id: String,
    /// UDP discovery port
    pub discovery_port: u16,
    /// TCP control port
    pub control_port: u16,
    /// Address both sockets bind to
    pub bind_address: IpAddr,
    /// `host:port` endpoints that always receive HELLOs
    pub bootstrap: Vec<String>,
    /// Folder whose videos are shared
    pub root: Option<PathBuf>,
    /// Folder for chunk directories and outputs
    pub staging: Option<PathBuf>,
    /// Percent of chunks on disk before playback starts
    pub playback_threshold_pct: u8,
    /// Leading chunks fetched in order
    pub prefetch_window: u32,
    /// Repair passes after the first pass
    pub repair_rounds: u32,
    /// Simulated chunk loss outside the prefetch window
    pub loss_rate: f64,
    /// Seed for chunk ordering
    pub seed: Option<u64>,
    /// External player command line
    pub player: Option<String>,
    /// Send HELLOs to the LAN broadcast address
    pub broadcast: bool,
    /// Seconds between content rescans when serving
    pub rescan_interval_secs: u64,
    /// Verbose output
    #[serde(skip)]
    pub verbose: bool,
    /// Quiet mode
    #[serde(skip)]
    pub quiet: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            peer_id: format!("peer-{}", uuid::Uuid::new_v4()),
            discovery_port: DISCOVERY_PORT_DEFAULT,
            control_port: CONTROL_PORT_DEFAULT,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            bootstrap: Vec::new(),
            root: None,
            staging: None,
            playback_threshold_pct: PLAYBACK_THRESHOLD_PCT,
            prefetch_window: PREFETCH_WINDOW,
            repair_rounds: REPAIR_ROUNDS,
            loss_rate: 0.0,
            seed: None,
            player: None,
            broadcast: true,
            rescan_interval_secs: 10,
            verbose: false,
            quiet: false,
        }
    }
}

impl Config {
    /// Read a JSON configuration file; missing keys take their defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        info!("Loading configuration from {}", path.display());
        let text = std::fs::read_to_string(path).map_err(|e| {
            error!("Failed to read config file '{}': {}", path.display(), e);
            StreamError::config_error_with_field(format!("Failed to read config file: {}", e), path.display().to_string())
        })?;
        let config: Config = serde_json::from_str(&text).map_err(|e| {
            error!("Failed to parse config file '{}': {}", path.display(), e);
            StreamError::config_error_with_field(format!("Invalid config file: {}", e), path.display().to_string())
        })?;
        Ok(config)
    }

    /// Defaults, then the `--config` file if given, then flags
    pub fn load(args: &CliArgs) -> Result<Self> {
        let base = match &args.config {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        Ok(base.with_args(args))
    }

    /// Overlay explicitly given flags
    pub fn with_args(mut self, args: &CliArgs) -> Self {
        if let Some(peer_id) = &args.peer_id {
            self.peer_id = peer_id.clone();
        }
        if let Some(port) = args.discovery_port {
            self.discovery_port = port;
        }
        if let Some(port) = args.control_port {
            self.control_port = port;
        }
        if let Some(bind) = args.bind {
            self.bind_address = bind;
        }
        if let Some(list) = &args.bootstrap {
            self.bootstrap = crate::discovery::bootstrap::split_bootstrap(list);
        }
        if let Some(root) = &args.root {
            self.root = Some(root.clone());
        }
        if let Some(staging) = &args.staging {
            self.staging = Some(staging.clone());
        }
        if let Some(threshold) = args.threshold {
            self.playback_threshold_pct = threshold;
        }
        if let Some(prefetch) = args.prefetch {
            self.prefetch_window = prefetch;
        }
        if let Some(rounds) = args.repair_rounds {
            self.repair_rounds = rounds;
        }
        if let Some(loss_rate) = args.loss_rate {
            self.loss_rate = loss_rate;
        }
        if args.seed.is_some() {
            self.seed = args.seed;
        }
        if let Some(player) = &args.player {
            self.player = Some(player.clone());
        }
        if args.no_broadcast {
            self.broadcast = false;
        }
        self.verbose = args.verbose;
        self.quiet = args.quiet;
        debug!("Effective configuration: {:?}", self);
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.peer_id.trim().is_empty() {
            return Err(StreamError::validation_error_with_field("Peer id cannot be empty", "peer_id").into());
        }
        if self.peer_id.contains('|') {
            return Err(StreamError::validation_error_with_field("Peer id cannot contain '|'", "peer_id").into());
        }
        if self.discovery_port == 0 {
            return Err(StreamError::validation_error_with_field("Discovery port cannot be 0", "discovery_port").into());
        }
        if self.control_port == 0 {
            return Err(StreamError::validation_error_with_field("Control port cannot be 0", "control_port").into());
        }
        if !(0.0..=1.0).contains(&self.loss_rate) {
            return Err(StreamError::validation_error_with_field("Loss rate must be between 0 and 1", "loss_rate").into());
        }
        if self.playback_threshold_pct > 100 {
            return Err(StreamError::validation_error_with_field(
                "Playback threshold must be at most 100",
                "playback_threshold_pct",
            )
            .into());
        }
        if self.rescan_interval_secs == 0 {
            return Err(
                StreamError::validation_error_with_field("Rescan interval must be at least 1s", "rescan_interval_secs")
                    .into(),
            );
        }
        Ok(())
    }

    /// Discovery settings for a control server bound to `control_port`
    pub fn discovery_config(&self, control_port: u16, bootstrap: Vec<SocketAddr>) -> DiscoveryConfig {
        DiscoveryConfig {
            bind_addr: SocketAddr::new(self.bind_address, self.discovery_port),
            bootstrap,
            broadcast: self.broadcast,
            ..DiscoveryConfig::new(self.peer_id.clone(), control_port)
        }
    }

    /// Scheduler settings
    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            staging_dir: self.staging.clone(),
            prefetch_window: self.prefetch_window,
            playback_threshold_pct: self.playback_threshold_pct,
            repair_rounds: self.repair_rounds,
            faults: FaultInjection::with_loss_rate(self.loss_rate),
            seed: self.seed,
        }
    }

    /// Time between content rescans
    pub fn rescan_interval(&self) -> Duration {
        Duration::from_secs(self.rescan_interval_secs.max(1))
    }

    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Check if quiet mode is enabled
    pub fn is_quiet(&self) -> bool {
        self.quiet
    }
}
