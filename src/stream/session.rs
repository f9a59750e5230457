//! Streaming session types
//!
//! Requests, sources and the report returned by a completed session.

use serde::Serialize;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;

/// What to stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    /// Content key: a hash when known, otherwise a file name
    pub key: String,
    /// Name the staged files are derived from
    pub display_name: String,
}

impl StreamRequest {
    /// Request content by key, displayed under the key itself
    pub fn new(key: impl Into<String>) -> Self {
        let key = key.into();
        Self {
            display_name: key.clone(),
            key,
        }
    }

    /// Request content by key with a separate display name
    pub fn named(key: impl Into<String>, display_name: impl Into<String>) -> Self {
        let display_name = display_name.into();
        let key = key.into();
        Self {
            display_name: if display_name.trim().is_empty() {
                key.clone()
            } else {
                display_name
            },
            key,
        }
    }
}

/// A peer able to serve the requested content
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Source {
    pub peer_id: String,
    pub addr: SocketAddr,
}

impl Source {
    pub fn new(peer_id: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            peer_id: peer_id.into(),
            addr,
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.peer_id, self.addr)
    }
}

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Init,
    Sourcing,
    Downloading,
    Repairing { round: u32 },
    Complete,
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Init => write!(f, "INIT"),
            SessionState::Sourcing => write!(f, "SOURCING"),
            SessionState::Downloading => write!(f, "DOWNLOADING"),
            SessionState::Repairing { round } => write!(f, "REPAIRING({})", round),
            SessionState::Complete => write!(f, "COMPLETE"),
            SessionState::Failed => write!(f, "FAILED"),
        }
    }
}

/// Summary of a completed session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionReport {
    pub key: String,
    pub size: u64,
    pub total_chunks: u32,
    /// Every source found during sourcing
    pub sources: Vec<Source>,
    /// Peer ids that served at least one chunk, in first-use order
    pub used_sources: Vec<String>,
    /// Repair rounds that were needed
    pub repair_rounds: u32,
    pub streaming_path: PathBuf,
    pub output: PathBuf,
}
