//! Protocol constants
//!
//! Ports, timers and sizes shared by every peer on the LAN. Peers only
//! interoperate when these agree.

use std::time::Duration;

/// Default UDP port for discovery gossip
pub const DISCOVERY_PORT_DEFAULT: u16 = 40000;

/// Default TCP port for the control server
pub const CONTROL_PORT_DEFAULT: u16 = 50000;

/// Hop budget stamped on freshly emitted HELLOs
pub const TTL_DEFAULT: u32 = 2;

/// Largest discovery datagram we send or accept
pub const MAX_DATAGRAM_BYTES: usize = 1400;

/// Interval between HELLO emissions
pub const HELLO_INTERVAL: Duration = Duration::from_secs(5);

/// A peer silent for longer than this is evicted
pub const PEER_TIMEOUT: Duration = Duration::from_secs(15);

/// Interval between cleanup sweeps of peers and seen ids
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(2);

/// How long a message id is remembered for de-duplication
pub const SEEN_MESSAGE_TTL: Duration = Duration::from_secs(60);

/// Fixed chunk size for transfers (256 KiB)
pub const CHUNK_SIZE: u64 = 256 * 1024;

/// Timeout for catalog and HAS exchanges
pub const CATALOG_TIMEOUT: Duration = Duration::from_millis(2000);

/// Timeout for META and GETCHUNK exchanges
pub const TRANSFER_TIMEOUT: Duration = Duration::from_millis(4000);

/// Timeout for a server waiting on a client's command line
pub const COMMAND_READ_TIMEOUT: Duration = Duration::from_millis(4000);

/// Longest command or response line accepted on the control channel
pub const MAX_LINE_BYTES: usize = 8 * 1024;

/// Percent complete at which playback is handed off
pub const PLAYBACK_THRESHOLD_PCT: u8 = 10;

/// Leading chunks fetched strictly in order
pub const PREFETCH_WINDOW: u32 = 120;

/// Extra passes over missing chunks after the first pass
pub const REPAIR_ROUNDS: u32 = 5;

/// File extensions listed in a catalog, compared case-insensitively
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mkv", "avi", "mov"];

/// Length of a hex-encoded SHA-256 content hash
pub const CONTENT_HASH_HEX_LEN: usize = 64;

/// Check whether a string is syntactically a content hash (64 hex chars)
pub fn is_content_hash(id: &str) -> bool {
    id.len() == CONTENT_HASH_HEX_LEN && id.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Check whether a file name carries one of the listed video extensions
pub fn is_video_name(name: &str) -> bool {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => {
            VIDEO_EXTENSIONS.iter().any(|v| v.eq_ignore_ascii_case(ext))
        }
        _ => false,
    }
}
