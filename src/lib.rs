//! peer-stream
//!
//! LAN peer-to-peer video sharing: UDP gossip discovery, a line-based TCP
//! catalog and chunk protocol, and a streaming download scheduler that lets
//! playback start before the download finishes.

pub mod catalog;
pub mod cli;
pub mod discovery;
pub mod error;
pub mod events;
pub mod node;
pub mod peer;
pub mod protocol;
pub mod storage;
pub mod stream;

pub use error::{RemoteErrorCode, StreamError};

pub use catalog::{digest_for_folder, ContentEntry, LocalCatalog, NetworkCatalog, NetworkListing};
pub use cli::{Action, CliArgs, Config, ProgressDisplay};
pub use discovery::{DiscoveryConfig, DiscoveryService, PeerDirectory, PeerRecord};
pub use events::{EventSink, NodeEvent, SessionOutcome};
pub use node::Node;
pub use peer::{ContentMeta, ControlClient, ControlServer, PeerClient};
pub use protocol::{Command, ControlLine, DiscoveryMessage, MessageKind};
pub use storage::{ChunkLayout, StagingArea};
pub use stream::{
    CommandPlayback, FaultInjection, NoPlayback, PlaybackHook, SessionHandle, SessionReport, Source, StreamConfig,
    StreamManager, StreamRequest,
};
