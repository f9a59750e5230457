//! Node events
//!
//! Structured notifications pushed by discovery and streaming sessions to
//! whoever renders them. Emission never blocks.

use serde::Serialize;
use std::path::PathBuf;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::trace;

/// Terminal outcome of a streaming session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SessionOutcome {
    /// Every chunk arrived and the output was reassembled
    Completed { output: PathBuf },
    /// The session ended early
    Failed { reason: String },
}

/// An event emitted by the node
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum NodeEvent {
    /// The number of known peers changed
    PeerCountChanged { count: usize },
    /// A session found its sources and metadata
    SessionStarted {
        key: String,
        sources: usize,
        total_chunks: u32,
    },
    /// A chunk was written to disk
    ChunkStored {
        key: String,
        index: u32,
        total: u32,
        percent: u8,
        source: String,
    },
    /// Enough of the file exists to start playback
    PlaybackReady { key: String, path: PathBuf },
    /// A session reached a terminal state
    SessionFinished { key: String, outcome: SessionOutcome },
}

/// Non-blocking sender half of the event channel
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<UnboundedSender<NodeEvent>>,
}

impl EventSink {
    /// Create a sink and the receiver that observes it
    pub fn channel() -> (Self, UnboundedReceiver<NodeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A sink that discards everything
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Push an event. A dropped receiver is ignored.
    pub fn emit(&self, event: NodeEvent) {
        if let Some(tx) = &self.tx {
            if tx.send(event).is_err() {
                trace!("Event receiver dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_reaches_receiver() {
        let (sink, mut rx) = EventSink::channel();
        sink.emit(NodeEvent::PeerCountChanged { count: 2 });
        assert_eq!(rx.recv().await, Some(NodeEvent::PeerCountChanged { count: 2 }));
    }

    #[test]
    fn test_emit_without_receiver_is_silent() {
        let (sink, rx) = EventSink::channel();
        drop(rx);
        sink.emit(NodeEvent::PeerCountChanged { count: 1 });
        EventSink::disabled().emit(NodeEvent::PeerCountChanged { count: 1 });
    }
}
