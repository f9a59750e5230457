//! Peer control channel module
//!
//! The TCP side of a peer: the control server answering catalog and chunk
//! requests, and the client issuing them.

pub mod client;
pub mod server;

// Re-export main types
pub use client::{ContentMeta, ControlClient, PeerClient};
pub use server::{respond, ControlServer};
