//! Peer protocol module
//!
//! Wire formats shared by discovery (UDP) and the control channel (TCP).

pub mod command;
pub mod constants;
pub mod message;
pub mod wire;

// Re-export main types
pub use command::{Command, ControlLine, END_LINE};
pub use constants::{is_content_hash, is_video_name, CHUNK_SIZE};
pub use message::{DiscoveryMessage, MessageKind};
pub use wire::{expect_line, put_line, read_line, read_payload, write_line};
