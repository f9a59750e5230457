//! Storage module
//!
//! Chunk layout arithmetic and the on-disk staging area used by streaming
//! sessions.

pub mod chunk;
pub mod staging;

pub use chunk::{chunk_count, ChunkLayout};
pub use staging::{file_safe, StagingArea};
