//! CLI module
//!
//! Command-line interface for a streaming peer.

pub mod args;
pub mod config;
pub mod progress;

pub use args::{Action, CliArgs};
pub use config::Config;
pub use progress::{format_bytes, format_duration, ProgressDisplay};
