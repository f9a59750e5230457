//! CLI arguments module
//!
//! Defines command-line argument parsing using clap.

use clap::{Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;

/// CLI arguments for a streaming peer
#[derive(Debug, Parser)]
#[command(name = "peer-stream")]
#[command(about = "Share and stream videos with peers on the local network", long_about = None)]
pub struct CliArgs {
    #[command(subcommand)]
    pub action: Action,

    /// JSON configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Peer identifier (default: peer-<uuid>)
    #[arg(long, global = true)]
    pub peer_id: Option<String>,

    /// UDP discovery port
    #[arg(long, global = true)]
    pub discovery_port: Option<u16>,

    /// TCP control port
    #[arg(long, global = true)]
    pub control_port: Option<u16>,

    /// Address to bind both sockets to
    #[arg(long, global = true, value_name = "IP")]
    pub bind: Option<IpAddr>,

    /// Comma-separated host:port discovery endpoints
    #[arg(short, long, global = true, value_name = "LIST")]
    pub bootstrap: Option<String>,

    /// Folder of videos to share
    #[arg(short, long, global = true, value_name = "DIR")]
    pub root: Option<PathBuf>,

    /// Folder for downloads in progress and finished files
    #[arg(short, long, global = true, value_name = "DIR")]
    pub staging: Option<PathBuf>,

    /// Player command used to open the streaming file
    #[arg(long, global = true, value_name = "COMMAND")]
    pub player: Option<String>,

    /// Percent of chunks on disk before playback starts
    #[arg(long, global = true)]
    pub threshold: Option<u8>,

    /// Leading chunks fetched strictly in order
    #[arg(long, global = true)]
    pub prefetch: Option<u32>,

    /// Repair passes over missing chunks
    #[arg(long, global = true)]
    pub repair_rounds: Option<u32>,

    /// Simulated chunk loss probability outside the prefetch window
    #[arg(long, global = true)]
    pub loss_rate: Option<f64>,

    /// Seed for chunk ordering
    #[arg(long, global = true)]
    pub seed: Option<u64>,

    /// Do not send HELLOs to the broadcast address
    #[arg(long, global = true)]
    pub no_broadcast: bool,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Quiet mode (no output except errors)
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

/// What to do once the peer is up
#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Action {
    /// Share the content root until interrupted
    Serve,
    /// List videos available on the network
    Search {
        /// Case-insensitive name filter
        query: Option<String>,
        /// Seconds to wait for peers before listing
        #[arg(long, default_value_t = 3)]
        wait: u64,
    },
    /// Stream one video into the staging folder
    Stream {
        /// Content hash or file name
        key: String,
        /// Name for the staged files
        #[arg(long)]
        name: Option<String>,
        /// Seconds to wait for peers before sourcing
        #[arg(long, default_value_t = 3)]
        wait: u64,
    },
}

impl CliArgs {
    /// Parse CLI arguments from command line
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Check if quiet mode is enabled
    pub fn is_quiet(&self) -> bool {
        self.quiet
    }

    /// Get the log level based on verbosity settings
    pub fn log_level(&self) -> tracing::Level {
        if self.verbose {
            tracing::Level::DEBUG
        } else if self.quiet {
            tracing::Level::ERROR
        } else {
            tracing::Level::INFO
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_action() {
        let args = CliArgs::try_parse_from(["peer-stream", "stream", "clip.mp4", "--name", "Clip", "-s", "/tmp/s"]).unwrap();
        assert_eq!(
            args.action,
            Action::Stream {
                key: "clip.mp4".to_string(),
                name: Some("Clip".to_string()),
                wait: 3,
            }
        );
        assert_eq!(args.staging, Some(PathBuf::from("/tmp/s")));
        assert_eq!(args.log_level(), tracing::Level::INFO);
    }

    #[test]
    fn test_global_flags_before_action() {
        let args = CliArgs::try_parse_from(["peer-stream", "-v", "--bootstrap", "a:1,b:2", "search", "cats"]).unwrap();
        assert!(args.is_verbose());
        assert_eq!(args.bootstrap.as_deref(), Some("a:1,b:2"));
        assert_eq!(
            args.action,
            Action::Search {
                query: Some("cats".to_string()),
                wait: 3,
            }
        );
        assert_eq!(args.log_level(), tracing::Level::DEBUG);
    }

    #[test]
    fn test_action_required() {
        assert!(CliArgs::try_parse_from(["peer-stream"]).is_err());
        let args = CliArgs::try_parse_from(["peer-stream", "serve", "-q"]).unwrap();
        assert!(args.is_quiet());
        assert_eq!(args.action, Action::Serve);
    }
}
