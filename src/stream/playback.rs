//! Playback hand-off
//!
//! Invoked once per session with the partially written streaming file when
//! enough leading bytes exist.

use std::path::Path;
use std::process::{Command, Stdio};
use tracing::{info, warn};

/// Opens a file in something that can play it
pub trait PlaybackHook: Send + Sync {
    /// Hand off `path`. Must not block.
    fn open(&self, path: &Path);
}

/// Headless peers have nothing to open
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPlayback;

impl PlaybackHook for NoPlayback {
    fn open(&self, path: &Path) {
        info!("Playback ready: {}", path.display());
    }
}

/// Launches an external program with the file path as its last argument
#[derive(Debug, Clone)]
pub struct CommandPlayback {
    program: String,
    args: Vec<String>,
}

impl CommandPlayback {
    /// Parse a command line such as `mpv --force-window`
    pub fn from_command_line(command: &str) -> Option<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
        })
    }

    /// Program that will be launched
    pub fn program(&self) -> &str {
        &self.program
    }
}

impl PlaybackHook for CommandPlayback {
    fn open(&self, path: &Path) {
        info!("Opening {} with {}", path.display(), self.program);
        let spawned = Command::new(&self.program)
            .args(&self.args)
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        if let Err(e) = spawned {
            warn!("Failed to launch player '{}': {}", self.program, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_command_line() {
        let hook = CommandPlayback::from_command_line("mpv --force-window").unwrap();
        assert_eq!(hook.program(), "mpv");
        assert_eq!(hook.args, vec!["--force-window"]);
        assert!(CommandPlayback::from_command_line("   ").is_none());
    }

    #[test]
    fn test_missing_player_does_not_panic() {
        let hook = CommandPlayback::from_command_line("definitely-not-a-real-player-binary").unwrap();
        hook.open(Path::new("/tmp/clip.streaming.mp4"));
    }
}
