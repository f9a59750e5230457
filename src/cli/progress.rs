//! Progress display module
//!
//! Renders node events and search results in the terminal.

use std::io::{self, Write};
use std::time::{Duration, Instant};

use crate::catalog::network::NetworkListing;
use crate::discovery::peer::PeerRecord;
use crate::events::{NodeEvent, SessionOutcome};
use crate::stream::session::SessionReport;

/// Format bytes to human readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Format duration to human readable string
pub fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Progress display for CLI
pub struct ProgressDisplay {
    /// Start time of the display
    start_time: Instant,
    /// Quiet mode (no progress output)
    quiet: bool,
}

impl ProgressDisplay {
    /// Create a new progress display
    pub fn new(quiet: bool) -> Self {
        Self {
            start_time: Instant::now(),
            quiet,
        }
    }

    /// One line for an event
    pub fn render_event(event: &NodeEvent) -> String {
        match event {
            NodeEvent::PeerCountChanged { count } => format!("Peers online: {}", count),
            NodeEvent::SessionStarted {
                key,
                sources,
                total_chunks,
            } => format!("Streaming {}: {} chunks from {} sources", key, total_chunks, sources),
            NodeEvent::ChunkStored {
                index,
                total,
                percent,
                source,
                ..
            } => {
                let bar_width: usize = 30;
                let filled = (*percent as usize * bar_width / 100).min(bar_width);
                format!(
                    "[{}{}] {:>3}% chunk {}/{} from {}",
                    "=".repeat(filled),
                    " ".repeat(bar_width - filled),
                    percent,
                    index + 1,
                    total,
                    source
                )
            }
            NodeEvent::PlaybackReady { path, .. } => format!("Playback ready: {}", path.display()),
            NodeEvent::SessionFinished { key, outcome } => match outcome {
                SessionOutcome::Completed { output } => format!("Finished {}: {}", key, output.display()),
                SessionOutcome::Failed { reason } => format!("Stream of {} failed: {}", key, reason),
            },
        }
    }

    /// Print an event. Chunk progress overwrites the current line.
    pub fn handle_event(&mut self, event: &NodeEvent) -> io::Result<()> {
        if self.quiet {
            if let NodeEvent::SessionFinished {
                outcome: SessionOutcome::Failed { .. },
                ..
            } = event
            {
                return self.print_error(&Self::render_event(event));
            }
            return Ok(());
        }

        let line = Self::render_event(event);
        match event {
            NodeEvent::ChunkStored { .. } => {
                print!("\r\x1b[2K{}", line);
                io::stdout().flush()?;
            }
            NodeEvent::SessionFinished {
                outcome: SessionOutcome::Failed { .. },
                ..
            } => self.print_error(&line)?,
            _ => self.print_status(&line)?,
        }
        Ok(())
    }

    /// Print search results
    pub fn print_listings(&self, listings: &[NetworkListing]) -> io::Result<()> {
        if listings.is_empty() {
            println!("No videos found.");
            return Ok(());
        }
        println!("{:<40} {:>12} {:>6}  HASH", "NAME", "SIZE", "PEERS");
        for listing in listings {
            println!(
                "{:<40} {:>12} {:>6}  {}",
                listing.display_name(),
                format_bytes(listing.size),
                listing.peer_count,
                listing.hash
            );
        }
        Ok(())
    }

    /// Print known peers
    pub fn print_peers(&self, peers: &[PeerRecord]) -> io::Result<()> {
        if self.quiet {
            return Ok(());
        }
        println!("Known peers: {}", peers.len());
        for peer in peers {
            println!("  {} at {} (digest {})", peer.peer_id, peer.control_addr(), peer.digest);
        }
        Ok(())
    }

    /// Print completion message
    pub fn print_complete(&self, report: &SessionReport) -> io::Result<()> {
        if self.quiet {
            return Ok(());
        }

        print!("\r\x1b[2K");
        io::stdout().flush()?;

        println!();
        println!("Stream Complete!");
        println!("  Output: {}", report.output.display());
        println!("  Size: {} in {} chunks", format_bytes(report.size), report.total_chunks);
        println!("  Served by: {}", report.used_sources.join(", "));
        if report.repair_rounds > 0 {
            println!("  Repair rounds: {}", report.repair_rounds);
        }
        println!("  Elapsed Time: {}", format_duration(self.start_time.elapsed()));

        Ok(())
    }

    /// Print a status message
    pub fn print_status(&self, message: &str) -> io::Result<()> {
        if self.quiet {
            return Ok(());
        }

        println!("\r\x1b[2K{}", message);
        Ok(())
    }

    /// Print an error message
    pub fn print_error(&self, message: &str) -> io::Result<()> {
        eprintln!("\r\x1b[2KError: {}", message);
        Ok(())
    }

    /// Get the elapsed time since start
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Check if quiet mode is enabled
    pub fn is_quiet(&self) -> bool {
        self.quiet
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0.00 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1024 * 1024), "1.00 MB");
        assert_eq!(format_bytes(1024 * 1024 * 1024), "1.00 GB");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(30)), "30s");
        assert_eq!(format_duration(Duration::from_secs(90)), "1m 30s");
        assert_eq!(format_duration(Duration::from_secs(3661)), "1h 1m 1s");
    }

    #[test]
    fn test_render_chunk_line() {
        let line = ProgressDisplay::render_event(&NodeEvent::ChunkStored {
            key: "k".to_string(),
            index: 4,
            total: 40,
            percent: 50,
            source: "peer-a".to_string(),
        });
        assert_eq!(line, format!("[{}{}]  50% chunk 5/40 from peer-a", "=".repeat(15), " ".repeat(15)));
    }

    #[test]
    fn test_render_outcomes() {
        let done = ProgressDisplay::render_event(&NodeEvent::SessionFinished {
            key: "clip".to_string(),
            outcome: SessionOutcome::Completed {
                output: PathBuf::from("/tmp/clip.mp4.complete"),
            },
        });
        assert_eq!(done, "Finished clip: /tmp/clip.mp4.complete");

        let failed = ProgressDisplay::render_event(&NodeEvent::SessionFinished {
            key: "clip".to_string(),
            outcome: SessionOutcome::Failed {
                reason: "no peer has this file".to_string(),
            },
        });
        assert!(failed.contains("no peer has this file"));
    }

    #[test]
    fn test_progress_display_quiet() {
        let mut display = ProgressDisplay::new(true);
        assert!(display.is_quiet());
        display.handle_event(&NodeEvent::PeerCountChanged { count: 3 }).unwrap();
    }
}
