//! Catalog entries
//!
//! One shareable item as listed by `CATALOG`: `VIDEO|name|size|hash`.

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::protocol::constants::is_content_hash;

/// A shareable content item
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentEntry {
    /// File name relative to the content root
    pub name: String,
    /// Size in bytes
    pub size: u64,
    /// Lowercase hex SHA-256 of the file, empty if it could not be computed
    pub hash: String,
}

impl ContentEntry {
    /// Create a new entry
    pub fn new(name: impl Into<String>, size: u64, hash: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size,
            hash: hash.into(),
        }
    }

    /// Whether the entry has a usable content hash
    pub fn has_hash(&self) -> bool {
        is_content_hash(&self.hash)
    }

    /// Key used to request this item: the hash when known, else the name
    pub fn content_key(&self) -> &str {
        if self.has_hash() {
            &self.hash
        } else {
            &self.name
        }
    }

    /// Render as a `VIDEO|name|size|hash` line
    pub fn to_catalog_line(&self) -> String {
        format!("VIDEO|{}|{}|{}", self.name.replace('|', "_"), self.size, self.hash)
    }

    /// Parse a `VIDEO|name|size[|hash]` line, returning `None` for anything
    /// malformed
    pub fn from_catalog_line(line: &str) -> Option<Self> {
        let line = line.trim();
        let parts: Vec<&str> = line.split('|').collect();
        if parts.len() < 3 || parts[0] != "VIDEO" || parts[1].is_empty() {
            trace!("Skipping malformed catalog line: {}", line);
            return None;
        }
        let size = parts[2].trim().parse::<u64>().ok()?;
        let hash = parts
            .get(3)
            .map(|h| h.trim().to_ascii_lowercase())
            .unwrap_or_default();
        Some(Self::new(parts[1], size, hash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_line_round_trip() {
        let entry = ContentEntry::new("movie.mp4", 1234, "ab".repeat(32));
        let line = entry.to_catalog_line();
        assert_eq!(line, format!("VIDEO|movie.mp4|1234|{}", "ab".repeat(32)));
        assert_eq!(ContentEntry::from_catalog_line(&line), Some(entry));
    }

    #[test]
    fn test_hash_is_optional() {
        let entry = ContentEntry::from_catalog_line("VIDEO|clip.mkv|99").unwrap();
        assert_eq!(entry.hash, "");
        assert!(!entry.has_hash());
        assert_eq!(entry.content_key(), "clip.mkv");
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        assert!(ContentEntry::from_catalog_line("VIDEO|clip.mkv").is_none());
        assert!(ContentEntry::from_catalog_line("VIDEO|clip.mkv|big").is_none());
        assert!(ContentEntry::from_catalog_line("AUDIO|clip.mp3|1").is_none());
        assert!(ContentEntry::from_catalog_line("VIDEO||1").is_none());
    }
}
