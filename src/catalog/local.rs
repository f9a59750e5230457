//! Local catalog
//!
//! Scans the content root for shareable video files, hashes them with
//! SHA-256 and caches hashes keyed on (path, size, mtime).

use anyhow::Result;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, trace, warn};

use crate::catalog::entry::ContentEntry;
use crate::error::StreamError;
use crate::protocol::constants::{is_content_hash, is_video_name};

const HASH_BUFFER_BYTES: usize = 1024 * 1024;

/// A catalog entry together with its location on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedContent {
    pub entry: ContentEntry,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
struct CachedHash {
    size: u64,
    modified: Option<SystemTime>,
    hash: String,
}

/// The set of files this peer shares
#[derive(Debug, Default)]
pub struct LocalCatalog {
    root: Option<PathBuf>,
    hash_cache: RwLock<HashMap<PathBuf, CachedHash>>,
}

impl LocalCatalog {
    /// Create a catalog over an optional content root
    pub fn new(root: Option<PathBuf>) -> Self {
        Self {
            root,
            hash_cache: RwLock::new(HashMap::new()),
        }
    }

    /// Current content root
    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    /// List every eligible top-level file, sorted by name.
    ///
    /// Files that cannot be hashed are listed with an empty hash.
    pub async fn list_entries(&self) -> Vec<ContentEntry> {
        self.scan().await.into_iter().map(|r| r.entry).collect()
    }

    /// Find an entry by content hash (case-insensitive)
    pub async fn find_by_hash(&self, hash: &str) -> Option<ResolvedContent> {
        if !is_content_hash(hash) {
            return None;
        }
        self.scan()
            .await
            .into_iter()
            .find(|r| r.entry.hash.eq_ignore_ascii_case(hash))
    }

    /// Find an entry by file name (case-insensitive)
    pub async fn find_by_name(&self, name: &str) -> Option<ResolvedContent> {
        let name = name.trim();
        self.scan()
            .await
            .into_iter()
            .find(|r| r.entry.name.eq_ignore_ascii_case(name))
    }

    /// Resolve a content id: as a hash when it looks like one, else (or when
    /// no hash matches) as a file name
    pub async fn resolve(&self, id: &str) -> Option<ResolvedContent> {
        let id = id.trim();
        if is_content_hash(id) {
            if let Some(found) = self.find_by_hash(id).await {
                return Some(found);
            }
        }
        self.find_by_name(id).await
    }

    /// Digest of the current root
    pub async fn digest(&self) -> String {
        match self.root() {
            Some(root) => digest_for_folder(root),
            None => String::new(),
        }
    }

    /// Number of hashes held in the cache
    pub async fn cached_hashes(&self) -> usize {
        self.hash_cache.read().await.len()
    }

    async fn scan(&self) -> Vec<ResolvedContent> {
        let Some(root) = self.root() else {
            return Vec::new();
        };

        let mut entries = match fs::read_dir(&root).await {
            Ok(entries) => entries,
            Err(e) => {
                debug!("Content root {} unreadable: {}", root.display(), e);
                return Vec::new();
            }
        };

        let mut found = Vec::new();
        let mut complete = true;
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!("Error while listing {}: {}", root.display(), e);
                    complete = false;
                    break;
                }
            };
            let Ok(name) = entry.file_name().into_string() else { continue };
            if !is_video_name(&name) {
                continue;
            }
            let Ok(meta) = entry.metadata().await else { continue };
            if !meta.is_file() {
                continue;
            }

            let path = entry.path();
            let hash = self.hash_for(&path, meta.len(), meta.modified().ok()).await;
            found.push(ResolvedContent {
                entry: ContentEntry::new(name, meta.len(), hash),
                path,
            });
        }

        if complete {
            self.prune_cache(&found).await;
        }
        found.sort_by(|a, b| a.entry.name.cmp(&b.entry.name));
        trace!("Scanned {} eligible files in {}", found.len(), root.display());
        found
    }

    /// Forget hashes of files a full listing no longer shows
    async fn prune_cache(&self, found: &[ResolvedContent]) {
        let seen: HashSet<&Path> = found.iter().map(|r| r.path.as_path()).collect();
        let mut cache = self.hash_cache.write().await;
        let before = cache.len();
        cache.retain(|path, _| seen.contains(path.as_path()));
        if cache.len() < before {
            debug!("Dropped {} stale cached hashes", before - cache.len());
        }
    }

    async fn hash_for(&self, path: &Path, size: u64, modified: Option<SystemTime>) -> String {
        if let Some(cached) = self.hash_cache.read().await.get(path) {
            if cached.size == size && cached.modified == modified {
                return cached.hash.clone();
            }
        }

        debug!("Hashing {}", path.display());
        let owned = path.to_path_buf();
        let result = tokio::task::spawn_blocking(move || hash_file(&owned)).await;
        match result {
            Ok(Ok(hash)) => {
                self.hash_cache.write().await.insert(
                    path.to_path_buf(),
                    CachedHash {
                        size,
                        modified,
                        hash: hash.clone(),
                    },
                );
                hash
            }
            Ok(Err(e)) => {
                warn!("Failed to hash {}: {}", path.display(), e);
                String::new()
            }
            Err(e) => {
                warn!("Hash task for {} failed: {}", path.display(), e);
                String::new()
            }
        }
    }
}

/// Lowercase hex SHA-256 of a file's contents
pub fn hash_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path).map_err(|e| {
        StreamError::storage_error_full("Failed to open file for hashing", path.display().to_string(), e.to_string())
    })?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUFFER_BYTES];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Fingerprint of a root's shareable set: SHA-256 over the sorted
/// `name:size\n` lines of its eligible files.
///
/// Returns an empty string when the root is not a readable directory.
pub fn digest_for_folder(root: &Path) -> String {
    let Ok(dir) = std::fs::read_dir(root) else {
        return String::new();
    };

    let mut lines: Vec<String> = dir
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let name = entry.file_name().into_string().ok()?;
            if !is_video_name(&name) {
                return None;
            }
            let meta = entry.metadata().ok()?;
            meta.is_file().then(|| format!("{}:{}\n", name, meta.len()))
        })
        .collect();
    lines.sort();

    let mut hasher = Sha256::new();
    for line in &lines {
        hasher.update(line.as_bytes());
    }
    hex::encode(hasher.finalize())
}
