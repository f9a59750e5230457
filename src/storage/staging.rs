//! Staging area
//!
//! Each content key gets its own directory `<staging>/<key>/`, so two
//! sessions never share a file even when their display names match:
//!
//! - `chunks/<index>.chk`: one file per received chunk, made visible by
//!   an atomic rename so a chunk is either wholly present or absent;
//! - `<name>.streaming.<ext>`: a sparse file of the full size that chunks are
//!   written into at their offsets, suitable for handing to a player early;
//! - `<name>.complete`: the final reassembled output.

use anyhow::Result;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncSeekExt, AsyncWriteExt, BufWriter, SeekFrom};
use tracing::{debug, error, info, trace, warn};

use crate::error::StreamError;
use crate::storage::chunk::ChunkLayout;

const CHUNK_EXTENSION: &str = "chk";
const CHUNK_DIR: &str = "chunks";

/// Files backing one streaming session
#[derive(Debug, Clone)]
pub struct StagingArea {
    session_dir: PathBuf,
    part_dir: PathBuf,
    streaming_path: PathBuf,
    complete_path: PathBuf,
    layout: ChunkLayout,
}

impl StagingArea {
    /// Describe the staging files for a content key; nothing is touched on disk
    pub fn new(staging_root: &Path, key: &str, display_name: &str, layout: ChunkLayout) -> Self {
        let name = file_safe(display_name);
        let session_dir = staging_root.join(file_safe(key));
        Self {
            part_dir: session_dir.join(CHUNK_DIR),
            streaming_path: session_dir.join(streaming_name(&name)),
            complete_path: session_dir.join(format!("{}.complete", name)),
            session_dir,
            layout,
        }
    }

    /// Directory holding every file of this content key
    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    /// Directory holding chunk files
    pub fn part_dir(&self) -> &Path {
        &self.part_dir
    }

    /// Sparse file handed to the player
    pub fn streaming_path(&self) -> &Path {
        &self.streaming_path
    }

    /// Final reassembled file
    pub fn complete_path(&self) -> &Path {
        &self.complete_path
    }

    /// Chunk layout of the staged content
    pub fn layout(&self) -> ChunkLayout {
        self.layout
    }

    /// Path of a single chunk file
    pub fn chunk_path(&self, index: u32) -> PathBuf {
        self.part_dir.join(format!("{}.{}", index, CHUNK_EXTENSION))
    }

    /// Create directories, preallocate the streaming file and copy any
    /// chunks left by an earlier session back into it.
    ///
    /// Returns the indices already present.
    pub async fn prepare(&self) -> Result<BTreeSet<u32>> {
        info!(
            "Preparing staging area {} ({} bytes, {} chunks)",
            self.part_dir.display(),
            self.layout.size,
            self.layout.count()
        );

        fs::create_dir_all(&self.part_dir).await.map_err(|e| {
            error!("Failed to create chunk directory '{}': {}", self.part_dir.display(), e);
            StreamError::storage_error_full("Failed to create chunk directory", self.part_dir.display().to_string(), e.to_string())
        })?;

        let file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.streaming_path)
            .await
            .map_err(|e| {
                error!("Failed to create streaming file '{}': {}", self.streaming_path.display(), e);
                StreamError::storage_error_full("Failed to create streaming file", self.streaming_path.display().to_string(), e.to_string())
            })?;
        file.set_len(self.layout.size).await.map_err(|e| {
            error!("Failed to preallocate '{}': {}", self.streaming_path.display(), e);
            StreamError::storage_error_full("Failed to preallocate streaming file", self.streaming_path.display().to_string(), e.to_string())
        })?;
        drop(file);

        let present = self.present_chunks().await?;
        if !present.is_empty() {
            info!("Reusing {} chunks from an earlier session", present.len());
            for &index in &present {
                let data = fs::read(self.chunk_path(index)).await.map_err(|e| {
                    StreamError::storage_error_full("Failed to read chunk", self.chunk_path(index).display().to_string(), e.to_string())
                })?;
                self.write_streaming(index, &data).await?;
            }
        }
        Ok(present)
    }

    /// Indices whose chunk file exists
    pub async fn present_chunks(&self) -> Result<BTreeSet<u32>> {
        let mut present = BTreeSet::new();
        let mut entries = match fs::read_dir(&self.part_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(present),
            Err(e) => {
                return Err(StreamError::storage_error_full(
                    "Failed to list chunk directory",
                    self.part_dir.display().to_string(),
                    e.to_string(),
                )
                .into())
            }
        };

        let count = self.layout.count();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(stem) = name.strip_suffix(".chk") else { continue };
            match stem.parse::<u32>() {
                Ok(index) if index < count => {
                    present.insert(index);
                }
                _ => trace!("Ignoring stray file in chunk directory: {}", name),
            }
        }
        Ok(present)
    }

    /// Persist one chunk atomically, then mirror it into the streaming file
    pub async fn store_chunk(&self, index: u32, data: &[u8]) -> Result<()> {
        let expected = self.layout.len_of(index).ok_or_else(|| {
            StreamError::validation_error_with_field(format!("Chunk index {} out of range", index), "index")
        })?;
        if data.len() as u64 != expected {
            return Err(StreamError::validation_error(format!(
                "Chunk {} has {} bytes, expected {}",
                index,
                data.len(),
                expected
            ))
            .into());
        }

        let final_path = self.chunk_path(index);
        let tmp_path = self.part_dir.join(format!("{}.{}.tmp", index, CHUNK_EXTENSION));
        fs::write(&tmp_path, data).await.map_err(|e| {
            error!("Failed to write chunk '{}': {}", tmp_path.display(), e);
            StreamError::storage_error_full("Failed to write chunk", tmp_path.display().to_string(), e.to_string())
        })?;
        fs::rename(&tmp_path, &final_path).await.map_err(|e| {
            error!("Failed to publish chunk '{}': {}", final_path.display(), e);
            StreamError::storage_error_full("Failed to publish chunk", final_path.display().to_string(), e.to_string())
        })?;
        trace!("Stored chunk {} at {}", index, final_path.display());

        self.write_streaming(index, data).await
    }

    async fn write_streaming(&self, index: u32, data: &[u8]) -> Result<()> {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .open(&self.streaming_path)
            .await
            .map_err(|e| {
                StreamError::storage_error_full("Failed to open streaming file", self.streaming_path.display().to_string(), e.to_string())
            })?;
        file.seek(SeekFrom::Start(self.layout.offset(index))).await?;
        file.write_all(data).await.map_err(|e| {
            StreamError::storage_error_full("Failed to write streaming file", self.streaming_path.display().to_string(), e.to_string())
        })?;
        file.flush().await?;
        Ok(())
    }

    /// Concatenate every chunk in index order into the final file and check
    /// its length against the advertised size
    pub async fn reassemble(&self) -> Result<PathBuf> {
        info!("Reassembling {} chunks into {}", self.layout.count(), self.complete_path.display());
        let out = fs::File::create(&self.complete_path).await.map_err(|e| {
            error!("Failed to create output '{}': {}", self.complete_path.display(), e);
            StreamError::storage_error_full("Failed to create output file", self.complete_path.display().to_string(), e.to_string())
        })?;
        let mut writer = BufWriter::new(out);

        let mut written = 0u64;
        for index in 0..self.layout.count() {
            let path = self.chunk_path(index);
            let mut chunk = fs::File::open(&path).await.map_err(|e| {
                error!("Chunk {} unavailable for reassembly: {}", index, e);
                StreamError::storage_error_full("Chunk file missing during reassembly", path.display().to_string(), e.to_string())
            })?;
            written += tokio::io::copy(&mut chunk, &mut writer).await?;
        }
        writer.flush().await?;
        drop(writer);

        let actual = fs::metadata(&self.complete_path).await?.len();
        if written != self.layout.size || actual != self.layout.size {
            warn!(
                "Reassembled size mismatch for {}: expected {}, got {}",
                self.complete_path.display(),
                self.layout.size,
                actual
            );
            return Err(StreamError::SizeMismatch {
                path: self.complete_path.display().to_string(),
                expected: self.layout.size,
                actual,
            }
            .into());
        }

        debug!("Reassembled {} bytes", actual);
        Ok(self.complete_path.clone())
    }
}

/// Replace characters that cannot appear in a single path component
pub fn file_safe(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim().trim_matches('.').to_string();
    if cleaned.is_empty() {
        "content".to_string()
    } else {
        cleaned
    }
}

/// `movie.mp4` becomes `movie.streaming.mp4`
fn streaming_name(name: &str) -> String {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{}.streaming.{}", stem, ext),
        _ => format!("{}.streaming", name),
    }
}
