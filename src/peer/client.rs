//! Control client
//!
//! Opens one TCP connection per request to a peer's control server. Every
//! exchange, connect included, is bounded by a timeout so an unresponsive
//! peer only costs the caller that timeout.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::catalog::entry::ContentEntry;
use crate::error::StreamError;
use crate::protocol::command::{Command, ControlLine};
use crate::protocol::constants::{CATALOG_TIMEOUT, CHUNK_SIZE, TRANSFER_TIMEOUT};
use crate::protocol::wire::{expect_line, read_line, read_payload, write_line};
use crate::storage::chunk::chunk_count;

/// Size and chunk count reported by `META`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ContentMeta {
    pub size: u64,
    pub chunks: u32,
}

/// Requests a peer's control server answers
#[async_trait]
pub trait PeerClient: Send + Sync {
    /// List the peer's catalog
    async fn fetch_catalog(&self, addr: SocketAddr) -> Result<Vec<ContentEntry>>;

    /// Ask whether the peer holds a content id
    async fn has_content(&self, addr: SocketAddr, id: &str) -> Result<bool>;

    /// Fetch size and chunk count
    async fn fetch_meta(&self, addr: SocketAddr, id: &str) -> Result<ContentMeta>;

    /// Fetch the raw bytes of one chunk
    async fn fetch_chunk(&self, addr: SocketAddr, id: &str, index: u32) -> Result<Bytes>;
}

/// TCP implementation of [`PeerClient`]
#[derive(Debug, Clone)]
pub struct ControlClient {
    catalog_timeout: Duration,
    transfer_timeout: Duration,
}

impl Default for ControlClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlClient {
    /// Client with protocol default timeouts
    pub fn new() -> Self {
        Self::with_timeouts(CATALOG_TIMEOUT, TRANSFER_TIMEOUT)
    }

    /// Client with custom timeouts for catalog/HAS and META/GETCHUNK
    pub fn with_timeouts(catalog_timeout: Duration, transfer_timeout: Duration) -> Self {
        Self {
            catalog_timeout,
            transfer_timeout,
        }
    }

    async fn bounded<T, F>(&self, addr: SocketAddr, wait: Duration, what: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match timeout(wait, fut).await {
            Ok(result) => result,
            Err(_) => {
                debug!("{} to {} timed out after {:?}", what, addr, wait);
                Err(StreamError::network_error_full(format!("{} timed out", what), addr.to_string(), format!("{:?}", wait)).into())
            }
        }
    }

    async fn open(addr: SocketAddr, command: &Command) -> Result<BufReader<TcpStream>> {
        trace!("Sending {} to {}", command, addr);
        let stream = TcpStream::connect(addr).await.map_err(|e| {
            StreamError::network_error_full("Failed to connect", addr.to_string(), e.to_string())
        })?;
        stream.set_nodelay(true).ok();
        let mut reader = BufReader::new(stream);
        write_line(reader.get_mut(), &command.to_line()).await.map_err(|e| {
            StreamError::peer_error_full("Failed to send command", addr.to_string(), e.to_string())
        })?;
        Ok(reader)
    }

    async fn first_line(addr: SocketAddr, command: Command) -> Result<ControlLine> {
        let mut reader = Self::open(addr, &command).await?;
        let line = expect_line(&mut reader).await?;
        match ControlLine::parse(&line)? {
            ControlLine::Err(code) => Err(StreamError::remote_error(code, addr.to_string()).into()),
            other => Ok(other),
        }
    }

    async fn catalog_exchange(addr: SocketAddr) -> Result<Vec<ContentEntry>> {
        let mut reader = Self::open(addr, &Command::Catalog).await?;
        let mut entries = Vec::new();
        while let Some(line) = read_line(&mut reader).await? {
            if line == "END" {
                break;
            }
            if let Some(entry) = ContentEntry::from_catalog_line(&line) {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    async fn has_exchange(addr: SocketAddr, id: &str) -> Result<bool> {
        match Self::first_line(addr, Command::Has { id: id.to_string() }).await? {
            ControlLine::Yes => Ok(true),
            ControlLine::No => Ok(false),
            other => Err(unexpected(addr, &other)),
        }
    }

    async fn meta_exchange(addr: SocketAddr, id: &str) -> Result<ContentMeta> {
        match Self::first_line(addr, Command::Meta { id: id.to_string() }).await? {
            ControlLine::Size { size, chunks } => {
                if chunks != chunk_count(size, CHUNK_SIZE) {
                    warn!("Peer {} reported {} chunks for {} bytes", addr, chunks, size);
                    return Err(StreamError::peer_error_with_peer(
                        format!("Inconsistent META: {} bytes in {} chunks", size, chunks),
                        addr.to_string(),
                    )
                    .into());
                }
                Ok(ContentMeta { size, chunks })
            }
            other => Err(unexpected(addr, &other)),
        }
    }

    async fn chunk_exchange(addr: SocketAddr, id: &str, index: u32) -> Result<Bytes> {
        let command = Command::GetChunk { id: id.to_string(), index };
        let mut reader = Self::open(addr, &command).await?;
        let header = expect_line(&mut reader).await?;
        let len = match ControlLine::parse(&header)? {
            ControlLine::Data { index: got, len } if got == index && len <= CHUNK_SIZE => len,
            ControlLine::Data { index: got, len } => {
                return Err(StreamError::peer_error_with_peer(
                    format!("Unexpected DATA header for chunk {}: index {} length {}", index, got, len),
                    addr.to_string(),
                )
                .into())
            }
            ControlLine::Err(code) => return Err(StreamError::remote_error(code, addr.to_string()).into()),
            other => return Err(unexpected(addr, &other)),
        };

        let payload = read_payload(&mut reader, len as usize).await.map_err(|e| {
            StreamError::peer_error_full(format!("Short read for chunk {}", index), addr.to_string(), e.to_string())
        })?;

        loop {
            let line = expect_line(&mut reader).await?;
            if line.is_empty() {
                continue;
            }
            if line == "END" {
                break;
            }
            return Err(StreamError::peer_error_full("Missing END after chunk", addr.to_string(), line).into());
        }
        trace!("Received chunk {} ({} bytes) from {}", index, payload.len(), addr);
        Ok(payload)
    }
}

fn unexpected(addr: SocketAddr, line: &ControlLine) -> anyhow::Error {
    StreamError::peer_error_full("Unexpected response", addr.to_string(), line.to_line()).into()
}

#[async_trait]
impl PeerClient for ControlClient {
    async fn fetch_catalog(&self, addr: SocketAddr) -> Result<Vec<ContentEntry>> {
        self.bounded(addr, self.catalog_timeout, "CATALOG", Self::catalog_exchange(addr)).await
    }

    async fn has_content(&self, addr: SocketAddr, id: &str) -> Result<bool> {
        self.bounded(addr, self.catalog_timeout, "HAS", Self::has_exchange(addr, id)).await
    }

    async fn fetch_meta(&self, addr: SocketAddr, id: &str) -> Result<ContentMeta> {
        self.bounded(addr, self.transfer_timeout, "META", Self::meta_exchange(addr, id)).await
    }

    async fn fetch_chunk(&self, addr: SocketAddr, id: &str, index: u32) -> Result<Bytes> {
        self.bounded(addr, self.transfer_timeout, "GETCHUNK", Self::chunk_exchange(addr, id, index)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteErrorCode;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one connection with a canned reply
    async fn canned(reply: Vec<u8>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 256];
            let _ = stream.read(&mut buf).await;
            stream.write_all(&reply).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn test_catalog_skips_malformed_lines() {
        let hash = "c".repeat(64);
        let reply = format!("VIDEO|a.mp4|10|{}\r\nVIDEO|broken\nVIDEO|b.mkv|20\nEND\n", hash);
        let addr = canned(reply.into_bytes()).await;
        let entries = ControlClient::new().fetch_catalog(addr).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], ContentEntry::new("a.mp4", 10, hash));
        assert_eq!(entries[1].hash, "");
    }

    #[tokio::test]
    async fn test_has_yes_and_no() {
        let addr = canned(b"YES\nEND\n".to_vec()).await;
        assert!(ControlClient::new().has_content(addr, "x.mp4").await.unwrap());
        let addr = canned(b"NO\nEND\n".to_vec()).await;
        assert!(!ControlClient::new().has_content(addr, "x.mp4").await.unwrap());
    }

    #[tokio::test]
    async fn test_meta_parses_and_validates() {
        let addr = canned(b"SIZE|10300000|CHUNKS|40\nEND\n".to_vec()).await;
        let meta = ControlClient::new().fetch_meta(addr, "x").await.unwrap();
        assert_eq!(meta, ContentMeta { size: 10_300_000, chunks: 40 });

        let addr = canned(b"SIZE|10|CHUNKS|5\nEND\n".to_vec()).await;
        assert!(ControlClient::new().fetch_meta(addr, "x").await.is_err());
    }

    #[tokio::test]
    async fn test_remote_error_codes_surface() {
        let addr = canned(b"ERR|NOTFOUND\nEND\n".to_vec()).await;
        let err = ControlClient::new().fetch_meta(addr, "x").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StreamError>(),
            Some(StreamError::RemoteError { code: RemoteErrorCode::NotFound, .. })
        ));

        let addr = canned(b"ERR|RANGE\nEND\n".to_vec()).await;
        let err = ControlClient::new().fetch_chunk(addr, "x", 40).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StreamError>(),
            Some(StreamError::RemoteError { code: RemoteErrorCode::Range, .. })
        ));
    }

    #[tokio::test]
    async fn test_chunk_payload_and_short_read() {
        let addr = canned(b"DATA|2|5\nhello\nEND\n".to_vec()).await;
        let data = ControlClient::new().fetch_chunk(addr, "x", 2).await.unwrap();
        assert_eq!(&data[..], b"hello");

        let addr = canned(b"DATA|2|50\nhello".to_vec()).await;
        assert!(ControlClient::new().fetch_chunk(addr, "x", 2).await.is_err());

        let addr = canned(b"DATA|3|5\nhello\nEND\n".to_vec()).await;
        assert!(ControlClient::new().fetch_chunk(addr, "x", 2).await.is_err());
    }

    #[tokio::test]
    async fn test_unresponsive_peer_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let client = ControlClient::with_timeouts(Duration::from_millis(100), Duration::from_millis(100));
        let err = client.has_content(addr, "x").await.unwrap_err();
        assert!(matches!(err.downcast_ref::<StreamError>(), Some(StreamError::NetworkError { .. })));
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        assert!(ControlClient::new().fetch_catalog(addr).await.is_err());
    }
}
