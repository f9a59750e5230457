//! Control server
//!
//! Serves the local catalog and chunk data. Each accepted connection gets
//! its own task that reads one command, writes one response and closes.

use anyhow::Result;
use bytes::{BufMut, BytesMut};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader, SeekFrom};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

use crate::catalog::local::LocalCatalog;
use crate::error::{RemoteErrorCode, StreamError};
use crate::protocol::command::{Command, ControlLine, END_LINE};
use crate::protocol::constants::COMMAND_READ_TIMEOUT;
use crate::protocol::wire::{put_line, read_line};
use crate::storage::chunk::ChunkLayout;

/// TCP control server bound to a local port
pub struct ControlServer {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl ControlServer {
    /// Bind and start accepting connections
    pub async fn start(bind_addr: SocketAddr, catalog: Arc<LocalCatalog>) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr).await.map_err(|e| {
            error!("Failed to bind control server to {}: {}", bind_addr, e);
            StreamError::network_error_full("Failed to bind control server", bind_addr.to_string(), e.to_string())
        })?;
        let local_addr = listener.local_addr()?;
        info!("Control server listening on {}", local_addr);

        let task = tokio::spawn(accept_loop(listener, catalog));
        Ok(Self { local_addr, task })
    }

    /// Bound address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections; in-flight requests finish on their own
    pub fn stop(&self) {
        info!("Stopping control server on {}", self.local_addr);
        self.task.abort();
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn accept_loop(listener: TcpListener, catalog: Arc<LocalCatalog>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                trace!("Accepted control connection from {}", peer);
                let catalog = catalog.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, peer, &catalog).await {
                        debug!("Control connection from {} failed: {}", peer, e);
                    }
                });
            }
            Err(e) => {
                warn!("Failed to accept control connection: {}", e);
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, catalog: &LocalCatalog) -> Result<()> {
    let mut reader = BufReader::new(stream);
    let line = timeout(COMMAND_READ_TIMEOUT, read_line(&mut reader))
        .await
        .map_err(|_| StreamError::peer_error_with_peer("Timed out waiting for command", peer.to_string()))??;
    let Some(line) = line else {
        trace!("Connection from {} closed without a command", peer);
        return Ok(());
    };
    debug!("Control command from {}: {}", peer, line);

    let response = respond(catalog, &line).await?;
    let stream = reader.get_mut();
    stream.write_all(&response).await?;
    stream.flush().await?;
    stream.shutdown().await.ok();
    Ok(())
}

/// Build the complete response to one command line
pub async fn respond(catalog: &LocalCatalog, line: &str) -> Result<BytesMut> {
    let mut out = BytesMut::new();
    let command = match Command::parse(line) {
        Ok(command) => command,
        Err(code) => {
            debug!("Rejecting command '{}': {}", line, code);
            put_line(&mut out, &ControlLine::Err(code).to_line());
            put_line(&mut out, END_LINE);
            return Ok(out);
        }
    };

    match command {
        Command::Catalog => {
            for entry in catalog.list_entries().await {
                put_line(&mut out, &entry.to_catalog_line());
            }
        }
        Command::Has { id } => {
            let reply = if catalog.resolve(&id).await.is_some() {
                ControlLine::Yes
            } else {
                ControlLine::No
            };
            put_line(&mut out, &reply.to_line());
        }
        Command::Meta { id } => {
            let reply = match catalog.resolve(&id).await {
                Some(found) => {
                    let layout = ChunkLayout::new(found.entry.size);
                    ControlLine::Size {
                        size: layout.size,
                        chunks: layout.count(),
                    }
                }
                None => ControlLine::Err(RemoteErrorCode::NotFound),
            };
            put_line(&mut out, &reply.to_line());
        }
        Command::GetChunk { id, index } => {
            let Some(found) = catalog.resolve(&id).await else {
                put_line(&mut out, &ControlLine::Err(RemoteErrorCode::NotFound).to_line());
                put_line(&mut out, END_LINE);
                return Ok(out);
            };
            let layout = ChunkLayout::new(found.entry.size);
            let Some(len) = layout.len_of(index) else {
                debug!("Chunk {} out of range for {} ({} chunks)", index, found.entry.name, layout.count());
                put_line(&mut out, &ControlLine::Err(RemoteErrorCode::Range).to_line());
                put_line(&mut out, END_LINE);
                return Ok(out);
            };

            put_chunk(&mut out, &found.path, index, layout.offset(index), len).await?;
        }
    }
    put_line(&mut out, END_LINE);
    Ok(out)
}

/// Append the DATA header and payload, or ERR|NOTFOUND when the file went
/// away or shrank after it was resolved
async fn put_chunk(out: &mut BytesMut, path: &Path, index: u32, offset: u64, len: u64) -> Result<()> {
    let data = match read_range(path, offset, len).await {
        Ok(data) => data,
        Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::UnexpectedEof) => {
            warn!("Content file {} changed while serving chunk {}: {}", path.display(), index, e);
            put_line(out, &ControlLine::Err(RemoteErrorCode::NotFound).to_line());
            return Ok(());
        }
        Err(e) => {
            error!("Failed to read chunk {} of {}: {}", index, path.display(), e);
            return Err(StreamError::storage_error_full("Failed to read chunk", path.display().to_string(), e.to_string()).into());
        }
    };
    put_line(out, &ControlLine::Data { index, len }.to_line());
    out.reserve(data.len() + 1);
    out.put_slice(&data);
    out.put_u8(b'\n');
    Ok(())
}

async fn read_range(path: &Path, offset: u64, len: u64) -> std::io::Result<Vec<u8>> {
    let mut file = fs::File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    let mut data = vec![0u8; len as usize];
    file.read_exact(&mut data).await?;
    Ok(data)
}
