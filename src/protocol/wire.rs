//! Wire protocol utilities
//!
//! Line framing for the control channel: bounded line reads, buffered line
//! writes and exact-length payload reads.

use anyhow::Result;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{trace, warn};

use crate::error::StreamError;
use crate::protocol::constants::MAX_LINE_BYTES;

/// Read one `\n`-terminated line, tolerating a trailing `\r`.
///
/// Returns `None` on a clean end of stream. Lines longer than
/// [`MAX_LINE_BYTES`] are rejected.
pub async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Option<String>> {
    let mut buf = Vec::new();
    let mut limited = (&mut *reader).take(MAX_LINE_BYTES as u64 + 1);
    let read = limited.read_until(b'\n', &mut buf).await?;
    if read == 0 {
        return Ok(None);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
    } else if buf.len() > MAX_LINE_BYTES {
        warn!("Control line exceeds {} bytes", MAX_LINE_BYTES);
        return Err(StreamError::protocol_error_with_source(
            "Line too long",
            format!("more than {} bytes", MAX_LINE_BYTES),
        )
        .into());
    }
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }

    let line = String::from_utf8(buf)
        .map_err(|e| StreamError::protocol_error_with_source("Line is not UTF-8", e.to_string()))?;
    trace!("Read line: {}", line);
    Ok(Some(line))
}

/// Read one line, treating end of stream as a protocol error
pub async fn expect_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<String> {
    read_line(reader)
        .await?
        .ok_or_else(|| StreamError::protocol_error("Connection closed mid-response").into())
}

/// Read exactly `len` payload bytes
pub async fn read_payload<R: AsyncRead + Unpin>(reader: &mut R, len: usize) -> Result<Bytes> {
    let mut payload = BytesMut::zeroed(len);
    reader.read_exact(&mut payload[..]).await.map_err(|e| {
        StreamError::protocol_error_with_source(format!("Short payload, expected {} bytes", len), e.to_string())
    })?;
    Ok(payload.freeze())
}

/// Append a line and its terminator to a buffer
pub fn put_line(buf: &mut BytesMut, line: &str) {
    buf.reserve(line.len() + 1);
    buf.put_slice(line.as_bytes());
    buf.put_u8(b'\n');
}

/// Write a single line and flush
pub async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> Result<()> {
    let mut buf = BytesMut::new();
    put_line(&mut buf, line);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}
