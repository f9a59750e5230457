//! Discovery messages
//!
//! Defines the UDP gossip messages and their text wire format:
//! `TYPE|msgId|ttl|peerId|tcpPort|discoveryPort|catalogDigest`.

use anyhow::Result;
use std::fmt;
use tracing::{error, trace};
use uuid::Uuid;

use crate::error::StreamError;
use crate::protocol::constants::MAX_DATAGRAM_BYTES;

/// Field separator on the discovery wire
const FIELD_SEPARATOR: char = '|';

/// Discovery message kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Hello,
    HelloAck,
    Bye,
}

impl MessageKind {
    /// Wire token for this kind
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Hello => "HELLO",
            MessageKind::HelloAck => "HELLO_ACK",
            MessageKind::Bye => "BYE",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for MessageKind {
    type Error = anyhow::Error;

    fn try_from(value: &str) -> Result<Self> {
        match value {
            "HELLO" => Ok(MessageKind::Hello),
            "HELLO_ACK" => Ok(MessageKind::HelloAck),
            "BYE" => Ok(MessageKind::Bye),
            _ => Err(StreamError::parse_error_with_source(
                "Unknown discovery message type",
                format!("type: {}", value),
            )
            .into()),
        }
    }
}

/// A single discovery datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryMessage {
    pub kind: MessageKind,
    /// Unique id used for de-duplication
    pub msg_id: String,
    /// Remaining hop budget
    pub ttl: u32,
    /// Sender's peer id
    pub peer_id: String,
    /// Sender's control server port
    pub tcp_port: u16,
    /// Sender's discovery port
    pub discovery_port: u16,
    /// Sender's catalog digest, possibly empty
    pub digest: String,
}

impl DiscoveryMessage {
    /// Build a fresh HELLO with a new message id
    pub fn hello(peer_id: &str, ttl: u32, tcp_port: u16, discovery_port: u16, digest: &str) -> Self {
        Self {
            kind: MessageKind::Hello,
            msg_id: Uuid::new_v4().to_string(),
            ttl,
            peer_id: peer_id.to_string(),
            tcp_port,
            discovery_port,
            digest: digest.to_string(),
        }
    }

    /// Build a HELLO_ACK that echoes the id of the HELLO it answers
    pub fn hello_ack(reply_to: &str, peer_id: &str, tcp_port: u16, discovery_port: u16, digest: &str) -> Self {
        Self {
            kind: MessageKind::HelloAck,
            msg_id: reply_to.to_string(),
            ttl: 0,
            peer_id: peer_id.to_string(),
            tcp_port,
            discovery_port,
            digest: digest.to_string(),
        }
    }

    /// Build a BYE with a new message id and no digest
    pub fn bye(peer_id: &str, tcp_port: u16, discovery_port: u16) -> Self {
        Self {
            kind: MessageKind::Bye,
            msg_id: Uuid::new_v4().to_string(),
            ttl: 0,
            peer_id: peer_id.to_string(),
            tcp_port,
            discovery_port,
            digest: String::new(),
        }
    }

    /// The copy of this message to relay onward, if its hop budget allows one
    pub fn forwarded(&self) -> Option<Self> {
        if self.ttl <= 1 {
            return None;
        }
        let mut next = self.clone();
        next.ttl = self.ttl - 1;
        Some(next)
    }

    /// Render the text wire form
    pub fn to_wire(&self) -> String {
        let digest = self.digest.replace(FIELD_SEPARATOR, "_");
        format!(
            "{}|{}|{}|{}|{}|{}|{}",
            self.kind, self.msg_id, self.ttl, self.peer_id, self.tcp_port, self.discovery_port, digest
        )
    }

    /// Serialize into datagram bytes, rejecting oversize messages
    pub fn encode(&self) -> Result<Vec<u8>> {
        let wire = self.to_wire();
        if wire.len() > MAX_DATAGRAM_BYTES {
            error!("Discovery message too large: {} bytes", wire.len());
            return Err(StreamError::protocol_error_with_source(
                "Discovery message exceeds datagram limit",
                format!("{} > {}", wire.len(), MAX_DATAGRAM_BYTES),
            )
            .into());
        }
        Ok(wire.into_bytes())
    }

    /// Parse the text wire form
    pub fn from_wire(text: &str) -> Result<Self> {
        let text = text.trim();
        let parts: Vec<&str> = text.splitn(7, FIELD_SEPARATOR).collect();
        if parts.len() < 6 {
            trace!("Discovery message has {} fields, need at least 6", parts.len());
            return Err(StreamError::parse_error_with_source(
                "Truncated discovery message",
                format!("{} fields", parts.len()),
            )
            .into());
        }

        let kind = MessageKind::try_from(parts[0])?;
        let msg_id = parts[1].to_string();
        if msg_id.is_empty() {
            return Err(StreamError::parse_error("Discovery message without id").into());
        }
        let ttl = parse_field::<u32>(parts[2], "ttl")?;
        let peer_id = parts[3].to_string();
        if peer_id.is_empty() {
            return Err(StreamError::parse_error("Discovery message without peer id").into());
        }
        let tcp_port = parse_field::<u16>(parts[4], "tcpPort")?;
        let discovery_port = parse_field::<u16>(parts[5], "discoveryPort")?;
        let digest = parts.get(6).map(|d| d.to_string()).unwrap_or_default();

        Ok(Self {
            kind,
            msg_id,
            ttl,
            peer_id,
            tcp_port,
            discovery_port,
            digest,
        })
    }

    /// Parse datagram bytes
    pub fn decode(data: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(data).map_err(|e| {
            StreamError::parse_error_with_source("Discovery datagram is not UTF-8", e.to_string())
        })?;
        Self::from_wire(text)
    }
}

fn parse_field<T: std::str::FromStr>(value: &str, field: &str) -> Result<T>
where
    T::Err: fmt::Display,
{
    value.trim().parse::<T>().map_err(|e| {
        StreamError::parse_error_with_source(format!("Invalid {} field", field), format!("'{}': {}", value, e)).into()
    })
}
