//! Error types for peer-stream
//!
//! This module defines the error taxonomy shared by discovery, the control
//! protocol, the catalog and the streaming scheduler.

use std::fmt;

/// Error codes a remote control server can answer with (`ERR|<code>`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteErrorCode {
    /// The requested content id does not resolve on the remote peer
    NotFound,
    /// The chunk index is outside `0..chunk_count`
    Range,
    /// The command was missing arguments or carried an unparsable index
    Args,
    /// The command word was not recognised
    Unknown,
}

impl RemoteErrorCode {
    /// Wire token for this code
    pub fn as_str(&self) -> &'static str {
        match self {
            RemoteErrorCode::NotFound => "NOTFOUND",
            RemoteErrorCode::Range => "RANGE",
            RemoteErrorCode::Args => "ARGS",
            RemoteErrorCode::Unknown => "UNKNOWN",
        }
    }

    /// Parse a wire token, case-insensitively
    pub fn from_token(token: &str) -> Option<Self> {
        match token.trim().to_ascii_uppercase().as_str() {
            "NOTFOUND" => Some(RemoteErrorCode::NotFound),
            "RANGE" => Some(RemoteErrorCode::Range),
            "ARGS" => Some(RemoteErrorCode::Args),
            "UNKNOWN" | "UNKNOWNCOMMAND" => Some(RemoteErrorCode::Unknown),
            _ => None,
        }
    }
}

impl fmt::Display for RemoteErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Comprehensive error type for peer-stream operations
#[derive(Debug, Clone)]
pub enum StreamError {
    /// Wire message parsing errors
    ParseError {
        message: String,
        source: Option<String>,
    },

    /// Control or discovery protocol violations
    ProtocolError {
        message: String,
        source: Option<String>,
    },

    /// Errors talking to a specific peer
    PeerError {
        message: String,
        peer: Option<String>,
        source: Option<String>,
    },

    /// A peer answered with an `ERR|<code>` line
    RemoteError {
        code: RemoteErrorCode,
        peer: Option<String>,
    },

    /// File I/O and staging errors
    StorageError {
        message: String,
        path: Option<String>,
        source: Option<String>,
    },

    /// Discovery service errors
    DiscoveryError {
        message: String,
        address: Option<String>,
        source: Option<String>,
    },

    /// Configuration errors
    ConfigError {
        message: String,
        field: Option<String>,
    },

    /// Network errors
    NetworkError {
        message: String,
        address: Option<String>,
        source: Option<String>,
    },

    /// Validation errors
    ValidationError {
        message: String,
        field: Option<String>,
    },

    /// A stream was requested for a key that already has an active session
    SessionActive {
        key: String,
    },

    /// No peer (and not the local catalog) can serve the key
    NoSource {
        key: String,
    },

    /// Every source failed to answer META
    MetaUnavailable {
        key: String,
        attempts: usize,
    },

    /// Chunks still missing after every repair round
    MissingChunks {
        key: String,
        indices: Vec<u32>,
    },

    /// The reassembled output does not have the advertised length
    SizeMismatch {
        path: String,
        expected: u64,
        actual: u64,
    },

    /// The session was stopped before it completed
    SessionStopped {
        key: String,
    },
}

impl StreamError {
    /// Create a new ParseError
    pub fn parse_error(message: impl Into<String>) -> Self {
        StreamError::ParseError {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new ParseError with source
    pub fn parse_error_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        StreamError::ParseError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a new ProtocolError
    pub fn protocol_error(message: impl Into<String>) -> Self {
        StreamError::ProtocolError {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new ProtocolError with source
    pub fn protocol_error_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        StreamError::ProtocolError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a new PeerError with peer address
    pub fn peer_error_with_peer(message: impl Into<String>, peer: impl Into<String>) -> Self {
        StreamError::PeerError {
            message: message.into(),
            peer: Some(peer.into()),
            source: None,
        }
    }

    /// Create a new PeerError with peer and source
    pub fn peer_error_full(message: impl Into<String>, peer: impl Into<String>, source: impl Into<String>) -> Self {
        StreamError::PeerError {
            message: message.into(),
            peer: Some(peer.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new RemoteError for the given peer
    pub fn remote_error(code: RemoteErrorCode, peer: impl Into<String>) -> Self {
        StreamError::RemoteError {
            code,
            peer: Some(peer.into()),
        }
    }

    /// Create a new StorageError with path and source
    pub fn storage_error_full(message: impl Into<String>, path: impl Into<String>, source: impl Into<String>) -> Self {
        StreamError::StorageError {
            message: message.into(),
            path: Some(path.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new DiscoveryError
    pub fn discovery_error(message: impl Into<String>) -> Self {
        StreamError::DiscoveryError {
            message: message.into(),
            address: None,
            source: None,
        }
    }

    /// Create a new DiscoveryError with address and source
    pub fn discovery_error_full(message: impl Into<String>, address: impl Into<String>, source: impl Into<String>) -> Self {
        StreamError::DiscoveryError {
            message: message.into(),
            address: Some(address.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new ConfigError
    pub fn config_error(message: impl Into<String>) -> Self {
        StreamError::ConfigError {
            message: message.into(),
            field: None,
        }
    }

    /// Create a new ConfigError with field
    pub fn config_error_with_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        StreamError::ConfigError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a new NetworkError with address and source
    pub fn network_error_full(message: impl Into<String>, address: impl Into<String>, source: impl Into<String>) -> Self {
        StreamError::NetworkError {
            message: message.into(),
            address: Some(address.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new ValidationError
    pub fn validation_error(message: impl Into<String>) -> Self {
        StreamError::ValidationError {
            message: message.into(),
            field: None,
        }
    }

    /// Create a new ValidationError with field
    pub fn validation_error_with_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        StreamError::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Add context to the error
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        let ctx = context.into();
        match &mut self {
            StreamError::ParseError { source, .. }
            | StreamError::ProtocolError { source, .. }
            | StreamError::PeerError { source, .. }
            | StreamError::StorageError { source, .. }
            | StreamError::DiscoveryError { source, .. }
            | StreamError::NetworkError { source, .. } => {
                *source = Some(source.as_ref().map_or_else(|| ctx.clone(), |s| format!("{}: {}", s, ctx)));
            }
            _ => {}
        }
        self
    }

    /// Whether the error is recovered by moving to the next source.
    /// A chunk that fails validation counts: another peer may serve it intact.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StreamError::PeerError { .. }
                | StreamError::RemoteError { .. }
                | StreamError::NetworkError { .. }
                | StreamError::ProtocolError { .. }
                | StreamError::ParseError { .. }
                | StreamError::ValidationError { .. }
        )
    }
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamError::ParseError { message, source } => {
                if let Some(src) = source {
                    write!(f, "Parse error: {} (source: {})", message, src)
                } else {
                    write!(f, "Parse error: {}", message)
                }
            }
            StreamError::ProtocolError { message, source } => {
                if let Some(src) = source {
                    write!(f, "Protocol error: {} (source: {})", message, src)
                } else {
                    write!(f, "Protocol error: {}", message)
                }
            }
            StreamError::PeerError { message, peer, source } => {
                match (peer, source) {
                    (Some(p), Some(s)) => write!(f, "Peer error: {} (peer: {}, source: {})", message, p, s),
                    (Some(p), None) => write!(f, "Peer error: {} (peer: {})", message, p),
                    (None, Some(s)) => write!(f, "Peer error: {} (source: {})", message, s),
                    (None, None) => write!(f, "Peer error: {}", message),
                }
            }
            StreamError::RemoteError { code, peer } => {
                if let Some(p) = peer {
                    write!(f, "Remote error: ERR|{} (peer: {})", code, p)
                } else {
                    write!(f, "Remote error: ERR|{}", code)
                }
            }
            StreamError::StorageError { message, path, source } => {
                match (path, source) {
                    (Some(p), Some(s)) => write!(f, "Storage error: {} (path: {}, source: {})", message, p, s),
                    (Some(p), None) => write!(f, "Storage error: {} (path: {})", message, p),
                    (None, Some(s)) => write!(f, "Storage error: {} (source: {})", message, s),
                    (None, None) => write!(f, "Storage error: {}", message),
                }
            }
            StreamError::DiscoveryError { message, address, source } => {
                match (address, source) {
                    (Some(a), Some(s)) => write!(f, "Discovery error: {} (address: {}, source: {})", message, a, s),
                    (Some(a), None) => write!(f, "Discovery error: {} (address: {})", message, a),
                    (None, Some(s)) => write!(f, "Discovery error: {} (source: {})", message, s),
                    (None, None) => write!(f, "Discovery error: {}", message),
                }
            }
            StreamError::ConfigError { message, field } => {
                if let Some(field_val) = field {
                    write!(f, "Config error: {} (field: {})", message, field_val)
                } else {
                    write!(f, "Config error: {}", message)
                }
            }
            StreamError::NetworkError { message, address, source } => {
                match (address, source) {
                    (Some(a), Some(s)) => write!(f, "Network error: {} (address: {}, source: {})", message, a, s),
                    (Some(a), None) => write!(f, "Network error: {} (address: {})", message, a),
                    (None, Some(s)) => write!(f, "Network error: {} (source: {})", message, s),
                    (None, None) => write!(f, "Network error: {}", message),
                }
            }
            StreamError::ValidationError { message, field } => {
                if let Some(field_val) = field {
                    write!(f, "Validation error: {} (field: {})", message, field_val)
                } else {
                    write!(f, "Validation error: {}", message)
                }
            }
            StreamError::SessionActive { key } => {
                write!(f, "A stream session is already active for '{}'", key)
            }
            StreamError::NoSource { key } => {
                write!(f, "No peer has this file: '{}'", key)
            }
            StreamError::MetaUnavailable { key, attempts } => {
                write!(f, "META failed for all sources of '{}' ({} tried)", key, attempts)
            }
            StreamError::MissingChunks { key, indices } => {
                write!(f, "Missing chunks for '{}' after repair: {:?}", key, indices)
            }
            StreamError::SizeMismatch { path, expected, actual } => {
                write!(f, "Final size mismatch for {}: expected {} bytes, got {}", path, expected, actual)
            }
            StreamError::SessionStopped { key } => {
                write!(f, "Stream session for '{}' was stopped", key)
            }
        }
    }
}

impl std::error::Error for StreamError {}

// Implement From traits for common error types

impl From<std::io::Error> for StreamError {
    fn from(err: std::io::Error) -> Self {
        StreamError::storage_error_full(err.to_string(), "unknown".to_string(), err.kind().to_string())
    }
}

impl From<serde_json::Error> for StreamError {
    fn from(err: serde_json::Error) -> Self {
        StreamError::config_error(format!("Failed to parse JSON data: {}", err))
    }
}

impl From<std::net::AddrParseError> for StreamError {
    fn from(err: std::net::AddrParseError) -> Self {
        StreamError::network_error_full("Failed to parse address", "unknown".to_string(), err.to_string())
    }
}
