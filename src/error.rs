//! Error taxonomy
//!
//! Every failure inside a multi-step tunnel call aborts the whole call and is
//! surfaced unchanged to the caller. Nothing here is retried.

use std::time::Duration;

/// Errors produced by the tunnel layers
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    /// Malformed address text or HTTP status line
    #[error("format error: {0}")]
    Format(String),

    /// A single poke round trip exceeded its timeout
    #[error("timed out after {0:?} waiting for a relay candidate")]
    Timeout(Duration),

    /// Negotiation finished without a usable relay candidate, or the server is unreachable
    #[error("no reply from {server}: {reason}")]
    NoReply { server: String, reason: String },

    /// Wrong URL scheme or a reply that violates the tunnel protocol
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Compression or decompression integrity failure
    #[error("codec error: {0}")]
    Codec(String),

    /// Local I/O failure (socket bind, send)
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TunnelError {
    pub(crate) fn no_reply(server: &str, reason: impl Into<String>) -> Self {
        Self::NoReply {
            server: server.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether this error came from a poke running out of time
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// Result alias for tunnel operations
pub type Result<T, E = TunnelError> = std::result::Result<T, E>;
