//! Covert command grammar and relay reply encoding
//!
//! Commands travel in the TURN username:
//! - Start:    `s:<compressedLength>`
//! - Chunk:    `c:<sessionId>:<byteOffset>:<base64Chunk>`
//! - Execute:  `e:<sessionId>`
//! - Retrieve: `r:<sessionId>:<byteOffset>`
//!
//! Replies come back in the relay candidate: length in bits 8-12 of the port,
//! first byte in the low byte of the port, remaining bytes in the address.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use std::fmt;

use crate::error::{Result, TunnelError};
use crate::util::{decode_ipv6, encode_ipv6};

/// Prefix the relay expects in front of every command
pub const USERNAME_PREFIX: &str = "turnrpc:";

/// Fixed credential sent with every command
pub const CREDENTIAL: &str = "turnrpc";

/// Bytes of compressed request carried by one chunk command
pub const UPLOAD_CHUNK_SIZE: usize = 256;

/// Bytes of response returned by one retrieve command
pub const RETRIEVE_CHUNK_SIZE: usize = 16;

/// Largest reply a relay candidate can carry
pub const MAX_REPLY_LEN: usize = 16;

/// Leading address byte relays put in front of the reply bytes
const RELAY_ADDRESS_MARKER: u8 = 0xfc;

/// Port bits always set by relays so the port stays out of the well-known range
const RELAY_PORT_BASE: u16 = 0xc000;

/// Opaque server-side session token, embedded as base64
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(Bytes);

impl SessionId {
    pub fn new(raw: impl Into<Bytes>) -> Self {
        Self(raw.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Decode the text form used inside commands
    pub fn from_text(text: &str) -> Result<Self> {
        STANDARD
            .decode(text)
            .map(|raw| Self(Bytes::from(raw)))
            .map_err(|e| TunnelError::Protocol(format!("invalid session id {:?}: {}", text, e)))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&STANDARD.encode(&self.0))
    }
}

/// One covert-channel operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Allocate a session for a compressed payload of `len` bytes
    Start { len: usize },
    /// Store `data` at `offset` of the session's request buffer
    Chunk {
        session: SessionId,
        offset: usize,
        data: Bytes,
    },
    /// Run the assembled request; reply is the 4-byte response length
    Execute { session: SessionId },
    /// Fetch up to 16 response bytes at `offset`
    Retrieve { session: SessionId, offset: usize },
}

impl Command {
    /// Single-letter operation code
    pub fn op(&self) -> char {
        match self {
            Command::Start { .. } => 's',
            Command::Chunk { .. } => 'c',
            Command::Execute { .. } => 'e',
            Command::Retrieve { .. } => 'r',
        }
    }

    /// Username presented to the relay for this command
    pub fn username(&self) -> String {
        format!("{}{}", USERNAME_PREFIX, self)
    }

    /// Parse the text form of a command (the part after the username prefix)
    pub fn parse(text: &str) -> Result<Self> {
        let invalid = || TunnelError::Protocol(format!("invalid command {:?}", text));
        let (op, args) = text.split_once(':').ok_or_else(invalid)?;
        let offset = |s: &str| s.parse::<usize>().map_err(|_| invalid());

        match op {
            "s" => Ok(Command::Start { len: offset(args)? }),
            "c" => {
                let mut parts = args.splitn(3, ':');
                let (id, off, data) = match (parts.next(), parts.next(), parts.next()) {
                    (Some(id), Some(off), Some(data)) => (id, off, data),
                    _ => return Err(invalid()),
                };
                let data = STANDARD.decode(data).map_err(|_| invalid())?;
                Ok(Command::Chunk {
                    session: SessionId::from_text(id)?,
                    offset: offset(off)?,
                    data: Bytes::from(data),
                })
            }
            "e" => Ok(Command::Execute {
                session: SessionId::from_text(args)?,
            }),
            "r" => {
                let (id, off) = args.split_once(':').ok_or_else(invalid)?;
                Ok(Command::Retrieve {
                    session: SessionId::from_text(id)?,
                    offset: offset(off)?,
                })
            }
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Start { len } => write!(f, "s:{}", len),
            Command::Chunk {
                session,
                offset,
                data,
            } => write!(f, "c:{}:{}:{}", session, offset, STANDARD.encode(data)),
            Command::Execute { session } => write!(f, "e:{}", session),
            Command::Retrieve { session, offset } => write!(f, "r:{}:{}", session, offset),
        }
    }
}

/// Decode the reply carried by a relay candidate's address and port.
///
/// Returns `Ok(None)` when the encoded length exceeds 16; such candidates are
/// noise, not errors. Fails only when the address is not valid IPv6 text.
pub fn decode_relay_reply(address: &str, port: u16) -> Result<Option<Bytes>> {
    let len = ((port >> 8) & 0x1f) as usize;
    if len > MAX_REPLY_LEN {
        return Ok(None);
    }

    let mut raw = decode_ipv6(address)?;
    raw[0] = (port & 0xff) as u8;
    Ok(Some(Bytes::copy_from_slice(&raw[..len])))
}

/// Encode a reply the way a relay does: the inverse of [`decode_relay_reply`].
pub fn encode_relay_reply(reply: &[u8]) -> Result<(String, u16)> {
    if reply.len() > MAX_REPLY_LEN {
        return Err(TunnelError::Protocol(format!(
            "reply of {} bytes exceeds {} byte limit",
            reply.len(),
            MAX_REPLY_LEN
        )));
    }

    let mut padded = [0u8; 16];
    padded[..reply.len()].copy_from_slice(reply);
    let first = padded[0];
    padded[0] = RELAY_ADDRESS_MARKER;

    let port = RELAY_PORT_BASE | ((reply.len() as u16) << 8) | first as u16;
    Ok((encode_ipv6(&padded), port))
}

/// Decode the execute reply: exactly four big-endian bytes
pub fn decode_response_length(reply: &[u8]) -> Result<usize> {
    let raw: [u8; 4] = reply.try_into().map_err(|_| {
        TunnelError::Protocol(format!(
            "execute reply must be 4 bytes, got {}",
            reply.len()
        ))
    })?;
    Ok(u32::from_be_bytes(raw) as usize)
}

/// Byte offsets of the fixed-size pieces covering `[0, len)`
pub fn chunk_offsets(len: usize, chunk: usize) -> impl Iterator<Item = usize> {
    (0..len).step_by(chunk.max(1))
}
