//! ICE candidate attribute
//!
//! Text form (RFC 8839 `candidate-attribute`):
//! `candidate:<foundation> <component> <transport> <priority> <address> <port> typ <type> [raddr <addr> rport <port>] ...`

use std::fmt;
use std::str::FromStr;

use crate::error::TunnelError;

/// Candidate type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateType {
    Host,
    ServerReflexive,
    PeerReflexive,
    Relay,
}

impl CandidateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CandidateType::Host => "host",
            CandidateType::ServerReflexive => "srflx",
            CandidateType::PeerReflexive => "prflx",
            CandidateType::Relay => "relay",
        }
    }
}

impl FromStr for CandidateType {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "host" => Ok(CandidateType::Host),
            "srflx" => Ok(CandidateType::ServerReflexive),
            "prflx" => Ok(CandidateType::PeerReflexive),
            "relay" => Ok(CandidateType::Relay),
            other => Err(TunnelError::Format(format!("unknown candidate type {:?}", other))),
        }
    }
}

/// One gathered candidate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub foundation: String,
    pub component: u16,
    pub transport: String,
    pub priority: u32,
    pub address: String,
    pub port: u16,
    pub kind: CandidateType,
    pub related: Option<(String, u16)>,
}

impl IceCandidate {
    /// Relay candidate for an allocated address, as a TURN client reports it
    pub fn relay(address: String, port: u16, related: Option<(String, u16)>) -> Self {
        Self {
            foundation: "3".to_string(),
            component: 1,
            transport: "udp".to_string(),
            // type preference 0, local preference 65535
            priority: (65535 << 8) | 255,
            address,
            port,
            kind: CandidateType::Relay,
            related,
        }
    }

    pub fn is_relay(&self) -> bool {
        self.kind == CandidateType::Relay
    }
}

impl FromStr for IceCandidate {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |what: &str| TunnelError::Format(format!("candidate {}: {:?}", what, s));

        let body = s.trim();
        let body = body.strip_prefix("a=").unwrap_or(body);
        let body = body.strip_prefix("candidate:").unwrap_or(body);
        let parts: Vec<&str> = body.split_whitespace().collect();
        if parts.len() < 8 || parts[6] != "typ" {
            return Err(invalid("is missing fields"));
        }

        let mut related_addr = None;
        let mut related_port = None;
        let mut extras = parts[8..].chunks(2);
        while let Some(&[key, value]) = extras.next() {
            match key {
                "raddr" => related_addr = Some(value.to_string()),
                "rport" => related_port = Some(value.parse().map_err(|_| invalid("has bad rport"))?),
                _ => {}
            }
        }

        Ok(IceCandidate {
            foundation: parts[0].to_string(),
            component: parts[1].parse().map_err(|_| invalid("has bad component"))?,
            transport: parts[2].to_ascii_lowercase(),
            priority: parts[3].parse().map_err(|_| invalid("has bad priority"))?,
            address: parts[4].to_string(),
            port: parts[5].parse().map_err(|_| invalid("has bad port"))?,
            kind: parts[7].parse()?,
            related: related_addr.zip(related_port),
        })
    }
}

impl fmt::Display for IceCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "candidate:{} {} {} {} {} {} typ {}",
            self.foundation,
            self.component,
            self.transport,
            self.priority,
            self.address,
            self.port,
            self.kind.as_str()
        )?;
        if let Some((addr, port)) = &self.related {
            write!(f, " raddr {} rport {}", addr, port)?;
        }
        Ok(())
    }
}
