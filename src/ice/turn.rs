//! Relay-only gatherer speaking TURN (RFC 5766) over UDP
//!
//! Runs the Allocate exchange a browser performs when it gathers relay
//! candidates: an unauthenticated probe, the 401 challenge, then an
//! authenticated Allocate using the long-term credential. The relayed address
//! of a successful allocation becomes the single `relay` candidate.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use md5::{Digest, Md5};
use ring::hmac;
use ring::rand::{SecureRandom, SystemRandom};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace};

use super::{CandidateStream, GatherEvent, GatherRequest, Gatherer, IceCandidate, DEFAULT_TURN_PORT};
use crate::error::{Result, TunnelError};
use crate::util::encode_ipv6;

const MAGIC_COOKIE: u32 = 0x2112A442;
const STUN_HEADER_SIZE: usize = 20;
const FINGERPRINT_XOR: u32 = 0x5354554e;
const TRANSPORT_UDP: u8 = 17;

const ALLOCATE_REQUEST: u16 = 0x0003;
const REFRESH_REQUEST: u16 = 0x0004;

const ATTR_USERNAME: u16 = 0x0006;
const ATTR_MESSAGE_INTEGRITY: u16 = 0x0008;
const ATTR_ERROR_CODE: u16 = 0x0009;
const ATTR_LIFETIME: u16 = 0x000D;
const ATTR_REALM: u16 = 0x0014;
const ATTR_NONCE: u16 = 0x0015;
const ATTR_XOR_RELAYED_ADDRESS: u16 = 0x0016;
const ATTR_REQUESTED_TRANSPORT: u16 = 0x0019;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const ATTR_FINGERPRINT: u16 = 0x8028;

/// Error responses tolerated while refreshing the nonce
const STALE_NONCE_ATTEMPTS: usize = 2;

/// TURN client that reports the relayed address of one allocation
#[derive(Debug)]
pub struct TurnGatherer {
    /// Initial retransmission timeout, doubled on every resend
    rto: Duration,
    /// Sends per transaction before giving up
    attempts: u32,
    rng: SystemRandom,
}

impl TurnGatherer {
    pub fn new() -> Self {
        Self::with_retransmit(Duration::from_millis(500), 5)
    }

    /// Gatherer with a custom retransmission schedule
    pub fn with_retransmit(rto: Duration, attempts: u32) -> Self {
        Self {
            rto,
            attempts: attempts.max(1),
            rng: SystemRandom::new(),
        }
    }
}

impl Default for TurnGatherer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Gatherer for TurnGatherer {
    async fn gather(&self, request: GatherRequest) -> Result<CandidateStream> {
        let server = resolve(&request.server).await?;
        let bind = if server.is_ipv4() {
            SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0)
        } else {
            SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 0)
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(server).await?;
        trace!(server = %server, local = ?socket.local_addr().ok(), "TURN socket ready");

        let client = TurnClient {
            socket,
            rto: self.rto,
            attempts: self.attempts,
            rng: self.rng.clone(),
        };
        let (tx, rx) = mpsc::channel(4);
        let task = tokio::spawn(client.run(request, tx));
        Ok(CandidateStream::spawned(rx, task))
    }
}

/// Resolve `host`, `host:port`, `v6` or `[v6]:port`, defaulting the port
async fn resolve(server: &str) -> Result<SocketAddr> {
    let unreachable = |reason: String| TunnelError::no_reply(server, reason);

    if let Ok(addr) = server.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = server.trim_matches(|c| c == '[' || c == ']').parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, DEFAULT_TURN_PORT));
    }

    let has_port = server
        .rsplit_once(':')
        .is_some_and(|(_, port)| port.parse::<u16>().is_ok());
    let target = if has_port {
        server.to_string()
    } else {
        format!("{}:{}", server, DEFAULT_TURN_PORT)
    };

    let resolved = tokio::net::lookup_host(target.as_str())
        .await
        .map_err(|e| unreachable(format!("cannot resolve: {}", e)))?
        .next()
        .ok_or_else(|| unreachable("resolved to no addresses".to_string()));
    resolved
}

/// Long-term credential state of a granted allocation
struct Allocation {
    relayed: SocketAddr,
    mapped: Option<SocketAddr>,
    auth: Option<Credentials>,
}

struct Credentials {
    realm: String,
    nonce: String,
    key: Vec<u8>,
}

struct Auth<'a> {
    username: &'a str,
    realm: &'a str,
    nonce: &'a str,
    key: &'a [u8],
}

/// Response to one of our transactions
#[derive(Debug, PartialEq, Eq)]
enum StunReply {
    Success {
        relayed: Option<SocketAddr>,
        mapped: Option<SocketAddr>,
    },
    Error {
        code: u16,
        reason: String,
        realm: Option<String>,
        nonce: Option<String>,
    },
}

struct TurnClient {
    socket: UdpSocket,
    rto: Duration,
    attempts: u32,
    rng: SystemRandom,
}

impl TurnClient {
    async fn run(self, request: GatherRequest, events: mpsc::Sender<GatherEvent>) {
        match self.allocate(&request).await {
            Ok(allocation) => {
                debug!(server = %request.server, relay = %allocation.relayed, "TURN allocation granted");
                let candidate = relay_candidate(&allocation);
                if events.send(GatherEvent::Candidate(candidate)).await.is_err() {
                    return;
                }
                if let Err(e) = self.release(&request, &allocation).await {
                    trace!(error = %e, "TURN release not sent");
                }
            }
            Err(e) => {
                debug!(server = %request.server, error = %e, "TURN allocation failed");
            }
        }
        let _ = events.send(GatherEvent::Complete).await;
    }

    async fn allocate(&self, request: &GatherRequest) -> Result<Allocation> {
        let txn = self.transaction_id()?;
        let probe = allocate_message(&txn).finish(None);
        let (realm, mut nonce) = match self.transact(&probe, &txn).await? {
            StunReply::Success {
                relayed: Some(relayed),
                mapped,
            } => {
                return Ok(Allocation {
                    relayed,
                    mapped,
                    auth: None,
                })
            }
            StunReply::Error {
                code: 401,
                realm: Some(realm),
                nonce: Some(nonce),
                ..
            } => (realm, nonce),
            other => return Err(rejected(other)),
        };

        let key = long_term_key(&request.username, &realm, &request.credential);
        for _ in 0..STALE_NONCE_ATTEMPTS {
            let txn = self.transaction_id()?;
            let auth = Auth {
                username: &request.username,
                realm: &realm,
                nonce: &nonce,
                key: &key,
            };
            let message = allocate_message(&txn).finish(Some(&auth));
            match self.transact(&message, &txn).await? {
                StunReply::Success {
                    relayed: Some(relayed),
                    mapped,
                } => {
                    return Ok(Allocation {
                        relayed,
                        mapped,
                        auth: Some(Credentials { realm, nonce, key }),
                    })
                }
                StunReply::Error {
                    code: 438,
                    nonce: Some(fresh),
                    ..
                } => nonce = fresh,
                other => return Err(rejected(other)),
            }
        }
        Err(TunnelError::Protocol("allocate kept failing with stale nonce".to_string()))
    }

    /// Send a zero-lifetime Refresh without waiting for the answer
    async fn release(&self, request: &GatherRequest, allocation: &Allocation) -> Result<()> {
        let txn = self.transaction_id()?;
        let message = MessageBuilder::new(REFRESH_REQUEST, &txn).attr(ATTR_LIFETIME, &0u32.to_be_bytes());
        let message = match &allocation.auth {
            Some(creds) => message.finish(Some(&Auth {
                username: &request.username,
                realm: &creds.realm,
                nonce: &creds.nonce,
                key: &creds.key,
            })),
            None => message.finish(None),
        };
        self.socket.send(&message).await?;
        Ok(())
    }

    /// One request/response exchange with retransmission
    async fn transact(&self, message: &[u8], txn: &[u8; 12]) -> Result<StunReply> {
        let mut buf = vec![0u8; 2048];
        let mut rto = self.rto;

        for attempt in 0..self.attempts {
            self.socket.send(message).await?;
            trace!(attempt, len = message.len(), "STUN request sent");

            let deadline = Instant::now() + rto;
            while let Ok(received) = timeout_at(deadline, self.socket.recv(&mut buf)).await {
                let n = received?;
                if let Some(reply) = parse_reply(&buf[..n], txn) {
                    return Ok(reply);
                }
            }
            rto *= 2;
        }

        Err(TunnelError::Protocol(format!(
            "no STUN response after {} attempts",
            self.attempts
        )))
    }

    fn transaction_id(&self) -> Result<[u8; 12]> {
        let mut txn = [0u8; 12];
        self.rng
            .fill(&mut txn)
            .map_err(|_| std::io::Error::other("system random source failed"))?;
        Ok(txn)
    }
}

fn rejected(reply: StunReply) -> TunnelError {
    match reply {
        StunReply::Error { code, reason, .. } => {
            TunnelError::Protocol(format!("allocate rejected: {} {}", code, reason))
        }
        StunReply::Success { .. } => {
            TunnelError::Protocol("allocate response without XOR-RELAYED-ADDRESS".to_string())
        }
    }
}

fn relay_candidate(allocation: &Allocation) -> IceCandidate {
    let related = allocation.mapped.map(|addr| (address_text(addr.ip()), addr.port()));
    IceCandidate::relay(
        address_text(allocation.relayed.ip()),
        allocation.relayed.port(),
        related,
    )
}

/// Candidate address text; IPv6 always in plain hex groups
fn address_text(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => encode_ipv6(&v6.octets()),
    }
}

fn allocate_message(txn: &[u8; 12]) -> MessageBuilder {
    MessageBuilder::new(ALLOCATE_REQUEST, txn)
        .attr(ATTR_REQUESTED_TRANSPORT, &[TRANSPORT_UDP, 0, 0, 0])
}

/// MD5(username:realm:password)
fn long_term_key(username: &str, realm: &str, password: &str) -> Vec<u8> {
    Md5::digest(format!("{}:{}:{}", username, realm, password).as_bytes()).to_vec()
}

struct MessageBuilder {
    buf: Vec<u8>,
}

impl MessageBuilder {
    fn new(msg_type: u16, txn: &[u8; 12]) -> Self {
        let mut buf = Vec::with_capacity(STUN_HEADER_SIZE + 128);
        buf.extend_from_slice(&msg_type.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        buf.extend_from_slice(txn);
        Self { buf }
    }

    fn attr(mut self, attr_type: u16, value: &[u8]) -> Self {
        self.buf.extend_from_slice(&attr_type.to_be_bytes());
        self.buf.extend_from_slice(&(value.len() as u16).to_be_bytes());
        self.buf.extend_from_slice(value);
        let padding = (4 - value.len() % 4) % 4;
        self.buf.extend(std::iter::repeat(0).take(padding));
        self.set_length(0);
        self
    }

    /// Write the header length as if `extra` more attribute bytes followed
    fn set_length(&mut self, extra: usize) {
        let len = (self.buf.len() - STUN_HEADER_SIZE + extra) as u16;
        self.buf[2..4].copy_from_slice(&len.to_be_bytes());
    }

    /// Append credentials and MESSAGE-INTEGRITY when given, then FINGERPRINT
    fn finish(mut self, auth: Option<&Auth<'_>>) -> Vec<u8> {
        if let Some(auth) = auth {
            self = self
                .attr(ATTR_USERNAME, auth.username.as_bytes())
                .attr(ATTR_REALM, auth.realm.as_bytes())
                .attr(ATTR_NONCE, auth.nonce.as_bytes());
            self.set_length(24);
            let key = hmac::Key::new(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, auth.key);
            let tag = hmac::sign(&key, &self.buf);
            self = self.attr(ATTR_MESSAGE_INTEGRITY, tag.as_ref());
        }

        self.set_length(8);
        let fingerprint = crc32fast::hash(&self.buf) ^ FINGERPRINT_XOR;
        self.attr(ATTR_FINGERPRINT, &fingerprint.to_be_bytes()).buf
    }
}

/// Walk the TLV attributes following the header
fn iter_attrs(data: &[u8], mut f: impl FnMut(u16, &[u8])) {
    let mut pos = STUN_HEADER_SIZE;
    while pos + 4 <= data.len() {
        let attr_type = u16::from_be_bytes([data[pos], data[pos + 1]]);
        let attr_len = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
        let start = pos + 4;
        let Some(value) = data.get(start..start + attr_len) else {
            break;
        };
        f(attr_type, value);
        pos = start + attr_len.div_ceil(4) * 4;
    }
}

/// Parse a response to transaction `txn`; anything else yields `None`
fn parse_reply(data: &[u8], txn: &[u8; 12]) -> Option<StunReply> {
    if data.len() < STUN_HEADER_SIZE
        || data[4..8] != MAGIC_COOKIE.to_be_bytes()
        || data[8..20] != txn[..]
    {
        return None;
    }
    let msg_type = u16::from_be_bytes([data[0], data[1]]);
    let declared = u16::from_be_bytes([data[2], data[3]]) as usize;
    let data = data.get(..STUN_HEADER_SIZE + declared)?;

    match msg_type & 0x0110 {
        0x0100 => {
            let mut relayed = None;
            let mut mapped = None;
            iter_attrs(data, |attr_type, value| match attr_type {
                ATTR_XOR_RELAYED_ADDRESS => relayed = decode_xor_address(value, txn),
                ATTR_XOR_MAPPED_ADDRESS => mapped = decode_xor_address(value, txn),
                _ => {}
            });
            Some(StunReply::Success { relayed, mapped })
        }
        0x0110 => {
            let mut code = 0;
            let mut reason = String::new();
            let mut realm = None;
            let mut nonce = None;
            iter_attrs(data, |attr_type, value| match attr_type {
                ATTR_ERROR_CODE if value.len() >= 4 => {
                    code = (value[2] & 0x07) as u16 * 100 + value[3] as u16;
                    reason = String::from_utf8_lossy(&value[4..]).into_owned();
                }
                ATTR_REALM => realm = Some(String::from_utf8_lossy(value).into_owned()),
                ATTR_NONCE => nonce = Some(String::from_utf8_lossy(value).into_owned()),
                _ => {}
            });
            Some(StunReply::Error {
                code,
                reason,
                realm,
                nonce,
            })
        }
        _ => None,
    }
}

fn xor_key(txn: &[u8; 12]) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    key[4..].copy_from_slice(txn);
    key
}

fn decode_xor_address(value: &[u8], txn: &[u8; 12]) -> Option<SocketAddr> {
    if value.len() < 4 {
        return None;
    }
    let port = u16::from_be_bytes([value[2], value[3]]) ^ (MAGIC_COOKIE >> 16) as u16;
    let key = xor_key(txn);

    match value[1] {
        0x01 if value.len() >= 8 => {
            let mut octets = [0u8; 4];
            for (i, octet) in octets.iter_mut().enumerate() {
                *octet = value[4 + i] ^ key[i];
            }
            Some(SocketAddr::new(IpAddr::from(octets), port))
        }
        0x02 if value.len() >= 20 => {
            let mut octets = [0u8; 16];
            for (i, octet) in octets.iter_mut().enumerate() {
                *octet = value[4 + i] ^ key[i];
            }
            Some(SocketAddr::new(IpAddr::from(octets), port))
        }
        _ => None,
    }
}

#[cfg(test)]
fn encode_xor_address(addr: SocketAddr, txn: &[u8; 12]) -> Vec<u8> {
    let key = xor_key(txn);
    let port = addr.port() ^ (MAGIC_COOKIE >> 16) as u16;
    let (family, octets): (u8, Vec<u8>) = match addr.ip() {
        IpAddr::V4(v4) => (0x01, v4.octets().to_vec()),
        IpAddr::V6(v6) => (0x02, v6.octets().to_vec()),
    };
    let mut value = vec![0, family];
    value.extend_from_slice(&port.to_be_bytes());
    value.extend(octets.iter().zip(key.iter()).map(|(b, k)| b ^ k));
    value
}
