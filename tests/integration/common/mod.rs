//! In-process relay used by the integration tests
//!
//! Interprets the commands smuggled in the TURN username the way the real
//! relay does and answers through a relay candidate.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use turnx::ice::{CandidateStream, GatherEvent, GatherRequest, Gatherer, IceCandidate};
use turnx::protocol::{encode_relay_reply, Command, USERNAME_PREFIX};
use turnx::tunnel::ZlibCodec;
use turnx::{Result, TunnelError};

type Handler = Box<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

#[derive(Default)]
struct Session {
    request: Vec<u8>,
    response: Vec<u8>,
}

/// Shared state, inspected by tests after a call
#[derive(Default)]
pub struct RelayState {
    sessions: Mutex<HashMap<Vec<u8>, Session>>,
    next_id: AtomicUsize,
    /// Negotiations currently open
    pub live: AtomicUsize,
    /// Most negotiations open at once
    pub peak: AtomicUsize,
    /// Every negotiation started
    pub total: AtomicUsize,
    /// Upload offsets in arrival order
    pub chunk_offsets: Mutex<Vec<usize>>,
    /// Server addresses negotiations were started against
    pub servers: Mutex<Vec<String>>,
    /// Decompressed requests seen by `e`
    pub requests: Mutex<Vec<Vec<u8>>>,
}

/// Mock relay implementing the negotiation seam
pub struct MockRelay {
    pub state: Arc<RelayState>,
    handler: Handler,
    codec: ZlibCodec,
    /// Replace the `e` reply with these bytes
    pub execute_reply: Option<Vec<u8>>,
    /// Never finish negotiations for this operation letter
    pub hang_on: Option<char>,
    /// Forget sessions right after creating them
    pub forgetful: bool,
    /// Delay before answering, so pokes of a wave overlap
    pub latency: Duration,
}

impl MockRelay {
    pub fn new(handler: impl Fn(&[u8]) -> Vec<u8> + Send + Sync + 'static) -> Self {
        Self {
            state: Arc::new(RelayState::default()),
            handler: Box::new(handler),
            codec: ZlibCodec::default(),
            execute_reply: None,
            hang_on: None,
            forgetful: false,
            latency: Duration::from_millis(2),
        }
    }

    /// Run one command against the session table; `None` means no reply
    fn handle(&self, command: &Command) -> Option<Vec<u8>> {
        let mut sessions = self.state.sessions.lock().unwrap();
        match command {
            Command::Start { len } => {
                let n = self.state.next_id.fetch_add(1, Ordering::SeqCst);
                let id = format!("session{:09}", n).into_bytes();
                if !self.forgetful {
                    sessions.insert(
                        id.clone(),
                        Session {
                            request: vec![0; *len],
                            response: Vec::new(),
                        },
                    );
                }
                Some(id)
            }
            Command::Chunk {
                session,
                offset,
                data,
            } => {
                self.state.chunk_offsets.lock().unwrap().push(*offset);
                let entry = sessions.get_mut(session.as_bytes())?;
                let end = offset.checked_add(data.len())?;
                entry.request.get_mut(*offset..end)?.copy_from_slice(data);
                Some(session.as_bytes().to_vec())
            }
            Command::Execute { session } => {
                let entry = sessions.get_mut(session.as_bytes())?;
                let request = self.codec.decompress(&entry.request).ok()?;
                self.state.requests.lock().unwrap().push(request.clone());
                entry.response = self.codec.compress(&(self.handler)(&request)).ok()?;
                let len = entry.response.len() as u32;
                Some(
                    self.execute_reply
                        .clone()
                        .unwrap_or_else(|| len.to_be_bytes().to_vec()),
                )
            }
            Command::Retrieve { session, offset } => {
                let entry = sessions.get(session.as_bytes())?;
                let rest = entry.response.get(*offset..)?;
                Some(rest[..rest.len().min(16)].to_vec())
            }
        }
    }
}

/// Decrements `live` when the negotiation context goes away
struct Negotiation {
    state: Arc<RelayState>,
    task: JoinHandle<()>,
}

impl Drop for Negotiation {
    fn drop(&mut self) {
        self.task.abort();
        self.state.live.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Gatherer for MockRelay {
    async fn gather(&self, request: GatherRequest) -> Result<CandidateStream> {
        assert_eq!(request.credential, "turnrpc");
        let text = request
            .username
            .strip_prefix(USERNAME_PREFIX)
            .ok_or_else(|| TunnelError::Protocol("missing prefix".to_string()))?;
        let command = Command::parse(text)?;

        let state = &self.state;
        state.servers.lock().unwrap().push(request.server.clone());
        state.total.fetch_add(1, Ordering::SeqCst);
        let live = state.live.fetch_add(1, Ordering::SeqCst) + 1;
        state.peak.fetch_max(live, Ordering::SeqCst);

        let hang = self.hang_on == Some(command.op());
        let reply = if hang { None } else { self.handle(&command) };
        let latency = self.latency;

        let (tx, rx) = mpsc::channel(4);
        let task = tokio::spawn(async move {
            tokio::time::sleep(latency).await;
            if hang {
                std::future::pending::<()>().await;
            }
            let noise = IceCandidate::relay("10.0.0.1".to_string(), 40000, None);
            let mut host = noise.clone();
            host.kind = turnx::ice::CandidateType::Host;
            let _ = tx.send(GatherEvent::Candidate(host)).await;
            if let Some(reply) = reply {
                let (address, port) = encode_relay_reply(&reply).unwrap();
                let _ = tx
                    .send(GatherEvent::Candidate(IceCandidate::relay(address, port, None)))
                    .await;
            }
            let _ = tx.send(GatherEvent::Complete).await;
        });

        Ok(CandidateStream::new(
            rx,
            Negotiation {
                state: self.state.clone(),
                task,
            },
        ))
    }
}

/// Deterministic incompressible bytes
pub fn noise(len: usize, seed: u32) -> Vec<u8> {
    let mut x = seed.wrapping_mul(2654435761).wrapping_add(1);
    (0..len)
        .map(|_| {
            x ^= x << 13;
            x ^= x >> 17;
            x ^= x << 5;
            (x >> 24) as u8
        })
        .collect()
}
