//! Covert round-trip primitive
//!
//! A poke starts one relay-only negotiation whose username carries a command
//! and reads the reply out of the relay candidate the server hands back.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::error::{Result, TunnelError};
use crate::ice::{GatherEvent, GatherRequest, Gatherer, IceCandidate};
use crate::protocol::{decode_relay_reply, Command, CREDENTIAL, USERNAME_PREFIX};

/// Issues pokes through a negotiation engine
#[derive(Clone)]
pub struct Poker {
    gatherer: Arc<dyn Gatherer>,
    timeout: Option<Duration>,
}

impl Poker {
    /// `timeout` bounds each poke; `None` waits for gathering to complete
    pub fn new(gatherer: Arc<dyn Gatherer>, timeout: Option<Duration>) -> Self {
        Self { gatherer, timeout }
    }

    /// Send one command and return its reply
    pub async fn send(&self, server: &str, command: &Command) -> Result<Bytes> {
        self.poke(server, &command.to_string()).await
    }

    /// Send raw command text (without the `turnrpc:` prefix)
    pub async fn poke(&self, server: &str, command: &str) -> Result<Bytes> {
        let request = GatherRequest {
            server: server.to_string(),
            username: format!("{}{}", USERNAME_PREFIX, command),
            credential: CREDENTIAL.to_string(),
        };
        trace!(server, command, "poke");

        let exchange = self.exchange(request);
        let reply = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, exchange)
                .await
                .unwrap_or_else(|_| Err(TunnelError::Timeout(limit))),
            None => exchange.await,
        };

        let op = command.split(':').next().unwrap_or_default();
        match &reply {
            Ok(bytes) => debug!(server, op, len = bytes.len(), "poke answered"),
            Err(e) => debug!(server, op, error = %e, "poke failed"),
        }
        reply
    }

    /// Runs one negotiation to completion; the candidate stream (and with it
    /// the negotiation) is dropped on return or when this future is dropped
    async fn exchange(&self, request: GatherRequest) -> Result<Bytes> {
        let mut stream = self.gatherer.gather(request.clone()).await?;
        let mut reply = None;

        while let Some(event) = stream.next().await {
            match event {
                GatherEvent::Candidate(candidate) => {
                    if let Some(bytes) = relay_reply(&candidate) {
                        reply = Some(bytes);
                    }
                }
                GatherEvent::Complete => break,
            }
        }

        reply.ok_or_else(|| {
            TunnelError::no_reply(&request.server, "gathering completed without a relay candidate")
        })
    }
}

impl std::fmt::Debug for Poker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poker")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Reply carried by a relay candidate, if it carries a usable one
fn relay_reply(candidate: &IceCandidate) -> Option<Bytes> {
    if !candidate.is_relay() {
        return None;
    }
    match decode_relay_reply(&candidate.address, candidate.port) {
        Ok(Some(bytes)) => Some(bytes),
        Ok(None) => {
            trace!(port = candidate.port, "relay candidate length out of range, ignored");
            None
        }
        Err(e) => {
            trace!(address = %candidate.address, error = %e, "relay candidate address unreadable, ignored");
            None
        }
    }
}
