//! Request/response RPC built from pokes
//!
//! One call is a sequence of pokes against a single server session:
//! 1. `s:<len>` allocates the session for the compressed request
//! 2. `c:<id>:<offset>:<data>` uploads 256-byte chunks, in waves
//! 3. `e:<id>` runs the request and returns the response length
//! 4. `r:<id>:<offset>` drains the response 16 bytes at a time, in waves
//!
//! Waves run strictly one after another; pokes inside a wave run concurrently.
//! The first failing poke fails the call and drops the rest of its wave.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::future::try_join_all;
use tracing::{debug, trace};

use super::{Poker, ZlibCodec};
use crate::error::{Result, TunnelError};
use crate::ice::Gatherer;
use crate::protocol::{
    chunk_offsets, decode_response_length, Command, SessionId, RETRIEVE_CHUNK_SIZE,
    UPLOAD_CHUNK_SIZE,
};

/// Concurrent pokes per wave unless configured otherwise
pub const DEFAULT_WAVE_WIDTH: usize = 32;

/// Tunables of the RPC orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpcOptions {
    /// Per-poke timeout; `None` waits for each negotiation to finish
    pub timeout: Option<Duration>,
    /// Pokes in flight per upload/retrieval wave
    pub wave_width: usize,
}

impl Default for RpcOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            wave_width: DEFAULT_WAVE_WIDTH,
        }
    }
}

/// Tunnel RPC client
#[derive(Debug, Clone)]
pub struct TunnelRpc {
    poker: Poker,
    codec: ZlibCodec,
    wave_width: usize,
}

impl TunnelRpc {
    /// Client using the shared preset dictionary
    pub fn new(gatherer: Arc<dyn Gatherer>, options: RpcOptions) -> Self {
        Self::with_codec(gatherer, options, ZlibCodec::default())
    }

    pub fn with_codec(gatherer: Arc<dyn Gatherer>, options: RpcOptions, codec: ZlibCodec) -> Self {
        Self {
            poker: Poker::new(gatherer, options.timeout),
            codec,
            wave_width: options.wave_width.max(1),
        }
    }

    /// Underlying single-poke primitive
    pub fn poker(&self) -> &Poker {
        &self.poker
    }

    /// Exchange `payload` with the server behind `server` and return its response
    pub async fn call(&self, server: &str, payload: &[u8]) -> Result<Bytes> {
        let started = Instant::now();
        let compressed = self.codec.compress(payload)?;

        let session = self
            .poker
            .send(server, &Command::Start { len: compressed.len() })
            .await
            .map(SessionId::new)?;
        debug!(server, session = %session, request_len = payload.len(), compressed_len = compressed.len(), "session started");

        self.upload(server, &session, &compressed).await?;

        let reply = self
            .poker
            .send(server, &Command::Execute { session: session.clone() })
            .await?;
        let response_len = decode_response_length(&reply)?;
        debug!(server, session = %session, response_len, "request executed");

        let mut response = vec![0u8; response_len];
        self.retrieve(server, &session, &mut response).await?;

        let body = self.codec.decompress(&response)?;
        debug!(
            server,
            session = %session,
            response_len = body.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "call complete"
        );
        Ok(Bytes::from(body))
    }

    /// Text form of [`call`](Self::call); the response is decoded lossily
    pub async fn call_text(&self, server: &str, payload: &str) -> Result<String> {
        let response = self.call(server, payload.as_bytes()).await?;
        Ok(String::from_utf8_lossy(&response).into_owned())
    }

    async fn upload(&self, server: &str, session: &SessionId, compressed: &[u8]) -> Result<()> {
        let chunks: Vec<(usize, &[u8])> = chunk_offsets(compressed.len(), UPLOAD_CHUNK_SIZE)
            .zip(compressed.chunks(UPLOAD_CHUNK_SIZE))
            .collect();

        for (wave, batch) in chunks.chunks(self.wave_width).enumerate() {
            trace!(wave, pokes = batch.len(), "upload wave");
            try_join_all(batch.iter().map(|&(offset, data)| {
                let command = Command::Chunk {
                    session: session.clone(),
                    offset,
                    data: Bytes::copy_from_slice(data),
                };
                async move { self.poker.send(server, &command).await }
            }))
            .await?;
        }
        Ok(())
    }

    async fn retrieve(&self, server: &str, session: &SessionId, response: &mut [u8]) -> Result<()> {
        let mut slots = chunk_offsets(response.len(), RETRIEVE_CHUNK_SIZE)
            .zip(response.chunks_mut(RETRIEVE_CHUNK_SIZE));

        let mut wave = 0usize;
        loop {
            let batch = next_wave(&mut slots, self.wave_width);
            if batch.is_empty() {
                break;
            }
            trace!(wave, pokes = batch.len(), "retrieve wave");

            try_join_all(batch.into_iter().map(|(offset, slot)| async move {
                let command = Command::Retrieve {
                    session: session.clone(),
                    offset,
                };
                let reply = self.poker.send(server, &command).await?;
                let room = slot.len();
                let dest = slot.get_mut(..reply.len()).ok_or_else(|| {
                    TunnelError::Protocol(format!(
                        "retrieve reply of {} bytes at offset {} overflows its {} byte slot",
                        reply.len(),
                        offset,
                        room
                    ))
                })?;
                dest.copy_from_slice(&reply);
                Ok::<_, TunnelError>(())
            }))
            .await?;
            wave += 1;
        }
        Ok(())
    }
}

/// Take the next `width` items; slots are only materialised one wave at a time
fn next_wave<I: Iterator>(items: &mut I, width: usize) -> Vec<I::Item> {
    items.by_ref().take(width).collect()
}
