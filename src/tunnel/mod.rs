//! Tunnel RPC over relay candidate negotiation
//!
//! - `poke`: one negotiation carrying one command, returning up to 16 reply bytes
//! - `codec`: zlib with the shared preset dictionary
//! - `rpc`: session start, chunked upload, execute, chunked retrieval

mod codec;
mod poke;
mod rpc;

pub use codec::{dictionary, ZlibCodec};
pub use poke::Poker;
pub use rpc::{RpcOptions, TunnelRpc, DEFAULT_WAVE_WIDTH};
