//! HTTP over the tunnel
//!
//! - `message`: request/response values
//! - `wire`: raw HTTP/1.1 serialization and response parsing
//! - `fetch`: `turnx://` entry point driving the tunnel RPC

mod fetch;
mod message;
mod wire;

pub use fetch::{TunnelFetch, TUNNEL_SCHEME};
pub use message::{HttpMessage, HttpRequest, HttpResponse};
pub use wire::{parse_http_response, serialize_http};
