//! TurnX - request/response tunnel through TURN relay negotiation
//!
//! Commands ride out in the TURN Allocate username; replies come back in the
//! relayed address of the relay candidate. On top of that single round trip
//! the library builds a chunked, compressed RPC and an HTTP client for
//! `turnx://` URLs.

pub mod companion;
pub mod config;
pub mod error;
pub mod http;
pub mod ice;
pub mod protocol;
pub mod tunnel;
pub mod util;

pub use config::Config;
pub use error::{Result, TunnelError};
pub use crate::http::{HttpRequest, HttpResponse, TunnelFetch};
pub use ice::{Gatherer, TurnGatherer};
pub use tunnel::{Poker, RpcOptions, TunnelRpc};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
