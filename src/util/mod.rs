//! Utility modules

mod ipv6;
mod tracing_setup;

pub use ipv6::{decode_ipv6, encode_ipv6};
pub use tracing_setup::init_tracing;
