//! `turnx://` fetch entry point
//!
//! `turnx://relay.example:3478/path` sends `GET http://relay.example:3478/path`
//! through the TURN server at `relay.example:3478`; the relay forwards it to
//! its configured target and the parsed reply comes back.

use tracing::{debug, warn};
use url::{Host, Url};

use super::message::{HttpRequest, HttpResponse};
use super::wire::{parse_http_response, serialize_http};
use crate::error::{Result, TunnelError};
use crate::tunnel::TunnelRpc;

/// URL scheme routed through the tunnel
pub const TUNNEL_SCHEME: &str = "turnx";

/// HTTP client whose transport is the tunnel RPC
#[derive(Debug, Clone)]
pub struct TunnelFetch {
    rpc: TunnelRpc,
}

impl TunnelFetch {
    pub fn new(rpc: TunnelRpc) -> Self {
        Self { rpc }
    }

    /// Send `request` (a `turnx://` URL) and return the relay's response
    pub async fn fetch(&self, request: HttpRequest) -> Result<HttpResponse> {
        if request.url.scheme() != TUNNEL_SCHEME {
            return Err(TunnelError::Protocol(format!(
                "unsupported scheme {:?}, expected {}://",
                request.url.scheme(),
                TUNNEL_SCHEME
            )));
        }

        let server = server_address(&request.url)?;
        let url = plain_http_url(&request.url)?;
        if is_loopback(&url) {
            warn!(url = %url, "loopback target; relay candidates may not be gathered over loopback");
        }

        let request = HttpRequest { url, ..request };
        debug!(server = %server, method = %request.method, url = %request.url, "fetch");

        let raw = self.rpc.call(&server, &serialize_http(&request)).await?;
        let mut response = parse_http_response(&raw)?;
        response.url = Some(request.url);
        Ok(response)
    }

    /// GET `url`
    pub async fn get(&self, url: &str) -> Result<HttpResponse> {
        self.fetch(HttpRequest::get(url)?).await
    }
}

/// `host[:port]` of the tunnel URL, used as the TURN server address
fn server_address(url: &Url) -> Result<String> {
    let host = url
        .host_str()
        .filter(|host| !host.is_empty())
        .ok_or_else(|| TunnelError::Protocol(format!("{} has no host", url)))?;
    Ok(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

/// Same URL under `http://`.
///
/// `Url::set_scheme` refuses to move between special and non-special
/// schemes, so the text is rewritten and parsed again.
fn plain_http_url(url: &Url) -> Result<Url> {
    let rest = &url.as_str()[url.scheme().len()..];
    let text = format!("http{}", rest);
    Url::parse(&text).map_err(|e| TunnelError::Format(format!("cannot rewrite {} as http: {}", url, e)))
}

fn is_loopback(url: &Url) -> bool {
    match url.host() {
        Some(Host::Domain(domain)) => domain.eq_ignore_ascii_case("localhost"),
        Some(Host::Ipv4(addr)) => addr.is_loopback(),
        Some(Host::Ipv6(addr)) => addr.is_loopback(),
        None => false,
    }
}
