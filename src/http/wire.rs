//! Raw HTTP/1.1 framing
//!
//! Serialization always writes `Host`, derived from the message URL (empty
//! when there is none), and `Content-Length` from the body; caller-supplied copies of those, and the
//! hop-by-hop connection headers, are never written.

use bytes::{BufMut, Bytes, BytesMut};
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, StatusCode};
use url::Url;

use super::message::{HttpMessage, HttpResponse};
use crate::error::{Result, TunnelError};

/// Headers recomputed or dropped on serialization
const FORBIDDEN_HEADERS: [&str; 5] = ["host", "content-length", "connection", "upgrade", "keep-alive"];

const HEADER_END: &[u8] = b"\r\n\r\n";

/// Serialize a request or response to HTTP/1.1 bytes
pub fn serialize_http<M: HttpMessage + ?Sized>(message: &M) -> Bytes {
    let body = message.body();
    let mut out = BytesMut::with_capacity(256 + body.len());

    put_line(&mut out, message.start_line().as_bytes());
    let host = message.url().and_then(host_header).unwrap_or_default();
    put_header(&mut out, "Host", host.as_bytes());
    put_header(&mut out, "Content-Length", body.len().to_string().as_bytes());

    for (name, value) in message.headers() {
        if FORBIDDEN_HEADERS.contains(&name.as_str()) {
            continue;
        }
        put_header(&mut out, &capitalize(name.as_str()), value.as_bytes());
    }

    out.put_slice(b"\r\n");
    out.put_slice(body);
    out.freeze()
}

/// Parse raw HTTP/1.1 response bytes.
///
/// Without a blank line the whole input is treated as header. The status line
/// must be exactly three space-separated tokens; header lines without `": "`
/// or with an unusable name or value are skipped.
pub fn parse_http_response(raw: &[u8]) -> Result<HttpResponse> {
    let (head, body) = match find(raw, HEADER_END) {
        Some(at) => (&raw[..at], &raw[at + HEADER_END.len()..]),
        None => (raw, &raw[raw.len()..]),
    };
    let head = String::from_utf8_lossy(head);
    let mut lines = head.split("\r\n");

    let status_line = lines.next().unwrap_or_default();
    let tokens: Vec<&str> = status_line.split(' ').collect();
    let &[version, status, reason] = tokens.as_slice() else {
        return Err(TunnelError::Format(format!("malformed status line {:?}", status_line)));
    };
    let status = status
        .parse::<u16>()
        .ok()
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(|| TunnelError::Format(format!("invalid status code {:?}", status)))?;

    let mut headers = HeaderMap::new();
    for line in lines {
        let Some((name, value)) = line.split_once(": ") else {
            continue;
        };
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.append(name, value);
        }
    }

    Ok(HttpResponse {
        version: version.to_string(),
        status,
        status_text: reason.to_string(),
        headers,
        body: Bytes::copy_from_slice(body),
        url: None,
    })
}

/// `host[:port]`, port only when it is not the scheme default
fn host_header(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

/// Upper-case the first letter of every dash-separated segment
fn capitalize(name: &str) -> String {
    name.split('-')
        .map(|segment| {
            let mut chars = segment.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

fn put_line(out: &mut BytesMut, line: &[u8]) {
    out.put_slice(line);
    out.put_slice(b"\r\n");
}

fn put_header(out: &mut BytesMut, name: &str, value: &[u8]) {
    out.put_slice(name.as_bytes());
    out.put_slice(b": ");
    put_line(out, value);
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}
