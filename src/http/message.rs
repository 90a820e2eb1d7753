//! HTTP message values carried through the tunnel

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method, StatusCode};
use url::Url;

use crate::error::{Result, TunnelError};

/// What the wire codec needs from a request or a response
pub trait HttpMessage {
    /// First line, without the line terminator
    fn start_line(&self) -> String;
    /// Target URL, source of the `Host` header
    fn url(&self) -> Option<&Url>;
    fn headers(&self) -> &HeaderMap;
    fn body(&self) -> &[u8];
}

/// Outgoing request
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// GET request for `url`
    pub fn get(url: &str) -> Result<Self> {
        let url = Url::parse(url).map_err(|e| TunnelError::Format(format!("invalid URL {:?}: {}", url, e)))?;
        Ok(Self::new(Method::GET, url))
    }

    /// Append a header
    pub fn header(mut self, name: &str, value: &str) -> Result<Self> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| TunnelError::Format(format!("invalid header name {:?}", name)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| TunnelError::Format(format!("invalid value for header {}", name)))?;
        self.headers.append(name, value);
        Ok(self)
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }
}

impl HttpMessage for HttpRequest {
    fn start_line(&self) -> String {
        format!("{} {} HTTP/1.1", self.method, self.url)
    }

    fn url(&self) -> Option<&Url> {
        Some(&self.url)
    }

    fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    fn body(&self) -> &[u8] {
        &self.body
    }
}

/// Incoming response
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// Protocol token of the status line, e.g. `HTTP/1.1`
    pub version: String,
    pub status: StatusCode,
    /// Reason phrase exactly as received
    pub status_text: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// URL the response answers, when known
    pub url: Option<Url>,
}

impl HttpResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            version: "HTTP/1.1".to_string(),
            status,
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            url: None,
        }
    }

    /// Body decoded as UTF-8, invalid sequences replaced
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Value of header `name` if present and textual
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

impl HttpMessage for HttpResponse {
    fn start_line(&self) -> String {
        format!("{} {} {}", self.version, self.status.as_u16(), self.status_text)
    }

    fn url(&self) -> Option<&Url> {
        self.url.as_ref()
    }

    fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    fn body(&self) -> &[u8] {
        &self.body
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder() {
        let request = HttpRequest::get("http://example.com/a?b=1")
            .unwrap()
            .header("X-Custom", "v")
            .unwrap()
            .with_body("hello");
        assert_eq!(request.start_line(), "GET http://example.com/a?b=1 HTTP/1.1");
        assert_eq!(request.headers.get("x-custom").unwrap(), "v");
        assert_eq!(request.body(), b"hello");

        assert!(HttpRequest::get("not a url").is_err());
        assert!(HttpRequest::get("http://example.com/")
            .unwrap()
            .header("bad name", "v")
            .is_err());
    }

    #[test]
    fn test_response_start_line() {
        let response = HttpResponse::new(StatusCode::OK);
        assert_eq!(response.start_line(), "HTTP/1.1 200 OK");
        assert!(response.url().is_none());
    }
}
