//! turnx:// fetch integration tests against an in-process relay

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use common::MockRelay;
use http::{Method, StatusCode};
use turnx::http::{HttpRequest, TunnelFetch};
use turnx::tunnel::{RpcOptions, TunnelRpc};
use turnx::TunnelError;

const OK_RESPONSE: &[u8] =
    b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 5\r\nX-Relay: mock\r\n\r\nhello";

fn fetcher(relay: &Arc<MockRelay>) -> TunnelFetch {
    TunnelFetch::new(TunnelRpc::new(relay.clone(), RpcOptions::default()))
}

#[tokio::test]
async fn test_get_through_tunnel() {
    let relay = Arc::new(MockRelay::new(|_| OK_RESPONSE.to_vec()));

    let response = fetcher(&relay)
        .get("turnx://relay.test:3478/hello?x=1")
        .await
        .unwrap();

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.status_text, "OK");
    assert_eq!(response.text(), "hello");
    assert_eq!(response.header("x-relay"), Some("mock"));
    assert_eq!(
        response.url.as_ref().map(|u| u.as_str()),
        Some("http://relay.test:3478/hello?x=1")
    );

    let requests = relay.state.requests.lock().unwrap();
    let sent = String::from_utf8(requests[0].clone()).unwrap();
    assert!(sent.starts_with("GET http://relay.test:3478/hello?x=1 HTTP/1.1\r\n"));
    assert!(sent.contains("\r\nHost: relay.test:3478\r\n"));
    assert!(sent.contains("\r\nContent-Length: 0\r\n"));
    assert!(relay
        .state
        .servers
        .lock()
        .unwrap()
        .iter()
        .all(|server| server == "relay.test:3478"));
}

#[tokio::test]
async fn test_post_headers_and_body() {
    let relay = Arc::new(MockRelay::new(|_| OK_RESPONSE.to_vec()));

    let mut request = HttpRequest::get("turnx://relay.test/submit")
        .unwrap()
        .header("Connection", "keep-alive")
        .unwrap()
        .header("x-custom", "v")
        .unwrap()
        .with_body("a=1&b=2");
    request.method = Method::POST;
    fetcher(&relay).fetch(request).await.unwrap();

    let requests = relay.state.requests.lock().unwrap();
    let sent = String::from_utf8(requests[0].clone()).unwrap();
    assert!(sent.starts_with("POST http://relay.test/submit HTTP/1.1\r\n"));
    assert!(sent.contains("\r\nHost: relay.test\r\n"));
    assert!(sent.contains("\r\nContent-Length: 7\r\n"));
    assert!(sent.contains("\r\nX-Custom: v\r\n"));
    assert!(!sent.contains("Connection"));
    assert!(sent.ends_with("\r\n\r\na=1&b=2"));
    assert_eq!(relay.state.servers.lock().unwrap()[0], "relay.test");
}

#[tokio::test]
async fn test_wrong_scheme_rejected() {
    let relay = Arc::new(MockRelay::new(|_| OK_RESPONSE.to_vec()));

    let err = fetcher(&relay)
        .get("http://relay.test/")
        .await
        .unwrap_err();

    assert!(matches!(err, TunnelError::Protocol(_)), "got {:?}", err);
    assert_eq!(relay.state.total.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_multi_word_reason_is_format_error() {
    let relay = Arc::new(MockRelay::new(|_| {
        b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n".to_vec()
    }));

    let err = fetcher(&relay)
        .get("turnx://relay.test/missing")
        .await
        .unwrap_err();

    assert!(matches!(err, TunnelError::Format(_)), "got {:?}", err);
}

#[tokio::test]
async fn test_loopback_target_still_fetched() {
    let relay = Arc::new(MockRelay::new(|_| OK_RESPONSE.to_vec()));

    let response = fetcher(&relay)
        .get("turnx://127.0.0.1:3478/")
        .await
        .unwrap();

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(relay.state.servers.lock().unwrap()[0], "127.0.0.1:3478");
}
