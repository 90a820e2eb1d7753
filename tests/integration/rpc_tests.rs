//! Tunnel RPC integration tests against an in-process relay

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::{noise, MockRelay};
use turnx::protocol::UPLOAD_CHUNK_SIZE;
use turnx::tunnel::{RpcOptions, TunnelRpc, ZlibCodec};
use turnx::TunnelError;

fn client(relay: &Arc<MockRelay>, options: RpcOptions) -> TunnelRpc {
    TunnelRpc::new(relay.clone(), options)
}

/// Text payload goes out and the relay's text reply comes back unchanged
#[tokio::test]
async fn test_ping_roundtrip() {
    let relay = Arc::new(MockRelay::new(|request| {
        assert_eq!(request, b"ping");
        b"pong".to_vec()
    }));

    let reply = client(&relay, RpcOptions::default())
        .call_text("relay.test:3478", "ping")
        .await
        .unwrap();

    assert_eq!(reply, "pong");
    assert_eq!(relay.state.live.load(Ordering::SeqCst), 0);
    assert!(relay
        .state
        .servers
        .lock()
        .unwrap()
        .iter()
        .all(|server| server == "relay.test:3478"));
}

/// Large request and response span several waves in both directions
#[tokio::test]
async fn test_large_payload_multiple_waves() {
    let request = noise(20_000, 1);
    let response = noise(3_000, 2);
    let expected = response.clone();
    let relay = Arc::new(MockRelay::new(move |_| response.clone()));

    let reply = client(&relay, RpcOptions::default())
        .call("relay.test:3478", &request)
        .await
        .unwrap();

    assert_eq!(&reply[..], &expected[..]);
    assert_eq!(relay.state.requests.lock().unwrap()[0], request);

    // chunks carry absolute offsets covering the compressed request
    let compressed_len = ZlibCodec::default().compress(&request).unwrap().len();
    let mut offsets = relay.state.chunk_offsets.lock().unwrap().clone();
    offsets.sort_unstable();
    let expected_offsets: Vec<usize> = (0..compressed_len).step_by(UPLOAD_CHUNK_SIZE).collect();
    assert_eq!(offsets, expected_offsets);
    assert!(offsets.len() > 32);

    let peak = relay.state.peak.load(Ordering::SeqCst);
    assert!(peak <= 32, "peak concurrency {}", peak);
    assert!(peak > 1, "pokes of a wave should overlap");
    assert_eq!(relay.state.live.load(Ordering::SeqCst), 0);
}

/// Wave width bounds the pokes in flight
#[tokio::test]
async fn test_wave_width_option() {
    let relay = Arc::new(MockRelay::new(|request| request.to_vec()));
    let options = RpcOptions {
        timeout: Some(Duration::from_secs(5)),
        wave_width: 4,
    };

    let request = noise(4_000, 3);
    let reply = client(&relay, options).call("relay.test", &request).await.unwrap();

    assert_eq!(&reply[..], &request[..]);
    assert!(relay.state.peak.load(Ordering::SeqCst) <= 4);
}

/// Empty response bodies survive the round trip
#[tokio::test]
async fn test_empty_payloads() {
    let relay = Arc::new(MockRelay::new(|request| {
        assert!(request.is_empty());
        Vec::new()
    }));
    let reply = client(&relay, RpcOptions::default())
        .call("relay.test", b"")
        .await
        .unwrap();
    assert!(reply.is_empty());
}

/// An execute reply that is not 4 bytes fails the call
#[tokio::test]
async fn test_short_execute_reply() {
    let mut relay = MockRelay::new(|_| b"pong".to_vec());
    relay.execute_reply = Some(vec![0, 0, 1]);
    let relay = Arc::new(relay);

    let err = client(&relay, RpcOptions::default())
        .call_text("relay.test", "ping")
        .await
        .unwrap_err();

    assert!(matches!(err, TunnelError::Protocol(_)), "got {:?}", err);
}

/// A poke that never sees a relay candidate times out and releases its negotiation
#[tokio::test]
async fn test_timeout_releases_negotiation() {
    let mut relay = MockRelay::new(|_| b"pong".to_vec());
    relay.hang_on = Some('e');
    let relay = Arc::new(relay);
    let options = RpcOptions {
        timeout: Some(Duration::from_millis(100)),
        ..RpcOptions::default()
    };

    let err = client(&relay, options)
        .call_text("relay.test", "ping")
        .await
        .unwrap_err();

    assert!(err.is_timeout(), "got {:?}", err);
    assert_eq!(relay.state.live.load(Ordering::SeqCst), 0);
}

/// A relay that lost the session never answers chunk pokes
#[tokio::test]
async fn test_lost_session_is_no_reply() {
    let mut relay = MockRelay::new(|_| b"pong".to_vec());
    relay.forgetful = true;
    let relay = Arc::new(relay);

    let err = client(&relay, RpcOptions::default())
        .call_text("relay.test", "ping")
        .await
        .unwrap_err();

    assert!(matches!(err, TunnelError::NoReply { .. }), "got {:?}", err);
    assert_eq!(relay.state.live.load(Ordering::SeqCst), 0);
}

/// Non-UTF-8 replies are decoded lossily by the text call
#[tokio::test]
async fn test_call_text_is_lossy() {
    let relay = Arc::new(MockRelay::new(|_| vec![b'o', 0xff, b'k']));
    let reply = client(&relay, RpcOptions::default())
        .call_text("relay.test", "ping")
        .await
        .unwrap();
    assert_eq!(reply, "o\u{fffd}k");
}
