//! Integration tests for the socket IPC service.
//!
//! Clients here speak the raw frame protocol over `UnixStream`, the same
//! way an out-of-process client library would.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::net::UnixStream;
use tokio::sync::mpsc;

use zoned::constants::METHOD_SUBSCRIBE_SIGNALS;
use zoned::ipc::{Frame, FrameKind, PeerId, Service, ERR_HANDLER_ERROR, ERR_NO_SUCH_METHOD};
use zoned::Error;

const METHOD_ECHO: u32 = 10;
const METHOD_FAIL: u32 = 11;
const METHOD_PANIC: u32 = 12;
const SIGNAL_TICK: u32 = 40;

// =============================================================================
// Test Helpers
// =============================================================================

struct TestService {
    service: Service,
    peers: mpsc::UnboundedReceiver<PeerId>,
    _dir: TempDir,
}

/// Starts a service with echo/fail/panic handlers and a peer-id feed.
fn start_service() -> TestService {
    let dir = TempDir::new().unwrap();
    let service = Service::new(dir.path().join("ipc.sock"));

    service.add_method_handler(METHOD_ECHO, |_peer, payload| async move { Ok(payload) });
    service.add_method_handler(METHOD_FAIL, |_peer, _payload| async move {
        Err("deliberate failure".to_string())
    });
    service.add_method_handler(METHOD_PANIC, |_peer, _payload| async move {
        assert_eq!(1, 2, "deliberate panic");
        Ok(Vec::new())
    });

    let (peer_tx, peers) = mpsc::unbounded_channel();
    service.set_new_peer_callback(move |peer_id| {
        let _ = peer_tx.send(peer_id);
    });

    service.start().unwrap();
    TestService {
        service,
        peers,
        _dir: dir,
    }
}

async fn connect(service: &Service) -> UnixStream {
    UnixStream::connect(service.path()).await.unwrap()
}

async fn roundtrip(stream: &mut UnixStream, request: Frame) -> Frame {
    request.write_to(stream).await.unwrap();
    Frame::read_from(stream).await.unwrap()
}

// =============================================================================
// Request / Response
// =============================================================================

#[tokio::test]
async fn test_method_call_roundtrip() {
    let harness = start_service();
    let mut client = connect(&harness.service).await;

    let request = Frame::request(METHOD_ECHO, b"hello".to_vec());
    let message_id = request.message_id;
    let response = roundtrip(&mut client, request).await;

    assert_eq!(response.kind, FrameKind::Response);
    assert_eq!(response.message_id, message_id);
    assert_eq!(response.payload, b"hello");
    harness.service.stop().await;
}

#[tokio::test]
async fn test_unknown_method_yields_error_frame() {
    let harness = start_service();
    let mut client = connect(&harness.service).await;

    let response = roundtrip(&mut client, Frame::request(999, Vec::new())).await;
    assert_eq!(response.kind, FrameKind::Error);
    let (code, _) = response.error_payload().unwrap();
    assert_eq!(code, ERR_NO_SUCH_METHOD);
    harness.service.stop().await;
}

#[tokio::test]
async fn test_handler_failure_is_isolated() {
    let harness = start_service();
    let mut client = connect(&harness.service).await;

    let response = roundtrip(&mut client, Frame::request(METHOD_FAIL, Vec::new())).await;
    assert_eq!(response.kind, FrameKind::Error);
    let (code, reason) = response.error_payload().unwrap();
    assert_eq!(code, ERR_HANDLER_ERROR);
    assert!(reason.contains("deliberate failure"));

    // The service keeps serving after a handler error.
    let response = roundtrip(&mut client, Frame::request(METHOD_ECHO, b"x".to_vec())).await;
    assert_eq!(response.kind, FrameKind::Response);
    harness.service.stop().await;
}

#[tokio::test]
async fn test_handler_panic_is_isolated() {
    let harness = start_service();
    let mut client = connect(&harness.service).await;

    let response = roundtrip(&mut client, Frame::request(METHOD_PANIC, Vec::new())).await;
    assert_eq!(response.kind, FrameKind::Error);
    let (code, _) = response.error_payload().unwrap();
    assert_eq!(code, ERR_HANDLER_ERROR);

    let response = roundtrip(&mut client, Frame::request(METHOD_ECHO, b"y".to_vec())).await;
    assert_eq!(response.payload, b"y");
    harness.service.stop().await;
}

#[tokio::test]
async fn test_responses_pair_by_message_id() {
    let harness = start_service();
    let mut client = connect(&harness.service).await;

    let first = Frame::request(METHOD_ECHO, b"first".to_vec());
    let second = Frame::request(METHOD_ECHO, b"second".to_vec());
    let (first_id, second_id) = (first.message_id, second.message_id);
    first.write_to(&mut client).await.unwrap();
    second.write_to(&mut client).await.unwrap();

    let mut by_id = std::collections::HashMap::new();
    for _ in 0..2 {
        let response = Frame::read_from(&mut client).await.unwrap();
        by_id.insert(response.message_id, response.payload);
    }
    assert_eq!(by_id[&first_id], b"first");
    assert_eq!(by_id[&second_id], b"second");
    harness.service.stop().await;
}

// =============================================================================
// Outbound Calls
// =============================================================================

#[tokio::test]
async fn test_call_reaches_peer_and_returns_reply() {
    let mut harness = start_service();
    let mut client = connect(&harness.service).await;
    let peer_id = harness.peers.recv().await.unwrap();

    // Client side: answer the one incoming request.
    let echo_task = tokio::spawn(async move {
        let request = Frame::read_from(&mut client).await.unwrap();
        assert_eq!(request.kind, FrameKind::Request);
        Frame::response(request.message_id, request.method_id, request.payload)
            .write_to(&mut client)
            .await
            .unwrap();
    });

    let reply = harness
        .service
        .call(7, peer_id, b"ping".to_vec(), Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(reply, b"ping");
    echo_task.await.unwrap();
    harness.service.stop().await;
}

#[tokio::test]
async fn test_call_times_out() {
    let mut harness = start_service();
    let _client = connect(&harness.service).await;
    let peer_id = harness.peers.recv().await.unwrap();

    let err = harness
        .service
        .call(7, peer_id, Vec::new(), Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));
    harness.service.stop().await;
}

#[tokio::test]
async fn test_call_fails_when_peer_disconnects() {
    let mut harness = start_service();
    let client = connect(&harness.service).await;
    let peer_id = harness.peers.recv().await.unwrap();

    let service = harness.service.clone();
    let call = tokio::spawn(async move {
        service
            .call(7, peer_id, Vec::new(), Duration::from_secs(5))
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    drop(client);

    let err = call.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::PeerGone(_)));
    harness.service.stop().await;
}

#[tokio::test]
async fn test_stop_cancels_outstanding_calls() {
    let mut harness = start_service();
    let _client = connect(&harness.service).await;
    let peer_id = harness.peers.recv().await.unwrap();

    let service = harness.service.clone();
    let call = tokio::spawn(async move {
        service
            .call(7, peer_id, Vec::new(), Duration::from_secs(5))
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    harness.service.stop().await;

    let err = call.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::ServiceStopped));
}

#[tokio::test]
async fn test_call_async_delivers_result() {
    let mut harness = start_service();
    let mut client = connect(&harness.service).await;
    let peer_id = harness.peers.recv().await.unwrap();

    let (result_tx, mut result_rx) = mpsc::unbounded_channel();
    harness
        .service
        .call_async(7, peer_id, b"async".to_vec(), move |result| {
            let _ = result_tx.send(result);
        })
        .unwrap();

    let request = Frame::read_from(&mut client).await.unwrap();
    Frame::response(request.message_id, request.method_id, b"done".to_vec())
        .write_to(&mut client)
        .await
        .unwrap();

    let result = result_rx.recv().await.unwrap().unwrap();
    assert_eq!(result, b"done");
    harness.service.stop().await;
}

// =============================================================================
// Signals
// =============================================================================

async fn subscribe(client: &mut UnixStream, method_ids: &[u32]) {
    let payload = serde_json::to_vec(method_ids).unwrap();
    let response = roundtrip(client, Frame::request(METHOD_SUBSCRIBE_SIGNALS, payload)).await;
    assert_eq!(response.kind, FrameKind::Response);
}

#[tokio::test]
async fn test_signal_reaches_only_subscribed_peers() {
    let harness = start_service();
    let mut subscriber = connect(&harness.service).await;
    let mut bystander = connect(&harness.service).await;

    subscribe(&mut subscriber, &[SIGNAL_TICK]).await;
    harness.service.signal(SIGNAL_TICK, b"tick".to_vec()).unwrap();

    let frame = tokio::time::timeout(Duration::from_secs(1), Frame::read_from(&mut subscriber))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(frame.kind, FrameKind::Signal);
    assert_eq!(frame.method_id, SIGNAL_TICK);
    assert_eq!(frame.payload, b"tick");

    // The unsubscribed peer sees nothing.
    let nothing =
        tokio::time::timeout(Duration::from_millis(200), Frame::read_from(&mut bystander)).await;
    assert!(nothing.is_err());
    harness.service.stop().await;
}

// =============================================================================
// Peer Lifecycle
// =============================================================================

#[tokio::test]
async fn test_peer_callbacks_fire() {
    let dir = TempDir::new().unwrap();
    let service = Service::new(dir.path().join("ipc.sock"));
    let added = Arc::new(AtomicUsize::new(0));
    let removed = Arc::new(AtomicUsize::new(0));

    let added_clone = Arc::clone(&added);
    service.set_new_peer_callback(move |_| {
        added_clone.fetch_add(1, Ordering::SeqCst);
    });
    let removed_clone = Arc::clone(&removed);
    service.set_removed_peer_callback(move |_| {
        removed_clone.fetch_add(1, Ordering::SeqCst);
    });
    service.start().unwrap();

    let client = UnixStream::connect(service.path()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(added.load(Ordering::SeqCst), 1);

    drop(client);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(removed.load(Ordering::SeqCst), 1);
    service.stop().await;
}

#[tokio::test]
async fn test_framing_violation_closes_only_offending_peer() {
    let harness = start_service();
    let mut good = connect(&harness.service).await;
    let mut bad = connect(&harness.service).await;

    // Oversized payload length in the header closes the peer.
    let mut rogue = Frame::request(METHOD_ECHO, Vec::new()).encode();
    rogue[13..17].copy_from_slice(&u32::MAX.to_le_bytes());
    use tokio::io::AsyncWriteExt;
    bad.write_all(&rogue).await.unwrap();

    // The well-behaved peer is unaffected.
    let response = roundtrip(&mut good, Frame::request(METHOD_ECHO, b"ok".to_vec())).await;
    assert_eq!(response.payload, b"ok");

    // The offending peer is gone: reads hit EOF.
    let eof = Frame::read_from(&mut bad).await;
    assert!(eof.is_err());
    harness.service.stop().await;
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let harness = start_service();
    harness.service.stop().await;
    harness.service.stop().await;
    assert!(!harness.service.is_started());
}

#[tokio::test]
async fn test_remove_method() {
    let harness = start_service();
    harness.service.remove_method(METHOD_ECHO);
    let mut client = connect(&harness.service).await;

    let response = roundtrip(&mut client, Frame::request(METHOD_ECHO, Vec::new())).await;
    assert_eq!(response.kind, FrameKind::Error);
    let (code, _) = response.error_payload().unwrap();
    assert_eq!(code, ERR_NO_SUCH_METHOD);
    harness.service.stop().await;
}
