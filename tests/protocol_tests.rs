//! Tests for the worker wire protocol.
//!
//! Covers chunk-boundary independence of both HTTP decoders and full
//! loopback invocations against the worker server on both transports.

use fedrun::protocol::http::{
    RequestDecoder, RequestEvent, ResponseDecoder, Segment, encode_exit, encode_request,
    encode_segment, response_head,
};
use fedrun::protocol::server::serve_listener;
use fedrun::protocol::{HttpInvoker, WsInvoker};
use fedrun::{ControlFrame, Error, Invocation, ServiceInvoker, Transport};
use proptest::prelude::*;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Helpers
// =============================================================================

fn sample_response(stdout: &[u8], stderr: &[u8], code: Option<i32>) -> Vec<u8> {
    let mut out = response_head();
    if !stdout.is_empty() {
        encode_segment(&mut out, Segment::Stdout, stdout);
    }
    if !stderr.is_empty() {
        encode_segment(&mut out, Segment::Stderr, stderr);
    }
    encode_exit(&mut out, code);
    out
}

fn decode_response(raw: &[u8], splits: &[usize]) -> fedrun::Result<fedrun::InvocationOutput> {
    let mut decoder = ResponseDecoder::new();
    let mut start = 0;
    for &split in splits {
        let end = split.clamp(start, raw.len());
        decoder.feed(&raw[start..end])?;
        start = end;
    }
    decoder.feed(&raw[start..])?;
    decoder.finish()
}

fn decode_request(raw: &[u8], chunk: usize) -> Vec<RequestEvent> {
    let mut decoder = RequestDecoder::new();
    let mut events = Vec::new();
    for piece in raw.chunks(chunk) {
        decoder.feed(piece, &mut events).unwrap();
    }
    assert!(decoder.is_done());
    events
}

fn stdin_of(events: &[RequestEvent]) -> Vec<u8> {
    events
        .iter()
        .filter_map(|e| match e {
            RequestEvent::Stdin(b) => Some(b.to_vec()),
            _ => None,
        })
        .flatten()
        .collect()
}

async fn start_worker(transport: Transport) -> (u16, CancellationToken) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let token = CancellationToken::new();
    tokio::spawn(serve_listener(listener, transport, token.clone()));
    (port, token)
}

// =============================================================================
// Response Decoding
// =============================================================================

#[test]
fn test_response_fixed_chunk_sizes() {
    let raw = sample_response(b"{\"output\":1}\n", b"", Some(0));
    for size in [1, 7, 4096] {
        let splits: Vec<usize> = (size..raw.len()).step_by(size).collect();
        let out = decode_response(&raw, &splits).unwrap();
        assert_eq!(out.stdout, "{\"output\":1}\n", "chunk size {size}");
        assert_eq!(out.code, 0);
    }
}

#[test]
fn test_response_stderr_and_code() {
    let raw = sample_response(b"", b"Traceback\n", Some(1));
    let out = decode_response(&raw, &[]).unwrap();
    assert_eq!(out.stderr, "Traceback\n");
    assert_eq!(out.code, 1);
    let err = out.check_exit_and_stderr().unwrap_err();
    assert_eq!(err.exit_code(), Some(1));
}

proptest! {
    #[test]
    fn prop_response_split_anywhere(
        stdout in "[a-zA-Z0-9 {}:\",\n]{0,200}",
        stderr in "[a-z \n]{0,50}",
        code in -1i32..3,
        mut splits in proptest::collection::vec(0usize..600, 0..12),
    ) {
        let raw = sample_response(stdout.as_bytes(), stderr.as_bytes(), Some(code));
        splits.sort_unstable();
        let out = decode_response(&raw, &splits).unwrap();
        prop_assert_eq!(out.stdout, stdout);
        prop_assert_eq!(out.stderr, stderr);
        prop_assert_eq!(out.code, code);
    }

    #[test]
    fn prop_request_split_anywhere(
        args in proptest::collection::vec("[a-z0-9{}\"]{0,12}", 0..4),
        input in proptest::collection::vec(any::<u8>(), 0..300),
        chunk in 1usize..64,
    ) {
        let control = ControlFrame::new("python", args);
        let raw = encode_request("127.0.0.1:8101", &control, &input).unwrap();
        let events = decode_request(&raw, chunk);
        prop_assert_eq!(
            &events[0],
            &RequestEvent::Control { frame: control, streaming: true }
        );
        prop_assert_eq!(stdin_of(&events), input);
        prop_assert_eq!(events.last(), Some(&RequestEvent::StdinEnd));
    }
}

// =============================================================================
// Loopback Invocations
// =============================================================================

#[tokio::test]
async fn test_http_echo() {
    let (port, token) = start_worker(Transport::Http).await;
    let invoker = HttpInvoker::new("127.0.0.1", port);
    let out = invoker
        .invoke(Invocation::new(ControlFrame::readiness_echo()))
        .await
        .unwrap();
    assert_eq!(out.stdout, "test\n");
    assert_eq!(out.code, 0);
    token.cancel();
}

#[tokio::test]
async fn test_http_cat_stdin() {
    let (port, token) = start_worker(Transport::Http).await;
    let invoker = HttpInvoker::new("127.0.0.1", port);
    let payload = "x".repeat(200_000);
    let out = invoker
        .invoke(Invocation::new(ControlFrame::new("cat", vec![])).with_input(payload.clone()))
        .await
        .unwrap();
    assert_eq!(out.stdout.len(), payload.len());
    token.cancel();
}

#[tokio::test]
async fn test_http_nonzero_exit() {
    let (port, token) = start_worker(Transport::Http).await;
    let invoker = HttpInvoker::new("127.0.0.1", port);
    let control = ControlFrame::new("sh", vec!["-c".into(), "exit 3".into()]);
    let err = invoker.invoke(Invocation::new(control)).await.unwrap_err();
    assert!(matches!(err, Error::ComputationExit { code: 3, .. }));
    token.cancel();
}

#[tokio::test]
async fn test_ws_echo_and_stdin() {
    let (port, token) = start_worker(Transport::Ws).await;
    let invoker = WsInvoker::new("127.0.0.1", port);
    let out = invoker
        .invoke(Invocation::new(ControlFrame::readiness_echo()))
        .await
        .unwrap();
    assert_eq!(out.stdout, "test\n");

    let out = invoker
        .invoke(Invocation::new(ControlFrame::new("cat", vec![])).with_input("hello"))
        .await
        .unwrap();
    assert_eq!(out.stdout, "hello");
    token.cancel();
}

#[tokio::test]
async fn test_ws_stderr_is_not_failure() {
    let (port, token) = start_worker(Transport::Ws).await;
    let invoker = WsInvoker::new("127.0.0.1", port);
    let control = ControlFrame::new("sh", vec!["-c".into(), "echo warn >&2; echo ok".into()]);
    let out = invoker.invoke(Invocation::new(control)).await.unwrap();
    assert_eq!(out.stdout, "ok\n");
    assert_eq!(out.stderr, "warn\n");
    token.cancel();
}

#[tokio::test]
async fn test_ws_refused_after_retries() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    let invoker = WsInvoker::new("127.0.0.1", port).with_connect_retries(1);
    let err = invoker
        .invoke(Invocation::new(ControlFrame::readiness_echo()))
        .await
        .unwrap_err();
    assert!(err.is_connection_reset(), "unexpected error: {err}");
}

#[tokio::test]
async fn test_worker_launch_config() {
    let config = fedrun::protocol::WorkerConfig::from_launch_arg(r#"{"server":"http","port":9000}"#)
        .unwrap();
    assert_eq!(config.server, Transport::Http);
    assert_eq!(config.port, 9000);
    assert_eq!(config.level, "info");
    assert!(fedrun::protocol::WorkerConfig::from_launch_arg("not json").is_err());
}
