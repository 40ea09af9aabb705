//! End-to-end tests driving a served responder through a duplex transport.
//!
//! The peer side speaks raw frames: requests are written as encoded bytes
//! and responses are reassembled with the same frame buffer the engine
//! uses.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncWriteExt, DuplexStream};

use rsocket_engine::error::error_codes;
use rsocket_engine::protocol::{Frame, FrameBuffer, FrameType};
use rsocket_engine::rsocket::{error_stream, BoxFuture};
use rsocket_engine::{
    Connection, ConnectionConfig, ConnectionState, InboundPayloads, Payload, PayloadStream,
    RSocket, Result,
};

/// Peer half of the duplex transport, speaking raw frames.
struct Peer {
    io: DuplexStream,
    buffer: FrameBuffer,
    queued: Vec<Frame>,
}

impl Peer {
    fn new(io: DuplexStream) -> Self {
        Self {
            io,
            buffer: FrameBuffer::new(),
            queued: Vec::new(),
        }
    }

    async fn send(&mut self, frame: Frame) {
        self.io.write_all(frame.as_bytes()).await.unwrap();
        self.io.flush().await.unwrap();
    }

    async fn recv(&mut self) -> Frame {
        use tokio::io::AsyncReadExt;

        loop {
            if !self.queued.is_empty() {
                return self.queued.remove(0);
            }
            let mut buf = [0u8; 4096];
            let n = tokio::time::timeout(Duration::from_secs(2), self.io.read(&mut buf))
                .await
                .expect("frame within timeout")
                .expect("transport open");
            assert!(n > 0, "transport closed while expecting a frame");
            self.queued.extend(self.buffer.push(&buf[..n]).unwrap());
        }
    }

    /// Receive frames until one matches, discarding keep-alive probes and
    /// other unrelated traffic.
    async fn recv_matching(&mut self, matches: impl Fn(&Frame) -> bool) -> Frame {
        loop {
            let frame = self.recv().await;
            if matches(&frame) {
                return frame;
            }
        }
    }

    /// Assert no complete frame arrives within the window.
    async fn assert_silent(&mut self, window: Duration) {
        use tokio::io::AsyncReadExt;

        assert!(self.queued.is_empty());
        let mut buf = [0u8; 4096];
        if let Ok(Ok(n)) = tokio::time::timeout(window, self.io.read(&mut buf)).await {
            self.queued.extend(self.buffer.push(&buf[..n]).unwrap());
            assert!(
                self.queued.is_empty(),
                "unexpected frame: {:?}",
                self.queued[0].frame_type()
            );
        }
    }
}

struct TestService {
    fnf_payloads: Arc<Mutex<Vec<Payload>>>,
    pushes: Arc<AtomicUsize>,
}

impl TestService {
    fn new() -> Self {
        Self {
            fnf_payloads: Arc::new(Mutex::new(Vec::new())),
            pushes: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl RSocket for TestService {
    fn fire_and_forget(&self, payload: Payload) -> BoxFuture<'static, Result<()>> {
        let fnf_payloads = self.fnf_payloads.clone();
        Box::pin(async move {
            fnf_payloads.lock().push(payload);
            Ok(())
        })
    }

    fn request_response(&self, payload: Payload) -> BoxFuture<'static, Result<Option<Payload>>> {
        Box::pin(async move {
            match payload.data().as_ref() {
                b"empty" => Ok(None),
                b"fail" => Err(rsocket_engine::RSocketError::application("handler failed")),
                _ => Ok(Some(Payload::with_metadata(
                    Bytes::from_static(b"M"),
                    Bytes::from_static(b"D"),
                ))),
            }
        })
    }

    fn request_stream(&self, payload: Payload) -> PayloadStream {
        if payload.data().as_ref() == b"fail" {
            return error_stream(rsocket_engine::RSocketError::application("no stream"));
        }
        Box::pin(futures::stream::iter(
            [b"a", b"b", b"c"].map(|data| Ok(Payload::new(Bytes::from_static(data)))),
        ))
    }

    fn request_channel(&self, _payload: Payload, payloads: InboundPayloads) -> PayloadStream {
        // echo every inbound payload (the bootstrap included), granting
        // one credit back per item consumed
        Box::pin(futures::stream::unfold(payloads, |mut payloads| async move {
            let item = payloads.next_payload().await?;
            payloads.request(1);
            Some((item, payloads))
        }))
    }

    fn metadata_push(&self, _payload: Payload) -> BoxFuture<'static, Result<()>> {
        self.pushes.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Ok(()) })
    }
}

fn connect(handler: Arc<dyn RSocket>) -> (Connection, Peer) {
    let (server_io, peer_io) = tokio::io::duplex(64 * 1024);
    let connection = Connection::serve(server_io, handler, ConnectionConfig::default());
    (connection, Peer::new(peer_io))
}

#[tokio::test]
async fn test_request_response_over_transport() {
    let (connection, mut peer) = connect(Arc::new(TestService::new()));

    let request = Frame::request_response(
        1,
        &Payload::with_metadata(Bytes::from_static(b"m"), Bytes::from_static(b"d")),
    )
    .unwrap();
    peer.send(request).await;

    let response = peer.recv_matching(|f| f.stream_id() == 1).await;
    assert_eq!(response.frame_type().unwrap(), FrameType::NextComplete);
    assert_eq!(response.metadata().unwrap().as_ref(), b"M");
    assert_eq!(response.data().unwrap().as_ref(), b"D");

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(connection.responder().active_senders(), 0);
}

#[tokio::test]
async fn test_request_response_empty_completion() {
    let (_connection, mut peer) = connect(Arc::new(TestService::new()));

    peer.send(Frame::request_response(3, &Payload::new(Bytes::from_static(b"empty"))).unwrap())
        .await;

    let response = peer.recv_matching(|f| f.stream_id() == 3).await;
    assert_eq!(response.frame_type().unwrap(), FrameType::Complete);
    assert!(response.data().unwrap().is_empty());
    assert!(response.metadata().unwrap().is_empty());
}

#[tokio::test]
async fn test_request_response_handler_error() {
    let (_connection, mut peer) = connect(Arc::new(TestService::new()));

    peer.send(Frame::request_response(5, &Payload::new(Bytes::from_static(b"fail"))).unwrap())
        .await;

    let response = peer.recv_matching(|f| f.stream_id() == 5).await;
    assert_eq!(response.frame_type().unwrap(), FrameType::Error);
    assert_eq!(
        response.error_code().unwrap(),
        error_codes::APPLICATION_ERROR
    );
    assert!(response.error_message().unwrap().contains("handler failed"));
}

#[tokio::test]
async fn test_request_stream_credit_flow() {
    let (_connection, mut peer) = connect(Arc::new(TestService::new()));

    peer.send(Frame::request_stream(5, 2, &Payload::new(Bytes::from_static(b"p"))).unwrap())
        .await;

    let first = peer.recv_matching(|f| f.stream_id() == 5).await;
    assert_eq!(first.frame_type().unwrap(), FrameType::Next);
    assert_eq!(first.data().unwrap().as_ref(), b"a");
    let second = peer.recv_matching(|f| f.stream_id() == 5).await;
    assert_eq!(second.data().unwrap().as_ref(), b"b");

    // exhausted credit: the third item must wait for REQUEST_N
    peer.assert_silent(Duration::from_millis(100)).await;

    peer.send(Frame::request_n(5, 10).unwrap()).await;

    let third = peer.recv_matching(|f| f.stream_id() == 5).await;
    assert_eq!(third.frame_type().unwrap(), FrameType::Next);
    assert_eq!(third.data().unwrap().as_ref(), b"c");
    let complete = peer.recv_matching(|f| f.stream_id() == 5).await;
    assert_eq!(complete.frame_type().unwrap(), FrameType::Complete);
}

#[tokio::test]
async fn test_fire_and_forget_is_unreplied() {
    let service = Arc::new(TestService::new());
    let fnf_payloads = service.fnf_payloads.clone();
    let (_connection, mut peer) = connect(service);

    peer.send(Frame::request_fnf(7, &Payload::new(Bytes::from_static(b"event"))).unwrap())
        .await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(fnf_payloads.lock().len(), 1);
    assert_eq!(fnf_payloads.lock()[0].data().as_ref(), b"event");
    // fire-and-forget never replies
    peer.assert_silent(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn test_metadata_push_dispatched() {
    let service = Arc::new(TestService::new());
    let pushes = service.pushes.clone();
    let (_connection, mut peer) = connect(service);

    peer.send(Frame::metadata_push(b"routing").unwrap()).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(pushes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_channel_echo_with_credit_grants() {
    let (_connection, mut peer) = connect(Arc::new(TestService::new()));

    let bootstrap = Payload::new(Bytes::from_static(b"p0"));
    peer.send(Frame::request_channel(9, u32::MAX, &bootstrap).unwrap())
        .await;

    // consuming the bootstrap grants the peer credit before the echo
    let request_n = peer
        .recv_matching(|f| matches!(f.frame_type(), Ok(FrameType::RequestN)))
        .await;
    assert_eq!(request_n.stream_id(), 9);
    assert_eq!(request_n.request_n_value().unwrap(), 1);

    // bootstrap is delivered into the inbound stream, so the echo handler
    // returns it first
    let echoed = peer
        .recv_matching(|f| f.stream_id() == 9 && matches!(f.frame_type(), Ok(FrameType::Next)))
        .await;
    assert_eq!(echoed.data().unwrap().as_ref(), b"p0");

    peer.send(Frame::next(9, &Payload::new(Bytes::from_static(b"p1"))).unwrap())
        .await;
    let echoed = peer
        .recv_matching(|f| f.stream_id() == 9 && matches!(f.frame_type(), Ok(FrameType::Next)))
        .await;
    assert_eq!(echoed.data().unwrap().as_ref(), b"p1");

    // completing the inbound side completes the echo stream
    peer.send(Frame::complete(9).unwrap()).await;
    let complete = peer
        .recv_matching(|f| {
            f.stream_id() == 9 && matches!(f.frame_type(), Ok(FrameType::Complete))
        })
        .await;
    assert_eq!(complete.frame_type().unwrap(), FrameType::Complete);
}

#[tokio::test]
async fn test_channel_consumer_cancel_emits_cancel_frame() {
    struct CancelAfterFirst;
    impl RSocket for CancelAfterFirst {
        fn request_channel(&self, _payload: Payload, payloads: InboundPayloads) -> PayloadStream {
            Box::pin(futures::stream::once(async move {
                let mut payloads = payloads;
                let first = payloads.next_payload().await.expect("bootstrap payload");
                drop(payloads);
                first
            }))
        }
    }

    let (connection, mut peer) = connect(Arc::new(CancelAfterFirst));

    peer.send(
        Frame::request_channel(7, u32::MAX, &Payload::new(Bytes::from_static(b"p0"))).unwrap(),
    )
    .await;

    let cancel = peer
        .recv_matching(|f| matches!(f.frame_type(), Ok(FrameType::Cancel)))
        .await;
    assert_eq!(cancel.stream_id(), 7);

    // subsequent peer NEXT frames for the canceled stream are dropped
    peer.send(Frame::next(7, &Payload::new(Bytes::from_static(b"late"))).unwrap())
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(connection.state(), ConnectionState::Open);
    assert_eq!(connection.responder().active_receivers(), 0);
}

#[tokio::test]
async fn test_setup_post_setup_disposes_connection() {
    let (connection, mut peer) = connect(Arc::new(TestService::new()));

    let setup = Frame::setup(500, 1500, "", "application/json", &Payload::empty()).unwrap();
    peer.send(setup).await;

    let error = peer
        .recv_matching(|f| matches!(f.frame_type(), Ok(FrameType::Error)))
        .await;
    assert_eq!(error.stream_id(), 0);
    assert_eq!(error.error_code().unwrap(), error_codes::CONNECTION_ERROR);
    assert!(error
        .error_message()
        .unwrap()
        .contains("SETUP frame received post setup"));

    connection.closed().await;
    assert_eq!(connection.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_termination_sweep_on_peer_disconnect() {
    let (connection, mut peer) = connect(Arc::new(TestService::new()));

    // a stream pending on credit keeps its sender registered
    peer.send(Frame::request_stream(11, 1, &Payload::new(Bytes::from_static(b"p"))).unwrap())
        .await;
    let first = peer.recv_matching(|f| f.stream_id() == 11).await;
    assert_eq!(first.frame_type().unwrap(), FrameType::Next);

    // a channel keeps its receiver registered
    peer.send(
        Frame::request_channel(13, u32::MAX, &Payload::new(Bytes::from_static(b"p0"))).unwrap(),
    )
    .await;
    peer.recv_matching(|f| f.stream_id() == 13 && matches!(f.frame_type(), Ok(FrameType::Next)))
        .await;

    assert!(connection.responder().active_senders() >= 1);

    drop(peer);
    connection.closed().await;

    assert_eq!(connection.state(), ConnectionState::Closed);
    assert_eq!(connection.responder().active_senders(), 0);
    assert_eq!(connection.responder().active_receivers(), 0);
}

#[tokio::test]
async fn test_keepalive_echo_over_transport() {
    let (server_io, peer_io) = tokio::io::duplex(64 * 1024);
    let config = ConnectionConfig {
        keepalive_interval: Duration::from_millis(50),
        keepalive_timeout: Duration::from_secs(10),
        ..ConnectionConfig::default()
    };
    let _connection = Connection::serve(server_io, Arc::new(TestService::new()), config);
    let mut peer = Peer::new(peer_io);

    // server probes on its own timer
    let probe = peer
        .recv_matching(|f| matches!(f.frame_type(), Ok(FrameType::Keepalive)))
        .await;
    assert!(probe.keepalive_respond());

    // respond-flagged keep-alives are echoed with the same data
    peer.send(Frame::keepalive(true, 0, b"ping").unwrap()).await;
    let echo = peer
        .recv_matching(|f| {
            matches!(f.frame_type(), Ok(FrameType::Keepalive)) && !f.keepalive_respond()
        })
        .await;
    assert_eq!(echo.data().unwrap().as_ref(), b"ping");
}

#[tokio::test]
async fn test_keepalive_timeout_disposes_connection() {
    let (server_io, _peer_io) = tokio::io::duplex(64 * 1024);
    let config = ConnectionConfig {
        keepalive_interval: Duration::from_millis(20),
        keepalive_timeout: Duration::from_millis(80),
        ..ConnectionConfig::default()
    };
    let connection = Connection::serve(server_io, Arc::new(TestService::new()), config);

    // peer never answers; the quiet window elapses and the connection dies
    connection.closed().await;
    assert_eq!(connection.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_malformed_frame_is_fatal() {
    let (connection, mut peer) = connect(Arc::new(TestService::new()));

    // length prefix claiming a frame shorter than the common header
    peer.io.write_all(&[0, 0, 2]).await.unwrap();
    peer.io.flush().await.unwrap();

    let error = peer
        .recv_matching(|f| matches!(f.frame_type(), Ok(FrameType::Error)))
        .await;
    assert_eq!(error.stream_id(), 0);
    assert_eq!(error.error_code().unwrap(), error_codes::CONNECTION_ERROR);

    connection.closed().await;
    assert_eq!(connection.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_unknown_stream_frames_do_not_kill_connection() {
    let (connection, mut peer) = connect(Arc::new(TestService::new()));

    peer.send(Frame::cancel(99).unwrap()).await;
    peer.send(Frame::request_n(99, 4).unwrap()).await;
    peer.send(Frame::next(99, &Payload::new(Bytes::from_static(b"x"))).unwrap())
        .await;
    peer.send(Frame::error(99, error_codes::APPLICATION_ERROR, "late").unwrap())
        .await;

    // the connection still serves requests afterwards
    peer.send(Frame::request_response(101, &Payload::new(Bytes::from_static(b"d"))).unwrap())
        .await;
    let response = peer.recv_matching(|f| f.stream_id() == 101).await;
    assert_eq!(response.frame_type().unwrap(), FrameType::NextComplete);
    assert_eq!(connection.state(), ConnectionState::Open);
}
