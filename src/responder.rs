//! Responder multiplexer: inbound frame dispatch, per-interaction state
//! machines, and the credit bridge between the peer and local handlers.
//!
//! All outbound frames, whatever their stream, go through one unbounded
//! MPSC queue whose sole consumer is the transport writer. Inbound frames
//! arrive one at a time through [`Responder::handle_frame`]; interactions
//! run on spawned tasks so the dispatch path never blocks.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::backpressure::{CancelFlag, Credit};
use crate::channel::InboundPayloads;
use crate::error::{error_codes, RSocketError, Result};
use crate::payload::Payload;
use crate::protocol::{Frame, FrameType};
use crate::registry::StreamRegistry;
use crate::rsocket::{PayloadStream, RSocket};

/// Sink for errors that have no natural subscriber (fire-and-forget and
/// metadata-push failures, cleanup failures).
pub type ErrorConsumer = Arc<dyn Fn(RSocketError) + Send + Sync>;

/// Error consumer that logs at warn level.
pub fn logging_error_consumer() -> ErrorConsumer {
    Arc::new(|error| tracing::warn!("responder error: {error}"))
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Terminating,
    Closed,
}

const STATE_OPEN: u8 = 0;
const STATE_TERMINATING: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// Sent item on an inbound per-stream queue.
#[derive(Debug)]
pub(crate) enum StreamEvent {
    Next(Payload),
    Complete,
    Error(RSocketError),
}

/// Registry entry for an outbound producer: its credit toward the handler
/// and its cancellation latch.
#[derive(Debug, Clone)]
pub(crate) struct StreamSender {
    credit: Arc<Credit>,
    canceled: Arc<CancelFlag>,
}

impl StreamSender {
    fn with_initial(initial_request_n: u32) -> Self {
        Self {
            credit: Arc::new(Credit::new(initial_request_n)),
            canceled: Arc::new(CancelFlag::new()),
        }
    }

    fn unbounded() -> Self {
        Self {
            credit: Arc::new(Credit::unbounded()),
            canceled: Arc::new(CancelFlag::new()),
        }
    }

    fn request_n(&self, n: u32) {
        self.credit.add(n);
    }

    fn cancel(&self) {
        self.canceled.cancel();
    }
}

pub(crate) struct ResponderInner {
    handler: Arc<dyn RSocket>,
    senders: StreamRegistry<StreamSender>,
    receivers: StreamRegistry<mpsc::UnboundedSender<StreamEvent>>,
    outbound: mpsc::UnboundedSender<Bytes>,
    error_consumer: ErrorConsumer,
    disposer: Box<dyn Fn() + Send + Sync>,
    termination_error: Mutex<Option<RSocketError>>,
    termination_set: AtomicBool,
    sweep_started: AtomicBool,
    state: AtomicU8,
}

impl ResponderInner {
    /// Enqueue a frame on the outbound queue. Fails once the transport has
    /// stopped consuming.
    pub(crate) fn send_frame(&self, frame: Frame) -> Result<()> {
        self.outbound
            .send(frame.into_bytes())
            .map_err(|_| RSocketError::ConnectionClosed)
    }

    /// Encode and enqueue an ERROR frame for a stream.
    pub(crate) fn send_error_frame(&self, stream_id: u32, error: &RSocketError) {
        let frame = Frame::error(stream_id, error.error_code(), &error.to_string())
            .unwrap_or_else(|_| {
                Frame::error(stream_id, error_codes::APPLICATION_ERROR, "error")
                    .expect("static error frame encodes")
            });
        let _ = self.send_frame(frame);
    }

    /// True once a termination error is installed, by a fatal violation or
    /// by the sweep itself.
    pub(crate) fn is_terminating(&self) -> bool {
        self.termination_set.load(Ordering::Acquire)
    }

    /// Install the termination error if none is present yet; returns a
    /// deliverable copy of whichever error ends up installed.
    fn install_termination_error(&self, error: RSocketError) -> RSocketError {
        let mut slot = self.termination_error.lock();
        if slot.is_none() {
            *slot = Some(error);
            self.termination_set.store(true, Ordering::Release);
        }
        replicate(slot.as_ref().expect("termination error installed"))
    }

    /// Per-stream removal, suppressed once termination is underway so the
    /// sweep can iterate its snapshots and clear the maps itself.
    pub(crate) fn remove_sender(&self, stream_id: u32) {
        if !self.is_terminating() {
            self.senders.remove(stream_id);
        }
    }

    pub(crate) fn remove_receiver(&self, stream_id: u32) {
        if !self.is_terminating() {
            self.receivers.remove(stream_id);
        }
    }
}

/// Responder side of a connection. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Responder {
    inner: Arc<ResponderInner>,
}

impl Responder {
    /// Create a responder over an outbound frame queue.
    ///
    /// `disposer` is invoked when a fatal protocol violation requires the
    /// connection to be torn down; it must eventually lead to
    /// [`terminate`](Self::terminate) being called.
    pub fn new(
        handler: Arc<dyn RSocket>,
        outbound: mpsc::UnboundedSender<Bytes>,
        error_consumer: ErrorConsumer,
        disposer: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(ResponderInner {
                handler,
                senders: StreamRegistry::new(),
                receivers: StreamRegistry::new(),
                outbound,
                error_consumer,
                disposer: Box::new(disposer),
                termination_error: Mutex::new(None),
                termination_set: AtomicBool::new(false),
                sweep_started: AtomicBool::new(false),
                state: AtomicU8::new(STATE_OPEN),
            }),
        }
    }

    pub(crate) fn inner(&self) -> &Arc<ResponderInner> {
        &self.inner
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        match self.inner.state.load(Ordering::Acquire) {
            STATE_OPEN => ConnectionState::Open,
            STATE_TERMINATING => ConnectionState::Terminating,
            _ => ConnectionState::Closed,
        }
    }

    /// Number of live outbound producers.
    pub fn active_senders(&self) -> usize {
        self.inner.senders.len()
    }

    /// Number of live inbound sinks.
    pub fn active_receivers(&self) -> usize {
        self.inner.receivers.len()
    }

    /// Dispatch one decoded inbound frame.
    pub fn handle_frame(&self, frame: Frame) {
        let stream_id = frame.stream_id();
        let frame_type = match frame.frame_type() {
            Ok(frame_type) => frame_type,
            Err(error) => {
                self.dispose_connection(error);
                return;
            }
        };

        match frame_type {
            FrameType::RequestFnf => match frame.payload() {
                Ok(payload) => self.handle_fire_and_forget(stream_id, payload),
                Err(error) => self.dispose_connection(error),
            },
            FrameType::RequestResponse => match frame.payload() {
                Ok(payload) => self.handle_request_response(stream_id, payload),
                Err(error) => self.dispose_connection(error),
            },
            FrameType::RequestN => match frame.request_n_value() {
                Ok(n) => {
                    if let Some(sender) = self.inner.senders.get(stream_id) {
                        sender.request_n(n);
                    }
                }
                Err(error) => self.dispose_connection(error),
            },
            FrameType::RequestStream => {
                match frame.initial_request_n().and_then(|n| Ok((n, frame.payload()?))) {
                    Ok((initial_request_n, payload)) => {
                        let stream = self.inner.handler.request_stream(payload);
                        self.handle_stream(stream_id, stream, initial_request_n);
                    }
                    Err(error) => self.dispose_connection(error),
                }
            }
            FrameType::RequestChannel => {
                match frame.initial_request_n().and_then(|n| Ok((n, frame.payload()?))) {
                    Ok((initial_request_n, payload)) => {
                        self.handle_channel(stream_id, payload, initial_request_n)
                    }
                    Err(error) => self.dispose_connection(error),
                }
            }
            FrameType::MetadataPush => match frame.payload() {
                Ok(payload) => self.handle_metadata_push(payload),
                Err(error) => self.dispose_connection(error),
            },
            FrameType::Next => self.deliver(stream_id, frame, false),
            FrameType::NextComplete => self.deliver(stream_id, frame, true),
            FrameType::Complete => {
                if let Some(receiver) = self.inner.receivers.get(stream_id) {
                    let _ = receiver.send(StreamEvent::Complete);
                }
            }
            FrameType::Cancel => {
                if let Some(sender) = self.inner.senders.remove(stream_id) {
                    sender.cancel();
                }
            }
            FrameType::Error => {
                if let Some(receiver) = self.inner.receivers.get(stream_id) {
                    let error = match (frame.error_code(), frame.error_message()) {
                        (Ok(code), Ok(message)) => RSocketError::Stream { code, message },
                        _ => RSocketError::IllegalFrame("truncated ERROR frame".into()),
                    };
                    let _ = receiver.send(StreamEvent::Error(error));
                }
            }
            FrameType::Setup => {
                self.dispose_connection(RSocketError::Protocol(
                    "SETUP frame received post setup".into(),
                ));
            }
            FrameType::Lease => {
                self.dispose_connection(RSocketError::Protocol(
                    "unexpected LEASE frame received".into(),
                ));
            }
            other => {
                tracing::debug!(frame_type = ?other, stream_id, "unexpected frame received");
            }
        }
    }

    /// Deliver a payload frame (and optionally completion) to the stream's
    /// receiver. Unknown stream ids are ignored: the peer may have raced a
    /// CANCEL.
    fn deliver(&self, stream_id: u32, frame: Frame, complete: bool) {
        let Some(receiver) = self.inner.receivers.get(stream_id) else {
            return;
        };
        match frame.payload() {
            Ok(payload) => {
                let _ = receiver.send(StreamEvent::Next(payload));
                if complete {
                    let _ = receiver.send(StreamEvent::Complete);
                }
            }
            Err(error) => self.dispose_connection(error),
        }
    }

    fn handle_fire_and_forget(&self, stream_id: u32, payload: Payload) {
        let sender = StreamSender::unbounded();
        self.inner.senders.insert(stream_id, sender.clone());

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let work = inner.handler.fire_and_forget(payload);
            tokio::select! {
                _ = sender.canceled.cancelled() => {}
                result = work => {
                    // unreplied by contract: errors go to the sink, not the wire
                    if let Err(error) = result {
                        (inner.error_consumer)(error);
                    }
                }
            }
            inner.remove_sender(stream_id);
        });
    }

    fn handle_request_response(&self, stream_id: u32, payload: Payload) {
        let sender = StreamSender::unbounded();
        self.inner.senders.insert(stream_id, sender.clone());

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let work = inner.handler.request_response(payload);
            tokio::select! {
                _ = sender.canceled.cancelled() => {}
                result = work => match result {
                    Ok(Some(payload)) => match Frame::next_complete(stream_id, &payload) {
                        Ok(frame) => {
                            let _ = inner.send_frame(frame);
                        }
                        Err(error) => inner.send_error_frame(stream_id, &error),
                    },
                    Ok(None) => {
                        if let Ok(frame) = Frame::complete(stream_id) {
                            let _ = inner.send_frame(frame);
                        }
                    }
                    Err(error) => inner.send_error_frame(stream_id, &error),
                }
            }
            inner.remove_sender(stream_id);
        });
    }

    fn handle_stream(&self, stream_id: u32, stream: PayloadStream, initial_request_n: u32) {
        let sender = StreamSender::with_initial(initial_request_n);
        self.inner.senders.insert(stream_id, sender.clone());

        let inner = self.inner.clone();
        tokio::spawn(drive_stream(inner, stream_id, stream, sender));
    }

    fn handle_channel(&self, stream_id: u32, payload: Payload, initial_request_n: u32) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        self.inner.receivers.insert(stream_id, events_tx.clone());

        // The bootstrap payload must be queued before the handler can
        // observe the inbound stream, and is also passed to the handler
        // directly.
        let _ = events_tx.send(StreamEvent::Next(payload.clone()));

        let payloads = InboundPayloads::new(stream_id, events_rx, self.inner.clone());
        let stream = self.inner.handler.request_channel(payload, payloads);
        self.handle_stream(stream_id, stream, initial_request_n);
    }

    fn handle_metadata_push(&self, payload: Payload) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            if let Err(error) = inner.handler.metadata_push(payload).await {
                (inner.error_consumer)(error);
            }
        });
    }

    /// Fatal protocol violation: record the termination error, report a
    /// connection ERROR on stream 0, and ask the owner to tear down the
    /// connection.
    fn dispose_connection(&self, error: RSocketError) {
        self.inner.install_termination_error(replicate(&error));
        self.inner.state.store(STATE_TERMINATING, Ordering::Release);
        self.inner.send_error_frame(
            0,
            &RSocketError::Stream {
                code: error_codes::CONNECTION_ERROR,
                message: error.to_string(),
            },
        );
        (self.inner.error_consumer)(replicate(&error));
        (self.inner.disposer)();
    }

    /// Termination sweep: fail every receiver, cancel every sender, clear
    /// both maps, and dispose the handler. Runs at most once.
    pub fn terminate(&self, error: Option<RSocketError>) {
        if self.inner.sweep_started.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.state.store(STATE_TERMINATING, Ordering::Release);

        let termination_error = self
            .inner
            .install_termination_error(error.unwrap_or(RSocketError::ConnectionClosed));

        for (_, receiver) in self.inner.receivers.snapshot() {
            let _ = receiver.send(StreamEvent::Error(replicate(&termination_error)));
        }
        for (_, sender) in self.inner.senders.snapshot() {
            sender.cancel();
        }
        self.inner.senders.clear();
        self.inner.receivers.clear();

        self.inner.handler.dispose();
        self.inner.state.store(STATE_CLOSED, Ordering::Release);
    }

    /// Future-compat extension point; currently no behavior beyond the
    /// immediate dispose path.
    pub fn graceful_dispose(&self, _msg: &str) {}
}

/// Drive one outbound stream: pull from the handler's stream only while
/// credit is available, encode each item as NEXT, and finish with COMPLETE
/// or ERROR.
async fn drive_stream(
    inner: Arc<ResponderInner>,
    stream_id: u32,
    mut stream: PayloadStream,
    sender: StreamSender,
) {
    loop {
        tokio::select! {
            _ = sender.canceled.cancelled() => break,
            _ = sender.credit.acquire() => {}
        }

        let item = tokio::select! {
            _ = sender.canceled.cancelled() => break,
            item = stream.next() => item,
        };

        match item {
            Some(Ok(payload)) => match Frame::next(stream_id, &payload) {
                Ok(frame) => {
                    if inner.send_frame(frame).is_err() {
                        break;
                    }
                }
                Err(error) => {
                    inner.send_error_frame(stream_id, &error);
                    break;
                }
            },
            Some(Err(error)) => {
                inner.send_error_frame(stream_id, &error);
                break;
            }
            None => {
                if let Ok(frame) = Frame::complete(stream_id) {
                    let _ = inner.send_frame(frame);
                }
                break;
            }
        }
    }
    inner.remove_sender(stream_id);
}

/// Clone an error for delivery to multiple receivers. Errors that carry
/// non-clonable payloads collapse to their stream representation.
fn replicate(error: &RSocketError) -> RSocketError {
    match error {
        RSocketError::ConnectionClosed => RSocketError::ConnectionClosed,
        RSocketError::Canceled => RSocketError::Canceled,
        RSocketError::UnsupportedInteraction(interaction) => {
            RSocketError::UnsupportedInteraction(interaction)
        }
        RSocketError::Stream { code, message } => RSocketError::Stream {
            code: *code,
            message: message.clone(),
        },
        other => RSocketError::Stream {
            code: other.error_code(),
            message: other.to_string(),
        },
    }
}
