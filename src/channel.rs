//! Inbound payload stream for REQUEST_CHANNEL interactions.
//!
//! [`InboundPayloads`] is the single-subscriber unicast queue the responder
//! registers as a stream's receiver and hands to the channel handler. It
//! holds only an enqueue handle toward the outbound frame queue, so credit
//! grants and cancellation travel back to the peer as messages rather than
//! through shared ownership of the queue.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::payload::Payload;
use crate::protocol::Frame;
use crate::responder::{ResponderInner, StreamEvent};

/// Ordered inbound payloads for one channel, pulled by the handler.
///
/// Dropping the stream before a terminal signal cancels the channel: an
/// outbound CANCEL frame is emitted and subsequent peer frames for the
/// stream are dropped silently.
pub struct InboundPayloads {
    stream_id: u32,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    core: Arc<ResponderInner>,
    terminated: bool,
}

impl InboundPayloads {
    pub(crate) fn new(
        stream_id: u32,
        events: mpsc::UnboundedReceiver<StreamEvent>,
        core: Arc<ResponderInner>,
    ) -> Self {
        Self {
            stream_id,
            events,
            core,
            terminated: false,
        }
    }

    /// Stream id of this channel.
    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    /// Grant the peer credit for `n` further payloads (REQUEST_N).
    pub fn request(&self, n: u32) {
        if self.terminated {
            return;
        }
        if let Ok(frame) = Frame::request_n(self.stream_id, n) {
            let _ = self.core.send_frame(frame);
        }
    }

    /// Receive the next payload, or `None` once the peer completed.
    /// A remote error is yielded once, after which the stream is done.
    pub async fn next_payload(&mut self) -> Option<Result<Payload>> {
        futures::future::poll_fn(|cx| Pin::new(&mut *self).poll_next(cx)).await
    }

    fn finish(&mut self) {
        if !self.terminated {
            self.terminated = true;
            self.core.remove_receiver(self.stream_id);
        }
    }
}

impl Stream for InboundPayloads {
    type Item = Result<Payload>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.terminated {
            return Poll::Ready(None);
        }
        match std::task::ready!(this.events.poll_recv(cx)) {
            Some(StreamEvent::Next(payload)) => Poll::Ready(Some(Ok(payload))),
            Some(StreamEvent::Error(error)) => {
                this.finish();
                Poll::Ready(Some(Err(error)))
            }
            Some(StreamEvent::Complete) | None => {
                this.finish();
                Poll::Ready(None)
            }
        }
    }
}

impl Drop for InboundPayloads {
    fn drop(&mut self) {
        if self.terminated || self.core.is_terminating() {
            return;
        }
        if let Ok(frame) = Frame::cancel(self.stream_id) {
            let _ = self.core.send_frame(frame);
        }
        self.core.remove_receiver(self.stream_id);
    }
}
