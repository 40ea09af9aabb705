//! The handler contract: one trait per socket, one method per interaction
//! model.
//!
//! A handler implements only the interactions it serves; the default
//! bodies reject with [`RSocketError::UnsupportedInteraction`], which the
//! responder surfaces as the interaction's error.
//!
//! # Example
//!
//! ```
//! use rsocket_engine::{Payload, RSocket, BoxFuture, Result};
//!
//! struct Echo;
//!
//! impl RSocket for Echo {
//!     fn request_response(&self, payload: Payload) -> BoxFuture<'static, Result<Option<Payload>>> {
//!         Box::pin(async move { Ok(Some(payload)) })
//!     }
//! }
//! ```

use std::future::Future;
use std::pin::Pin;

use futures::stream;
use futures::Stream;

use crate::channel::InboundPayloads;
use crate::error::{RSocketError, Result};
use crate::payload::Payload;

/// Boxed future, as returned by handler methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Ordered sequence of payloads terminated by completion or an error.
pub type PayloadStream = Pin<Box<dyn Stream<Item = Result<Payload>> + Send>>;

/// A payload stream that fails immediately.
pub fn error_stream(error: RSocketError) -> PayloadStream {
    Box::pin(stream::iter([Err(error)]))
}

/// Responder-side request handler.
///
/// Each method is invoked once per inbound request frame. Stream-returning
/// methods are driven under credit-based backpressure: items are pulled
/// only while the peer has granted credit.
pub trait RSocket: Send + Sync + 'static {
    /// Handle a fire-and-forget request. The completion is observed
    /// locally; nothing is sent back to the peer.
    fn fire_and_forget(&self, payload: Payload) -> BoxFuture<'static, Result<()>> {
        let _ = payload;
        Box::pin(async { Err(RSocketError::UnsupportedInteraction("fire_and_forget")) })
    }

    /// Handle a request expecting at most one payload in response.
    /// `Ok(None)` completes the stream without a payload.
    fn request_response(&self, payload: Payload) -> BoxFuture<'static, Result<Option<Payload>>> {
        let _ = payload;
        Box::pin(async { Err(RSocketError::UnsupportedInteraction("request_response")) })
    }

    /// Handle a request expecting a stream of payloads in response.
    fn request_stream(&self, payload: Payload) -> PayloadStream {
        let _ = payload;
        error_stream(RSocketError::UnsupportedInteraction("request_stream"))
    }

    /// Handle a bidirectional channel. `payload` is the bootstrap payload;
    /// it is also delivered as the first element of `payloads`.
    fn request_channel(&self, payload: Payload, payloads: InboundPayloads) -> PayloadStream {
        let _ = (payload, payloads);
        error_stream(RSocketError::UnsupportedInteraction("request_channel"))
    }

    /// Handle a metadata push. Nothing is sent back to the peer.
    fn metadata_push(&self, payload: Payload) -> BoxFuture<'static, Result<()>> {
        let _ = payload;
        Box::pin(async { Err(RSocketError::UnsupportedInteraction("metadata_push")) })
    }

    /// Release handler resources. Called once during the termination sweep.
    fn dispose(&self) {}
}
