//! Ordered interceptor chains around the requester and responder sockets.
//!
//! Each interceptor maps a socket to a wrapped socket; composition is
//! left-to-right, so the first interceptor added runs outermost.

use std::sync::Arc;

use crate::rsocket::RSocket;

/// Interceptor over a socket: `X -> X`.
pub type RSocketInterceptor = Box<dyn Fn(Arc<dyn RSocket>) -> Arc<dyn RSocket> + Send + Sync>;

/// Registry of interceptor chains.
#[derive(Default)]
pub struct InterceptorRegistry {
    requesters: Vec<RSocketInterceptor>,
    responders: Vec<RSocketInterceptor>,
}

impl InterceptorRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a requester-side interceptor.
    pub fn add_requester(
        &mut self,
        interceptor: impl Fn(Arc<dyn RSocket>) -> Arc<dyn RSocket> + Send + Sync + 'static,
    ) {
        self.requesters.push(Box::new(interceptor));
    }

    /// Add a responder-side interceptor.
    pub fn add_responder(
        &mut self,
        interceptor: impl Fn(Arc<dyn RSocket>) -> Arc<dyn RSocket> + Send + Sync + 'static,
    ) {
        self.responders.push(Box::new(interceptor));
    }

    /// Wrap a requester socket with the registered chain; the first
    /// interceptor added ends up outermost.
    pub fn apply_requester(&self, socket: Arc<dyn RSocket>) -> Arc<dyn RSocket> {
        Self::apply(&self.requesters, socket)
    }

    /// Wrap a responder socket with the registered chain; the first
    /// interceptor added ends up outermost.
    pub fn apply_responder(&self, socket: Arc<dyn RSocket>) -> Arc<dyn RSocket> {
        Self::apply(&self.responders, socket)
    }

    fn apply(chain: &[RSocketInterceptor], mut socket: Arc<dyn RSocket>) -> Arc<dyn RSocket> {
        for interceptor in chain.iter().rev() {
            socket = interceptor(socket);
        }
        socket
    }
}
