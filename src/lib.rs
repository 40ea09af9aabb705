//! # rsocket-engine
//!
//! Responder-side core of the RSocket protocol: a symmetric, bidirectional,
//! multiplexed messaging protocol over a duplex byte transport.
//!
//! The engine covers:
//!
//! - **Frame codec** (`protocol`): bit-exact binary layout with a 24-bit
//!   length prefix, 6/10-bit type-and-flags split, per-type payload
//!   offsets, and zero-copy metadata/data slices.
//! - **Responder multiplexer** (`responder`): demultiplexes inbound frames
//!   by stream id, drives the four interaction models against a user
//!   [`RSocket`] handler under credit-based backpressure, and fails all
//!   in-flight streams on connection loss.
//! - **Keep-alive coordinator** (`keepalive`): periodic liveness probes
//!   with a timeout action, tolerant to connection pause/resume.
//! - **Transport bridge** (`connection`): framed read loop and batching
//!   writer task over any `AsyncRead + AsyncWrite` pair.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use bytes::Bytes;
//! use rsocket_engine::{
//!     BoxFuture, Connection, ConnectionConfig, Payload, RSocket, Result,
//! };
//!
//! struct Echo;
//!
//! impl RSocket for Echo {
//!     fn request_response(&self, payload: Payload) -> BoxFuture<'static, Result<Option<Payload>>> {
//!         Box::pin(async move { Ok(Some(payload)) })
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let transport = tokio::net::TcpStream::connect("127.0.0.1:7878").await?;
//!     let connection = Connection::serve(transport, Arc::new(Echo), ConnectionConfig::default());
//!     connection.closed().await;
//!     Ok(())
//! }
//! ```

pub mod backpressure;
pub mod channel;
pub mod connection;
pub mod error;
pub mod interceptor;
pub mod keepalive;
pub mod payload;
pub mod protocol;
pub mod registry;
pub mod responder;
pub mod rsocket;

pub use channel::InboundPayloads;
pub use connection::{Connection, ConnectionConfig};
pub use error::{error_codes, RSocketError, Result};
pub use interceptor::InterceptorRegistry;
pub use keepalive::KeepAlive;
pub use payload::Payload;
pub use responder::{ConnectionState, ErrorConsumer, Responder};
pub use rsocket::{BoxFuture, PayloadStream, RSocket};
