//! Transport bridge: framed read loop, dedicated writer task, and the
//! connection handle tying responder and keep-alive together.
//!
//! # Architecture
//!
//! ```text
//! stream 1 ─┐
//! stream 2 ─┼─► mpsc::UnboundedSender<Bytes> ─► Writer Task ─► transport
//! keepalive ┘
//!
//! transport ─► Read Loop ─► FrameBuffer ─► Responder::handle_frame
//!                                      └─► KeepAlive::receive
//! ```
//!
//! The writer task is the outbound queue's sole consumer. It batches
//! whatever frames are ready into a single vectored write. A failure on
//! either loop disposes the connection and runs the termination sweep.

use std::io::IoSlice;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::backpressure::CancelFlag;
use crate::error::{error_codes, RSocketError, Result};
use crate::interceptor::InterceptorRegistry;
use crate::keepalive::KeepAlive;
use crate::protocol::{Frame, FrameBuffer, FrameType, DEFAULT_MAX_FRAME_SIZE};
use crate::responder::{logging_error_consumer, ConnectionState, ErrorConsumer, Responder};
use crate::rsocket::RSocket;

/// Default keep-alive probe interval.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(20);

/// Default keep-alive timeout window.
pub const DEFAULT_KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(90);

/// Maximum frames folded into a single vectored write.
const MAX_BATCH_SIZE: usize = 64;

/// Transport read buffer size.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Configuration for serving a connection.
pub struct ConnectionConfig {
    /// Keep-alive probe interval.
    pub keepalive_interval: Duration,
    /// Quiet window after which the connection is considered dead.
    pub keepalive_timeout: Duration,
    /// Maximum accepted inbound frame size.
    pub max_frame_size: usize,
    /// Sink for errors with no natural subscriber.
    pub error_consumer: ErrorConsumer,
    /// Interceptor chains applied to the handler.
    pub interceptors: InterceptorRegistry,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            keepalive_timeout: DEFAULT_KEEPALIVE_TIMEOUT,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            error_consumer: logging_error_consumer(),
            interceptors: InterceptorRegistry::new(),
        }
    }
}

/// A served responder connection over a duplex byte transport.
pub struct Connection {
    responder: Responder,
    shutdown: Arc<CancelFlag>,
    closed: Arc<CancelFlag>,
}

impl Connection {
    /// Drive a responder over `io`. Spawns the read loop, the writer task
    /// and the keep-alive timer; returns immediately.
    pub fn serve<S>(io: S, handler: Arc<dyn RSocket>, config: ConnectionConfig) -> Connection
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(io);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let shutdown = Arc::new(CancelFlag::new());
        let closed = Arc::new(CancelFlag::new());

        let max_frame_size = config.max_frame_size;
        let handler = config.interceptors.apply_responder(handler);
        let error_outbound = outbound_tx.clone();
        let responder = Responder::new(handler, outbound_tx.clone(), config.error_consumer, {
            let shutdown = shutdown.clone();
            move || shutdown.cancel()
        });
        let keep_alive = Arc::new(KeepAlive::new(
            config.keepalive_interval,
            config.keepalive_timeout,
            outbound_tx,
            Arc::new({
                let shutdown = shutdown.clone();
                move || shutdown.cancel()
            }),
        ));
        keep_alive.start();

        tokio::spawn({
            let shutdown = shutdown.clone();
            async move {
                if let Err(error) = write_loop(writer, outbound_rx, shutdown.clone()).await {
                    tracing::error!("writer task error: {error}");
                }
                shutdown.cancel();
            }
        });

        tokio::spawn({
            let responder = responder.clone();
            let shutdown = shutdown.clone();
            let closed = closed.clone();
            async move {
                let result = read_loop(
                    reader,
                    responder.clone(),
                    keep_alive.clone(),
                    shutdown.clone(),
                    max_frame_size,
                )
                .await;
                if let Err(error) = &result {
                    tracing::error!("read loop error: {error}");
                    // a malformed inbound frame earns the peer a connection
                    // ERROR; transport failures have no one left to tell
                    if !matches!(error, RSocketError::Io(_)) {
                        if let Ok(frame) =
                            Frame::error(0, error_codes::CONNECTION_ERROR, &error.to_string())
                        {
                            let _ = error_outbound.send(frame.into_bytes());
                        }
                    }
                }
                keep_alive.stop();
                shutdown.cancel();
                responder.terminate(result.err());
                closed.cancel();
            }
        });

        Connection {
            responder,
            shutdown,
            closed,
        }
    }

    /// Tear the connection down. The termination sweep follows.
    pub fn dispose(&self) {
        self.shutdown.cancel();
    }

    /// Resolve once the connection has fully terminated.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    /// Lifecycle state of the responder.
    pub fn state(&self) -> ConnectionState {
        self.responder.state()
    }

    /// The responder driving this connection.
    pub fn responder(&self) -> &Responder {
        &self.responder
    }
}

/// Read transport bytes, reassemble frames, and route them: KEEPALIVE to
/// the coordinator, everything else to the responder.
async fn read_loop<R>(
    mut reader: R,
    responder: Responder,
    keep_alive: Arc<KeepAlive>,
    shutdown: Arc<CancelFlag>,
    max_frame_size: usize,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut frame_buffer = FrameBuffer::with_max_frame_size(max_frame_size);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            n = reader.read(&mut buf) => n?,
        };
        if n == 0 {
            return Ok(());
        }

        for frame in frame_buffer.push(&buf[..n])? {
            if frame.stream_id() == 0 && matches!(frame.frame_type(), Ok(FrameType::Keepalive)) {
                keep_alive.receive(&frame);
            } else {
                responder.handle_frame(frame);
            }
        }
    }
}

/// Writer task: drain the outbound queue, batching ready frames into
/// vectored writes.
async fn write_loop<W>(
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
    shutdown: Arc<CancelFlag>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let first = tokio::select! {
            // frames already queued (a final connection ERROR among them)
            // are flushed before shutdown stops the writer
            biased;
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                // queue disposed, clean shutdown
                None => return Ok(()),
            },
            _ = shutdown.cancelled() => return Ok(()),
        };

        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match outbound.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        write_batch(&mut writer, &batch).await?;
    }
}

/// Write a batch of frames with a single vectored write where possible,
/// continuing from the partial-write offset otherwise.
async fn write_batch<W>(writer: &mut W, batch: &[Bytes]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if batch.is_empty() {
        return Ok(());
    }

    let total: usize = batch.iter().map(Bytes::len).sum();
    let mut written_total = 0;

    while written_total < total {
        let slices = remaining_slices(batch, written_total);
        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(RSocketError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        written_total += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Slice views over the unwritten tail of the batch.
fn remaining_slices(batch: &[Bytes], mut skip: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len());
    for frame in batch {
        if skip >= frame.len() {
            skip -= frame.len();
            continue;
        }
        slices.push(IoSlice::new(&frame[skip..]));
        skip = 0;
    }
    slices
}
