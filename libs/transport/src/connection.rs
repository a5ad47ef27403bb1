//! Connection Driver
//!
//! Runs one connection of a length-prefixed transport: a single reader turns
//! frames into requests and hands them to a
//! [`ConnectionDispatcher`](crate::dispatcher::ConnectionDispatcher) in wire
//! order, while a writer task drains released responses onto the socket.
//!
//! ```text
//! [reader] --frames--> dispatch --spawn--> handler tasks
//!                                               |
//!                                          complete()
//!                                               v
//! [socket] <--frames-- writer task <--channel-- sequencer
//! ```
//!
//! Frames carry a 4-byte big-endian length prefix. On clean end-of-stream the
//! driver gives outstanding handlers up to the configured drain timeout so
//! their responses still reach the peer. A read that returns end-of-stream
//! looks the same whether the peer half-closed or vanished, so the drain is
//! always bounded. Errors and dispatcher-requested closes tear the connection
//! down immediately and discard anything still buffered.

use crate::dispatcher::{CloseReason, Dispatcher, RequestHandler};
use crate::error::{Result, TransportError};
use crate::message::{RpcMessage, TransportType};
use crate::sequencer::ChannelSink;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const LENGTH_PREFIX_SIZE: usize = 4;

/// What happened over the lifetime of one connection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionSummary {
    pub requests: u64,
    pub responses_written: u64,
    pub discarded: usize,
}

/// Incremental length-prefixed frame reader.
///
/// Partial frames stay in the internal buffer, so `next_frame` can be
/// cancelled and resumed without losing bytes.
pub struct FrameReader<R> {
    reader: R,
    buffer: BytesMut,
    max_frame_size: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, max_frame_size: usize) -> Self {
        Self {
            reader,
            buffer: BytesMut::with_capacity(crate::DEFAULT_READ_BUFFER_SIZE),
            max_frame_size,
        }
    }

    /// Next complete frame, or `None` on clean end-of-stream
    pub async fn next_frame(&mut self) -> Result<Option<Bytes>> {
        loop {
            if let Some(frame) = self.parse_frame()? {
                return Ok(Some(frame));
            }

            let read = self.reader.read_buf(&mut self.buffer).await?;
            if read == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(TransportError::connection(format!(
                    "stream ended with {} bytes of an incomplete frame",
                    self.buffer.len()
                )));
            }
        }
    }

    fn parse_frame(&mut self) -> Result<Option<Bytes>> {
        if self.buffer.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let frame_len = u32::from_be_bytes([
            self.buffer[0],
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
        ]) as usize;

        if frame_len > self.max_frame_size {
            return Err(TransportError::protocol(format!(
                "Frame size {} exceeds maximum {}",
                frame_len, self.max_frame_size
            )));
        }

        let needed = LENGTH_PREFIX_SIZE + frame_len;
        if self.buffer.len() < needed {
            self.buffer.reserve(needed - self.buffer.len());
            return Ok(None);
        }

        self.buffer.advance(LENGTH_PREFIX_SIZE);
        Ok(Some(self.buffer.split_to(frame_len).freeze()))
    }
}

/// Write one length-prefixed frame into `out`
pub fn encode_frame(payload: &[u8], max_frame_size: usize, out: &mut BytesMut) -> Result<()> {
    if payload.len() > max_frame_size {
        return Err(TransportError::protocol(format!(
            "Response size {} exceeds maximum {}",
            payload.len(),
            max_frame_size
        )));
    }

    out.reserve(LENGTH_PREFIX_SIZE + payload.len());
    out.put_u32(payload.len() as u32);
    out.extend_from_slice(payload);
    Ok(())
}

/// Write released responses to `writer` until every sender is gone
async fn write_responses<W>(
    mut writer: W,
    mut responses: mpsc::UnboundedReceiver<RpcMessage>,
    max_frame_size: usize,
) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let mut frame = BytesMut::with_capacity(crate::DEFAULT_READ_BUFFER_SIZE);
    let mut written = 0u64;

    while let Some(response) = responses.recv().await {
        frame.clear();
        encode_frame(response.payload(), max_frame_size, &mut frame)?;
        writer
            .write_all(&frame)
            .await
            .map_err(|e| TransportError::connection_with_source("Failed to write response", e))?;
        written += 1;

        // Batch flushes while more released responses are queued
        if responses.is_empty() {
            writer.flush().await.map_err(|e| {
                TransportError::connection_with_source("Failed to flush responses", e)
            })?;
        }
    }

    writer.flush().await?;
    writer.shutdown().await?;
    Ok(written)
}

/// Serve one connection until the peer closes it, an error occurs, or the
/// dispatcher requests a close.
///
/// Returns the summary when the connection ended cleanly. A
/// handler timeout surfaces as [`TransportError::Timeout`], other
/// dispatcher-requested closes as [`TransportError::Closed`], and handlers
/// outliving the drain timeout as a `Timeout` for the drain.
pub async fn serve_connection<R, W, H>(
    reader: R,
    writer: W,
    dispatcher: &Dispatcher<H>,
    transport_type: TransportType,
) -> Result<ConnectionSummary>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send + 'static,
    H: RequestHandler,
{
    if !transport_type.is_length_prefixed() {
        return Err(TransportError::configuration(
            format!("{} transport cannot be served without a protocol decoder", transport_type),
            Some("transport"),
        ));
    }

    let config = dispatcher.config().clone();
    config.validate()?;

    let (sink, responses) = ChannelSink::new();
    let mut connection = dispatcher.open_connection(sink);
    let close = connection.close_signal();

    let writer_close = connection.close_signal();
    let max_frame_size = config.max_frame_size;
    let writer_task = tokio::spawn(async move {
        let result = write_responses(writer, responses, max_frame_size).await;
        if let Err(e) = &result {
            warn!(error = %e, "Response writer failed, closing connection");
            writer_close.request(CloseReason::WriterFailed);
        }
        result
    });

    info!(transport = %transport_type, "Connection opened");

    let mut frames = FrameReader::new(reader, config.max_frame_size);
    let mut stall_timer = tokio::time::interval(config.stall_warning());
    let mut summary = ConnectionSummary::default();
    let mut failure: Option<TransportError> = None;
    let mut end_of_stream = false;

    loop {
        tokio::select! {
            frame = frames.next_frame() => match frame {
                Ok(Some(payload)) => {
                    connection.dispatch(RpcMessage::new(payload, transport_type));
                    summary.requests += 1;
                }
                Ok(None) => {
                    end_of_stream = true;
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to read request");
                    failure = Some(e);
                    break;
                }
            },
            true = connection.join_next_task(), if connection.running_tasks() > 0 => {}
            _ = close.wait() => {
                debug!("Close requested");
                break;
            }
            _ = stall_timer.tick() => {
                connection.check_stalls();
            }
        }
    }

    if end_of_stream && !close.is_requested() {
        // Peer finished sending; let outstanding handlers answer
        let drain_timeout = config.drain_timeout();
        let drain_deadline = tokio::time::sleep(drain_timeout);
        tokio::pin!(drain_deadline);

        loop {
            tokio::select! {
                _ = connection.wait_idle() => break,
                _ = close.wait() => break,
                _ = &mut drain_deadline => {
                    warn!(
                        running = connection.running_tasks(),
                        "Handlers still running after peer stopped sending, abandoning them"
                    );
                    failure = Some(TransportError::timeout(
                        "draining requests after end of stream",
                        drain_timeout.as_millis() as u64,
                    ));
                    break;
                }
                _ = stall_timer.tick() => {
                    connection.check_stalls();
                }
            }
        }
    }

    summary.discarded = connection.close().await;
    drop(connection);

    match writer_task.await {
        Ok(Ok(written)) => summary.responses_written = written,
        Ok(Err(e)) => {
            failure.get_or_insert(e);
        }
        Err(e) => {
            failure.get_or_insert(TransportError::connection_with_source(
                "Response writer task failed",
                e,
            ));
        }
    }

    info!(
        requests = summary.requests,
        responses = summary.responses_written,
        discarded = summary.discarded,
        reason = ?close.reason(),
        "Connection closed"
    );

    if let Some(reason) = close.reason() {
        failure.get_or_insert_with(|| close_error(reason));
    }

    match failure {
        Some(e) => Err(e),
        None => Ok(summary),
    }
}

fn close_error(reason: CloseReason) -> TransportError {
    match reason {
        CloseReason::Requested => TransportError::closed("close requested by server"),
        CloseReason::TaskTimeout { sequence, timeout_ms } => {
            TransportError::timeout(format!("request handler for sequence {sequence}"), timeout_ms)
        }
        CloseReason::HandlerPanic => TransportError::closed("request handler panicked"),
        CloseReason::WriterFailed => TransportError::closed("response writer failed"),
    }
}
