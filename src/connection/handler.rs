//! Connection Handler Module
//!
//! This module handles individual client connections. Each client gets its
//! own handler task that runs in a loop, cutting frames out of the byte
//! stream, dispatching them and writing the responses back in order.
//!
//! ## Connection Lifecycle
//!
//! ```text
//! 1. Client connects (stream handed over by the listener)
//!        │
//!        ▼
//! 2. ConnectionHandler spawned, root OpContext created
//!        │
//!        ▼
//! 3. ┌──────────────────────────────┐
//!    │      Main Loop               │
//!    │                              │
//!    │  ┌─────────────────────────┐ │
//!    │  │ Read bytes from stream  │ │
//!    │  └───────────┬─────────────┘ │
//!    │              ▼               │
//!    │  ┌─────────────────────────┐ │
//!    │  │ Split at sentinel       │ │
//!    │  └───────────┬─────────────┘ │
//!    │              ▼               │
//!    │  ┌─────────────────────────┐ │
//!    │  │ Decode + execute        │ │──> unknown opcode: drop frame
//!    │  └───────────┬─────────────┘ │
//!    │              ▼               │
//!    │  ┌─────────────────────────┐ │
//!    │  │ Send response           │ │
//!    │  └───────────┬─────────────┘ │
//!    │              ▼               │
//!    │         [Loop back]          │
//!    └──────────────────────────────┘
//!        │
//!        ▼
//! 4. Client disconnects / error
//!        │
//!        ▼
//! 5. Handler dropped: root context cancelled, task ends
//! ```
//!
//! ## Buffer Management
//!
//! A BytesMut buffer accumulates incoming data. The stream gives no
//! guarantee about read boundaries, so a frame may arrive in pieces or
//! several frames may arrive in one read.
//!
//! ## Teardown
//!
//! The root context is cancelled when the handler is dropped, not when
//! `run` returns. An aborted connection task therefore still cancels the
//! storage call it was waiting on.

use crate::commands::CommandHandler;
use crate::protocol::{DecodeError, FrameParser, ParseError, Request, Response};
use crate::storage::OpContext;
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tracing::{debug, info, trace, warn};

/// Initial buffer capacity
const INITIAL_BUFFER_SIZE: usize = 4096;

/// Statistics for connection handling
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Total number of connections accepted
    pub connections_accepted: AtomicU64,
    /// Currently active connections
    pub active_connections: AtomicU64,
    /// Total commands answered
    pub commands_processed: AtomicU64,
    /// Commands answered with `'N'`
    pub commands_failed: AtomicU64,
    /// Frames dropped without a response
    pub frames_discarded: AtomicU64,
    /// Total bytes read
    pub bytes_read: AtomicU64,
    /// Total bytes written
    pub bytes_written: AtomicU64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn command_processed(&self, response: &Response) {
        self.commands_processed.fetch_add(1, Ordering::Relaxed);
        if !response.is_ok() {
            self.commands_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn frame_discarded(&self) {
        self.frames_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_read(&self, count: usize) {
        self.bytes_read.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn bytes_written(&self, count: usize) {
        self.bytes_written
            .fetch_add(count as u64, Ordering::Relaxed);
    }
}

/// Handles a single client connection.
///
/// Generic over the transport so the same state machine serves TLS streams,
/// plain TCP and in-memory pipes.
pub struct ConnectionHandler<S> {
    /// The client stream
    stream: BufWriter<S>,

    /// Client's address (for logging)
    addr: SocketAddr,

    /// Buffer for incoming data
    buffer: BytesMut,

    /// The command handler (shared across connections)
    command_handler: CommandHandler,

    /// Frame splitter
    parser: FrameParser,

    /// Parent of every operation context on this connection
    root: OpContext,

    /// Connection statistics (shared)
    stats: Arc<ConnectionStats>,
}

impl<S> ConnectionHandler<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Creates a new connection handler.
    ///
    /// # Arguments
    ///
    /// * `stream` - The byte stream for this connection
    /// * `addr` - The client's socket address
    /// * `command_handler` - The command handler for executing commands
    /// * `stats` - Shared connection statistics
    pub fn new(
        stream: S,
        addr: SocketAddr,
        command_handler: CommandHandler,
        stats: Arc<ConnectionStats>,
    ) -> Self {
        stats.connection_opened();

        Self {
            stream: BufWriter::new(stream),
            addr,
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            command_handler,
            parser: FrameParser::new(),
            root: OpContext::background(),
            stats,
        }
    }

    /// Replaces the default frame splitter, e.g. to change the size limit.
    pub fn with_parser(mut self, parser: FrameParser) -> Self {
        self.parser = parser;
        self
    }

    /// The context cancelled when this connection ends.
    pub fn root_context(&self) -> &OpContext {
        &self.root
    }

    /// Runs the main connection loop.
    ///
    /// Reads frames from the client, executes them, and sends back responses
    /// until the client disconnects or an error occurs.
    pub async fn run(mut self) -> Result<(), ConnectionError> {
        info!(client = %self.addr, "Client connected");

        let result = self.main_loop().await;

        match &result {
            Ok(()) => info!(client = %self.addr, "Client disconnected gracefully"),
            Err(e) => match e {
                ConnectionError::ClientDisconnected => {
                    debug!(client = %self.addr, "Client disconnected")
                }
                ConnectionError::IoError(io_err)
                    if io_err.kind() == std::io::ErrorKind::ConnectionReset =>
                {
                    debug!(client = %self.addr, "Connection reset by client")
                }
                _ => warn!(client = %self.addr, error = %e, "Connection error"),
            },
        }

        result
    }

    /// Runs the connection, swallowing the errors that just mean the client
    /// went away.
    pub async fn serve(self) {
        let addr = self.addr;
        if let Err(e) = self.run().await {
            match e {
                ConnectionError::ClientDisconnected => {}
                ConnectionError::IoError(ref io_err)
                    if io_err.kind() == std::io::ErrorKind::ConnectionReset => {}
                _ => {
                    debug!(client = %addr, error = %e, "Connection ended with error");
                }
            }
        }
    }

    /// The main read-execute-respond loop.
    async fn main_loop(&mut self) -> Result<(), ConnectionError> {
        loop {
            while let Some(frame) = self.try_parse_frame()? {
                self.process_frame(&frame).await?;
            }

            self.read_more_data().await?;
        }
    }

    /// Attempts to cut a complete frame out of the buffer.
    fn try_parse_frame(&mut self) -> Result<Option<BytesMut>, ConnectionError> {
        if self.buffer.is_empty() {
            return Ok(None);
        }

        match self.parser.parse(&mut self.buffer)? {
            Some(frame) => {
                trace!(
                    client = %self.addr,
                    consumed = frame.len(),
                    remaining = self.buffer.len(),
                    "Parsed frame"
                );
                Ok(Some(frame))
            }
            None => {
                trace!(
                    client = %self.addr,
                    buffered = self.buffer.len(),
                    "Incomplete frame, need more data"
                );
                Ok(None)
            }
        }
    }

    /// Decodes and answers one frame.
    async fn process_frame(&mut self, frame: &[u8]) -> Result<(), ConnectionError> {
        let response = match Request::decode(frame) {
            Ok(request) => {
                debug!(client = %self.addr, op = %request.opcode(), "Executing command");
                self.command_handler.execute(&self.root, request).await
            }
            Err(DecodeError::UnknownOpcode(tag)) => {
                warn!(client = %self.addr, opcode = %tag, "Unknown opcode, frame dropped");
                self.stats.frame_discarded();
                return Ok(());
            }
            Err(e) => {
                warn!(client = %self.addr, error = %e, "Malformed frame");
                Response::error(e.to_string())
            }
        };

        self.stats.command_processed(&response);
        self.send_response(&response).await
    }

    /// Reads more data from the stream into the buffer.
    async fn read_more_data(&mut self) -> Result<(), ConnectionError> {
        // Ensure we have some capacity
        if self.buffer.capacity() - self.buffer.len() < 1024 {
            self.buffer.reserve(INITIAL_BUFFER_SIZE);
        }

        let n = self.stream.get_mut().read_buf(&mut self.buffer).await?;

        if n == 0 {
            if self.buffer.is_empty() {
                return Err(ConnectionError::ClientDisconnected);
            } else {
                // Partial frame in buffer
                return Err(ConnectionError::UnexpectedEof);
            }
        }

        self.stats.bytes_read(n);
        trace!(client = %self.addr, bytes = n, "Read data");

        Ok(())
    }

    /// Sends a response to the client.
    async fn send_response(&mut self, response: &Response) -> Result<(), ConnectionError> {
        let bytes = response.encode();
        self.stream.write_all(&bytes).await?;
        self.stream.flush().await?;
        self.stats.bytes_written(bytes.len());
        trace!(
            client = %self.addr,
            bytes = bytes.len(),
            "Sent response"
        );
        Ok(())
    }
}

impl<S> Drop for ConnectionHandler<S> {
    fn drop(&mut self) {
        self.root.cancel();
        self.stats.connection_closed();
    }
}

/// Errors that can occur while handling a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// I/O error (network issue)
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Client disconnected normally
    #[error("Client disconnected")]
    ClientDisconnected,

    /// Unexpected end of stream (partial frame)
    #[error("Unexpected end of stream")]
    UnexpectedEof,

    /// No sentinel within the frame size limit
    #[error(transparent)]
    FrameTooLarge(#[from] ParseError),
}

/// Handles a client connection.
///
/// Creates a ConnectionHandler with default settings and serves it to
/// completion.
pub async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    command_handler: CommandHandler,
    stats: Arc<ConnectionStats>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    ConnectionHandler::new(stream, addr, command_handler, stats)
        .serve()
        .await
}
