//! Client-side command encoder
//!
//! [`Client`] validates inputs the same way the server does, so a bad key
//! never leaves the process, then sends one frame and waits for exactly one
//! response.
//!
//! ## Example
//!
//! ```ignore
//! use keyval::client::Client;
//!
//! let mut client = Client::connect("127.0.0.1:6842").await?;
//! client.set("name", "value1").await?;
//! assert_eq!(client.get("name").await?, "value1");
//! ```

use crate::protocol::{
    split_frame, validate_key, validate_record, DecodeError, Request, Response, ValidationError,
};
use crate::storage::Record;
use bytes::{Bytes, BytesMut};
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::{debug, warn};

/// Errors returned by [`Client`] calls.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The input was rejected before anything was sent
    #[error("invalid input: {0}")]
    Validation(#[from] ValidationError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The server's reply could not be parsed
    #[error("malformed response: {0}")]
    Decode(#[from] DecodeError),

    /// An import or export payload was not valid JSON
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// The server answered with `'N'`
    #[error("server error: {0}")]
    Server(String),

    /// No response arrived in time
    #[error("no response within {}ms", .0.as_millis())]
    Timeout(Duration),

    /// The server closed the connection before answering
    #[error("connection closed by server")]
    ConnectionClosed,

    /// A previous call timed out, so responses can no longer be matched to
    /// requests on this connection
    #[error("connection desynchronized by an earlier timeout")]
    Desynchronized,
}

pub type ClientResult<T> = Result<T, ClientError>;

/// A connection to a key-value server.
pub struct Client<S> {
    stream: S,
    buffer: BytesMut,
    timeout: Option<Duration>,
    desynchronized: bool,
}

impl Client<TcpStream> {
    /// Connects over plain TCP.
    pub async fn connect(addr: impl ToSocketAddrs) -> ClientResult<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream))
    }
}

impl<S> Client<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wraps an already established stream.
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buffer: BytesMut::with_capacity(4096),
            timeout: None,
            desynchronized: false,
        }
    }

    /// Bounds how long each call waits for its response.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Returns the value for `key`, or the empty string if absent.
    pub async fn get(&mut self, key: &str) -> ClientResult<String> {
        validate_key(key.as_bytes())?;
        let payload = self
            .call(Request::Get {
                key: Bytes::copy_from_slice(key.as_bytes()),
            })
            .await?;
        String::from_utf8(payload.to_vec())
            .map_err(|e| ClientError::Io(io::Error::new(io::ErrorKind::InvalidData, e)))
    }

    pub async fn set(&mut self, key: &str, value: &str) -> ClientResult<()> {
        validate_record(key.as_bytes(), value.as_bytes())?;
        self.call(Request::Set {
            key: Bytes::copy_from_slice(key.as_bytes()),
            value: Bytes::copy_from_slice(value.as_bytes()),
        })
        .await?;
        Ok(())
    }

    pub async fn delete(&mut self, key: &str) -> ClientResult<()> {
        validate_key(key.as_bytes())?;
        self.call(Request::Delete {
            key: Bytes::copy_from_slice(key.as_bytes()),
        })
        .await?;
        Ok(())
    }

    /// Sends `records` to be applied in order.
    pub async fn import(&mut self, records: &[Record]) -> ClientResult<()> {
        for record in records {
            validate_record(record.key.as_bytes(), record.value.as_bytes())?;
        }
        let payload = serde_json::to_vec(records)?;
        self.call(Request::Import {
            payload: Bytes::from(payload),
        })
        .await?;
        Ok(())
    }

    /// Parses a JSON array of `{"key", "value"}` objects and imports it.
    pub async fn import_json(&mut self, json: &str) -> ClientResult<()> {
        let records: Vec<Record> = serde_json::from_str(json)?;
        self.import(&records).await
    }

    /// Fetches every record on the server.
    pub async fn export(&mut self) -> ClientResult<Vec<Record>> {
        let payload = self.call(Request::Export).await?;
        if payload.is_empty() {
            return Ok(Vec::new());
        }
        let records: Option<Vec<Record>> = serde_json::from_slice(&payload)?;
        Ok(records.unwrap_or_default())
    }

    /// Sends one request and returns the payload of its `'O'` response.
    async fn call(&mut self, request: Request) -> ClientResult<Bytes> {
        if self.desynchronized {
            return Err(ClientError::Desynchronized);
        }

        let op = request.opcode();
        let frame = request.encode();

        let response = match self.timeout {
            Some(timeout) => {
                let outcome = tokio::time::timeout(timeout, self.exchange(&frame)).await;
                match outcome {
                    Ok(result) => result?,
                    Err(_) => {
                        // A late response would be read as the answer to the next call
                        self.desynchronized = true;
                        warn!(%op, timeout_ms = timeout.as_millis() as u64, "Request timed out");
                        return Err(ClientError::Timeout(timeout));
                    }
                }
            }
            None => self.exchange(&frame).await?,
        };

        debug!(%op, ok = response.is_ok(), "Received response");
        match response {
            Response::Ok(payload) => Ok(payload),
            Response::Err(message) => Err(ClientError::Server(message)),
        }
    }

    async fn exchange(&mut self, frame: &[u8]) -> ClientResult<Response> {
        self.stream.write_all(frame).await?;
        self.stream.flush().await?;

        loop {
            if let Some(frame) = split_frame(&mut self.buffer) {
                return Ok(Response::decode(&frame)?);
            }
            if self.stream.read_buf(&mut self.buffer).await? == 0 {
                return Err(ClientError::ConnectionClosed);
            }
        }
    }
}
