//! Wire Protocol Implementation
//!
//! This module implements the sentinel-framed binary protocol spoken between
//! the server and its clients. The same encoders and decoders are used on
//! both sides of the connection.
//!
//! ## Modules
//!
//! - `types`: Opcodes, `Request`/`Response` frames and their byte layout
//! - `parser`: Splits a byte stream into sentinel-terminated frames
//!
//! ## Example
//!
//! ```
//! use keyval::protocol::{split_frame, Request, Response};
//! use bytes::{Bytes, BytesMut};
//!
//! // Client side: encode a request
//! let frame = Request::Get { key: Bytes::from("name") }.encode();
//! assert_eq!(frame.len(), 772);
//!
//! // Server side: cut it out of the stream and decode it
//! let mut buf = BytesMut::from(&frame[..]);
//! let raw = split_frame(&mut buf).unwrap();
//! assert_eq!(Request::decode(&raw).unwrap(), Request::Get { key: Bytes::from("name") });
//!
//! // Responses are a status byte, a payload and the sentinel
//! assert_eq!(&Response::with_payload("value1").encode()[..], b"Ovalue1\x04");
//! ```

pub mod parser;
pub mod types;

// Re-export commonly used types for convenience
pub use parser::{split_frame, FrameParser, ParseError, ParseResult, DEFAULT_MAX_FRAME_SIZE};
pub use types::{
    trim_field, validate_key, validate_record, validate_value, DecodeError, Opcode, Request,
    Response, ValidationError, FIXED_FRAME_LEN, MAX_KEY_LEN, MAX_VALUE_LEN, NUL, SENTINEL,
    STATUS_ERR, STATUS_OK,
};
