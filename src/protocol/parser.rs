//! Sentinel-Delimited Frame Splitter
//!
//! TCP (and TLS on top of it) is a byte stream: a single read can return
//! half a frame, or several frames back to back. This module cuts complete
//! frames out of an accumulation buffer so that the caller never has to
//! care where the read boundaries fell.
//!
//! ## How the Splitter Works
//!
//! The splitter scans the buffer for the sentinel byte and returns either:
//! - `Ok(Some(frame))` - A complete frame (sentinel included) was removed from the buffer
//! - `Ok(None)` - No sentinel yet, the caller must read more data
//! - `Err(ParseError)` - The buffered bytes exceed the frame size limit
//!
//! Fixed frames never contain the sentinel before their last byte, so the
//! same rule covers both frame shapes. The splitter is used unchanged by
//! the server connection loop and by the client.

use crate::protocol::types::SENTINEL;
use bytes::BytesMut;
use thiserror::Error;

/// Default upper bound for a single frame (16 MiB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Errors that can occur while splitting frames.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// No sentinel was found within the size limit
    #[error("frame too large: {size} bytes buffered without terminator (max: {max})")]
    FrameTooLarge { size: usize, max: usize },
}

/// Result type for splitting operations.
pub type ParseResult<T> = Result<T, ParseError>;

/// Incremental frame splitter.
///
/// Remembers how far the previous scan got so that a large variable frame
/// arriving in many small reads is scanned only once.
#[derive(Debug)]
pub struct FrameParser {
    /// Number of leading bytes already known not to contain the sentinel
    scanned: usize,
    /// Largest frame accepted before giving up on the stream
    max_frame_size: usize,
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameParser {
    /// Creates a splitter with the default frame size limit.
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Creates a splitter with a custom frame size limit.
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            scanned: 0,
            max_frame_size,
        }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Removes the next complete frame from `buf`.
    pub fn parse(&mut self, buf: &mut BytesMut) -> ParseResult<Option<BytesMut>> {
        let start = self.scanned.min(buf.len());

        match buf[start..].iter().position(|&b| b == SENTINEL) {
            Some(offset) => {
                self.scanned = 0;
                Ok(Some(buf.split_to(start + offset + 1)))
            }
            None if buf.len() > self.max_frame_size => Err(ParseError::FrameTooLarge {
                size: buf.len(),
                max: self.max_frame_size,
            }),
            None => {
                self.scanned = buf.len();
                Ok(None)
            }
        }
    }
}

/// Removes one complete frame from `buf` without any size limit.
///
/// Convenience wrapper for callers that read a single bounded response.
pub fn split_frame(buf: &mut BytesMut) -> Option<BytesMut> {
    let end = buf.iter().position(|&b| b == SENTINEL)?;
    Some(buf.split_to(end + 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::{Request, FIXED_FRAME_LEN};
    use bytes::Bytes;

    #[test]
    fn test_split_single_frame() {
        let mut buf = BytesMut::from(&b"exp\x04"[..]);
        let frame = split_frame(&mut buf).unwrap();
        assert_eq!(&frame[..], b"exp\x04");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_split_incomplete() {
        let mut buf = BytesMut::from(&b"imp[{\"key\":"[..]);
        assert!(split_frame(&mut buf).is_none());
        assert_eq!(buf.len(), 11);
    }

    #[test]
    fn test_split_back_to_back_frames() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(
            &Request::Get {
                key: Bytes::from("a"),
            }
            .encode(),
        );
        buf.extend_from_slice(b"exp\x04");

        let first = split_frame(&mut buf).unwrap();
        assert_eq!(first.len(), FIXED_FRAME_LEN);
        let second = split_frame(&mut buf).unwrap();
        assert_eq!(&second[..], b"exp\x04");
        assert!(split_frame(&mut buf).is_none());
    }

    #[test]
    fn test_parser_resumes_across_reads() {
        let mut parser = FrameParser::new();
        let frame = Request::Set {
            key: Bytes::from("key100000"),
            value: Bytes::from("value100000"),
        }
        .encode();

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&frame[..400]);
        assert_eq!(parser.parse(&mut buf).unwrap(), None);

        buf.extend_from_slice(&frame[400..]);
        let parsed = parser.parse(&mut buf).unwrap().unwrap();
        assert_eq!(parsed, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_parser_frame_too_large() {
        let mut parser = FrameParser::with_max_frame_size(8);
        let mut buf = BytesMut::from(&b"imp0123456789"[..]);
        assert_eq!(
            parser.parse(&mut buf),
            Err(ParseError::FrameTooLarge { size: 13, max: 8 })
        );
    }

    #[test]
    fn test_parser_limit_applies_only_without_terminator() {
        let mut parser = FrameParser::with_max_frame_size(4);
        let mut buf = BytesMut::from(&b"exp\x04exp\x04"[..]);
        assert_eq!(&parser.parse(&mut buf).unwrap().unwrap()[..], b"exp\x04");
        assert_eq!(&parser.parse(&mut buf).unwrap().unwrap()[..], b"exp\x04");
    }
}
