//! Wire Protocol Data Types
//!
//! This module defines the frames exchanged between client and server.
//! Every frame starts with a 3-byte ASCII tag and ends with a single
//! sentinel byte (ASCII EOT). There is no length prefix.
//!
//! ## Request Frames
//!
//! ```text
//! get/set/del (fixed, 772 bytes):
//! ┌────────┬──────────────────────┬──────────────────────────┬─────┐
//! │ op (3) │ key (256, NUL-padded)│ value (512, NUL-padded)  │ EOT │
//! └────────┴──────────────────────┴──────────────────────────┴─────┘
//!
//! exp:  ┌────────┬─────┐        imp:  ┌────────┬────────────────┬─────┐
//!       │ op (3) │ EOT │              │ op (3) │ JSON array ... │ EOT │
//!       └────────┴─────┘              └────────┴────────────────┴─────┘
//! ```
//!
//! ## Response Frames
//!
//! ```text
//! ┌────────────┬──────────────────────────────┬─────┐
//! │ 'O' or 'N' │ value / JSON / error message │ EOT │
//! └────────────┴──────────────────────────────┴─────┘
//! ```
//!
//! Because the sentinel delimits frames, keys, values and payloads may
//! never contain the sentinel byte or NUL.

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use thiserror::Error;

/// Frame terminator (ASCII EOT)
pub const SENTINEL: u8 = 0x04;

/// Padding byte for fixed-width fields
pub const NUL: u8 = 0x00;

/// Length of the opcode tag
pub const OPCODE_LEN: usize = 3;

/// Width of the key field in a fixed frame
pub const KEY_FIELD_LEN: usize = 256;

/// Width of the value field in a fixed frame
pub const VALUE_FIELD_LEN: usize = 512;

/// Total size of a get/set/del frame, sentinel included
pub const FIXED_FRAME_LEN: usize = OPCODE_LEN + KEY_FIELD_LEN + VALUE_FIELD_LEN + 1;

/// Offset of the value field inside a fixed frame
pub const VALUE_OFFSET: usize = OPCODE_LEN + KEY_FIELD_LEN;

/// Largest key accepted by the store
pub const MAX_KEY_LEN: usize = 256;

/// Largest value accepted by the store
pub const MAX_VALUE_LEN: usize = 511;

/// Status byte of a successful response
pub const STATUS_OK: u8 = b'O';

/// Status byte of a failed response
pub const STATUS_ERR: u8 = b'N';

/// The five operations understood by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Get,
    Set,
    Del,
    Exp,
    Imp,
}

impl Opcode {
    /// Returns the 3-byte wire tag.
    pub fn as_bytes(&self) -> &'static [u8; OPCODE_LEN] {
        match self {
            Opcode::Get => b"get",
            Opcode::Set => b"set",
            Opcode::Del => b"del",
            Opcode::Exp => b"exp",
            Opcode::Imp => b"imp",
        }
    }

    /// Classifies the leading bytes of a frame.
    ///
    /// Returns `None` for anything that is not one of the five known tags,
    /// including frames shorter than the tag itself.
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        match buf.get(..OPCODE_LEN)? {
            b"get" => Some(Opcode::Get),
            b"set" => Some(Opcode::Set),
            b"del" => Some(Opcode::Del),
            b"exp" => Some(Opcode::Exp),
            b"imp" => Some(Opcode::Imp),
            _ => None,
        }
    }

    /// Returns true for the fixed-width get/set/del frames.
    pub fn is_fixed(&self) -> bool {
        matches!(self, Opcode::Get | Opcode::Set | Opcode::Del)
    }

    /// Human-readable operation name used in logs and error messages.
    pub fn name(&self) -> &'static str {
        match self {
            Opcode::Get => "get",
            Opcode::Set => "set",
            Opcode::Del => "del",
            Opcode::Exp => "export",
            Opcode::Imp => "import",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Errors raised while decoding a frame.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The tag is not one of get/set/del/exp/imp
    #[error("unknown opcode: {0:?}")]
    UnknownOpcode(String),

    /// A fixed frame ended before its declared size
    #[error("malformed {opcode} frame: expected {expected} bytes, got {actual}")]
    Truncated {
        opcode: Opcode,
        expected: usize,
        actual: usize,
    },

    /// A response frame without a status byte
    #[error("response is missing its status byte")]
    MissingStatus,

    /// A response frame whose status byte is neither 'O' nor 'N'
    #[error("invalid response status: {0:#04x}")]
    InvalidStatus(u8),
}

/// Input-domain violations for keys and values.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("key must not be empty")]
    EmptyKey,

    #[error("key size is greater than {max} bytes, current size: {0}", max = MAX_KEY_LEN)]
    KeyTooLong(usize),

    #[error("value size is greater than {max} bytes, current size: {0}", max = MAX_VALUE_LEN)]
    ValueTooLong(usize),

    #[error("{field} contains a reserved byte {byte:#04x}")]
    ReservedByte { field: &'static str, byte: u8 },
}

/// A decoded client request.
///
/// Fields hold the raw bytes after padding and the sentinel were trimmed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Get { key: Bytes },
    Set { key: Bytes, value: Bytes },
    Delete { key: Bytes },
    Export,
    Import { payload: Bytes },
}

impl Request {
    /// Returns the opcode this request is sent under.
    pub fn opcode(&self) -> Opcode {
        match self {
            Request::Get { .. } => Opcode::Get,
            Request::Set { .. } => Opcode::Set,
            Request::Delete { .. } => Opcode::Del,
            Request::Export => Opcode::Exp,
            Request::Import { .. } => Opcode::Imp,
        }
    }

    /// Serializes the request into a complete frame.
    ///
    /// Keys and values longer than their field are cut at the field width;
    /// callers are expected to run [`validate_record`] first.
    pub fn encode(&self) -> BytesMut {
        match self {
            Request::Get { key } | Request::Delete { key } => {
                encode_fixed(self.opcode(), key, &[])
            }
            Request::Set { key, value } => encode_fixed(Opcode::Set, key, value),
            Request::Export => encode_variable(Opcode::Exp, &[]),
            Request::Import { payload } => encode_variable(Opcode::Imp, payload),
        }
    }

    /// Parses one complete frame (as returned by `split_frame`).
    pub fn decode(frame: &[u8]) -> Result<Request, DecodeError> {
        let opcode = Opcode::from_bytes(frame).ok_or_else(|| {
            let tag = &frame[..frame.len().min(OPCODE_LEN)];
            DecodeError::UnknownOpcode(String::from_utf8_lossy(tag).into_owned())
        })?;

        if opcode.is_fixed() && frame.len() < FIXED_FRAME_LEN {
            return Err(DecodeError::Truncated {
                opcode,
                expected: FIXED_FRAME_LEN,
                actual: frame.len(),
            });
        }

        let request = match opcode {
            Opcode::Get => Request::Get {
                key: key_field(frame),
            },
            Opcode::Set => Request::Set {
                key: key_field(frame),
                value: value_field(frame),
            },
            Opcode::Del => Request::Delete {
                key: key_field(frame),
            },
            Opcode::Exp => Request::Export,
            Opcode::Imp => Request::Import {
                payload: Bytes::copy_from_slice(trim_field(&frame[OPCODE_LEN..])),
            },
        };

        Ok(request)
    }
}

/// A server response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// `'O'` followed by the payload (value, export JSON, or nothing)
    Ok(Bytes),
    /// `'N'` followed by the error message
    Err(String),
}

impl Response {
    /// Creates a success response without payload.
    pub fn ok() -> Self {
        Response::Ok(Bytes::new())
    }

    /// Creates a success response carrying `payload`.
    pub fn with_payload(payload: impl Into<Bytes>) -> Self {
        Response::Ok(payload.into())
    }

    /// Creates a failure response.
    pub fn error(message: impl Into<String>) -> Self {
        Response::Err(message.into())
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Response::Ok(_))
    }

    /// Serializes the response into a complete frame.
    ///
    /// Reserved bytes are stripped from error messages so that a message
    /// quoting client input cannot end the frame early.
    pub fn encode(&self) -> BytesMut {
        match self {
            Response::Ok(payload) => {
                let mut buf = BytesMut::with_capacity(payload.len() + 2);
                buf.put_u8(STATUS_OK);
                buf.put_slice(payload);
                buf.put_u8(SENTINEL);
                buf
            }
            Response::Err(message) => {
                let mut buf = BytesMut::with_capacity(message.len() + 2);
                buf.put_u8(STATUS_ERR);
                buf.extend(
                    message
                        .bytes()
                        .filter(|&b| b != SENTINEL && b != NUL),
                );
                buf.put_u8(SENTINEL);
                buf
            }
        }
    }

    /// Parses one complete response frame.
    pub fn decode(frame: &[u8]) -> Result<Response, DecodeError> {
        let (&status, rest) = frame.split_first().ok_or(DecodeError::MissingStatus)?;
        match status {
            STATUS_OK => Ok(Response::Ok(Bytes::copy_from_slice(trim_field(rest)))),
            STATUS_ERR => Ok(Response::Err(
                String::from_utf8_lossy(trim_field(rest)).into_owned(),
            )),
            // A bare sentinel means the peer sent nothing but the terminator
            SENTINEL => Err(DecodeError::MissingStatus),
            other => Err(DecodeError::InvalidStatus(other)),
        }
    }
}

/// Trims NUL and sentinel bytes from both ends of a field.
pub fn trim_field(buf: &[u8]) -> &[u8] {
    let reserved = |b: &u8| *b == NUL || *b == SENTINEL;
    let start = buf.iter().position(|b| !reserved(b)).unwrap_or(buf.len());
    let end = buf.iter().rposition(|b| !reserved(b)).map_or(start, |i| i + 1);
    &buf[start..end]
}

/// Checks a key against the protocol's input domain.
pub fn validate_key(key: &[u8]) -> Result<(), ValidationError> {
    if key.is_empty() {
        return Err(ValidationError::EmptyKey);
    }
    if key.len() > MAX_KEY_LEN {
        return Err(ValidationError::KeyTooLong(key.len()));
    }
    check_reserved("key", key)
}

/// Checks a value against the protocol's input domain.
pub fn validate_value(value: &[u8]) -> Result<(), ValidationError> {
    if value.len() > MAX_VALUE_LEN {
        return Err(ValidationError::ValueTooLong(value.len()));
    }
    check_reserved("value", value)
}

/// Checks a key/value pair.
pub fn validate_record(key: &[u8], value: &[u8]) -> Result<(), ValidationError> {
    validate_key(key)?;
    validate_value(value)
}

fn check_reserved(field: &'static str, buf: &[u8]) -> Result<(), ValidationError> {
    match buf.iter().find(|&&b| b == NUL || b == SENTINEL) {
        Some(&byte) => Err(ValidationError::ReservedByte { field, byte }),
        None => Ok(()),
    }
}

fn encode_fixed(opcode: Opcode, key: &[u8], value: &[u8]) -> BytesMut {
    let mut buf = BytesMut::zeroed(FIXED_FRAME_LEN);
    buf[..OPCODE_LEN].copy_from_slice(opcode.as_bytes());

    let key_len = key.len().min(KEY_FIELD_LEN);
    buf[OPCODE_LEN..OPCODE_LEN + key_len].copy_from_slice(&key[..key_len]);

    let value_len = value.len().min(VALUE_FIELD_LEN);
    buf[VALUE_OFFSET..VALUE_OFFSET + value_len].copy_from_slice(&value[..value_len]);

    buf[FIXED_FRAME_LEN - 1] = SENTINEL;
    buf
}

fn encode_variable(opcode: Opcode, payload: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(OPCODE_LEN + payload.len() + 1);
    buf.put_slice(opcode.as_bytes());
    buf.put_slice(payload);
    buf.put_u8(SENTINEL);
    buf
}

fn key_field(frame: &[u8]) -> Bytes {
    Bytes::copy_from_slice(trim_field(&frame[OPCODE_LEN..VALUE_OFFSET]))
}

fn value_field(frame: &[u8]) -> Bytes {
    Bytes::copy_from_slice(trim_field(&frame[VALUE_OFFSET..FIXED_FRAME_LEN - 1]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_frame_layout() {
        let frame = Request::Set {
            key: Bytes::from("key100000"),
            value: Bytes::from("value100000"),
        }
        .encode();

        assert_eq!(frame.len(), FIXED_FRAME_LEN);
        assert_eq!(&frame[0..3], b"set");
        assert_eq!(&frame[3..12], b"key100000");
        assert!(frame[12..259].iter().all(|&b| b == NUL));
        assert_eq!(&frame[259..270], b"value100000");
        assert!(frame[270..771].iter().all(|&b| b == NUL));
        assert_eq!(frame[771], SENTINEL);
    }

    #[test]
    fn test_get_frame_leaves_value_field_empty() {
        let frame = Request::Get {
            key: Bytes::from("name"),
        }
        .encode();

        assert_eq!(frame.len(), 772);
        assert!(frame[VALUE_OFFSET..771].iter().all(|&b| b == NUL));
    }

    #[test]
    fn test_decode_set_trims_padding() {
        let frame = Request::Set {
            key: Bytes::from("k"),
            value: Bytes::from("v"),
        }
        .encode();

        assert_eq!(
            Request::decode(&frame).unwrap(),
            Request::Set {
                key: Bytes::from("k"),
                value: Bytes::from("v"),
            }
        );
    }

    #[test]
    fn test_decode_full_width_fields() {
        let key = "k".repeat(KEY_FIELD_LEN);
        let value = "v".repeat(MAX_VALUE_LEN);
        let frame = Request::Set {
            key: Bytes::from(key.clone()),
            value: Bytes::from(value.clone()),
        }
        .encode();

        match Request::decode(&frame).unwrap() {
            Request::Set { key: k, value: v } => {
                assert_eq!(k.len(), KEY_FIELD_LEN);
                assert_eq!(&k[..], key.as_bytes());
                assert_eq!(&v[..], value.as_bytes());
            }
            other => panic!("unexpected request: {:?}", other),
        }
    }

    #[test]
    fn test_export_request_is_four_bytes() {
        let frame = Request::Export.encode();
        assert_eq!(&frame[..], b"exp\x04");
        assert_eq!(Request::decode(&frame).unwrap(), Request::Export);
    }

    #[test]
    fn test_import_payload_trimmed() {
        let frame = b"imp\x00[{\"key\":\"a\",\"value\":\"b\"}]\x00\x04";
        assert_eq!(
            Request::decode(frame).unwrap(),
            Request::Import {
                payload: Bytes::from_static(b"[{\"key\":\"a\",\"value\":\"b\"}]"),
            }
        );
    }

    #[test]
    fn test_unknown_opcode() {
        assert_eq!(
            Request::decode(b"foo\x04"),
            Err(DecodeError::UnknownOpcode("foo".to_string()))
        );
        assert!(matches!(
            Request::decode(b"\x04"),
            Err(DecodeError::UnknownOpcode(_))
        ));
        // Tags are case-sensitive
        assert!(matches!(
            Request::decode(b"GET\x04"),
            Err(DecodeError::UnknownOpcode(_))
        ));
    }

    #[test]
    fn test_short_fixed_frame_is_truncated() {
        let err = Request::decode(b"getname\x04").unwrap_err();
        assert_eq!(
            err,
            DecodeError::Truncated {
                opcode: Opcode::Get,
                expected: FIXED_FRAME_LEN,
                actual: 8,
            }
        );
    }

    #[test]
    fn test_response_encoding() {
        assert_eq!(&Response::ok().encode()[..], b"O\x04");
        assert_eq!(
            &Response::with_payload("value100000").encode()[..],
            b"Ovalue100000\x04"
        );
        assert_eq!(&Response::error("boom").encode()[..], b"Nboom\x04");
    }

    #[test]
    fn test_error_response_strips_reserved_bytes() {
        let encoded = Response::error("bad\x04key\x00").encode();
        assert_eq!(&encoded[..], b"Nbadkey\x04");
    }

    #[test]
    fn test_response_decode() {
        assert_eq!(
            Response::decode(b"Ovalue\x04").unwrap(),
            Response::with_payload("value")
        );
        assert_eq!(Response::decode(b"O\x04").unwrap(), Response::ok());
        assert_eq!(
            Response::decode(b"Nget operation failed\x04").unwrap(),
            Response::error("get operation failed")
        );
        assert_eq!(Response::decode(b""), Err(DecodeError::MissingStatus));
        assert_eq!(Response::decode(b"X\x04"), Err(DecodeError::InvalidStatus(b'X')));
    }

    #[test]
    fn test_trim_field() {
        assert_eq!(trim_field(b"\x00\x00abc\x00\x04"), b"abc");
        assert_eq!(trim_field(b"\x00\x00\x04"), b"");
        assert_eq!(trim_field(b""), b"");
        assert_eq!(trim_field(b"a\x00b"), b"a\x00b");
    }

    #[test]
    fn test_validation() {
        assert_eq!(validate_key(b""), Err(ValidationError::EmptyKey));
        assert!(validate_key(&[b'k'; MAX_KEY_LEN]).is_ok());
        assert_eq!(
            validate_key(&[b'k'; MAX_KEY_LEN + 1]),
            Err(ValidationError::KeyTooLong(MAX_KEY_LEN + 1))
        );
        assert!(validate_value(b"").is_ok());
        assert!(validate_value(&[b'v'; MAX_VALUE_LEN]).is_ok());
        assert_eq!(
            validate_value(&[b'v'; MAX_VALUE_LEN + 1]),
            Err(ValidationError::ValueTooLong(MAX_VALUE_LEN + 1))
        );
        assert_eq!(
            validate_record(b"a\x04b", b"v"),
            Err(ValidationError::ReservedByte {
                field: "key",
                byte: SENTINEL
            })
        );
        assert_eq!(
            validate_record(b"k", b"\x00"),
            Err(ValidationError::ReservedByte {
                field: "value",
                byte: NUL
            })
        );
    }
}
