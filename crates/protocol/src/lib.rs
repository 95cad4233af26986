//! # Overview
//!
//! The framed wire codec shared by privleap's control and comm sockets,
//! plus the closed message types each socket variant exchanges.
//!
//! # Design
//!
//! A frame is a 4-byte big-endian length prefix followed by exactly that
//! many payload bytes. The payload is one or more 7-bit-ASCII strings
//! joined by a single unit-separator byte (`0x1F`); the first string is
//! the message type, the rest are positional arguments. The grammar is
//! symmetric: the same [`encode`]/[`decode`] pair is used in both
//! directions on both socket variants.
//!
//! # Invariants
//!
//! - No string may be empty, and no string may contain a byte in
//!   `0x00..=0x1F` or `0x7F`.
//! - A frame whose declared length exceeds [`MAX_FRAME_LEN`] is rejected
//!   before the payload is even read.
//! - Trailing bytes after the last separator-terminated string are a
//!   grammar violation, not silently ignored.
//!
//! # Errors
//!
//! All decode failures are represented by [`ProtocolError`], never a
//! panic. [`ProtocolError::Io`] and [`ProtocolError::Closed`] cover
//! transport-level conditions so that a caller can match one `Result`
//! type across both framing and I/O failures.
//!
//! # Examples
//!
//! ```
//! use privleap_protocol::{decode_payload, encode};
//!
//! let frame = encode(&["SIGNAL", "test-act-free"]).unwrap();
//! let strings = decode_payload(&frame[4..]).unwrap();
//! assert_eq!(strings, vec!["SIGNAL", "test-act-free"]);
//! ```
//!
//! # See also
//!
//! `privleap-daemon::session` for how frames are read off and written to
//! an accepted `UnixStream`.

use std::io::{self, Read, Write};

pub mod message;
pub use message::{CommReply, CommRequest, ControlReply, ControlRequest};

/// Upper bound on a single frame's payload length, in bytes.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// The unit-separator byte that joins strings within one payload.
pub const SEPARATOR: u8 = 0x1F;

/// Recommended chunk size for a single `RESULT_STDOUT`/`RESULT_STDERR`
/// frame's byte argument.
pub const STREAM_CHUNK_LEN: usize = 1024;

/// Every way a frame can fail to parse, or a transport can fail to
/// deliver one.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The declared length exceeds [`MAX_FRAME_LEN`], or the payload is
    /// empty, or some other structural malformation.
    #[error("invalid message: {0}")]
    InvalidMessage(&'static str),
    /// Bytes remained after the last separator-terminated string.
    #[error("extra data after last frame argument")]
    ExtraData,
    /// A string contained a byte outside the allowed ASCII range.
    #[error("disallowed byte {0:#04x} in frame payload")]
    InvalidAscii(u8),
    /// The message type is not valid for the socket variant that
    /// received it.
    #[error("unknown message type {0:?}")]
    UnknownType(String),
    /// The underlying transport failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// The peer closed the connection before a full frame arrived.
    #[error("connection closed")]
    Closed,
}

/// Encodes `parts` (message type followed by positional arguments) into
/// one complete frame, including its 4-byte length prefix.
///
/// # Errors
///
/// Returns [`ProtocolError::InvalidMessage`] if `parts` is empty, any
/// part is empty, or the encoded payload would exceed [`MAX_FRAME_LEN`];
/// returns [`ProtocolError::InvalidAscii`] if any part contains a
/// disallowed byte.
pub fn encode(parts: &[&str]) -> Result<Vec<u8>, ProtocolError> {
    if parts.is_empty() {
        return Err(ProtocolError::InvalidMessage("no message parts"));
    }
    let mut payload = Vec::new();
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            return Err(ProtocolError::InvalidMessage("empty frame argument"));
        }
        for &byte in part.as_bytes() {
            validate_byte(byte)?;
        }
        if i > 0 {
            payload.push(SEPARATOR);
        }
        payload.extend_from_slice(part.as_bytes());
    }
    if payload.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::InvalidMessage("payload exceeds MAX_FRAME_LEN"));
    }
    let len = u32::try_from(payload.len()).expect("checked against MAX_FRAME_LEN above");
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Splits a raw payload (the frame body, without its length prefix) into
/// its constituent strings.
///
/// # Errors
///
/// [`ProtocolError::InvalidAscii`] on a disallowed byte,
/// [`ProtocolError::ExtraData`] if the payload is empty or a string is
/// empty (i.e. two separators in a row, or a leading/trailing separator).
pub fn decode_payload(payload: &[u8]) -> Result<Vec<String>, ProtocolError> {
    if payload.is_empty() {
        return Err(ProtocolError::InvalidMessage("empty payload"));
    }
    let mut strings = Vec::new();
    for chunk in payload.split(|&b| b == SEPARATOR) {
        if chunk.is_empty() {
            return Err(ProtocolError::ExtraData);
        }
        for &byte in chunk {
            validate_byte(byte)?;
        }
        // Bytes are already validated as 7-bit ASCII above.
        strings.push(String::from_utf8(chunk.to_vec()).expect("validated ASCII"));
    }
    Ok(strings)
}

fn validate_byte(byte: u8) -> Result<(), ProtocolError> {
    if byte <= 0x1F || byte == 0x7F {
        return Err(ProtocolError::InvalidAscii(byte));
    }
    Ok(())
}

/// Reads exactly one frame from `reader`: a 4-byte big-endian length
/// prefix, then that many payload bytes, then decodes the payload.
///
/// # Errors
///
/// [`ProtocolError::Closed`] if the peer closes before any bytes of the
/// length prefix arrive; [`ProtocolError::Io`] on any other I/O failure;
/// [`ProtocolError::InvalidMessage`] if the declared length exceeds
/// [`MAX_FRAME_LEN`]; decode errors as in [`decode_payload`].
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Vec<String>, ProtocolError> {
    let mut len_buf = [0u8; 4];
    if let Err(err) = reader.read_exact(&mut len_buf) {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            return Err(ProtocolError::Closed);
        }
        return Err(ProtocolError::Io(err));
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 || len > MAX_FRAME_LEN {
        return Err(ProtocolError::InvalidMessage("declared length out of bounds"));
    }
    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .map_err(|err| match err.kind() {
            io::ErrorKind::UnexpectedEof => ProtocolError::Closed,
            _ => ProtocolError::Io(err),
        })?;
    decode_payload(&payload)
}

/// Writes one complete frame for `parts` to `writer`, retrying internally
/// on short writes.
///
/// # Errors
///
/// Propagates [`encode`]'s errors, or [`ProtocolError::Io`] if the
/// underlying write fails (including a broken pipe, which callers should
/// log at ERROR and then discard the session per the daemon's error
/// disposition table).
pub fn write_frame<W: Write>(writer: &mut W, parts: &[&str]) -> Result<(), ProtocolError> {
    let frame = encode(parts)?;
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

/// Encodes a `RESULT_STDOUT`/`RESULT_STDERR`-style frame whose trailing
/// argument is the child's raw output rather than a validated ASCII
/// string. Only `msg_type` is grammar-checked; `bytes` is carried
/// verbatim after a single separator, since command output may contain
/// newlines and other control bytes that the string grammar forbids.
///
/// # Errors
///
/// [`ProtocolError::InvalidAscii`] if `msg_type` itself contains a
/// disallowed byte; [`ProtocolError::InvalidMessage`] if the resulting
/// frame would exceed [`MAX_FRAME_LEN`].
pub fn encode_binary(msg_type: &str, bytes: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    if msg_type.is_empty() {
        return Err(ProtocolError::InvalidMessage("empty frame argument"));
    }
    for &byte in msg_type.as_bytes() {
        validate_byte(byte)?;
    }
    let mut payload = Vec::with_capacity(msg_type.len() + 1 + bytes.len());
    payload.extend_from_slice(msg_type.as_bytes());
    payload.push(SEPARATOR);
    payload.extend_from_slice(bytes);
    if payload.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::InvalidMessage("payload exceeds MAX_FRAME_LEN"));
    }
    let len = u32::try_from(payload.len()).expect("checked against MAX_FRAME_LEN above");
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Writes a binary stream-chunk frame (see [`encode_binary`]) to `writer`.
///
/// # Errors
///
/// As [`encode_binary`], plus [`ProtocolError::Io`] on a write failure.
pub fn write_binary_frame<W: Write>(
    writer: &mut W,
    msg_type: &str,
    bytes: &[u8],
) -> Result<(), ProtocolError> {
    let frame = encode_binary(msg_type, bytes)?;
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

/// Splits a raw payload into its message-type string and a trailing raw
/// byte blob, without applying the ASCII grammar to the blob. Used to
/// decode `RESULT_STDOUT`/`RESULT_STDERR` frames in tests and in any
/// future comm client.
///
/// # Errors
///
/// [`ProtocolError::InvalidMessage`] if there is no separator (i.e. no
/// trailing byte argument at all); [`ProtocolError::InvalidAscii`] if the
/// message-type segment contains a disallowed byte.
pub fn decode_binary_payload(payload: &[u8]) -> Result<(String, Vec<u8>), ProtocolError> {
    let Some(sep_pos) = payload.iter().position(|&b| b == SEPARATOR) else {
        return Err(ProtocolError::InvalidMessage(
            "binary frame missing separator",
        ));
    };
    let (kind, rest) = payload.split_at(sep_pos);
    for &byte in kind {
        validate_byte(byte)?;
    }
    let kind = String::from_utf8(kind.to_vec()).expect("validated ASCII");
    let bytes = rest[1..].to_vec();
    Ok((kind, bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_well_formed_frame() {
        let frame = encode(&["SIGNAL", "test-act-free"]).unwrap();
        let len = u32::from_be_bytes(frame[0..4].try_into().unwrap()) as usize;
        assert_eq!(len, frame.len() - 4);
        let decoded = decode_payload(&frame[4..]).unwrap();
        assert_eq!(decoded, vec!["SIGNAL", "test-act-free"]);
    }

    #[test]
    fn rejects_disallowed_byte() {
        let err = encode(&["SIGNAL", "bad\x1bname"]).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidAscii(0x1B)));
    }

    #[test]
    fn rejects_separator_inside_an_argument() {
        // 0x1F itself is disallowed as a literal byte within an argument.
        let err = encode(&["SIGNAL", "a\x1fb"]).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidAscii(0x1F)));
    }

    #[test]
    fn decode_rejects_trailing_empty_segment() {
        // Payload "SIGNAL\x1F" parses as ["SIGNAL", ""], the empty tail
        // string is the ExtraData case (trailing separator).
        let err = decode_payload(b"SIGNAL\x1F").unwrap_err();
        assert!(matches!(err, ProtocolError::ExtraData));
    }

    #[test]
    fn read_frame_reports_closed_on_immediate_eof() {
        let mut empty: &[u8] = &[];
        let err = read_frame(&mut empty).unwrap_err();
        assert!(matches!(err, ProtocolError::Closed));
    }

    #[test]
    fn read_frame_reports_invalid_message_on_oversized_length() {
        let mut buf: &[u8] = &(MAX_FRAME_LEN as u32 + 1).to_be_bytes();
        let err = read_frame(&mut buf).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidMessage(_)));
    }

    #[test]
    fn write_then_read_frame_round_trips_over_a_buffer() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &["RESULT_EXITCODE", "240"]).unwrap();
        let mut cursor = buf.as_slice();
        let strings = read_frame(&mut cursor).unwrap();
        assert_eq!(strings, vec!["RESULT_EXITCODE", "240"]);
    }

    #[test]
    fn binary_frame_preserves_control_bytes_in_the_trailing_argument() {
        let frame = encode_binary("RESULT_STDOUT", b"test-act-free\n").unwrap();
        let (kind, bytes) = decode_binary_payload(&frame[4..]).unwrap();
        assert_eq!(kind, "RESULT_STDOUT");
        assert_eq!(bytes, b"test-act-free\n");
    }

    #[test]
    fn binary_frame_allows_embedded_separator_bytes_in_output() {
        let frame = encode_binary("RESULT_STDERR", b"a\x1fb").unwrap();
        let (kind, bytes) = decode_binary_payload(&frame[4..]).unwrap();
        assert_eq!(kind, "RESULT_STDERR");
        assert_eq!(bytes, b"a\x1fb");
    }
}
