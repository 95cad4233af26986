//! Closed message sets for the control and comm sockets, built on top of
//! the generic frame codec in the crate root.
//!
//! These types exist so that the daemon and (eventually) its client
//! front-ends get exhaustive `match` support instead of comparing raw
//! strings scattered across the codebase.

use std::io::Write;

use crate::{write_binary_frame, write_frame, ProtocolError, STREAM_CHUNK_LEN};

/// A request arriving on the control socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRequest {
    Create { user: String },
    Destroy { user: String },
}

/// A reply sent on the control socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlReply {
    Ok,
    Exists,
    NoUser,
    ControlError,
}

/// A request arriving on a comm socket. The protocol only ever expects a
/// single `SIGNAL` per session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommRequest {
    Signal { action: String },
}

/// A reply frame sent on a comm socket during one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommReply {
    Trigger,
    Unauthorized,
    TriggerError,
    ResultStdout { bytes: Vec<u8> },
    ResultStderr { bytes: Vec<u8> },
    ResultExitCode { code: i32 },
}

impl ControlRequest {
    /// Interprets an already-decoded frame payload as a control request.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::UnknownType`] if the first string is not `CREATE`
    /// or `DESTROY`, or [`ProtocolError::InvalidMessage`] if the argument
    /// count is wrong for the given type.
    pub fn from_parts(parts: &[String]) -> Result<Self, ProtocolError> {
        let [kind, user] = parts else {
            return Err(ProtocolError::InvalidMessage(
                "control request needs exactly one argument",
            ));
        };
        match kind.as_str() {
            "CREATE" => Ok(ControlRequest::Create { user: user.clone() }),
            "DESTROY" => Ok(ControlRequest::Destroy { user: user.clone() }),
            other => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }
}

impl ControlReply {
    /// The token this reply encodes to on the wire.
    #[must_use]
    pub fn as_token(self) -> &'static str {
        match self {
            ControlReply::Ok => "OK",
            ControlReply::Exists => "EXISTS",
            ControlReply::NoUser => "NOUSER",
            ControlReply::ControlError => "CONTROL_ERROR",
        }
    }
}

impl CommRequest {
    /// Interprets an already-decoded frame payload as a comm request.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::UnknownType`] if the first string is not
    /// `SIGNAL`, or [`ProtocolError::InvalidMessage`] on an argument-count
    /// mismatch.
    pub fn from_parts(parts: &[String]) -> Result<Self, ProtocolError> {
        let [kind, action] = parts else {
            return Err(ProtocolError::InvalidMessage(
                "comm request needs exactly one argument",
            ));
        };
        match kind.as_str() {
            "SIGNAL" => Ok(CommRequest::Signal {
                action: action.clone(),
            }),
            other => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }
}

impl CommReply {
    /// Writes this reply as one frame to `writer`. `ResultStdout`/
    /// `ResultStderr` use the binary-safe encoding since command output
    /// may contain bytes the strict string grammar forbids; every other
    /// variant is a fixed ASCII token.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::Io`] on a write failure (e.g. the client is
    /// gone); callers map this to the daemon's "broken pipe on reply"
    /// disposition.
    pub fn write<W: Write>(&self, writer: &mut W) -> Result<(), ProtocolError> {
        match self {
            CommReply::Trigger => write_frame(writer, &["TRIGGER"]),
            CommReply::Unauthorized => write_frame(writer, &["UNAUTHORIZED"]),
            CommReply::TriggerError => write_frame(writer, &["TRIGGER_ERROR"]),
            CommReply::ResultStdout { bytes } => {
                write_binary_frame(writer, "RESULT_STDOUT", bytes)
            }
            CommReply::ResultStderr { bytes } => {
                write_binary_frame(writer, "RESULT_STDERR", bytes)
            }
            CommReply::ResultExitCode { code } => {
                write_frame(writer, &["RESULT_EXITCODE", &code.to_string()])
            }
        }
    }

    /// Splits `bytes` into one or more [`CommReply::ResultStdout`] frames
    /// bounded by [`STREAM_CHUNK_LEN`].
    #[must_use]
    pub fn stdout_chunks(bytes: &[u8]) -> Vec<CommReply> {
        bytes
            .chunks(STREAM_CHUNK_LEN)
            .map(|chunk| CommReply::ResultStdout {
                bytes: chunk.to_vec(),
            })
            .collect()
    }

    /// Splits `bytes` into one or more [`CommReply::ResultStderr`] frames
    /// bounded by [`STREAM_CHUNK_LEN`].
    #[must_use]
    pub fn stderr_chunks(bytes: &[u8]) -> Vec<CommReply> {
        bytes
            .chunks(STREAM_CHUNK_LEN)
            .map(|chunk| CommReply::ResultStderr {
                bytes: chunk.to_vec(),
            })
            .collect()
    }
}

impl ControlReply {
    /// Writes this reply as one frame to `writer`.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::Io`] on a write failure.
    pub fn write<W: Write>(self, writer: &mut W) -> Result<(), ProtocolError> {
        write_frame(writer, &[self.as_token()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_create_and_destroy() {
        let create = vec!["CREATE".to_string(), "alice".to_string()];
        assert_eq!(
            ControlRequest::from_parts(&create).unwrap(),
            ControlRequest::Create {
                user: "alice".to_string()
            }
        );

        let destroy = vec!["DESTROY".to_string(), "bob".to_string()];
        assert_eq!(
            ControlRequest::from_parts(&destroy).unwrap(),
            ControlRequest::Destroy {
                user: "bob".to_string()
            }
        );
    }

    #[test]
    fn rejects_unknown_control_type() {
        let parts = vec!["PING".to_string(), "alice".to_string()];
        let err = ControlRequest::from_parts(&parts).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownType(_)));
    }

    #[test]
    fn parses_signal() {
        let parts = vec!["SIGNAL".to_string(), "test-act-free".to_string()];
        assert_eq!(
            CommRequest::from_parts(&parts).unwrap(),
            CommRequest::Signal {
                action: "test-act-free".to_string()
            }
        );
    }

    #[test]
    fn chunks_respect_the_recommended_size() {
        let bytes = vec![b'x'; STREAM_CHUNK_LEN * 2 + 5];
        let chunks = CommReply::stdout_chunks(&bytes);
        assert_eq!(chunks.len(), 3);
        let CommReply::ResultStdout { bytes: first } = &chunks[0] else {
            panic!("expected ResultStdout");
        };
        assert_eq!(first.len(), STREAM_CHUNK_LEN);
        let CommReply::ResultStdout { bytes: last } = &chunks[2] else {
            panic!("expected ResultStdout");
        };
        assert_eq!(last.len(), 5);
    }

    #[test]
    fn comm_reply_write_round_trips_through_read_frame() {
        let mut buf = Vec::new();
        CommReply::ResultStdout {
            bytes: b"test-act-free\n".to_vec(),
        }
        .write(&mut buf)
        .unwrap();
        let (kind, bytes) = crate::decode_binary_payload(&buf[4..]).unwrap();
        assert_eq!(kind, "RESULT_STDOUT");
        assert_eq!(bytes, b"test-act-free\n");
    }
}
