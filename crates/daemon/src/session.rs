//! Ephemeral per-connection wrappers binding an accepted socket to a peer
//! identity and carrying its frame send/receive.
//!
//! A control session trusts the peer implicitly — it only reached the
//! control endpoint because the filesystem permissions on that path
//! already restrict it to root. A comm session re-derives the peer's
//! identity from `SO_PEERCRED` on every accept and refuses the session
//! outright if it disagrees with the endpoint's bound user — the
//! defensive check spec §9 calls for and spec §4.2 mandates.

use std::os::unix::net::UnixStream;
use std::thread;
use std::time::Duration;

use privleap_core::UserRef;
use privleap_platform::{identity, peercred, PlatformError};
use privleap_protocol::{CommReply, CommRequest, ControlReply, ControlRequest, ProtocolError};

/// Extra delay before every reply when the daemon runs in test mode, to
/// stabilize client/server races in the test harness. Does not otherwise
/// change protocol semantics.
const TEST_MODE_REPLY_DELAY: Duration = Duration::from_millis(10);

/// A session accepted on the control endpoint.
pub struct ControlSession {
    stream: UnixStream,
    test_mode: bool,
}

impl ControlSession {
    #[must_use]
    pub fn accept(stream: UnixStream, test_mode: bool) -> Self {
        Self { stream, test_mode }
    }

    /// Reads exactly one control request.
    ///
    /// # Errors
    ///
    /// Any [`ProtocolError`] from framing or decoding.
    pub fn read_request(&mut self) -> Result<ControlRequest, ProtocolError> {
        let parts = privleap_protocol::read_frame(&mut self.stream)?;
        ControlRequest::from_parts(&parts)
    }

    /// Sends `reply`, swallowing (and reporting to the caller as `false`)
    /// a broken pipe so the daemon never lets one session's disconnect
    /// propagate.
    pub fn reply(&mut self, reply: ControlReply) -> bool {
        if self.test_mode {
            thread::sleep(TEST_MODE_REPLY_DELAY);
        }
        reply.write(&mut self.stream).is_ok()
    }
}

/// Every way establishing a comm session can fail.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Platform(#[from] PlatformError),
    #[error(
        "peer credential mismatch: endpoint is bound to '{expected}' but the connecting \
         process's effective user is '{actual}'"
    )]
    PeerMismatch { expected: String, actual: String },
}

/// A session accepted on one user's comm endpoint.
pub struct CommSession {
    stream: UnixStream,
    test_mode: bool,
    pub user_name: String,
    pub peer_uid: u32,
}

impl CommSession {
    /// Accepts `stream`, re-derives the peer's effective uid via
    /// `SO_PEERCRED`, and refuses the session if the resolved user name
    /// does not match `endpoint_user` (the user the comm endpoint was
    /// created for).
    ///
    /// # Errors
    ///
    /// [`SessionError::Platform`] if the peer credential or user lookup
    /// fails; [`SessionError::PeerMismatch`] on a trust-boundary
    /// violation.
    pub fn accept(stream: UnixStream, endpoint_user: &str, test_mode: bool) -> Result<Self, SessionError> {
        let peer_uid = peercred::peer_uid(&stream)?;
        let peer = identity::lookup_user(&UserRef::Id(peer_uid))?;
        if peer.name != endpoint_user {
            return Err(SessionError::PeerMismatch {
                expected: endpoint_user.to_string(),
                actual: peer.name,
            });
        }
        Ok(Self {
            stream,
            test_mode,
            user_name: peer.name,
            peer_uid,
        })
    }

    /// Reads exactly one comm request.
    ///
    /// # Errors
    ///
    /// Any [`ProtocolError`] from framing or decoding.
    pub fn read_request(&mut self) -> Result<CommRequest, ProtocolError> {
        let parts = privleap_protocol::read_frame(&mut self.stream)?;
        CommRequest::from_parts(&parts)
    }

    /// Sends `reply`, returning whether the send succeeded.
    pub fn reply(&mut self, reply: &CommReply) -> bool {
        if self.test_mode {
            thread::sleep(TEST_MODE_REPLY_DELAY);
        }
        reply.write(&mut self.stream).is_ok()
    }

    /// Clones the underlying stream so stdout/stderr draining can keep
    /// writing frames after the initial `TRIGGER` reply.
    ///
    /// # Errors
    ///
    /// Any I/O failure from the OS-level `dup`.
    pub fn try_clone_stream(&self) -> std::io::Result<UnixStream> {
        self.stream.try_clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use privleap_protocol::write_frame;

    fn current_user_name() -> String {
        let uid = nix::unistd::getuid().as_raw();
        identity::lookup_user(&UserRef::Id(uid)).unwrap().name
    }

    #[test]
    fn control_session_round_trips_a_request_and_a_reply() {
        let (mut client, server) = UnixStream::pair().unwrap();
        write_frame(&mut client, &["CREATE", "alice"]).unwrap();

        let mut session = ControlSession::accept(server, false);
        let request = session.read_request().unwrap();
        assert_eq!(
            request,
            ControlRequest::Create {
                user: "alice".to_string()
            }
        );
        assert!(session.reply(ControlReply::Ok));

        let reply = privleap_protocol::read_frame(&mut client).unwrap();
        assert_eq!(reply, vec!["OK".to_string()]);
    }

    #[test]
    fn comm_session_accepts_when_endpoint_user_matches_the_real_peer() {
        let (_client, server) = UnixStream::pair().unwrap();
        let self_name = current_user_name();
        let session = CommSession::accept(server, &self_name, false).unwrap();
        assert_eq!(session.user_name, self_name);
    }

    #[test]
    fn comm_session_refuses_a_peer_uid_mismatch() {
        let (_client, server) = UnixStream::pair().unwrap();
        let err = CommSession::accept(server, "definitely-not-the-real-peer", false).unwrap_err();
        assert!(matches!(err, SessionError::PeerMismatch { .. }));
    }
}
