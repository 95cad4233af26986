//! Kernel peer-credential retrieval for an accepted `AF_UNIX` stream.
//!
//! The session layer re-derives the connecting peer's effective uid from
//! `SO_PEERCRED` on every accept rather than trusting the filesystem path a
//! client happened to connect to — see the daemon's session module for why.

use std::os::unix::net::UnixStream;

use nix::sys::socket::{getsockopt, sockopt::PeerCredentials};

use crate::PlatformError;

/// Returns the effective uid of the process on the other end of `stream`,
/// as reported by the kernel at the time of the call.
///
/// # Errors
///
/// [`PlatformError::PeerCredentials`] if the `SO_PEERCRED` getsockopt call
/// fails (e.g. the platform does not support it, or the stream is not a
/// connected `AF_UNIX` socket).
pub fn peer_uid(stream: &UnixStream) -> Result<u32, PlatformError> {
    let creds = getsockopt(stream, PeerCredentials)
        .map_err(|errno| PlatformError::PeerCredentials(std::io::Error::from(errno)))?;
    Ok(creds.uid())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_our_own_uid_over_a_socketpair() {
        let (a, b) = UnixStream::pair().unwrap();
        let uid = peer_uid(&a).unwrap();
        assert_eq!(uid, nix::unistd::getuid().as_raw());
        drop(b);
    }
}
