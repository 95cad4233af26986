//! # Overview
//!
//! Unix-specific primitives privleapd needs and that the rest of the
//! workspace should never have to call `libc`/`nix` directly for:
//! user/group database lookups, kernel peer-credential retrieval on an
//! accepted `AF_UNIX` socket, privilege-dropping `Command` setup, and
//! graceful-shutdown signal handling.
//!
//! # Design
//!
//! Each concern gets its own module so that callers can see at a glance
//! which syscalls a given operation touches. Nothing here is async; the
//! daemon is thread-per-connection and every call in this crate is a
//! direct blocking syscall wrapper.
//!
//! # Errors
//!
//! Every fallible operation returns [`PlatformError`].
//!
//! # See also
//!
//! `privleap-daemon::session` (peer credentials), `privleap-daemon::exec`
//! (privilege drop), `privleap-daemon::supervisor` (signals).

pub mod identity;
pub mod peercred;
pub mod privilege;
pub mod signal;

/// Every way a platform-level operation can fail.
#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("no such user: {0}")]
    NoSuchUser(String),
    #[error("no such group: {0}")]
    NoSuchGroup(String),
    #[error("failed to resolve peer credentials: {0}")]
    PeerCredentials(#[source] std::io::Error),
    #[error("failed to install signal handler: {0}")]
    SignalHandler(#[source] std::io::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
