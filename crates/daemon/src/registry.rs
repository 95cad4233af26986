//! The socket registry: the control endpoint plus the dynamic set of
//! per-user comm endpoints.
//!
//! Single-writer — only the supervisor's accept-loop thread (directly,
//! or via the inline control handler) ever mutates a [`SocketRegistry`].
//! Worker threads receive only an already-accepted connection and never
//! see the registry itself.

use std::fs;
use std::io;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use nix::unistd::{Gid, Uid};

use privleap_core::UserRef;
use privleap_platform::{identity, PlatformError};

/// Filesystem mode for the control socket: only its owner (root) may
/// connect.
const CONTROL_SOCKET_MODE: u32 = 0o600;
/// Filesystem mode for a comm socket: only its owner may connect
/// directly; root bypasses file permissions entirely, which is how the
/// control client can still exist on the same host without a back door.
const COMM_SOCKET_MODE: u32 = 0o600;

/// One live endpoint: the control socket, or a single user's comm socket.
pub enum Endpoint {
    Control { listener: UnixListener, path: PathBuf },
    Comm { listener: UnixListener, user_name: String, path: PathBuf },
}

impl Endpoint {
    #[must_use]
    pub fn raw_fd(&self) -> RawFd {
        match self {
            Endpoint::Control { listener, .. } => listener.as_fd().as_raw_fd(),
            Endpoint::Comm { listener, .. } => listener.as_fd().as_raw_fd(),
        }
    }
}

/// Outcome of [`SocketRegistry::create_comm`].
#[derive(Debug)]
pub enum CreateCommOutcome {
    Ok,
    Exists,
    NoSuchUser,
    CreateFailed(io::Error),
}

/// Outcome of [`SocketRegistry::destroy_comm`].
#[derive(Debug, PartialEq, Eq)]
pub enum DestroyCommOutcome {
    Ok,
    NoUser,
}

/// Owns the control endpoint plus the dynamic set of comm endpoints.
pub struct SocketRegistry {
    control_path: PathBuf,
    comm_dir: PathBuf,
    control: Option<Endpoint>,
    comm: Vec<Endpoint>,
}

impl SocketRegistry {
    #[must_use]
    pub fn new(control_path: PathBuf, comm_dir: PathBuf) -> Self {
        Self {
            control_path,
            comm_dir,
            control: None,
            comm: Vec::new(),
        }
    }

    /// Creates the control endpoint with filesystem permissions that
    /// allow only a privileged (root-owned) connect. Fatal on failure.
    ///
    /// # Errors
    ///
    /// Any I/O failure binding the socket or setting its permissions.
    pub fn ensure_control(&mut self) -> io::Result<()> {
        if self.control_path.exists() {
            fs::remove_file(&self.control_path)?;
        }
        let listener = UnixListener::bind(&self.control_path)?;
        fs::set_permissions(&self.control_path, fs::Permissions::from_mode(CONTROL_SOCKET_MODE))?;
        self.control = Some(Endpoint::Control {
            listener,
            path: self.control_path.clone(),
        });
        Ok(())
    }

    /// Idempotently creates a comm endpoint for `user`. See
    /// [`CreateCommOutcome`] for the reply mapping.
    pub fn create_comm(&mut self, user: &str) -> CreateCommOutcome {
        if self.comm.iter().any(|endpoint| endpoint_user(endpoint) == Some(user)) {
            return CreateCommOutcome::Exists;
        }

        let resolved = match identity::lookup_user(&UserRef::parse(user)) {
            Ok(resolved) => resolved,
            Err(PlatformError::NoSuchUser(_)) => return CreateCommOutcome::NoSuchUser,
            Err(other) => return CreateCommOutcome::CreateFailed(io::Error::other(other)),
        };

        let path = self.comm_dir.join(&resolved.name);
        match bind_comm_socket(&path, resolved.uid, resolved.primary_gid) {
            Ok(listener) => {
                self.comm.push(Endpoint::Comm {
                    listener,
                    user_name: resolved.name,
                    path,
                });
                CreateCommOutcome::Ok
            }
            Err(err) => CreateCommOutcome::CreateFailed(err),
        }
    }

    /// Removes the comm endpoint for `user`, unlinking its filesystem
    /// node on a best-effort basis: absence at unlink time is tolerated
    /// (warned, not erred); any other unlink failure is logged by the
    /// caller but the in-memory entry is still removed regardless (see
    /// spec §9's explicit resolution of this ambiguity).
    pub fn destroy_comm(&mut self, user: &str) -> (DestroyCommOutcome, Option<io::Error>) {
        let Some(index) = self.comm.iter().position(|endpoint| endpoint_user(endpoint) == Some(user)) else {
            return (DestroyCommOutcome::NoUser, None);
        };
        let endpoint = self.comm.remove(index);
        let Endpoint::Comm { path, .. } = endpoint else {
            unreachable!("index was located via endpoint_user, which only matches Comm");
        };
        let unlink_error = match fs::remove_file(&path) {
            Ok(()) => None,
            Err(err) if err.kind() == io::ErrorKind::NotFound => None,
            Err(err) => Some(err),
        };
        (DestroyCommOutcome::Ok, unlink_error)
    }

    /// All currently live endpoints, control first, for building the
    /// accept loop's poll set.
    pub fn endpoints(&self) -> impl Iterator<Item = &Endpoint> {
        self.control.iter().chain(self.comm.iter())
    }

    /// A snapshot of every live endpoint's raw fd and kind, for the
    /// accept loop to build one `poll()` call from. Owned, so it can
    /// outlive the borrow of `self` used to build it — the subsequent
    /// `accept_control`/`accept_comm` calls re-borrow independently.
    #[must_use]
    pub fn poll_targets(&self) -> Vec<PollTarget> {
        self.endpoints()
            .map(|endpoint| PollTarget {
                fd: endpoint.raw_fd(),
                kind: match endpoint {
                    Endpoint::Control { .. } => PollTargetKind::Control,
                    Endpoint::Comm { user_name, .. } => PollTargetKind::Comm(user_name.clone()),
                },
            })
            .collect()
    }

    /// Accepts one connection on the control endpoint.
    ///
    /// # Errors
    ///
    /// [`io::Error`] if there is no control endpoint registered, or the
    /// accept syscall fails.
    pub fn accept_control(&self) -> io::Result<UnixStream> {
        let Some(Endpoint::Control { listener, .. }) = &self.control else {
            return Err(io::Error::other("control endpoint is not registered"));
        };
        Ok(listener.accept()?.0)
    }

    /// Accepts one connection on `user`'s comm endpoint.
    ///
    /// # Errors
    ///
    /// [`io::Error`] if `user` has no live comm endpoint, or the accept
    /// syscall fails.
    pub fn accept_comm(&self, user: &str) -> io::Result<UnixStream> {
        let listener = self
            .comm
            .iter()
            .find_map(|endpoint| match endpoint {
                Endpoint::Comm { listener, user_name, .. } if user_name == user => Some(listener),
                _ => None,
            })
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, format!("no comm endpoint registered for '{user}'"))
            })?;
        Ok(listener.accept()?.0)
    }
}

/// One endpoint's raw fd and kind, as used by the accept loop's `poll()`
/// call.
pub struct PollTarget {
    pub fd: RawFd,
    pub kind: PollTargetKind,
}

/// Which handler an accepted connection on a [`PollTarget`] should go to.
pub enum PollTargetKind {
    Control,
    Comm(String),
}

fn endpoint_user(endpoint: &Endpoint) -> Option<&str> {
    match endpoint {
        Endpoint::Control { .. } => None,
        Endpoint::Comm { user_name, .. } => Some(user_name.as_str()),
    }
}

fn bind_comm_socket(path: &Path, uid: u32, gid: u32) -> io::Result<UnixListener> {
    if path.exists() {
        fs::remove_file(path)?;
    }
    let listener = UnixListener::bind(path)?;
    nix::unistd::chown(path, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid)))
        .map_err(io::Error::from)?;
    fs::set_permissions(path, fs::Permissions::from_mode(COMM_SOCKET_MODE))?;
    Ok(listener)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_comm_for_root_then_create_again_reports_exists() {
        let dir = tempdir().unwrap();
        let mut registry = SocketRegistry::new(dir.path().join("control"), dir.path().to_path_buf());
        assert!(matches!(registry.create_comm("root"), CreateCommOutcome::Ok));
        assert!(matches!(registry.create_comm("root"), CreateCommOutcome::Exists));
    }

    #[test]
    fn destroy_comm_for_unknown_user_reports_no_user() {
        let dir = tempdir().unwrap();
        let mut registry = SocketRegistry::new(dir.path().join("control"), dir.path().to_path_buf());
        let (outcome, err) = registry.destroy_comm("nobody-at-all");
        assert_eq!(outcome, DestroyCommOutcome::NoUser);
        assert!(err.is_none());
    }

    #[test]
    fn destroy_comm_removes_the_socket_node() {
        let dir = tempdir().unwrap();
        let mut registry = SocketRegistry::new(dir.path().join("control"), dir.path().to_path_buf());
        registry.create_comm("root");
        let path = dir.path().join("root");
        assert!(path.exists());
        let (outcome, err) = registry.destroy_comm("root");
        assert_eq!(outcome, DestroyCommOutcome::Ok);
        assert!(err.is_none());
        assert!(!path.exists());
    }

    #[test]
    fn create_comm_for_nonexistent_user_reports_no_such_user() {
        let dir = tempdir().unwrap();
        let mut registry = SocketRegistry::new(dir.path().join("control"), dir.path().to_path_buf());
        let outcome = registry.create_comm("privleap-test-no-such-user");
        assert!(matches!(outcome, CreateCommOutcome::NoSuchUser));
    }
}
