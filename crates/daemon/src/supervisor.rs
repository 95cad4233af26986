//! Supervisor: startup checks, state-directory lifecycle, accept loop
//! and thread fan-out (spec §4.8, §5).

use std::convert::Infallible;
use std::fs;
use std::io;
use std::os::fd::BorrowedFd;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::unistd::Pid;

use privleap_platform::signal::{self, ShutdownSignals};

use crate::action::Action;
use crate::config::{self, Config};
use crate::control;
use crate::fanout::{FanoutLimiter, DEFAULT_MAX_SESSIONS_PER_USER};
use crate::registry::{PollTargetKind, SocketRegistry};
use crate::session::{CommSession, ControlSession};

/// Layout of the daemon's runtime paths, normally built from
/// `[workspace.metadata.privleap]` in the workspace manifest.
#[derive(Debug, Clone)]
pub struct Paths {
    pub state_dir: PathBuf,
    pub comm_dir: PathBuf,
    pub control_socket: PathBuf,
    pub config_dir: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("/run/privleap"),
            comm_dir: PathBuf::from("/run/privleap/comm"),
            control_socket: PathBuf::from("/run/privleap/control"),
            config_dir: PathBuf::from("/etc/privleap/conf.d"),
        }
    }
}

/// A fatal condition encountered before or during the accept loop. Always
/// logged at CRITICAL before being returned.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("privleapd must run as root")]
    NotRoot,
    #[error("another privleapd instance (pid {0}) is already running")]
    AlreadyRunning(i32),
    #[error("failed to remove stale state directory {path}: {source}")]
    RemoveStateDir { path: PathBuf, #[source] source: io::Error },
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("failed to create state directory {path}: {source}")]
    CreateStateDir { path: PathBuf, #[source] source: io::Error },
    #[error("failed to write PID file {path}: {source}")]
    WritePidFile { path: PathBuf, #[source] source: io::Error },
    #[error("failed to open control endpoint: {0}")]
    ControlEndpoint(io::Error),
    #[error("failed to install signal handlers: {0}")]
    Signal(#[from] privleap_platform::PlatformError),
    #[error("lost track of comm socket for user '{user}' between poll() and accept()")]
    LostSocket { user: String },
}

const PID_FILE_NAME: &str = "pid";

/// Runs the daemon to completion: every startup step in spec §4.8, then
/// the accept loop.
///
/// The `Ok` type is [`Infallible`]: this function never returns
/// successfully. It only returns at all on a fatal startup error or an
/// internal invariant violation. A graceful shutdown (`SIGTERM`/
/// `SIGINT`) does not return either — once the accept loop and cleanup
/// are done, this re-raises the received signal against the process
/// with its default disposition restored, so the daemon is actually
/// terminated by the signal rather than exiting successfully on its
/// own. Exit code 0 is never produced by a normal run.
///
/// # Errors
///
/// Any [`SupervisorError`]; the caller is expected to have already seen
/// a CRITICAL log line for it and to map it to the matching exit code.
pub fn run(paths: &Paths, test_mode: bool) -> Result<Infallible, SupervisorError> {
    ensure_running_as_root()?;
    verify_not_running_twice(&paths.state_dir.join(PID_FILE_NAME))?;
    remove_stale_state_dir(&paths.state_dir)?;

    let config = config::load(&paths.config_dir)?;
    tracing::info!(
        target: "supervisor",
        actions = config.actions.len(),
        persistent_users = config.persistent_users.len(),
        "configuration loaded"
    );

    populate_state_dir(paths)?;

    let mut registry = SocketRegistry::new(paths.control_socket.clone(), paths.comm_dir.clone());
    registry
        .ensure_control()
        .map_err(SupervisorError::ControlEndpoint)?;
    tracing::info!(target: "supervisor", path = %paths.control_socket.display(), "control endpoint ready");

    for user in &config.persistent_users {
        match registry.create_comm(user) {
            crate::registry::CreateCommOutcome::Ok => {
                tracing::info!(target: "supervisor", user, "persistent comm endpoint created at startup");
            }
            outcome => {
                tracing::error!(target: "supervisor", user, outcome = ?debug_outcome(&outcome), "failed to create persistent comm endpoint at startup");
            }
        }
    }

    let signals = signal::install()?;
    notify_ready();

    let actions = Arc::new(config.actions);
    let limiter = Arc::new(FanoutLimiter::new(DEFAULT_MAX_SESSIONS_PER_USER));

    accept_loop(&mut registry, &actions, &limiter, &signals, test_mode)?;

    notify_stopping();
    terminate_via_received_signal(&signals.shutdown_signal)
}

/// Restores the default disposition for whichever of `SIGTERM`/`SIGINT`
/// set `shutdown_signal` and re-raises it against this process, so the
/// daemon dies by signal rather than returning from `main`.
fn terminate_via_received_signal(shutdown_signal: &std::sync::atomic::AtomicUsize) -> ! {
    use nix::sys::signal::{raise, signal, SigHandler, Signal};

    let raw = shutdown_signal.load(Ordering::SeqCst) as i32;
    let received = Signal::try_from(raw).unwrap_or(Signal::SIGTERM);

    // SAFETY: restoring the default disposition for the signal that is
    // about to be re-raised against this same process; no other thread
    // installs or relies on a handler for it past this point.
    unsafe {
        let _ = signal(received, SigHandler::SigDfl);
    }
    let _ = raise(received);

    // SIGTERM/SIGINT's default disposition terminates the process; this
    // is an unreachable fallback in case that somehow did not happen.
    std::process::exit(128 + raw);
}

fn debug_outcome(outcome: &crate::registry::CreateCommOutcome) -> String {
    format!("{outcome:?}")
}

fn ensure_running_as_root() -> Result<(), SupervisorError> {
    if !nix::unistd::getuid().is_root() {
        privleap_logging::critical!(target: "supervisor", "privleapd must run as root");
        return Err(SupervisorError::NotRoot);
    }
    Ok(())
}

fn verify_not_running_twice(pid_file: &Path) -> Result<(), SupervisorError> {
    let Ok(content) = fs::read_to_string(pid_file) else {
        return Ok(());
    };
    let Ok(pid) = content.trim().parse::<i32>() else {
        return Ok(());
    };
    if nix::sys::signal::kill(Pid::from_raw(pid), None).is_ok() {
        privleap_logging::critical!(target: "supervisor", pid, "cannot run two privleapd processes at the same time");
        return Err(SupervisorError::AlreadyRunning(pid));
    }
    Ok(())
}

fn remove_stale_state_dir(state_dir: &Path) -> Result<(), SupervisorError> {
    if !state_dir.exists() {
        return Ok(());
    }
    fs::remove_dir_all(state_dir).map_err(|source| {
        privleap_logging::critical!(target: "supervisor", path = %state_dir.display(), error = %source, "could not remove stale state directory");
        SupervisorError::RemoveStateDir {
            path: state_dir.to_path_buf(),
            source,
        }
    })
}

fn populate_state_dir(paths: &Paths) -> Result<(), SupervisorError> {
    fs::create_dir_all(&paths.comm_dir).map_err(|source| SupervisorError::CreateStateDir {
        path: paths.comm_dir.clone(),
        source,
    })?;
    let pid_path = paths.state_dir.join(PID_FILE_NAME);
    fs::write(&pid_path, format!("{}\n", std::process::id())).map_err(|source| SupervisorError::WritePidFile {
        path: pid_path.clone(),
        source,
    })?;
    Ok(())
}

#[cfg(all(target_os = "linux", feature = "sd-notify"))]
fn notify_ready() {
    let _ = sd_notify::notify(false, &[sd_notify::NotifyState::Ready]);
}

#[cfg(not(all(target_os = "linux", feature = "sd-notify")))]
fn notify_ready() {}

#[cfg(all(target_os = "linux", feature = "sd-notify"))]
fn notify_stopping() {
    let _ = sd_notify::notify(false, &[sd_notify::NotifyState::Stopping]);
}

#[cfg(not(all(target_os = "linux", feature = "sd-notify")))]
fn notify_stopping() {}

/// Poll timeout between iterations, so the loop periodically rechecks
/// the shutdown/hangup flags even with no socket activity.
const POLL_RECHECK_INTERVAL: Duration = Duration::from_millis(500);

/// Runs the accept loop until a shutdown signal arrives or an internal
/// invariant is violated.
///
/// # Errors
///
/// [`SupervisorError::LostSocket`] if a comm endpoint present in a
/// `poll()` snapshot is no longer registered by the time its turn to be
/// dispatched arrives within the same iteration (it can only have been
/// removed by a `DESTROY` processed earlier in that same iteration,
/// which this loop treats as a logic bug rather than a normal race,
/// since `dispatch_control` and `dispatch_comm` run on the one
/// registry-owning thread).
fn accept_loop(
    registry: &mut SocketRegistry,
    actions: &Arc<Vec<Action>>,
    limiter: &Arc<FanoutLimiter>,
    signals: &ShutdownSignals,
    test_mode: bool,
) -> Result<(), SupervisorError> {
    loop {
        if signals.shutdown.load(Ordering::SeqCst) {
            tracing::info!(target: "supervisor", "shutdown signal received, exiting accept loop");
            return Ok(());
        }
        if signals.hangup.swap(false, Ordering::SeqCst) {
            tracing::info!(
                target: "supervisor",
                "received SIGHUP; configuration hot-reload is not supported, ignoring"
            );
        }

        let targets = registry.poll_targets();
        let mut poll_fds: Vec<PollFd<'_>> = targets
            .iter()
            // SAFETY: each fd comes from a listener owned by `registry`,
            // which outlives this `poll()` call.
            .map(|target| PollFd::new(unsafe { BorrowedFd::borrow_raw(target.fd) }, PollFlags::POLLIN))
            .collect();

        let timeout = PollTimeout::from(POLL_RECHECK_INTERVAL.as_millis() as u16);
        match poll(&mut poll_fds, timeout) {
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => continue,
            Err(err) => {
                tracing::error!(target: "supervisor", error = %err, "poll() failed in accept loop");
                continue;
            }
        }

        for (index, target) in targets.iter().enumerate() {
            let Some(revents) = poll_fds[index].revents() else {
                continue;
            };
            if revents.is_empty() {
                continue;
            }
            match &target.kind {
                PollTargetKind::Control => dispatch_control(registry, test_mode),
                PollTargetKind::Comm(user) => dispatch_comm(registry, user, actions, limiter, test_mode)?,
            }
        }
    }
}

fn dispatch_control(registry: &mut SocketRegistry, test_mode: bool) {
    let stream: UnixStream = match registry.accept_control() {
        Ok(stream) => stream,
        Err(err) => {
            tracing::error!(target: "supervisor", error = %err, "failed to accept control connection");
            return;
        }
    };
    let session = ControlSession::accept(stream, test_mode);
    control::handle(session, registry);
}

fn dispatch_comm(
    registry: &SocketRegistry,
    user: &str,
    actions: &Arc<Vec<Action>>,
    limiter: &Arc<FanoutLimiter>,
    test_mode: bool,
) -> Result<(), SupervisorError> {
    let stream = match registry.accept_comm(user) {
        Ok(stream) => stream,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            privleap_logging::critical!(
                target: "supervisor",
                user,
                "lost track of a comm socket between poll() and accept()"
            );
            return Err(SupervisorError::LostSocket { user: user.to_string() });
        }
        Err(err) => {
            tracing::error!(target: "supervisor", user, error = %err, "failed to accept comm connection");
            return Ok(());
        }
    };
    let session = match CommSession::accept(stream, user, test_mode) {
        Ok(session) => session,
        Err(err) => {
            tracing::warn!(target: "supervisor", user, error = %err, "rejecting comm connection, peer credential mismatch");
            return Ok(());
        }
    };
    let actions = Arc::clone(actions);
    let limiter = Arc::clone(limiter);
    thread::spawn(move || crate::comm::handle(session, &actions, &limiter));
    Ok(())
}
