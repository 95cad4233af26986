//! # Overview
//!
//! `privleap-daemon` is the supervisor, socket registry, control/comm
//! handlers, configuration loader and execution engine for `privleapd`,
//! the privleap privilege-delegation daemon. [`run`] is the single entry
//! point the `privleapd` binary calls; everything else in this crate is
//! an implementation detail of that one call.
//!
//! # Design
//!
//! One supervisor thread owns the socket registry and the accept loop;
//! each accepted comm connection is dispatched to a fresh worker thread
//! (capped per-user by [`fanout::FanoutLimiter`]); control connections are
//! handled inline on the supervisor thread since they mutate the
//! registry and are deliberately serialized.
//!
//! # Errors
//!
//! Every fallible stage returns a dedicated `thiserror` enum
//! (`config::ConfigError`, `registry::CreateCommOutcome`,
//! `exec::ExecError`, `supervisor::SupervisorError`, ...); [`run`] maps
//! the terminal outcome to a [`std::process::ExitCode`] via
//! [`exit_code_from`].
//!
//! # See also
//!
//! `bin/privleapd` for the process entry point that calls [`run`].

pub mod action;
pub mod comm;
pub mod config;
pub mod control;
pub mod exec;
pub mod fanout;
pub mod registry;
pub mod session;
pub mod supervisor;

use std::ffi::OsString;
use std::io::Write;
use std::process::ExitCode;

use clap::Parser;

use supervisor::{Paths, SupervisorError};

/// Command-line surface of the daemon process: no positional arguments,
/// a single `--test` flag (spec §6).
#[derive(Debug, Parser)]
#[command(name = "privleapd", about = "privleap privilege-delegation daemon")]
struct Args {
    /// Enables test mode: adds a small send-side delay to stabilize
    /// client/server races in the test harness. Does not otherwise
    /// change protocol semantics.
    #[arg(long = "test")]
    test: bool,
}

/// How the daemon process terminated.
///
/// There is deliberately no `Shutdown`/success variant: per spec §6 the
/// daemon runs until killed, and [`supervisor::run`] enforces this in
/// its own return type (`Result<Infallible, SupervisorError>`) by
/// re-raising whichever of `SIGTERM`/`SIGINT` it received against itself
/// once cleanup is done, rather than ever returning `Ok`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonExit {
    /// A fatal error occurred before or during startup; already logged
    /// at CRITICAL.
    StartupError,
    /// An internal invariant was violated; already logged at CRITICAL.
    InvariantViolation,
}

/// Parses arguments, initializes logging, and runs the supervisor until
/// shutdown or a fatal error.
///
/// `stdout`/`stderr` receive only CLI usage/version output from argument
/// parsing; all runtime logging goes through `privleap-logging` to
/// stderr regardless of what is passed here.
pub fn run<I, T>(args: I, _stdout: &mut impl Write, stderr: &mut impl Write) -> DaemonExit
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let parsed = match Args::try_parse_from(args) {
        Ok(parsed) => parsed,
        Err(err) => {
            let _ = write!(stderr, "{err}");
            return DaemonExit::StartupError;
        }
    };

    privleap_logging::init(parsed.test);

    match supervisor::run(&Paths::default(), parsed.test) {
        Ok(never) => match never {},
        Err(err) => match err {
            SupervisorError::Config(_) => DaemonExit::StartupError,
            _ if is_invariant_violation(&err) => DaemonExit::InvariantViolation,
            _ => DaemonExit::StartupError,
        },
    }
}

/// Whether `err` represents an internal logic invariant being violated
/// (spec §6 exit code 2) rather than an ordinary fatal startup condition
/// (exit code 1). Mirrors the Python original's distinction between
/// `sys.exit(1)` for expected failures and `sys.exit(2)` for "privleapd
/// lost track of a socket" / a mis-parsed control command — conditions
/// that should never happen given the code's own invariants.
fn is_invariant_violation(err: &SupervisorError) -> bool {
    matches!(err, SupervisorError::LostSocket { .. })
}

/// Maps a [`DaemonExit`] to the process exit code spec §6 defines: 1 on
/// fatal startup error, 2 on an internal invariant violation. 0 has no
/// corresponding variant — see [`DaemonExit`]'s doc comment.
#[must_use]
pub fn exit_code_from(status: DaemonExit) -> ExitCode {
    match status {
        DaemonExit::StartupError => ExitCode::from(1),
        DaemonExit::InvariantViolation => ExitCode::from(2),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_flag() {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let status = run(["privleapd", "--bogus"], &mut stdout, &mut stderr);
        assert_eq!(status, DaemonExit::StartupError);
        assert!(!stderr.is_empty());
    }

    #[test]
    fn exit_code_mapping_matches_spec() {
        assert_eq!(exit_code_from(DaemonExit::StartupError), ExitCode::from(1));
        assert_eq!(exit_code_from(DaemonExit::InvariantViolation), ExitCode::from(2));
    }

    #[test]
    fn lost_socket_maps_to_invariant_violation() {
        assert!(is_invariant_violation(&SupervisorError::LostSocket {
            user: "alice".to_string()
        }));
        assert!(!is_invariant_violation(&SupervisorError::NotRoot));
    }
}
