//! Graceful-shutdown signal handling for the supervisor's accept loop.
//!
//! `SIGTERM`/`SIGINT` set a shared flag the accept loop polls between
//! iterations; `SIGHUP` sets a second flag so the supervisor can log an
//! informational line (configuration hot-reload is a Non-goal, so `SIGHUP`
//! is acknowledged, not acted on).

use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::sync::Arc;

use crate::PlatformError;

/// The shared flags the accept loop checks each time it wakes up.
#[derive(Debug, Clone)]
pub struct ShutdownSignals {
    /// Set by `SIGTERM` or `SIGINT`: the accept loop should exit cleanly.
    pub shutdown: Arc<AtomicBool>,
    /// Set by `SIGHUP`: log and clear, no other effect.
    pub hangup: Arc<AtomicBool>,
    /// Raw number of whichever of `SIGTERM`/`SIGINT` set `shutdown` (0
    /// until then), so the supervisor can re-raise the same signal
    /// against itself once it has finished cleaning up, rather than
    /// returning success from `main`.
    pub shutdown_signal: Arc<AtomicUsize>,
}

/// Installs the handlers and returns the flags they set.
///
/// # Errors
///
/// [`PlatformError::SignalHandler`] if `signal_hook` fails to register a
/// handler for any of the three signals.
pub fn install() -> Result<ShutdownSignals, PlatformError> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let hangup = Arc::new(AtomicBool::new(false));
    let shutdown_signal = Arc::new(AtomicUsize::new(0));

    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown))
        .map_err(PlatformError::SignalHandler)?;
    signal_hook::flag::register_usize(
        signal_hook::consts::SIGTERM,
        Arc::clone(&shutdown_signal),
        signal_hook::consts::SIGTERM as usize,
    )
    .map_err(PlatformError::SignalHandler)?;
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown))
        .map_err(PlatformError::SignalHandler)?;
    signal_hook::flag::register_usize(
        signal_hook::consts::SIGINT,
        Arc::clone(&shutdown_signal),
        signal_hook::consts::SIGINT as usize,
    )
    .map_err(PlatformError::SignalHandler)?;
    signal_hook::flag::register(signal_hook::consts::SIGHUP, Arc::clone(&hangup))
        .map_err(PlatformError::SignalHandler)?;

    Ok(ShutdownSignals {
        shutdown,
        hangup,
        shutdown_signal,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn flags_start_clear() {
        let signals = install().unwrap();
        assert!(!signals.shutdown.load(Ordering::SeqCst));
        assert!(!signals.hangup.load(Ordering::SeqCst));
        assert_eq!(signals.shutdown_signal.load(Ordering::SeqCst), 0);
    }
}
