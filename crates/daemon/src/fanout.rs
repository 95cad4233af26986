//! Per-user concurrency cap on in-flight comm sessions (spec §5's
//! "Fan-out bound" extension point, implemented rather than left as a
//! design note).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

/// Default per-user cap on concurrently running comm sessions.
pub const DEFAULT_MAX_SESSIONS_PER_USER: u32 = 4;

/// Thread-safe per-user in-flight session counter.
pub struct FanoutLimiter {
    max_per_user: u32,
    counts: DashMap<String, Arc<AtomicU32>>,
}

impl FanoutLimiter {
    #[must_use]
    pub fn new(max_per_user: u32) -> Self {
        Self {
            max_per_user,
            counts: DashMap::new(),
        }
    }

    /// Attempts to reserve one slot for `user`. Returns `None` (and
    /// reserves nothing) if `user` is already at the cap; the caller
    /// should reply `TRIGGER_ERROR` and close without consulting the
    /// action table.
    pub fn try_acquire(&self, user: &str) -> Option<FanoutGuard> {
        let counter = self
            .counts
            .entry(user.to_string())
            .or_insert_with(|| Arc::new(AtomicU32::new(0)))
            .clone();

        let mut current = counter.load(Ordering::Acquire);
        loop {
            if current >= self.max_per_user {
                return None;
            }
            match counter.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(FanoutGuard { counter }),
                Err(observed) => current = observed,
            }
        }
    }
}

/// RAII guard: releases the reserved slot on drop.
pub struct FanoutGuard {
    counter: Arc<AtomicU32>,
}

impl Drop for FanoutGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caps_concurrent_sessions_per_user() {
        let limiter = FanoutLimiter::new(2);
        let a = limiter.try_acquire("alice").unwrap();
        let b = limiter.try_acquire("alice").unwrap();
        assert!(limiter.try_acquire("alice").is_none());
        drop(a);
        assert!(limiter.try_acquire("alice").is_some());
        drop(b);
    }

    #[test]
    fn counters_are_independent_per_user() {
        let limiter = FanoutLimiter::new(1);
        let _alice = limiter.try_acquire("alice").unwrap();
        assert!(limiter.try_acquire("bob").is_some());
    }
}
