//! Timeouts and deadlines.
//!
//! All blocking services take an optional relative timeout (`None` waits forever). Services that
//! may be interrupted and resumed (spurious unparks, stale alerts) convert it into a [`Deadline`]
//! once, so the total time spent waiting never exceeds what the caller asked for.

use std::time::{Duration, Instant};

/// An absolute point in time after which a wait gives up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    /// A deadline that never elapses.
    pub const NEVER: Deadline = Deadline(None);

    /// Computes the deadline `timeout` from now.
    ///
    /// Timeouts too large to be represented are treated as infinite.
    pub fn after(timeout: Option<Duration>) -> Self {
        Deadline(timeout.and_then(|t| Instant::now().checked_add(t)))
    }

    /// Returns the absolute instant, or `None` if the deadline never elapses.
    pub fn instant(&self) -> Option<Instant> {
        self.0
    }

    /// Returns `true` once the deadline is in the past.
    pub fn has_elapsed(&self) -> bool {
        self.0.is_some_and(|at| Instant::now() >= at)
    }

    /// Time left until the deadline, saturating at zero.
    pub fn remaining(&self) -> Option<Duration> {
        self.0.map(|at| at.saturating_duration_since(Instant::now()))
    }
}

/// Converts a raw FFI timeout in nanoseconds into a relative timeout.
///
/// `u64::MAX` means "wait forever".
#[inline]
pub fn timeout_from_nanos(nanos: u64) -> Option<Duration> {
    (nanos != u64::MAX).then(|| Duration::from_nanos(nanos))
}
