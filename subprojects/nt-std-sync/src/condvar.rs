//! # Condition variable
//!
//! A [`Condvar`] paired with a [`Mutex`](crate::Mutex), backed by a
//! [`ConditionVariable`](nt_sys_sync::ConditionVariable) sleeping on the mutex's SRW lock.
//!
//! Wakeups may be spurious; use [`Condvar::wait_while`] or re-check the condition in a loop.

use core::time::Duration;

use nt_sys_sync::{ConditionVariable, LockMode, SleepError};

use crate::mutex::{self, MutexGuard};

/// Whether a timed wait returned because its timeout elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitTimeoutResult(bool);

impl WaitTimeoutResult {
    /// Returns `true` if the wait timed out.
    #[inline]
    pub fn timed_out(&self) -> bool {
        self.0
    }
}

/// A condition variable
#[derive(Debug, Default)]
pub struct Condvar {
    inner: ConditionVariable,
}

impl Condvar {
    /// Creates a new condition variable.
    #[inline]
    pub const fn new() -> Condvar {
        Condvar {
            inner: ConditionVariable::new(),
        }
    }

    /// Releases the guard's mutex, blocks until notified, and reacquires the mutex.
    pub fn wait<'a, T: ?Sized>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        let _ = self.sleep(&guard, None);
        guard
    }

    /// Like [`wait`](Self::wait), but gives up after `timeout`.
    pub fn wait_timeout<'a, T: ?Sized>(
        &self,
        guard: MutexGuard<'a, T>,
        timeout: Duration,
    ) -> (MutexGuard<'a, T>, WaitTimeoutResult) {
        let timed_out = self.sleep(&guard, Some(timeout)) == Err(SleepError::TimedOut);
        (guard, WaitTimeoutResult(timed_out))
    }

    /// Blocks while `condition` returns `true`.
    pub fn wait_while<'a, T, F>(
        &self,
        mut guard: MutexGuard<'a, T>,
        mut condition: F,
    ) -> MutexGuard<'a, T>
    where
        T: ?Sized,
        F: FnMut(&mut T) -> bool,
    {
        while condition(&mut *guard) {
            guard = self.wait(guard);
        }
        guard
    }

    /// Wakes up one blocked thread.
    #[inline]
    pub fn notify_one(&self) {
        self.inner.wake_one()
    }

    /// Wakes up all blocked threads.
    #[inline]
    pub fn notify_all(&self) {
        self.inner.wake_all()
    }

    fn sleep<T: ?Sized>(
        &self,
        guard: &MutexGuard<'_, T>,
        timeout: Option<Duration>,
    ) -> Result<(), SleepError> {
        // The guard proves the lock is held exclusively
        self.inner
            .sleep_srw(mutex::guard_lock(guard), LockMode::Exclusive, timeout)
    }
}
