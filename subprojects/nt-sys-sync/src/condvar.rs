//! # Condition variable
//!
//! A generation counter in one 32-bit word. Sleepers read the generation, release their lock and
//! wait on the counter while it still holds the value they read; wakers bump the counter and wake
//! one or all sleepers. Bumping before waking means a sleeper that released its lock but has not
//! blocked yet sees a changed generation and returns at once.
//!
//! Wakeups can be spurious and carry no ordering guarantee. Callers re-check their predicate after
//! every return.

use core::{
    sync::atomic::{AtomicU32, Ordering},
    time::Duration,
};

use crate::{
    critical_section::CriticalSection,
    diag,
    srwlock::SrwLock,
    wait::{self, WaitError},
};

bitflags::bitflags! {
    /// Flags for [`ConditionVariable::sleep_srw_flags`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ConditionVariableFlags: u32 {
        /// The lock is held in shared mode.
        const LOCKMODE_SHARED = 0x1;
    }
}

/// How an [`SrwLock`] is held while sleeping on a [`ConditionVariable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Exclusive,
    Shared,
}

impl From<ConditionVariableFlags> for LockMode {
    fn from(flags: ConditionVariableFlags) -> Self {
        if flags.contains(ConditionVariableFlags::LOCKMODE_SHARED) {
            LockMode::Shared
        } else {
            LockMode::Exclusive
        }
    }
}

/// Error type for the sleep operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SleepError {
    /// The timeout elapsed. The lock has been reacquired.
    #[error("Timed out")]
    TimedOut,
    /// The caller does not hold the lock in the claimed mode. Nothing was released.
    #[error("Lock not held")]
    NotOwner,
    /// The wait could not be set up. The lock has been reacquired.
    #[error("Out of memory")]
    OutOfMemory,
}

impl From<WaitError> for SleepError {
    fn from(value: WaitError) -> Self {
        match value {
            WaitError::TimedOut => SleepError::TimedOut,
            WaitError::OutOfMemory | WaitError::InvalidSize => SleepError::OutOfMemory,
        }
    }
}

/// A condition variable usable with [`CriticalSection`] and [`SrwLock`].
#[derive(Debug, Default)]
pub struct ConditionVariable {
    generation: AtomicU32,
}

impl ConditionVariable {
    /// Creates a new condition variable.
    pub const fn new() -> Self {
        Self {
            generation: AtomicU32::new(0),
        }
    }

    /// Atomically leaves `cs` and sleeps until woken or `timeout` elapses, then re-enters `cs`.
    ///
    /// Only one level of a recursively entered section is released. `None` sleeps forever.
    ///
    /// # Errors
    ///
    /// - [`SleepError::NotOwner`] if the caller does not own `cs`.
    /// - [`SleepError::TimedOut`] if the timeout elapsed.
    /// - [`SleepError::OutOfMemory`] if the wait could not be set up.
    pub fn sleep_cs(
        &self,
        cs: &CriticalSection,
        timeout: Option<Duration>,
    ) -> Result<(), SleepError> {
        if !cs.is_owned_by_current_thread() {
            diag::contract_violation(
                "sleeping on a critical section not owned by the caller",
                cs as *const CriticalSection as usize,
            );
            return Err(SleepError::NotOwner);
        }

        let generation = self.generation.load(Ordering::Acquire);
        cs.leave();
        let result = wait::wait_on(&self.generation, generation, timeout);
        cs.enter();

        result.map_err(SleepError::from)
    }

    /// Atomically releases `lock` and sleeps until woken or `timeout` elapses, then reacquires
    /// `lock` in `mode`.
    ///
    /// # Errors
    ///
    /// - [`SleepError::NotOwner`] if `lock` is not held in `mode`.
    /// - [`SleepError::TimedOut`] if the timeout elapsed.
    /// - [`SleepError::OutOfMemory`] if the wait could not be set up.
    pub fn sleep_srw(
        &self,
        lock: &SrwLock,
        mode: LockMode,
        timeout: Option<Duration>,
    ) -> Result<(), SleepError> {
        let state = lock.state();
        let held = match mode {
            LockMode::Exclusive => state.is_exclusive(),
            LockMode::Shared => state.is_shared(),
        };
        if !held {
            diag::contract_violation(
                "sleeping on an SRW lock not held in the given mode",
                lock as *const SrwLock as usize,
            );
            return Err(SleepError::NotOwner);
        }

        let generation = self.generation.load(Ordering::Acquire);
        match mode {
            LockMode::Exclusive => lock.release_exclusive(),
            LockMode::Shared => lock.release_shared(),
        }

        let result = wait::wait_on(&self.generation, generation, timeout);

        match mode {
            LockMode::Exclusive => lock.acquire_exclusive(),
            LockMode::Shared => lock.acquire_shared(),
        }

        result.map_err(SleepError::from)
    }

    /// [`sleep_srw`](Self::sleep_srw) with the mode given as flags.
    pub fn sleep_srw_flags(
        &self,
        lock: &SrwLock,
        flags: ConditionVariableFlags,
        timeout: Option<Duration>,
    ) -> Result<(), SleepError> {
        self.sleep_srw(lock, LockMode::from(flags), timeout)
    }

    /// Wakes at least one sleeper, if any.
    #[inline]
    pub fn wake_one(&self) {
        self.generation.fetch_add(1, Ordering::Release);
        wait::wake_one(&self.generation);
    }

    /// Wakes every sleeper.
    #[inline]
    pub fn wake_all(&self) {
        self.generation.fetch_add(1, Ordering::Release);
        wait::wake_all(&self.generation);
    }
}
