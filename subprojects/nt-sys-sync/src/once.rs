//! # RunOnce
//!
//! A one-time initialization gate kept in a single machine word.
//!
//! The low two bits of the word are the state tag, the remaining bits its payload:
//!
//! | tag | state | payload |
//! | --- | --- | --- |
//! | `0` | uninitialized | - |
//! | `1` | running (sync) | head of the waiter list |
//! | `2` | done | context set by the initializer |
//! | `3` | running (async) | - |
//!
//! The first caller of [`RunOnce::begin_initialize`] that finds the gate uninitialized wins it
//! and gets [`BeginStatus::Pending`]; it must finish with [`RunOnce::complete`]. Synchronous
//! callers that arrive while a synchronous initialization is running push a waiter node living on
//! their own stack onto the list in the state word and wait on it. Completing detaches the whole
//! list and signals every node.
//!
//! In asynchronous mode nobody waits: every async caller gets `Pending`, runs the initializer
//! concurrently, and the first one to complete wins. Sync and async callers must not be mixed on
//! one gate.
//!
//! A failed synchronous initialization resets the gate, and the woken waiters race to become the
//! next initializer.
//!
//! ## Memory ordering
//!
//! Completing publishes the context with `Release` (as part of an `AcqRel` CAS) and every
//! observer of the done state loads with `Acquire`, so writes made by the initializer are visible
//! to whoever receives the context.

use core::{
    ffi::c_void,
    mem, ptr,
    sync::atomic::{AtomicU32, AtomicUsize, Ordering},
};

use nt_svc::thread;

use crate::{
    diag,
    wait::{self, WaitError},
};

const TAG_MASK: usize = 0b11;

const UNINIT: usize = 0;
const RUNNING_SYNC: usize = 1;
const DONE: usize = 2;
const RUNNING_ASYNC: usize = 3;

bitflags::bitflags! {
    /// Flags for [`RunOnce::begin_initialize`] and [`RunOnce::complete`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RunOnceFlags: u32 {
        /// Only report whether initialization is done; never block or claim the gate.
        const CHECK_ONLY = 0x1;
        /// Asynchronous mode: concurrent initializers race, nobody waits.
        const ASYNC = 0x2;
        /// The initialization failed (for `complete` only).
        const INIT_FAILED = 0x4;
    }
}

/// Successful outcome of [`RunOnce::begin_initialize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeginStatus {
    /// The caller must run the initializer and call [`RunOnce::complete`].
    Pending,
    /// Initialization is done; carries the context it produced.
    Complete(*mut c_void),
}

/// Error type for [`RunOnce`] operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RunOnceError {
    /// Invalid flag combination, a misaligned context, or sync and async callers mixed.
    #[error("Invalid parameter")]
    InvalidParameter,
    /// A check-only query found the gate not done.
    #[error("Initialization not complete")]
    NotComplete,
    /// The gate is not being initialized; nothing to complete.
    #[error("Initialization not running")]
    NotRunning,
    /// The initializer reported failure.
    #[error("Initialization failed")]
    InitFailed,
}

/// A one-time initialization gate.
///
/// A `RunOnce` may be placed in static storage and used from many threads concurrently. It is
/// zero-initialized, so a zeroed word in C memory is a valid, uninitialized gate.
#[derive(Debug)]
#[repr(transparent)]
pub struct RunOnce {
    state: AtomicUsize,
}

/// A waiter parked on a synchronously running gate.
///
/// Lives on the waiting thread's stack. `signaled` comes first so that the node address is also
/// the wait key.
#[repr(C, align(4))]
struct Waiter {
    signaled: AtomicU32,
    next: usize,
}

impl Waiter {
    /// Blocks until a completer signals this node.
    ///
    /// The node must not go out of scope before it is signaled: the completer reads `next` from
    /// it right before signaling.
    fn wait(&self) {
        while self.signaled.load(Ordering::Acquire) == 0 {
            if let Err(WaitError::OutOfMemory) = wait::wait_on(&self.signaled, 0, None) {
                // Cannot block; keep polling until signaled
                thread::yield_now();
            }
        }
    }
}

impl RunOnce {
    /// Creates an uninitialized gate.
    pub const fn new() -> Self {
        Self {
            state: AtomicUsize::new(UNINIT),
        }
    }

    /// Starts (or joins) initialization.
    ///
    /// - Gate done: returns [`BeginStatus::Complete`] with the context.
    /// - Gate uninitialized: claims it and returns [`BeginStatus::Pending`].
    /// - Sync initialization running: a sync caller blocks until it finishes, then retries.
    /// - Async initialization running: an async caller returns `Pending` as well.
    ///
    /// # Errors
    ///
    /// - [`RunOnceError::NotComplete`] for a [`RunOnceFlags::CHECK_ONLY`] query on a gate that is
    ///   not done.
    /// - [`RunOnceError::InvalidParameter`] for unknown flag bits, `CHECK_ONLY | ASYNC`,
    ///   `INIT_FAILED`, or a caller whose mode does not match the running initialization.
    pub fn begin_initialize(&self, flags: RunOnceFlags) -> Result<BeginStatus, RunOnceError> {
        let is_async = flags.contains(RunOnceFlags::ASYNC);

        if !RunOnceFlags::all().contains(flags) || flags.contains(RunOnceFlags::INIT_FAILED) {
            return Err(RunOnceError::InvalidParameter);
        }

        if flags.contains(RunOnceFlags::CHECK_ONLY) {
            if is_async {
                return Err(RunOnceError::InvalidParameter);
            }

            let state = self.state.load(Ordering::Acquire);
            return match state & TAG_MASK {
                DONE => Ok(BeginStatus::Complete(payload(state))),
                _ => Err(RunOnceError::NotComplete),
            };
        }

        let mut state = self.state.load(Ordering::Acquire);
        loop {
            match state & TAG_MASK {
                UNINIT => {
                    let running = if is_async { RUNNING_ASYNC } else { RUNNING_SYNC };
                    match self.state.compare_exchange(
                        state,
                        running,
                        Ordering::Acquire,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => return Ok(BeginStatus::Pending),
                        Err(actual) => state = actual,
                    }
                }
                DONE => return Ok(BeginStatus::Complete(payload(state))),
                RUNNING_ASYNC => {
                    return if is_async {
                        Ok(BeginStatus::Pending)
                    } else {
                        Err(RunOnceError::InvalidParameter)
                    };
                }
                _ => {
                    if is_async {
                        return Err(RunOnceError::InvalidParameter);
                    }

                    let waiter = Waiter {
                        signaled: AtomicU32::new(0),
                        next: state & !TAG_MASK,
                    };
                    let node = &waiter as *const Waiter as usize;

                    match self.state.compare_exchange(
                        state,
                        node | RUNNING_SYNC,
                        Ordering::Release,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            waiter.wait();
                            state = self.state.load(Ordering::Acquire);
                        }
                        Err(actual) => state = actual,
                    }
                }
            }
        }
    }

    /// Finishes an initialization started with [`BeginStatus::Pending`].
    ///
    /// On success the gate becomes done with `context`, which must have its two low bits clear.
    /// With [`RunOnceFlags::INIT_FAILED`] (sync mode only, null context) the gate goes back to
    /// uninitialized instead. Either way every blocked waiter is woken.
    ///
    /// # Errors
    ///
    /// - [`RunOnceError::InvalidParameter`] for a misaligned context, an invalid flag
    ///   combination, or a mode that does not match the running initialization.
    /// - [`RunOnceError::NotRunning`] if the gate is not being initialized. For an async caller
    ///   this just means another initializer completed first; for a sync caller it is reported as
    ///   a contract violation.
    pub fn complete(&self, flags: RunOnceFlags, context: *mut c_void) -> Result<(), RunOnceError> {
        let is_async = flags.contains(RunOnceFlags::ASYNC);
        let failed = flags.contains(RunOnceFlags::INIT_FAILED);
        let context = context as usize;

        if !RunOnceFlags::all().contains(flags)
            || flags.contains(RunOnceFlags::CHECK_ONLY)
            || context & TAG_MASK != 0
        {
            return Err(RunOnceError::InvalidParameter);
        }
        if failed && (context != 0 || is_async) {
            return Err(RunOnceError::InvalidParameter);
        }

        let next = if failed { UNINIT } else { context | DONE };

        let mut state = self.state.load(Ordering::Acquire);
        loop {
            match state & TAG_MASK {
                RUNNING_SYNC => {
                    if is_async {
                        return Err(RunOnceError::InvalidParameter);
                    }

                    match self.state.compare_exchange(
                        state,
                        next,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            // SAFETY: The list was detached by the CAS above and its nodes stay
                            // alive until signaled.
                            unsafe { signal_waiters(state & !TAG_MASK) };
                            return Ok(());
                        }
                        Err(actual) => state = actual,
                    }
                }
                RUNNING_ASYNC => {
                    if !is_async {
                        return Err(RunOnceError::InvalidParameter);
                    }

                    return self
                        .state
                        .compare_exchange(state, next, Ordering::AcqRel, Ordering::Acquire)
                        .map(|_| ())
                        .map_err(|_| RunOnceError::NotRunning);
                }
                _ => {
                    if !is_async {
                        diag::contract_violation(
                            "run-once gate completed while no initialization is running",
                            self as *const Self as usize,
                        );
                    }
                    return Err(RunOnceError::NotRunning);
                }
            }
        }
    }

    /// Runs `init` exactly once across all callers and returns the context it produced.
    ///
    /// Callers arriving while `init` runs block until it finishes. If `init` returns `None` (or
    /// panics) the gate is reset, one of the blocked callers runs its own `init`, and this caller
    /// gets [`RunOnceError::InitFailed`].
    pub fn execute_once<F>(&self, init: F) -> Result<*mut c_void, RunOnceError>
    where
        F: FnOnce() -> Option<*mut c_void>,
    {
        match self.begin_initialize(RunOnceFlags::empty())? {
            BeginStatus::Complete(context) => Ok(context),
            BeginStatus::Pending => {
                let guard = FailOnUnwind(self);
                let result = init();
                mem::forget(guard);

                let Some(context) = result else {
                    self.complete(RunOnceFlags::INIT_FAILED, ptr::null_mut())?;
                    return Err(RunOnceError::InitFailed);
                };

                if let Err(err) = self.complete(RunOnceFlags::empty(), context) {
                    // Misaligned context: release the waiters instead of leaving the gate running
                    let _ = self.complete(RunOnceFlags::INIT_FAILED, ptr::null_mut());
                    return Err(err);
                }

                Ok(context)
            }
        }
    }

    /// Returns `true` if initialization is done.
    #[inline]
    pub fn is_completed(&self) -> bool {
        self.state.load(Ordering::Acquire) & TAG_MASK == DONE
    }

    /// Returns the context if initialization is done.
    #[inline]
    pub fn context(&self) -> Option<*mut c_void> {
        let state = self.state.load(Ordering::Acquire);
        (state & TAG_MASK == DONE).then(|| payload(state))
    }

    /// Resets a gate to uninitialized.
    ///
    /// Exclusive access guarantees that nobody is waiting on the gate.
    pub fn reset(&mut self) {
        *self.state.get_mut() = UNINIT;
    }
}

impl Default for RunOnce {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
fn payload(state: usize) -> *mut c_void {
    (state & !TAG_MASK) as *mut c_void
}

/// Wakes every waiter in a detached list.
///
/// # Safety
///
/// `head` must be a list detached from a gate by a successful completing CAS.
unsafe fn signal_waiters(mut head: usize) {
    while head != 0 {
        let node = head as *const Waiter;

        // SAFETY: The node stays alive until `signaled` is set; read its link before that.
        let (next, signaled) = unsafe { ((*node).next, &(*node).signaled as *const AtomicU32) };
        unsafe { (*signaled).store(1, Ordering::Release) };

        // The node may be gone now; its address is only used as a key
        wait::wake_address_single(signaled.cast());
        head = next;
    }
}

/// Completes the gate as failed if the initializer unwinds.
struct FailOnUnwind<'a>(&'a RunOnce);

impl Drop for FailOnUnwind<'_> {
    fn drop(&mut self) {
        let _ = self.0.complete(RunOnceFlags::INIT_FAILED, ptr::null_mut());
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        thread as std_thread,
        time::Duration,
        vec::Vec,
    };

    use super::*;

    fn ctx(value: usize) -> *mut c_void {
        value as *mut c_void
    }

    #[test]
    fn first_caller_wins_and_others_see_context() {
        let once = RunOnce::new();

        assert_eq!(
            once.begin_initialize(RunOnceFlags::empty()),
            Ok(BeginStatus::Pending)
        );
        assert_eq!(once.complete(RunOnceFlags::empty(), ctx(0x40)), Ok(()));

        assert_eq!(
            once.begin_initialize(RunOnceFlags::empty()),
            Ok(BeginStatus::Complete(ctx(0x40)))
        );
        assert!(once.is_completed());
        assert_eq!(once.context(), Some(ctx(0x40)));
    }

    #[test]
    fn check_only_never_claims() {
        let once = RunOnce::new();

        assert_eq!(
            once.begin_initialize(RunOnceFlags::CHECK_ONLY),
            Err(RunOnceError::NotComplete)
        );
        assert_eq!(
            once.begin_initialize(RunOnceFlags::CHECK_ONLY | RunOnceFlags::ASYNC),
            Err(RunOnceError::InvalidParameter)
        );
        assert_eq!(
            once.begin_initialize(RunOnceFlags::empty()),
            Ok(BeginStatus::Pending)
        );
    }

    #[test]
    fn unknown_flag_bits_are_rejected() {
        let once = RunOnce::new();
        let unknown = RunOnceFlags::from_bits_retain(0x100);

        assert_eq!(
            once.begin_initialize(unknown),
            Err(RunOnceError::InvalidParameter)
        );
        assert_eq!(
            once.begin_initialize(unknown | RunOnceFlags::CHECK_ONLY),
            Err(RunOnceError::InvalidParameter)
        );
        assert!(!once.is_completed());

        // The gate was not claimed by the rejected calls
        assert_eq!(
            once.begin_initialize(RunOnceFlags::empty()),
            Ok(BeginStatus::Pending)
        );
        assert_eq!(
            once.complete(unknown, ctx(0x40)),
            Err(RunOnceError::InvalidParameter)
        );
        assert_eq!(once.complete(RunOnceFlags::empty(), ctx(0x40)), Ok(()));
    }

    #[test]
    fn misaligned_context_is_rejected() {
        let once = RunOnce::new();
        once.begin_initialize(RunOnceFlags::empty()).unwrap();

        assert_eq!(
            once.complete(RunOnceFlags::empty(), ctx(0x41)),
            Err(RunOnceError::InvalidParameter)
        );
        assert_eq!(
            once.complete(RunOnceFlags::INIT_FAILED, ctx(0x40)),
            Err(RunOnceError::InvalidParameter)
        );
    }

    #[test]
    fn failed_init_resets_gate() {
        let once = RunOnce::new();
        once.begin_initialize(RunOnceFlags::empty()).unwrap();
        assert_eq!(
            once.complete(RunOnceFlags::INIT_FAILED, ptr::null_mut()),
            Ok(())
        );

        assert!(!once.is_completed());
        assert_eq!(
            once.begin_initialize(RunOnceFlags::empty()),
            Ok(BeginStatus::Pending)
        );
    }

    #[test]
    fn async_callers_race_and_first_completion_wins() {
        let once = RunOnce::new();

        assert_eq!(
            once.begin_initialize(RunOnceFlags::ASYNC),
            Ok(BeginStatus::Pending)
        );
        assert_eq!(
            once.begin_initialize(RunOnceFlags::ASYNC),
            Ok(BeginStatus::Pending)
        );
        assert_eq!(
            once.begin_initialize(RunOnceFlags::empty()),
            Err(RunOnceError::InvalidParameter)
        );

        assert_eq!(once.complete(RunOnceFlags::ASYNC, ctx(0x100)), Ok(()));
        assert_eq!(
            once.complete(RunOnceFlags::ASYNC, ctx(0x200)),
            Err(RunOnceError::NotRunning)
        );
        assert_eq!(once.context(), Some(ctx(0x100)));
    }

    #[test]
    fn async_caller_rejected_while_sync_running() {
        let once = RunOnce::new();
        once.begin_initialize(RunOnceFlags::empty()).unwrap();

        assert_eq!(
            once.begin_initialize(RunOnceFlags::ASYNC),
            Err(RunOnceError::InvalidParameter)
        );
        assert_eq!(
            once.complete(RunOnceFlags::ASYNC, ctx(0x40)),
            Err(RunOnceError::InvalidParameter)
        );
    }

    #[test]
    fn reset_makes_gate_reusable() {
        let mut once = RunOnce::new();
        once.execute_once(|| Some(ctx(0x80))).unwrap();

        once.reset();
        assert!(!once.is_completed());
        assert_eq!(once.execute_once(|| Some(ctx(0xC0))), Ok(ctx(0xC0)));
    }

    #[test]
    fn execute_once_runs_initializer_exactly_once() {
        let once = Arc::new(RunOnce::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let once = Arc::clone(&once);
                let runs = Arc::clone(&runs);
                std_thread::spawn(move || {
                    once.execute_once(|| {
                        runs.fetch_add(1, Ordering::SeqCst);
                        std_thread::sleep(Duration::from_millis(30));
                        Some(ctx(0x1000))
                    })
                    .map(|p| p as usize)
                })
            })
            .collect();

        for thread in threads {
            assert_eq!(thread.join().unwrap().map(|p| p as *mut c_void), Ok(ctx(0x1000)));
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn waiters_retry_after_failed_initializer() {
        let once = Arc::new(RunOnce::new());
        let attempts = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..4)
            .map(|_| {
                let once = Arc::clone(&once);
                let attempts = Arc::clone(&attempts);
                std_thread::spawn(move || {
                    once.execute_once(|| {
                        std_thread::sleep(Duration::from_millis(10));
                        // The first attempt fails, the second succeeds
                        match attempts.fetch_add(1, Ordering::SeqCst) {
                            0 => None,
                            _ => Some(ctx(0x2000)),
                        }
                    })
                    .map(|p| p as usize)
                })
            })
            .collect();

        let results: Vec<_> = threads
            .into_iter()
            .map(|t| t.join().unwrap().map(|p| p as *mut c_void))
            .collect();

        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(
            results
                .iter()
                .filter(|r| **r == Err(RunOnceError::InitFailed))
                .count(),
            1
        );
        assert_eq!(
            results.iter().filter(|r| **r == Ok(ctx(0x2000))).count(),
            3
        );
    }

    #[test]
    fn panicking_initializer_resets_gate() {
        let once = RunOnce::new();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = once.execute_once(|| panic!("initializer failed"));
        }));
        assert!(result.is_err());

        assert!(!once.is_completed());
        assert_eq!(once.execute_once(|| Some(ctx(0x40))), Ok(ctx(0x40)));
    }
}
