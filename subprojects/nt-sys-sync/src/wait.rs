//! # Wait-on-address / wake-address
//!
//! The futex primitive every blocking object in this crate is built on.
//!
//! A waiter calls `wait_on_*` with the exact value it just observed in some word. If the word still
//! holds that value the thread blocks until a waker calls `wake_address_*` on the same address (or
//! the timeout elapses). If the word already changed, the call returns immediately, so a caller
//! that performs its state-changing CAS _before_ waiting can never miss a wakeup.
//!
//! ## Protocol
//!
//! Waiter:
//! 1. return if the value already differs;
//! 2. publish the key in the thread's registry entry;
//! 3. `SeqCst` fence, then re-check the value (a waker that changed it before step 2 is seen
//!    here);
//! 4. block on the thread alert until the publication is consumed or the deadline passes;
//! 5. withdraw the publication.
//!
//! Waker: change the value, `SeqCst` fence, scan the registry and consume matching publications,
//! alerting their owners.
//!
//! Either the waiter's re-check sees the new value or the waker's scan sees the publication, so
//! wakeups are never lost. Wakeups may be spurious: callers always re-check their own state after
//! a successful wait.

pub mod registry;

use core::{
    ffi::c_void,
    sync::atomic::{self, AtomicU8, AtomicU16, AtomicU32, AtomicU64, AtomicUsize, Ordering},
    time::Duration,
};

use nt_svc::{thread, time::Deadline};

use self::registry::RegistryError;

/// Error type for the wait operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WaitError {
    /// The timeout elapsed before a wake.
    #[error("Timed out")]
    TimedOut,
    /// The calling thread has no registry entry and one could not be allocated.
    #[error("Out of memory")]
    OutOfMemory,
    /// The compare size is not 1, 2, 4 or 8 bytes.
    #[error("Invalid size")]
    InvalidSize,
}

impl From<RegistryError> for WaitError {
    fn from(value: RegistryError) -> Self {
        match value {
            RegistryError::OutOfMemory => WaitError::OutOfMemory,
        }
    }
}

/// Blocks while `still_expected()` holds, until `key` is woken or `timeout` elapses.
///
/// `key` is an arbitrary non-zero address identifying the wait queue; `still_expected` reads the
/// guarded state. The two may differ, which lets a caller wait on a sub-word of a larger atomic
/// while comparing the whole word.
///
/// Returns `Ok(())` when woken or when the state no longer matched, which callers must treat
/// alike.
pub fn wait_on_key(
    key: usize,
    still_expected: impl Fn() -> bool,
    timeout: Option<Duration>,
) -> Result<(), WaitError> {
    if !still_expected() {
        return Ok(());
    }

    let slot = registry::current_slot()?;
    let deadline = Deadline::after(timeout);

    slot.publish(key);
    atomic::fence(Ordering::SeqCst);

    if !still_expected() {
        slot.unpublish();
        return Ok(());
    }

    loop {
        match thread::wait_for_alert_until(deadline) {
            // Still published: the alert was left over from an earlier wait
            Ok(()) if slot.is_published() => continue,
            Ok(()) => return Ok(()),
            Err(_) => {
                return if slot.unpublish() {
                    Err(WaitError::TimedOut)
                } else {
                    // Woken right at the deadline
                    Ok(())
                };
            }
        }
    }
}

/// Waits until the memory at `addr` no longer holds the `size` bytes at `compare`, or a wake
/// arrives.
///
/// `size` must be 1, 2, 4 or 8. `None` waits forever.
///
/// # Errors
///
/// - [`WaitError::InvalidSize`] for any other `size`.
/// - [`WaitError::TimedOut`] if the timeout elapsed.
/// - [`WaitError::OutOfMemory`] if the calling thread could not get a registry entry.
///
/// # Safety
///
/// `addr` must be valid for atomic reads of `size` bytes and aligned to `size` for the whole
/// call, and `compare` must be valid for reads of `size` bytes.
pub unsafe fn wait_on_address(
    addr: *const c_void,
    compare: *const c_void,
    size: usize,
    timeout: Option<Duration>,
) -> Result<(), WaitError> {
    macro_rules! wait_sized {
        ($atomic:ty, $int:ty) => {{
            // SAFETY: Upheld by the caller.
            let word = unsafe { <$atomic>::from_ptr(addr.cast_mut().cast()) };
            let expected = unsafe { compare.cast::<$int>().read_unaligned() };
            wait_on(word, expected, timeout)
        }};
    }

    match size {
        1 => wait_sized!(AtomicU8, u8),
        2 => wait_sized!(AtomicU16, u16),
        4 => wait_sized!(AtomicU32, u32),
        8 => wait_sized!(AtomicU64, u64),
        _ => Err(WaitError::InvalidSize),
    }
}

/// Waits until `word` no longer holds `expected`, or a wake on `word` arrives.
///
/// The safe front end of [`wait_on_address`].
pub fn wait_on<A: AtomicWord>(
    word: &A,
    expected: A::Value,
    timeout: Option<Duration>,
) -> Result<(), WaitError> {
    let key = word as *const A as usize;
    wait_on_key(key, || word.load_word() == expected, timeout)
}

/// Wakes one thread waiting on `addr`. No-op if `addr` is null.
pub fn wake_address_single(addr: *const c_void) {
    if addr.is_null() {
        return;
    }

    atomic::fence(Ordering::SeqCst);
    registry::scan_and_alert_one(addr as usize);
}

/// Wakes every thread waiting on `addr`. No-op if `addr` is null.
pub fn wake_address_all(addr: *const c_void) {
    if addr.is_null() {
        return;
    }

    atomic::fence(Ordering::SeqCst);
    registry::scan_and_alert_all(addr as usize);
}

/// Wakes one thread waiting on `word`.
#[inline]
pub fn wake_one<A: AtomicWord>(word: &A) {
    wake_address_single((word as *const A).cast());
}

/// Wakes every thread waiting on `word`.
#[inline]
pub fn wake_all<A: AtomicWord>(word: &A) {
    wake_address_all((word as *const A).cast());
}

/// An atomic integer that can be waited on.
pub trait AtomicWord: private::Sealed {
    /// The plain integer type.
    type Value: Copy + Eq;

    /// Loads the current value.
    fn load_word(&self) -> Self::Value;
}

macro_rules! impl_atomic_word {
    ($($atomic:ty => $int:ty),* $(,)?) => {$(
        impl AtomicWord for $atomic {
            type Value = $int;

            #[inline]
            fn load_word(&self) -> $int {
                self.load(Ordering::SeqCst)
            }
        }

        impl private::Sealed for $atomic {}
    )*};
}

impl_atomic_word! {
    AtomicU8 => u8,
    AtomicU16 => u16,
    AtomicU32 => u32,
    AtomicU64 => u64,
    AtomicUsize => usize,
}

mod private {
    pub trait Sealed {}
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread as std_thread, time::Instant};

    use super::*;

    #[test]
    fn changed_value_returns_immediately() {
        let word = AtomicU32::new(1);
        assert_eq!(wait_on(&word, 0, None), Ok(()));
    }

    #[test]
    fn unchanged_value_times_out() {
        let word = AtomicU32::new(7);
        let start = Instant::now();

        assert_eq!(
            wait_on(&word, 7, Some(Duration::from_millis(30))),
            Err(WaitError::TimedOut)
        );
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn invalid_size_is_rejected() {
        let word = AtomicU32::new(0);
        let compare = 0u32;
        let result = unsafe {
            wait_on_address(
                (&word as *const AtomicU32).cast(),
                (&compare as *const u32).cast(),
                3,
                None,
            )
        };
        assert_eq!(result, Err(WaitError::InvalidSize));
    }

    #[test]
    fn raw_wait_compares_bytes() {
        let word = AtomicU16::new(0x1234);
        let different = 0x4321u16;
        let result = unsafe {
            wait_on_address(
                (&word as *const AtomicU16).cast(),
                (&different as *const u16).cast(),
                2,
                None,
            )
        };
        assert_eq!(result, Ok(()));
    }

    #[test]
    fn wake_releases_waiter() {
        let word = Arc::new(AtomicU32::new(0));

        let waiter = {
            let word = Arc::clone(&word);
            std_thread::spawn(move || {
                while word.load(Ordering::SeqCst) == 0 {
                    wait_on(&*word, 0, None).unwrap();
                }
            })
        };

        std_thread::sleep(Duration::from_millis(20));
        word.store(1, Ordering::SeqCst);
        wake_all(&*word);

        waiter.join().unwrap();
    }

    #[test]
    fn wake_one_wakes_exactly_one_of_two() {
        let word = Arc::new(AtomicU32::new(0));
        let woken = Arc::new(AtomicU32::new(0));

        let waiters: std::vec::Vec<_> = (0..2)
            .map(|_| {
                let word = Arc::clone(&word);
                let woken = Arc::clone(&woken);
                std_thread::spawn(move || {
                    if wait_on(&*word, 0, Some(Duration::from_secs(2))).is_ok() {
                        woken.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        let key = &*word as *const AtomicU32 as usize;
        while registry::count_waiters(key) < 2 {
            std_thread::yield_now();
        }
        wake_one(&*word);

        for waiter in waiters {
            waiter.join().unwrap();
        }
        assert_eq!(woken.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn null_wake_is_noop() {
        wake_address_single(core::ptr::null());
        wake_address_all(core::ptr::null());
    }
}
