//! # Slim reader/writer lock
//!
//! A reader/writer lock in one 32-bit word, with writer preference: once a thread starts waiting
//! for exclusive access, new shared acquisitions block until every pending writer has been
//! served.
//!
//! The word packs two signed 16-bit fields, see [`SrwState`]. In memory:
//!
//! ```text
//!  byte 0          byte 2
//! ┌────────────────┬────────────────┐
//! │ excl. waiters  │     owners     │
//! └────────────────┴────────────────┘
//! ```
//!
//! Exclusive waiters wait on the address of the `owners` half only, shared waiters on the whole
//! word. The two keys must differ, since a wake consumes the first matching waiter. Releasing exclusive access can therefore wake exactly one writer when one is pending, and
//! every reader otherwise.
//!
//! The lock does not track its owners: acquiring exclusive access recursively deadlocks, and
//! releasing a mode that is not held is reported as a contract violation.

use core::{
    ffi::c_void,
    sync::atomic::{AtomicU32, Ordering},
};

use nt_svc::thread;

use crate::{
    diag,
    wait::{self, WaitError},
};

/// Byte offset of the `owners` half within the lock word.
const OWNERS_OFFSET: usize = 2;

/// Bit positions of the two halves in the integer value, chosen so `owners` lands at
/// [`OWNERS_OFFSET`] in memory.
#[cfg(target_endian = "little")]
const OWNERS_SHIFT: u32 = 16;
#[cfg(target_endian = "big")]
const OWNERS_SHIFT: u32 = 0;
const WAITERS_SHIFT: u32 = 16 - OWNERS_SHIFT;

/// Unpacked view of the lock word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SrwState {
    /// Threads currently trying to acquire exclusive access.
    pub exclusive_waiters: i16,
    /// `-1`: held exclusively, `0`: free, `n > 0`: held shared by `n` threads.
    pub owners: i16,
}

impl SrwState {
    /// Packs the state into the lock word representation.
    #[inline]
    pub const fn pack(self) -> u32 {
        ((self.exclusive_waiters as u16 as u32) << WAITERS_SHIFT)
            | ((self.owners as u16 as u32) << OWNERS_SHIFT)
    }

    /// Unpacks a lock word.
    #[inline]
    pub const fn unpack(raw: u32) -> Self {
        Self {
            exclusive_waiters: (raw >> WAITERS_SHIFT) as u16 as i16,
            owners: (raw >> OWNERS_SHIFT) as u16 as i16,
        }
    }

    /// Returns `true` if the lock is held exclusively.
    #[inline]
    pub const fn is_exclusive(self) -> bool {
        self.owners == -1
    }

    /// Returns `true` if the lock is held shared.
    #[inline]
    pub const fn is_shared(self) -> bool {
        self.owners > 0
    }
}

/// A slim reader/writer lock.
#[derive(Debug, Default)]
#[repr(transparent)]
pub struct SrwLock {
    state: AtomicU32,
}

impl SrwLock {
    /// Creates a new, unlocked lock.
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(0),
        }
    }

    /// Returns a snapshot of the lock state.
    #[inline]
    pub fn state(&self) -> SrwState {
        SrwState::unpack(self.state.load(Ordering::Relaxed))
    }

    /// Returns `true` if the lock is held in any mode.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.state().owners != 0
    }

    /// Returns `true` if the lock is held exclusively.
    #[inline]
    pub fn is_locked_exclusive(&self) -> bool {
        self.state().is_exclusive()
    }

    /// Acquires exclusive access, blocking while the lock is held.
    pub fn acquire_exclusive(&self) {
        // Announce the pending writer first: from here on new readers stay out
        let _ = self.update(Ordering::Relaxed, |s| {
            Some(SrwState {
                exclusive_waiters: s.exclusive_waiters.wrapping_add(1),
                ..s
            })
        });

        loop {
            let raw = self.state.load(Ordering::Relaxed);
            let state = SrwState::unpack(raw);

            if state.owners == 0 {
                let acquired = SrwState {
                    exclusive_waiters: state.exclusive_waiters.wrapping_sub(1),
                    owners: -1,
                };
                if self
                    .state
                    .compare_exchange(raw, acquired.pack(), Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    return;
                }
                continue;
            }

            let observed = state.owners;
            let result = wait::wait_on_key(
                self.owners_key(),
                || SrwState::unpack(self.state.load(Ordering::SeqCst)).owners == observed,
                None,
            );
            if let Err(WaitError::OutOfMemory) = result {
                thread::yield_now();
            }
        }
    }

    /// Acquires shared access, blocking while the lock is held exclusively or a writer is
    /// waiting.
    pub fn acquire_shared(&self) {
        loop {
            let raw = self.state.load(Ordering::Relaxed);
            let state = SrwState::unpack(raw);

            if state.owners != -1 && state.exclusive_waiters == 0 {
                if state.owners == i16::MAX {
                    // Reader count saturated
                    thread::yield_now();
                    continue;
                }

                let acquired = SrwState {
                    owners: state.owners + 1,
                    ..state
                };
                if self
                    .state
                    .compare_exchange(raw, acquired.pack(), Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    return;
                }
                continue;
            }

            if let Err(WaitError::OutOfMemory) = wait::wait_on(&self.state, raw, None) {
                thread::yield_now();
            }
        }
    }

    /// Acquires exclusive access if the lock is free. Never blocks and never counts as a waiting
    /// writer.
    pub fn try_acquire_exclusive(&self) -> bool {
        self.update(Ordering::Acquire, |s| {
            (s.owners == 0).then_some(SrwState { owners: -1, ..s })
        })
        .is_ok()
    }

    /// Acquires shared access if no writer holds the lock or waits for it. Never blocks.
    pub fn try_acquire_shared(&self) -> bool {
        self.update(Ordering::Acquire, |s| {
            (s.owners != -1 && s.owners != i16::MAX && s.exclusive_waiters == 0).then_some(
                SrwState {
                    owners: s.owners + 1,
                    ..s
                },
            )
        })
        .is_ok()
    }

    /// Releases exclusive access.
    ///
    /// Wakes one pending writer if there is one, every blocked reader otherwise.
    pub fn release_exclusive(&self) {
        let released = self.update(Ordering::Release, |s| {
            s.is_exclusive().then_some(SrwState { owners: 0, ..s })
        });

        match released {
            Ok(previous) if previous.exclusive_waiters > 0 => {
                wait::wake_address_single(self.owners_key() as *const c_void)
            }
            Ok(_) => wait::wake_all(&self.state),
            Err(_) => diag::contract_violation(
                "exclusive release of an SRW lock not held exclusively",
                self.addr(),
            ),
        }
    }

    /// Releases shared access.
    ///
    /// The last reader out wakes one pending writer.
    pub fn release_shared(&self) {
        let released = self.update(Ordering::Release, |s| {
            s.is_shared().then_some(SrwState {
                owners: s.owners - 1,
                ..s
            })
        });

        match released {
            Ok(previous) if previous.owners == 1 => {
                wait::wake_address_single(self.owners_key() as *const c_void)
            }
            Ok(_) => {}
            Err(_) => diag::contract_violation(
                "shared release of an SRW lock not held shared",
                self.addr(),
            ),
        }
    }

    /// Applies `f` to the state with a CAS loop. Returns the previous state, or the current one
    /// if `f` declined.
    #[inline]
    fn update(
        &self,
        success: Ordering,
        mut f: impl FnMut(SrwState) -> Option<SrwState>,
    ) -> Result<SrwState, SrwState> {
        self.state
            .fetch_update(success, Ordering::Relaxed, |raw| {
                f(SrwState::unpack(raw)).map(SrwState::pack)
            })
            .map(SrwState::unpack)
            .map_err(SrwState::unpack)
    }

    /// Wait key of the `owners` half.
    #[inline]
    fn owners_key(&self) -> usize {
        self.addr() + OWNERS_OFFSET
    }

    #[inline]
    fn addr(&self) -> usize {
        self as *const Self as usize
    }
}

#[cfg(test)]
mod tests {
    use static_assertions::const_assert_eq;

    use super::*;

    const_assert_eq!(size_of::<SrwLock>(), 4);

    #[test]
    fn owners_half_sits_at_its_wait_key() {
        let lock = SrwLock::new();
        lock.acquire_exclusive();

        // SAFETY: The key lies inside the lock word and is 2-aligned.
        let owners = unsafe { *(lock.owners_key() as *const i16) };
        let waiters = unsafe { *(lock.addr() as *const i16) };
        assert_eq!(owners, -1);
        assert_eq!(waiters, 0);
        assert_ne!(lock.owners_key(), lock.addr());

        lock.release_exclusive();
    }

    #[test]
    fn free_lock_grants_either_mode() {
        let lock = SrwLock::new();

        assert!(lock.try_acquire_exclusive());
        assert!(!lock.try_acquire_shared());
        assert!(!lock.try_acquire_exclusive());
        lock.release_exclusive();

        assert!(lock.try_acquire_shared());
        assert!(lock.try_acquire_shared());
        assert!(!lock.try_acquire_exclusive());
        assert_eq!(lock.state().owners, 2);
        lock.release_shared();
        lock.release_shared();

        assert!(!lock.is_locked());
    }

    #[test]
    fn try_never_counts_as_waiter() {
        let lock = SrwLock::new();
        lock.acquire_shared();

        assert!(!lock.try_acquire_exclusive());
        assert_eq!(lock.state().exclusive_waiters, 0);

        lock.release_shared();
    }

    #[test]
    fn pending_writer_blocks_new_readers() {
        let lock = SrwLock::new();
        lock.acquire_shared();

        // Simulate a writer that announced itself
        lock.state.store(
            SrwState {
                exclusive_waiters: 1,
                owners: 1,
            }
            .pack(),
            Ordering::Relaxed,
        );
        assert!(!lock.try_acquire_shared());
    }

    #[test]
    fn state_snapshot_tracks_modes() {
        let lock = SrwLock::new();
        lock.acquire_exclusive();
        assert!(lock.is_locked_exclusive());
        assert_eq!(lock.state(), SrwState {
            exclusive_waiters: 0,
            owners: -1
        });
        lock.release_exclusive();
        assert_eq!(lock.state(), SrwState::default());
    }
}
