//! # Critical section
//!
//! A recursive mutex with spin-then-block acquisition.
//!
//! ## State
//!
//! - `lock_count`: `-1` when free, otherwise the number of threads waiting for the section while
//!   it is held (`0` = held, uncontended). Recursive acquisitions by the owner count as well.
//! - `recursion_count`: how many times the owner has entered. Non-zero iff held.
//! - `owning_thread`: id of the owner, `0` when free.
//!
//! Acquisition increments `lock_count`; the thread that moves it from `-1` owns the section.
//! Every other thread becomes a waiter, and each release that finds `lock_count` still
//! non-negative hands the section to exactly one waiter.
//!
//! ## Blocking back ends
//!
//! The way waiters block is fixed at construction, see [`Backing`]:
//!
//! - Sections with debug info block on a private futex word through wait-on-address. Release
//!   stores a token in the word and wakes one waiter, which consumes the token.
//! - Sections without debug info (including every [`CriticalSection::new`] section) block on a
//!   kernel semaphore created on first contention.
//!
//! ## Deadlock diagnostics
//!
//! A blocked waiter waits in stages ([`SyncConfig::first_wait`], then
//! [`SyncConfig::second_wait`], then, with the `extended-diagnostics` feature,
//! [`SyncConfig::extended_wait`]), logging the owner each time a stage elapses. Once the total
//! wait exceeds [`SyncConfig::critical_section_timeout`], every further round raises a
//! [`BreakReason::PossibleDeadlock`] break event carrying the section's address, then keeps
//! waiting.
//!
//! During process shutdown waiters do not block at all: `enter` returns immediately, since the
//! owner may already be gone.
//!
//! [`SyncConfig::first_wait`]: crate::config::SyncConfig::first_wait
//! [`SyncConfig::second_wait`]: crate::config::SyncConfig::second_wait
//! [`SyncConfig::extended_wait`]: crate::config::SyncConfig::extended_wait
//! [`SyncConfig::critical_section_timeout`]: crate::config::SyncConfig::critical_section_timeout

mod debug_info;

use core::{
    ptr::NonNull,
    sync::atomic::{AtomicI32, AtomicU32, AtomicUsize, Ordering},
    time::Duration,
};

use nt_svc::{
    debug::{BreakReason, break_event},
    process,
    sync::{self as ksync, SemaphoreError, SemaphoreHandle},
    thread::{self, ThreadId},
    time::Deadline,
};

pub use self::debug_info::{DebugSnapshot, process_locks};
use self::debug_info::DebugInfo;
use crate::{
    config, diag,
    wait::{self, WaitError},
};

/// High bit of a spin count, reserved.
const SPIN_COUNT_RESERVED: u32 = 0x8000_0000;

bitflags::bitflags! {
    /// Construction flags for [`CriticalSection::with_flags`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CriticalSectionFlags: u32 {
        /// Do not attach debug info; waiters block on a kernel semaphore.
        const NO_DEBUG_INFO = 0x0100_0000;
        /// Accepted for compatibility and ignored.
        const DYNAMIC_SPIN = 0x0200_0000;
        /// Accepted for compatibility and ignored.
        const STATIC_INIT = 0x0400_0000;
        /// Attach debug info even if `NO_DEBUG_INFO` is also given.
        const FORCE_DEBUG_INFO = 0x1000_0000;
    }
}

/// How waiters block.
enum Backing {
    /// Token word plus the debug record.
    Futex {
        word: AtomicU32,
        debug: NonNull<DebugInfo>,
    },
    /// Lazily created kernel semaphore, `0` until first contention.
    Semaphore { handle: AtomicUsize },
}

/// A recursive mutex.
pub struct CriticalSection {
    lock_count: AtomicI32,
    recursion_count: AtomicU32,
    owning_thread: AtomicUsize,
    spin_count: AtomicU32,
    backing: Backing,
}

// SAFETY: All state is atomic; the debug record is only read through atomics and is freed by
// `Drop`, which has exclusive access.
unsafe impl Send for CriticalSection {}
unsafe impl Sync for CriticalSection {}

impl CriticalSection {
    /// Creates a critical section without debug info and without spinning.
    ///
    /// Usable in statics. Waiters block on a semaphore created on first contention.
    pub const fn new() -> Self {
        Self {
            lock_count: AtomicI32::new(-1),
            recursion_count: AtomicU32::new(0),
            owning_thread: AtomicUsize::new(0),
            spin_count: AtomicU32::new(0),
            backing: Backing::Semaphore {
                handle: AtomicUsize::new(0),
            },
        }
    }

    /// Creates a critical section with debug info that spins `spin_count` times before
    /// blocking.
    pub fn with_spin_count(spin_count: u32) -> Self {
        Self::with_flags(spin_count, CriticalSectionFlags::empty())
    }

    /// Creates a critical section with debug info carrying `name`.
    pub fn with_debug_name(spin_count: u32, name: &'static str) -> Self {
        Self::build(spin_count, true, Some(name))
    }

    /// Creates a critical section from explicit flags.
    ///
    /// Debug info is attached unless [`CriticalSectionFlags::NO_DEBUG_INFO`] is given without
    /// [`CriticalSectionFlags::FORCE_DEBUG_INFO`].
    pub fn with_flags(spin_count: u32, flags: CriticalSectionFlags) -> Self {
        let ignored =
            flags & (CriticalSectionFlags::DYNAMIC_SPIN | CriticalSectionFlags::STATIC_INIT);
        if !ignored.is_empty() {
            log::debug!("critical section: ignoring flags {ignored:?}");
        }

        let with_debug_info = !flags.contains(CriticalSectionFlags::NO_DEBUG_INFO)
            || flags.contains(CriticalSectionFlags::FORCE_DEBUG_INFO);
        Self::build(spin_count, with_debug_info, None)
    }

    fn build(spin_count: u32, with_debug_info: bool, name: Option<&'static str>) -> Self {
        let backing = if with_debug_info {
            Backing::Futex {
                word: AtomicU32::new(0),
                debug: debug_info::attach(name),
            }
        } else {
            Backing::Semaphore {
                handle: AtomicUsize::new(0),
            }
        };

        Self {
            lock_count: AtomicI32::new(-1),
            recursion_count: AtomicU32::new(0),
            owning_thread: AtomicUsize::new(0),
            spin_count: AtomicU32::new(effective_spin_count(spin_count)),
            backing,
        }
    }

    /// Acquires the section, blocking while another thread owns it.
    ///
    /// The owner may enter again; every `enter` must be balanced by a [`leave`](Self::leave).
    pub fn enter(&self) {
        let tid = thread::current_thread_id().to_raw();

        let spin_count = self.spin_count.load(Ordering::Relaxed);
        if spin_count > 0 {
            if self.try_enter() {
                return;
            }

            for _ in 0..spin_count {
                match self.lock_count.load(Ordering::Relaxed) {
                    -1 => {
                        if self.try_acquire_free(tid) {
                            return;
                        }
                    }
                    // Someone is already queued, spinning will not pay off
                    count if count > 0 => break,
                    _ => {}
                }
                core::hint::spin_loop();
            }
        }

        if self.lock_count.fetch_add(1, Ordering::Acquire) != -1 {
            if self.owning_thread.load(Ordering::Relaxed) == tid {
                self.recursion_count.fetch_add(1, Ordering::Relaxed);
                return;
            }

            self.wait_for_ownership();
        }

        self.take_ownership(tid);
    }

    /// Acquires the section if it is free or already owned by the caller. Never blocks.
    pub fn try_enter(&self) -> bool {
        let tid = thread::current_thread_id().to_raw();

        if self.try_acquire_free(tid) {
            return true;
        }

        if self.owning_thread.load(Ordering::Relaxed) == tid {
            self.lock_count.fetch_add(1, Ordering::Relaxed);
            self.recursion_count.fetch_add(1, Ordering::Relaxed);
            return true;
        }

        false
    }

    /// Releases one level of ownership; the last release hands the section to one waiter.
    ///
    /// Leaving a section the caller does not own is a contract violation.
    pub fn leave(&self) {
        let tid = thread::current_thread_id().to_raw();

        if self.owning_thread.load(Ordering::Relaxed) != tid
            || self.recursion_count.load(Ordering::Relaxed) == 0
        {
            // Shutdown lets several threads through at once, so ownership is unreliable then
            if !process::is_shutting_down() {
                diag::contract_violation(
                    "critical section left by a thread that does not own it",
                    self.addr(),
                );
            }
            return;
        }

        if self.recursion_count.fetch_sub(1, Ordering::Relaxed) > 1 {
            self.lock_count.fetch_sub(1, Ordering::Release);
            return;
        }

        self.owning_thread.store(0, Ordering::Relaxed);
        if self.lock_count.fetch_sub(1, Ordering::Release) - 1 >= 0 {
            self.unwait();
        }
    }

    /// Sets the spin count, returning the previous one.
    ///
    /// The reserved high bit is masked off, and spinning is disabled on single-processor
    /// configurations.
    pub fn set_spin_count(&self, spin_count: u32) -> u32 {
        self.spin_count
            .swap(effective_spin_count(spin_count), Ordering::Relaxed)
    }

    /// Returns the current spin count.
    pub fn spin_count(&self) -> u32 {
        self.spin_count.load(Ordering::Relaxed)
    }

    /// Returns `true` if any thread owns the section.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.lock_count.load(Ordering::Relaxed) >= 0
    }

    /// Returns `true` if the calling thread owns the section.
    #[inline]
    pub fn is_owned_by_current_thread(&self) -> bool {
        self.owning_thread.load(Ordering::Relaxed) == thread::current_thread_id().to_raw()
            && self.recursion_count.load(Ordering::Relaxed) > 0
    }

    /// Returns the owner, if any.
    pub fn owner(&self) -> Option<ThreadId> {
        // SAFETY: Only thread ids are stored in `owning_thread`.
        unsafe { ThreadId::from_raw(self.owning_thread.load(Ordering::Relaxed)) }
    }

    /// Returns how many times the owner has entered, `0` if free.
    pub fn recursion_count(&self) -> u32 {
        self.recursion_count.load(Ordering::Relaxed)
    }

    /// Returns a copy of the debug counters, or `None` for sections without debug info.
    pub fn debug_info(&self) -> Option<DebugSnapshot> {
        self.debug().map(DebugInfo::snapshot)
    }

    fn debug(&self) -> Option<&DebugInfo> {
        match &self.backing {
            // SAFETY: The record lives until `Drop`.
            Backing::Futex { debug, .. } => Some(unsafe { debug.as_ref() }),
            Backing::Semaphore { .. } => None,
        }
    }

    #[inline]
    fn try_acquire_free(&self, tid: usize) -> bool {
        if self
            .lock_count
            .compare_exchange(-1, 0, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.take_ownership(tid);
            return true;
        }
        false
    }

    #[inline]
    fn take_ownership(&self, tid: usize) {
        self.owning_thread.store(tid, Ordering::Relaxed);
        self.recursion_count.store(1, Ordering::Relaxed);
        if let Some(debug) = self.debug() {
            debug.record_entry();
        }
    }

    /// Blocks until a releasing thread hands the section over.
    #[cold]
    fn wait_for_ownership(&self) {
        if let Some(debug) = self.debug() {
            debug.record_contention();
        }

        if process::is_shutting_down() {
            log::warn!(
                "critical section {:#x}: process is shutting down, not waiting",
                self.addr()
            );
            return;
        }

        let config = config::current();
        let stages = [
            Some(config.first_wait),
            Some(config.second_wait),
            cfg!(feature = "extended-diagnostics").then_some(config.extended_wait),
        ];
        let mut remaining = config.critical_section_timeout;

        loop {
            for stage in stages.into_iter().flatten() {
                if self.block_staged(stage).is_ok() {
                    return;
                }

                remaining = remaining.saturating_sub(stage);
                log::warn!(
                    "critical section {:#x} ({}) wait timed out in thread {}, blocked by {:?}, retrying",
                    self.addr(),
                    self.debug().and_then(DebugInfo::name).unwrap_or("unnamed"),
                    thread::current_thread_id(),
                    self.owner(),
                );
            }

            if remaining.is_zero() {
                log::error!(
                    "critical section {:#x}: possible deadlock, owner {:?}",
                    self.addr(),
                    self.owner()
                );
                break_event(BreakReason::PossibleDeadlock, self.addr(), 0);
            }
        }
    }

    /// Blocks for one wait stage, retrying transient failures until the stage elapses.
    fn block_staged(&self, stage: Duration) -> Result<(), WaitError> {
        let deadline = Deadline::after(Some(stage));

        loop {
            match self.block(deadline.remaining()) {
                Err(WaitError::OutOfMemory) if !deadline.has_elapsed() => thread::yield_now(),
                Err(WaitError::OutOfMemory) => return Err(WaitError::TimedOut),
                result => return result,
            }
        }
    }

    /// Waits for the release handoff.
    fn block(&self, timeout: Option<Duration>) -> Result<(), WaitError> {
        match &self.backing {
            Backing::Futex { word, .. } => {
                let deadline = Deadline::after(timeout);
                loop {
                    // Consume the token left by `unwait`
                    if word
                        .compare_exchange(1, 0, Ordering::Acquire, Ordering::Relaxed)
                        .is_ok()
                    {
                        return Ok(());
                    }

                    match wait::wait_on(word, 0, deadline.remaining()) {
                        Ok(()) => {}
                        Err(WaitError::TimedOut) => {
                            return word
                                .compare_exchange(1, 0, Ordering::Acquire, Ordering::Relaxed)
                                .map(|_| ())
                                .map_err(|_| WaitError::TimedOut);
                        }
                        Err(err) => return Err(err),
                    }
                }
            }
            Backing::Semaphore { handle } => {
                let sem = semaphore(handle).map_err(|_| WaitError::OutOfMemory)?;
                match ksync::wait_semaphore(sem, timeout) {
                    Ok(()) => Ok(()),
                    Err(SemaphoreError::TimedOut) => Err(WaitError::TimedOut),
                    Err(err) => {
                        log::error!(
                            "critical section {:#x}: semaphore wait failed: {err}",
                            self.addr()
                        );
                        Err(WaitError::OutOfMemory)
                    }
                }
            }
        }
    }

    /// Hands the section to one waiter.
    fn unwait(&self) {
        match &self.backing {
            Backing::Futex { word, .. } => {
                word.store(1, Ordering::Release);
                wait::wake_one(word);
            }
            Backing::Semaphore { handle } => {
                let result = semaphore(handle).and_then(|sem| ksync::release_semaphore(sem, 1));
                if let Err(err) = result {
                    log::error!(
                        "critical section {:#x}: semaphore release failed: {err}",
                        self.addr()
                    );
                }
            }
        }
    }

    #[inline]
    fn addr(&self) -> usize {
        self as *const Self as usize
    }
}

impl Default for CriticalSection {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CriticalSection {
    fn drop(&mut self) {
        match &mut self.backing {
            Backing::Futex { debug, .. } => {
                // SAFETY: The record came from `attach` and this is its only owner.
                unsafe { debug_info::detach(*debug) };
            }
            Backing::Semaphore { handle } => {
                let raw = *handle.get_mut();
                if raw != 0 {
                    // SAFETY: The handle was created by `semaphore` and nobody can wait on it
                    // anymore.
                    unsafe { ksync::close_handle(SemaphoreHandle::from_raw(raw)) };
                }
            }
        }
    }
}

impl core::fmt::Debug for CriticalSection {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CriticalSection")
            .field("lock_count", &self.lock_count.load(Ordering::Relaxed))
            .field("recursion_count", &self.recursion_count())
            .field("owner", &self.owner())
            .field("spin_count", &self.spin_count())
            .field("debug_info", &self.debug_info())
            .finish()
    }
}

/// Returns the semaphore, creating and installing it on first use.
fn semaphore(handle: &AtomicUsize) -> Result<SemaphoreHandle, SemaphoreError> {
    let raw = handle.load(Ordering::Acquire);
    if raw != 0 {
        // SAFETY: Installed handles stay open until the section is dropped.
        return Ok(unsafe { SemaphoreHandle::from_raw(raw) });
    }

    let created = ksync::create_semaphore(0, 1)?;
    match handle.compare_exchange(0, created.to_raw(), Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => Ok(created),
        Err(installed) => {
            // SAFETY: Our semaphore was never published.
            unsafe { ksync::close_handle(created) };
            // SAFETY: Installed handles stay open until the section is dropped.
            Ok(unsafe { SemaphoreHandle::from_raw(installed) })
        }
    }
}

fn effective_spin_count(spin_count: u32) -> u32 {
    if config::processor_count() <= 1 {
        0
    } else {
        spin_count & !SPIN_COUNT_RESERVED
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, atomic::AtomicBool},
        thread as std_thread,
        vec::Vec,
    };

    use super::*;

    #[test]
    fn recursion_nests() {
        let cs = CriticalSection::with_spin_count(0);

        cs.enter();
        cs.enter();
        assert!(cs.try_enter());
        assert_eq!(cs.recursion_count(), 3);
        assert!(cs.is_owned_by_current_thread());

        cs.leave();
        cs.leave();
        assert!(cs.is_locked());
        cs.leave();

        assert!(!cs.is_locked());
        assert_eq!(cs.owner(), None);
    }

    #[test]
    fn try_enter_fails_while_owned_elsewhere() {
        let cs = Arc::new(CriticalSection::new());
        cs.enter();

        let other = {
            let cs = Arc::clone(&cs);
            std_thread::spawn(move || cs.try_enter())
        };
        assert!(!other.join().unwrap());

        cs.leave();
    }

    #[test]
    fn spin_count_is_masked() {
        let cs = CriticalSection::with_spin_count(0x8000_0fa0);
        let expected = if config::processor_count() > 1 { 0xfa0 } else { 0 };
        assert_eq!(cs.spin_count(), expected);
        assert_eq!(cs.set_spin_count(10), expected);
    }

    #[test]
    fn debug_info_follows_flags() {
        assert!(CriticalSection::new().debug_info().is_none());
        assert!(
            CriticalSection::with_flags(0, CriticalSectionFlags::NO_DEBUG_INFO)
                .debug_info()
                .is_none()
        );
        assert!(
            CriticalSection::with_flags(
                0,
                CriticalSectionFlags::NO_DEBUG_INFO | CriticalSectionFlags::FORCE_DEBUG_INFO
            )
            .debug_info()
            .is_some()
        );
    }

    #[test]
    fn entry_counter_ignores_recursion() {
        let cs = CriticalSection::with_debug_name(0, "entry-counter");

        cs.enter();
        cs.enter();
        cs.leave();
        cs.leave();
        cs.enter();
        cs.leave();

        let info = cs.debug_info().unwrap();
        assert_eq!(info.name, Some("entry-counter"));
        assert_eq!(info.entry_count, 2);
    }

    #[test]
    fn named_sections_are_listed_until_dropped() {
        let cs = CriticalSection::with_debug_name(0, "listed-section");
        assert!(
            process_locks()
                .iter()
                .any(|info| info.name == Some("listed-section"))
        );

        drop(cs);
        assert!(
            !process_locks()
                .iter()
                .any(|info| info.name == Some("listed-section"))
        );
    }

    fn contend(cs: Arc<CriticalSection>) {
        let inside = Arc::new(AtomicBool::new(false));
        let total = Arc::new(AtomicU32::new(0));

        let threads: Vec<_> = (0..4)
            .map(|_| {
                let cs = Arc::clone(&cs);
                let inside = Arc::clone(&inside);
                let total = Arc::clone(&total);
                std_thread::spawn(move || {
                    for _ in 0..500 {
                        cs.enter();
                        assert!(!inside.swap(true, Ordering::SeqCst));
                        total.fetch_add(1, Ordering::Relaxed);
                        inside.store(false, Ordering::SeqCst);
                        cs.leave();
                    }
                })
            })
            .collect();

        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(total.load(Ordering::Relaxed), 2000);
        assert!(!cs.is_locked());
    }

    #[test]
    fn mutual_exclusion_with_futex_backing() {
        contend(Arc::new(CriticalSection::with_spin_count(0)));
    }

    #[test]
    fn mutual_exclusion_with_semaphore_backing() {
        contend(Arc::new(CriticalSection::new()));
    }

    #[test]
    fn mutual_exclusion_with_spinning() {
        contend(Arc::new(CriticalSection::with_spin_count(4000)));
    }
}
