//! # Address wait registry
//!
//! A process-wide, lock-free table that maps blocked threads to the address they wait on, so a
//! waker can find and alert exactly those threads without taking a lock.
//!
//! ## Layout
//!
//! ```text
//! HEAD ──► Page ──► Page ──► Page ──► null
//!          ├ next  ├ next  ├ next
//!          └ entries[ENTRIES_PER_PAGE] = { addr, owner }
//! ```
//!
//! - Every live thread that has ever blocked owns exactly one [`Entry`], claimed by CAS-ing
//!   `owner` from `0` to its thread id, cached in a TLS slot and released at thread exit.
//! - `addr` is non-zero only while the owner is blocked (or about to block) on that address. Only
//!   the owner publishes it; wakers _consume_ it by swapping it back to zero before alerting the
//!   owner, so two wakes never land on the same blocked thread.
//! - Pages come from [`nt_svc::mem::reserve_and_commit`], are zero filled, and are never freed
//!   once linked: a scanner may hold a reference to any page at any time. Growth appends a page
//!   at the tail with a single CAS; a thread that loses the race returns its page and retries.

use core::{
    ffi::c_void,
    ops::Deref,
    ptr::{self, NonNull},
    sync::atomic::{AtomicPtr, AtomicUsize, Ordering},
};

use nt_svc::{
    mem::{self, PAGE_SIZE},
    thread::{self, ThreadId},
};
use nt_sys_thread_tls::{self as tls, SlotId};
use static_assertions::const_assert;

/// Number of entries in one registry page.
pub const ENTRIES_PER_PAGE: usize = (PAGE_SIZE - size_of::<usize>()) / size_of::<Entry>();

/// One registry mailbox.
#[derive(Debug)]
#[repr(C)]
pub struct Entry {
    /// The address the owner is blocked on, or `0`.
    addr: AtomicUsize,
    /// The owning thread id, or `0` if the entry is free.
    owner: AtomicUsize,
}

impl Entry {
    /// Publishes `addr` as the address the owner is about to wait on.
    ///
    /// Must only be called by the owner.
    #[inline]
    pub fn publish(&self, addr: usize) {
        self.addr.store(addr, Ordering::SeqCst);
    }

    /// Withdraws the published address.
    ///
    /// Returns `true` if the address was still published, i.e. no waker consumed it.
    #[inline]
    pub fn unpublish(&self) -> bool {
        self.addr.swap(0, Ordering::SeqCst) != 0
    }

    /// Returns `true` if an address is published and has not been consumed yet.
    #[inline]
    pub fn is_published(&self) -> bool {
        self.addr.load(Ordering::SeqCst) != 0
    }

    /// Returns the owning thread, if the entry is claimed.
    pub fn owner(&self) -> Option<ThreadId> {
        // SAFETY: Only thread ids are ever stored in `owner`.
        unsafe { ThreadId::from_raw(self.owner.load(Ordering::Acquire)) }
    }

    /// Consumes the publication of `addr` and alerts the owner.
    ///
    /// Returns `false` if the entry is not published on `addr` (anymore).
    fn consume_and_alert(&self, addr: usize) -> bool {
        if self
            .addr
            .compare_exchange(addr, 0, Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            return false;
        }

        // Read the owner after the swap: until it notices the swap, the owner stays blocked and
        // cannot release the entry. If it changed, the old owner no longer needs the alert.
        if let Some(owner) = self.owner() {
            thread::alert_thread(owner);
        }
        true
    }
}

#[repr(C)]
struct Page {
    next: AtomicPtr<Page>,
    entries: [Entry; ENTRIES_PER_PAGE],
}

const_assert!(size_of::<Page>() <= PAGE_SIZE);
const_assert!(ENTRIES_PER_PAGE > 0);

impl Page {
    /// Allocates a zeroed page: null `next`, every entry free.
    fn allocate() -> Result<NonNull<Page>, RegistryError> {
        let ptr = mem::reserve_and_commit(size_of::<Page>()).map_err(|err| {
            log::warn!("address wait registry: page allocation failed: {err}");
            RegistryError::OutOfMemory
        })?;
        Ok(ptr.cast())
    }

    /// Returns an unlinked page to the kernel.
    ///
    /// # Safety
    ///
    /// `page` must come from [`Page::allocate`] and must never have been linked into the list.
    unsafe fn free(page: NonNull<Page>) {
        unsafe { mem::release(page.cast(), size_of::<Page>()) }
    }
}

/// Head of the page list.
static HEAD: AtomicPtr<Page> = AtomicPtr::new(ptr::null_mut());

/// Iterates over every linked page.
fn pages() -> impl Iterator<Item = &'static Page> {
    let mut next = HEAD.load(Ordering::Acquire);
    core::iter::from_fn(move || {
        // SAFETY: Linked pages are never freed.
        let page = unsafe { next.as_ref() }?;
        next = page.next.load(Ordering::Acquire);
        Some(page)
    })
}

/// Iterates over every entry of every linked page.
fn entries() -> impl Iterator<Item = &'static Entry> {
    pages().flat_map(|page| page.entries.iter())
}

/// Claims a free entry for `tid`, growing the registry if every entry is taken.
///
/// # Errors
///
/// Returns [`RegistryError::OutOfMemory`] if a new page is needed and cannot be allocated.
pub fn acquire_slot(tid: ThreadId) -> Result<&'static Entry, RegistryError> {
    let owner = tid.to_raw();

    loop {
        let mut tail = &HEAD;
        loop {
            // SAFETY: Linked pages are never freed.
            let Some(page) = (unsafe { tail.load(Ordering::Acquire).as_ref() }) else {
                break;
            };

            for entry in &page.entries {
                if entry.owner.load(Ordering::Relaxed) == 0
                    && entry
                        .owner
                        .compare_exchange(0, owner, Ordering::Acquire, Ordering::Relaxed)
                        .is_ok()
                {
                    return Ok(entry);
                }
            }
            tail = &page.next;
        }

        let page = Page::allocate()?;

        // Claim the first entry before the page becomes visible
        // SAFETY: The page is freshly allocated and not shared yet.
        unsafe { page.as_ref() }.entries[0]
            .owner
            .store(owner, Ordering::Relaxed);

        match tail.compare_exchange(
            ptr::null_mut(),
            page.as_ptr(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                log::trace!("address wait registry: linked page {:p}", page.as_ptr());
                // SAFETY: The page is now linked, and linked pages are never freed.
                return Ok(&unsafe { &*page.as_ptr() }.entries[0]);
            }
            Err(_) => {
                // Another thread appended first; its page may have room for us
                // SAFETY: The page was never linked.
                unsafe { Page::free(page) };
            }
        }
    }
}

/// Releases an entry claimed with [`acquire_slot`], making it available to other threads.
///
/// Must only be called by the entry's owner, when it is not waiting.
pub fn release_slot(entry: &'static Entry) {
    entry.addr.store(0, Ordering::Relaxed);
    entry.owner.store(0, Ordering::Release);
}

/// Alerts one thread blocked on `addr`.
///
/// Returns `true` if a waiter was found.
pub fn scan_and_alert_one(addr: usize) -> bool {
    if addr == 0 {
        return false;
    }

    entries().any(|entry| {
        entry.addr.load(Ordering::Relaxed) == addr && entry.consume_and_alert(addr)
    })
}

/// Alerts every thread blocked on `addr`.
///
/// Returns the number of threads alerted.
pub fn scan_and_alert_all(addr: usize) -> usize {
    if addr == 0 {
        return 0;
    }

    entries()
        .filter(|entry| {
            entry.addr.load(Ordering::Relaxed) == addr && entry.consume_and_alert(addr)
        })
        .count()
}

/// Returns the number of threads currently blocked on `addr`.
pub fn count_waiters(addr: usize) -> usize {
    if addr == 0 {
        return 0;
    }

    entries()
        .filter(|entry| entry.addr.load(Ordering::Relaxed) == addr)
        .count()
}

/// A point-in-time view of the registry.
///
/// Computed by a lock-free scan, so the counters are only approximately consistent with each
/// other under concurrent use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Linked pages.
    pub pages: usize,
    /// Total entries over all pages.
    pub entries: usize,
    /// Entries owned by a thread.
    pub claimed: usize,
    /// Entries with a published address.
    pub waiting: usize,
}

/// Returns a snapshot of the registry occupancy.
pub fn stats() -> RegistryStats {
    pages().fold(RegistryStats::default(), |mut stats, page| {
        stats.pages += 1;
        stats.entries += page.entries.len();
        for entry in &page.entries {
            if entry.owner.load(Ordering::Relaxed) != 0 {
                stats.claimed += 1;
            }
            if entry.addr.load(Ordering::Relaxed) != 0 {
                stats.waiting += 1;
            }
        }
        stats
    })
}

/// The calling thread's entry.
///
/// Normally the entry is cached in the thread's TLS and lives until the thread exits. When the
/// TLS is unavailable (no free slot, or the thread is already tearing down its TLS) the entry is
/// temporary and released when the guard is dropped.
pub struct SlotGuard {
    entry: &'static Entry,
    cached: bool,
}

impl Deref for SlotGuard {
    type Target = Entry;

    #[inline]
    fn deref(&self) -> &Entry {
        self.entry
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if !self.cached {
            release_slot(self.entry);
        }
    }
}

/// Returns the calling thread's entry, claiming and caching one on first use.
///
/// # Errors
///
/// Returns [`RegistryError::OutOfMemory`] if the registry had to grow and could not.
pub fn current_slot() -> Result<SlotGuard, RegistryError> {
    let tls_slot = wait_slot_id();

    if let Some(id) = tls_slot {
        if let Ok(cached) = tls::slot_get(id) {
            if let Some(entry) = NonNull::new(cached.cast::<Entry>()) {
                // SAFETY: The TLS slot only ever holds entries claimed by this thread.
                return Ok(SlotGuard {
                    entry: unsafe { &*entry.as_ptr() },
                    cached: true,
                });
            }
        }
    }

    let entry = acquire_slot(thread::current_thread_id())?;
    let cached = tls_slot.is_some_and(|id| {
        tls::slot_set(id, entry as *const Entry as *mut c_void).is_ok()
    });

    Ok(SlotGuard { entry, cached })
}

const NO_TLS_SLOT: usize = usize::MAX;
const TLS_UNAVAILABLE: usize = usize::MAX - 1;

/// The TLS slot caching each thread's entry.
static WAIT_SLOT: AtomicUsize = AtomicUsize::new(NO_TLS_SLOT);

fn wait_slot_id() -> Option<SlotId> {
    resolve_slot(&WAIT_SLOT, || tls::slot_alloc(Some(release_cached_slot)))
}

/// Returns the slot id stored in `cell`, allocating and installing one on first use.
///
/// Exactly one id is ever installed; a thread that loses the race uses the winner's.
fn resolve_slot(cell: &AtomicUsize, alloc: impl FnOnce() -> Option<SlotId>) -> Option<SlotId> {
    match cell.load(Ordering::Acquire) {
        TLS_UNAVAILABLE => None,
        NO_TLS_SLOT => {
            let Some(id) = alloc() else {
                // Another thread may have installed a slot in the meantime
                return match cell.compare_exchange(
                    NO_TLS_SLOT,
                    TLS_UNAVAILABLE,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        log::warn!(
                            "address wait registry: no free TLS slot, entries will not be cached"
                        );
                        None
                    }
                    Err(winner) => SlotId::from_index(winner).ok(),
                };
            };

            match cell.compare_exchange(NO_TLS_SLOT, id.index(), Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => Some(id),
                Err(winner) => {
                    // SAFETY: The slot was never published, so no thread has used it.
                    unsafe { tls::slot_free(id) };
                    SlotId::from_index(winner).ok()
                }
            }
        }
        index => SlotId::from_index(index).ok(),
    }
}

/// TLS destructor: gives the exiting thread's entry back to the registry.
fn release_cached_slot(value: *mut c_void) {
    // SAFETY: The wait slot only ever holds entries claimed by the exiting thread.
    let entry = unsafe { &*value.cast::<Entry>() };
    release_slot(entry);
}

/// Error type for registry growth
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// A new page was needed and could not be allocated.
    #[error("Out of memory")]
    OutOfMemory,
}
