//! Critical section debug info and the process-wide list of debugged critical sections.
//!
//! Every critical section created with debug info owns one [`DebugInfo`] record. Records are
//! heap-allocated, linked into an intrusive list (so registration and removal do not allocate
//! beyond the record itself), and protected by an internal [`SrwLock`]. A critical section keeps a
//! raw pointer to its record; the record's counters are atomics, so they can be updated without
//! taking the list lock.

use alloc::{boxed::Box, vec::Vec};
use core::{
    cell::UnsafeCell,
    ptr::NonNull,
    sync::atomic::{AtomicU32, Ordering},
};

use intrusive_collections::{LinkedList, LinkedListLink, intrusive_adapter};

use crate::srwlock::SrwLock;

/// Debug record of one critical section.
pub(crate) struct DebugInfo {
    /// Link used by the intrusive linked list.
    link: LinkedListLink,
    name: Option<&'static str>,
    entry_count: AtomicU32,
    contention_count: AtomicU32,
}

intrusive_adapter!(DebugInfoAdapter = Box<DebugInfo>: DebugInfo { link: LinkedListLink });

impl DebugInfo {
    /// Counts an acquisition.
    #[inline]
    pub(crate) fn record_entry(&self) {
        self.entry_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts an acquisition that had to wait.
    #[inline]
    pub(crate) fn record_contention(&self) {
        self.contention_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn name(&self) -> Option<&'static str> {
        self.name
    }

    pub(crate) fn snapshot(&self) -> DebugSnapshot {
        DebugSnapshot {
            name: self.name,
            entry_count: self.entry_count.load(Ordering::Relaxed),
            contention_count: self.contention_count.load(Ordering::Relaxed),
        }
    }
}

/// A copy of a critical section's debug counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebugSnapshot {
    /// The name given at construction, if any.
    pub name: Option<&'static str>,
    /// Number of times the section was acquired (not counting recursion).
    pub entry_count: u32,
    /// Number of acquisitions that had to block.
    pub contention_count: u32,
}

/// The process-wide list of debug records.
struct ProcessLocks {
    lock: SrwLock,
    list: UnsafeCell<Option<LinkedList<DebugInfoAdapter>>>,
}

// SAFETY: `list` is only accessed with `lock` held exclusively.
unsafe impl Sync for ProcessLocks {}

static PROCESS_LOCKS: ProcessLocks = ProcessLocks {
    lock: SrwLock::new(),
    list: UnsafeCell::new(None),
};

impl ProcessLocks {
    fn with<R>(&self, f: impl FnOnce(&mut LinkedList<DebugInfoAdapter>) -> R) -> R {
        struct Unlock<'a>(&'a SrwLock);

        impl Drop for Unlock<'_> {
            fn drop(&mut self) {
                self.0.release_exclusive();
            }
        }

        self.lock.acquire_exclusive();
        let _unlock = Unlock(&self.lock);

        // SAFETY: The lock is held exclusively.
        let list = unsafe { &mut *self.list.get() };
        f(list.get_or_insert_with(|| LinkedList::new(DebugInfoAdapter::new())))
    }
}

/// Allocates a debug record and links it into the process list.
pub(crate) fn attach(name: Option<&'static str>) -> NonNull<DebugInfo> {
    let info = Box::new(DebugInfo {
        link: LinkedListLink::new(),
        name,
        entry_count: AtomicU32::new(0),
        contention_count: AtomicU32::new(0),
    });
    let ptr = NonNull::from(&*info);

    PROCESS_LOCKS.with(|list| list.push_back(info));
    ptr
}

/// Unlinks and frees a debug record.
///
/// # Safety
///
/// `info` must come from [`attach`] and must not be used afterwards.
pub(crate) unsafe fn detach(info: NonNull<DebugInfo>) {
    PROCESS_LOCKS.with(|list| {
        // SAFETY: Records returned by `attach` stay linked until detached.
        let mut cursor = unsafe { list.cursor_mut_from_ptr(info.as_ptr()) };
        drop(cursor.remove());
    });
}

/// Snapshots every critical section that carries debug info, in creation order.
pub fn process_locks() -> Vec<DebugSnapshot> {
    PROCESS_LOCKS.with(|list| list.iter().map(DebugInfo::snapshot).collect())
}
