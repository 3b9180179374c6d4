//! Page reservation.
//!
//! Memory handed out by [`reserve_and_commit`] is page aligned, zero filled and committed up
//! front, so the caller can use it immediately and lock-free. Committed memory is accounted
//! against a process-wide _commit limit_ that can be lowered with [`set_commit_limit`] to exercise
//! out-of-memory paths.

use core::{
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};
use std::alloc::{self, Layout};

/// The size of a memory page, in bytes.
pub const PAGE_SIZE: usize = 0x1000;

/// Bytes currently committed through [`reserve_and_commit`].
static COMMITTED: AtomicUsize = AtomicUsize::new(0);

/// Upper bound for [`COMMITTED`]. `usize::MAX` means unlimited.
static COMMIT_LIMIT: AtomicUsize = AtomicUsize::new(usize::MAX);

/// Reserves and commits `size` bytes of zeroed, page-aligned memory.
///
/// `size` is rounded up to a whole number of pages.
///
/// # Errors
///
/// - [`MemError::InvalidSize`] if `size` is zero or too large to be rounded to a page multiple.
/// - [`MemError::OutOfMemory`] if the commit limit would be exceeded or the allocation fails.
pub fn reserve_and_commit(size: usize) -> Result<NonNull<u8>, MemError> {
    let layout = page_layout(size)?;

    let limit = COMMIT_LIMIT.load(Ordering::Relaxed);
    COMMITTED
        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |committed| {
            committed
                .checked_add(layout.size())
                .filter(|&next| next <= limit)
        })
        .map_err(|_| MemError::OutOfMemory)?;

    // SAFETY: `layout` has a non-zero size.
    let ptr = unsafe { alloc::alloc_zeroed(layout) };
    NonNull::new(ptr).ok_or_else(|| {
        COMMITTED.fetch_sub(layout.size(), Ordering::Relaxed);
        MemError::OutOfMemory
    })
}

/// Releases memory obtained from [`reserve_and_commit`].
///
/// # Safety
///
/// `ptr` must have been returned by [`reserve_and_commit`] called with the same `size`, and must
/// not be used after this call.
pub unsafe fn release(ptr: NonNull<u8>, size: usize) {
    let Ok(layout) = page_layout(size) else {
        return;
    };

    // SAFETY: Upheld by the caller.
    unsafe { alloc::dealloc(ptr.as_ptr(), layout) };
    COMMITTED.fetch_sub(layout.size(), Ordering::Relaxed);
}

/// Sets the process commit limit, in bytes. `None` removes the limit.
///
/// Memory already committed is not affected; only later reservations are checked against the
/// new limit.
pub fn set_commit_limit(limit: Option<usize>) {
    COMMIT_LIMIT.store(limit.unwrap_or(usize::MAX), Ordering::Relaxed);
}

/// Returns the number of bytes currently committed through [`reserve_and_commit`].
pub fn committed_bytes() -> usize {
    COMMITTED.load(Ordering::Relaxed)
}

fn page_layout(size: usize) -> Result<Layout, MemError> {
    if size == 0 {
        return Err(MemError::InvalidSize);
    }

    let rounded = size
        .checked_add(PAGE_SIZE - 1)
        .ok_or(MemError::InvalidSize)?
        & !(PAGE_SIZE - 1);
    Layout::from_size_align(rounded, PAGE_SIZE).map_err(|_| MemError::InvalidSize)
}

/// Error type for [`reserve_and_commit`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MemError {
    /// The requested size is zero or not representable.
    #[error("Invalid size")]
    InvalidSize,
    /// Not enough memory, or the commit limit was reached.
    #[error("Out of memory")]
    OutOfMemory,
}
