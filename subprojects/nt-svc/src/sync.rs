//! Counting semaphores
//!
//! Semaphores are kernel objects referenced through opaque [`SemaphoreHandle`]s. A handle stays
//! valid until it is passed to [`close_handle`]; using it afterwards is undefined behaviour, as it
//! would be for a real kernel handle.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::time::Deadline;

kernel_object_handle! {
    /// A handle to a semaphore kernel object.
    pub struct SemaphoreHandle
}

/// The semaphore kernel object.
struct KSemaphore {
    count: Mutex<u32>,
    available: Condvar,
    max: u32,
}

/// Creates a counting semaphore with `initial` available units and a ceiling of `max`.
///
/// # Errors
///
/// Returns [`SemaphoreError::InvalidParameter`] if `max` is zero or `initial > max`.
pub fn create_semaphore(initial: u32, max: u32) -> Result<SemaphoreHandle, SemaphoreError> {
    if max == 0 || initial > max {
        return Err(SemaphoreError::InvalidParameter);
    }

    let object = Box::new(KSemaphore {
        count: Mutex::new(initial),
        available: Condvar::new(),
        max,
    });
    Ok(SemaphoreHandle(Box::into_raw(object) as usize))
}

/// Waits until one unit of the semaphore is available and takes it.
///
/// `None` waits forever.
///
/// # Errors
///
/// Returns [`SemaphoreError::TimedOut`] if no unit became available in time.
pub fn wait_semaphore(
    handle: SemaphoreHandle,
    timeout: Option<Duration>,
) -> Result<(), SemaphoreError> {
    let sem = object(handle)?;
    let deadline = Deadline::after(timeout);

    let mut count = sem.count.lock();
    while *count == 0 {
        match deadline.instant() {
            None => sem.available.wait(&mut count),
            Some(at) => {
                if sem.available.wait_until(&mut count, at).timed_out() && *count == 0 {
                    return Err(SemaphoreError::TimedOut);
                }
            }
        }
    }
    *count -= 1;

    Ok(())
}

/// Returns `count` units to the semaphore, waking up to `count` waiters.
///
/// On success returns the number of units available before the release.
///
/// # Errors
///
/// Returns [`SemaphoreError::LimitExceeded`] if the release would push the semaphore past its
/// maximum; the count is left unchanged in that case.
pub fn release_semaphore(handle: SemaphoreHandle, count: u32) -> Result<u32, SemaphoreError> {
    let sem = object(handle)?;

    let mut current = sem.count.lock();
    let previous = *current;
    match previous.checked_add(count) {
        Some(next) if next <= sem.max => *current = next,
        _ => return Err(SemaphoreError::LimitExceeded),
    }
    drop(current);

    for _ in 0..count {
        sem.available.notify_one();
    }

    Ok(previous)
}

/// Closes a kernel object handle.
///
/// # Safety
///
/// The handle must be valid and no other thread may be using it, or use it afterwards.
pub unsafe fn close_handle(handle: SemaphoreHandle) {
    if handle.is_valid() {
        // SAFETY: Valid handles are pointers obtained from `Box::into_raw` in `create_semaphore`.
        drop(unsafe { Box::from_raw(handle.0 as *mut KSemaphore) });
    }
}

fn object(handle: SemaphoreHandle) -> Result<&'static KSemaphore, SemaphoreError> {
    if !handle.is_valid() {
        return Err(SemaphoreError::InvalidHandle);
    }

    // SAFETY: Valid handles point to live semaphore objects until closed.
    Ok(unsafe { &*(handle.0 as *const KSemaphore) })
}

/// Error type for the semaphore services
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SemaphoreError {
    /// The initial or maximum count is invalid.
    #[error("Invalid parameter")]
    InvalidParameter,
    /// The handle does not refer to a semaphore.
    #[error("Invalid handle")]
    InvalidHandle,
    /// The wait timed out.
    #[error("Timed out")]
    TimedOut,
    /// Releasing would exceed the semaphore maximum count.
    #[error("Semaphore limit exceeded")]
    LimitExceeded,
}
