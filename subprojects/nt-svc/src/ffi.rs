//! FFI bindings for the `nt-svc` crate
//!
//! Timeouts are passed as nanoseconds, with `u64::MAX` meaning "wait forever". Fallible calls
//! return a raw [`Status`].

use crate::{
    debug::{self, BreakReason},
    handle::Handle,
    process,
    status::{self, Status},
    sync::{self, SemaphoreError, SemaphoreHandle},
    thread::{self, ThreadId},
    time::timeout_from_nanos,
};

/// Returns the calling thread's id. Never zero.
#[unsafe(no_mangle)]
pub extern "C" fn __nt_svc_current_thread_id() -> usize {
    thread::current_thread_id().to_raw()
}

/// Alerts the thread identified by `tid`.
///
/// # Safety
///
/// `tid` must be zero (ignored) or a value returned by [`__nt_svc_current_thread_id`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __nt_svc_alert_thread(tid: usize) {
    if let Some(tid) = unsafe { ThreadId::from_raw(tid) } {
        thread::alert_thread(tid);
    }
}

/// Waits for an alert directed at the calling thread.
///
/// Returns [`status::SUCCESS`] if alerted, [`status::TIMEOUT`] otherwise.
#[unsafe(no_mangle)]
pub extern "C" fn __nt_svc_wait_for_alert(timeout_ns: u64) -> Status {
    match thread::wait_for_alert(timeout_from_nanos(timeout_ns)) {
        Ok(()) => status::SUCCESS,
        Err(_) => status::TIMEOUT,
    }
}

/// Creates a semaphore, storing its handle in `out`.
///
/// # Safety
///
/// `out` must be valid for writes and properly aligned.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __nt_svc_create_semaphore(out: *mut Handle, initial: u32, max: u32) -> Status {
    match sync::create_semaphore(initial, max) {
        Ok(handle) => {
            unsafe { out.write(handle.to_raw()) };
            status::SUCCESS
        }
        Err(err) => semaphore_status(err),
    }
}

/// Waits on a semaphore.
///
/// # Safety
///
/// `handle` must be a semaphore handle that has not been closed.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __nt_svc_wait_semaphore(handle: Handle, timeout_ns: u64) -> Status {
    let handle = unsafe { SemaphoreHandle::from_raw(handle) };
    match sync::wait_semaphore(handle, timeout_from_nanos(timeout_ns)) {
        Ok(()) => status::SUCCESS,
        Err(err) => semaphore_status(err),
    }
}

/// Releases `count` units of a semaphore. The previous count is stored in `out_previous` if it
/// is not null.
///
/// # Safety
///
/// `handle` must be a semaphore handle that has not been closed, and `out_previous` must be null
/// or valid for writes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __nt_svc_release_semaphore(
    handle: Handle,
    count: u32,
    out_previous: *mut u32,
) -> Status {
    let handle = unsafe { SemaphoreHandle::from_raw(handle) };
    match sync::release_semaphore(handle, count) {
        Ok(previous) => {
            if !out_previous.is_null() {
                unsafe { out_previous.write(previous) };
            }
            status::SUCCESS
        }
        Err(err) => semaphore_status(err),
    }
}

/// Closes a kernel object handle.
///
/// # Safety
///
/// `handle` must be a valid handle that no other thread is using.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __nt_svc_close_handle(handle: Handle) {
    unsafe { sync::close_handle(SemaphoreHandle::from_raw(handle)) }
}

/// Raises a debug break event. Unknown reasons are reported as [`BreakReason::User`].
#[unsafe(no_mangle)]
pub extern "C" fn __nt_svc_break(reason: u32, address: usize, size: usize) {
    let reason = BreakReason::try_from(reason).unwrap_or(BreakReason::User);
    debug::break_event(reason, address, size);
}

/// Marks the process as shutting down.
#[unsafe(no_mangle)]
pub extern "C" fn __nt_svc_begin_shutdown() {
    process::begin_shutdown()
}

/// Returns `true` if the process is shutting down.
#[unsafe(no_mangle)]
pub extern "C" fn __nt_svc_is_shutting_down() -> bool {
    process::is_shutting_down()
}

fn semaphore_status(err: SemaphoreError) -> Status {
    match err {
        SemaphoreError::InvalidParameter => status::INVALID_PARAMETER,
        SemaphoreError::InvalidHandle => status::INVALID_HANDLE,
        SemaphoreError::TimedOut => status::TIMEOUT,
        SemaphoreError::LimitExceeded => status::SEMAPHORE_LIMIT_EXCEEDED,
    }
}
