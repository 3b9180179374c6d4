//! FFI bindings for the `nt-sys-sync` crate - Condition variable

use nt_svc::{
    status::{self, Status},
    time::timeout_from_nanos,
};

use crate::{
    condvar::{ConditionVariable, ConditionVariableFlags, SleepError},
    critical_section::CriticalSection,
    srwlock::SrwLock,
};

/// Initializes a condition variable.
///
/// # Safety
///
/// `cv` must be valid for writes and properly aligned.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __nt_sys_sync_condvar_init(cv: *mut ConditionVariable) {
    unsafe { cv.write(ConditionVariable::new()) }
}

/// Leaves `cs`, sleeps, and re-enters `cs`.
///
/// # Returns
///
/// * `SUCCESS` when woken (possibly spuriously)
/// * `TIMEOUT` if the timeout elapsed
/// * `NOT_OWNER` if the caller does not own `cs`
/// * `NO_MEMORY` if the wait could not be set up
///
/// # Safety
///
/// `cv` and `cs` must point to initialized objects.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __nt_sys_sync_condvar_sleep_cs(
    cv: *const ConditionVariable,
    cs: *const CriticalSection,
    timeout_ns: u64,
) -> Status {
    let (cv, cs) = unsafe { (&*cv, &*cs) };
    sleep_status(cv.sleep_cs(cs, timeout_from_nanos(timeout_ns)))
}

/// Releases `lock`, sleeps, and reacquires `lock` in the mode given by `flags`.
///
/// Returns the same statuses as [`__nt_sys_sync_condvar_sleep_cs`].
///
/// # Safety
///
/// `cv` and `lock` must point to initialized objects.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __nt_sys_sync_condvar_sleep_srw(
    cv: *const ConditionVariable,
    lock: *const SrwLock,
    timeout_ns: u64,
    flags: u32,
) -> Status {
    let (cv, lock) = unsafe { (&*cv, &*lock) };
    let flags = ConditionVariableFlags::from_bits_truncate(flags);
    sleep_status(cv.sleep_srw_flags(lock, flags, timeout_from_nanos(timeout_ns)))
}

/// Wakes one sleeper.
///
/// # Safety
///
/// `cv` must point to an initialized condition variable.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __nt_sys_sync_condvar_wake_one(cv: *const ConditionVariable) {
    unsafe { &*cv }.wake_one()
}

/// Wakes every sleeper.
///
/// # Safety
///
/// `cv` must point to an initialized condition variable.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __nt_sys_sync_condvar_wake_all(cv: *const ConditionVariable) {
    unsafe { &*cv }.wake_all()
}

fn sleep_status(result: Result<(), SleepError>) -> Status {
    match result {
        Ok(()) => status::SUCCESS,
        Err(SleepError::TimedOut) => status::TIMEOUT,
        Err(SleepError::NotOwner) => status::NOT_OWNER,
        Err(SleepError::OutOfMemory) => status::NO_MEMORY,
    }
}
