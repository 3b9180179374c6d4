//! FFI bindings for the `nt-sys-sync` crate - Run once

use core::ffi::c_void;

use nt_svc::status::{self, Status};

use crate::once::{BeginStatus, RunOnce, RunOnceError, RunOnceFlags};

/// Initializes a run-once gate.
///
/// # Safety
///
/// `once` must be valid for writes and properly aligned.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __nt_sys_sync_once_init(once: *mut RunOnce) {
    unsafe { once.write(RunOnce::new()) }
}

/// Begins initialization.
///
/// # Returns
///
/// * `PENDING` if the caller must initialize and complete the gate
/// * `SUCCESS` if the gate is complete; the context is stored in `context` when non-null
/// * `UNSUCCESSFUL` with `CHECK_ONLY` if the gate is not complete
/// * `INVALID_PARAMETER` for invalid flags or mixed sync/async use
///
/// # Safety
///
/// `once` must point to an initialized gate. `context` must be null or valid for writes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __nt_sys_sync_once_begin_initialize(
    once: *const RunOnce,
    flags: u32,
    context: *mut *mut c_void,
) -> Status {
    let once = unsafe { &*once };
    match once.begin_initialize(RunOnceFlags::from_bits_retain(flags)) {
        Ok(BeginStatus::Pending) => status::PENDING,
        Ok(BeginStatus::Complete(value)) => {
            if !context.is_null() {
                unsafe { context.write(value) };
            }
            status::SUCCESS
        }
        Err(err) => once_status(err),
    }
}

/// Completes initialization, or fails it with the `INIT_FAILED` flag.
///
/// # Safety
///
/// `once` must point to an initialized gate.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __nt_sys_sync_once_complete(
    once: *const RunOnce,
    flags: u32,
    context: *mut c_void,
) -> Status {
    let once = unsafe { &*once };
    match once.complete(RunOnceFlags::from_bits_retain(flags), context) {
        Ok(()) => status::SUCCESS,
        Err(err) => once_status(err),
    }
}

/// Runs `init` exactly once across all callers.
///
/// `init` returns non-zero on success and may store a context through its third argument.
///
/// # Safety
///
/// `once` must point to an initialized gate. `context` must be null or valid for writes. `init`
/// must be safe to call with `param`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __nt_sys_sync_once_execute(
    once: *const RunOnce,
    init: unsafe extern "C" fn(*const RunOnce, *mut c_void, *mut *mut c_void) -> i32,
    param: *mut c_void,
    context: *mut *mut c_void,
) -> Status {
    let once_ref = unsafe { &*once };
    let result = once_ref.execute_once(|| {
        let mut value = core::ptr::null_mut();
        let ok = unsafe { init(once, param, &mut value) };
        (ok != 0).then_some(value)
    });

    match result {
        Ok(value) => {
            if !context.is_null() {
                unsafe { context.write(value) };
            }
            status::SUCCESS
        }
        Err(err) => once_status(err),
    }
}

fn once_status(err: RunOnceError) -> Status {
    match err {
        RunOnceError::InvalidParameter => status::INVALID_PARAMETER,
        RunOnceError::NotComplete | RunOnceError::NotRunning | RunOnceError::InitFailed => {
            status::UNSUCCESSFUL
        }
    }
}
