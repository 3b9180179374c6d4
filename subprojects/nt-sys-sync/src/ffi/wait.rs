//! FFI bindings for the `nt-sys-sync` crate - Wait on address

use core::ffi::c_void;

use nt_svc::{
    status::{self, Status},
    time::timeout_from_nanos,
};

use crate::wait::{self, WaitError};

/// Waits until the `size` bytes at `addr` differ from those at `compare`, or a wake arrives.
///
/// # Returns
///
/// * `SUCCESS` when woken or when the value already differed
/// * `TIMEOUT` if the timeout elapsed
/// * `INVALID_PARAMETER` if `size` is not 1, 2, 4 or 8
/// * `NO_MEMORY` if no registry entry could be allocated
///
/// # Safety
///
/// See [`wait::wait_on_address`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __nt_sys_sync_wait_on_address(
    addr: *const c_void,
    compare: *const c_void,
    size: usize,
    timeout_ns: u64,
) -> Status {
    match unsafe { wait::wait_on_address(addr, compare, size, timeout_from_nanos(timeout_ns)) } {
        Ok(()) => status::SUCCESS,
        Err(WaitError::TimedOut) => status::TIMEOUT,
        Err(WaitError::InvalidSize) => status::INVALID_PARAMETER,
        Err(WaitError::OutOfMemory) => status::NO_MEMORY,
    }
}

/// Wakes one thread waiting on `addr`.
#[unsafe(no_mangle)]
pub extern "C" fn __nt_sys_sync_wake_address_single(addr: *const c_void) {
    wait::wake_address_single(addr)
}

/// Wakes every thread waiting on `addr`.
#[unsafe(no_mangle)]
pub extern "C" fn __nt_sys_sync_wake_address_all(addr: *const c_void) {
    wait::wake_address_all(addr)
}
