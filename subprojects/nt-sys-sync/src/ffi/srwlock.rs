//! FFI bindings for the `nt-sys-sync` crate - SRW lock

use crate::srwlock::SrwLock;

/// Initializes the lock.
///
/// # Safety
///
/// `lock` must be valid for writes and properly aligned.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __nt_sys_sync_srwlock_init(lock: *mut SrwLock) {
    unsafe { lock.write(SrwLock::new()) }
}

/// Acquires the lock exclusively.
///
/// # Safety
///
/// `lock` must point to an initialized lock.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __nt_sys_sync_srwlock_acquire_exclusive(lock: *const SrwLock) {
    unsafe { &*lock }.acquire_exclusive()
}

/// Acquires the lock shared.
///
/// # Safety
///
/// `lock` must point to an initialized lock.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __nt_sys_sync_srwlock_acquire_shared(lock: *const SrwLock) {
    unsafe { &*lock }.acquire_shared()
}

/// Tries to acquire the lock exclusively without blocking.
///
/// # Safety
///
/// `lock` must point to an initialized lock.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __nt_sys_sync_srwlock_try_acquire_exclusive(lock: *const SrwLock) -> bool {
    unsafe { &*lock }.try_acquire_exclusive()
}

/// Tries to acquire the lock shared without blocking.
///
/// # Safety
///
/// `lock` must point to an initialized lock.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __nt_sys_sync_srwlock_try_acquire_shared(lock: *const SrwLock) -> bool {
    unsafe { &*lock }.try_acquire_shared()
}

/// Releases exclusive access.
///
/// # Safety
///
/// `lock` must point to an initialized lock.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __nt_sys_sync_srwlock_release_exclusive(lock: *const SrwLock) {
    unsafe { &*lock }.release_exclusive()
}

/// Releases shared access.
///
/// # Safety
///
/// `lock` must point to an initialized lock.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __nt_sys_sync_srwlock_release_shared(lock: *const SrwLock) {
    unsafe { &*lock }.release_shared()
}
