//! FFI bindings for the `nt-sys-sync` crate - Critical section

use crate::critical_section::{CriticalSection, CriticalSectionFlags};

/// Initializes a critical section with debug info and no spinning.
///
/// # Safety
///
/// `cs` must be valid for writes and properly aligned.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __nt_sys_sync_critical_section_init(cs: *mut CriticalSection) {
    unsafe { cs.write(CriticalSection::with_spin_count(0)) }
}

/// Initializes a critical section with a spin count and flags.
///
/// # Safety
///
/// `cs` must be valid for writes and properly aligned.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __nt_sys_sync_critical_section_init_ex(
    cs: *mut CriticalSection,
    spin_count: u32,
    flags: u32,
) {
    let flags = CriticalSectionFlags::from_bits_truncate(flags);
    unsafe { cs.write(CriticalSection::with_flags(spin_count, flags)) }
}

/// Finalizes a critical section, releasing its semaphore and debug info.
///
/// # Safety
///
/// `cs` must point to an initialized critical section that nobody owns or waits on. It must not
/// be used again before being re-initialized.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __nt_sys_sync_critical_section_delete(cs: *mut CriticalSection) {
    unsafe { cs.drop_in_place() }
}

/// Enters the critical section.
///
/// # Safety
///
/// `cs` must point to an initialized critical section.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __nt_sys_sync_critical_section_enter(cs: *const CriticalSection) {
    unsafe { &*cs }.enter()
}

/// Tries to enter the critical section without blocking.
///
/// # Safety
///
/// `cs` must point to an initialized critical section.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __nt_sys_sync_critical_section_try_enter(cs: *const CriticalSection) -> bool {
    unsafe { &*cs }.try_enter()
}

/// Leaves the critical section.
///
/// # Safety
///
/// `cs` must point to an initialized critical section.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __nt_sys_sync_critical_section_leave(cs: *const CriticalSection) {
    unsafe { &*cs }.leave()
}

/// Sets the spin count, returning the previous one.
///
/// # Safety
///
/// `cs` must point to an initialized critical section.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __nt_sys_sync_critical_section_set_spin_count(
    cs: *const CriticalSection,
    spin_count: u32,
) -> u32 {
    unsafe { &*cs }.set_spin_count(spin_count)
}
