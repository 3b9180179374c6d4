//! C FFI bindings for nt-sys-thread-tls.

use core::ffi::c_void;

use crate::SlotId;

/// Allocates a dynamic TLS slot without a destructor. Returns the slot index, or `-1` if none is
/// free.
#[unsafe(no_mangle)]
pub extern "C" fn __nt_sys_thread_tls_slot_alloc() -> i32 {
    crate::slot_alloc(None).map_or(-1, |slot| slot.index() as i32)
}

/// Frees a dynamic TLS slot.
///
/// # Safety
///
/// See [`crate::slot_free`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __nt_sys_thread_tls_slot_free(index: usize) {
    if let Ok(slot) = SlotId::from_index(index) {
        unsafe { crate::slot_free(slot) }
    }
}

/// Reads the calling thread's value of a slot. Invalid slots read as null.
#[unsafe(no_mangle)]
pub extern "C" fn __nt_sys_thread_tls_slot_get(index: usize) -> *mut c_void {
    SlotId::from_index(index)
        .and_then(crate::slot_get)
        .unwrap_or(core::ptr::null_mut())
}

/// Writes the calling thread's value of a slot. Returns `false` if the slot is invalid.
#[unsafe(no_mangle)]
pub extern "C" fn __nt_sys_thread_tls_slot_set(index: usize, value: *mut c_void) -> bool {
    SlotId::from_index(index)
        .and_then(|slot| crate::slot_set(slot, value))
        .is_ok()
}
