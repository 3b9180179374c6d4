//! Process lifetime state.
//!
//! Once shutdown has begun, blocking on a lock whose owner may already be gone can hang the exit
//! path forever. Synchronization services consult [`is_shutting_down`] to skip such waits.

use core::sync::atomic::{AtomicBool, Ordering};

static SHUTTING_DOWN: AtomicBool = AtomicBool::new(false);

/// Marks the process as shutting down. There is no way back.
pub fn begin_shutdown() {
    if !SHUTTING_DOWN.swap(true, Ordering::SeqCst) {
        log::debug!("process shutdown started");
    }
}

/// Returns `true` once [`begin_shutdown`] has been called.
#[inline]
pub fn is_shutting_down() -> bool {
    SHUTTING_DOWN.load(Ordering::Acquire)
}
