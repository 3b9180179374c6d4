//! # nt-svc
//!
//! The kernel services the user-space synchronization core is built on, provided for a hosted
//! target.
//!
//! Every blocking primitive in `nt-sys-sync` ultimately reduces to one of the services in this
//! crate:
//!
//! - [`thread`]: thread identities and the per-thread _alert_ channel (`wait_for_alert` /
//!   `alert_thread`) used by wait-on-address.
//! - [`sync`]: counting semaphores behind opaque handles, used by the critical section
//!   back-compat blocking path.
//! - [`mem`]: zeroed, page-aligned page reservation for the address wait registry.
//! - [`debug`]: structured, non-terminating break events (assertions, suspected deadlocks).
//! - [`process`]: the process shutdown flag.
//!
//! ## C FFI API
//!
//! With the `ffi` feature enabled, the services are also exported with C linkage:
//!
//! ```C
//! #include <nt_svc.h>
//!
//! void notify(uintptr_t tid) {
//!   __nt_svc_alert_thread(tid);  /* Call Rust function */
//! }
//! ```

#[macro_use]
mod handle;

pub mod debug;
pub mod mem;
pub mod process;
pub mod status;
pub mod sync;
pub mod thread;
pub mod time;

#[cfg(feature = "ffi")]
mod ffi;

pub use handle::{Handle, INVALID_HANDLE};
