//! C FFI bindings for the `nt-sys-sync` crate
//!
//! Every object is passed by pointer to caller-provided storage of the Rust type's size and
//! alignment. Timeouts are in nanoseconds, `u64::MAX` meaning "wait forever". Fallible calls
//! return an [`nt_svc::status::Status`].

mod condvar;
mod critical_section;
mod once;
mod srwlock;
mod wait;
