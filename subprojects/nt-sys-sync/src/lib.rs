//! # nt-sys-sync
//!
//! User-space synchronization primitives built on a single futex-style primitive.
//!
//! Every blocking object in this crate keeps its whole state in one or two atomic words and is
//! lock-free on its fast path. Slow paths reduce to _wait-on-address_: "block while this word still
//! holds the value I just observed", paired with _wake-address_ on the same word.
//!
//! - [`wait`]: wait-on-address / wake-address and the process-wide address wait registry.
//! - [`RunOnce`]: one-time initialization gate, sync and async flavors.
//! - [`SrwLock`]: slim reader/writer lock with writer preference.
//! - [`ConditionVariable`]: generation-counter condition variable usable with either lock.
//! - [`CriticalSection`]: recursive mutex with spin-then-block acquisition, an optional semaphore
//!   back end and deadlock diagnostics.
//!
//! The kernel services these primitives rely on (thread alerts, semaphores, page reservation,
//! break events, shutdown state) come from `nt-svc`.

#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

#[cfg(feature = "ffi")]
mod ffi;

pub mod condvar;
pub mod config;
pub mod critical_section;
pub mod diag;
pub mod once;
pub mod srwlock;
pub mod wait;

#[doc(inline)]
pub use self::{
    condvar::{ConditionVariable, ConditionVariableFlags, LockMode, SleepError},
    critical_section::{CriticalSection, CriticalSectionFlags},
    once::{BeginStatus, RunOnce, RunOnceError, RunOnceFlags},
    srwlock::{SrwLock, SrwState},
    wait::WaitError,
};
