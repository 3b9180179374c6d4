//! # nt-std-sync
//!
//! Safe, RAII-style wrappers over the `nt-sys-sync` primitives, shaped after `std::sync`.
//!
//! None of the types poison: a panic while a guard is held simply releases the lock.
#![no_std]

#[cfg(test)]
extern crate std;

pub mod condvar;
pub mod mutex;
pub mod once_lock;
pub mod remutex;
mod result;
pub mod rwlock;

pub use self::{
    condvar::{Condvar, WaitTimeoutResult},
    mutex::{Mutex, MutexGuard},
    once_lock::OnceLock,
    remutex::{ReentrantMutex, ReentrantMutexGuard},
    result::{TryLockError, TryLockResult},
    rwlock::{RwLock, RwLockReadGuard, RwLockWriteGuard},
};
