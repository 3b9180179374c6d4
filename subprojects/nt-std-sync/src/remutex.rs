//! # Reentrant Mutex
//!
//! A mutex the owning thread may lock again, backed by a [`CriticalSection`]. Each guard releases
//! one level; the lock is free once every guard of the owner is gone.
//!
//! Guards only give shared access to the data, since several of them can coexist on one thread.
//! Wrap the data in a `Cell` or `RefCell` for mutation.

use core::{fmt, marker::PhantomData, ops::Deref};

use nt_sys_sync::CriticalSection;

pub use crate::result::{TryLockError, TryLockResult};

/// A reentrant mutual exclusion primitive useful for protecting shared data.
pub struct ReentrantMutex<T: ?Sized> {
    inner: CriticalSection,
    data: T,
}

unsafe impl<T: ?Sized + Send> Send for ReentrantMutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for ReentrantMutex<T> {}

impl<T> ReentrantMutex<T> {
    /// Creates an unlocked reentrant mutex. Contended waiters block on a kernel semaphore.
    pub const fn new(data: T) -> Self {
        Self {
            inner: CriticalSection::new(),
            data,
        }
    }

    /// Creates an unlocked reentrant mutex that spins before blocking and is listed in
    /// [`process_locks`](nt_sys_sync::critical_section::process_locks) under `name`.
    pub fn with_debug_name(data: T, spin_count: u32, name: &'static str) -> Self {
        Self {
            inner: CriticalSection::with_debug_name(spin_count, name),
            data,
        }
    }

    /// Consumes the mutex, returning the underlying data.
    pub fn into_inner(self) -> T {
        self.data
    }
}

impl<T: ?Sized> ReentrantMutex<T> {
    /// Acquires the mutex, blocking while another thread holds it.
    pub fn lock(&self) -> ReentrantMutexGuard<'_, T> {
        self.inner.enter();
        ReentrantMutexGuard {
            lock: self,
            _marker: PhantomData,
        }
    }

    /// Acquires the mutex if it is free or already held by the current thread.
    ///
    /// # Errors
    ///
    /// Returns [`TryLockError::WouldBlock`] if another thread holds the mutex.
    pub fn try_lock(&self) -> TryLockResult<ReentrantMutexGuard<'_, T>> {
        if self.inner.try_enter() {
            Ok(ReentrantMutexGuard {
                lock: self,
                _marker: PhantomData,
            })
        } else {
            Err(TryLockError::WouldBlock)
        }
    }

    /// Returns `true` if the current thread holds the mutex.
    pub fn is_owned_by_current_thread(&self) -> bool {
        self.inner.is_owned_by_current_thread()
    }

    /// Returns a mutable reference to the underlying data.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.data
    }
}

impl<T: Default> Default for ReentrantMutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for ReentrantMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("ReentrantMutex");
        match self.try_lock() {
            Ok(guard) => {
                d.field("data", &&*guard);
            }
            Err(TryLockError::WouldBlock) => {
                d.field("data", &format_args!("<locked>"));
            }
        }
        d.finish_non_exhaustive()
    }
}

/// RAII guard releasing one level of a [`ReentrantMutex`] when dropped.
#[must_use = "if unused the ReentrantMutex will immediately unlock"]
#[clippy::has_significant_drop]
pub struct ReentrantMutexGuard<'a, T: ?Sized + 'a> {
    lock: &'a ReentrantMutex<T>,
    // Must be dropped on the owning thread
    _marker: PhantomData<*const ()>,
}

unsafe impl<T: ?Sized + Sync> Sync for ReentrantMutexGuard<'_, T> {}

impl<T: ?Sized> Deref for ReentrantMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.lock.data
    }
}

impl<T: ?Sized> Drop for ReentrantMutexGuard<'_, T> {
    #[inline]
    fn drop(&mut self) {
        self.lock.inner.leave();
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for ReentrantMutexGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

#[cfg(test)]
mod tests {
    use core::cell::Cell;
    use std::{sync::Arc, thread};

    use super::*;

    #[test]
    fn owner_can_lock_again() {
        let mutex = ReentrantMutex::new(Cell::new(0));

        let outer = mutex.lock();
        outer.set(1);
        {
            let inner = mutex.try_lock().unwrap();
            inner.set(inner.get() + 1);
        }
        assert!(mutex.is_owned_by_current_thread());
        assert_eq!(outer.get(), 2);
        drop(outer);

        assert!(!mutex.is_owned_by_current_thread());
    }

    #[test]
    fn other_threads_wait_for_the_last_guard() {
        let mutex = Arc::new(ReentrantMutex::with_debug_name(5u32, 0, "remutex-test"));

        let first = mutex.lock();
        let second = mutex.lock();

        let other = {
            let mutex = Arc::clone(&mutex);
            thread::spawn(move || mutex.try_lock().is_err())
        };
        assert!(other.join().unwrap());

        drop(first);
        drop(second);

        let other = {
            let mutex = Arc::clone(&mutex);
            thread::spawn(move || *mutex.lock())
        };
        assert_eq!(other.join().unwrap(), 5);
    }
}
