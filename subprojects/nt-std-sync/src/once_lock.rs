//! # OnceLock
//!
//! A thread-safe cell that can be written to exactly once and thereafter read many times without
//! additional synchronisation cost. Internally it is backed by a [`RunOnce`] gate, so concurrent
//! initialisers block until the first one finishes.
//!
//! The API is modelled after `std::sync::OnceLock`, without poisoning: if the initialiser panics
//! or fails, the gate is reset and the next caller runs its own initialiser.

use core::{cell::UnsafeCell, fmt, mem::MaybeUninit, ptr};

use nt_sys_sync::{BeginStatus, RunOnce, RunOnceFlags};

/// A cell which can be written to only once.
pub struct OnceLock<T> {
    once: RunOnce,
    value: UnsafeCell<MaybeUninit<T>>,
}

// `T` is only accessed after initialisation has completed, which implies a happens-before
// relationship with the writer
unsafe impl<T: Sync + Send> Sync for OnceLock<T> {}
unsafe impl<T: Send> Send for OnceLock<T> {}

impl<T> OnceLock<T> {
    /// Creates an uninitialised cell.
    #[inline]
    pub const fn new() -> Self {
        Self {
            once: RunOnce::new(),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// Returns a reference to the value if it has been initialised.
    #[inline]
    pub fn get(&self) -> Option<&T> {
        if self.once.is_completed() {
            // SAFETY: The gate completes only after the value was written.
            Some(unsafe { (*self.value.get()).assume_init_ref() })
        } else {
            None
        }
    }

    /// Returns a mutable reference to the value if it is initialised.
    #[inline]
    pub fn get_mut(&mut self) -> Option<&mut T> {
        if self.once.is_completed() {
            // SAFETY: Initialised, and `&mut self` guarantees exclusive access.
            Some(unsafe { self.value.get_mut().assume_init_mut() })
        } else {
            None
        }
    }

    /// Sets the contents of the cell to `value`.
    ///
    /// Returns `Err(value)` if the cell was already initialised by this or another thread.
    pub fn set(&self, value: T) -> Result<(), T> {
        if self.once.is_completed() {
            return Err(value);
        }

        match self.once.begin_initialize(RunOnceFlags::empty()) {
            Ok(BeginStatus::Pending) => {
                // SAFETY: This caller is the only initialiser until the gate completes.
                unsafe { (*self.value.get()).write(value) };
                let _ = self.once.complete(RunOnceFlags::empty(), ptr::null_mut());
                Ok(())
            }
            _ => Err(value),
        }
    }

    /// Returns a reference to the value, initialising it with `init` if needed.
    ///
    /// Concurrent callers block until the initialising caller finishes.
    pub fn get_or_init<F>(&self, init: F) -> &T
    where
        F: FnOnce() -> T,
    {
        match self.get_or_try_init(|| Ok::<T, core::convert::Infallible>(init())) {
            Ok(value) => value,
            Err(never) => match never {},
        }
    }

    /// Same as [`get_or_init`](Self::get_or_init), but the initialiser may fail.
    ///
    /// On failure the cell stays uninitialised and the error is returned.
    pub fn get_or_try_init<F, E>(&self, init: F) -> Result<&T, E>
    where
        F: FnOnce() -> Result<T, E>,
    {
        if let Some(value) = self.get() {
            return Ok(value);
        }

        match self.once.begin_initialize(RunOnceFlags::empty()) {
            Ok(BeginStatus::Pending) => {}
            // The gate is only used in sync mode: anything but `Pending` means it is done
            _ => return Ok(self.initialised()),
        }

        let failed = ResetOnDrop(&self.once);
        let value = init()?;
        core::mem::forget(failed);

        // SAFETY: This caller is the only initialiser until the gate completes.
        unsafe { (*self.value.get()).write(value) };
        let _ = self.once.complete(RunOnceFlags::empty(), ptr::null_mut());

        Ok(self.initialised())
    }

    /// Takes the value out, leaving the cell uninitialised.
    pub fn take(&mut self) -> Option<T> {
        if !self.once.is_completed() {
            return None;
        }

        self.once.reset();
        // SAFETY: The value was initialised and the gate no longer says so.
        Some(unsafe { self.value.get_mut().assume_init_read() })
    }

    /// Consumes the cell, returning the value if initialised.
    pub fn into_inner(mut self) -> Option<T> {
        self.take()
    }

    fn initialised(&self) -> &T {
        // SAFETY: Only called once the gate completed.
        unsafe { (*self.value.get()).assume_init_ref() }
    }
}

/// Fails the running initialisation if dropped, so a waiter can take over.
struct ResetOnDrop<'a>(&'a RunOnce);

impl Drop for ResetOnDrop<'_> {
    fn drop(&mut self) {
        let _ = self.0.complete(RunOnceFlags::INIT_FAILED, ptr::null_mut());
    }
}

impl<T> Drop for OnceLock<T> {
    fn drop(&mut self) {
        if self.once.is_completed() {
            // SAFETY: Initialised, and never accessed again.
            unsafe { self.value.get_mut().assume_init_drop() }
        }
    }
}

impl<T> Default for OnceLock<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: fmt::Debug> fmt::Debug for OnceLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_tuple("OnceLock");
        match self.get() {
            Some(v) => d.field(v),
            None => d.field(&format_args!("<uninit>")),
        };
        d.finish()
    }
}

impl<T: Clone> Clone for OnceLock<T> {
    fn clone(&self) -> Self {
        let cell = Self::new();
        if let Some(val) = self.get() {
            let _ = cell.set(val.clone());
        }
        cell
    }
}

impl<T> From<T> for OnceLock<T> {
    fn from(value: T) -> Self {
        let cell = Self::new();
        let _ = cell.set(value);
        cell
    }
}

impl<T: PartialEq> PartialEq for OnceLock<T> {
    fn eq(&self, other: &Self) -> bool {
        self.get() == other.get()
    }
}

impl<T: Eq> Eq for OnceLock<T> {}
