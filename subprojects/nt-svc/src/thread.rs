//! Thread identities and thread alerts.
//!
//! Every thread that touches a synchronization service is lazily bound to a _thread object_: a
//! process-lifetime record holding the thread's alert flag. The address of that object is the
//! thread's [`ThreadId`], so an id is always non-zero and pointer-sized, and can be stored in an
//! atomic word and turned back into something that can be alerted.
//!
//! Thread objects are never freed. When a thread exits its object goes back to a free pool and is
//! handed to the next thread that needs one, which keeps the set of objects bounded by the peak
//! number of live threads.
//!
//! ## Alerts
//!
//! An alert is a sticky, single-bit wakeup directed at one thread:
//! - [`alert_thread`] sets the target's flag and unparks it if it is blocked.
//! - [`wait_for_alert`] consumes the flag, blocking until it is set or the timeout elapses.
//!
//! An alert sent while the target is not waiting is not lost: the next `wait_for_alert` returns
//! immediately. Callers must therefore tolerate _stale_ alerts and re-check their own condition.

use core::{
    cell::Cell,
    fmt,
    num::NonZeroUsize,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};
use std::time::Duration;

use parking_lot::Mutex;
use parking_lot_core::{DEFAULT_PARK_TOKEN, DEFAULT_UNPARK_TOKEN, ParkResult};
use static_assertions::assert_eq_size;

use crate::time::Deadline;

/// Per-thread kernel object.
#[repr(align(8))]
struct ThreadObject {
    /// The sticky alert flag.
    alerted: AtomicBool,
}

/// Retired thread objects available for reuse.
static FREE_OBJECTS: Mutex<Vec<&'static ThreadObject>> = Mutex::new(Vec::new());

thread_local! {
    /// The calling thread's object, bound on first use.
    static CURRENT: Cell<Option<&'static ThreadObject>> = const { Cell::new(None) };

    /// Returns the thread's object to the free pool at thread exit.
    static RETIRE: RetireOnExit = const { RetireOnExit };
}

struct RetireOnExit;

impl Drop for RetireOnExit {
    fn drop(&mut self) {
        if let Some(object) = CURRENT.with(Cell::take) {
            object.alerted.store(false, Ordering::Relaxed);
            FREE_OBJECTS.lock().push(object);
        }
    }
}

/// Binds a thread object to the calling thread, reusing a retired one if possible.
fn bind_current() -> &'static ThreadObject {
    let object = FREE_OBJECTS.lock().pop().unwrap_or_else(|| {
        Box::leak(Box::new(ThreadObject {
            alerted: AtomicBool::new(false),
        }))
    });
    CURRENT.with(|cur| cur.set(Some(object)));

    // Past its destructor (i.e. during TLS teardown) the object is simply never retired
    let _ = RETIRE.try_with(|_| ());

    object
}

#[inline]
fn current_object() -> &'static ThreadObject {
    CURRENT.with(Cell::get).unwrap_or_else(bind_current)
}

/// A process-unique, non-zero identifier of a live thread.
///
/// Identifiers of exited threads may be reused by threads created later.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ThreadId(NonZeroUsize);

// Ids travel through atomic words and C as a plain `usize`, zero meaning "none"
assert_eq_size!(ThreadId, Option<ThreadId>, usize);

impl ThreadId {
    /// Returns the raw, non-zero representation of the id.
    #[inline]
    pub fn to_raw(self) -> usize {
        self.0.get()
    }

    /// Converts a raw value back into a [`ThreadId`].
    ///
    /// Returns `None` if `raw` is zero.
    ///
    /// # Safety
    ///
    /// A non-zero `raw` must have been obtained from [`ThreadId::to_raw`].
    #[inline]
    pub unsafe fn from_raw(raw: usize) -> Option<Self> {
        NonZeroUsize::new(raw).map(ThreadId)
    }

    #[inline]
    fn object(self) -> &'static ThreadObject {
        // SAFETY: Thread ids are addresses of leaked, never-freed thread objects.
        unsafe { &*(self.0.get() as *const ThreadObject) }
    }
}

impl fmt::Debug for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ThreadId({:#x})", self.0)
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Returns the identifier of the calling thread.
#[inline]
pub fn current_thread_id() -> ThreadId {
    let object = current_object();
    // SAFETY: References are never null.
    ThreadId(unsafe { NonZeroUsize::new_unchecked(object as *const ThreadObject as usize) })
}

/// Sends an alert to the thread identified by `tid`.
///
/// If the thread is blocked in [`wait_for_alert`] it is woken up, otherwise the alert stays
/// pending until its next call. Alerting a thread that has already exited is harmless: the
/// thread object is reset before it is reused.
pub fn alert_thread(tid: ThreadId) {
    let object = tid.object();
    object.alerted.store(true, Ordering::Release);

    // SAFETY: The park key is the address of a live thread object; no park-lot callbacks are
    // involved on the unpark side.
    unsafe { parking_lot_core::unpark_all(tid.to_raw(), DEFAULT_UNPARK_TOKEN) };
}

/// Blocks the calling thread until it is alerted or `timeout` elapses.
///
/// A pending alert is consumed and returned immediately. `None` waits forever.
pub fn wait_for_alert(timeout: Option<Duration>) -> Result<(), AlertWaitError> {
    wait_for_alert_until(Deadline::after(timeout))
}

/// Blocks the calling thread until it is alerted or `deadline` is reached.
pub fn wait_for_alert_until(deadline: Deadline) -> Result<(), AlertWaitError> {
    let object = current_object();
    let key = object as *const ThreadObject as usize;

    loop {
        if object.alerted.swap(false, Ordering::Acquire) {
            return Ok(());
        }

        // SAFETY: The validate callback only reads an atomic, and neither callback panics or
        // calls back into the parking lot.
        let result = unsafe {
            parking_lot_core::park(
                key,
                || !object.alerted.load(Ordering::Acquire),
                || {},
                |_, _| {},
                DEFAULT_PARK_TOKEN,
                deadline.instant(),
            )
        };

        if let ParkResult::TimedOut = result {
            // An alert may have landed between the timeout and now
            return if object.alerted.swap(false, Ordering::Acquire) {
                Ok(())
            } else {
                Err(AlertWaitError::TimedOut)
            };
        }
    }
}

/// Error type for [`wait_for_alert`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AlertWaitError {
    /// No alert arrived before the timeout elapsed.
    #[error("Timed out")]
    TimedOut,
}

/// Yields the remainder of the calling thread's time slice.
#[inline]
pub fn yield_now() {
    std::thread::yield_now();
}

static PROCESSOR_COUNT: AtomicUsize = AtomicUsize::new(0);

/// Returns the number of processors available to the process (at least `1`).
///
/// The value is queried once and cached.
pub fn processor_count() -> usize {
    match PROCESSOR_COUNT.load(Ordering::Relaxed) {
        0 => {
            let count = std::thread::available_parallelism().map_or(1, NonZeroUsize::get);
            PROCESSOR_COUNT.store(count, Ordering::Relaxed);
            count
        }
        count => count,
    }
}
