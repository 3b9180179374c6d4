//! Debug break events.
//!
//! A break event reports a condition a debugger (or an observability hook) should look at: a
//! failed assertion, a misused synchronization object, a thread that looks deadlocked. Unlike a
//! kernel break, raising an event here never terminates or unwinds the caller. The event is logged
//! and handed to the installed [`BreakHandler`], then control returns to the caller, which decides
//! how to continue.

use parking_lot::RwLock;

use crate::thread::{self, ThreadId};

/// Break reasons for debug events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum BreakReason {
    /// Panic
    Panic = 0,
    /// Assert
    Assert = 1,
    /// User
    User = 2,
    /// A thread waited on a lock for longer than the configured deadlock timeout.
    PossibleDeadlock = 3,
}

impl TryFrom<u32> for BreakReason {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(BreakReason::Panic),
            1 => Ok(BreakReason::Assert),
            2 => Ok(BreakReason::User),
            3 => Ok(BreakReason::PossibleDeadlock),
            other => Err(other),
        }
    }
}

/// A raised break event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakEvent {
    /// Why the event was raised.
    pub reason: BreakReason,
    /// Address of the object the event is about (e.g. the deadlocked lock).
    pub address: usize,
    /// Size of the object at `address`, or `0` if not meaningful.
    pub size: usize,
    /// The thread that raised the event.
    pub thread: ThreadId,
}

/// A hook invoked for every raised break event.
pub type BreakHandler = fn(&BreakEvent);

static HANDLER: RwLock<Option<BreakHandler>> = RwLock::new(None);

/// Installs the process-wide break handler, returning the previous one.
///
/// `None` removes the handler; events are then only logged.
pub fn set_break_handler(handler: Option<BreakHandler>) -> Option<BreakHandler> {
    core::mem::replace(&mut *HANDLER.write(), handler)
}

/// Trigger a debug event
///
/// The event is logged at `error` level and passed to the installed break handler, if any.
/// Returns once the handler returns.
///
/// # Arguments
/// * `reason` - The reason for the break event
/// * `address` - Address of the object concerned
/// * `size` - Size of the object concerned, `0` if unknown
pub fn break_event(reason: BreakReason, address: usize, size: usize) {
    let event = BreakEvent {
        reason,
        address,
        size,
        thread: thread::current_thread_id(),
    };

    log::error!(
        "break event: {:?} at {:#x} (size {}) on thread {}",
        event.reason,
        event.address,
        event.size,
        event.thread
    );

    // Copy the handler out so it may itself replace the handler
    let handler = *HANDLER.read();
    if let Some(handler) = handler {
        handler(&event);
    }
}
