//! # Dynamic Thread-Local Storage (TLS) slots
//!
//! Every thread owns an array of [`NUM_TLS_SLOTS`] pointer-sized _slots_. Slot ids are
//! process-global: a slot allocated with [`slot_alloc`] can be read and written by every thread,
//! each thread seeing its own value. This is the storage the synchronization core uses to cache a
//! thread's wait-registry entry without a lookup on every wait.
//!
//! ## Design
//!
//! 1. **Global usage bit-mask** `SLOTS_USED_MASK` tracks which slot ids are allocated. Atomic RMW
//!    operations allow concurrent allocation/free without a global lock.
//! 2. **Destructor table** `SLOTS_DESTRUCTORS` stores an optional destructor per slot, invoked for
//!    every non-null value when the owning thread exits.
//! 3. **Generations** Each allocation bumps the slot's generation. A thread's cell remembers the
//!    generation it was written under, so a value left behind by a previous owner of the slot id
//!    reads as null. This replaces walking every live thread to clear the new slot.
//!
//! A thread's slots are reachable until its TLS is torn down. Calls made after that point (from
//! other thread-local destructors) fail with [`SlotError::ThreadExiting`].

use core::{
    cell::Cell,
    ffi::c_void,
    ptr,
    sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, Ordering},
};

use static_assertions::const_assert;

#[cfg(feature = "ffi")]
pub mod ffi;

/// Number of dynamic TLS slots per thread.
pub const NUM_TLS_SLOTS: usize = 27;

const_assert!(NUM_TLS_SLOTS <= 64);

/// Bitmask with the lowest `NUM_TLS_SLOTS` bits set to 1.
const VALID_SLOT_MASK: u64 = (1u64 << NUM_TLS_SLOTS) - 1;

/// A destructor run on a slot's non-null value at thread exit.
pub type SlotDestructor = fn(*mut c_void);

/// TLS dynamic slots used bitmask.
static SLOTS_USED_MASK: AtomicU64 = AtomicU64::new(0);

/// TLS dynamic slots destructors, stored as type-erased function pointers.
static SLOTS_DESTRUCTORS: [AtomicPtr<()>; NUM_TLS_SLOTS] =
    [const { AtomicPtr::new(ptr::null_mut()) }; NUM_TLS_SLOTS];

/// Allocation generation of each slot id.
static SLOTS_GENERATION: [AtomicU32; NUM_TLS_SLOTS] = [const { AtomicU32::new(0) }; NUM_TLS_SLOTS];

/// The identifier of an allocated dynamic TLS slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct SlotId(usize);

impl SlotId {
    /// Returns the slot index (`0..NUM_TLS_SLOTS`).
    pub fn index(self) -> usize {
        self.0
    }

    /// Converts a raw index into a [`SlotId`], checking bounds only.
    pub fn from_index(index: usize) -> Result<Self, SlotError> {
        if index >= NUM_TLS_SLOTS {
            return Err(SlotError::OutOfBounds(index));
        }
        Ok(SlotId(index))
    }
}

/// One per-thread slot cell.
#[derive(Clone, Copy)]
struct SlotValue {
    generation: u32,
    value: *mut c_void,
}

struct ThreadSlots {
    cells: [Cell<SlotValue>; NUM_TLS_SLOTS],
}

impl ThreadSlots {
    const fn new() -> Self {
        const EMPTY: SlotValue = SlotValue {
            generation: 0,
            value: ptr::null_mut(),
        };
        Self {
            cells: [const { Cell::new(EMPTY) }; NUM_TLS_SLOTS],
        }
    }
}

impl Drop for ThreadSlots {
    /// Run the destructors for the slots that are currently in use.
    ///
    /// The slot is cleared before its destructor runs.
    fn drop(&mut self) {
        let mut mask = SLOTS_USED_MASK.load(Ordering::Acquire) & VALID_SLOT_MASK;
        while mask != 0 {
            let index = mask.trailing_zeros() as usize;
            mask &= !(1u64 << index);

            let cell = self.cells[index].replace(SlotValue {
                generation: 0,
                value: ptr::null_mut(),
            });
            if cell.value.is_null()
                || cell.generation != SLOTS_GENERATION[index].load(Ordering::Acquire)
            {
                continue;
            }

            if let Some(dtor) = destructor(index) {
                dtor(cell.value);
            }
        }
    }
}

thread_local! {
    static SLOTS: ThreadSlots = const { ThreadSlots::new() };
}

fn destructor(index: usize) -> Option<SlotDestructor> {
    let raw = SLOTS_DESTRUCTORS[index].load(Ordering::Acquire);
    if raw.is_null() {
        return None;
    }

    // SAFETY: Non-null entries are only ever stored from a `SlotDestructor` in `slot_alloc`.
    Some(unsafe { core::mem::transmute::<*mut (), SlotDestructor>(raw) })
}

/// Allocates a new TLS dynamic slot and returns its id.
///
/// Every thread initially reads the new slot as null. The destructor is used to clean up the
/// thread's value when the thread exits.
///
/// Returns `None` if all slots are in use.
pub fn slot_alloc(destructor: Option<SlotDestructor>) -> Option<SlotId> {
    let mut current_mask = SLOTS_USED_MASK.load(Ordering::Acquire);

    loop {
        let free_mask = !current_mask & VALID_SLOT_MASK;
        let index = free_mask.trailing_zeros() as usize;
        if index >= NUM_TLS_SLOTS {
            return None;
        }

        match SLOTS_USED_MASK.compare_exchange(
            current_mask,
            current_mask | (1u64 << index),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                // Invalidate values left behind by earlier owners of this id, then publish the
                // destructor
                SLOTS_GENERATION[index].fetch_add(1, Ordering::AcqRel);
                SLOTS_DESTRUCTORS[index].store(
                    destructor.map_or(ptr::null_mut(), |d| d as *mut ()),
                    Ordering::Release,
                );
                return Some(SlotId(index));
            }
            Err(actual) => current_mask = actual,
        }
    }
}

/// Frees a previously-allocated dynamic TLS slot.
///
/// The destructor is cleared first so threads exiting concurrently no longer invoke it.
///
/// # Safety
///
/// No code may keep using `slot` once it has been freed, and a slot must not be freed twice.
pub unsafe fn slot_free(slot: SlotId) {
    SLOTS_DESTRUCTORS[slot.0].store(ptr::null_mut(), Ordering::Release);
    SLOTS_USED_MASK.fetch_and(!(1u64 << slot.0), Ordering::AcqRel);
}

/// Reads the calling thread's value of `slot`.
pub fn slot_get(slot: SlotId) -> Result<*mut c_void, SlotError> {
    if !is_allocated(slot) {
        return Err(SlotError::NotAllocated(slot.0));
    }

    let generation = SLOTS_GENERATION[slot.0].load(Ordering::Acquire);
    SLOTS
        .try_with(|slots| {
            let cell = slots.cells[slot.0].get();
            if cell.generation == generation {
                cell.value
            } else {
                ptr::null_mut()
            }
        })
        .map_err(|_| SlotError::ThreadExiting)
}

/// Writes the calling thread's value of `slot`.
pub fn slot_set(slot: SlotId, value: *mut c_void) -> Result<(), SlotError> {
    if !is_allocated(slot) {
        return Err(SlotError::NotAllocated(slot.0));
    }

    let generation = SLOTS_GENERATION[slot.0].load(Ordering::Acquire);
    SLOTS
        .try_with(|slots| slots.cells[slot.0].set(SlotValue { generation, value }))
        .map_err(|_| SlotError::ThreadExiting)
}

fn is_allocated(slot: SlotId) -> bool {
    SLOTS_USED_MASK.load(Ordering::Acquire) & (1u64 << slot.0) != 0
}

/// Error type for slot operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SlotError {
    /// The index is out of bounds.
    #[error("index out of bounds: {0}")]
    OutOfBounds(usize),
    /// The slot is not allocated.
    #[error("slot {0} is not allocated")]
    NotAllocated(usize),
    /// The calling thread's TLS has already been torn down.
    #[error("thread is exiting")]
    ThreadExiting,
}

#[cfg(test)]
mod tests {
    use core::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use super::*;

    static DTOR_CALLS: AtomicUsize = AtomicUsize::new(0);

    fn count_dtor(value: *mut c_void) {
        DTOR_CALLS.fetch_add(value as usize, Ordering::SeqCst);
    }

    #[test]
    fn new_slot_reads_null() {
        let slot = slot_alloc(None).unwrap();
        assert_eq!(slot_get(slot), Ok(ptr::null_mut()));
        unsafe { slot_free(slot) };
    }

    #[test]
    fn values_are_per_thread() {
        let slot = slot_alloc(None).unwrap();
        slot_set(slot, 0x10 as *mut c_void).unwrap();

        let other = thread::spawn(move || slot_get(slot).map(|v| v as usize))
            .join()
            .unwrap();
        assert_eq!(other, Ok(0));
        assert_eq!(slot_get(slot), Ok(0x10 as *mut c_void));

        unsafe { slot_free(slot) };
    }

    #[test]
    fn destructor_runs_at_thread_exit() {
        let slot = slot_alloc(Some(count_dtor)).unwrap();

        thread::spawn(move || slot_set(slot, 7 as *mut c_void).unwrap())
            .join()
            .unwrap();
        assert_eq!(DTOR_CALLS.load(Ordering::SeqCst), 7);

        unsafe { slot_free(slot) };
    }

    #[test]
    fn freed_slot_is_rejected() {
        let slot = slot_alloc(None).unwrap();
        unsafe { slot_free(slot) };
        assert_eq!(slot_get(slot), Err(SlotError::NotAllocated(slot.index())));
    }

    #[test]
    fn out_of_bounds_index() {
        assert_eq!(
            SlotId::from_index(NUM_TLS_SLOTS),
            Err(SlotError::OutOfBounds(NUM_TLS_SLOTS))
        );
    }
}
