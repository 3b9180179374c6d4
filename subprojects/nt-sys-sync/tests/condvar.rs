//! Condition variable liveness with both lock kinds

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    thread,
    time::Duration,
};

use nt_sys_sync::{ConditionVariable, CriticalSection, LockMode, SrwLock};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct Queue {
    cs: CriticalSection,
    not_empty: ConditionVariable,
    items: std::cell::UnsafeCell<VecDeque<u32>>,
}

// SAFETY: `items` is only touched inside `cs`.
unsafe impl Sync for Queue {}

#[test]
fn producer_consumer_over_critical_section() {
    init_logger();

    const ITEMS: u32 = 5000;
    let queue = Arc::new(Queue {
        cs: CriticalSection::with_spin_count(0),
        not_empty: ConditionVariable::new(),
        items: Default::default(),
    });

    let consumers: Vec<_> = (0..3)
        .map(|_| {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                let mut sum = 0u64;
                loop {
                    queue.cs.enter();
                    // SAFETY: Inside the critical section.
                    let items = unsafe { &mut *queue.items.get() };
                    while items.is_empty() {
                        queue.not_empty.sleep_cs(&queue.cs, None).unwrap();
                    }
                    let item = items.pop_front().unwrap();
                    queue.cs.leave();

                    if item == u32::MAX {
                        return sum;
                    }
                    sum += u64::from(item);
                }
            })
        })
        .collect();

    for item in (0..ITEMS).chain([u32::MAX; 3]) {
        queue.cs.enter();
        // SAFETY: Inside the critical section.
        unsafe { &mut *queue.items.get() }.push_back(item);
        queue.not_empty.wake_one();
        queue.cs.leave();
    }

    let total: u64 = consumers.into_iter().map(|c| c.join().unwrap()).sum();
    assert_eq!(total, u64::from(ITEMS) * u64::from(ITEMS - 1) / 2);
}

#[test]
fn exclusive_srw_sleepers_all_make_progress() {
    init_logger();

    let shared = Arc::new((SrwLock::new(), ConditionVariable::new(), AtomicU32::new(0)));

    let sleepers: Vec<_> = (0..4u32)
        .map(|id| {
            let shared = Arc::clone(&shared);
            thread::spawn(move || {
                let (lock, cv, turn) = &*shared;
                lock.acquire_exclusive();
                while turn.load(Ordering::Relaxed) != id {
                    let _ = cv.sleep_srw(lock, LockMode::Exclusive, Some(Duration::from_secs(5)));
                }
                turn.store(id + 1, Ordering::Relaxed);
                cv.wake_all();
                lock.release_exclusive();
            })
        })
        .collect();

    for sleeper in sleepers {
        sleeper.join().unwrap();
    }
    assert_eq!(shared.2.load(Ordering::Relaxed), 4);
}
