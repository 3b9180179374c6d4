//! SRW lock: writer preference, disjointness under contention, packed state layout

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicI32, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use nt_sys_sync::{SrwLock, SrwState};
use proptest::prelude::*;
use rand::{Rng, SeedableRng, rngs::StdRng};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Polls `cond` until it holds or two seconds pass.
fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < Duration::from_secs(2) {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    false
}

#[test]
fn pending_writer_blocks_new_readers() {
    init_logger();

    let lock = Arc::new(SrwLock::new());
    let order = Arc::new(Mutex::new(Vec::new()));

    // T1 holds the lock shared
    lock.acquire_shared();

    // T2 asks for exclusive access and has to wait
    let writer = {
        let lock = Arc::clone(&lock);
        let order = Arc::clone(&order);
        thread::spawn(move || {
            lock.acquire_exclusive();
            order.lock().unwrap().push("writer");
            thread::sleep(Duration::from_millis(20));
            lock.release_exclusive();
        })
    };
    assert!(wait_until(|| lock.state().exclusive_waiters == 1));

    // T3 asks for shared access while the writer is pending
    let reader = {
        let lock = Arc::clone(&lock);
        let order = Arc::clone(&order);
        thread::spawn(move || {
            lock.acquire_shared();
            order.lock().unwrap().push("reader");
            lock.release_shared();
        })
    };

    thread::sleep(Duration::from_millis(50));
    assert!(order.lock().unwrap().is_empty());
    assert!(!lock.try_acquire_shared());

    lock.release_shared();
    writer.join().unwrap();
    reader.join().unwrap();

    assert_eq!(*order.lock().unwrap(), ["writer", "reader"]);
    assert_eq!(lock.state(), SrwState::default());
}

#[test]
fn writers_are_not_starved_by_a_reader_stream() {
    init_logger();

    let lock = Arc::new(SrwLock::new());
    let stop = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let lock = Arc::clone(&lock);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    lock.acquire_shared();
                    thread::sleep(Duration::from_micros(200));
                    lock.release_shared();
                }
            })
        })
        .collect();

    thread::sleep(Duration::from_millis(10));
    for _ in 0..20 {
        lock.acquire_exclusive();
        assert!(lock.is_locked_exclusive());
        lock.release_exclusive();
    }

    stop.store(true, Ordering::Relaxed);
    for reader in readers {
        reader.join().unwrap();
    }
}

#[test]
fn randomized_mix_keeps_owners_disjoint() {
    init_logger();

    let lock = Arc::new(SrwLock::new());
    // > 0: readers inside, -1: a writer inside
    let inside = Arc::new(AtomicI32::new(0));

    let threads: Vec<_> = (0..6u64)
        .map(|seed| {
            let lock = Arc::clone(&lock);
            let inside = Arc::clone(&inside);
            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(seed);
                for _ in 0..2000 {
                    let exclusive = rng.gen_bool(0.3);
                    let blocking = rng.gen_bool(0.8);

                    let acquired = match (exclusive, blocking) {
                        (true, true) => {
                            lock.acquire_exclusive();
                            true
                        }
                        (true, false) => lock.try_acquire_exclusive(),
                        (false, true) => {
                            lock.acquire_shared();
                            true
                        }
                        (false, false) => lock.try_acquire_shared(),
                    };
                    if !acquired {
                        continue;
                    }

                    if exclusive {
                        assert_eq!(inside.swap(-1, Ordering::SeqCst), 0);
                        let state = lock.state();
                        assert!(state.is_exclusive(), "{state:?}");
                        inside.store(0, Ordering::SeqCst);
                        lock.release_exclusive();
                    } else {
                        assert!(inside.fetch_add(1, Ordering::SeqCst) >= 0);
                        let state = lock.state();
                        assert!(state.is_shared(), "{state:?}");
                        inside.fetch_sub(1, Ordering::SeqCst);
                        lock.release_shared();
                    }
                }
            })
        })
        .collect();

    for thread in threads {
        thread.join().unwrap();
    }
    assert_eq!(lock.state(), SrwState::default());
}

proptest! {
    #[test]
    fn state_fields_do_not_overlap(exclusive_waiters in any::<i16>(), owners in any::<i16>()) {
        let state = SrwState { exclusive_waiters, owners };
        prop_assert_eq!(SrwState::unpack(state.pack()), state);
        let bytes = state.pack().to_ne_bytes();
        prop_assert_eq!([bytes[0], bytes[1]], exclusive_waiters.to_ne_bytes());
        prop_assert_eq!([bytes[2], bytes[3]], owners.to_ne_bytes());
    }

    #[test]
    fn exclusive_and_shared_are_exclusive(raw in any::<u32>()) {
        let state = SrwState::unpack(raw);
        prop_assert!(!(state.is_exclusive() && state.is_shared()));
    }
}
