//! Wait-on-address: no lost wakeups, raw-pointer front end

use std::{
    ffi::c_void,
    sync::{
        Arc,
        atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering},
    },
    thread,
    time::Duration,
};

use nt_sys_sync::wait::{self, WaitError, registry};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn ping_pong_never_loses_a_wakeup() {
    init_logger();

    const ROUNDS: u32 = 2000;
    let turn = Arc::new(AtomicU32::new(0));

    // Even values belong to the main thread, odd values to the partner
    let partner = {
        let turn = Arc::clone(&turn);
        thread::spawn(move || {
            for round in 0..ROUNDS {
                let mine = 2 * round + 1;
                loop {
                    let current = turn.load(Ordering::Acquire);
                    if current == mine {
                        break;
                    }
                    wait::wait_on(&*turn, current, None).unwrap();
                }
                turn.store(mine + 1, Ordering::Release);
                wait::wake_all(&*turn);
            }
        })
    };

    for round in 0..ROUNDS {
        let mine = 2 * round;
        loop {
            let current = turn.load(Ordering::Acquire);
            if current == mine {
                break;
            }
            wait::wait_on(&*turn, current, None).unwrap();
        }
        turn.store(mine + 1, Ordering::Release);
        wait::wake_all(&*turn);
    }

    partner.join().unwrap();
    assert_eq!(turn.load(Ordering::Relaxed), 2 * ROUNDS);
}

#[test]
fn wake_all_releases_every_waiter() {
    init_logger();

    let word = Arc::new(AtomicU64::new(7));
    let waiters: Vec<_> = (0..8)
        .map(|_| {
            let word = Arc::clone(&word);
            thread::spawn(move || {
                while word.load(Ordering::Acquire) == 7 {
                    wait::wait_on(&*word, 7, Some(Duration::from_secs(10))).unwrap();
                }
            })
        })
        .collect();

    let key = Arc::as_ptr(&word) as usize;
    let start = std::time::Instant::now();
    while registry::count_waiters(key) < 8 && start.elapsed() < Duration::from_secs(2) {
        thread::sleep(Duration::from_millis(1));
    }

    word.store(8, Ordering::Release);
    wait::wake_all(&*word);

    for waiter in waiters {
        waiter.join().unwrap();
    }
    assert_eq!(registry::count_waiters(key), 0);
}

#[test]
fn raw_wait_compares_the_given_width() {
    init_logger();

    let byte = AtomicU8::new(3);
    let differs = 4u8;
    let same = 3u8;

    // Different value: returns at once
    let result = unsafe {
        wait::wait_on_address(
            byte.as_ptr() as *const c_void,
            &differs as *const u8 as *const c_void,
            1,
            None,
        )
    };
    assert_eq!(result, Ok(()));

    let result = unsafe {
        wait::wait_on_address(
            byte.as_ptr() as *const c_void,
            &same as *const u8 as *const c_void,
            1,
            Some(Duration::from_millis(10)),
        )
    };
    assert_eq!(result, Err(WaitError::TimedOut));

    let result = unsafe {
        wait::wait_on_address(
            byte.as_ptr() as *const c_void,
            &same as *const u8 as *const c_void,
            3,
            None,
        )
    };
    assert_eq!(result, Err(WaitError::InvalidSize));
}

#[test]
fn wake_on_null_is_a_no_op() {
    wait::wake_address_single(std::ptr::null());
    wait::wake_address_all(std::ptr::null());
}

#[test]
fn timed_out_waiters_leave_the_registry() {
    init_logger();

    let word = AtomicU32::new(0);
    assert_eq!(
        wait::wait_on(&word, 0, Some(Duration::from_millis(5))),
        Err(WaitError::TimedOut)
    );
    assert_eq!(registry::count_waiters(&word as *const AtomicU32 as usize), 0);
}
