//! Run-once gate under concurrent callers

use std::{
    ffi::c_void,
    sync::{
        Arc, Barrier,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
};

use nt_sys_sync::{BeginStatus, RunOnce, RunOnceFlags};

#[test]
fn initializer_runs_exactly_once_and_everyone_sees_its_context() {
    let _ = env_logger::builder().is_test(true).try_init();

    let once = Arc::new(RunOnce::new());
    let runs = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(16));

    let threads: Vec<_> = (0..16)
        .map(|_| {
            let once = Arc::clone(&once);
            let runs = Arc::clone(&runs);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                once.execute_once(|| {
                    runs.fetch_add(1, Ordering::SeqCst);
                    thread::sleep(std::time::Duration::from_millis(20));
                    Some(0x1000 as *mut c_void)
                })
                .unwrap() as usize
            })
        })
        .collect();

    for thread in threads {
        assert_eq!(thread.join().unwrap(), 0x1000);
    }
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(
        once.begin_initialize(RunOnceFlags::CHECK_ONLY),
        Ok(BeginStatus::Complete(0x1000 as *mut c_void))
    );
}

#[test]
fn async_initializers_race_and_one_wins() {
    let _ = env_logger::builder().is_test(true).try_init();

    let once = Arc::new(RunOnce::new());
    let barrier = Arc::new(Barrier::new(8));

    let threads: Vec<_> = (1..=8usize)
        .map(|id| {
            let once = Arc::clone(&once);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                assert_eq!(
                    once.begin_initialize(RunOnceFlags::ASYNC),
                    Ok(BeginStatus::Pending)
                );
                // Every thread is running before anyone completes
                barrier.wait();
                once.complete(RunOnceFlags::ASYNC, (id << 4) as *mut c_void)
                    .is_ok()
            })
        })
        .collect();

    let winners = threads
        .into_iter()
        .map(|t| t.join().unwrap())
        .filter(|&won| won)
        .count();
    assert_eq!(winners, 1);
    assert!(once.is_completed());
}
