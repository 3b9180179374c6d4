//! Contract violations are reported as assert break events and leave the object untouched when
//! trapping is disabled

use std::{
    ptr,
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use nt_svc::debug::{self, BreakEvent, BreakReason};
use nt_sys_sync::{
    ConditionVariable, CriticalSection, LockMode, RunOnce, RunOnceError, RunOnceFlags,
    SleepError, SrwLock, SrwState,
    config::{self, SyncConfig},
};
use serial_test::serial;

static EVENTS: Mutex<Vec<BreakEvent>> = Mutex::new(Vec::new());

fn record(event: &BreakEvent) {
    EVENTS.lock().unwrap().push(*event);
}

/// Disables trapping, installs the recording handler and clears earlier events.
fn setup() {
    let _ = env_logger::builder().is_test(true).try_init();
    config::install(&SyncConfig {
        trap_on_contract_violation: false,
        ..SyncConfig::default()
    });
    debug::set_break_handler(Some(record));
    EVENTS.lock().unwrap().clear();
}

fn asserts_at(address: usize) -> usize {
    EVENTS
        .lock()
        .unwrap()
        .iter()
        .filter(|event| event.reason == BreakReason::Assert && event.address == address)
        .count()
}

#[test]
#[serial(contract)]
fn releasing_an_unheld_srw_lock_is_reported() {
    setup();
    let lock = SrwLock::new();
    let address = &lock as *const SrwLock as usize;

    lock.release_exclusive();
    lock.release_shared();
    assert_eq!(asserts_at(address), 2);
    assert_eq!(lock.state(), SrwState::default());

    // Wrong mode
    lock.acquire_shared();
    lock.release_exclusive();
    assert_eq!(asserts_at(address), 3);
    assert!(lock.state().is_shared());
    lock.release_shared();
    assert!(!lock.is_locked());
}

#[test]
#[serial(contract)]
fn leaving_a_foreign_critical_section_is_reported() {
    setup();
    let cs = Arc::new(CriticalSection::with_spin_count(0));
    let address = Arc::as_ptr(&cs) as usize;

    cs.enter();
    {
        let cs = Arc::clone(&cs);
        thread::spawn(move || cs.leave()).join().unwrap();
    }
    assert_eq!(asserts_at(address), 1);
    assert!(cs.is_owned_by_current_thread());
    cs.leave();

    // Not held at all
    cs.leave();
    assert_eq!(asserts_at(address), 2);
    assert!(!cs.is_locked());
}

#[test]
#[serial(contract)]
fn completing_an_idle_gate_is_reported() {
    setup();
    let once = RunOnce::new();
    let address = &once as *const RunOnce as usize;

    assert_eq!(
        once.complete(RunOnceFlags::empty(), ptr::null_mut()),
        Err(RunOnceError::NotRunning)
    );
    assert_eq!(asserts_at(address), 1);
    assert!(!once.is_completed());

    // Async losers are not misusing the gate
    assert_eq!(
        once.complete(RunOnceFlags::ASYNC, ptr::null_mut()),
        Err(RunOnceError::NotRunning)
    );
    assert_eq!(asserts_at(address), 1);
}

#[test]
#[serial(contract)]
fn sleeping_without_the_lock_is_reported() {
    setup();
    let cv = ConditionVariable::new();
    let cs = CriticalSection::new();
    let lock = SrwLock::new();

    assert_eq!(
        cv.sleep_cs(&cs, Some(Duration::from_secs(10))),
        Err(SleepError::NotOwner)
    );
    assert_eq!(asserts_at(&cs as *const CriticalSection as usize), 1);

    assert_eq!(
        cv.sleep_srw(&lock, LockMode::Exclusive, Some(Duration::from_secs(10))),
        Err(SleepError::NotOwner)
    );
    lock.acquire_shared();
    assert_eq!(
        cv.sleep_srw(&lock, LockMode::Exclusive, Some(Duration::from_secs(10))),
        Err(SleepError::NotOwner)
    );
    assert_eq!(asserts_at(&lock as *const SrwLock as usize), 2);
    lock.release_shared();
}
