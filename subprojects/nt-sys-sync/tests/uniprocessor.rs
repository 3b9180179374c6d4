//! Critical section spinning on a single-processor configuration

use std::{sync::Arc, thread};

use nt_sys_sync::{
    CriticalSection,
    config::{self, SyncConfig},
};

#[test]
fn spin_count_is_cleared_on_one_processor() {
    let _ = env_logger::builder().is_test(true).try_init();

    config::install(&SyncConfig {
        processor_count: 1,
        ..SyncConfig::default()
    });

    let cs = CriticalSection::with_spin_count(4000);
    assert_eq!(cs.spin_count(), 0);

    assert_eq!(cs.set_spin_count(4000), 0);
    assert_eq!(cs.spin_count(), 0);

    // Contention still resolves without spinning
    let cs = Arc::new(cs);
    cs.enter();
    let waiter = {
        let cs = Arc::clone(&cs);
        thread::spawn(move || {
            cs.enter();
            cs.leave();
        })
    };
    cs.leave();
    waiter.join().unwrap();
    assert!(!cs.is_locked());
}
