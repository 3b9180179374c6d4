//! Contract violation reporting.
//!
//! Misusing a primitive (releasing a lock that is not held, leaving a critical section owned by
//! another thread, completing a run-once gate nobody is running) is a programming error. It is
//! never silently tolerated: the violation is logged, raised as an [`BreakReason::Assert`] break
//! event, and, when [`SyncConfig::trap_on_contract_violation`] is set (the default in debug
//! builds), turned into a panic. Otherwise the offending operation returns without touching the
//! primitive's state.
//!
//! [`SyncConfig::trap_on_contract_violation`]: crate::config::SyncConfig::trap_on_contract_violation

use nt_svc::debug::{BreakReason, break_event};

use crate::config;

/// Reports a contract violation on the object at `address`.
#[cold]
#[track_caller]
pub fn contract_violation(what: &str, address: usize) {
    log::error!("contract violation: {what} (object at {address:#x})");
    break_event(BreakReason::Assert, address, 0);

    if config::trap_on_contract_violation() {
        panic!("contract violation: {what}");
    }
}
