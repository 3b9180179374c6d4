//! Process-wide tuning of the synchronization primitives.
//!
//! The configuration is a plain value: build a [`SyncConfig`], adjust it and [`install`] it. Every
//! primitive reads the current values at the start of each slow-path operation, so a new
//! configuration applies to waits started after the call.

use core::{
    sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    time::Duration,
};

/// Tunables for the blocking slow paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncConfig {
    /// How long a critical section waiter may stay blocked, across all wait stages, before a
    /// possible deadlock is reported.
    pub critical_section_timeout: Duration,
    /// First critical section wait stage.
    pub first_wait: Duration,
    /// Second critical section wait stage, entered after logging a "likely blocked" warning.
    pub second_wait: Duration,
    /// Third wait stage. Only used with the `extended-diagnostics` feature.
    pub extended_wait: Duration,
    /// Number of processors used to decide whether spinning can pay off.
    pub processor_count: usize,
    /// Whether contract violations panic after being reported.
    pub trap_on_contract_violation: bool,
}

impl SyncConfig {
    /// Default deadlock timeout: 30 days.
    pub const DEFAULT_CRITICAL_SECTION_TIMEOUT: Duration = Duration::from_secs(30 * 24 * 60 * 60);
    /// Default first wait stage.
    pub const DEFAULT_FIRST_WAIT: Duration = Duration::from_secs(5);
    /// Default second wait stage.
    pub const DEFAULT_SECOND_WAIT: Duration = Duration::from_secs(60);
    /// Default extended wait stage.
    pub const DEFAULT_EXTENDED_WAIT: Duration = Duration::from_secs(300);
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            critical_section_timeout: Self::DEFAULT_CRITICAL_SECTION_TIMEOUT,
            first_wait: Self::DEFAULT_FIRST_WAIT,
            second_wait: Self::DEFAULT_SECOND_WAIT,
            extended_wait: Self::DEFAULT_EXTENDED_WAIT,
            processor_count: nt_svc::thread::processor_count(),
            trap_on_contract_violation: cfg!(debug_assertions),
        }
    }
}

const UNSET: u64 = u64::MAX;

static CRITICAL_SECTION_TIMEOUT: AtomicU64 = AtomicU64::new(UNSET);
static FIRST_WAIT: AtomicU64 = AtomicU64::new(UNSET);
static SECOND_WAIT: AtomicU64 = AtomicU64::new(UNSET);
static EXTENDED_WAIT: AtomicU64 = AtomicU64::new(UNSET);
/// `0` means "ask the kernel".
static PROCESSOR_COUNT: AtomicUsize = AtomicUsize::new(0);
static TRAP_SET: AtomicBool = AtomicBool::new(false);
static TRAP: AtomicBool = AtomicBool::new(false);

/// Installs `config` as the process-wide configuration.
pub fn install(config: &SyncConfig) {
    store_duration(&CRITICAL_SECTION_TIMEOUT, config.critical_section_timeout);
    store_duration(&FIRST_WAIT, config.first_wait);
    store_duration(&SECOND_WAIT, config.second_wait);
    store_duration(&EXTENDED_WAIT, config.extended_wait);
    PROCESSOR_COUNT.store(config.processor_count, Ordering::Relaxed);
    TRAP.store(config.trap_on_contract_violation, Ordering::Relaxed);
    TRAP_SET.store(true, Ordering::Release);
}

/// Returns the current process-wide configuration.
pub fn current() -> SyncConfig {
    SyncConfig {
        critical_section_timeout: load_duration(
            &CRITICAL_SECTION_TIMEOUT,
            SyncConfig::DEFAULT_CRITICAL_SECTION_TIMEOUT,
        ),
        first_wait: load_duration(&FIRST_WAIT, SyncConfig::DEFAULT_FIRST_WAIT),
        second_wait: load_duration(&SECOND_WAIT, SyncConfig::DEFAULT_SECOND_WAIT),
        extended_wait: load_duration(&EXTENDED_WAIT, SyncConfig::DEFAULT_EXTENDED_WAIT),
        processor_count: processor_count(),
        trap_on_contract_violation: trap_on_contract_violation(),
    }
}

/// Returns the configured processor count.
pub(crate) fn processor_count() -> usize {
    match PROCESSOR_COUNT.load(Ordering::Relaxed) {
        0 => nt_svc::thread::processor_count(),
        count => count,
    }
}

pub(crate) fn trap_on_contract_violation() -> bool {
    if TRAP_SET.load(Ordering::Acquire) {
        TRAP.load(Ordering::Relaxed)
    } else {
        cfg!(debug_assertions)
    }
}

fn store_duration(slot: &AtomicU64, value: Duration) {
    // `UNSET` doubles as "longer than representable", which reads back as the default
    let nanos = u64::try_from(value.as_nanos()).unwrap_or(UNSET - 1);
    slot.store(nanos, Ordering::Relaxed);
}

fn load_duration(slot: &AtomicU64, default: Duration) -> Duration {
    match slot.load(Ordering::Relaxed) {
        UNSET => default,
        nanos => Duration::from_nanos(nanos),
    }
}
