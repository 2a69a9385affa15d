use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub(crate) struct AmplifierStats {
    pub triggers_denied: AtomicU64,
    pub waves_started: AtomicU64,
    pub waves_completed: AtomicU64,
    pub waves_cancelled: AtomicU64,
    pub batches_emitted: AtomicU64,
    pub calls_submitted: AtomicU64,
    pub calls_rejected: AtomicU64,
    pub calls_succeeded: AtomicU64,
    pub calls_failed: AtomicU64,
    pub calls_panicked: AtomicU64,
    pub calls_cancelled: AtomicU64,
    pub pools_retired: AtomicU64,
}

impl AmplifierStats {
    #[inline]
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(counter: &AtomicU64, amount: u64) {
        counter.fetch_add(amount, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let read = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        StatsSnapshot {
            triggers_denied: read(&self.triggers_denied),
            waves_started: read(&self.waves_started),
            waves_completed: read(&self.waves_completed),
            waves_cancelled: read(&self.waves_cancelled),
            batches_emitted: read(&self.batches_emitted),
            calls_submitted: read(&self.calls_submitted),
            calls_rejected: read(&self.calls_rejected),
            calls_succeeded: read(&self.calls_succeeded),
            calls_failed: read(&self.calls_failed),
            calls_panicked: read(&self.calls_panicked),
            calls_cancelled: read(&self.calls_cancelled),
            pools_retired: read(&self.pools_retired),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub triggers_denied: u64,
    pub waves_started: u64,
    pub waves_completed: u64,
    pub waves_cancelled: u64,
    pub batches_emitted: u64,
    pub calls_submitted: u64,
    pub calls_rejected: u64,
    pub calls_succeeded: u64,
    pub calls_failed: u64,
    pub calls_panicked: u64,
    pub calls_cancelled: u64,
    pub pools_retired: u64,
}

impl StatsSnapshot {
    /// Synthetic calls that reached a terminal state.
    pub fn calls_finished(&self) -> u64 {
        self.calls_succeeded + self.calls_failed + self.calls_panicked + self.calls_cancelled
    }
}
