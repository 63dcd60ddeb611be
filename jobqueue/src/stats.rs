use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};

/// A point in time copy of a queue's counters.
///
/// `processed`, `failed` and `retried` only ever grow. `active` is the number of handlers running
/// at the moment the snapshot was taken.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub processed: u64,
    pub failed: u64,
    pub retried: u64,
    pub active: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StatsAggregator {
    stats: Mutex<QueueStats>,
}

impl StatsAggregator {
    pub(crate) fn snapshot(&self) -> QueueStats {
        *self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn record_processed(&self) {
        self.update(|stats| stats.processed += 1);
    }

    pub(crate) fn record_failed(&self) {
        self.update(|stats| stats.failed += 1);
    }

    pub(crate) fn record_retried(&self) {
        self.update(|stats| stats.retried += 1);
    }

    /// Counts a handler as active until the returned guard is dropped.
    pub(crate) fn enter_active(&self) -> ActiveGuard<'_> {
        self.update(|stats| stats.active += 1);
        ActiveGuard { stats: self }
    }

    fn update(&self, f: impl FnOnce(&mut QueueStats)) {
        f(&mut self.stats.lock().unwrap_or_else(PoisonError::into_inner));
    }
}

/// Decrements `active` on every exit path, unwinding included.
pub(crate) struct ActiveGuard<'a> {
    stats: &'a StatsAggregator,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.stats
            .update(|stats| stats.active = stats.active.saturating_sub(1));
    }
}
