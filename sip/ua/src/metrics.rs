use std::sync::atomic::{AtomicU64, Ordering};

/// Counters the stack maintains, all monotonic except
/// `active_dialogs`
#[derive(Debug, Default)]
pub(crate) struct Metrics {
    pub(crate) active_dialogs: AtomicU64,
    pub(crate) total_invites: AtomicU64,
    pub(crate) total_byes: AtomicU64,
    pub(crate) total_refers: AtomicU64,
    pub(crate) successful_calls: AtomicU64,
    pub(crate) failed_calls: AtomicU64,
    pub(crate) replace_operations: AtomicU64,
}

impl Metrics {
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn decr(counter: &AtomicU64) {
        counter.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Point-in-time view of the stack's observable outputs
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub active_dialogs: u64,
    pub total_invites: u64,
    pub total_byes: u64,
    pub total_refers: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub replace_operations: u64,
    pub id_pool_hits: u64,
    pub id_pool_misses: u64,
    /// Live dialog count per registry shard
    pub shard_dialog_counts: Vec<usize>,
}

impl Metrics {
    pub(crate) fn snapshot(
        &self,
        id_pool_hits: u64,
        id_pool_misses: u64,
        shard_dialog_counts: Vec<usize>,
    ) -> MetricsSnapshot {
        MetricsSnapshot {
            active_dialogs: self.active_dialogs.load(Ordering::Relaxed),
            total_invites: self.total_invites.load(Ordering::Relaxed),
            total_byes: self.total_byes.load(Ordering::Relaxed),
            total_refers: self.total_refers.load(Ordering::Relaxed),
            successful_calls: self.successful_calls.load(Ordering::Relaxed),
            failed_calls: self.failed_calls.load(Ordering::Relaxed),
            replace_operations: self.replace_operations.load(Ordering::Relaxed),
            id_pool_hits,
            id_pool_misses,
            shard_dialog_counts,
        }
    }
}
