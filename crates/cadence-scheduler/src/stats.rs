use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Running counters for the scheduler, shared with introspection endpoints.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    syncs: AtomicU64,
    sync_failures: AtomicU64,
    skipped_definitions: AtomicU64,
    dispatched: AtomicU64,
    dispatch_failures: AtomicU64,
    bookkeeping_failures: AtomicU64,
}

/// Point-in-time copy of [`SchedulerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub syncs: u64,
    pub sync_failures: u64,
    pub skipped_definitions: u64,
    pub dispatched: u64,
    pub dispatch_failures: u64,
    pub bookkeeping_failures: u64,
}

impl SchedulerStats {
    pub(crate) fn record_sync(&self, skipped: usize) {
        self.syncs.fetch_add(1, Ordering::Relaxed);
        self.skipped_definitions
            .fetch_add(skipped as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_sync_failure(&self) {
        self.sync_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dispatch(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dispatch_failure(&self) {
        self.dispatch_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_bookkeeping_failure(&self) {
        self.bookkeeping_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            syncs: self.syncs.load(Ordering::Relaxed),
            sync_failures: self.sync_failures.load(Ordering::Relaxed),
            skipped_definitions: self.skipped_definitions.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            dispatch_failures: self.dispatch_failures.load(Ordering::Relaxed),
            bookkeeping_failures: self.bookkeeping_failures.load(Ordering::Relaxed),
        }
    }
}
