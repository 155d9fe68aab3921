use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Running counters shared between the worker and the dispatcher handle
#[derive(Debug, Default)]
pub(crate) struct DispatchStats {
    cycles: AtomicU64,
    cancelled_cycles: AtomicU64,
    submitted: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    requeued: AtomicU64,
}

/// Point-in-time copy of the dispatch counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DispatchStatsSnapshot {
    /// Drain cycles started
    pub cycles: u64,
    /// Drain cycles stopped by a cancel
    pub cancelled_cycles: u64,
    /// Sends handed to the transport
    pub submitted: u64,
    /// Sends the endpoint accepted
    pub delivered: u64,
    /// Sends that failed and were put back
    pub failed: u64,
    /// Hits returned to the store without being sent
    pub requeued: u64,
}

impl DispatchStats {
    pub fn record_cycle(&self, cancelled: bool) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        if cancelled {
            self.cancelled_cycles.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_submitted(&self, count: usize) {
        self.submitted.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_requeued(&self, count: usize) {
        self.requeued.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DispatchStatsSnapshot {
        DispatchStatsSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            cancelled_cycles: self.cancelled_cycles.load(Ordering::Relaxed),
            submitted: self.submitted.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
        }
    }
}
