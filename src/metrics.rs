use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// In-process admission counters. Display-grade only; durable accounting
/// lives in the counter store.
#[derive(Debug, Default)]
pub struct AdmissionMetrics {
    admitted: AtomicU64,
    rejected: AtomicU64,
    failed_closed: AtomicU64,
    settled: AtomicU64,
    upstream_failed: AtomicU64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionMetricsSnapshot {
    pub admitted: u64,
    pub rejected: u64,
    /// Denials issued because the backend was unreachable.
    pub failed_closed: u64,
    pub settled: u64,
    pub upstream_failed: u64,
}

impl AdmissionMetrics {
    pub(crate) fn record_admitted(&self) {
        self.admitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed_closed(&self) {
        self.failed_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_settled(&self) {
        self.settled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_upstream_failed(&self) {
        self.upstream_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> AdmissionMetricsSnapshot {
        AdmissionMetricsSnapshot {
            admitted: self.admitted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            failed_closed: self.failed_closed.load(Ordering::Relaxed),
            settled: self.settled.load(Ordering::Relaxed),
            upstream_failed: self.upstream_failed.load(Ordering::Relaxed),
        }
    }
}
