use crate::domain::ports::Metrics;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl Metrics for NoopMetrics {
    fn record_transaction_started(&self, _transaction_type: &str) {}
    fn record_transaction_completed(&self, _transaction_type: &str, _success: bool) {}
    fn record_transaction_idempotent(&self, _transaction_type: &str) {}
    fn record_processing_time(&self, _transaction_type: &str, _duration: Duration) {}
    fn record_outbox_delivered(&self, _count: usize) {}
    fn record_outbox_failed(&self, _count: usize) {}
}

/// Point-in-time copy of [`InMemoryMetrics`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub started: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub idempotent: u64,
    pub outbox_delivered: u64,
    pub outbox_failed: u64,
    /// Number of processing-time samples.
    pub timed: u64,
    pub total_time: Duration,
}

/// Counters kept in process memory. Transaction type labels are not split out.
/// Processing times fold into count, sum and max, so memory stays constant.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    started: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    idempotent: AtomicU64,
    outbox_delivered: AtomicU64,
    outbox_failed: AtomicU64,
    timed: AtomicU64,
    total_nanos: AtomicU64,
    max_nanos: AtomicU64,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            started: self.started.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            idempotent: self.idempotent.load(Ordering::Relaxed),
            outbox_delivered: self.outbox_delivered.load(Ordering::Relaxed),
            outbox_failed: self.outbox_failed.load(Ordering::Relaxed),
            timed: self.timed.load(Ordering::Relaxed),
            total_time: Duration::from_nanos(self.total_nanos.load(Ordering::Relaxed)),
        }
    }

    /// Longest recorded processing time, if any.
    pub fn max_duration(&self) -> Option<Duration> {
        if self.timed.load(Ordering::Relaxed) == 0 {
            return None;
        }
        Some(Duration::from_nanos(self.max_nanos.load(Ordering::Relaxed)))
    }
}

impl Metrics for InMemoryMetrics {
    fn record_transaction_started(&self, _transaction_type: &str) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    fn record_transaction_completed(&self, _transaction_type: &str, success: bool) {
        if success {
            self.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_transaction_idempotent(&self, _transaction_type: &str) {
        self.idempotent.fetch_add(1, Ordering::Relaxed);
    }

    fn record_processing_time(&self, _transaction_type: &str, duration: Duration) {
        let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        self.timed.fetch_add(1, Ordering::Relaxed);
        // Saturates instead of wrapping.
        let _ = self
            .total_nanos
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |sum| {
                Some(sum.saturating_add(nanos))
            });
        self.max_nanos.fetch_max(nanos, Ordering::Relaxed);
    }

    fn record_outbox_delivered(&self, count: usize) {
        self.outbox_delivered
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    fn record_outbox_failed(&self, count: usize) {
        self.outbox_failed.fetch_add(count as u64, Ordering::Relaxed);
    }
}
