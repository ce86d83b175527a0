//! Counters tracking control plane calls, failures, and latency so the client
//! can expose aggregated snapshots without leaking transport details.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
pub(crate) struct CallMetrics {
    total_calls: AtomicU64,
    total_errors: AtomicU64,
    total_latency_ns: AtomicU64,
    total_timeouts: AtomicU64,
    total_transport_errors: AtomicU64,
}

impl CallMetrics {
    pub(crate) fn record_success(&self, latency: Duration) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        self.add_latency(latency);
    }

    pub(crate) fn record_failure(&self, latency: Duration) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        self.total_errors.fetch_add(1, Ordering::Relaxed);
        self.add_latency(latency);
    }

    pub(crate) fn record_timeout(&self, latency: Duration) {
        self.record_failure(latency);
        self.total_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transport_error(&self, latency: Duration) {
        self.record_failure(latency);
        self.total_transport_errors.fetch_add(1, Ordering::Relaxed);
    }

    fn add_latency(&self, latency: Duration) {
        let nanos = latency.as_nanos().min(u128::from(u64::MAX)) as u64;
        self.total_latency_ns.fetch_add(nanos, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> CallMetricsSnapshot {
        let total_calls = self.total_calls.load(Ordering::Relaxed);
        let total_errors = self.total_errors.load(Ordering::Relaxed);
        let total_latency_ns = self.total_latency_ns.load(Ordering::Relaxed);

        let average_latency_ms = if total_calls == 0 {
            0.0
        } else {
            (total_latency_ns as f64 / total_calls as f64) / 1_000_000.0
        };

        CallMetricsSnapshot {
            total_calls,
            total_errors,
            average_latency_ms,
            total_timeouts: self.total_timeouts.load(Ordering::Relaxed),
            total_transport_errors: self.total_transport_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Copy, Clone)]
pub struct CallMetricsSnapshot {
    pub total_calls: u64,
    pub total_errors: u64,
    pub average_latency_ms: f64,
    pub total_timeouts: u64,
    pub total_transport_errors: u64,
}
