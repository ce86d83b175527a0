use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use tracing_subscriber::EnvFilter;

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Installs a basic tracing subscriber (if one is not already active).
///
/// The subscriber honours `RUST_LOG` if it is present, otherwise it falls back to `info`.
/// Calling this function multiple times is harmless.
pub fn init_tracing() {
    if TRACING_INIT.get().is_some() {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .try_init();

    let _ = TRACING_INIT.set(());
}

/// Rolling counters describing what a run has reported so far.
#[derive(Default, Debug)]
pub struct Telemetry {
    heartbeats_sent: AtomicU64,
    heartbeat_failures: AtomicU64,
    metric_samples_submitted: AtomicU64,
    log_records_uploaded: AtomicU64,
    log_upload_failures: AtomicU64,
    chunks_uploaded: AtomicU64,
    bytes_uploaded: AtomicU64,
}

impl Telemetry {
    pub fn record_heartbeat(&self) {
        self.heartbeats_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_heartbeat_failure(&self) {
        self.heartbeat_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_metric_samples(&self, count: u64) {
        if count == 0 {
            return;
        }
        self.metric_samples_submitted
            .fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_log_records_uploaded(&self, count: u64) {
        if count == 0 {
            return;
        }
        self.log_records_uploaded.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_log_upload_failure(&self) {
        self.log_upload_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_chunk_uploaded(&self, bytes: u64) {
        self.chunks_uploaded.fetch_add(1, Ordering::Relaxed);
        self.bytes_uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn heartbeats_sent(&self) -> u64 {
        self.heartbeats_sent.load(Ordering::Relaxed)
    }

    pub fn log_records_uploaded(&self) -> u64 {
        self.log_records_uploaded.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            heartbeats_sent: self.heartbeats_sent.load(Ordering::Relaxed),
            heartbeat_failures: self.heartbeat_failures.load(Ordering::Relaxed),
            metric_samples_submitted: self.metric_samples_submitted.load(Ordering::Relaxed),
            log_records_uploaded: self.log_records_uploaded.load(Ordering::Relaxed),
            log_upload_failures: self.log_upload_failures.load(Ordering::Relaxed),
            chunks_uploaded: self.chunks_uploaded.load(Ordering::Relaxed),
            bytes_uploaded: self.bytes_uploaded.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub heartbeats_sent: u64,
    pub heartbeat_failures: u64,
    pub metric_samples_submitted: u64,
    pub log_records_uploaded: u64,
    pub log_upload_failures: u64,
    pub chunks_uploaded: u64,
    pub bytes_uploaded: u64,
}
