//! Host metric sampling for the worker's heartbeat loop.

pub mod extractors;
pub mod probe;

pub use extractors::SystemMetric;
pub use probe::{SysinfoProbe, SystemProbe, SystemSnapshot};

use crate::control::{MetricDefinition, MetricSample};
use chrono::Utc;

/// Samples a fixed set of metrics from one probe.
pub struct MetricSampler {
    probe: Box<dyn SystemProbe>,
    metrics: Vec<SystemMetric>,
}

impl MetricSampler {
    pub fn new(probe: Box<dyn SystemProbe>, metrics: Vec<SystemMetric>) -> Self {
        Self { probe, metrics }
    }

    /// Every built-in host metric read through `sysinfo`.
    pub fn system() -> Self {
        Self::new(Box::new(SysinfoProbe::default()), SystemMetric::ALL.to_vec())
    }

    pub fn metrics(&self) -> &[SystemMetric] {
        &self.metrics
    }

    pub fn definitions(&self) -> Vec<MetricDefinition> {
        self.metrics.iter().map(|metric| metric.definition()).collect()
    }

    /// Drops every metric; later samples are empty.
    pub fn clear(&mut self) {
        self.metrics.clear();
    }

    /// One sample per metric that produced a value, all sharing one timestamp.
    pub fn sample(&mut self) -> Vec<MetricSample> {
        if self.metrics.is_empty() {
            return Vec::new();
        }

        let snapshot = self.probe.snapshot();
        let timestamp = Utc::now();
        self.metrics
            .iter()
            .filter_map(|metric| {
                metric.extract(&snapshot).map(|value| MetricSample {
                    metric: metric.name().to_owned(),
                    timestamp,
                    value,
                })
            })
            .collect()
    }
}
