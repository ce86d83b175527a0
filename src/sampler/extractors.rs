use crate::control::MetricDefinition;
use crate::sampler::probe::SystemSnapshot;

const BYTES_PER_MIB: f64 = 1024.0 * 1024.0;

/// Host metrics every run reports. Each extractor yields `None` when the
/// host has nothing meaningful to report (no swap, no disks).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SystemMetric {
    CpuPercent,
    RamPercent,
    RamUsedMib,
    SwapPercent,
    DiskPercent,
    NetworkSentMib,
    NetworkReceivedMib,
}

impl SystemMetric {
    pub const ALL: [SystemMetric; 7] = [
        SystemMetric::CpuPercent,
        SystemMetric::RamPercent,
        SystemMetric::RamUsedMib,
        SystemMetric::SwapPercent,
        SystemMetric::DiskPercent,
        SystemMetric::NetworkSentMib,
        SystemMetric::NetworkReceivedMib,
    ];

    pub fn name(self) -> &'static str {
        match self {
            SystemMetric::CpuPercent => "cpu_usage",
            SystemMetric::RamPercent => "ram_usage",
            SystemMetric::RamUsedMib => "ram_used",
            SystemMetric::SwapPercent => "swap_usage",
            SystemMetric::DiskPercent => "disk_usage",
            SystemMetric::NetworkSentMib => "network_sent",
            SystemMetric::NetworkReceivedMib => "network_received",
        }
    }

    pub fn definition(self) -> MetricDefinition {
        match self {
            SystemMetric::CpuPercent
            | SystemMetric::RamPercent
            | SystemMetric::SwapPercent
            | SystemMetric::DiskPercent => {
                MetricDefinition::timeseries(self.name(), "percent").with_y_range(0.0, 100.0)
            }
            SystemMetric::RamUsedMib
            | SystemMetric::NetworkSentMib
            | SystemMetric::NetworkReceivedMib => MetricDefinition::timeseries(self.name(), "MiB"),
        }
    }

    pub fn extract(self, snapshot: &SystemSnapshot) -> Option<f64> {
        match self {
            SystemMetric::CpuPercent => {
                let value = f64::from(snapshot.cpu_percent);
                value.is_finite().then_some(value)
            }
            SystemMetric::RamPercent => percent(snapshot.memory_used, snapshot.memory_total),
            SystemMetric::RamUsedMib => {
                (snapshot.memory_total > 0).then(|| mib(snapshot.memory_used))
            }
            SystemMetric::SwapPercent => percent(snapshot.swap_used, snapshot.swap_total),
            SystemMetric::DiskPercent => percent(
                snapshot.disk_total.saturating_sub(snapshot.disk_available),
                snapshot.disk_total,
            ),
            SystemMetric::NetworkSentMib => Some(mib(snapshot.network_sent)),
            SystemMetric::NetworkReceivedMib => Some(mib(snapshot.network_received)),
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|metric| metric.name() == name)
    }
}

fn percent(used: u64, total: u64) -> Option<f64> {
    if total == 0 {
        return None;
    }
    Some(used as f64 / total as f64 * 100.0)
}

fn mib(bytes: u64) -> f64 {
    bytes as f64 / BYTES_PER_MIB
}
