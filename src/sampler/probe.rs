use sysinfo::{Disks, Networks, System};

/// Point-in-time host readings. Byte counts are absolute; network counters
/// are totals since the probe was created.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SystemSnapshot {
    pub cpu_percent: f32,
    pub memory_total: u64,
    pub memory_used: u64,
    pub swap_total: u64,
    pub swap_used: u64,
    pub disk_total: u64,
    pub disk_available: u64,
    pub network_sent: u64,
    pub network_received: u64,
}

/// Source of host readings for the metric sampler.
pub trait SystemProbe: Send {
    fn snapshot(&mut self) -> SystemSnapshot;
}

/// Reads the host through `sysinfo`. CPU usage is relative to the previous
/// refresh, so the first snapshot reports whatever sysinfo has at creation.
pub struct SysinfoProbe {
    system: System,
    disks: Disks,
    networks: Networks,
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        system.refresh_memory();
        Self {
            system,
            disks: Disks::new_with_refreshed_list(),
            networks: Networks::new_with_refreshed_list(),
        }
    }
}

impl SystemProbe for SysinfoProbe {
    fn snapshot(&mut self) -> SystemSnapshot {
        self.system.refresh_cpu();
        self.system.refresh_memory();
        self.disks.refresh();
        self.networks.refresh();

        let (disk_total, disk_available) = self
            .disks
            .list()
            .iter()
            .fold((0u64, 0u64), |(total, available), disk| {
                (
                    total.saturating_add(disk.total_space()),
                    available.saturating_add(disk.available_space()),
                )
            });

        let (network_sent, network_received) = self
            .networks
            .list()
            .values()
            .fold((0u64, 0u64), |(sent, received), data| {
                (
                    sent.saturating_add(data.total_transmitted()),
                    received.saturating_add(data.total_received()),
                )
            });

        SystemSnapshot {
            cpu_percent: self.system.global_cpu_info().cpu_usage(),
            memory_total: self.system.total_memory(),
            memory_used: self.system.used_memory(),
            swap_total: self.system.total_swap(),
            swap_used: self.system.used_swap(),
            disk_total,
            disk_available,
            network_sent,
            network_received,
        }
    }
}
