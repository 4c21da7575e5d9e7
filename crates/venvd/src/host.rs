use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use environment::NetworkUsage;
use serde::Serialize;
use sysinfo::{Networks, System};

/// Point-in-time host metrics.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct HostStats {
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub memory_total: u64,
    pub network: NetworkUsage,
}

/// Opaque host metrics probe.
#[async_trait]
pub trait HostProbe: Send + Sync {
    async fn sample(&self) -> HostStats;
}

/// Probe backed by the sysinfo crate.
pub struct SysinfoProbe {
    system: Mutex<System>,
    networks: Mutex<Networks>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
            networks: Mutex::new(Networks::new_with_refreshed_list()),
        }
    }

    fn system(&self) -> MutexGuard<'_, System> {
        match self.system.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HostProbe for SysinfoProbe {
    async fn sample(&self) -> HostStats {
        // CPU usage needs two refreshes a short interval apart.
        self.system().refresh_cpu();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let (cpu_percent, memory_percent, memory_total) = {
            let mut system = self.system();
            system.refresh_cpu();
            system.refresh_memory();

            let total = system.total_memory();
            let percent = if total == 0 {
                0.0
            } else {
                system.used_memory() as f32 / total as f32 * 100.0
            };
            (system.global_cpu_info().cpu_usage(), percent, total)
        };

        let (rx, tx) = {
            let mut networks = match self.networks.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            networks.refresh_list();
            networks.iter().fold((0u64, 0u64), |(rx, tx), (_, data)| {
                (
                    rx.saturating_add(data.total_received()),
                    tx.saturating_add(data.total_transmitted()),
                )
            })
        };

        HostStats {
            cpu_percent,
            memory_percent,
            memory_total,
            network: NetworkUsage { rx, tx },
        }
    }
}
