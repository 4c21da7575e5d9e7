use serde::Serialize;

/// Byte counters for one direction of traffic, summed across interfaces.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NetworkUsage {
    pub rx: u64,
    pub tx: u64,
}

/// Point-in-time resource usage of one environment (or a sum of them).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResourceUsage {
    /// Resident memory in bytes.
    pub memory: u64,
    pub network: NetworkUsage,
}

impl ResourceUsage {
    pub fn new(memory: u64, rx: u64, tx: u64) -> Self {
        Self {
            memory,
            network: NetworkUsage { rx, tx },
        }
    }

    /// Fold another sample into this one, saturating on overflow.
    pub fn accumulate(&mut self, other: &ResourceUsage) {
        self.memory = self.memory.saturating_add(other.memory);
        self.network.rx = self.network.rx.saturating_add(other.network.rx);
        self.network.tx = self.network.tx.saturating_add(other.network.tx);
    }
}
