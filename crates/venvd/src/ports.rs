use std::ops::Range;
use std::sync::{Mutex, MutexGuard};

use rand::seq::index::sample;

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("no available ports")]
pub struct NoAvailablePortsError;

/// Thread-safe bounded pool of free host ports.
///
/// Ports are handed out uniformly at random so a torn-down session's
/// ports are not immediately reassigned in order.
pub struct PortPool {
    available: Mutex<Vec<u16>>,
}

impl PortPool {
    /// Populate the pool from an inclusive-exclusive range.
    pub fn new(range: Range<u16>) -> Self {
        Self {
            available: Mutex::new(range.collect()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<u16>> {
        match self.available.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Atomically take `count` distinct random ports, or fail leaving
    /// the pool untouched.
    pub fn allocate_many(&self, count: usize) -> Result<Vec<u16>, NoAvailablePortsError> {
        let mut available = self.lock();
        if available.len() < count {
            return Err(NoAvailablePortsError);
        }

        let mut rng = rand::thread_rng();
        let mut indices = sample(&mut rng, available.len(), count).into_vec();
        // Remove back-to-front so earlier removals don't shift later indices.
        indices.sort_unstable_by(|a, b| b.cmp(a));
        Ok(indices
            .into_iter()
            .map(|i| available.swap_remove(i))
            .collect())
    }

    /// Return ports to the pool. Releasing a port that is already free
    /// is a no-op, so double-release is harmless.
    pub fn release_many(&self, ports: &[u16]) {
        let mut available = self.lock();
        for &port in ports {
            if !available.contains(&port) {
                available.push(port);
            }
        }
    }

    pub fn free_count(&self) -> usize {
        self.lock().len()
    }
}
