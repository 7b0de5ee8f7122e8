//! Resource usage sampling for deployed processes

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessesToUpdate, System};

/// One point-in-time resource sample for a deployment
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    /// CPU usage percentage (0-100, may exceed 100 on multi-core)
    pub cpu_pct: f32,

    /// Resident memory in bytes
    pub ram_bytes: u64,

    pub sampled_at: DateTime<Utc>,
}

/// Samples CPU/RAM for individual pids.
///
/// Keeps one `sysinfo::System` alive so CPU percentages are deltas between
/// consecutive refreshes rather than always zero.
pub struct MetricsSampler {
    system: Mutex<System>,
}

impl MetricsSampler {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }

    /// Sample one process. Returns `None` when the pid no longer exists,
    /// which the monitor treats as a crash signal for process targets.
    pub fn sample(&self, pid: u32) -> Option<ResourceSample> {
        let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
        let pid = Pid::from_u32(pid);
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);

        system.process(pid).map(|process| ResourceSample {
            cpu_pct: process.cpu_usage(),
            ram_bytes: process.memory(),
            sampled_at: Utc::now(),
        })
    }
}

impl Default for MetricsSampler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_own_process() {
        let sampler = MetricsSampler::new();
        let sample = sampler.sample(std::process::id()).expect("own pid exists");
        assert!(sample.ram_bytes > 0);
    }

    #[test]
    fn test_sample_missing_pid() {
        let sampler = MetricsSampler::new();
        // Pid::MAX-ish value that cannot be a live process
        assert!(sampler.sample(u32::MAX - 1).is_none());
    }
}
