//! Process memory readings for restart decisions and `memory` reports.

use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

/// One memory reading of a process, in MiB.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryReport {
    pub rss_mb: u64,
    pub virtual_mb: u64,
}

/// Reads resident and virtual size of a process by pid.
pub struct MemoryProbe {
    system: System,
}

impl Default for MemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }

    /// `None` when the process does not exist (any more).
    pub fn read(&mut self, pid: u32) -> Option<MemoryReport> {
        let pid = Pid::from_u32(pid);
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::nothing().with_memory(),
        );
        self.system.process(pid).map(|process| MemoryReport {
            rss_mb: process.memory() / (1024 * 1024),
            virtual_mb: process.virtual_memory() / (1024 * 1024),
        })
    }

    pub fn read_self(&mut self) -> Option<MemoryReport> {
        self.read(std::process::id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_own_process() {
        let mut probe = MemoryProbe::new();
        let report = probe.read_self().expect("own process is visible");
        assert!(report.rss_mb > 0 || report.virtual_mb > 0);
    }

    #[test]
    fn test_unknown_pid_is_none() {
        let mut probe = MemoryProbe::new();
        assert_eq!(probe.read(u32::MAX - 7), None);
    }
}
