//! Process memory probe.

use sysinfo::{Pid, ProcessesToUpdate, System};

/// Reads this process's resident memory.
pub struct MemoryProbe {
    system: System,
    pid: Option<Pid>,
}

impl MemoryProbe {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            pid: sysinfo::get_current_pid().ok(),
        }
    }

    /// Resident memory in bytes, or 0 if it cannot be read.
    pub fn current_bytes(&mut self) -> u64 {
        let Some(pid) = self.pid else {
            return 0;
        };
        self.system
            .refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        self.system.process(pid).map(|p| p.memory()).unwrap_or(0)
    }

    pub fn current_mb(&mut self) -> u64 {
        self.current_bytes() / (1024 * 1024)
    }
}

impl Default for MemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

/// Host name for worker ids.
pub fn host_name() -> String {
    System::host_name().unwrap_or_else(|| "localhost".to_string())
}
