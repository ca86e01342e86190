use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

/// One resource sample of a live process
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceSample {
    /// Resident memory in bytes
    pub memory_bytes: u64,
    pub cpu_percent: f32,
}

/// Resource sampler owned by a single unit task
///
/// CPU usage is computed between two refreshes, so the first sample of a
/// fresh process reports zero.
pub struct ResourceMonitor {
    system: System,
}

impl ResourceMonitor {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }

    /// Sample memory and CPU of `pid`, or `None` once the process is gone
    pub fn sample(&mut self, pid: u32) -> Option<ResourceSample> {
        let sys_pid = Pid::from_u32(pid);

        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[sys_pid]),
            true,
            ProcessRefreshKind::new().with_memory().with_cpu(),
        );

        self.system.process(sys_pid).map(|process| ResourceSample {
            memory_bytes: process.memory(),
            cpu_percent: process.cpu_usage(),
        })
    }
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        Self::new()
    }
}
