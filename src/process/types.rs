use crate::process::restart::{ExitHistory, ExitRecord};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

/// Lifecycle phase of a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitPhase {
    Stopped,
    Starting,
    Running,
    Stopping,
    Restarting,
    Failed,
    CrashedBackoff,
}

impl UnitPhase {
    /// Phases where the unit is between two resting states
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            UnitPhase::Starting | UnitPhase::Stopping | UnitPhase::Restarting
        )
    }

    /// Phases with no live process and no pending automatic action
    pub fn is_idle(&self) -> bool {
        matches!(self, UnitPhase::Stopped | UnitPhase::Failed)
    }
}

impl std::fmt::Display for UnitPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnitPhase::Stopped => write!(f, "stopped"),
            UnitPhase::Starting => write!(f, "starting"),
            UnitPhase::Running => write!(f, "running"),
            UnitPhase::Stopping => write!(f, "stopping"),
            UnitPhase::Restarting => write!(f, "restarting"),
            UnitPhase::Failed => write!(f, "failed"),
            UnitPhase::CrashedBackoff => write!(f, "crashed-backoff"),
        }
    }
}

/// How a child process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn from_status(status: &std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(status);
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

impl std::fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "signal {}", signal),
            (None, None) => write!(f, "unknown exit"),
        }
    }
}

/// Most recent failure of a unit, kept for status reporting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Failure {
    /// The OS refused to create the process
    Spawn(String),
    /// The process exited on its own
    Crash(ExitInfo),
    /// Memory ceiling breached; a controlled restart followed
    ResourceExceeded { used: u64, limit: u64 },
    /// The readiness signal did not arrive in time
    StartTimeout(Duration),
    /// Too many exits inside the restart window
    RestartBudgetExhausted { exits: usize, window: Duration },
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Failure::Spawn(msg) => write!(f, "spawn failed: {}", msg),
            Failure::Crash(exit) => write!(f, "crashed with {}", exit),
            Failure::ResourceExceeded { used, limit } => {
                write!(f, "memory {} bytes exceeded limit {} bytes", used, limit)
            }
            Failure::StartTimeout(after) => write!(f, "not ready after {:?}", after),
            Failure::RestartBudgetExhausted { exits, window } => {
                write!(f, "{} exits within {:?}, giving up", exits, window)
            }
        }
    }
}

/// Mutable runtime state of one unit
///
/// Lives in the supervisor's state table and is written by the unit's own task.
#[derive(Debug, Clone)]
pub struct RuntimeState {
    pub phase: UnitPhase,
    /// OS pid, present only while a child is live
    pub pid: Option<u32>,
    pub started_at: Option<SystemTime>,
    pub restarts: usize,
    pub exits: ExitHistory,
    pub last_exit: Option<ExitInfo>,
    pub last_failure: Option<Failure>,
    pub memory_bytes: u64,
    pub cpu_percent: f32,
    pub log_dropped_lines: u64,
    pub log_write_failures: u64,
    /// Set while an accepted operator request is still in flight
    pub pending: Option<Operation>,
}

impl RuntimeState {
    pub fn new(history_capacity: usize) -> Self {
        Self {
            phase: UnitPhase::Stopped,
            pid: None,
            started_at: None,
            restarts: 0,
            exits: ExitHistory::with_capacity(history_capacity),
            last_exit: None,
            last_failure: None,
            memory_bytes: 0,
            cpu_percent: 0.0,
            log_dropped_lines: 0,
            log_write_failures: 0,
            pending: None,
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started_at
            .and_then(|t| SystemTime::now().duration_since(t).ok())
            .unwrap_or(Duration::from_secs(0))
    }

    pub fn mark_spawned(&mut self, pid: u32) {
        self.pid = Some(pid);
        self.started_at = Some(SystemTime::now());
        self.memory_bytes = 0;
        self.cpu_percent = 0.0;
    }

    pub fn mark_reaped(&mut self, exit: Option<ExitInfo>, record: Option<ExitRecord>) {
        self.pid = None;
        self.started_at = None;
        if exit.is_some() {
            self.last_exit = exit;
        }
        if let Some(record) = record {
            self.exits.record(record);
        }
    }

    pub fn snapshot(&self, name: &str) -> UnitStatus {
        UnitStatus {
            name: name.to_string(),
            phase: self.phase,
            pid: self.pid,
            uptime: self.uptime(),
            restarts: self.restarts,
            recent_exits: self.exits.len(),
            last_exit: self.last_exit,
            last_failure: self.last_failure.clone(),
            memory_bytes: self.memory_bytes,
            cpu_percent: self.cpu_percent,
            log_dropped_lines: self.log_dropped_lines,
            log_write_failures: self.log_write_failures,
            busy: self.pending.is_some(),
        }
    }
}

/// Operator operations that go through the unit's transition queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Start,
    Stop,
    Restart,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Start => "start",
            Operation::Stop => "stop",
            Operation::Restart => "restart",
        }
    }

    /// Whether this operation is meaningful from `phase`
    pub fn allowed_from(&self, phase: UnitPhase) -> bool {
        match self {
            Operation::Start => phase.is_idle(),
            Operation::Stop => !phase.is_idle(),
            Operation::Restart => true,
        }
    }
}

/// Point-in-time copy of a unit's runtime state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitStatus {
    pub name: String,
    pub phase: UnitPhase,
    pub pid: Option<u32>,
    pub uptime: Duration,
    pub restarts: usize,
    pub recent_exits: usize,
    pub last_exit: Option<ExitInfo>,
    pub last_failure: Option<Failure>,
    pub memory_bytes: u64,
    pub cpu_percent: f32,
    pub log_dropped_lines: u64,
    pub log_write_failures: u64,
    pub busy: bool,
}
