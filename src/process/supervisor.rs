use crate::config::ProcessSpec;
use crate::error::{Result, WardenError};
use crate::logs::{LogSink, LogStats};
use crate::process::types::{Operation, RuntimeState, UnitStatus};
use crate::process::unit::{StateHandle, UnitCommand, UnitTask};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Supervisor configuration
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// How often a running unit's memory and CPU are sampled
    pub sample_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(1),
        }
    }
}

/// One row of the state table
pub(crate) struct UnitEntry {
    pub(crate) spec: Arc<ProcessSpec>,
    pub(crate) state: RuntimeState,
    commands: mpsc::Sender<UnitCommand>,
    log_stats: Arc<LogStats>,
    task: Option<JoinHandle<()>>,
}

impl UnitEntry {
    fn snapshot(&mut self) -> UnitStatus {
        self.state.log_dropped_lines = self.log_stats.dropped();
        self.state.log_write_failures = self.log_stats.write_failures();
        self.state.snapshot(&self.spec.name)
    }
}

pub(crate) type StateTable = Arc<Mutex<HashMap<String, UnitEntry>>>;

/// Owns every unit's runtime state and the task that drives it
///
/// Cloning is cheap and yields a handle to the same table. Operator requests
/// are accepted or rejected synchronously; the unit task carries them out.
#[derive(Clone)]
pub struct Supervisor {
    config: SupervisorConfig,
    table: StateTable,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            table: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Create a supervisor with default configuration
    pub fn with_defaults() -> Self {
        Self::new(SupervisorConfig::default())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, UnitEntry>> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a unit in the `Stopped` phase and spawn its task
    ///
    /// Must be called from within a tokio runtime.
    pub fn add(&self, spec: ProcessSpec) -> Result<()> {
        let spec = Arc::new(spec);
        let name = spec.name.clone();

        let mut table = self.lock();
        if table.contains_key(&name) {
            return Err(WardenError::UnitAlreadyExists(name));
        }

        // pending admits at most one queued request
        let (tx, rx) = mpsc::channel(1);
        let log_stats = Arc::new(LogStats::default());
        let sink = LogSink::open(
            &name,
            &spec.logs,
            spec.timestamp_format.clone(),
            spec.log_max_size,
            log_stats.clone(),
        );

        table.insert(
            name.clone(),
            UnitEntry {
                spec: spec.clone(),
                state: RuntimeState::new(spec.restart.history_capacity()),
                commands: tx,
                log_stats,
                task: None,
            },
        );

        let task = UnitTask::new(
            spec,
            StateHandle::new(self.table.clone(), name.clone()),
            rx,
            sink,
            self.config.sample_interval,
        );
        let handle = tokio::spawn(task.run());
        if let Some(entry) = table.get_mut(&name) {
            entry.task = Some(handle);
        }

        info!("Registered unit '{}'", name);
        Ok(())
    }

    /// Accept or reject an operator request for `name`
    ///
    /// At most one request per unit is in flight; a second one fails with
    /// `Busy` until the first reaches a resting phase.
    pub fn submit(&self, name: &str, op: Operation, grace: Option<Duration>) -> Result<()> {
        let mut table = self.lock();
        let entry = table
            .get_mut(name)
            .ok_or_else(|| WardenError::UnitNotFound(name.to_string()))?;

        if entry.state.pending.is_some() {
            return Err(WardenError::Busy(name.to_string()));
        }

        if !op.allowed_from(entry.state.phase) {
            return Err(WardenError::InvalidTransition {
                unit: name.to_string(),
                phase: entry.state.phase.to_string(),
                op: op.as_str(),
            });
        }

        match entry.commands.try_send(UnitCommand { op, grace }) {
            Ok(()) => {
                entry.state.pending = Some(op);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(WardenError::Busy(name.to_string())),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(WardenError::Internal(format!(
                "task for unit '{}' is not running",
                name
            ))),
        }
    }

    pub fn start(&self, name: &str) -> Result<()> {
        self.submit(name, Operation::Start, None)
    }

    /// Stop `name`, overriding its kill timeout with `grace` when given
    pub fn stop(&self, name: &str, grace: Option<Duration>) -> Result<()> {
        self.submit(name, Operation::Stop, grace)
    }

    pub fn restart(&self, name: &str) -> Result<()> {
        self.submit(name, Operation::Restart, None)
    }

    /// Start every registered unit, logging the ones that refuse
    pub fn start_all(&self) {
        for name in self.names() {
            if let Err(e) = self.start(&name) {
                warn!("Could not start unit '{}': {}", name, e);
            }
        }
    }

    pub fn status(&self, name: &str) -> Result<UnitStatus> {
        let mut table = self.lock();
        table
            .get_mut(name)
            .map(UnitEntry::snapshot)
            .ok_or_else(|| WardenError::UnitNotFound(name.to_string()))
    }

    /// Status of every unit, ordered by name
    pub fn list(&self) -> Vec<UnitStatus> {
        let mut table = self.lock();
        let mut statuses: Vec<UnitStatus> = table.values_mut().map(UnitEntry::snapshot).collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    pub fn spec(&self, name: &str) -> Result<Arc<ProcessSpec>> {
        self.lock()
            .get(name)
            .map(|entry| entry.spec.clone())
            .ok_or_else(|| WardenError::UnitNotFound(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Stop `name` if needed and forget it
    pub async fn remove(&self, name: &str) -> Result<()> {
        let entry = self
            .lock()
            .remove(name)
            .ok_or_else(|| WardenError::UnitNotFound(name.to_string()))?;

        Self::join(entry).await;
        info!("Removed unit '{}'", name);
        Ok(())
    }

    /// Stop every unit gracefully and wait for their tasks to finish
    ///
    /// All units are signalled before any is awaited, so grace periods overlap.
    pub async fn shutdown(&self) {
        let entries: Vec<UnitEntry> = self.lock().drain().map(|(_, entry)| entry).collect();
        info!("Shutting down {} unit(s)", entries.len());

        let tasks: Vec<(Arc<ProcessSpec>, Option<JoinHandle<()>>)> = entries
            .into_iter()
            .map(|entry| (entry.spec, entry.task))
            .collect();

        for (spec, task) in tasks {
            Self::await_task(&spec.name, task).await;
        }
    }

    async fn join(entry: UnitEntry) {
        let UnitEntry {
            spec,
            commands,
            task,
            ..
        } = entry;
        drop(commands);
        Self::await_task(&spec.name, task).await;
    }

    /// The unit task stops its child once the command sender is gone
    async fn await_task(name: &str, task: Option<JoinHandle<()>>) {
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Task for unit '{}' ended abnormally: {}", name, e);
            }
        }
    }

    /// Poll `name` until `accept` holds or `timeout` elapses
    pub async fn wait_for<F>(&self, name: &str, timeout: Duration, accept: F) -> Result<UnitStatus>
    where
        F: Fn(&UnitStatus) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let status = self.status(name)?;
            if accept(&status) {
                return Ok(status);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(WardenError::Internal(format!(
                    "unit '{}' still {} after {:?}",
                    name, status.phase, timeout
                )));
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Wait until `name` reaches a resting phase with no request in flight
    pub async fn settle(&self, name: &str, timeout: Duration) -> Result<UnitStatus> {
        self.wait_for(name, timeout, |s| !s.busy && !s.phase.is_transient())
            .await
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("config", &self.config)
            .field("units", &self.names())
            .finish()
    }
}
