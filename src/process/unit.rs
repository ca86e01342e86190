use crate::config::ProcessSpec;
use crate::logs::LogSink;
use crate::process::monitor::ResourceMonitor;
use crate::process::restart::{ExitRecord, RestartDecision};
use crate::process::spawner::{group_alive, signal_group, spawn_process};
use crate::process::supervisor::StateTable;
use crate::process::types::{ExitInfo, Failure, Operation, RuntimeState, UnitPhase};
use crate::process::health;
use nix::sys::signal::Signal;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Delay between checks for leftover members of an exited unit's group
const GROUP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Operator request delivered to a unit task
#[derive(Debug, Clone, Copy)]
pub(crate) struct UnitCommand {
    pub op: Operation,
    /// Overrides the unit's kill timeout for this stop
    pub grace: Option<Duration>,
}

/// Write access to one unit's row of the state table
#[derive(Clone)]
pub(crate) struct StateHandle {
    table: StateTable,
    name: String,
}

impl StateHandle {
    pub(crate) fn new(table: StateTable, name: String) -> Self {
        Self { table, name }
    }

    /// Run `f` on the unit's state; `None` once the unit has been removed
    pub(crate) fn update<R>(&self, f: impl FnOnce(&mut RuntimeState) -> R) -> Option<R> {
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        table.get_mut(&self.name).map(|entry| f(&mut entry.state))
    }
}

/// A child the task currently owns
struct LiveChild {
    child: Child,
    pid: u32,
    started: Instant,
}

/// Why a live child is being taken down
enum Interrupt {
    Stop(Duration),
    Restart(Duration),
    /// The supervisor dropped the unit
    Shutdown,
}

/// What the task loop does next
enum Next {
    Idle,
    Start,
    Run(LiveChild),
    Backoff(Duration),
    Exit,
}

/// Long-lived task driving one unit's state machine
///
/// The task owns the OS child handle, so every transition of the unit is
/// sequential. It ends when the supervisor drops the command sender.
pub(crate) struct UnitTask {
    spec: Arc<ProcessSpec>,
    state: StateHandle,
    commands: mpsc::Receiver<UnitCommand>,
    sink: LogSink,
    monitor: ResourceMonitor,
    sample_interval: Duration,
    /// An operator command was consumed and its outcome is not reached yet
    serving: bool,
    /// Memory restarts in a row whose run was shorter than `min_uptime`
    memory_streak: u32,
}

impl UnitTask {
    pub(crate) fn new(
        spec: Arc<ProcessSpec>,
        state: StateHandle,
        commands: mpsc::Receiver<UnitCommand>,
        sink: LogSink,
        sample_interval: Duration,
    ) -> Self {
        Self {
            spec,
            state,
            commands,
            sink,
            monitor: ResourceMonitor::new(),
            sample_interval,
            serving: false,
            memory_streak: 0,
        }
    }

    pub(crate) async fn run(mut self) {
        debug!("Unit task for '{}' started", self.spec.name);

        let mut next = Next::Idle;
        loop {
            next = match next {
                Next::Idle => self.idle().await,
                Next::Start => self.start().await,
                Next::Run(live) => self.supervise(live).await,
                Next::Backoff(delay) => self.backoff(delay).await,
                Next::Exit => break,
            };
        }

        let UnitTask { spec, sink, .. } = self;
        sink.close().await;
        debug!("Unit task for '{}' finished", spec.name);
    }

    /// Record `phase`, releasing the operator request once a resting phase is reached
    fn set_phase(&mut self, phase: UnitPhase) {
        let release = self.serving && !phase.is_transient();
        if release {
            self.serving = false;
        }

        self.state.update(|s| {
            s.phase = phase;
            if release {
                s.pending = None;
            }
        });
    }

    /// Release a consumed request that turned out to have nothing to do
    fn finish_request(&mut self) {
        self.serving = false;
        self.state.update(|s| s.pending = None);
    }

    /// Stopped or Failed: wait for an operator command
    async fn idle(&mut self) -> Next {
        loop {
            let Some(command) = self.commands.recv().await else {
                return Next::Exit;
            };
            self.serving = true;

            match command.op {
                Operation::Start | Operation::Restart => {
                    self.memory_streak = 0;
                    self.state.update(|s| {
                        if s.phase == UnitPhase::Failed {
                            s.exits.clear();
                        }
                    });
                    return Next::Start;
                }
                Operation::Stop => self.finish_request(),
            }
        }
    }

    /// Starting: spawn the child and wait for it to become ready
    async fn start(&mut self) -> Next {
        self.set_phase(UnitPhase::Starting);

        let spawned = match spawn_process(&self.spec) {
            Ok(spawned) => spawned,
            Err(e) => {
                error!("Unit '{}' failed to start: {}", self.spec.name, e);
                self.state
                    .update(|s| s.last_failure = Some(Failure::Spawn(e.to_string())));
                self.set_phase(UnitPhase::Failed);
                return Next::Idle;
            }
        };

        self.sink.attach(spawned.stdout, spawned.stderr);
        self.state.update(|s| s.mark_spawned(spawned.pid));
        info!("Unit '{}' spawned (PID: {})", self.spec.name, spawned.pid);

        let mut live = LiveChild {
            child: spawned.child,
            pid: spawned.pid,
            started: Instant::now(),
        };

        let Some(port) = self.spec.ready_port else {
            self.set_phase(UnitPhase::Running);
            return Next::Run(live);
        };

        let deadline = tokio::time::sleep(self.spec.listen_timeout);
        tokio::pin!(deadline);
        let ready = health::wait_until_ready(port);
        tokio::pin!(ready);

        loop {
            tokio::select! {
                status = live.child.wait() => return self.on_exit(live, status).await,
                _ = &mut ready => {
                    info!("Unit '{}' is ready on port {}", self.spec.name, port);
                    self.set_phase(UnitPhase::Running);
                    return Next::Run(live);
                }
                _ = &mut deadline => {
                    let waited = self.spec.listen_timeout;
                    error!(
                        "Unit '{}' not ready on port {} after {:?}, killing it",
                        self.spec.name, port, waited
                    );
                    self.state
                        .update(|s| s.last_failure = Some(Failure::StartTimeout(waited)));
                    self.terminate(live, self.spec.kill_timeout).await;
                    self.set_phase(UnitPhase::Failed);
                    return Next::Idle;
                }
                command = self.commands.recv() => {
                    if let Some(interrupt) = self.classify(command) {
                        return self.interrupt(interrupt, live).await;
                    }
                }
            }
        }
    }

    /// Running: watch for exit, memory ceiling and operator commands
    async fn supervise(&mut self, mut live: LiveChild) -> Next {
        let mut sampler = tokio::time::interval(self.sample_interval);
        sampler.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                status = live.child.wait() => return self.on_exit(live, status).await,
                _ = sampler.tick() => {
                    if let Some(used) = self.sample(live.pid) {
                        let limit = self.spec.max_memory.unwrap_or(u64::MAX);
                        if used > limit {
                            return self.restart_for_memory(live, used, limit).await;
                        }
                    }
                }
                command = self.commands.recv() => {
                    if let Some(interrupt) = self.classify(command) {
                        return self.interrupt(interrupt, live).await;
                    }
                }
            }
        }
    }

    /// Wait out a restart delay unless an operator intervenes
    ///
    /// Entered from `CrashedBackoff` after a crash or `Restarting` after a
    /// memory restart.
    async fn backoff(&mut self, delay: Duration) -> Next {
        info!("Unit '{}' restarting in {:?}", self.spec.name, delay);

        let timer = tokio::time::sleep(delay);
        tokio::pin!(timer);

        loop {
            tokio::select! {
                _ = &mut timer => {
                    self.state.update(|s| s.restarts += 1);
                    return Next::Start;
                }
                command = self.commands.recv() => {
                    match self.classify(command) {
                        Some(Interrupt::Shutdown) => {
                            self.set_phase(UnitPhase::Stopped);
                            return Next::Exit;
                        }
                        Some(Interrupt::Stop(_)) => {
                            info!("Unit '{}' stopped during backoff", self.spec.name);
                            self.set_phase(UnitPhase::Stopped);
                            return Next::Idle;
                        }
                        Some(Interrupt::Restart(_)) => {
                            self.set_phase(UnitPhase::Restarting);
                            self.state.update(|s| s.restarts += 1);
                            return Next::Start;
                        }
                        None => {}
                    }
                }
            }
        }
    }

    /// Turn a received command into an interruption of the current phase
    ///
    /// A start is never valid while a child is live or backing off, so it is
    /// released on the spot and yields `None`.
    fn classify(&mut self, command: Option<UnitCommand>) -> Option<Interrupt> {
        let Some(command) = command else {
            return Some(Interrupt::Shutdown);
        };

        let grace = command.grace.unwrap_or(self.spec.kill_timeout);
        match command.op {
            Operation::Stop => {
                self.serving = true;
                Some(Interrupt::Stop(grace))
            }
            Operation::Restart => {
                self.serving = true;
                Some(Interrupt::Restart(grace))
            }
            Operation::Start => {
                self.finish_request();
                None
            }
        }
    }

    /// Take down a live child for a stop, restart or shutdown
    async fn interrupt(&mut self, interrupt: Interrupt, live: LiveChild) -> Next {
        self.set_phase(UnitPhase::Stopping);

        match interrupt {
            Interrupt::Shutdown => {
                self.terminate(live, self.spec.kill_timeout).await;
                self.set_phase(UnitPhase::Stopped);
                Next::Exit
            }
            Interrupt::Stop(grace) => {
                self.terminate(live, grace).await;
                self.set_phase(UnitPhase::Stopped);
                info!("Unit '{}' stopped", self.spec.name);
                Next::Idle
            }
            Interrupt::Restart(grace) => {
                self.terminate(live, grace).await;
                self.set_phase(UnitPhase::Restarting);
                self.state.update(|s| s.restarts += 1);
                info!("Unit '{}' restarting", self.spec.name);
                Next::Start
            }
        }
    }

    /// Memory ceiling breached: Stopping, Restarting, then Starting again
    ///
    /// Not a crash, so the exit history is untouched and the unit never
    /// gives up; repeated breaches are spaced by the restart backoff instead.
    async fn restart_for_memory(&mut self, live: LiveChild, used: u64, limit: u64) -> Next {
        warn!(
            "Unit '{}' uses {} bytes, above its {} byte limit; restarting",
            self.spec.name, used, limit
        );
        self.state
            .update(|s| s.last_failure = Some(Failure::ResourceExceeded { used, limit }));

        let short_run = live.started.elapsed() < self.spec.restart.min_uptime;
        self.memory_streak = if short_run { self.memory_streak + 1 } else { 1 };

        self.set_phase(UnitPhase::Stopping);
        self.terminate(live, self.spec.kill_timeout).await;
        self.set_phase(UnitPhase::Restarting);

        // the first restart is immediate, back-to-back ones back off like crashes
        let delay = match self.memory_streak {
            0 | 1 => Duration::ZERO,
            n => self.spec.restart.delay_for(n - 2),
        };
        if delay.is_zero() {
            self.state.update(|s| s.restarts += 1);
            Next::Start
        } else {
            Next::Backoff(delay)
        }
    }

    /// Record a resource sample, returning the memory in use
    fn sample(&mut self, pid: u32) -> Option<u64> {
        let sample = self.monitor.sample(pid)?;
        self.state.update(|s| {
            s.memory_bytes = sample.memory_bytes;
            s.cpu_percent = sample.cpu_percent;
        });
        Some(sample.memory_bytes)
    }

    /// The child exited without being asked to
    async fn on_exit(&mut self, live: LiveChild, status: std::io::Result<ExitStatus>) -> Next {
        let exit = match status {
            Ok(status) => ExitInfo::from_status(&status),
            Err(e) => {
                warn!("Failed to reap unit '{}': {}", self.spec.name, e);
                ExitInfo {
                    code: None,
                    signal: None,
                }
            }
        };

        let record = ExitRecord {
            at: Instant::now(),
            uptime: live.started.elapsed(),
        };
        self.clear_group(live.pid).await;

        let now = Instant::now();
        let spec = self.spec.clone();
        let deliberate = exit
            .code
            .map_or(false, |code| spec.stop_exit_codes.contains(&code));

        let decision = self
            .state
            .update(|s| {
                s.mark_reaped(Some(exit), Some(record));
                if deliberate || !spec.autorestart() {
                    if !deliberate {
                        s.last_failure = Some(Failure::Crash(exit));
                    }
                    return None;
                }
                s.last_failure = Some(Failure::Crash(exit));

                let decision = spec.restart.decide(&s.exits, now);
                if decision == RestartDecision::GiveUp {
                    s.last_failure = Some(Failure::RestartBudgetExhausted {
                        exits: s.exits.count_within(spec.restart.window, now),
                        window: spec.restart.window,
                    });
                }
                Some(decision)
            })
            .flatten();

        match decision {
            None => {
                info!("Unit '{}' exited with {}", spec.name, exit);
                self.set_phase(UnitPhase::Stopped);
                Next::Idle
            }
            Some(RestartDecision::GiveUp) => {
                error!(
                    "Unit '{}' exited with {} and exceeded its restart budget; giving up",
                    spec.name, exit
                );
                self.set_phase(UnitPhase::Failed);
                Next::Idle
            }
            Some(RestartDecision::RestartImmediately) => {
                warn!("Unit '{}' crashed with {}; restarting", spec.name, exit);
                self.state.update(|s| s.restarts += 1);
                Next::Start
            }
            Some(RestartDecision::RestartAfter(delay)) => {
                warn!("Unit '{}' crashed with {}", spec.name, exit);
                self.set_phase(UnitPhase::CrashedBackoff);
                Next::Backoff(delay)
            }
        }
    }

    /// Stop whatever the exited leader left running in its process group
    ///
    /// Same escalation as a stop: kill signal, `kill_timeout`, then SIGKILL.
    async fn clear_group(&self, pgid: u32) {
        if !group_alive(pgid) {
            return;
        }

        let name = &self.spec.name;
        warn!(
            "Unit '{}' left processes behind in group {}, stopping them",
            name, pgid
        );
        if let Err(e) = signal_group(pgid, self.spec.kill_signal) {
            warn!("Unit '{}': {}", name, e);
            return;
        }

        let deadline = tokio::time::Instant::now() + self.spec.kill_timeout;
        while group_alive(pgid) {
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    "Process group {} of unit '{}' outlived {:?}, sending SIGKILL",
                    pgid, name, self.spec.kill_timeout
                );
                if let Err(e) = signal_group(pgid, Signal::SIGKILL) {
                    warn!("Unit '{}': {}", name, e);
                }
                return;
            }
            tokio::time::sleep(GROUP_POLL_INTERVAL).await;
        }
    }

    /// Signal the process group, wait `grace`, then SIGKILL and reap
    async fn terminate(&mut self, mut live: LiveChild, grace: Duration) {
        let name = &self.spec.name;

        if let Err(e) = signal_group(live.pid, self.spec.kill_signal) {
            warn!("Unit '{}': {}", name, e);
        }

        let status = match tokio::time::timeout(grace, live.child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                warn!(
                    "Unit '{}' (PID: {}) did not exit within {:?}, sending SIGKILL",
                    name, live.pid, grace
                );
                if let Err(e) = signal_group(live.pid, Signal::SIGKILL) {
                    warn!("Unit '{}': {}", name, e);
                }
                live.child.wait().await
            }
        };

        // members that ignored the kill signal outlive the leader
        if group_alive(live.pid) {
            if let Err(e) = signal_group(live.pid, Signal::SIGKILL) {
                warn!("Unit '{}': {}", name, e);
            }
        }

        let exit = match status {
            Ok(status) => Some(ExitInfo::from_status(&status)),
            Err(e) => {
                warn!("Failed to reap unit '{}': {}", name, e);
                None
            }
        };
        self.state.update(|s| s.mark_reaped(exit, None));
    }
}
