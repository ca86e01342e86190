use crate::config::ProcessSpec;
use crate::error::{Result, WardenError};
use std::process::Stdio;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};

/// A freshly spawned child with its output pipes taken out
#[derive(Debug)]
pub struct SpawnedProcess {
    /// The child process handle
    pub child: Child,

    /// Process ID assigned by the OS
    pub pid: u32,

    pub stdout: Option<ChildStdout>,
    pub stderr: Option<ChildStderr>,
}

/// Spawn the child described by `spec`
///
/// The child inherits the supervisor's environment with `spec.env` laid over
/// it, runs in `spec.cwd` and leads its own process group so that signals
/// reach anything it forks. Both output streams are piped for the log sink.
pub fn spawn_process(spec: &ProcessSpec) -> Result<SpawnedProcess> {
    let mut command = Command::new(&spec.command);
    command
        .args(&spec.args)
        .current_dir(&spec.cwd)
        .envs(&spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    #[cfg(unix)]
    command.process_group(0);

    let mut child = command.spawn().map_err(|e| {
        WardenError::SpawnError(format!(
            "Failed to spawn '{}' for unit '{}': {}",
            spec.command, spec.name, e
        ))
    })?;

    let pid = child.id().ok_or_else(|| {
        WardenError::SpawnError(format!("Failed to get PID for unit '{}'", spec.name))
    })?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    Ok(SpawnedProcess {
        child,
        pid,
        stdout,
        stderr,
    })
}

/// Send `signal` to the process group led by `pid`
#[cfg(unix)]
pub fn signal_group(pid: u32, signal: nix::sys::signal::Signal) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    match killpg(Pid::from_raw(pid as i32), signal) {
        // Already gone
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(WardenError::SignalError(format!(
            "Failed to send {} to process group {}: {}",
            signal, pid, e
        ))),
    }
}

/// Whether any process is left in the group led by `pid`
#[cfg(unix)]
pub fn group_alive(pid: u32) -> bool {
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    killpg(Pid::from_raw(pid as i32), None).is_ok()
}
