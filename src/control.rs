use crate::error::{Result, WardenError};
use crate::ipc::protocol::{Command, Response, ResponseData};
use crate::logs::{read_logs, LogEntry, LogReadOptions};
use crate::process::{Operation, Supervisor, UnitStatus};
use std::time::Duration;
use tracing::debug;

/// Exit code for a successful operation
pub const EXIT_OK: i32 = 0;

/// Operator-facing entry points onto a [`Supervisor`]
///
/// Every lifecycle request is accepted or rejected before returning; the
/// transition itself completes in the unit's task and shows up in `status`.
#[derive(Debug, Clone)]
pub struct ControlSurface {
    supervisor: Supervisor,
}

impl ControlSurface {
    pub fn new(supervisor: Supervisor) -> Self {
        Self { supervisor }
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn start(&self, name: &str) -> Result<()> {
        self.supervisor.start(name)
    }

    /// Stop `name`, allowing `grace` (or the unit's kill timeout) before SIGKILL
    pub fn stop(&self, name: &str, grace: Option<Duration>) -> Result<()> {
        self.supervisor.stop(name, grace)
    }

    pub fn restart(&self, name: &str) -> Result<()> {
        self.supervisor.restart(name)
    }

    pub fn status(&self, name: &str) -> Result<UnitStatus> {
        self.supervisor.status(name)
    }

    pub fn list(&self) -> Vec<UnitStatus> {
        self.supervisor.list()
    }

    /// Last `lines` lines of the unit's logs
    pub async fn logs(
        &self,
        name: &str,
        lines: usize,
        filter: Option<String>,
    ) -> Result<Vec<LogEntry>> {
        let spec = self.supervisor.spec(name)?;
        let options = LogReadOptions { lines, filter };
        read_logs(&spec.logs, &options).await
    }

    /// Execute one IPC command
    pub async fn handle(&self, command: Command) -> Result<ResponseData> {
        debug!("Handling command: {:?}", command);

        match command {
            Command::Start { name } => {
                self.start(&name)?;
                Ok(accepted(name, Operation::Start))
            }
            Command::Stop { name, grace_ms } => {
                self.stop(&name, grace_ms.map(Duration::from_millis))?;
                Ok(accepted(name, Operation::Stop))
            }
            Command::Restart { name } => {
                self.restart(&name)?;
                Ok(accepted(name, Operation::Restart))
            }
            Command::Status { name } => Ok(ResponseData::Status(self.status(&name)?)),
            Command::List => Ok(ResponseData::List(self.list())),
            Command::Logs {
                name,
                lines,
                filter,
            } => Ok(ResponseData::Logs(self.logs(&name, lines, filter).await?)),
        }
    }

    /// Execute one IPC request, folding errors into the response
    pub async fn respond(&self, id: u64, command: Command) -> Response {
        match self.handle(command).await {
            Ok(data) => Response::success(id, data),
            Err(e) => Response::error(id, &e),
        }
    }
}

fn accepted(name: String, op: Operation) -> ResponseData {
    ResponseData::Accepted { name, op }
}

/// Process exit code for the outcome of an operation
///
/// `0` success, `1` unit not found, `2` rejected, `3` internal failure.
pub fn exit_code<T>(result: &std::result::Result<T, WardenError>) -> i32 {
    match result {
        Ok(_) => EXIT_OK,
        Err(e) => e.exit_code(),
    }
}
