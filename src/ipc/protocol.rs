// IPC Protocol definitions for CLI-supervisor communication
//
// One JSON document per line in each direction.

use crate::error::WardenError;
use crate::logs::LogEntry;
use crate::process::{Operation, UnitStatus};
use serde::{Deserialize, Serialize};

/// All available commands
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    Start { name: String },
    Stop { name: String, grace_ms: Option<u64> },
    Restart { name: String },
    Status { name: String },
    List,
    Logs {
        name: String,
        lines: usize,
        #[serde(default)]
        filter: Option<String>,
    },
}

/// Response data variants
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ResponseData {
    /// The unit accepted the request; it completes asynchronously
    Accepted { name: String, op: Operation },
    Status(UnitStatus),
    List(Vec<UnitStatus>),
    Logs(Vec<LogEntry>),
}

/// An error with the exit code the CLI should report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub code: i32,
    pub message: String,
}

impl From<&WardenError> for ErrorReply {
    fn from(error: &WardenError) -> Self {
        Self {
            code: error.exit_code(),
            message: error.to_string(),
        }
    }
}

impl From<ErrorReply> for WardenError {
    fn from(reply: ErrorReply) -> Self {
        WardenError::Remote {
            code: reply.code,
            message: reply.message,
        }
    }
}

/// Request message from client to supervisor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub command: Command,
}

/// Response message from supervisor to client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub result: Result<ResponseData, ErrorReply>,
}

impl Request {
    pub fn new(id: u64, command: Command) -> Self {
        Self { id, command }
    }
}

impl Response {
    pub fn success(id: u64, data: ResponseData) -> Self {
        Self {
            id,
            result: Ok(data),
        }
    }

    pub fn error(id: u64, error: &WardenError) -> Self {
        Self {
            id,
            result: Err(error.into()),
        }
    }
}
