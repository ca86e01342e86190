use crate::config::ConfigErrors;
use thiserror::Error;

/// Main error type for the warden supervisor
#[derive(Debug, Error)]
pub enum WardenError {
    // Configuration errors
    #[error("{0}")]
    Config(#[from] ConfigErrors),

    #[error("Invalid configuration file: {0}")]
    InvalidConfig(String),

    // Unit lifecycle errors
    #[error("Unit not found: {0}")]
    UnitNotFound(String),

    #[error("Unit already exists: {0}")]
    UnitAlreadyExists(String),

    #[error("Unit {0} is busy with another transition")]
    Busy(String),

    #[error("Cannot {op} unit {unit} while it is {phase}")]
    InvalidTransition {
        unit: String,
        phase: String,
        op: &'static str,
    },

    #[error("Failed to spawn process: {0}")]
    SpawnError(String),

    #[error("Signal error: {0}")]
    SignalError(String),

    // Log-related errors
    #[error("Log error: {0}")]
    LogError(String),

    // IPC-related errors
    #[error("IPC error: {0}")]
    IpcError(String),

    #[error("Failed to connect to supervisor: {0}")]
    ConnectionError(String),

    #[error("IPC protocol error: {0}")]
    ProtocolError(String),

    #[error("Supervisor not running")]
    SupervisorNotRunning,

    /// An error reported by the supervisor on the other end of the socket
    #[error("{message}")]
    Remote { code: i32, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl WardenError {
    /// Process exit code reported to operators for this error
    ///
    /// `1` unit not found, `2` operation rejected, `3` everything else.
    pub fn exit_code(&self) -> i32 {
        match self {
            WardenError::UnitNotFound(_) => 1,
            WardenError::Busy(_) | WardenError::InvalidTransition { .. } => 2,
            WardenError::Remote { code, .. } => *code,
            _ => 3,
        }
    }
}

/// Result type alias for warden operations
pub type Result<T> = std::result::Result<T, WardenError>;
