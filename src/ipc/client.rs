// IPC Client - talks to a running supervisor over its Unix socket

use crate::error::{Result, WardenError};
use crate::ipc::protocol::{Command, Request, Response, ResponseData};
use crate::ipc::server::DEFAULT_SOCKET_PATH;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

/// Maximum number of connection attempts
const MAX_RETRY_ATTEMPTS: u32 = 3;

/// Delay between retry attempts
const RETRY_DELAY: Duration = Duration::from_millis(100);

/// IPC client for communicating with the supervisor
pub struct IpcClient {
    socket_path: PathBuf,
    request_id: AtomicU64,
}

impl IpcClient {
    /// Create a new IPC client with a custom socket path
    pub fn with_socket_path<P: AsRef<Path>>(path: P) -> Self {
        Self {
            socket_path: path.as_ref().to_path_buf(),
            request_id: AtomicU64::new(1),
        }
    }

    /// Send a command and return the supervisor's answer
    ///
    /// Errors reported by the supervisor come back as `WardenError::Remote`
    /// carrying the exit code it assigned.
    pub async fn send_command(&self, command: Command) -> Result<ResponseData> {
        let request_id = self.request_id.fetch_add(1, Ordering::SeqCst);
        let request = Request::new(request_id, command);

        let mut stream = self.connect_with_retry().await?;
        let response = Self::exchange(&mut stream, &request).await?;

        if response.id != request_id {
            return Err(WardenError::ProtocolError(format!(
                "Response ID mismatch: expected {}, got {}",
                request_id, response.id
            )));
        }

        response.result.map_err(WardenError::from)
    }

    async fn connect_with_retry(&self) -> Result<UnixStream> {
        let mut last_error = None;
        for attempt in 1..=MAX_RETRY_ATTEMPTS {
            match self.connect().await {
                Ok(stream) => return Ok(stream),
                // nothing to retry for
                Err(WardenError::SupervisorNotRunning) => {
                    return Err(WardenError::SupervisorNotRunning)
                }
                Err(e) => {
                    last_error = Some(e);
                    if attempt < MAX_RETRY_ATTEMPTS {
                        tokio::time::sleep(RETRY_DELAY).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            WardenError::ConnectionError("Failed to connect after retries".to_string())
        }))
    }

    async fn exchange(stream: &mut UnixStream, request: &Request) -> Result<Response> {
        let mut request_json = serde_json::to_string(request).map_err(|e| {
            WardenError::ProtocolError(format!("Failed to serialize request: {}", e))
        })?;
        request_json.push('\n');

        stream
            .write_all(request_json.as_bytes())
            .await
            .map_err(|e| WardenError::IpcError(format!("Failed to write request: {}", e)))?;
        stream
            .flush()
            .await
            .map_err(|e| WardenError::IpcError(format!("Failed to flush stream: {}", e)))?;

        let mut reader = BufReader::new(stream);
        let mut response_line = String::new();
        let read = reader
            .read_line(&mut response_line)
            .await
            .map_err(|e| WardenError::IpcError(format!("Failed to read response: {}", e)))?;
        if read == 0 {
            return Err(WardenError::ConnectionError(
                "Supervisor closed the connection".to_string(),
            ));
        }

        serde_json::from_str(&response_line).map_err(|e| {
            WardenError::ProtocolError(format!("Failed to deserialize response: {}", e))
        })
    }

    async fn connect(&self) -> Result<UnixStream> {
        if !self.socket_path.exists() {
            return Err(WardenError::SupervisorNotRunning);
        }

        UnixStream::connect(&self.socket_path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::ConnectionRefused
                || e.kind() == std::io::ErrorKind::NotFound
            {
                WardenError::SupervisorNotRunning
            } else {
                WardenError::ConnectionError(format!("Failed to connect to supervisor: {}", e))
            }
        })
    }

    /// Get the socket path being used
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

impl Default for IpcClient {
    fn default() -> Self {
        Self::with_socket_path(DEFAULT_SOCKET_PATH)
    }
}
