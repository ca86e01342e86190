// IPC Server - accepts CLI connections and answers their requests

use crate::control::ControlSurface;
use crate::error::{Result, WardenError};
use crate::ipc::protocol::{Request, Response};
use std::future::Future;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info, warn};

/// Default socket path for supervisor communication
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/warden.sock";

/// IPC server for handling client connections
pub struct IpcServer {
    socket_path: PathBuf,
    listener: Option<UnixListener>,
}

impl IpcServer {
    /// Create a new IPC server with a custom socket path
    pub fn with_socket_path<P: AsRef<Path>>(path: P) -> Self {
        Self {
            socket_path: path.as_ref().to_path_buf(),
            listener: None,
        }
    }

    /// Bind the Unix socket, replacing a stale socket file
    pub fn start(&mut self) -> Result<()> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).map_err(|e| {
                WardenError::IpcError(format!("Failed to remove existing socket: {}", e))
            })?;
        }

        let listener = UnixListener::bind(&self.socket_path)
            .map_err(|e| WardenError::IpcError(format!("Failed to bind to socket: {}", e)))?;

        // Owner only (0600)
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&self.socket_path, permissions).map_err(|e| {
                WardenError::IpcError(format!("Failed to set socket permissions: {}", e))
            })?;
        }

        info!("Listening on {}", self.socket_path.display());
        self.listener = Some(listener);
        Ok(())
    }

    /// Serve connections until `shutdown` resolves
    pub async fn run<S>(&self, control: ControlSurface, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()>,
    {
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| WardenError::IpcError("Server not started".to_string()))?;

        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    debug!("IPC server shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let stream = match accepted {
                        Ok((stream, _addr)) => stream,
                        Err(e) => {
                            warn!("Failed to accept connection: {}", e);
                            continue;
                        }
                    };

                    let control = control.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, control).await {
                            error!("IPC connection failed: {}", e);
                        }
                    });
                }
            }
        }
    }

    /// Stop the server and clean up the socket file
    pub fn stop(&mut self) -> Result<()> {
        self.listener = None;

        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).map_err(|e| {
                WardenError::IpcError(format!("Failed to remove socket file: {}", e))
            })?;
        }

        Ok(())
    }

    /// Get the socket path being used
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

impl Default for IpcServer {
    fn default() -> Self {
        Self::with_socket_path(DEFAULT_SOCKET_PATH)
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// Answer every request line on one connection
async fn handle_connection(stream: UnixStream, control: ControlSurface) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| WardenError::IpcError(format!("Failed to read request: {}", e)))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let request: Request = serde_json::from_str(&line).map_err(|e| {
            WardenError::ProtocolError(format!("Failed to deserialize request: {}", e))
        })?;

        let response: Response = control.respond(request.id, request.command).await;

        let mut json = serde_json::to_string(&response).map_err(|e| {
            WardenError::ProtocolError(format!("Failed to serialize response: {}", e))
        })?;
        json.push('\n');

        write_half
            .write_all(json.as_bytes())
            .await
            .map_err(|e| WardenError::IpcError(format!("Failed to write response: {}", e)))?;
        write_half
            .flush()
            .await
            .map_err(|e| WardenError::IpcError(format!("Failed to flush stream: {}", e)))?;
    }

    Ok(())
}
