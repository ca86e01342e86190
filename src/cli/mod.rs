// CLI module - User-facing command-line interface

mod output;

use crate::config::load_specs;
use crate::control::{exit_code, ControlSurface, EXIT_OK};
use crate::error::{Result, WardenError};
use crate::ipc::{Command, IpcClient, IpcServer, ResponseData, DEFAULT_SOCKET_PATH};
use crate::process::Supervisor;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{error, info};

/// warden - a small process supervisor for pm2-style ecosystem files
#[derive(Parser, Debug)]
#[command(name = "warden")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Unix socket of the running supervisor
    #[arg(short, long, global = true, default_value = DEFAULT_SOCKET_PATH)]
    socket: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the supervisor in the foreground and start every unit
    Run {
        /// Ecosystem file (.toml or .json)
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Validate an ecosystem file and report every problem
    Check {
        /// Ecosystem file (.toml or .json)
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Start a stopped or failed unit
    Start {
        /// Unit name
        name: String,
    },

    /// Stop a unit
    Stop {
        /// Unit name
        name: String,

        /// Milliseconds to wait after the kill signal before SIGKILL
        #[arg(short, long)]
        grace: Option<u64>,
    },

    /// Restart a unit
    Restart {
        /// Unit name
        name: String,
    },

    /// Show the status of one unit
    Status {
        /// Unit name
        name: String,
    },

    /// List all units
    List,

    /// Show the last lines of a unit's logs
    Logs {
        /// Unit name
        name: String,

        /// Number of lines to display
        #[arg(short, long, default_value = "20")]
        lines: usize,

        /// Only show lines containing this text
        #[arg(short, long)]
        filter: Option<String>,
    },
}

impl Cli {
    /// Execute the parsed command and return the process exit code
    pub async fn run(self) -> i32 {
        let result = match &self.command {
            Commands::Run { config } => run_supervisor(config, &self.socket).await,
            Commands::Check { config } => check_config(config),
            command => self.send(command).await,
        };

        match &result {
            Ok(()) => EXIT_OK,
            Err(WardenError::Config(errors)) => {
                output::print_violations(errors);
                exit_code(&result)
            }
            Err(e) => {
                output::print_error(&e.to_string());
                exit_code(&result)
            }
        }
    }

    /// Forward an operator command to the running supervisor
    async fn send(&self, command: &Commands) -> Result<()> {
        let command = build_command(command)?;
        let client = IpcClient::with_socket_path(&self.socket);

        match client.send_command(command).await? {
            ResponseData::Accepted { name, op } => output::print_accepted(&name, op),
            ResponseData::Status(status) => output::print_detailed_status(&status),
            ResponseData::List(units) => output::print_unit_table(&units),
            ResponseData::Logs(entries) => output::print_logs(&entries),
        }
        Ok(())
    }
}

/// Build an IPC command from the CLI arguments
fn build_command(command: &Commands) -> Result<Command> {
    match command {
        Commands::Start { name } => Ok(Command::Start { name: name.clone() }),
        Commands::Stop { name, grace } => Ok(Command::Stop {
            name: name.clone(),
            grace_ms: *grace,
        }),
        Commands::Restart { name } => Ok(Command::Restart { name: name.clone() }),
        Commands::Status { name } => Ok(Command::Status { name: name.clone() }),
        Commands::List => Ok(Command::List),
        Commands::Logs {
            name,
            lines,
            filter,
        } => Ok(Command::Logs {
            name: name.clone(),
            lines: *lines,
            filter: filter.clone(),
        }),
        Commands::Run { .. } | Commands::Check { .. } => Err(WardenError::Internal(
            "command is handled locally".to_string(),
        )),
    }
}

fn check_config(path: &Path) -> Result<()> {
    let specs = load_specs(path)?;
    output::print_specs(&specs);
    Ok(())
}

/// Load the config, start every unit and serve the socket until a signal arrives
async fn run_supervisor(config: &Path, socket: &Path) -> Result<()> {
    let specs = load_specs(config)?;

    let supervisor = Supervisor::with_defaults();
    for spec in specs {
        supervisor.add(spec)?;
    }

    let mut server = IpcServer::with_socket_path(socket);
    server.start()?;

    supervisor.start_all();
    info!(
        "Supervising {} unit(s) from {}",
        supervisor.names().len(),
        config.display()
    );

    let control = ControlSurface::new(supervisor.clone());
    let served = server.run(control, shutdown_signal()).await;
    if let Err(e) = &served {
        error!("IPC server failed: {}", e);
    }

    info!("Stopping all units");
    supervisor.shutdown().await;
    server.stop()?;
    output::print_success_msg("All units stopped");

    served
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            error!("Failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
        _ = terminate.recv() => info!("Received SIGTERM"),
    }
}
