// Process module - unit lifecycle, restart policy and OS-facing helpers

pub mod health;
pub mod monitor;
pub mod restart;
pub mod spawner;
mod supervisor;
mod types;
mod unit;

pub use monitor::{ResourceMonitor, ResourceSample};
pub use restart::{ExitHistory, ExitRecord, RestartDecision, RestartPolicy};
pub use spawner::{spawn_process, SpawnedProcess};
pub use supervisor::{Supervisor, SupervisorConfig};
pub use types::{ExitInfo, Failure, Operation, RuntimeState, UnitPhase, UnitStatus};
