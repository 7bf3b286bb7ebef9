//! Process hosting for launched agent servers.

mod command;
mod control;
mod host;

use std::fmt;

use serde::Serialize;

pub use command::{escape_for_embedding, LaunchInvocation};
pub use control::{force_kill, interrupt, is_process_alive};
pub use host::{HostEvent, HostEventReason, ProcessHost};

/// Lifecycle state of one server instance.
///
/// Owned by the process host and mirrored by its launcher. `Idle` is both
/// the initial state and the terminal state after a clean stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}
