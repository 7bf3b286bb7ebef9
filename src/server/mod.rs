//! Server instance lifecycle: one launcher per editor panel, tracked by a
//! registry for aggregate operations.

mod launcher;
mod registry;

use chrono::{DateTime, Utc};
use serde::Serialize;

pub use launcher::ServerLauncher;
pub use registry::ServerRegistry;

use crate::process::ServerState;

/// Endpoint URLs derived from an allocated port.
///
/// Purely informational: derived by string substitution, never probed for
/// reachability (the readiness probe uses the agent-card URL separately).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentEndpoints {
    pub agent_card: String,
    pub message_send: String,
    pub tasks: String,
}

impl AgentEndpoints {
    pub fn for_port(port: u16) -> Self {
        Self {
            agent_card: agent_card_probe_url(port),
            message_send: format!("http://localhost:{}/message/send", port),
            tasks: format!("http://localhost:{}/tasks", port),
        }
    }
}

/// URL polled by the readiness probe after a launch.
pub fn agent_card_probe_url(port: u16) -> String {
    format!("http://localhost:{}/.well-known/agent.json", port)
}

/// Point-in-time view of one launcher, shaped for the editor UI.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub state: ServerState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoints: Option<AgentEndpoints>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Aggregate counts over the server registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RegistrySnapshot {
    pub registered: usize,
    pub running: usize,
}

#[cfg(test)]
mod tests {
    use super::{agent_card_probe_url, AgentEndpoints};

    #[test]
    fn endpoints_are_derived_from_the_port() {
        let endpoints = AgentEndpoints::for_port(3007);
        assert_eq!(
            endpoints.agent_card,
            "http://localhost:3007/.well-known/agent.json"
        );
        assert_eq!(endpoints.message_send, "http://localhost:3007/message/send");
        assert_eq!(endpoints.tasks, "http://localhost:3007/tasks");
        assert_eq!(endpoints.agent_card, agent_card_probe_url(3007));
    }
}
