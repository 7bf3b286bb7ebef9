//! Launcher settings persisted as TOML.
//!
//! Settings are loaded once and owned by the [`crate::LauncherContext`];
//! nothing in this crate reads them from ambient global state.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// Settings for the launcher core.
///
/// Every field has a serde default so a partial (or missing) settings file
/// still yields a usable configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LauncherConfig {
    /// Program used to run the agent server (a JavaScript runtime).
    #[serde(default = "default_runtime")]
    pub runtime: String,
    /// Path to the runner script handed to the runtime.
    #[serde(default = "default_runner_path")]
    pub runner_path: String,
    /// First candidate port for auto-allocation.
    #[serde(default = "default_base_port")]
    pub base_port: u16,
    /// Maximum number of candidate ports probed per allocation.
    #[serde(default = "default_max_port_attempts")]
    pub max_port_attempts: u16,
    /// Overall deadline for the readiness probe, in milliseconds.
    #[serde(default = "default_readiness_timeout_ms")]
    pub readiness_timeout_ms: u64,
    /// Grace period between the interrupt signal and a force kill, in milliseconds.
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
    /// Settle period between the stop and relaunch halves of a restart, in milliseconds.
    #[serde(default = "default_restart_settle_ms")]
    pub restart_settle_ms: u64,
}

fn default_runtime() -> String {
    "node".to_string()
}

fn default_runner_path() -> String {
    "runner.js".to_string()
}

fn default_base_port() -> u16 {
    3000
}

fn default_max_port_attempts() -> u16 {
    100
}

fn default_readiness_timeout_ms() -> u64 {
    2000
}

fn default_stop_grace_ms() -> u64 {
    500
}

fn default_restart_settle_ms() -> u64 {
    1000
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            runtime: default_runtime(),
            runner_path: default_runner_path(),
            base_port: default_base_port(),
            max_port_attempts: default_max_port_attempts(),
            readiness_timeout_ms: default_readiness_timeout_ms(),
            stop_grace_ms: default_stop_grace_ms(),
            restart_settle_ms: default_restart_settle_ms(),
        }
    }
}

impl LauncherConfig {
    /// Conventional settings location under the platform config directory.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("agentflow-launcher")
            .join("launcher.toml")
    }

    /// Load settings from `path`, writing defaults there if the file is missing.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            let config = Self::default();
            config.save_to(path)?;
            return Ok(config);
        }
        let content = fs::read_to_string(path).map_err(|e| AppError::config(e.to_string()))?;
        toml::from_str(&content).map_err(|e| AppError::config(e.to_string()))
    }

    /// Persist settings to `path`, creating parent directories as needed.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| AppError::io(format!("Failed to create config dir: {}", e)))?;
        }
        let content = toml::to_string_pretty(self).map_err(|e| AppError::config(e.to_string()))?;
        fs::write(path, content).map_err(|e| AppError::config(e.to_string()))
    }
}
