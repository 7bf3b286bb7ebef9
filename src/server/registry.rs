//! Keyed collection of server launchers, one per panel.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use futures_util::future::join_all;

use super::{RegistrySnapshot, ServerLauncher};
use crate::error::{AppError, Result};

/// Tracks identity only: unregistering does not stop the launcher, and
/// callers are expected to dispose a launcher before (or as part of)
/// removing it.
#[derive(Default)]
pub struct ServerRegistry {
    launchers: RwLock<HashMap<String, Arc<ServerLauncher>>>,
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a launcher. Duplicate panel ids are a hard error, never a
    /// silent overwrite.
    pub fn register(&self, panel_id: &str, launcher: Arc<ServerLauncher>) -> Result<()> {
        let mut launchers = self.launchers.write().unwrap_or_else(|e| e.into_inner());
        if launchers.contains_key(panel_id) {
            return Err(AppError::duplicate_registration(panel_id));
        }
        log::info!("Registered launcher for panel {}", panel_id);
        launchers.insert(panel_id.to_string(), launcher);
        Ok(())
    }

    pub fn unregister(&self, panel_id: &str) -> Option<Arc<ServerLauncher>> {
        let mut launchers = self.launchers.write().unwrap_or_else(|e| e.into_inner());
        let removed = launchers.remove(panel_id);
        if removed.is_some() {
            log::info!("Unregistered launcher for panel {}", panel_id);
        }
        removed
    }

    pub fn get(&self, panel_id: &str) -> Option<Arc<ServerLauncher>> {
        let launchers = self.launchers.read().unwrap_or_else(|e| e.into_inner());
        launchers.get(panel_id).cloned()
    }

    /// First launcher whose current workflow file matches `path`.
    pub fn get_by_config_path(&self, path: &Path) -> Option<Arc<ServerLauncher>> {
        let launchers = self.launchers.read().unwrap_or_else(|e| e.into_inner());
        launchers
            .values()
            .find(|launcher| launcher.config_path().as_deref() == Some(path))
            .cloned()
    }

    pub fn all(&self) -> Vec<Arc<ServerLauncher>> {
        let launchers = self.launchers.read().unwrap_or_else(|e| e.into_inner());
        launchers.values().cloned().collect()
    }

    pub fn count(&self) -> usize {
        let launchers = self.launchers.read().unwrap_or_else(|e| e.into_inner());
        launchers.len()
    }

    pub fn running_count(&self) -> usize {
        let launchers = self.launchers.read().unwrap_or_else(|e| e.into_inner());
        launchers
            .values()
            .filter(|launcher| launcher.is_running())
            .count()
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let launchers = self.launchers.read().unwrap_or_else(|e| e.into_inner());
        RegistrySnapshot {
            registered: launchers.len(),
            running: launchers
                .values()
                .filter(|launcher| launcher.is_running())
                .count(),
        }
    }

    /// Concurrently stop every running launcher, waiting for all stops to
    /// finish. Individual failures are logged and do not abort the others.
    pub async fn stop_all(&self) {
        let running: Vec<Arc<ServerLauncher>> = {
            let launchers = self.launchers.read().unwrap_or_else(|e| e.into_inner());
            launchers
                .values()
                .filter(|launcher| launcher.is_running())
                .cloned()
                .collect()
        };
        if running.is_empty() {
            return;
        }
        log::info!("Stopping {} running instance(s)", running.len());

        let results = join_all(running.iter().map(|launcher| launcher.stop())).await;
        for (launcher, result) in running.iter().zip(results) {
            if let Err(e) = result {
                log::error!("Failed to stop instance {}: {}", launcher.panel_id(), e);
            }
        }
    }

    /// Drop every tracked launcher. Used at whole-extension shutdown after
    /// `stop_all`.
    pub fn clear(&self) {
        let mut launchers = self.launchers.write().unwrap_or_else(|e| e.into_inner());
        launchers.clear();
    }
}
