//! Server lifecycle and resource-allocation core for an agent workflow
//! editor.
//!
//! Each open editor panel can run one external HTTP agent server. This
//! crate launches, monitors and tears down those servers, hands each one an
//! exclusive TCP port, and keeps per-panel lifecycle state consistent. The
//! editor UI itself lives elsewhere and talks to this crate through
//! [`LauncherContext`].

pub mod config;
pub mod error;
pub mod panels;
pub mod ports;
pub mod process;
pub mod server;
pub mod validation;

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;

pub use config::LauncherConfig;
pub use error::{AppError, ErrorKind, Result};
pub use panels::{PanelRecord, PanelRegistry};
pub use ports::PortAllocator;
pub use process::{HostEvent, HostEventReason, ServerState};
pub use server::{AgentEndpoints, RegistrySnapshot, ServerLauncher, ServerRegistry, ServerStatus};

/// Top-level application context owning every registry in the crate.
///
/// All state lives here; nothing is ambient or process-global. The
/// embedding application constructs one context at startup, threads it to
/// whatever creates panels, and calls [`LauncherContext::shutdown`] on the
/// way out.
pub struct LauncherContext {
    config: Arc<LauncherConfig>,
    ports: Arc<PortAllocator>,
    panels: PanelRegistry,
    servers: ServerRegistry,
}

impl LauncherContext {
    pub fn new(config: LauncherConfig) -> Self {
        let ports = Arc::new(PortAllocator::new(
            config.base_port,
            config.max_port_attempts,
        ));
        Self {
            config: Arc::new(config),
            ports,
            panels: PanelRegistry::new(),
            servers: ServerRegistry::new(),
        }
    }

    /// Construct a context from a settings file, writing defaults there if
    /// it does not exist yet.
    pub fn from_settings_file(path: &Path) -> Result<Self> {
        Ok(Self::new(LauncherConfig::load_from(path)?))
    }

    pub fn config(&self) -> &LauncherConfig {
        &self.config
    }

    pub fn ports(&self) -> &Arc<PortAllocator> {
        &self.ports
    }

    pub fn panels(&self) -> &PanelRegistry {
        &self.panels
    }

    pub fn servers(&self) -> &ServerRegistry {
        &self.servers
    }

    /// Open a new editor panel: generate its id, track it, and pair it
    /// with a fresh launcher. Returns the panel id the UI keys on.
    pub fn open_panel(
        &self,
        config_path: Option<&Path>,
        view_tag: Option<&str>,
    ) -> Result<String> {
        let panel_id = self.panels.generate_id();
        self.panels.register(PanelRecord {
            id: panel_id.clone(),
            config_path: config_path.map(Path::to_path_buf),
            view_tag: view_tag.map(str::to_string),
            opened_at: Utc::now(),
        })?;

        let launcher = ServerLauncher::new(
            panel_id.clone(),
            Arc::clone(&self.config),
            Arc::clone(&self.ports),
        );
        if let Err(e) = self.servers.register(&panel_id, launcher) {
            self.panels.unregister(&panel_id);
            return Err(e);
        }
        Ok(panel_id)
    }

    /// Launcher for a panel, if one is tracked.
    pub fn launcher(&self, panel_id: &str) -> Option<Arc<ServerLauncher>> {
        self.servers.get(panel_id)
    }

    /// Close an editor panel: dispose its launcher (stopping any running
    /// instance) and drop both registry entries. Unknown ids are a no-op.
    pub async fn close_panel(&self, panel_id: &str) {
        if let Some(launcher) = self.servers.unregister(panel_id) {
            launcher.dispose().await;
        }
        self.panels.unregister(panel_id);
    }

    /// Whole-context teardown: stop servers first, then discard panel
    /// state, then clear the allocation table.
    pub async fn shutdown(&self) {
        log::info!(
            "Shutting down launcher context ({} panel(s), {} running instance(s))",
            self.panels.count(),
            self.servers.running_count()
        );
        self.servers.stop_all().await;
        self.servers.clear();
        self.panels.dispose_all();
        self.ports.reset();
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::{LauncherContext, LauncherConfig, ServerState};

    fn context() -> LauncherContext {
        LauncherContext::new(LauncherConfig {
            base_port: 43500,
            stop_grace_ms: 50,
            ..LauncherConfig::default()
        })
    }

    #[tokio::test]
    async fn open_panel_tracks_both_registries() {
        let ctx = context();
        let panel_id = ctx
            .open_panel(Some(Path::new("/tmp/flow.json")), Some("editor-1"))
            .unwrap();

        assert_eq!(ctx.panels().count(), 1);
        assert_eq!(ctx.servers().count(), 1);
        let record = ctx.panels().get(&panel_id).unwrap();
        assert_eq!(record.view_tag.as_deref(), Some("editor-1"));
        let launcher = ctx.launcher(&panel_id).unwrap();
        assert_eq!(launcher.panel_id(), panel_id);
        assert_eq!(launcher.state(), ServerState::Idle);
    }

    #[tokio::test]
    async fn close_panel_drops_both_entries_and_frees_the_port() {
        let ctx = context();
        let panel_id = ctx.open_panel(None, None).unwrap();
        ctx.ports().reserve(&panel_id, 43510).unwrap();

        ctx.close_panel(&panel_id).await;

        assert_eq!(ctx.panels().count(), 0);
        assert_eq!(ctx.servers().count(), 0);
        assert!(!ctx.ports().is_port_used(43510));
    }

    #[tokio::test]
    async fn close_panel_with_unknown_id_is_a_no_op() {
        let ctx = context();
        ctx.close_panel("wf-1-zzzzzz").await;
        assert_eq!(ctx.panels().count(), 0);
    }

    #[tokio::test]
    async fn shutdown_clears_every_registry() {
        let ctx = context();
        let first = ctx.open_panel(None, None).unwrap();
        ctx.open_panel(None, None).unwrap();
        ctx.ports().allocate(&first).unwrap();

        ctx.shutdown().await;

        assert_eq!(ctx.panels().count(), 0);
        assert_eq!(ctx.servers().count(), 0);
        assert!(ctx.ports().snapshot().is_empty());
    }
}
