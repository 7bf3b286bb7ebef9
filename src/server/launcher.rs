//! Lifecycle orchestration for one server instance.
//!
//! A launcher owns one process host and drives the full
//! validate/allocate/spawn/probe/stop/restart cycle for its panel. Public
//! operations are serialized through a per-launcher gate so only one
//! lifecycle transition is ever in flight.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Client;
use tokio::sync::broadcast;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{agent_card_probe_url, AgentEndpoints, ServerStatus};
use crate::config::LauncherConfig;
use crate::error::{AppError, Result};
use crate::ports::PortAllocator;
use crate::process::{
    HostEvent, HostEventReason, LaunchInvocation, ProcessHost, ServerState,
};
use crate::validation::validate_workflow_config;

const PROBE_INITIAL_INTERVAL: Duration = Duration::from_millis(100);
const PROBE_MAX_INTERVAL: Duration = Duration::from_millis(500);
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Per-launch bookkeeping, cleared on stop and dispose. The config path
/// survives an external close or a failed probe so the user can relaunch.
#[derive(Debug, Default)]
struct Descriptor {
    config_path: Option<PathBuf>,
    start_time: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

pub struct ServerLauncher {
    panel_id: String,
    config: Arc<LauncherConfig>,
    ports: Arc<PortAllocator>,
    host: Arc<ProcessHost>,
    http_client: Client,
    descriptor: RwLock<Descriptor>,
    /// Serializes launch/stop/restart/dispose for this launcher.
    op_gate: Mutex<()>,
}

impl ServerLauncher {
    #[allow(clippy::expect_used)]
    pub fn new(
        panel_id: impl Into<String>,
        config: Arc<LauncherConfig>,
        ports: Arc<PortAllocator>,
    ) -> Arc<Self> {
        let panel_id = panel_id.into();
        let http_client = Client::builder()
            .timeout(Duration::from_secs(1))
            .build()
            .expect("Failed to create HTTP client");

        let launcher = Arc::new(Self {
            host: ProcessHost::new(panel_id.clone()),
            panel_id,
            config,
            ports,
            http_client,
            descriptor: RwLock::new(Descriptor::default()),
            op_gate: Mutex::new(()),
        });
        launcher.spawn_close_listener();
        launcher
    }

    pub fn panel_id(&self) -> &str {
        &self.panel_id
    }

    /// Event stream for state transitions and external closes.
    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.host.subscribe()
    }

    pub fn state(&self) -> ServerState {
        self.host.state()
    }

    pub fn is_running(&self) -> bool {
        matches!(
            self.host.state(),
            ServerState::Starting | ServerState::Running
        )
    }

    /// Workflow file this launcher last launched, if any.
    pub fn config_path(&self) -> Option<PathBuf> {
        let descriptor = self.descriptor.read().unwrap_or_else(|e| e.into_inner());
        descriptor.config_path.clone()
    }

    pub fn status(&self) -> ServerStatus {
        let (start_time, error) = {
            let descriptor = self.descriptor.read().unwrap_or_else(|e| e.into_inner());
            (descriptor.start_time, descriptor.last_error.clone())
        };
        let port = self.ports.port_for(&self.panel_id);
        ServerStatus {
            state: self.host.state(),
            port,
            endpoints: port.map(AgentEndpoints::for_port),
            start_time,
            error,
        }
    }

    /// Launch the server for `config_path`, on `port` if pinned or an
    /// auto-allocated one otherwise. Returns once the agent-card endpoint
    /// answers, with the port the instance is serving on.
    pub async fn launch(self: &Arc<Self>, config_path: &Path, port: Option<u16>) -> Result<u16> {
        let _gate = self.op_gate.lock().await;
        let port = self.launch_locked(config_path, port)?;
        self.await_readiness(port).await?;
        Ok(port)
    }

    /// Request shutdown of the running instance: interrupt, bounded grace
    /// wait, then force kill. Leaves the launcher idle with its port freed.
    pub async fn stop(&self) -> Result<()> {
        let _gate = self.op_gate.lock().await;
        self.stop_locked().await
    }

    /// Stop and relaunch with the parameters of the current instance.
    pub async fn restart(self: &Arc<Self>) -> Result<u16> {
        let _gate = self.op_gate.lock().await;

        let config_path = self
            .config_path()
            .ok_or_else(|| AppError::no_active_instance(&self.panel_id))?;
        let port = self.ports.port_for(&self.panel_id);

        if self.is_running() {
            self.stop_locked().await?;
        }
        tokio::time::sleep(Duration::from_millis(self.config.restart_settle_ms)).await;

        let port = self.launch_locked(&config_path, port)?;
        self.await_readiness(port).await?;
        Ok(port)
    }

    /// Best-effort stop if running, then tear down the host and clear all
    /// bookkeeping. The launcher ends idle.
    pub async fn dispose(&self) {
        let _gate = self.op_gate.lock().await;
        if self.is_running() {
            if let Err(e) = self.stop_locked().await {
                log::warn!("Failed to stop instance {} on dispose: {}", self.panel_id, e);
            }
        }
        self.host.dispose();
        self.ports.release(&self.panel_id);
        let mut descriptor = self.descriptor.write().unwrap_or_else(|e| e.into_inner());
        *descriptor = Descriptor::default();
    }

    /// Synchronous half of a launch: validate, guard, resolve the port and
    /// spawn the child. Runs under the operation gate.
    fn launch_locked(self: &Arc<Self>, config_path: &Path, port: Option<u16>) -> Result<u16> {
        validate_workflow_config(config_path)?;

        if self.is_running() {
            return Err(AppError::already_running(&self.panel_id));
        }

        let port = match port {
            Some(pinned) => {
                self.ports.reserve(&self.panel_id, pinned)?;
                pinned
            }
            None => self.ports.allocate(&self.panel_id)?,
        };

        let file_name = config_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| config_path.display().to_string());
        let display_name = format!("agent server {} (port {})", file_name, port);

        let invocation = LaunchInvocation::for_agent_server(
            &self.config.runtime,
            &self.config.runner_path,
            config_path,
            port,
        );
        log::info!(
            "Launching {} for panel {}: {}",
            display_name,
            self.panel_id,
            invocation.command_line()
        );

        self.host.set_state(ServerState::Starting);
        if let Err(e) = self.host.spawn(&display_name, &invocation) {
            self.host.set_state(ServerState::Error);
            self.ports.release(&self.panel_id);
            self.record_outcome(Some(config_path), None, Some(e.to_string()));
            return Err(e);
        }

        self.record_outcome(Some(config_path), Some(Utc::now()), None);
        Ok(port)
    }

    /// Poll the agent-card endpoint until it answers or the deadline
    /// passes. A child exit during the probe surfaces as a process error;
    /// a deadline pass kills the child and leaves the launcher in error.
    async fn await_readiness(&self, port: u16) -> Result<()> {
        let url = agent_card_probe_url(port);
        let deadline = Instant::now() + Duration::from_millis(self.config.readiness_timeout_ms);
        let mut interval = PROBE_INITIAL_INTERVAL;

        loop {
            if !self.host.has_child() {
                let message = "server process exited during startup";
                self.record_outcome(None, None, Some(message.to_string()));
                return Err(AppError::process(message));
            }

            if self.probe_agent_card(&url).await {
                // An external close may have landed between the child check
                // and this probe answer; only a still-starting instance is
                // promoted, anything else is a failed launch.
                match self.host.state() {
                    ServerState::Starting => {
                        self.host.set_state(ServerState::Running);
                        log::info!(
                            "Instance {} ready on port {} ({})",
                            self.panel_id,
                            port,
                            url
                        );
                        return Ok(());
                    }
                    ServerState::Running => return Ok(()),
                    _ => {
                        let message = "server process exited during startup";
                        self.record_outcome(None, None, Some(message.to_string()));
                        return Err(AppError::process(message));
                    }
                }
            }

            if Instant::now() >= deadline {
                return Err(self.on_readiness_timeout(port));
            }

            tokio::time::sleep(interval).await;
            interval = (interval * 2).min(PROBE_MAX_INTERVAL);
        }
    }

    async fn probe_agent_card(&self, url: &str) -> bool {
        match self.http_client.get(url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    fn on_readiness_timeout(&self, port: u16) -> AppError {
        log::error!(
            "Instance {} did not become ready within {}ms on port {}",
            self.panel_id,
            self.config.readiness_timeout_ms,
            port
        );
        self.host.set_state(ServerState::Error);
        self.host.dispose_child();
        self.ports.release(&self.panel_id);
        self.record_outcome(
            None,
            None,
            Some(format!(
                "startup timed out after {}ms on port {}",
                self.config.readiness_timeout_ms, port
            )),
        );
        AppError::startup_timeout(&self.panel_id, port)
    }

    async fn stop_locked(&self) -> Result<()> {
        if !self.is_running() {
            return Err(AppError::not_running(&self.panel_id));
        }

        self.host.set_state(ServerState::Stopping);
        if let Err(e) = self.host.send_interrupt() {
            log::warn!("Interrupt for instance {} failed: {}", self.panel_id, e);
        }

        // Grace wait for a cooperative exit; the exit listener clears the
        // child handle once the process is gone.
        let deadline = Instant::now() + Duration::from_millis(self.config.stop_grace_ms);
        while self.host.has_child() && Instant::now() < deadline {
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
        }

        if let Some(pid) = self.host.dispose_child() {
            log::info!(
                "Instance {} did not exit within grace period, killed pid {}",
                self.panel_id,
                pid
            );
        }

        self.ports.release(&self.panel_id);
        {
            let mut descriptor = self.descriptor.write().unwrap_or_else(|e| e.into_inner());
            *descriptor = Descriptor::default();
        }
        self.host.set_state(ServerState::Idle);
        log::info!("Instance {} stopped", self.panel_id);
        Ok(())
    }

    /// Update descriptor fields. `config_path: None` leaves the recorded
    /// path untouched.
    fn record_outcome(
        &self,
        config_path: Option<&Path>,
        start_time: Option<DateTime<Utc>>,
        last_error: Option<String>,
    ) {
        let mut descriptor = self.descriptor.write().unwrap_or_else(|e| e.into_inner());
        if let Some(path) = config_path {
            descriptor.config_path = Some(path.to_path_buf());
        }
        descriptor.start_time = start_time;
        descriptor.last_error = last_error;
    }

    /// Port bookkeeping for the external-close path. The host has already
    /// forced its state to idle by the time this runs.
    fn on_external_close(&self) {
        if let Some(port) = self.ports.release(&self.panel_id) {
            log::warn!(
                "Instance {} closed externally, released port {}",
                self.panel_id,
                port
            );
        } else {
            log::warn!("Instance {} closed externally", self.panel_id);
        }
        let mut descriptor = self.descriptor.write().unwrap_or_else(|e| e.into_inner());
        descriptor.start_time = None;
    }

    #[cfg(test)]
    pub(crate) fn host_for_tests(&self) -> &Arc<ProcessHost> {
        &self.host
    }

    #[cfg(test)]
    pub(crate) async fn lock_gate_for_tests(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.op_gate.lock().await
    }

    #[cfg(test)]
    pub(crate) fn set_config_path_for_tests(&self, path: &Path) {
        self.record_outcome(Some(path), None, None);
    }

    fn spawn_close_listener(self: &Arc<Self>) {
        let mut events = self.host.subscribe();
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if matches!(event.reason, HostEventReason::ClosedExternally) {
                            let Some(launcher) = weak.upgrade() else {
                                break;
                            };
                            launcher.on_external_close();
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::warn!("Close listener lagged, skipped {} event(s)", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;

    use super::ServerLauncher;
    use crate::config::LauncherConfig;
    use crate::error::ErrorKind;
    use crate::ports::PortAllocator;
    use crate::process::ServerState;

    // A PID no live process should hold, so kill paths are no-ops.
    const DEAD_PID: u32 = 4_000_000;

    fn test_config() -> Arc<LauncherConfig> {
        Arc::new(LauncherConfig {
            stop_grace_ms: 50,
            restart_settle_ms: 0,
            ..LauncherConfig::default()
        })
    }

    fn launcher_with_ports() -> (Arc<ServerLauncher>, Arc<PortAllocator>) {
        let ports = Arc::new(PortAllocator::new(43100, 100));
        let launcher = ServerLauncher::new("wf-1-aaaaaa", test_config(), Arc::clone(&ports));
        (launcher, ports)
    }

    fn workflow_file(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, content).unwrap();
        path
    }

    /// Runtime stand-in that ignores its arguments and stays alive until
    /// signalled, like a server that never opens its port.
    #[cfg(unix)]
    fn stub_runtime(dir: &Path) -> PathBuf {
        use std::os::unix::fs::PermissionsExt as _;

        let path = dir.join("runtime.sh");
        fs::write(&path, "#!/bin/sh\nexec sleep 30\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    /// Minimal HTTP responder standing in for the agent-card endpoint.
    async fn spawn_agent_card_stub(port: u16) -> tokio::task::JoinHandle<()> {
        use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

        let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
            .await
            .unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let _ = socket
                    .write_all(
                        b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\n{}",
                    )
                    .await;
            }
        })
    }

    #[tokio::test]
    async fn launch_with_missing_config_leaves_idle() {
        let (launcher, ports) = launcher_with_ports();
        let err = launcher
            .launch(Path::new("/nonexistent/flow.json"), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigNotFound);
        assert_eq!(launcher.state(), ServerState::Idle);
        assert_eq!(ports.port_for("wf-1-aaaaaa"), None);
    }

    #[tokio::test]
    async fn launch_with_invalid_json_leaves_idle() {
        let dir = tempfile::tempdir().unwrap();
        let path = workflow_file(dir.path(), "flow.json", "not json {");
        let (launcher, ports) = launcher_with_ports();

        let err = launcher.launch(&path, None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfigJson);
        assert_eq!(launcher.state(), ServerState::Idle);
        assert_eq!(ports.port_for("wf-1-aaaaaa"), None);
    }

    #[tokio::test]
    async fn launch_while_starting_is_already_running() {
        let dir = tempfile::tempdir().unwrap();
        let path = workflow_file(dir.path(), "flow.json", "{\"nodes\": []}");
        let (launcher, ports) = launcher_with_ports();

        launcher.host.set_state(ServerState::Starting);
        let err = launcher.launch(&path, None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyRunning);
        assert_eq!(ports.port_for("wf-1-aaaaaa"), None);
    }

    #[tokio::test]
    async fn stop_when_idle_is_not_running() {
        let (launcher, _ports) = launcher_with_ports();
        let err = launcher.stop().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotRunning);
    }

    #[tokio::test]
    async fn stop_frees_the_port_and_clears_the_descriptor() {
        let (launcher, ports) = launcher_with_ports();
        ports.reserve("wf-1-aaaaaa", 43150).unwrap();
        launcher.host.plant_child(DEAD_PID, 1);
        launcher.host.set_state(ServerState::Running);
        launcher.record_outcome(
            Some(Path::new("/tmp/flow.json")),
            Some(chrono::Utc::now()),
            None,
        );

        launcher.stop().await.unwrap();

        assert_eq!(launcher.state(), ServerState::Idle);
        assert!(!ports.is_port_used(43150));
        assert_eq!(launcher.config_path(), None);
        let status = launcher.status();
        assert!(status.port.is_none());
        assert!(status.endpoints.is_none());
        assert!(status.start_time.is_none());
    }

    #[tokio::test]
    async fn external_close_releases_the_port_but_keeps_the_path() {
        let (launcher, ports) = launcher_with_ports();
        ports.reserve("wf-1-aaaaaa", 43160).unwrap();
        launcher.record_outcome(
            Some(Path::new("/tmp/flow.json")),
            Some(chrono::Utc::now()),
            None,
        );
        launcher.host.plant_child(DEAD_PID, 1);
        launcher.host.set_state(ServerState::Running);

        launcher.host.on_child_exit(1);
        launcher.on_external_close();

        assert_eq!(launcher.state(), ServerState::Idle);
        assert!(!ports.is_port_used(43160));
        let status = launcher.status();
        assert!(status.port.is_none());
        assert!(status.endpoints.is_none());
        assert!(status.start_time.is_none());
        assert_eq!(launcher.config_path(), Some(PathBuf::from("/tmp/flow.json")));
    }

    #[tokio::test]
    async fn restart_with_nothing_on_record_is_no_active_instance() {
        let (launcher, _ports) = launcher_with_ports();
        let err = launcher.restart().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoActiveInstance);
    }

    #[tokio::test]
    async fn status_reports_endpoints_only_while_a_port_is_held() {
        let (launcher, ports) = launcher_with_ports();
        assert!(launcher.status().endpoints.is_none());

        ports.reserve("wf-1-aaaaaa", 43170).unwrap();
        let status = launcher.status();
        assert_eq!(status.port, Some(43170));
        let endpoints = status.endpoints.unwrap();
        assert_eq!(
            endpoints.agent_card,
            "http://localhost:43170/.well-known/agent.json"
        );
    }

    #[tokio::test]
    async fn is_running_covers_starting_and_running_only() {
        let (launcher, _ports) = launcher_with_ports();
        for (state, expected) in [
            (ServerState::Idle, false),
            (ServerState::Starting, true),
            (ServerState::Running, true),
            (ServerState::Stopping, false),
            (ServerState::Stopped, false),
            (ServerState::Error, false),
        ] {
            launcher.host.set_state(state);
            assert_eq!(launcher.is_running(), expected, "state {:?}", state);
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn launch_promotes_to_running_once_the_agent_card_answers() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = stub_runtime(dir.path());
        let path = workflow_file(dir.path(), "flow.json", "{\"nodes\": []}");
        let ports = Arc::new(PortAllocator::new(43600, 100));
        let config = Arc::new(LauncherConfig {
            runtime: runtime.display().to_string(),
            stop_grace_ms: 200,
            ..LauncherConfig::default()
        });
        let launcher = ServerLauncher::new("wf-1-aaaaaa", config, Arc::clone(&ports));
        let stub = spawn_agent_card_stub(43610).await;

        let port = launcher.launch(&path, Some(43610)).await.unwrap();

        assert_eq!(port, 43610);
        assert_eq!(launcher.state(), ServerState::Running);
        let status = launcher.status();
        assert_eq!(status.port, Some(43610));
        assert!(status.start_time.is_some());
        assert!(status.error.is_none());

        launcher.stop().await.unwrap();
        assert_eq!(launcher.state(), ServerState::Idle);
        assert!(!ports.is_port_used(43610));
        stub.abort();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn readiness_deadline_lands_in_error_and_frees_the_port() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = stub_runtime(dir.path());
        let path = workflow_file(dir.path(), "flow.json", "{\"nodes\": []}");
        let ports = Arc::new(PortAllocator::new(43600, 100));
        let config = Arc::new(LauncherConfig {
            runtime: runtime.display().to_string(),
            readiness_timeout_ms: 400,
            ..LauncherConfig::default()
        });
        let launcher = ServerLauncher::new("wf-1-aaaaaa", config, Arc::clone(&ports));

        // Nothing answers on the pinned port.
        let err = launcher.launch(&path, Some(43620)).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::StartupTimeout);
        assert_eq!(err.payload().get("port").map(String::as_str), Some("43620"));
        assert_eq!(launcher.state(), ServerState::Error);
        assert!(!ports.is_port_used(43620));
        let status = launcher.status();
        assert!(status.port.is_none());
        assert!(status.error.is_some());
        // The path survives so an explicit relaunch can clear the error.
        assert_eq!(launcher.config_path(), Some(path));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn child_exit_during_startup_fails_the_launch() {
        let dir = tempfile::tempdir().unwrap();
        let path = workflow_file(dir.path(), "flow.json", "{\"nodes\": []}");
        let ports = Arc::new(PortAllocator::new(43600, 100));
        let config = Arc::new(LauncherConfig {
            runtime: "true".to_string(),
            ..LauncherConfig::default()
        });
        let launcher = ServerLauncher::new("wf-1-aaaaaa", config, Arc::clone(&ports));

        let err = launcher.launch(&path, Some(43630)).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Process);
        assert_eq!(launcher.state(), ServerState::Idle);
        // The close listener releases the port asynchronously.
        for _ in 0..50 {
            if !ports.is_port_used(43630) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(!ports.is_port_used(43630));
    }

    #[tokio::test]
    async fn probe_answer_after_an_external_close_is_not_a_success() {
        let (launcher, ports) = launcher_with_ports();
        ports.reserve("wf-1-aaaaaa", 43640).unwrap();
        let stub = spawn_agent_card_stub(43640).await;
        // Child handle still present, but state already forced back to idle
        // by an external close.
        launcher.host.plant_child(DEAD_PID, 1);

        let err = launcher.await_readiness(43640).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Process);
        assert_eq!(launcher.state(), ServerState::Idle);
        stub.abort();
    }

    #[tokio::test]
    async fn dispose_is_idempotent_and_leaves_idle() {
        let (launcher, ports) = launcher_with_ports();
        ports.reserve("wf-1-aaaaaa", 43180).unwrap();
        launcher.host.plant_child(DEAD_PID, 1);
        launcher.host.set_state(ServerState::Running);

        launcher.dispose().await;
        launcher.dispose().await;

        assert_eq!(launcher.state(), ServerState::Idle);
        assert!(!ports.is_port_used(43180));
        assert_eq!(launcher.config_path(), None);
    }
}
