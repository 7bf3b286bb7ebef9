//! Managed subprocess host for one server instance.
//!
//! Each launcher owns exactly one host; the host owns at most one child
//! process at a time. The child's exit is the only signal this subsystem
//! ever receives about the external program's fate, so it is surfaced as a
//! distinguishable "closed externally" event whenever it was not caused by
//! a stop this crate initiated.

use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde::Serialize;
use tokio::io::{AsyncBufReadExt as _, BufReader};
use tokio::process::Command;
use tokio::sync::broadcast;

use super::command::LaunchInvocation;
use super::control::{force_kill, is_process_alive};
use super::ServerState;
use crate::error::{AppError, Result};

const EVENT_CHANNEL_CAPACITY: usize = 128;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HostEventReason {
    StateChanged { from: ServerState, to: ServerState },
    ClosedExternally,
}

#[derive(Debug, Clone, Serialize)]
pub struct HostEvent {
    pub panel_id: String,
    pub reason: HostEventReason,
    /// Human-readable notice, e.g. `"starting -> running"`.
    pub notice: String,
}

/// Bookkeeping for the currently hosted child. The `tokio` child handle
/// itself is moved into the exit-listener task; only the PID and a
/// generation token stay behind.
#[derive(Debug, Clone, Copy)]
struct ChildHandle {
    pid: u32,
    generation: u64,
}

pub struct ProcessHost {
    panel_id: String,
    display_name: RwLock<String>,
    state: RwLock<ServerState>,
    child: Mutex<Option<ChildHandle>>,
    /// Bumped on every spawn; listeners from a disposed child compare
    /// against it so they can never fire for its replacement.
    generation: AtomicU64,
    events: broadcast::Sender<HostEvent>,
}

impl ProcessHost {
    pub fn new(panel_id: impl Into<String>) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            panel_id: panel_id.into(),
            display_name: RwLock::new(String::new()),
            state: RwLock::new(ServerState::Idle),
            child: Mutex::new(None),
            generation: AtomicU64::new(0),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.events.subscribe()
    }

    pub fn panel_id(&self) -> &str {
        &self.panel_id
    }

    pub fn state(&self) -> ServerState {
        *self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Explicit state mutation. A transition to a different state notifies
    /// subscribers with an `"<old> -> <new>"` notice.
    pub fn set_state(&self, next: ServerState) {
        let previous = {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            let previous = *state;
            *state = next;
            previous
        };
        if previous == next {
            return;
        }
        log::debug!("Instance {} state: {} -> {}", self.panel_id, previous, next);
        let _ = self.events.send(HostEvent {
            panel_id: self.panel_id.clone(),
            reason: HostEventReason::StateChanged {
                from: previous,
                to: next,
            },
            notice: format!("{} -> {}", previous, next),
        });
    }

    pub fn pid(&self) -> Option<u32> {
        let child = self.child.lock().unwrap_or_else(|e| e.into_inner());
        child.map(|handle| handle.pid)
    }

    pub fn has_child(&self) -> bool {
        self.pid().is_some()
    }

    /// Spawn a fresh child for this host, disposing any predecessor first.
    pub fn spawn(
        self: &Arc<Self>,
        display_name: &str,
        invocation: &LaunchInvocation,
    ) -> Result<u32> {
        self.dispose_child();

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            cmd.process_group(0);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| AppError::process(format!("Failed to start {}: {}", display_name, e)))?;
        let pid = child
            .id()
            .ok_or_else(|| AppError::process("Failed to get process ID"))?;

        {
            let mut name = self.display_name.write().unwrap_or_else(|e| e.into_inner());
            *name = display_name.to_string();
        }
        {
            let mut slot = self.child.lock().unwrap_or_else(|e| e.into_inner());
            *slot = Some(ChildHandle { pid, generation });
        }

        if let Some(stdout) = child.stdout.take() {
            let name = display_name.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    log::info!("[{} stdout] {}", name, line);
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let name = display_name.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    log::error!("[{} stderr] {}", name, line);
                }
            });
        }

        let host = Arc::clone(self);
        tokio::spawn(async move {
            let _ = child.wait().await;
            host.on_child_exit(generation);
        });

        log::info!("Spawned {} (pid {})", display_name, pid);
        Ok(pid)
    }

    /// Request cooperative shutdown of the hosted process.
    pub fn send_interrupt(&self) -> Result<()> {
        let pid = self
            .pid()
            .ok_or_else(|| AppError::no_active_host(&self.panel_id))?;
        super::control::interrupt(pid)
    }

    /// Detach the current child without killing it. The pending exit
    /// listener becomes a no-op. Used by the stop path once the child has
    /// been confirmed (or forced) down.
    pub fn take_child(&self) -> Option<u32> {
        let mut slot = self.child.lock().unwrap_or_else(|e| e.into_inner());
        slot.take().map(|handle| handle.pid)
    }

    /// Detach the current child and force-kill it if still alive.
    pub fn dispose_child(&self) -> Option<u32> {
        let pid = self.take_child()?;
        if is_process_alive(pid) {
            if let Err(e) = force_kill(pid) {
                log::warn!("Failed to kill PID {} for {}: {}", pid, self.panel_id, e);
            }
        }
        Some(pid)
    }

    /// Install a fake child handle so exit paths can be exercised without
    /// spawning a process. The PID should not belong to a live process.
    #[cfg(test)]
    pub(crate) fn plant_child(&self, pid: u32, generation: u64) {
        let mut slot = self.child.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(ChildHandle { pid, generation });
    }

    /// Dispose the host: kill any child and reset state to idle.
    pub fn dispose(&self) {
        self.dispose_child();
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        *state = ServerState::Idle;
    }

    /// Exit listener body. Stale generations (a disposed child, or one the
    /// stop path already detached) are ignored. An exit that arrives while
    /// the instance is starting or running was caused by something outside
    /// this crate, so state is forced to idle and subscribers get a
    /// distinguishable notice.
    pub(crate) fn on_child_exit(&self, generation: u64) {
        {
            let mut slot = self.child.lock().unwrap_or_else(|e| e.into_inner());
            match *slot {
                Some(handle) if handle.generation == generation => {
                    *slot = None;
                }
                _ => return,
            }
        }

        let previous = self.state();
        if !matches!(previous, ServerState::Starting | ServerState::Running) {
            // Expected exit: the stop path owns the rest of the cleanup.
            return;
        }

        {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            *state = ServerState::Idle;
        }
        let name = {
            let name = self.display_name.read().unwrap_or_else(|e| e.into_inner());
            name.clone()
        };
        log::info!(
            "Instance {} ({}) exited externally (was {})",
            self.panel_id,
            name,
            previous
        );
        let _ = self.events.send(HostEvent {
            panel_id: self.panel_id.clone(),
            reason: HostEventReason::ClosedExternally,
            notice: "host closed externally".to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::broadcast::error::TryRecvError;

    use super::{HostEventReason, ProcessHost};
    use crate::error::ErrorKind;
    use crate::process::ServerState;

    #[tokio::test]
    async fn set_state_emits_a_transition_notice() {
        let host = ProcessHost::new("wf-1-aaaaaa");
        let mut rx = host.subscribe();
        host.set_state(ServerState::Starting);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.notice, "idle -> starting");
        match event.reason {
            HostEventReason::StateChanged { from, to } => {
                assert_eq!(from, ServerState::Idle);
                assert_eq!(to, ServerState::Starting);
            }
            other => panic!("unexpected reason: {:?}", other),
        }
    }

    #[tokio::test]
    async fn setting_the_same_state_is_silent() {
        let host = ProcessHost::new("wf-1-aaaaaa");
        host.set_state(ServerState::Starting);
        let mut rx = host.subscribe();
        host.set_state(ServerState::Starting);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn interrupt_without_a_child_is_no_active_host() {
        let host = ProcessHost::new("wf-1-aaaaaa");
        let err = host.send_interrupt().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoActiveHost);
    }

    #[tokio::test]
    async fn external_exit_forces_idle_and_notifies() {
        let host = ProcessHost::new("wf-1-aaaaaa");
        host.plant_child(4_000_000, 7);
        host.set_state(ServerState::Running);
        let mut rx = host.subscribe();

        host.on_child_exit(7);

        assert_eq!(host.state(), ServerState::Idle);
        assert!(!host.has_child());
        let event = rx.recv().await.unwrap();
        assert!(matches!(event.reason, HostEventReason::ClosedExternally));
        assert_eq!(event.notice, "host closed externally");
    }

    #[tokio::test]
    async fn stale_generation_exit_is_ignored() {
        let host = ProcessHost::new("wf-1-aaaaaa");
        host.plant_child(4_000_000, 8);
        host.set_state(ServerState::Running);

        host.on_child_exit(7);

        assert_eq!(host.state(), ServerState::Running);
        assert!(host.has_child());
    }

    #[tokio::test]
    async fn exit_during_a_deliberate_stop_is_not_external() {
        let host = ProcessHost::new("wf-1-aaaaaa");
        host.plant_child(4_000_000, 3);
        host.set_state(ServerState::Stopping);
        let mut rx = host.subscribe();

        host.on_child_exit(3);

        assert!(!host.has_child());
        assert_eq!(host.state(), ServerState::Stopping);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn dispose_resets_state_to_idle() {
        let host = ProcessHost::new("wf-1-aaaaaa");
        host.set_state(ServerState::Error);
        host.dispose();
        assert_eq!(host.state(), ServerState::Idle);
        assert!(!host.has_child());
    }
}
