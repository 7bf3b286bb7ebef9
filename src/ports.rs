//! Exclusive TCP port allocation for server instances.

use std::collections::HashMap;
use std::net::TcpListener;
use std::sync::RwLock;

use crate::error::{AppError, Result};

/// Bidirectional `panel id <-> port` table.
///
/// Invariant: a port appears in `by_port` iff exactly one panel maps to it in
/// `by_panel`, and each panel holds at most one port.
#[derive(Debug, Default)]
struct AllocTable {
    by_panel: HashMap<String, u16>,
    by_port: HashMap<u16, String>,
}

/// Hands out TCP ports such that no two panels hold the same port.
///
/// Auto-allocation probes candidates with an OS-level bind because this
/// table cannot see ports held by unrelated processes on the machine.
#[derive(Debug)]
pub struct PortAllocator {
    base_port: u16,
    max_attempts: u16,
    table: RwLock<AllocTable>,
}

/// Bind-and-drop probe. Any bind error, including "address in use",
/// means the candidate is unavailable.
fn probe_bind(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}

impl PortAllocator {
    pub fn new(base_port: u16, max_attempts: u16) -> Self {
        Self {
            base_port,
            max_attempts,
            table: RwLock::new(AllocTable::default()),
        }
    }

    /// Allocate a port for `panel_id`, probing candidates from the base port.
    ///
    /// Idempotent: a panel that already holds a port gets the same port back
    /// without a second probe.
    pub fn allocate(&self, panel_id: &str) -> Result<u16> {
        {
            let table = self.table.read().unwrap_or_else(|e| e.into_inner());
            if let Some(&port) = table.by_panel.get(panel_id) {
                return Ok(port);
            }
        }

        for offset in 0..self.max_attempts {
            let Some(candidate) = self.base_port.checked_add(offset) else {
                break;
            };

            {
                let table = self.table.read().unwrap_or_else(|e| e.into_inner());
                if table.by_port.contains_key(&candidate) {
                    continue;
                }
            }

            if !probe_bind(candidate) {
                continue;
            }

            let mut table = self.table.write().unwrap_or_else(|e| e.into_inner());
            if let Some(&port) = table.by_panel.get(panel_id) {
                return Ok(port);
            }
            if table.by_port.contains_key(&candidate) {
                continue;
            }
            table.by_panel.insert(panel_id.to_string(), candidate);
            table.by_port.insert(candidate, panel_id.to_string());
            log::info!("Allocated port {} for panel {}", candidate, panel_id);
            return Ok(candidate);
        }

        Err(AppError::port_exhaustion(self.base_port, self.max_attempts))
    }

    /// Pin an explicitly configured port for `panel_id` without a bind probe.
    ///
    /// A user-specified port is never silently reassigned: if another panel
    /// holds it the reservation fails and both allocations stay unchanged.
    pub fn reserve(&self, panel_id: &str, port: u16) -> Result<()> {
        let mut table = self.table.write().unwrap_or_else(|e| e.into_inner());

        if let Some(owner) = table.by_port.get(&port) {
            if owner == panel_id {
                return Ok(());
            }
            return Err(AppError::port_conflict(port, owner));
        }

        if let Some(previous) = table.by_panel.remove(panel_id) {
            table.by_port.remove(&previous);
            log::info!(
                "Panel {} released port {} for pinned port {}",
                panel_id,
                previous,
                port
            );
        }

        table.by_panel.insert(panel_id.to_string(), port);
        table.by_port.insert(port, panel_id.to_string());
        Ok(())
    }

    /// Remove the mapping for `panel_id` and free its port for reuse.
    /// No-op if the panel holds nothing.
    pub fn release(&self, panel_id: &str) -> Option<u16> {
        let mut table = self.table.write().unwrap_or_else(|e| e.into_inner());
        let port = table.by_panel.remove(panel_id)?;
        table.by_port.remove(&port);
        log::info!("Released port {} for panel {}", port, panel_id);
        Some(port)
    }

    /// Clear all allocations. Used for whole-process teardown.
    pub fn reset(&self) {
        let mut table = self.table.write().unwrap_or_else(|e| e.into_inner());
        table.by_panel.clear();
        table.by_port.clear();
    }

    pub fn port_for(&self, panel_id: &str) -> Option<u16> {
        let table = self.table.read().unwrap_or_else(|e| e.into_inner());
        table.by_panel.get(panel_id).copied()
    }

    pub fn is_port_used(&self, port: u16) -> bool {
        let table = self.table.read().unwrap_or_else(|e| e.into_inner());
        table.by_port.contains_key(&port)
    }

    /// Snapshot of the full `panel id -> port` mapping.
    pub fn snapshot(&self) -> HashMap<String, u16> {
        let table = self.table.read().unwrap_or_else(|e| e.into_inner());
        table.by_panel.clone()
    }
}
