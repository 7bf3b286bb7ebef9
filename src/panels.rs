//! Panel identity registry.
//!
//! Generates the panel ids every other component keys on and tracks one
//! record per open editor panel.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{AppError, Result};

/// One open editor panel.
#[derive(Debug, Clone, Serialize)]
pub struct PanelRecord {
    pub id: String,
    /// Workflow file shown in this panel, if any.
    pub config_path: Option<PathBuf>,
    /// Opaque tag identifying the UI view hosting this panel.
    pub view_tag: Option<String>,
    pub opened_at: DateTime<Utc>,
}

/// Keyed registry of open panels. Other components receive panel ids as
/// keys but never construct them.
#[derive(Debug, Default)]
pub struct PanelRegistry {
    panels: RwLock<HashMap<String, PanelRecord>>,
    last_stamp_ms: AtomicU64,
}

impl PanelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Produce a fresh globally-unique panel id: `wf-<millis>-<6-char-random>`.
    ///
    /// The timestamp component is forced monotonic so ids generated within
    /// the same millisecond still sort in creation order.
    pub fn generate_id(&self) -> String {
        let now_ms = Utc::now().timestamp_millis().max(0) as u64;
        let stamp = self
            .last_stamp_ms
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now_ms.max(last + 1))
            })
            .unwrap_or(now_ms);

        let suffix: String = uuid::Uuid::new_v4()
            .simple()
            .to_string()
            .chars()
            .take(6)
            .collect();
        format!("wf-{}-{}", stamp, suffix)
    }

    /// Track a panel. Duplicate ids are a hard error, never a silent overwrite.
    pub fn register(&self, record: PanelRecord) -> Result<()> {
        let mut panels = self.panels.write().unwrap_or_else(|e| e.into_inner());
        if panels.contains_key(&record.id) {
            return Err(AppError::duplicate_registration(&record.id));
        }
        log::info!("Registered panel {}", record.id);
        panels.insert(record.id.clone(), record);
        Ok(())
    }

    /// Remove a panel record. No-op if the id is unknown.
    pub fn unregister(&self, panel_id: &str) -> Option<PanelRecord> {
        let mut panels = self.panels.write().unwrap_or_else(|e| e.into_inner());
        let removed = panels.remove(panel_id);
        if removed.is_some() {
            log::info!("Unregistered panel {}", panel_id);
        }
        removed
    }

    pub fn get(&self, panel_id: &str) -> Option<PanelRecord> {
        let panels = self.panels.read().unwrap_or_else(|e| e.into_inner());
        panels.get(panel_id).cloned()
    }

    /// First panel showing the given workflow file.
    pub fn find_by_config_path(&self, path: &Path) -> Option<PanelRecord> {
        let panels = self.panels.read().unwrap_or_else(|e| e.into_inner());
        panels
            .values()
            .find(|record| record.config_path.as_deref() == Some(path))
            .cloned()
    }

    pub fn find_by_view_tag(&self, view_tag: &str) -> Option<PanelRecord> {
        let panels = self.panels.read().unwrap_or_else(|e| e.into_inner());
        panels
            .values()
            .find(|record| record.view_tag.as_deref() == Some(view_tag))
            .cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        let panels = self.panels.read().unwrap_or_else(|e| e.into_inner());
        panels.keys().cloned().collect()
    }

    pub fn count(&self) -> usize {
        let panels = self.panels.read().unwrap_or_else(|e| e.into_inner());
        panels.len()
    }

    /// Drop every tracked panel. Used at whole-extension shutdown, after
    /// the server registry has stopped its instances.
    pub fn dispose_all(&self) {
        let mut panels = self.panels.write().unwrap_or_else(|e| e.into_inner());
        let count = panels.len();
        panels.clear();
        if count > 0 {
            log::info!("Disposed {} panel record(s)", count);
        }
    }
}
