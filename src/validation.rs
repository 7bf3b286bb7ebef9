//! Input validation for panel ids and workflow config files.

use std::fs;
use std::path::Path;

use crate::error::{AppError, Result};

/// Check that a panel id has the generated `wf-<millis>-<6 alnum>` shape.
pub fn validate_panel_id(panel_id: &str) -> Result<()> {
    let mut parts = panel_id.splitn(3, '-');
    let prefix = parts.next().unwrap_or_default();
    let stamp = parts.next().unwrap_or_default();
    let suffix = parts.next().unwrap_or_default();

    let is_valid = prefix == "wf"
        && !stamp.is_empty()
        && stamp.chars().all(|c| c.is_ascii_digit())
        && suffix.len() == 6
        && suffix.chars().all(|c| c.is_ascii_alphanumeric());

    if !is_valid {
        return Err(AppError::other(format!("Invalid panel id: {}", panel_id)));
    }
    Ok(())
}

/// Validate a workflow config file: it must exist and parse as JSON.
///
/// The document's schema is the runner's concern; only syntax is checked here.
pub fn validate_workflow_config(path: &Path) -> Result<()> {
    if !path.exists() {
        return Err(AppError::config_not_found(path));
    }

    let content = fs::read_to_string(path)
        .map_err(|e| AppError::io(format!("Failed to read {}: {}", path.display(), e)))?;
    let content = content.trim_start_matches('\u{feff}');

    serde_json::from_str::<serde_json::Value>(content)
        .map(|_| ())
        .map_err(|e| AppError::invalid_config_json(path, e.to_string()))
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::{validate_panel_id, validate_workflow_config};
    use crate::error::ErrorKind;

    #[test]
    fn accepts_generated_panel_ids() {
        assert!(validate_panel_id("wf-1700000000000-a1b2c3").is_ok());
    }

    #[test]
    fn rejects_malformed_panel_ids() {
        for bad in ["", "wf", "wf-abc-a1b2c3", "wf-1700-short", "panel-1700-a1b2c3"] {
            assert!(validate_panel_id(bad).is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn missing_config_is_config_not_found() {
        let err = validate_workflow_config(std::path::Path::new("/nonexistent/workflow.json"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigNotFound);
    }

    #[test]
    fn invalid_json_is_invalid_config_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        let err = validate_workflow_config(file.path()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfigJson);
    }

    #[test]
    fn valid_json_passes_even_with_bom() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "\u{feff}{{\"nodes\": []}}").unwrap();
        assert!(validate_workflow_config(file.path()).is_ok());
    }
}
