//! Application error types.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use serde::Serialize;

/// Application error that can be serialized for the editor UI.
#[derive(Debug)]
pub struct AppError {
    payload: HashMap<String, String>,
    kind: ErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Workflow config file does not exist
    ConfigNotFound,
    /// Workflow config file is not valid JSON
    InvalidConfigJson,
    /// Instance is currently starting or running
    AlreadyRunning,
    /// Instance is not running
    NotRunning,
    /// Restart requested with no config path on record
    NoActiveInstance,
    /// Operation requires a hosted process but none exists
    NoActiveHost,
    /// Port probe attempts exhausted
    PortExhaustion,
    /// Reserved port is held by another panel
    PortConflict,
    /// Panel id or launcher id reused
    DuplicateRegistration,
    /// Launcher settings error
    Config,
    /// File system error
    Io,
    /// Network error
    Network,
    /// Process error
    Process,
    /// Instance startup timed out
    StartupTimeout,
    /// General error
    Other,
}

impl ErrorKind {
    pub fn code(&self) -> u32 {
        match self {
            Self::ConfigNotFound => 1001,
            Self::InvalidConfigJson => 1002,
            Self::AlreadyRunning => 1003,
            Self::NotRunning => 1004,
            Self::NoActiveInstance => 1005,
            Self::NoActiveHost => 1006,
            Self::PortExhaustion => 2001,
            Self::PortConflict => 2002,
            Self::DuplicateRegistration => 2003,
            Self::Config => 3001,
            Self::Io => 3002,
            Self::Network => 3003,
            Self::Process => 3004,
            Self::StartupTimeout => 3005,
            Self::Other => 9999,
        }
    }
}

impl AppError {
    pub fn new(kind: ErrorKind, payload: HashMap<String, String>) -> Self {
        Self { payload, kind }
    }

    /// Create an error with a single "detail" key from a non-empty string,
    /// or an empty payload if the string is empty.
    fn with_detail(kind: ErrorKind, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        let payload = if detail.is_empty() {
            HashMap::new()
        } else {
            HashMap::from([("detail".to_string(), detail)])
        };
        Self::new(kind, payload)
    }

    pub fn config_not_found(path: &Path) -> Self {
        Self::new(
            ErrorKind::ConfigNotFound,
            HashMap::from([("path".to_string(), path.display().to_string())]),
        )
    }

    pub fn invalid_config_json(path: &Path, detail: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::InvalidConfigJson,
            HashMap::from([
                ("path".to_string(), path.display().to_string()),
                ("detail".to_string(), detail.into()),
            ]),
        )
    }

    pub fn already_running(panel_id: &str) -> Self {
        Self::new(
            ErrorKind::AlreadyRunning,
            HashMap::from([("panel".to_string(), panel_id.to_string())]),
        )
    }

    pub fn not_running(panel_id: &str) -> Self {
        Self::new(
            ErrorKind::NotRunning,
            HashMap::from([("panel".to_string(), panel_id.to_string())]),
        )
    }

    pub fn no_active_instance(panel_id: &str) -> Self {
        Self::new(
            ErrorKind::NoActiveInstance,
            HashMap::from([("panel".to_string(), panel_id.to_string())]),
        )
    }

    pub fn no_active_host(panel_id: &str) -> Self {
        Self::new(
            ErrorKind::NoActiveHost,
            HashMap::from([("panel".to_string(), panel_id.to_string())]),
        )
    }

    pub fn port_exhaustion(base_port: u16, attempts: u16) -> Self {
        Self::new(
            ErrorKind::PortExhaustion,
            HashMap::from([
                ("base_port".to_string(), base_port.to_string()),
                ("attempts".to_string(), attempts.to_string()),
            ]),
        )
    }

    pub fn port_conflict(port: u16, owner: &str) -> Self {
        Self::new(
            ErrorKind::PortConflict,
            HashMap::from([
                ("port".to_string(), port.to_string()),
                ("owner".to_string(), owner.to_string()),
            ]),
        )
    }

    pub fn duplicate_registration(id: &str) -> Self {
        Self::new(
            ErrorKind::DuplicateRegistration,
            HashMap::from([("id".to_string(), id.to_string())]),
        )
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Config, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Io, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Network, message)
    }

    pub fn process(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Process, message)
    }

    pub fn startup_timeout(panel_id: &str, port: u16) -> Self {
        Self::new(
            ErrorKind::StartupTimeout,
            HashMap::from([
                ("panel".to_string(), panel_id.to_string()),
                ("port".to_string(), port.to_string()),
            ]),
        )
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Other, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn payload(&self) -> &HashMap<String, String> {
        &self.payload
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.payload.is_empty() {
            write!(f, "{:?}", self.kind)
        } else {
            let mut pairs: Vec<String> = self
                .payload
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            pairs.sort();
            write!(f, "{:?}: {}", self.kind, pairs.join(", "))
        }
    }
}

impl std::error::Error for AppError {}

impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct as _;
        let mut s = serializer.serialize_struct("AppError", 2)?;
        s.serialize_field("code", &self.kind.code())?;
        s.serialize_field("payload", &self.payload)?;
        s.end()
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::config(err.to_string())
    }
}

impl From<toml::ser::Error> for AppError {
    fn from(err: toml::ser::Error) -> Self {
        Self::config(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        Self::network(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::config(err.to_string())
    }
}

/// Convenient Result type alias.
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::{AppError, ErrorKind};

    #[test]
    fn display_names_the_offending_resource() {
        let err = AppError::port_conflict(3001, "wf-1700000000000-a1b2c3");
        let text = err.to_string();
        assert!(text.contains("PortConflict"));
        assert!(text.contains("port=3001"));
        assert!(text.contains("owner=wf-1700000000000-a1b2c3"));
    }

    #[test]
    fn display_without_payload_is_just_the_kind() {
        let err = AppError::other("");
        assert_eq!(err.to_string(), "Other");
        assert_eq!(err.kind(), ErrorKind::Other);
    }

    #[test]
    fn serializes_code_and_payload() {
        let err = AppError::duplicate_registration("wf-1-abcdef");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["code"], 2003);
        assert_eq!(json["payload"]["id"], "wf-1-abcdef");
    }
}
