use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Lifecycle of the companion service as seen by the supervisor.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    /// A liveness probe is in flight.
    Checking,
    /// The service was launched and is expected to answer soon.
    Starting,
    /// The service answers probes.
    Running,
    /// The service was stopped on request and will not be relaunched until commanded.
    Stopped,
    /// A terminal failure; cleared by `check` or `start`.
    Error,
}

impl LifecycleState {
    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Checking => "checking",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Stopped => "stopped",
            LifecycleState::Error => "error",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Category of an `Error` state, so the UI can render targeted guidance.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// No candidate directory holds the entry point.
    NotFound,
    /// A candidate directory could not be inspected.
    Resolve,
    /// The interpreter could not be started.
    Spawn,
    /// Spawned, but the confirming probe failed.
    Unreachable,
    /// An owned process exited, or a running service stopped answering.
    UnexpectedExit,
}

impl ErrorKind {
    /// Prefix every message of this kind starts with.
    pub fn headline(self) -> &'static str {
        match self {
            ErrorKind::NotFound => "Companion service not found",
            ErrorKind::Resolve => "Could not search for the companion service",
            ErrorKind::Spawn => "Failed to launch the companion service",
            ErrorKind::Unreachable => "Companion service started but not responding",
            ErrorKind::UnexpectedExit => "Companion service exited unexpectedly",
        }
    }

    pub fn message(self, detail: impl fmt::Display) -> String {
        format!("{}: {detail}", self.headline())
    }
}

/// Immutable record of one state change.
///
/// Serializes to the payload consumed by the presentation layer:
/// `{"status": "...", "message": "...", "timestamp": <epoch millis>}` plus
/// `kind` for errors.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct StatusEvent {
    #[serde(rename = "status")]
    state: LifecycleState,
    #[serde(default)]
    message: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    kind: Option<ErrorKind>,
}

impl StatusEvent {
    pub fn new(state: LifecycleState, message: Option<String>) -> Self {
        Self {
            state,
            message: message.unwrap_or_default(),
            timestamp: Utc::now(),
            kind: None,
        }
    }

    pub fn error(kind: ErrorKind, message: String) -> Self {
        Self {
            kind: Some(kind),
            ..Self::new(LifecycleState::Error, Some(message))
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn message(&self) -> Option<&str> {
        if self.message.is_empty() {
            None
        } else {
            Some(&self.message)
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn kind(&self) -> Option<ErrorKind> {
        self.kind
    }

    /// Same state, message, and kind; timestamps are ignored.
    pub fn same_transition(&self, other: &StatusEvent) -> bool {
        self.state == other.state && self.message == other.message && self.kind == other.kind
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Snapshot written to `status.toml` for out-of-process readers.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StatusFile {
    /// Supervisor version (set from Cargo.toml at compile time).
    pub version: String,
    pub state: LifecycleState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    /// RFC 3339 time of the transition.
    pub updated_at: String,
}

impl From<&StatusEvent> for StatusFile {
    fn from(event: &StatusEvent) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            state: event.state(),
            message: event.message().map(str::to_string),
            error_kind: event.kind(),
            updated_at: event.timestamp().to_rfc3339(),
        }
    }
}

/// Serializes `event` to TOML and writes it to `path`.
/// Creates the parent directory if it does not exist.
/// Logs errors rather than panicking; a status write failure never stops supervision.
pub fn write_status(path: &Path, event: &StatusEvent) {
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            tracing::error!("Failed to create directory {}: {e}", parent.display());
            return;
        }
    }
    match toml::to_string_pretty(&StatusFile::from(event)) {
        Ok(content) => {
            if let Err(e) = std::fs::write(path, content) {
                tracing::error!("Failed to write status file: {e}");
            }
        }
        Err(e) => tracing::error!("Failed to serialize status: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── StatusEvent ───────────────────────────────────────────────────────────

    #[test]
    fn empty_message_reads_as_none() {
        let e = StatusEvent::new(LifecycleState::Checking, None);
        assert!(e.message().is_none());
        assert!(e.kind().is_none());
    }

    #[test]
    fn error_event_carries_kind_and_state() {
        let e = StatusEvent::error(ErrorKind::Spawn, "boom".to_string());
        assert_eq!(e.state(), LifecycleState::Error);
        assert_eq!(e.kind(), Some(ErrorKind::Spawn));
        assert_eq!(e.message(), Some("boom"));
    }

    #[test]
    fn same_transition_ignores_timestamp() {
        let a = StatusEvent::new(LifecycleState::Running, None);
        let mut b = a.clone();
        b.timestamp = a.timestamp + chrono::Duration::seconds(5);
        assert!(a.same_transition(&b));
        assert!(!a.same_transition(&StatusEvent::new(LifecycleState::Stopped, None)));
    }

    #[test]
    fn error_kind_messages_are_distinct() {
        let kinds = [
            ErrorKind::NotFound,
            ErrorKind::Resolve,
            ErrorKind::Spawn,
            ErrorKind::Unreachable,
            ErrorKind::UnexpectedExit,
        ];
        for (i, a) in kinds.iter().enumerate() {
            for b in &kinds[i + 1..] {
                assert_ne!(a.headline(), b.headline());
            }
        }
        assert!(ErrorKind::Unreachable
            .message("x")
            .contains("started but not responding"));
    }

    // ── payload ───────────────────────────────────────────────────────────────

    #[test]
    fn payload_uses_lowercase_status_and_epoch_millis() {
        let e = StatusEvent::new(LifecycleState::Starting, Some("launching".to_string()));
        let json: serde_json::Value = serde_json::from_str(&e.to_json().unwrap()).unwrap();
        assert_eq!(json["status"], "starting");
        assert_eq!(json["message"], "launching");
        assert_eq!(json["timestamp"], e.timestamp().timestamp_millis());
        assert!(json.get("kind").is_none());
    }

    #[test]
    fn payload_message_is_empty_string_when_absent() {
        let e = StatusEvent::new(LifecycleState::Running, None);
        let json: serde_json::Value = serde_json::from_str(&e.to_json().unwrap()).unwrap();
        assert_eq!(json["message"], "");
    }

    #[test]
    fn payload_includes_error_kind() {
        let e = StatusEvent::error(ErrorKind::NotFound, "install it".to_string());
        let json: serde_json::Value = serde_json::from_str(&e.to_json().unwrap()).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["kind"], "not_found");
    }

    // ── write_status ──────────────────────────────────────────────────────────

    #[test]
    fn write_status_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("dir").join("status.toml");
        write_status(&path, &StatusEvent::new(LifecycleState::Checking, None));
        assert!(path.exists());
    }

    #[test]
    fn write_status_content_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.toml");
        let event = StatusEvent::error(ErrorKind::Unreachable, "no answer".to_string());

        write_status(&path, &event);

        let content = std::fs::read_to_string(&path).unwrap();
        let parsed: StatusFile = toml::from_str(&content).unwrap();
        assert_eq!(parsed.state, LifecycleState::Error);
        assert_eq!(parsed.message.as_deref(), Some("no answer"));
        assert_eq!(parsed.error_kind, Some(ErrorKind::Unreachable));
        assert_eq!(parsed.version, env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn write_status_omits_none_optional_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.toml");
        write_status(&path, &StatusEvent::new(LifecycleState::Running, None));

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("state = \"running\""));
        assert!(!content.contains("message"));
        assert!(!content.contains("error_kind"));
    }
}
