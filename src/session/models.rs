//! Session data models.

use serde::{Deserialize, Serialize};

/// Session status.
///
/// Statuses advance along `pending -> creating -> ready <-> executing ->
/// stopping -> stopped`; any state may fall directly to `error`. `stopped`
/// and `error` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Session record exists; no work scheduled yet.
    Pending,
    /// Sandbox container is being created.
    Creating,
    /// Sandbox is up and idle.
    Ready,
    /// An execution is in flight.
    Executing,
    /// Sandbox is being torn down.
    Stopping,
    /// Sandbox is gone; session record lingers until its TTL expires.
    Stopped,
    /// Session failed; see `error` on the record.
    Error,
}

impl SessionStatus {
    /// Whether no further transitions out of this status are allowed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Stopped | SessionStatus::Error)
    }

    /// Statuses during which the session owns a live container.
    pub fn has_container(&self) -> bool {
        matches!(
            self,
            SessionStatus::Ready | SessionStatus::Executing | SessionStatus::Stopping
        )
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Pending => write!(f, "pending"),
            SessionStatus::Creating => write!(f, "creating"),
            SessionStatus::Ready => write!(f, "ready"),
            SessionStatus::Executing => write!(f, "executing"),
            SessionStatus::Stopping => write!(f, "stopping"),
            SessionStatus::Stopped => write!(f, "stopped"),
            SessionStatus::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(SessionStatus::Pending),
            "creating" => Ok(SessionStatus::Creating),
            "ready" => Ok(SessionStatus::Ready),
            "executing" => Ok(SessionStatus::Executing),
            "stopping" => Ok(SessionStatus::Stopping),
            "stopped" => Ok(SessionStatus::Stopped),
            "error" => Ok(SessionStatus::Error),
            _ => Err(format!("unknown session status: {}", s)),
        }
    }
}

/// A sandbox session record as held by the state store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Unique session ID.
    pub id: String,
    /// Name of the execution environment.
    pub environment: String,
    /// Current session status.
    pub status: SessionStatus,
    /// Container ID, present only while a sandbox is alive.
    pub container_id: Option<String>,
    /// When the session was created (RFC 3339).
    pub created_at: String,
    /// When code last ran in this session (RFC 3339).
    pub last_execution: Option<String>,
    /// Failure cause when the status is `error`.
    pub error: Option<String>,
}

/// One execution request against a sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Source code to run.
    pub code: String,
    /// Filename to write the source as; the environment default when unset.
    #[serde(default)]
    pub filename: Option<String>,
    /// Bytes piped to the program's standard input.
    #[serde(default)]
    pub stdin: Option<String>,
}

impl ExecutionRequest {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            filename: None,
            stdin: None,
        }
    }
}

/// Result of a single execution round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Captured standard output, lossily decoded as UTF-8.
    pub stdout: String,
    /// Captured standard error, lossily decoded as UTF-8.
    pub stderr: String,
    /// Process exit code; 124 marks a timeout kill, -1 a sandbox failure.
    pub exit_code: i64,
    /// Wall-clock duration in seconds, millisecond precision.
    pub execution_time: f64,
    /// When the execution finished (RFC 3339).
    pub timestamp: String,
}

impl ExecutionResult {
    /// API status label: `completed` for a clean exit, `error` otherwise.
    pub fn status_label(&self) -> &'static str {
        if self.exit_code == 0 {
            "completed"
        } else {
            "error"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            SessionStatus::Pending,
            SessionStatus::Creating,
            SessionStatus::Ready,
            SessionStatus::Executing,
            SessionStatus::Stopping,
            SessionStatus::Stopped,
            SessionStatus::Error,
        ] {
            let parsed = SessionStatus::from_str(&status.to_string()).unwrap();
            assert_eq!(parsed, status);
        }

        assert!(SessionStatus::from_str("rebooting").is_err());
    }

    #[test]
    fn terminal_and_container_predicates() {
        assert!(SessionStatus::Stopped.is_terminal());
        assert!(SessionStatus::Error.is_terminal());
        assert!(!SessionStatus::Ready.is_terminal());

        assert!(SessionStatus::Ready.has_container());
        assert!(SessionStatus::Executing.has_container());
        assert!(SessionStatus::Stopping.has_container());
        assert!(!SessionStatus::Pending.has_container());
        assert!(!SessionStatus::Stopped.has_container());
    }

    #[test]
    fn result_status_label_tracks_exit_code() {
        let mut result = ExecutionResult {
            stdout: "5\n".to_string(),
            stderr: String::new(),
            exit_code: 0,
            execution_time: 0.012,
            timestamp: "2026-01-01T00:00:00Z".to_string(),
        };
        assert_eq!(result.status_label(), "completed");

        result.exit_code = 1;
        assert_eq!(result.status_label(), "error");
    }
}
