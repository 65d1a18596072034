//! Session state store.
//!
//! The one source of truth for which sessions exist and what they are
//! doing. Keyed layout: a hash per session at `session:<id>`, the last
//! execution result at `session:<id>:result` (own TTL), and the
//! `active_sessions` set as an index over live ids. Every mutation
//! refreshes the sliding TTL.

mod memory;
mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use thiserror::Error;

use crate::session::models::{ExecutionResult, SessionRecord, SessionStatus};

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised by state store backends.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store is unreachable or rejected the operation.
    #[error("state store backend error: {0}")]
    Backend(String),

    /// A stored value could not be decoded.
    #[error("corrupt store record: {0}")]
    Corrupt(String),

    /// JSON encoding of a stored value failed.
    #[error("serializing stored value: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Key of the active session index.
pub(crate) const ACTIVE_SESSIONS_KEY: &str = "active_sessions";

pub(crate) fn session_key(id: &str) -> String {
    format!("session:{}", id)
}

pub(crate) fn result_key(id: &str) -> String {
    format!("session:{}:result", id)
}

// Hash field names of a session record.
pub(crate) const FIELD_SESSION_ID: &str = "session_id";
pub(crate) const FIELD_ENVIRONMENT: &str = "environment";
pub(crate) const FIELD_STATUS: &str = "status";
pub(crate) const FIELD_CONTAINER_ID: &str = "container_id";
pub(crate) const FIELD_CREATED_AT: &str = "created_at";
pub(crate) const FIELD_LAST_EXECUTION: &str = "last_execution";
pub(crate) const FIELD_ERROR: &str = "error";

/// Partial update of a session record.
///
/// Unset and empty values are dropped rather than written, so a replayed
/// task can never blank out a populated field.
#[derive(Debug, Clone, Default)]
pub struct SessionUpdate {
    pub status: Option<SessionStatus>,
    pub container_id: Option<String>,
    pub last_execution: Option<String>,
    pub error: Option<String>,
}

impl SessionUpdate {
    pub fn status(status: SessionStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn container_id(mut self, container_id: impl Into<String>) -> Self {
        self.container_id = Some(container_id.into());
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Field/value pairs to write, with empty values filtered out.
    pub(crate) fn fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = Vec::new();
        if let Some(status) = self.status {
            fields.push((FIELD_STATUS, status.to_string()));
        }
        if let Some(ref container_id) = self.container_id {
            if !container_id.is_empty() {
                fields.push((FIELD_CONTAINER_ID, container_id.clone()));
            }
        }
        if let Some(ref last_execution) = self.last_execution {
            if !last_execution.is_empty() {
                fields.push((FIELD_LAST_EXECUTION, last_execution.clone()));
            }
        }
        if let Some(ref error) = self.error {
            if !error.is_empty() {
                fields.push((FIELD_ERROR, error.clone()));
            }
        }
        fields
    }
}

/// Decode a session record from its hash representation.
pub(crate) fn record_from_fields(
    id: &str,
    mut fields: HashMap<String, String>,
) -> StoreResult<SessionRecord> {
    let status_text = fields
        .remove(FIELD_STATUS)
        .ok_or_else(|| StoreError::Corrupt(format!("session {} has no status field", id)))?;
    let status: SessionStatus = status_text.parse().map_err(StoreError::Corrupt)?;

    let non_empty = |value: Option<String>| value.filter(|v| !v.is_empty());

    Ok(SessionRecord {
        id: fields
            .remove(FIELD_SESSION_ID)
            .unwrap_or_else(|| id.to_string()),
        environment: fields.remove(FIELD_ENVIRONMENT).unwrap_or_default(),
        status,
        container_id: non_empty(fields.remove(FIELD_CONTAINER_ID)),
        created_at: fields.remove(FIELD_CREATED_AT).unwrap_or_default(),
        last_execution: non_empty(fields.remove(FIELD_LAST_EXECUTION)),
        error: non_empty(fields.remove(FIELD_ERROR)),
    })
}

/// Encode a fresh session record as hash fields.
pub(crate) fn record_to_fields(record: &SessionRecord) -> Vec<(&'static str, String)> {
    vec![
        (FIELD_SESSION_ID, record.id.clone()),
        (FIELD_ENVIRONMENT, record.environment.clone()),
        (FIELD_STATUS, record.status.to_string()),
        (
            FIELD_CONTAINER_ID,
            record.container_id.clone().unwrap_or_default(),
        ),
        (FIELD_CREATED_AT, record.created_at.clone()),
        (
            FIELD_LAST_EXECUTION,
            record.last_execution.clone().unwrap_or_default(),
        ),
        (FIELD_ERROR, record.error.clone().unwrap_or_default()),
    ]
}

/// Durable, TTL-backed store for session records.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Create a pending session record and index it as active.
    async fn create(&self, id: &str, environment: &str) -> StoreResult<()>;

    /// Fetch a session record.
    async fn get(&self, id: &str) -> StoreResult<Option<SessionRecord>>;

    /// Whether a session record exists (and has not expired).
    async fn exists(&self, id: &str) -> StoreResult<bool>;

    /// Apply a partial update and refresh the TTL.
    async fn update(&self, id: &str, update: SessionUpdate) -> StoreResult<()>;

    /// Unconditionally set the session status.
    async fn set_status(&self, id: &str, status: SessionStatus) -> StoreResult<()>;

    /// Compare-and-set status transition.
    ///
    /// Moves the session to `to` only when its current status is one of
    /// `from`; returns whether the transition fired. A missing session
    /// reports `false`.
    async fn transition(
        &self,
        id: &str,
        from: &[SessionStatus],
        to: SessionStatus,
    ) -> StoreResult<bool>;

    /// Drop the container handle from a record (terminal states own none).
    async fn clear_container(&self, id: &str) -> StoreResult<()>;

    /// Delete a session record and de-index it.
    async fn delete(&self, id: &str) -> StoreResult<()>;

    /// Store the last execution result and touch `last_execution`.
    async fn save_result(&self, id: &str, result: &ExecutionResult) -> StoreResult<()>;

    /// Fetch the last execution result, if any.
    async fn last_result(&self, id: &str) -> StoreResult<Option<ExecutionResult>>;

    /// Ids currently indexed as active. Membership is a hint; records may
    /// have expired since they were indexed.
    async fn active_sessions(&self) -> StoreResult<HashSet<String>>;

    /// Drop active-set entries whose records have expired; returns them.
    async fn reconcile_active_set(&self) -> StoreResult<Vec<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_drops_empty_values() {
        let update = SessionUpdate::status(SessionStatus::Ready)
            .container_id("")
            .error("");
        let fields = update.fields();
        assert_eq!(fields, vec![(FIELD_STATUS, "ready".to_string())]);
    }

    #[test]
    fn record_round_trips_through_fields() {
        let record = SessionRecord {
            id: "abc".to_string(),
            environment: "python".to_string(),
            status: SessionStatus::Ready,
            container_id: Some("deadbeef".to_string()),
            created_at: "2026-01-01T00:00:00Z".to_string(),
            last_execution: None,
            error: None,
        };

        let fields: HashMap<String, String> = record_to_fields(&record)
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        let decoded = record_from_fields("abc", fields).unwrap();

        assert_eq!(decoded.id, record.id);
        assert_eq!(decoded.environment, record.environment);
        assert_eq!(decoded.status, record.status);
        assert_eq!(decoded.container_id, record.container_id);
        assert_eq!(decoded.created_at, record.created_at);
        assert_eq!(decoded.last_execution, None);
        assert_eq!(decoded.error, None);
    }

    #[test]
    fn record_without_status_is_corrupt() {
        let fields: HashMap<String, String> =
            [(FIELD_SESSION_ID.to_string(), "abc".to_string())].into();
        assert!(matches!(
            record_from_fields("abc", fields),
            Err(StoreError::Corrupt(_))
        ));
    }
}
