//! In-memory state store backend.
//!
//! Mirrors the Redis backend's semantics, including sliding TTLs, for
//! tests and single-process development runs.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::Instant;

use crate::session::models::{ExecutionResult, SessionRecord, SessionStatus};

use super::{SessionStore, SessionUpdate, StoreResult};

struct Entry {
    record: SessionRecord,
    expires_at: Instant,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, Entry>,
    results: HashMap<String, (ExecutionResult, Instant)>,
    active: HashSet<String>,
}

/// Mutex-guarded map store with real TTL deadlines.
pub struct MemoryStore {
    ttl: Duration,
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // Lock poisoning only happens after a panic in a holder; tests are
        // the only environment where that occurs.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn live_record<'a>(
        inner: &'a mut Inner,
        id: &str,
        now: Instant,
    ) -> Option<&'a mut Entry> {
        if let Some(entry) = inner.sessions.get(id) {
            if entry.expires_at <= now {
                inner.sessions.remove(id);
                return None;
            }
        }
        inner.sessions.get_mut(id)
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn create(&self, id: &str, environment: &str) -> StoreResult<()> {
        let record = SessionRecord {
            id: id.to_string(),
            environment: environment.to_string(),
            status: SessionStatus::Pending,
            container_id: None,
            created_at: Utc::now().to_rfc3339(),
            last_execution: None,
            error: None,
        };

        let mut inner = self.lock();
        inner.sessions.insert(
            id.to_string(),
            Entry {
                record,
                expires_at: Instant::now() + self.ttl,
            },
        );
        inner.active.insert(id.to_string());
        Ok(())
    }

    async fn get(&self, id: &str) -> StoreResult<Option<SessionRecord>> {
        let mut inner = self.lock();
        let now = Instant::now();
        Ok(Self::live_record(&mut inner, id, now).map(|entry| entry.record.clone()))
    }

    async fn exists(&self, id: &str) -> StoreResult<bool> {
        Ok(self.get(id).await?.is_some())
    }

    async fn update(&self, id: &str, update: SessionUpdate) -> StoreResult<()> {
        let mut inner = self.lock();
        let now = Instant::now();
        let ttl = self.ttl;
        if let Some(entry) = Self::live_record(&mut inner, id, now) {
            for (field, value) in update.fields() {
                match field {
                    super::FIELD_STATUS => {
                        if let Ok(status) = value.parse() {
                            entry.record.status = status;
                        }
                    }
                    super::FIELD_CONTAINER_ID => entry.record.container_id = Some(value),
                    super::FIELD_LAST_EXECUTION => entry.record.last_execution = Some(value),
                    super::FIELD_ERROR => entry.record.error = Some(value),
                    _ => {}
                }
            }
            entry.expires_at = now + ttl;
        }
        Ok(())
    }

    async fn set_status(&self, id: &str, status: SessionStatus) -> StoreResult<()> {
        self.update(id, SessionUpdate::status(status)).await
    }

    async fn transition(
        &self,
        id: &str,
        from: &[SessionStatus],
        to: SessionStatus,
    ) -> StoreResult<bool> {
        let mut inner = self.lock();
        let now = Instant::now();
        let ttl = self.ttl;
        match Self::live_record(&mut inner, id, now) {
            Some(entry) if from.contains(&entry.record.status) => {
                entry.record.status = to;
                entry.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn clear_container(&self, id: &str) -> StoreResult<()> {
        let mut inner = self.lock();
        let now = Instant::now();
        let ttl = self.ttl;
        if let Some(entry) = Self::live_record(&mut inner, id, now) {
            entry.record.container_id = None;
            entry.expires_at = now + ttl;
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> StoreResult<()> {
        let mut inner = self.lock();
        inner.sessions.remove(id);
        inner.results.remove(id);
        inner.active.remove(id);
        Ok(())
    }

    async fn save_result(&self, id: &str, result: &ExecutionResult) -> StoreResult<()> {
        let now_text = Utc::now().to_rfc3339();
        {
            let mut inner = self.lock();
            inner
                .results
                .insert(id.to_string(), (result.clone(), Instant::now() + self.ttl));
        }
        self.update(
            id,
            SessionUpdate {
                last_execution: Some(now_text),
                ..Default::default()
            },
        )
        .await
    }

    async fn last_result(&self, id: &str) -> StoreResult<Option<ExecutionResult>> {
        let mut inner = self.lock();
        let now = Instant::now();
        if let Some((_, expires_at)) = inner.results.get(id) {
            if *expires_at <= now {
                inner.results.remove(id);
                return Ok(None);
            }
        }
        Ok(inner.results.get(id).map(|(result, _)| result.clone()))
    }

    async fn active_sessions(&self) -> StoreResult<HashSet<String>> {
        Ok(self.lock().active.clone())
    }

    async fn reconcile_active_set(&self) -> StoreResult<Vec<String>> {
        let mut inner = self.lock();
        let now = Instant::now();

        let ids: Vec<String> = inner.active.iter().cloned().collect();
        let mut removed = Vec::new();
        for id in ids {
            if Self::live_record(&mut inner, &id, now).is_none() {
                inner.active.remove(&id);
                removed.push(id);
            }
        }
        Ok(removed)
    }
}
