//! Redis state store backend.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};

use crate::session::models::{ExecutionResult, SessionRecord, SessionStatus};

use super::{
    ACTIVE_SESSIONS_KEY, FIELD_LAST_EXECUTION, SessionStore, SessionUpdate, StoreError,
    StoreResult, record_from_fields, record_to_fields, result_key, session_key,
};

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Backend(err.to_string())
    }
}

/// Compare-and-set status transition.
///
/// KEYS[1] = session key, ARGV[1] = ttl seconds, ARGV[2] = new status,
/// ARGV[3..] = statuses the transition may fire from.
const TRANSITION_SCRIPT: &str = r#"
local current = redis.call('HGET', KEYS[1], 'status')
if current == false then
  return -1
end
for i = 3, #ARGV do
  if current == ARGV[i] then
    redis.call('HSET', KEYS[1], 'status', ARGV[2])
    redis.call('EXPIRE', KEYS[1], ARGV[1])
    return 1
  end
end
return 0
"#;

/// Session store backed by Redis.
///
/// The connection manager transparently reconnects; individual command
/// failures surface as transient [`StoreError::Backend`] errors.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    ttl: u64,
    transition: Script,
}

impl RedisStore {
    /// Connect to the store.
    pub async fn connect(url: &str, ttl: Duration) -> StoreResult<Self> {
        let client = Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self {
            conn,
            ttl: ttl.as_secs(),
            transition: Script::new(TRANSITION_SCRIPT),
        })
    }

    fn ttl_secs(&self) -> i64 {
        self.ttl as i64
    }
}

#[async_trait]
impl SessionStore for RedisStore {
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

        let key = session_key(id);
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .hset_multiple(&key, &record_to_fields(&record))
            .expire(&key, self.ttl_secs())
            .sadd(ACTIVE_SESSIONS_KEY, id)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> StoreResult<Option<SessionRecord>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(session_key(id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        record_from_fields(id, fields).map(Some)
    }

    async fn exists(&self, id: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        Ok(conn.exists(session_key(id)).await?)
    }

    async fn update(&self, id: &str, update: SessionUpdate) -> StoreResult<()> {
        let fields = update.fields();
        if fields.is_empty() {
            return Ok(());
        }

        let key = session_key(id);
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .hset_multiple(&key, &fields)
            .expire(&key, self.ttl_secs())
            .query_async(&mut conn)
            .await?;
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
        let mut conn = self.conn.clone();
        let mut invocation = self.transition.key(session_key(id));
        invocation.arg(self.ttl_secs()).arg(to.to_string());
        for status in from {
            invocation.arg(status.to_string());
        }

        let fired: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(fired == 1)
    }

    async fn clear_container(&self, id: &str) -> StoreResult<()> {
        let key = session_key(id);
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .hdel(&key, super::FIELD_CONTAINER_ID)
            .expire(&key, self.ttl_secs())
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .del(session_key(id))
            .del(result_key(id))
            .srem(ACTIVE_SESSIONS_KEY, id)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn save_result(&self, id: &str, result: &ExecutionResult) -> StoreResult<()> {
        let payload = serde_json::to_string(result)?;
        let key = session_key(id);
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .set_ex(result_key(id), payload, self.ttl)
            .hset(&key, FIELD_LAST_EXECUTION, Utc::now().to_rfc3339())
            .expire(&key, self.ttl_secs())
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn last_result(&self, id: &str) -> StoreResult<Option<ExecutionResult>> {
        let mut conn = self.conn.clone();
        let payload: Option<String> = conn.get(result_key(id)).await?;
        match payload {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    async fn active_sessions(&self) -> StoreResult<HashSet<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.smembers(ACTIVE_SESSIONS_KEY).await?)
    }

    async fn reconcile_active_set(&self) -> StoreResult<Vec<String>> {
        let ids = self.active_sessions().await?;
        let mut conn = self.conn.clone();

        let mut removed = Vec::new();
        for id in ids {
            let exists: bool = conn.exists(session_key(&id)).await?;
            if !exists {
                let _: i64 = conn.srem(ACTIVE_SESSIONS_KEY, &id).await?;
                removed.push(id);
            }
        }
        Ok(removed)
    }
}
