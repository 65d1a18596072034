//! Session coordinator.
//!
//! Owns the session state machine: assigns identifiers, enforces
//! status-gated admission, and hands the long-running container work to
//! the task runtime. The coordinator itself never touches the container
//! runtime.

use std::sync::Arc;
use std::time::Duration;

use log::info;
use thiserror::Error;
use uuid::Uuid;

use crate::environments::{EnvironmentDescriptor, EnvironmentRegistry};
use crate::session::models::{ExecutionRequest, ExecutionResult, SessionRecord, SessionStatus};
use crate::store::{SessionStore, StoreError};
use crate::tasks::{FailureKind, Task, TaskOutcome, TaskQueueError, TaskReport, TaskRuntime};

/// Extra wait granted on top of the execution timeout when blocking for a
/// session execution result.
const SESSION_WAIT_GRACE: Duration = Duration::from_secs(10);
/// Extra wait for ephemeral executions, which also pay for container
/// creation and teardown.
const EPHEMERAL_WAIT_GRACE: Duration = Duration::from_secs(30);

/// Coordinator-level errors, mapped onto HTTP responses by the API layer.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Invalid environment: {requested}. Available: {}", .available.join(", "))]
    UnknownEnvironment {
        requested: String,
        available: Vec<String>,
    },

    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("{message}")]
    NotReady {
        status: SessionStatus,
        message: String,
    },

    #[error("timed out waiting for the execution result")]
    Timeout,

    #[error("task runtime overloaded")]
    Overloaded,

    #[error("{0}")]
    Backend(String),
}

impl From<StoreError> for SessionError {
    fn from(err: StoreError) -> Self {
        SessionError::Backend(err.to_string())
    }
}

impl From<TaskQueueError> for SessionError {
    fn from(err: TaskQueueError) -> Self {
        match err {
            TaskQueueError::Overloaded => SessionError::Overloaded,
            TaskQueueError::ResultTimeout => SessionError::Timeout,
            other => SessionError::Backend(other.to_string()),
        }
    }
}

/// What `create_session` hands back to the API: the caller does not wait
/// for the container.
#[derive(Debug, Clone)]
pub struct CreatedSession {
    pub session_id: String,
    pub environment: String,
    pub status: SessionStatus,
}

/// Orchestrates session lifecycle across store, registry and task runtime.
#[derive(Clone)]
pub struct SessionService {
    store: Arc<dyn SessionStore>,
    registry: Arc<EnvironmentRegistry>,
    tasks: TaskRuntime,
    execution_timeout: Duration,
}

impl SessionService {
    pub fn new(
        store: Arc<dyn SessionStore>,
        registry: Arc<EnvironmentRegistry>,
        tasks: TaskRuntime,
        execution_timeout: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            tasks,
            execution_timeout,
        }
    }

    /// Enabled environment descriptors for the API.
    pub fn environments(&self) -> Vec<EnvironmentDescriptor> {
        self.registry.descriptors()
    }

    /// Create a session and schedule its sandbox start.
    pub async fn create_session(&self, environment: &str) -> Result<CreatedSession, SessionError> {
        if self.registry.get_enabled(environment).is_none() {
            return Err(SessionError::UnknownEnvironment {
                requested: environment.to_string(),
                available: self.registry.list(),
            });
        }

        let session_id = Uuid::new_v4().to_string();
        self.store.create(&session_id, environment).await?;

        // Fire-and-forget: the record stays pending until a worker picks
        // the task up; an unsubmittable task leaves it to the TTL.
        let _ = self.tasks.submit(Task::StartSession {
            session_id: session_id.clone(),
            environment: environment.to_string(),
        })?;

        info!("created session {} ({})", session_id, environment);
        Ok(CreatedSession {
            session_id,
            environment: environment.to_string(),
            status: SessionStatus::Pending,
        })
    }

    /// Fetch a session record.
    pub async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>, SessionError> {
        Ok(self.store.get(session_id).await?)
    }

    /// Run code in a session's sandbox and wait for the result.
    pub async fn execute(
        &self,
        session_id: &str,
        request: ExecutionRequest,
    ) -> Result<ExecutionResult, SessionError> {
        let record = self
            .store
            .get(session_id)
            .await?
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;

        admit_execution(&record)?;

        let handle = self.tasks.submit(Task::ExecuteCode {
            session_id: session_id.to_string(),
            code: request.code,
            filename: request.filename,
            stdin: request.stdin,
        })?;

        let outcome = handle
            .wait(self.execution_timeout + SESSION_WAIT_GRACE)
            .await?;
        self.unwrap_execution(session_id, outcome)
    }

    /// Request session teardown; returns as soon as the stop is scheduled.
    pub async fn stop_session(&self, session_id: &str) -> Result<(), SessionError> {
        if !self.store.exists(session_id).await? {
            return Err(SessionError::NotFound(session_id.to_string()));
        }

        // Fire-and-forget; the caller polls the record for `stopped`
        let _ = self.tasks.submit(Task::StopSession {
            session_id: session_id.to_string(),
        })?;

        info!("scheduled stop for session {}", session_id);
        Ok(())
    }

    /// One-shot execution in a fresh sandbox.
    pub async fn execute_ephemeral(
        &self,
        environment: &str,
        request: ExecutionRequest,
    ) -> Result<ExecutionResult, SessionError> {
        if self.registry.get_enabled(environment).is_none() {
            return Err(SessionError::UnknownEnvironment {
                requested: environment.to_string(),
                available: self.registry.list(),
            });
        }

        let handle = self.tasks.submit(Task::EphemeralExecute {
            environment: environment.to_string(),
            code: request.code,
            filename: request.filename,
            stdin: request.stdin,
        })?;

        let outcome = handle
            .wait(self.execution_timeout + EPHEMERAL_WAIT_GRACE)
            .await?;
        self.unwrap_execution("", outcome)
    }

    /// Operational maintenance: tear down every session and sweep all
    /// managed containers.
    pub async fn force_cleanup(&self) -> Result<(Vec<String>, Vec<String>), SessionError> {
        let handle = self.tasks.submit(Task::ForceCleanupAll)?;
        let outcome = handle
            .wait(self.execution_timeout + EPHEMERAL_WAIT_GRACE)
            .await?;

        match outcome {
            TaskOutcome::Success(TaskReport::Cleaned {
                sessions,
                containers,
            }) => Ok((sessions, containers)),
            TaskOutcome::Success(_) => {
                Err(SessionError::Backend("unexpected task report".to_string()))
            }
            TaskOutcome::Failure(failure) => Err(SessionError::Backend(failure.message)),
        }
    }

    fn unwrap_execution(
        &self,
        session_id: &str,
        outcome: TaskOutcome,
    ) -> Result<ExecutionResult, SessionError> {
        match outcome {
            TaskOutcome::Success(TaskReport::Execution { result }) => Ok(result),
            TaskOutcome::Success(_) => {
                Err(SessionError::Backend("unexpected task report".to_string()))
            }
            TaskOutcome::Failure(failure) => Err(match failure.kind {
                FailureKind::NotFound => SessionError::NotFound(session_id.to_string()),
                FailureKind::Validation => SessionError::NotReady {
                    status: SessionStatus::Error,
                    message: failure.message,
                },
                FailureKind::Timeout => SessionError::Timeout,
                FailureKind::Sandbox | FailureKind::Backend => {
                    SessionError::Backend(failure.message)
                }
            }),
        }
    }
}

/// Status gate for execute requests, per the session state machine.
fn admit_execution(record: &SessionRecord) -> Result<(), SessionError> {
    let message = match record.status {
        SessionStatus::Ready | SessionStatus::Executing => return Ok(()),
        SessionStatus::Pending => "Container is starting, please wait".to_string(),
        SessionStatus::Creating => "Container is being created, please wait".to_string(),
        SessionStatus::Stopping | SessionStatus::Stopped => "Session is stopped".to_string(),
        SessionStatus::Error => format!(
            "Session is not ready (status: {}{})",
            record.status,
            record
                .error
                .as_deref()
                .map(|e| format!(": {}", e))
                .unwrap_or_default()
        ),
    };

    Err(SessionError::NotReady {
        status: record.status,
        message,
    })
}
