//! Task worker entry points.
//!
//! Delivery is at-least-once, so every session-mutating entry point is a
//! compare-and-set on session status rather than a blind write: a replayed
//! task either re-asserts the state it already produced or fails without
//! regressing the session.

use std::collections::HashSet;
use std::sync::Arc;

use log::{info, warn};

use crate::executor::SandboxExecutor;
use crate::session::models::{ExecutionRequest, SessionStatus};
use crate::store::{SessionStore, SessionUpdate, StoreError};

use super::{FailureKind, Task, TaskOutcome, TaskReport};

/// Executes tasks against the store and the sandbox executor.
#[derive(Clone)]
pub struct TaskWorker {
    store: Arc<dyn SessionStore>,
    executor: Arc<SandboxExecutor>,
}

impl TaskWorker {
    pub fn new(store: Arc<dyn SessionStore>, executor: Arc<SandboxExecutor>) -> Self {
        Self { store, executor }
    }

    /// Run one task to completion.
    pub async fn run(&self, task: Task) -> TaskOutcome {
        match task {
            Task::StartSession {
                session_id,
                environment,
            } => self.start_session(&session_id, &environment).await,
            Task::ExecuteCode {
                session_id,
                code,
                filename,
                stdin,
            } => {
                let request = ExecutionRequest {
                    code,
                    filename,
                    stdin,
                };
                self.execute_code(&session_id, &request).await
            }
            Task::StopSession { session_id } => self.stop_session(&session_id).await,
            Task::EphemeralExecute {
                environment,
                code,
                filename,
                stdin,
            } => {
                let request = ExecutionRequest {
                    code,
                    filename,
                    stdin,
                };
                let result = self.executor.run_once(&environment, &request).await;
                TaskOutcome::Success(TaskReport::Execution { result })
            }
            Task::Reap => self.reap().await,
            Task::ForceCleanupAll => self.force_cleanup_all().await,
        }
    }

    async fn start_session(&self, session_id: &str, environment: &str) -> TaskOutcome {
        let fired = match self
            .store
            .transition(
                session_id,
                &[SessionStatus::Pending, SessionStatus::Creating],
                SessionStatus::Creating,
            )
            .await
        {
            Ok(fired) => fired,
            Err(err) => return backend_failure(err),
        };

        if !fired {
            // Replayed delivery or a session that moved on without us
            return match self.store.get(session_id).await {
                Ok(Some(record))
                    if record.status == SessionStatus::Ready && record.container_id.is_some() =>
                {
                    TaskOutcome::Success(TaskReport::SessionStarted {
                        session_id: session_id.to_string(),
                        container_id: record.container_id.unwrap_or_default(),
                    })
                }
                Ok(Some(record)) => TaskOutcome::failure(
                    FailureKind::Validation,
                    format!(
                        "session {} cannot start from status {}",
                        session_id, record.status
                    ),
                ),
                Ok(None) => TaskOutcome::failure(
                    FailureKind::NotFound,
                    format!("session not found: {}", session_id),
                ),
                Err(err) => backend_failure(err),
            };
        }

        match self.executor.create(session_id, environment).await {
            Ok(container_id) => {
                if let Err(err) = self
                    .store
                    .update(
                        session_id,
                        SessionUpdate::default().container_id(container_id.as_str()),
                    )
                    .await
                {
                    return self.fail_session(session_id, err.to_string()).await;
                }
                if let Err(err) = self
                    .store
                    .transition(session_id, &[SessionStatus::Creating], SessionStatus::Ready)
                    .await
                {
                    return self.fail_session(session_id, err.to_string()).await;
                }

                info!(
                    "session {} ready (container {})",
                    session_id, container_id
                );
                TaskOutcome::Success(TaskReport::SessionStarted {
                    session_id: session_id.to_string(),
                    container_id,
                })
            }
            Err(err) => {
                let message = err.to_string();
                self.fail_session(session_id, message.clone()).await;
                TaskOutcome::failure(FailureKind::Sandbox, message)
            }
        }
    }

    async fn execute_code(&self, session_id: &str, request: &ExecutionRequest) -> TaskOutcome {
        let record = match self.store.get(session_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                return TaskOutcome::failure(
                    FailureKind::NotFound,
                    format!("session not found: {}", session_id),
                );
            }
            Err(err) => return backend_failure(err),
        };

        let Some(container_id) = record.container_id.clone() else {
            return TaskOutcome::failure(
                FailureKind::NotFound,
                format!("no container for session {}", session_id),
            );
        };

        let fired = match self
            .store
            .transition(
                session_id,
                &[SessionStatus::Ready, SessionStatus::Executing],
                SessionStatus::Executing,
            )
            .await
        {
            Ok(fired) => fired,
            Err(err) => return backend_failure(err),
        };
        if !fired {
            return TaskOutcome::failure(
                FailureKind::Validation,
                format!(
                    "session {} is not ready to execute (status: {})",
                    session_id, record.status
                ),
            );
        }

        // The executor never raises; every failure is a structured result
        let result = self
            .executor
            .execute(&container_id, &record.environment, request)
            .await;

        if let Err(err) = self.store.save_result(session_id, &result).await {
            return self.fail_session(session_id, err.to_string()).await;
        }
        if let Err(err) = self
            .store
            .transition(session_id, &[SessionStatus::Executing], SessionStatus::Ready)
            .await
        {
            return self.fail_session(session_id, err.to_string()).await;
        }

        TaskOutcome::Success(TaskReport::Execution { result })
    }

    async fn stop_session(&self, session_id: &str) -> TaskOutcome {
        let record = match self.store.get(session_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                return TaskOutcome::failure(
                    FailureKind::NotFound,
                    format!("session not found: {}", session_id),
                );
            }
            Err(err) => return backend_failure(err),
        };

        if record.status == SessionStatus::Stopped {
            // Replayed delivery; nothing left to do
            return TaskOutcome::Success(TaskReport::SessionStopped {
                session_id: session_id.to_string(),
            });
        }

        let fired = match self
            .store
            .transition(
                session_id,
                &[
                    SessionStatus::Pending,
                    SessionStatus::Creating,
                    SessionStatus::Ready,
                    SessionStatus::Executing,
                    SessionStatus::Stopping,
                ],
                SessionStatus::Stopping,
            )
            .await
        {
            Ok(fired) => fired,
            Err(err) => return backend_failure(err),
        };
        if !fired {
            return TaskOutcome::failure(
                FailureKind::Validation,
                format!(
                    "session {} cannot stop from status {}",
                    session_id, record.status
                ),
            );
        }

        if let Some(ref container_id) = record.container_id {
            self.executor.stop(container_id).await;
        }

        if let Err(err) = self.store.clear_container(session_id).await {
            return self.fail_session(session_id, err.to_string()).await;
        }
        if let Err(err) = self
            .store
            .transition(session_id, &[SessionStatus::Stopping], SessionStatus::Stopped)
            .await
        {
            return self.fail_session(session_id, err.to_string()).await;
        }

        info!("session {} stopped", session_id);
        TaskOutcome::Success(TaskReport::SessionStopped {
            session_id: session_id.to_string(),
        })
    }

    async fn reap(&self) -> TaskOutcome {
        // The reaper never fails a live session: errors are logged and the
        // pass simply does less work.
        let sessions = match self.store.reconcile_active_set().await {
            Ok(removed) => removed,
            Err(err) => {
                warn!("reaper could not reconcile the active set: {}", err);
                Vec::new()
            }
        };

        // Post-reconcile, the active set is exactly the live records
        let live: HashSet<String> = match self.store.active_sessions().await {
            Ok(live) => live,
            Err(err) => {
                warn!("reaper could not read the active set: {}", err);
                return TaskOutcome::Success(TaskReport::Cleaned {
                    sessions,
                    containers: Vec::new(),
                });
            }
        };

        let containers = match self.executor.sweep(&live).await {
            Ok(removed) => removed,
            Err(err) => {
                warn!("reaper sweep failed: {}", err);
                Vec::new()
            }
        };

        if !sessions.is_empty() || !containers.is_empty() {
            info!(
                "reaper removed {} expired session(s), {} orphan container(s)",
                sessions.len(),
                containers.len()
            );
        }
        TaskOutcome::Success(TaskReport::Cleaned {
            sessions,
            containers,
        })
    }

    async fn force_cleanup_all(&self) -> TaskOutcome {
        let active = match self.store.active_sessions().await {
            Ok(active) => active,
            Err(err) => return backend_failure(err),
        };

        let mut sessions = Vec::new();
        for session_id in active {
            if let Ok(Some(record)) = self.store.get(&session_id).await {
                if let Some(ref container_id) = record.container_id {
                    self.executor.stop(container_id).await;
                }
            }
            if let Err(err) = self.store.delete(&session_id).await {
                warn!("force cleanup could not delete {}: {}", session_id, err);
                continue;
            }
            sessions.push(session_id);
        }

        let containers = match self.executor.sweep(&HashSet::new()).await {
            Ok(removed) => removed,
            Err(err) => {
                warn!("force cleanup sweep failed: {}", err);
                Vec::new()
            }
        };

        TaskOutcome::Success(TaskReport::Cleaned {
            sessions,
            containers,
        })
    }

    /// Push a session to `error` with a cause, best effort.
    async fn fail_session(&self, session_id: &str, message: String) -> TaskOutcome {
        if let Err(err) = self
            .store
            .update(
                session_id,
                SessionUpdate::status(SessionStatus::Error).error(message.as_str()),
            )
            .await
        {
            warn!(
                "could not mark session {} as errored: {}",
                session_id, err
            );
        }
        TaskOutcome::failure(FailureKind::Backend, message)
    }
}

fn backend_failure(err: StoreError) -> TaskOutcome {
    TaskOutcome::failure(FailureKind::Backend, err.to_string())
}
