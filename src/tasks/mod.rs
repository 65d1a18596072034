//! Asynchronous task runtime.
//!
//! Long-running container operations are serialized off the request path
//! through a JSON task queue drained by a pool of workers. Submission
//! returns a handle immediately; callers may block on the handle with a
//! timeout. Each worker holds at most one task at a time, and every task
//! runs under a soft and a hard time limit.

mod worker;

pub use worker::TaskWorker;

use std::sync::Arc;
use std::time::Duration;

use log::{error, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::session::models::ExecutionResult;

/// Queue depth before submissions start failing fast.
const QUEUE_DEPTH: usize = 256;

/// A unit of background work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum Task {
    StartSession {
        session_id: String,
        environment: String,
    },
    ExecuteCode {
        session_id: String,
        code: String,
        #[serde(default)]
        filename: Option<String>,
        #[serde(default)]
        stdin: Option<String>,
    },
    StopSession {
        session_id: String,
    },
    EphemeralExecute {
        environment: String,
        code: String,
        #[serde(default)]
        filename: Option<String>,
        #[serde(default)]
        stdin: Option<String>,
    },
    Reap,
    ForceCleanupAll,
}

impl Task {
    /// Stable task name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Task::StartSession { .. } => "start_session",
            Task::ExecuteCode { .. } => "execute_code",
            Task::StopSession { .. } => "stop_session",
            Task::EphemeralExecute { .. } => "ephemeral_execute",
            Task::Reap => "reap",
            Task::ForceCleanupAll => "force_cleanup_all",
        }
    }
}

/// What a successfully completed task produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskReport {
    SessionStarted {
        session_id: String,
        container_id: String,
    },
    Execution {
        result: ExecutionResult,
    },
    SessionStopped {
        session_id: String,
    },
    Cleaned {
        sessions: Vec<String>,
        containers: Vec<String>,
    },
}

/// Failure category, used by the coordinator to pick a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    /// Malformed or inapplicable task.
    Validation,
    /// The referenced session or container no longer exists.
    NotFound,
    /// Sandbox lifecycle failure (image missing, container lost).
    Sandbox,
    /// The state store or another backend was unreachable.
    Backend,
    /// The task overran its hard time limit.
    Timeout,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Validation => write!(f, "validation"),
            FailureKind::NotFound => write!(f, "not_found"),
            FailureKind::Sandbox => write!(f, "sandbox"),
            FailureKind::Backend => write!(f, "backend"),
            FailureKind::Timeout => write!(f, "timeout"),
        }
    }
}

/// Structured failure returned by a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub message: String,
}

/// Result of a task: explicit success or categorized failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    Success(TaskReport),
    Failure(TaskFailure),
}

impl TaskOutcome {
    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        TaskOutcome::Failure(TaskFailure {
            kind,
            message: message.into(),
        })
    }
}

/// Errors from submitting to or waiting on the task runtime.
#[derive(Debug, Error)]
pub enum TaskQueueError {
    #[error("task queue is closed")]
    Closed,

    #[error("task queue is full")]
    Overloaded,

    #[error("timed out waiting for task result")]
    ResultTimeout,

    #[error("task worker dropped before reporting a result")]
    ResultLost,

    #[error("serializing task: {0}")]
    Serialize(#[from] serde_json::Error),
}

struct QueuedTask {
    payload: String,
    reply: oneshot::Sender<TaskOutcome>,
}

/// Handle to an in-flight task.
pub struct TaskHandle {
    rx: oneshot::Receiver<TaskOutcome>,
}

impl TaskHandle {
    /// Block up to `timeout` for the task's outcome.
    pub async fn wait(self, timeout: Duration) -> Result<TaskOutcome, TaskQueueError> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(_)) => Err(TaskQueueError::ResultLost),
            Err(_) => Err(TaskQueueError::ResultTimeout),
        }
    }
}

/// Queue plus worker pool.
#[derive(Clone)]
pub struct TaskRuntime {
    tx: mpsc::Sender<QueuedTask>,
}

impl TaskRuntime {
    /// Spawn `concurrency` workers draining a shared queue.
    ///
    /// `soft_limit` triggers a warning with time left for cleanup;
    /// `hard_limit` abandons the task with a `timeout` failure.
    pub fn start(
        worker: TaskWorker,
        concurrency: usize,
        soft_limit: Duration,
        hard_limit: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let worker = Arc::new(worker);

        for worker_index in 0..concurrency.max(1) {
            let rx = rx.clone();
            let worker = worker.clone();
            tokio::spawn(worker_loop(
                worker_index,
                rx,
                worker,
                soft_limit,
                hard_limit,
            ));
        }

        Self { tx }
    }

    /// Enqueue a task, returning a handle to its eventual outcome.
    ///
    /// Dropping the handle makes the submission fire-and-forget.
    pub fn submit(&self, task: Task) -> Result<TaskHandle, TaskQueueError> {
        let payload = serde_json::to_string(&task)?;
        let (reply_tx, reply_rx) = oneshot::channel();

        self.tx
            .try_send(QueuedTask {
                payload,
                reply: reply_tx,
            })
            .map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => TaskQueueError::Overloaded,
                mpsc::error::TrySendError::Closed(_) => TaskQueueError::Closed,
            })?;

        Ok(TaskHandle { rx: reply_rx })
    }

    /// Run the reaper now and then every `every`.
    ///
    /// The first interval tick fires immediately, which doubles as the
    /// crash-orphan cleanup at process start.
    pub fn spawn_reaper(&self, every: Duration) -> JoinHandle<()> {
        let runtime = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if let Err(err) = runtime.submit(Task::Reap) {
                    warn!("failed to schedule reap task: {}", err);
                }
            }
        })
    }
}

async fn worker_loop(
    worker_index: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<QueuedTask>>>,
    worker: Arc<TaskWorker>,
    soft_limit: Duration,
    hard_limit: Duration,
) {
    loop {
        // Hold the receiver lock only for the take; one unacked task per
        // worker at any time.
        let queued = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };
        let Some(QueuedTask { payload, reply }) = queued else {
            break;
        };

        let outcome = run_with_limits(&worker, &payload, soft_limit, hard_limit).await;
        // The submitter may have given up or never waited
        let _ = reply.send(outcome);
    }
    log::debug!("task worker {} shutting down", worker_index);
}

async fn run_with_limits(
    worker: &TaskWorker,
    payload: &str,
    soft_limit: Duration,
    hard_limit: Duration,
) -> TaskOutcome {
    let task: Task = match serde_json::from_str(payload) {
        Ok(task) => task,
        Err(err) => {
            return TaskOutcome::failure(
                FailureKind::Validation,
                format!("malformed task payload: {}", err),
            );
        }
    };
    let name = task.name();

    let fut = worker.run(task);
    tokio::pin!(fut);

    tokio::select! {
        outcome = &mut fut => outcome,
        _ = tokio::time::sleep(soft_limit) => {
            warn!("task {} exceeded its soft time limit", name);
            let grace = hard_limit.saturating_sub(soft_limit);
            match tokio::time::timeout(grace, &mut fut).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    error!("task {} exceeded its hard time limit, abandoning", name);
                    TaskOutcome::failure(
                        FailureKind::Timeout,
                        format!("task {} exceeded its hard time limit", name),
                    )
                }
            }
        }
    }
}
