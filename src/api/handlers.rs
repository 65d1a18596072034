//! API request handlers.

use axum::{
    Json,
    extract::{Path, State},
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::environments::EnvironmentDescriptor;
use crate::session::{ExecutionRequest, SessionStatus};

use super::error::{ApiError, ApiResult};
use super::state::AppState;

/// Service index document.
#[derive(Debug, Serialize)]
pub struct IndexResponse {
    pub service: String,
    pub version: String,
    pub health: String,
}

/// Root endpoint.
pub async fn index() -> Json<IndexResponse> {
    Json(IndexResponse {
        service: "Code Executor API".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        health: "/api/v1/health".to_string(),
    })
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "code-executor".to_string(),
    })
}

/// List available execution environments.
#[instrument(skip(state))]
pub async fn list_environments(
    State(state): State<AppState>,
) -> Json<Vec<EnvironmentDescriptor>> {
    Json(state.sessions.environments())
}

/// Request to create a new session.
#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    /// Execution environment (e.g. "python", "node", "rust").
    pub environment: String,
}

/// Response from session creation.
#[derive(Debug, Serialize)]
pub struct CreateSessionResponse {
    pub session_id: String,
    pub status: SessionStatus,
    pub environment: String,
    pub message: String,
}

/// Create a new session; the sandbox starts in the background.
#[instrument(skip(state, request), fields(environment = %request.environment))]
pub async fn create_session(
    State(state): State<AppState>,
    Json(request): Json<CreateSessionRequest>,
) -> ApiResult<Json<CreateSessionResponse>> {
    let created = state.sessions.create_session(&request.environment).await?;
    info!(session_id = %created.session_id, "Created session");

    Ok(Json(CreateSessionResponse {
        session_id: created.session_id,
        status: created.status,
        environment: created.environment,
        message: "Session created. Container is starting.".to_string(),
    }))
}

/// Session status response.
#[derive(Debug, Serialize)]
pub struct SessionStatusResponse {
    pub session_id: String,
    pub status: SessionStatus,
    pub environment: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_execution: Option<String>,
}

/// Get a session's status.
#[instrument(skip(state))]
pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<SessionStatusResponse>> {
    let record = state
        .sessions
        .get_session(&session_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("Session not found: {}", session_id)))?;

    Ok(Json(SessionStatusResponse {
        session_id: record.id,
        status: record.status,
        environment: record.environment,
        container_id: record.container_id,
        created_at: Some(record.created_at).filter(|c| !c.is_empty()),
        last_execution: record.last_execution,
    }))
}

/// Request to execute code in a session.
#[derive(Debug, Deserialize)]
pub struct ExecuteCodeRequest {
    /// Source code to execute.
    pub code: String,
    /// Optional filename for the code (e.g. "main.py").
    #[serde(default)]
    pub filename: Option<String>,
    /// Optional data piped to the program's standard input.
    #[serde(default)]
    pub stdin: Option<String>,
}

/// Response from a session execution.
#[derive(Debug, Serialize)]
pub struct ExecuteCodeResponse {
    pub session_id: String,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
    pub execution_time: f64,
    pub status: String,
}

/// Execute code in a session's sandbox.
#[instrument(skip(state, request))]
pub async fn execute_in_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(request): Json<ExecuteCodeRequest>,
) -> ApiResult<Json<ExecuteCodeResponse>> {
    let result = state
        .sessions
        .execute(
            &session_id,
            ExecutionRequest {
                code: request.code,
                filename: request.filename,
                stdin: request.stdin,
            },
        )
        .await?;

    Ok(Json(ExecuteCodeResponse {
        session_id,
        status: result.status_label().to_string(),
        stdout: result.stdout,
        stderr: result.stderr,
        exit_code: result.exit_code,
        execution_time: result.execution_time,
    }))
}

/// Response from requesting a session stop.
#[derive(Debug, Serialize)]
pub struct StopSessionResponse {
    pub session_id: String,
    pub status: SessionStatus,
    pub message: String,
}

/// Stop a session; teardown happens in the background.
#[instrument(skip(state))]
pub async fn stop_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<StopSessionResponse>> {
    state.sessions.stop_session(&session_id).await?;
    info!(session_id = %session_id, "Stopping session");

    Ok(Json(StopSessionResponse {
        session_id,
        status: SessionStatus::Stopping,
        message: "Session is being stopped.".to_string(),
    }))
}

/// Request for a one-shot execution.
#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    /// Execution environment.
    pub environment: String,
    /// Source code to execute.
    pub code: String,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub stdin: Option<String>,
}

/// Response from a one-shot execution.
#[derive(Debug, Serialize)]
pub struct ExecuteResponse {
    pub environment: String,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
    pub execution_time: f64,
    pub status: String,
}

/// Execute code in a temporary sandbox.
///
/// Creates a fresh container, runs the code, and removes the container;
/// every request is completely isolated.
#[instrument(skip(state, request), fields(environment = %request.environment))]
pub async fn execute_ephemeral(
    State(state): State<AppState>,
    Json(request): Json<ExecuteRequest>,
) -> ApiResult<Json<ExecuteResponse>> {
    let result = state
        .sessions
        .execute_ephemeral(
            &request.environment,
            ExecutionRequest {
                code: request.code,
                filename: request.filename,
                stdin: request.stdin,
            },
        )
        .await?;

    Ok(Json(ExecuteResponse {
        environment: request.environment,
        status: result.status_label().to_string(),
        stdout: result.stdout,
        stderr: result.stderr,
        exit_code: result.exit_code,
        execution_time: result.execution_time,
    }))
}
