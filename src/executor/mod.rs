//! Sandbox executor.
//!
//! The only component that talks to the container runtime. Creates
//! sandboxes under a fixed isolation policy, runs one command per
//! execution round, and reports structured results. `execute` never fails:
//! every failure mode is folded into an [`ExecutionResult`] so callers
//! always have stdout/stderr/exit-code to hand back.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, warn};
use thiserror::Error;
use tokio::time::Instant;
use uuid::Uuid;

use crate::container::{ContainerConfig, ContainerError, ContainerRuntimeApi};
use crate::environments::EnvironmentRegistry;
use crate::session::models::{ExecutionRequest, ExecutionResult};

/// Label marking containers managed by this service.
pub const MANAGED_LABEL: &str = "code-executor";
/// Label carrying the owning session id.
pub const SESSION_ID_LABEL: &str = "session_id";
/// Label carrying the environment name.
pub const ENVIRONMENT_LABEL: &str = "environment";

/// Exit code the `timeout` guard reports for a killed execution.
pub const TIMEOUT_EXIT_CODE: i64 = 124;

/// Delay between writing the source file and executing it, covering the
/// race where the run exec observes a missing or partially written file.
const FILE_SETTLE_DELAY: Duration = Duration::from_millis(100);

/// Errors raised while creating or destroying sandboxes.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("unknown environment: {0}")]
    UnknownEnvironment(String),

    #[error(
        "image '{image}' not found. Build it first with: \
         docker build -t {image} environments/{environment}/"
    )]
    ImageMissing { image: String, environment: String },

    #[error(transparent)]
    Runtime(#[from] ContainerError),
}

/// Isolation policy applied to every sandbox.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Image name prefix; full image is `{prefix}-{environment image}`.
    pub image_prefix: String,
    /// Directory inside the sandbox where source files land.
    pub workspace_dir: String,
    /// Non-root user executions run as.
    pub executor_user: String,
    /// Memory cap (bytes-with-suffix).
    pub memory_limit: String,
    /// CPU cap as a fraction of one core.
    pub cpu_limit: f64,
    /// Process-count cap.
    pub pids_limit: u32,
    /// Hard wall-clock bound per execution, in seconds.
    pub execution_timeout: u64,
    /// Disable networking inside sandboxes.
    pub network_disabled: bool,
    /// Mount the sandbox root filesystem read-only.
    pub read_only: bool,
    /// Apply the no-new-privileges security option.
    pub no_new_privileges: bool,
    /// Size cap of the `/tmp` tmpfs.
    pub tmpfs_size: String,
}

/// Creates isolated sandboxes and runs code in them.
pub struct SandboxExecutor {
    runtime: Arc<dyn ContainerRuntimeApi>,
    registry: Arc<EnvironmentRegistry>,
    config: ExecutorConfig,
}

impl SandboxExecutor {
    pub fn new(
        runtime: Arc<dyn ContainerRuntimeApi>,
        registry: Arc<EnvironmentRegistry>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            runtime,
            registry,
            config,
        }
    }

    /// Create and start a sandbox for a session.
    ///
    /// Fails fast with a descriptive error when the environment image is
    /// not present locally.
    pub async fn create(&self, session_id: &str, environment: &str) -> Result<String, ExecutorError> {
        let env = self
            .registry
            .get(environment)
            .ok_or_else(|| ExecutorError::UnknownEnvironment(environment.to_string()))?;

        let image = env.full_image_name(&self.config.image_prefix);
        if !self.runtime.image_exists(&image).await? {
            return Err(ExecutorError::ImageMissing {
                image,
                environment: environment.to_string(),
            });
        }

        let short_id: String = session_id.chars().take(8).collect();
        let network = if self.config.network_disabled {
            "none"
        } else {
            "bridge"
        };

        let container = ContainerConfig::new(image)
            .name(format!("session-{}", short_id))
            // Keep the sandbox alive for repeated execs within the session
            .command(vec!["sleep".to_string(), "infinity".to_string()])
            .workdir(self.config.workspace_dir.as_str())
            .user(self.config.executor_user.as_str())
            .label(MANAGED_LABEL, "true")
            .label(SESSION_ID_LABEL, session_id)
            .label(ENVIRONMENT_LABEL, environment)
            .memory_limit(self.config.memory_limit.as_str())
            .cpu_fraction(self.config.cpu_limit)
            .pids_limit(self.config.pids_limit)
            .tmpfs(
                "/tmp",
                format!("size={},noexec,nosuid,nodev", self.config.tmpfs_size),
            )
            .network_mode(network)
            .no_new_privileges(self.config.no_new_privileges)
            .read_only(self.config.read_only);

        let container_id = self.runtime.create_container(&container).await?;
        debug!(
            "created sandbox {} for session {} ({})",
            container_id, session_id, environment
        );
        Ok(container_id)
    }

    /// Run one execution round in an existing sandbox.
    ///
    /// Never fails; sandbox-level problems come back as a result with exit
    /// code -1 and a human-readable stderr.
    pub async fn execute(
        &self,
        container_id: &str,
        environment: &str,
        request: &ExecutionRequest,
    ) -> ExecutionResult {
        match self.try_execute(container_id, environment, request).await {
            Ok(result) => result,
            Err(ContainerError::ContainerNotFound(_)) => failure_result(
                "Container not found. Session may have expired.".to_string(),
            ),
            Err(err) => failure_result(format!("Execution error: {}", err)),
        }
    }

    async fn try_execute(
        &self,
        container_id: &str,
        environment: &str,
        request: &ExecutionRequest,
    ) -> Result<ExecutionResult, ContainerError> {
        let Some(env) = self.registry.get(environment) else {
            return Ok(failure_result(format!(
                "Execution error: unknown environment: {}",
                environment
            )));
        };

        let filename = request
            .filename
            .as_deref()
            .unwrap_or(&env.default_filename);
        let file_path = format!("{}/{}", self.config.workspace_dir, filename);

        // Stream the source into the workspace via a cat exec
        let write_command = vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("cat > {}", file_path),
        ];
        self.runtime
            .exec_captured(
                container_id,
                Some(&self.config.executor_user),
                &write_command,
                Some(request.code.as_bytes()),
            )
            .await?;

        tokio::time::sleep(FILE_SETTLE_DELAY).await;

        // Wrap the expanded run command in the sandbox's own timeout guard
        let mut command = vec![
            "timeout".to_string(),
            self.config.execution_timeout.to_string(),
        ];
        command.extend(env.run_command_argv(&file_path));

        let stdin = request.stdin.as_deref().map(str::as_bytes);
        let started = Instant::now();
        let output = self
            .runtime
            .exec_captured(
                container_id,
                Some(&self.config.executor_user),
                &command,
                stdin,
            )
            .await?;
        let execution_time = round_to_millis(started.elapsed().as_secs_f64());

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let mut stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if output.exit_code == TIMEOUT_EXIT_CODE {
            stderr = format!("Execution timed out\n{}", stderr);
        }

        Ok(ExecutionResult {
            stdout,
            stderr,
            exit_code: output.exit_code,
            execution_time,
            timestamp: Utc::now().to_rfc3339(),
        })
    }

    /// Stop and remove a sandbox. Absence of the container is not an error;
    /// other runtime failures are logged and swallowed.
    pub async fn stop(&self, container_id: &str) {
        match self.runtime.stop_container(container_id, Some(5)).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => return,
            Err(err) => warn!("stopping container {}: {}", container_id, err),
        }

        match self.runtime.remove_container(container_id, true).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => warn!("removing container {}: {}", container_id, err),
        }
    }

    /// Remove every managed container whose session id label is not in
    /// `live`. An empty set removes all managed containers.
    pub async fn sweep(&self, live: &HashSet<String>) -> Result<Vec<String>, ExecutorError> {
        let filter = format!("{}=true", MANAGED_LABEL);
        let containers = self.runtime.list_labelled(&filter).await?;

        let mut removed = Vec::new();
        for container in containers {
            let owner = container.labels.get(SESSION_ID_LABEL);
            if owner.is_some_and(|id| live.contains(id)) {
                continue;
            }
            debug!(
                "sweeping orphan container {} (session {:?})",
                container.id, owner
            );
            self.stop(&container.id).await;
            removed.push(container.id);
        }
        Ok(removed)
    }

    /// One-shot execution: fresh sandbox, one run, guaranteed teardown.
    pub async fn run_once(&self, environment: &str, request: &ExecutionRequest) -> ExecutionResult {
        let scratch_id = Uuid::new_v4().to_string();

        let container_id = match self.create(&scratch_id, environment).await {
            Ok(id) => id,
            Err(err) => return failure_result(err.to_string()),
        };

        let result = self.execute(&container_id, environment, request).await;
        // The sandbox is destroyed no matter how the execution went
        self.stop(&container_id).await;
        result
    }

    /// The configured per-execution timeout.
    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.config.execution_timeout)
    }
}

fn round_to_millis(seconds: f64) -> f64 {
    (seconds * 1000.0).round() / 1000.0
}

fn failure_result(stderr: String) -> ExecutionResult {
    ExecutionResult {
        stdout: String::new(),
        stderr,
        exit_code: -1,
        execution_time: 0.0,
        timestamp: Utc::now().to_rfc3339(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::container::{ContainerResult, ExecOutput, LabelledContainer};
    use crate::environments::{CatalogDefaults, EnvironmentConfig, EnvironmentRegistry};

    #[derive(Default)]
    struct FakeRuntime {
        image_missing: bool,
        created: Mutex<Vec<ContainerConfig>>,
        execs: Mutex<Vec<(Vec<String>, Option<Vec<u8>>)>>,
        exec_results: Mutex<VecDeque<ContainerResult<ExecOutput>>>,
        stopped: Mutex<Vec<String>>,
        removed: Mutex<Vec<String>>,
        labelled: Mutex<Vec<LabelledContainer>>,
    }

    impl FakeRuntime {
        fn push_exec_result(&self, result: ContainerResult<ExecOutput>) {
            self.exec_results.lock().unwrap().push_back(result);
        }

        fn exec_output(stdout: &str, stderr: &str, exit_code: i64) -> ExecOutput {
            ExecOutput {
                stdout: stdout.as_bytes().to_vec(),
                stderr: stderr.as_bytes().to_vec(),
                exit_code,
            }
        }
    }

    #[async_trait]
    impl ContainerRuntimeApi for FakeRuntime {
        async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String> {
            self.created.lock().unwrap().push(config.clone());
            Ok("fake-container".to_string())
        }

        async fn stop_container(
            &self,
            container_id: &str,
            _timeout_seconds: Option<u32>,
        ) -> ContainerResult<()> {
            self.stopped.lock().unwrap().push(container_id.to_string());
            Ok(())
        }

        async fn remove_container(&self, container_id: &str, _force: bool) -> ContainerResult<()> {
            self.removed.lock().unwrap().push(container_id.to_string());
            Ok(())
        }

        async fn exec_captured(
            &self,
            _container_id: &str,
            _user: Option<&str>,
            command: &[String],
            stdin: Option<&[u8]>,
        ) -> ContainerResult<ExecOutput> {
            self.execs
                .lock()
                .unwrap()
                .push((command.to_vec(), stdin.map(<[u8]>::to_vec)));
            self.exec_results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(ExecOutput::default()))
        }

        async fn image_exists(&self, _image: &str) -> ContainerResult<bool> {
            Ok(!self.image_missing)
        }

        async fn list_labelled(
            &self,
            _label_filter: &str,
        ) -> ContainerResult<Vec<LabelledContainer>> {
            Ok(self.labelled.lock().unwrap().clone())
        }
    }

    fn test_registry() -> Arc<EnvironmentRegistry> {
        Arc::new(EnvironmentRegistry::from_parts(
            CatalogDefaults::default(),
            vec![EnvironmentConfig {
                name: "python".to_string(),
                image: "python".to_string(),
                default_filename: "main.py".to_string(),
                file_extension: ".py".to_string(),
                run_command: "python {file_path}".to_string(),
                compile_command: None,
                description: "Python".to_string(),
                enabled: true,
            }],
        ))
    }

    fn test_config() -> ExecutorConfig {
        ExecutorConfig {
            image_prefix: "code-executor".to_string(),
            workspace_dir: "/workspace".to_string(),
            executor_user: "executor".to_string(),
            memory_limit: "256m".to_string(),
            cpu_limit: 0.5,
            pids_limit: 50,
            execution_timeout: 30,
            network_disabled: true,
            read_only: false,
            no_new_privileges: true,
            tmpfs_size: "64m".to_string(),
        }
    }

    fn executor(runtime: Arc<FakeRuntime>) -> SandboxExecutor {
        SandboxExecutor::new(runtime, test_registry(), test_config())
    }

    #[tokio::test]
    async fn create_applies_isolation_policy_and_labels() {
        let runtime = Arc::new(FakeRuntime::default());
        let executor = executor(runtime.clone());

        let id = executor.create("abcdef12-3456", "python").await.unwrap();
        assert_eq!(id, "fake-container");

        let created = runtime.created.lock().unwrap();
        let config = &created[0];
        assert_eq!(config.image, "code-executor-python");
        assert_eq!(config.name.as_deref(), Some("session-abcdef12"));
        assert_eq!(config.command, vec!["sleep", "infinity"]);
        assert_eq!(config.workdir.as_deref(), Some("/workspace"));
        assert_eq!(config.user.as_deref(), Some("executor"));
        assert_eq!(config.memory_limit.as_deref(), Some("256m"));
        assert_eq!(config.cpu_period, Some(100_000));
        assert_eq!(config.cpu_quota, Some(50_000));
        assert_eq!(config.pids_limit, Some(50));
        assert_eq!(config.network_mode.as_deref(), Some("none"));
        assert!(config.no_new_privileges);
        assert_eq!(
            config.tmpfs,
            vec![("/tmp".to_string(), "size=64m,noexec,nosuid,nodev".to_string())]
        );
        assert_eq!(config.labels.get(MANAGED_LABEL).map(String::as_str), Some("true"));
        assert_eq!(
            config.labels.get(SESSION_ID_LABEL).map(String::as_str),
            Some("abcdef12-3456")
        );
        assert_eq!(
            config.labels.get(ENVIRONMENT_LABEL).map(String::as_str),
            Some("python")
        );
    }

    #[tokio::test]
    async fn create_fails_fast_when_image_is_missing() {
        let runtime = Arc::new(FakeRuntime {
            image_missing: true,
            ..Default::default()
        });
        let executor = executor(runtime);

        let err = executor.create("abc", "python").await.unwrap_err();
        assert!(matches!(err, ExecutorError::ImageMissing { .. }));
        assert!(err.to_string().contains("code-executor-python"));
    }

    #[tokio::test(start_paused = true)]
    async fn execute_writes_source_then_runs_wrapped_command() {
        let runtime = Arc::new(FakeRuntime::default());
        runtime.push_exec_result(Ok(ExecOutput::default()));
        runtime.push_exec_result(Ok(FakeRuntime::exec_output("5\n", "", 0)));
        let executor = executor(runtime.clone());

        let request = ExecutionRequest {
            code: "print(2+3)".to_string(),
            filename: None,
            stdin: Some("42\n".to_string()),
        };
        let result = executor.execute("fake-container", "python", &request).await;

        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, "5\n");
        assert_eq!(result.status_label(), "completed");

        let execs = runtime.execs.lock().unwrap();
        assert_eq!(execs.len(), 2);

        let (write_cmd, write_stdin) = &execs[0];
        assert_eq!(
            write_cmd,
            &vec![
                "sh".to_string(),
                "-c".to_string(),
                "cat > /workspace/main.py".to_string()
            ]
        );
        assert_eq!(write_stdin.as_deref(), Some(b"print(2+3)".as_slice()));

        let (run_cmd, run_stdin) = &execs[1];
        assert_eq!(
            run_cmd,
            &vec![
                "timeout".to_string(),
                "30".to_string(),
                "python".to_string(),
                "/workspace/main.py".to_string()
            ]
        );
        assert_eq!(run_stdin.as_deref(), Some(b"42\n".as_slice()));
    }

    #[tokio::test(start_paused = true)]
    async fn execute_prepends_timeout_notice_on_exit_124() {
        let runtime = Arc::new(FakeRuntime::default());
        runtime.push_exec_result(Ok(ExecOutput::default()));
        runtime.push_exec_result(Ok(FakeRuntime::exec_output("", "killed", 124)));
        let executor = executor(runtime);

        let result = executor
            .execute("fake-container", "python", &ExecutionRequest::new("loop"))
            .await;

        assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
        assert!(result.stderr.starts_with("Execution timed out\n"));
        assert_eq!(result.status_label(), "error");
    }

    #[tokio::test(start_paused = true)]
    async fn execute_reports_missing_container_as_structured_result() {
        let runtime = Arc::new(FakeRuntime::default());
        runtime.push_exec_result(Err(ContainerError::ContainerNotFound(
            "fake-container".to_string(),
        )));
        let executor = executor(runtime);

        let result = executor
            .execute("fake-container", "python", &ExecutionRequest::new("x"))
            .await;

        assert_eq!(result.exit_code, -1);
        assert!(result.stderr.contains("Session may have expired"));
        assert_eq!(result.execution_time, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn run_once_tears_down_the_sandbox_even_on_failure() {
        let runtime = Arc::new(FakeRuntime::default());
        runtime.push_exec_result(Err(ContainerError::CommandFailed {
            command: "exec".to_string(),
            message: "runtime went away".to_string(),
        }));
        let executor = executor(runtime.clone());

        let result = executor
            .run_once("python", &ExecutionRequest::new("print(1)"))
            .await;

        assert_eq!(result.exit_code, -1);
        assert!(result.stderr.contains("runtime went away"));
        assert_eq!(*runtime.stopped.lock().unwrap(), vec!["fake-container"]);
        assert_eq!(*runtime.removed.lock().unwrap(), vec!["fake-container"]);
    }

    #[tokio::test]
    async fn sweep_removes_only_orphans() {
        let labelled = vec![
            LabelledContainer {
                id: "c-live".to_string(),
                labels: HashMap::from([
                    (MANAGED_LABEL.to_string(), "true".to_string()),
                    (SESSION_ID_LABEL.to_string(), "s-live".to_string()),
                ]),
            },
            LabelledContainer {
                id: "c-orphan".to_string(),
                labels: HashMap::from([
                    (MANAGED_LABEL.to_string(), "true".to_string()),
                    (SESSION_ID_LABEL.to_string(), "s-gone".to_string()),
                ]),
            },
            LabelledContainer {
                id: "c-unlabelled".to_string(),
                labels: HashMap::from([(MANAGED_LABEL.to_string(), "true".to_string())]),
            },
        ];
        let runtime = Arc::new(FakeRuntime {
            labelled: Mutex::new(labelled),
            ..Default::default()
        });
        let executor = executor(runtime.clone());

        let live: HashSet<String> = ["s-live".to_string()].into();
        let mut removed = executor.sweep(&live).await.unwrap();
        removed.sort();

        assert_eq!(removed, vec!["c-orphan", "c-unlabelled"]);
        assert!(!runtime.removed.lock().unwrap().contains(&"c-live".to_string()));
    }

    #[test]
    fn round_to_millis_truncates_sub_millisecond_noise() {
        assert_eq!(round_to_millis(0.123456), 0.123);
        assert_eq!(round_to_millis(5.0004), 5.0);
        assert_eq!(round_to_millis(5.0006), 5.001);
    }
}
