//! Container runtime management module.
//!
//! Provides an async interface to manage sandbox containers via the Docker
//! or Podman CLI. The runtime is auto-detected or can be configured
//! explicitly.

mod config;
mod error;

pub use config::{
    ContainerConfig, ExecOutput, LabelledContainer, validate_container_id_or_name,
    validate_image_name,
};
pub use error::{ContainerError, ContainerResult};

use std::collections::HashMap;
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Container runtime type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    /// Docker runtime.
    #[default]
    Docker,
    /// Podman runtime.
    Podman,
}

impl RuntimeType {
    /// Get the default binary name for this runtime.
    pub fn default_binary(&self) -> &'static str {
        match self {
            RuntimeType::Docker => "docker",
            RuntimeType::Podman => "podman",
        }
    }
}

impl std::fmt::Display for RuntimeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeType::Docker => write!(f, "docker"),
            RuntimeType::Podman => write!(f, "podman"),
        }
    }
}

/// Container runtime abstraction for testability.
///
/// The sandbox executor is the only production caller; tests substitute
/// fakes that script container behavior.
#[async_trait]
pub trait ContainerRuntimeApi: Send + Sync {
    /// Create and start a container, returning its ID.
    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String>;

    /// Gracefully stop a container.
    async fn stop_container(
        &self,
        container_id: &str,
        timeout_seconds: Option<u32>,
    ) -> ContainerResult<()>;

    /// Remove a container.
    async fn remove_container(&self, container_id: &str, force: bool) -> ContainerResult<()>;

    /// Run a command in a container, capturing demultiplexed output.
    ///
    /// `stdin` bytes, when present, are piped to the command's standard
    /// input; the stream is closed after the write so readers see EOF.
    async fn exec_captured(
        &self,
        container_id: &str,
        user: Option<&str>,
        command: &[String],
        stdin: Option<&[u8]>,
    ) -> ContainerResult<ExecOutput>;

    /// Check whether an image exists locally.
    async fn image_exists(&self, image: &str) -> ContainerResult<bool>;

    /// List containers (including stopped ones) matching a label filter.
    async fn list_labelled(&self, label_filter: &str) -> ContainerResult<Vec<LabelledContainer>>;
}

/// Container runtime client driving the docker/podman CLI.
#[derive(Debug, Clone)]
pub struct ContainerRuntime {
    runtime_type: RuntimeType,
    binary: String,
}

impl Default for ContainerRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerRuntime {
    /// Create a new container runtime with auto-detection.
    ///
    /// Tries Docker first, then falls back to Podman.
    pub fn new() -> Self {
        if Self::is_binary_available("docker") {
            Self {
                runtime_type: RuntimeType::Docker,
                binary: "docker".to_string(),
            }
        } else if Self::is_binary_available("podman") {
            Self {
                runtime_type: RuntimeType::Podman,
                binary: "podman".to_string(),
            }
        } else {
            // Fall back to docker, will fail at runtime
            Self {
                runtime_type: RuntimeType::Docker,
                binary: "docker".to_string(),
            }
        }
    }

    /// Create a container runtime with a custom binary path.
    pub fn with_binary(binary: impl Into<String>) -> Self {
        let binary = binary.into();
        let runtime_type = if binary.contains("podman") {
            RuntimeType::Podman
        } else {
            RuntimeType::Docker
        };
        Self {
            runtime_type,
            binary,
        }
    }

    /// Get the runtime type.
    pub fn runtime_type(&self) -> RuntimeType {
        self.runtime_type
    }

    /// Check if a binary is available in PATH.
    fn is_binary_available(name: &str) -> bool {
        std::process::Command::new("which")
            .arg(name)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Check if the container runtime is available and working.
    pub async fn health_check(&self) -> ContainerResult<String> {
        let output = self.run_command("version", &["version".to_string()]).await?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn run_command(
        &self,
        label: &str,
        args: &[String],
    ) -> ContainerResult<std::process::Output> {
        let output = Command::new(&self.binary)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ContainerError::CommandFailed {
                command: label.to_string(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.to_lowercase().contains("no such container") {
                return Err(ContainerError::ContainerNotFound(stderr.trim().to_string()));
            }
            return Err(ContainerError::CommandFailed {
                command: label.to_string(),
                message: stderr.trim().to_string(),
            });
        }

        Ok(output)
    }
}

#[async_trait]
impl ContainerRuntimeApi for ContainerRuntime {
    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String> {
        config.validate()?;

        let mut args: Vec<String> = vec!["run".to_string(), "-d".to_string()];

        if let Some(ref name) = config.name {
            args.push("--name".to_string());
            args.push(name.clone());
        }

        for (key, value) in &config.labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }

        if let Some(ref memory) = config.memory_limit {
            args.push("--memory".to_string());
            args.push(memory.clone());
        }

        if let Some(period) = config.cpu_period {
            args.push("--cpu-period".to_string());
            args.push(period.to_string());
        }

        if let Some(quota) = config.cpu_quota {
            args.push("--cpu-quota".to_string());
            args.push(quota.to_string());
        }

        if let Some(pids) = config.pids_limit {
            args.push("--pids-limit".to_string());
            args.push(pids.to_string());
        }

        for (path, options) in &config.tmpfs {
            args.push("--tmpfs".to_string());
            args.push(format!("{}:{}", path, options));
        }

        if let Some(ref network) = config.network_mode {
            args.push("--network".to_string());
            args.push(network.clone());
        }

        if config.no_new_privileges {
            args.push("--security-opt".to_string());
            args.push("no-new-privileges:true".to_string());
        }

        if config.read_only {
            args.push("--read-only".to_string());
        }

        if let Some(ref workdir) = config.workdir {
            args.push("-w".to_string());
            args.push(workdir.clone());
        }

        if let Some(ref user) = config.user {
            args.push("-u".to_string());
            args.push(user.clone());
        }

        args.push(config.image.clone());
        args.extend(config.command.iter().cloned());

        let output = self.run_command("run", &args).await?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn stop_container(
        &self,
        container_id: &str,
        timeout_seconds: Option<u32>,
    ) -> ContainerResult<()> {
        validate_container_id_or_name(container_id)?;

        let mut args: Vec<String> = vec!["stop".to_string()];
        if let Some(t) = timeout_seconds {
            args.push("-t".to_string());
            args.push(t.to_string());
        }
        args.push(container_id.to_string());

        self.run_command("stop", &args).await?;
        Ok(())
    }

    async fn remove_container(&self, container_id: &str, force: bool) -> ContainerResult<()> {
        validate_container_id_or_name(container_id)?;

        let mut args: Vec<String> = vec!["rm".to_string()];
        if force {
            args.push("-f".to_string());
        }
        args.push(container_id.to_string());

        self.run_command("rm", &args).await?;
        Ok(())
    }

    async fn exec_captured(
        &self,
        container_id: &str,
        user: Option<&str>,
        command: &[String],
        stdin: Option<&[u8]>,
    ) -> ContainerResult<ExecOutput> {
        validate_container_id_or_name(container_id)?;

        let mut args: Vec<String> = vec!["exec".to_string(), "-i".to_string()];
        if let Some(user) = user {
            args.push("-u".to_string());
            args.push(user.to_string());
        }
        args.push(container_id.to_string());
        args.extend(command.iter().cloned());

        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        // Feed stdin from its own task so a full pipe cannot deadlock
        // against the output collection below.
        if let Some(mut handle) = child.stdin.take() {
            let bytes = stdin.map(<[u8]>::to_vec);
            tokio::spawn(async move {
                if let Some(ref bytes) = bytes {
                    if let Err(err) = handle.write_all(bytes).await {
                        log::debug!("writing exec stdin: {}", err);
                    }
                }
                let _ = handle.shutdown().await;
            });
        }

        let output = child.wait_with_output().await?;

        let stderr_text = String::from_utf8_lossy(&output.stderr).to_lowercase();
        if !output.status.success() && stderr_text.contains("no such container") {
            return Err(ContainerError::ContainerNotFound(container_id.to_string()));
        }

        Ok(ExecOutput {
            stdout: output.stdout,
            stderr: output.stderr,
            // Signal-terminated execs carry no code; report them like the
            // structured failure path does.
            exit_code: output.status.code().map_or(-1, i64::from),
        })
    }

    async fn image_exists(&self, image: &str) -> ContainerResult<bool> {
        validate_image_name(image)?;

        let status = Command::new(&self.binary)
            .args(["image", "inspect", image])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| ContainerError::CommandFailed {
                command: "image inspect".to_string(),
                message: e.to_string(),
            })?;

        Ok(status.success())
    }

    async fn list_labelled(&self, label_filter: &str) -> ContainerResult<Vec<LabelledContainer>> {
        let args = vec![
            "ps".to_string(),
            "-a".to_string(),
            "--filter".to_string(),
            format!("label={}", label_filter),
            "-q".to_string(),
            "--no-trunc".to_string(),
        ];

        let output = self.run_command("ps", &args).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);

        let mut containers = Vec::new();
        for id in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
            match self.inspect_labels(id).await {
                Ok(labels) => containers.push(LabelledContainer {
                    id: id.to_string(),
                    labels,
                }),
                // Raced with removal between ps and inspect
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(containers)
    }
}

impl ContainerRuntime {
    /// Fetch the label map of a container via `inspect`.
    async fn inspect_labels(&self, id: &str) -> ContainerResult<HashMap<String, String>> {
        validate_container_id_or_name(id)?;

        let args = vec![
            "inspect".to_string(),
            "--format".to_string(),
            "{{json .Config.Labels}}".to_string(),
            id.to_string(),
        ];

        let output = self.run_command("inspect", &args).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let trimmed = stdout.trim();

        if trimmed.is_empty() || trimmed == "null" {
            return Ok(HashMap::new());
        }

        serde_json::from_str(trimmed).map_err(|e| ContainerError::ParseError(e.to_string()))
    }
}
