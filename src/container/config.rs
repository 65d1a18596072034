//! Container creation configuration.

use std::collections::HashMap;

use super::error::{ContainerError, ContainerResult};

/// Configuration for creating a new sandbox container.
///
/// Carries the full isolation policy applied to every sandbox: resource
/// ceilings, filesystem restrictions, and the labels the reaper keys off.
#[derive(Debug, Clone, Default)]
pub struct ContainerConfig {
    /// Container name (optional).
    pub name: Option<String>,
    /// Docker/OCI image to use.
    pub image: String,
    /// Command to run.
    pub command: Vec<String>,
    /// Working directory inside the container.
    pub workdir: Option<String>,
    /// User to run as inside the container.
    pub user: Option<String>,
    /// Labels for the container.
    pub labels: HashMap<String, String>,
    /// Memory cap with suffix (e.g. "256m").
    pub memory_limit: Option<String>,
    /// CPU period in microseconds (paired with `cpu_quota`).
    pub cpu_period: Option<u64>,
    /// CPU quota in microseconds per period.
    pub cpu_quota: Option<u64>,
    /// Maximum number of processes.
    pub pids_limit: Option<u32>,
    /// Tmpfs mounts (container_path -> mount options).
    pub tmpfs: Vec<(String, String)>,
    /// Network mode (e.g. "none", "bridge").
    pub network_mode: Option<String>,
    /// Apply the `no-new-privileges` security option.
    pub no_new_privileges: bool,
    /// Mount the root filesystem read-only.
    pub read_only: bool,
}

impl ContainerConfig {
    /// Create a new container config with the given image.
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    /// Validate all container configuration fields.
    ///
    /// Called before creating a container so malformed or hostile inputs
    /// never reach the runtime command line.
    pub fn validate(&self) -> ContainerResult<()> {
        validate_image_name(&self.image)?;

        if let Some(ref name) = self.name {
            validate_container_name(name)?;
        }

        for key in self.labels.keys() {
            validate_label_key(key)?;
        }

        Ok(())
    }

    /// Set the container name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the command to run.
    pub fn command(mut self, cmd: Vec<String>) -> Self {
        self.command = cmd;
        self
    }

    /// Set the working directory.
    pub fn workdir(mut self, workdir: impl Into<String>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    /// Set the container user.
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Add a label.
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Set the memory cap (bytes-with-suffix form, e.g. "256m").
    pub fn memory_limit(mut self, limit: impl Into<String>) -> Self {
        self.memory_limit = Some(limit.into());
        self
    }

    /// Cap CPU usage to a fraction of one core.
    ///
    /// Expressed through a period/quota pair: 0.5 becomes quota 50000 of a
    /// 100000 microsecond period.
    pub fn cpu_fraction(mut self, fraction: f64) -> Self {
        const CPU_PERIOD_US: u64 = 100_000;
        self.cpu_period = Some(CPU_PERIOD_US);
        self.cpu_quota = Some((fraction * CPU_PERIOD_US as f64) as u64);
        self
    }

    /// Cap the number of processes.
    pub fn pids_limit(mut self, limit: u32) -> Self {
        self.pids_limit = Some(limit);
        self
    }

    /// Add a tmpfs mount.
    pub fn tmpfs(mut self, path: impl Into<String>, options: impl Into<String>) -> Self {
        self.tmpfs.push((path.into(), options.into()));
        self
    }

    /// Set the network mode (e.g. "none", "bridge").
    pub fn network_mode(mut self, mode: impl Into<String>) -> Self {
        self.network_mode = Some(mode.into());
        self
    }

    /// Apply the `no-new-privileges` security option.
    pub fn no_new_privileges(mut self, enabled: bool) -> Self {
        self.no_new_privileges = enabled;
        self
    }

    /// Mount the root filesystem read-only.
    pub fn read_only(mut self, enabled: bool) -> Self {
        self.read_only = enabled;
        self
    }
}

/// A labelled container as reported by the runtime.
#[derive(Debug, Clone)]
pub struct LabelledContainer {
    /// Container ID.
    pub id: String,
    /// Labels attached at creation time.
    pub labels: HashMap<String, String>,
}

/// Output of a captured exec: demultiplexed streams plus the exit code.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i64,
}

/// Validate an image name.
///
/// Accepts registry/repository:tag forms; rejects anything that could
/// smuggle extra command-line arguments.
pub fn validate_image_name(image: &str) -> ContainerResult<()> {
    if image.is_empty() {
        return Err(ContainerError::InvalidInput(
            "image name cannot be empty".to_string(),
        ));
    }

    if image.len() > 255 {
        return Err(ContainerError::InvalidInput(
            "image name exceeds maximum length".to_string(),
        ));
    }

    let valid_chars = |c: char| {
        c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':' | '@')
    };
    if image.starts_with('-') || !image.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "image name '{}' contains invalid characters",
            image
        )));
    }

    Ok(())
}

/// Validate a container name.
pub fn validate_container_name(name: &str) -> ContainerResult<()> {
    if name.is_empty() || name.len() > 128 {
        return Err(ContainerError::InvalidInput(
            "container name must be 1-128 characters".to_string(),
        ));
    }

    let valid_chars = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_';
    if name.starts_with('-') || !name.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "container name '{}' contains invalid characters",
            name
        )));
    }

    Ok(())
}

/// Validate a container ID or name for use as a command argument.
pub fn validate_container_id_or_name(id: &str) -> ContainerResult<()> {
    if id.is_empty() {
        return Err(ContainerError::InvalidInput(
            "container ID or name cannot be empty".to_string(),
        ));
    }

    if id.len() > 128 {
        return Err(ContainerError::InvalidInput(
            "container ID or name exceeds maximum length".to_string(),
        ));
    }

    let valid_chars = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_';
    if id.starts_with('-') || !id.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "container ID or name '{}' contains invalid characters",
            id
        )));
    }

    Ok(())
}

fn validate_label_key(key: &str) -> ContainerResult<()> {
    if key.is_empty() {
        return Err(ContainerError::InvalidInput(
            "label key cannot be empty".to_string(),
        ));
    }

    let valid_chars = |c: char| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.');
    if !key.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "label key '{}' contains invalid characters",
            key
        )));
    }

    Ok(())
}
