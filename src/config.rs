//! Process configuration.
//!
//! All runtime settings come from environment variables, with defaults that
//! match the shipped docker-compose deployment. The environment catalog is
//! a separate YAML file (see [`crate::environments`]).

use std::path::PathBuf;
use std::time::Duration;

use config::{Config, ConfigError, Environment};
use serde::{Deserialize, Serialize};

/// Search order for the environment catalog when `ENVIRONMENTS_FILE` is not
/// set: the packaged location first, then the working tree.
const ENVIRONMENTS_FILE_PATHS: &[&str] = &[
    "/etc/code-executor/environments.yaml",
    "config/environments.yaml",
];

/// Main settings, one field per environment variable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // State store
    pub redis_host: String,
    pub redis_port: u16,
    pub redis_db: i64,

    // Task runtime
    pub worker_concurrency: usize,

    // Container runtime
    /// Explicit runtime binary (docker/podman); auto-detected when unset.
    pub container_runtime: Option<String>,
    pub image_prefix: String,

    // Execution limits
    pub container_memory_limit: String,
    pub container_cpu_limit: f64,
    pub container_pids_limit: u32,
    /// Hard wall-clock bound for a single execution, in seconds.
    pub execution_timeout: u64,
    /// Sliding session TTL, in seconds.
    pub session_ttl: u64,

    // Security
    pub network_disabled: bool,
    pub read_only: bool,
    pub no_new_privileges: bool,
    pub tmpfs_size: String,

    // API
    pub api_host: String,
    pub api_port: u16,

    // Catalog
    pub environments_file: Option<String>,
}

impl Settings {
    /// Load settings from the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        Config::builder()
            .set_default("redis_host", "redis")?
            .set_default("redis_port", 6379)?
            .set_default("redis_db", 0)?
            .set_default("worker_concurrency", 4)?
            .set_default("image_prefix", "code-executor")?
            .set_default("container_memory_limit", "256m")?
            .set_default("container_cpu_limit", 0.5)?
            .set_default("container_pids_limit", 50)?
            .set_default("execution_timeout", 30)?
            .set_default("session_ttl", 3600)?
            .set_default("network_disabled", true)?
            .set_default("read_only", false)?
            .set_default("no_new_privileges", true)?
            .set_default("tmpfs_size", "64m")?
            .set_default("api_host", "0.0.0.0")?
            .set_default("api_port", 8000)?
            .add_source(Environment::default().try_parsing(true))
            .build()?
            .try_deserialize()
    }

    /// Connection URL for the state store.
    pub fn redis_url(&self) -> String {
        format!(
            "redis://{}:{}/{}",
            self.redis_host, self.redis_port, self.redis_db
        )
    }

    /// Hard wall-clock bound for a single execution.
    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout)
    }

    /// Soft per-task time limit: execution timeout plus grace for cleanup.
    pub fn task_soft_limit(&self) -> Duration {
        Duration::from_secs(self.execution_timeout + 10)
    }

    /// Hard per-task time limit; a task exceeding it is abandoned.
    pub fn task_hard_limit(&self) -> Duration {
        Duration::from_secs(self.execution_timeout + 30)
    }

    /// Resolve the environment catalog path.
    ///
    /// An explicit `ENVIRONMENTS_FILE` wins; otherwise the first existing
    /// file from the default search order.
    pub fn environments_file_path(&self) -> Option<PathBuf> {
        if let Some(ref path) = self.environments_file {
            return Some(PathBuf::from(path));
        }

        ENVIRONMENTS_FILE_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            redis_host: "redis".to_string(),
            redis_port: 6379,
            redis_db: 0,
            worker_concurrency: 4,
            container_runtime: None,
            image_prefix: "code-executor".to_string(),
            container_memory_limit: "256m".to_string(),
            container_cpu_limit: 0.5,
            container_pids_limit: 50,
            execution_timeout: 30,
            session_ttl: 3600,
            network_disabled: true,
            read_only: false,
            no_new_privileges: true,
            tmpfs_size: "64m".to_string(),
            api_host: "0.0.0.0".to_string(),
            api_port: 8000,
            environments_file: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_deployment_profile() {
        let settings = Settings::default();
        assert_eq!(settings.redis_url(), "redis://redis:6379/0");
        assert_eq!(settings.execution_timeout(), Duration::from_secs(30));
        assert_eq!(settings.task_soft_limit(), Duration::from_secs(40));
        assert_eq!(settings.task_hard_limit(), Duration::from_secs(60));
    }

    #[test]
    fn explicit_environments_file_wins() {
        let settings = Settings {
            environments_file: Some("/tmp/custom.yaml".to_string()),
            ..Settings::default()
        };
        assert_eq!(
            settings.environments_file_path(),
            Some(PathBuf::from("/tmp/custom.yaml"))
        );
    }
}
