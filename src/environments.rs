//! Execution environment registry.
//!
//! A static catalog of supported language environments, loaded once at
//! startup from `environments.yaml`. Each entry maps a language name to a
//! sandbox image and a run command template with named placeholders.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

/// Errors raised while loading the environment catalog.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("reading environments catalog: {0}")]
    Io(#[from] std::io::Error),

    #[error("parsing environments catalog: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Catalog-wide defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CatalogDefaults {
    /// Environment selected when a request does not name one.
    pub default_environment: String,
    /// Directory inside the sandbox where source files are written.
    pub workspace_dir: String,
    /// Non-root user that owns executions inside the sandbox.
    pub executor_user: String,
}

impl Default for CatalogDefaults {
    fn default() -> Self {
        Self {
            default_environment: "python".to_string(),
            workspace_dir: "/workspace".to_string(),
            executor_user: "executor".to_string(),
        }
    }
}

/// Configuration for a single execution environment.
#[derive(Debug, Clone)]
pub struct EnvironmentConfig {
    pub name: String,
    /// Image basename; the full name is `{prefix}-{image}`.
    pub image: String,
    pub default_filename: String,
    pub file_extension: String,
    /// Run command template with `{file_path}`, `{filename}` and
    /// `{output_path}` placeholders.
    pub run_command: String,
    /// Optional compile command template, same placeholders.
    pub compile_command: Option<String>,
    pub description: String,
    pub enabled: bool,
}

impl EnvironmentConfig {
    /// Full image name with the configured prefix applied.
    pub fn full_image_name(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.image)
    }

    /// Expand the run command template against a file path.
    pub fn run_command_argv(&self, file_path: &str) -> Vec<String> {
        expand_command_template(&self.run_command, file_path)
    }

    /// Expand the compile command template, if the environment has one.
    pub fn compile_command_argv(&self, file_path: &str) -> Option<Vec<String>> {
        self.compile_command
            .as_deref()
            .map(|template| expand_command_template(template, file_path))
    }
}

/// Expand a command template into an argv list.
///
/// Placeholders:
///   `{file_path}`   - full path to the file (e.g. /workspace/main.py)
///   `{filename}`    - just the filename (e.g. main.py)
///   `{output_path}` - path with the final extension stripped
///
/// A literal `sh -c ` prefix produces a three-element argv with the
/// remainder (minus surrounding quotes) as the single shell argument;
/// anything else is split on whitespace.
pub fn expand_command_template(template: &str, file_path: &str) -> Vec<String> {
    let filename = file_path.rsplit('/').next().unwrap_or(file_path);
    let output_path = match file_path.rfind('.') {
        Some(idx) => &file_path[..idx],
        None => file_path,
    };

    let cmd = template
        .replace("{file_path}", file_path)
        .replace("{filename}", filename)
        .replace("{output_path}", output_path);

    if let Some(rest) = cmd.strip_prefix("sh -c ") {
        let script = rest.trim_matches('"').trim_matches('\'');
        return vec!["sh".to_string(), "-c".to_string(), script.to_string()];
    }

    cmd.split_whitespace().map(str::to_string).collect()
}

/// Raw catalog entry as it appears in the YAML file.
#[derive(Debug, Clone, Deserialize)]
struct EnvironmentSpec {
    image: Option<String>,
    #[serde(default = "default_filename")]
    default_filename: String,
    #[serde(default = "default_extension")]
    file_extension: String,
    #[serde(default = "default_run_command")]
    run_command: String,
    #[serde(default)]
    compile_command: Option<String>,
    #[serde(default)]
    description: String,
    #[serde(default = "default_enabled")]
    enabled: bool,
}

fn default_filename() -> String {
    "main.py".to_string()
}

fn default_extension() -> String {
    ".py".to_string()
}

fn default_run_command() -> String {
    "python {file_path}".to_string()
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Default, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    defaults: CatalogDefaults,
    #[serde(default)]
    environments: BTreeMap<String, EnvironmentSpec>,
}

/// Descriptor exposed through the environments API.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EnvironmentDescriptor {
    pub name: String,
    pub description: String,
    pub file_extension: String,
}

/// Read-only catalog of execution environments.
#[derive(Debug, Clone)]
pub struct EnvironmentRegistry {
    environments: BTreeMap<String, EnvironmentConfig>,
    defaults: CatalogDefaults,
}

impl EnvironmentRegistry {
    /// Load the catalog from a YAML file.
    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let contents = std::fs::read_to_string(path)?;
        let file: CatalogFile = serde_yaml::from_str(&contents)?;

        let environments = file
            .environments
            .into_iter()
            .map(|(name, spec)| {
                let config = EnvironmentConfig {
                    image: spec.image.unwrap_or_else(|| name.clone()),
                    name: name.clone(),
                    default_filename: spec.default_filename,
                    file_extension: spec.file_extension,
                    run_command: spec.run_command,
                    compile_command: spec.compile_command,
                    description: spec.description,
                    enabled: spec.enabled,
                };
                (name, config)
            })
            .collect();

        Ok(Self {
            environments,
            defaults: file.defaults,
        })
    }

    /// Build a registry directly from entries (tests, embedded catalogs).
    pub fn from_parts(
        defaults: CatalogDefaults,
        entries: impl IntoIterator<Item = EnvironmentConfig>,
    ) -> Self {
        Self {
            environments: entries
                .into_iter()
                .map(|env| (env.name.clone(), env))
                .collect(),
            defaults,
        }
    }

    /// Names of enabled environments, in stable (sorted) order.
    pub fn list(&self) -> Vec<String> {
        self.environments
            .values()
            .filter(|env| env.enabled)
            .map(|env| env.name.clone())
            .collect()
    }

    /// API descriptors for enabled environments.
    pub fn descriptors(&self) -> Vec<EnvironmentDescriptor> {
        self.environments
            .values()
            .filter(|env| env.enabled)
            .map(|env| EnvironmentDescriptor {
                name: env.name.clone(),
                description: env.description.clone(),
                file_extension: env.file_extension.clone(),
            })
            .collect()
    }

    /// Look up an environment by name, enabled or not.
    pub fn get(&self, name: &str) -> Option<&EnvironmentConfig> {
        self.environments.get(name)
    }

    /// Look up an environment that can be selected for new work.
    pub fn get_enabled(&self, name: &str) -> Option<&EnvironmentConfig> {
        self.environments.get(name).filter(|env| env.enabled)
    }

    /// Catalog defaults.
    pub fn defaults(&self) -> &CatalogDefaults {
        &self.defaults
    }

    /// Resolve the full image name for an environment.
    pub fn resolve_image(&self, name: &str, prefix: &str) -> Option<String> {
        self.get(name).map(|env| env.full_image_name(prefix))
    }
}
