//! Container engine types and input validation.

use std::collections::HashMap;

use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors from the container engine CLI.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine command failed.
    #[error("container {command} failed: {message}")]
    CommandFailed { command: String, message: String },

    /// Container was not found.
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// No container engine binary is available on this host.
    #[error("no container engine available (docker or podman)")]
    EngineUnavailable(String),

    /// Invalid input provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Generic IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Whether the error means the engine itself is unreachable, as opposed
    /// to a per-container failure. The dispatcher's availability probe keys
    /// off this.
    pub fn is_engine_unavailable(&self) -> bool {
        matches!(self, EngineError::EngineUnavailable(_))
    }
}

/// Specification for launching a session container.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    /// Container name.
    pub name: String,
    /// OCI image to run.
    pub image: String,
    /// Environment variables (credentials, model configuration).
    pub env: HashMap<String, String>,
    /// Volume mounts (host_path -> container_path).
    pub volumes: Vec<(String, String)>,
    /// Working directory inside the container.
    pub workdir: Option<String>,
    /// Command override.
    pub command: Vec<String>,
}

impl ContainerSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            ..Default::default()
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn volume(
        mut self,
        host_path: impl Into<String>,
        container_path: impl Into<String>,
    ) -> Self {
        self.volumes.push((host_path.into(), container_path.into()));
        self
    }

    pub fn workdir(mut self, workdir: impl Into<String>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    /// Validate all fields before the spec reaches the engine CLI.
    pub fn validate(&self) -> EngineResult<()> {
        validate_image_name(&self.image)?;
        validate_container_name(&self.name)?;
        for key in self.env.keys() {
            validate_env_var_key(key)?;
        }
        for (host_path, container_path) in &self.volumes {
            validate_mount_path(host_path, "host")?;
            validate_mount_path(container_path, "container")?;
        }
        if let Some(ref workdir) = self.workdir {
            if !workdir.starts_with('/') {
                return Err(EngineError::InvalidInput(
                    "workdir must be an absolute path".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Validate an OCI image name: `[registry/][namespace/]name[:tag][@digest]`.
pub fn validate_image_name(image: &str) -> EngineResult<()> {
    if image.is_empty() || image.len() > 256 {
        return Err(EngineError::InvalidInput(
            "image name must be 1..=256 characters".to_string(),
        ));
    }
    let valid = |c: char| {
        c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '/' | ':' | '@')
    };
    if !image.chars().all(valid) || image.contains("..") {
        return Err(EngineError::InvalidInput(format!(
            "image name '{}' contains invalid characters",
            image
        )));
    }
    Ok(())
}

/// Validate a container name: alphanumeric plus `-`/`_`, not starting with
/// a dash.
pub fn validate_container_name(name: &str) -> EngineResult<()> {
    if name.is_empty() || name.len() > 128 {
        return Err(EngineError::InvalidInput(
            "container name must be 1..=128 characters".to_string(),
        ));
    }
    let first = name.chars().next().unwrap_or(' ');
    if !first.is_ascii_alphanumeric() && first != '_' {
        return Err(EngineError::InvalidInput(
            "container name must start with an alphanumeric character or underscore".to_string(),
        ));
    }
    let valid = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_';
    if !name.chars().all(valid) {
        return Err(EngineError::InvalidInput(format!(
            "container name '{}' contains invalid characters",
            name
        )));
    }
    Ok(())
}

fn validate_env_var_key(key: &str) -> EngineResult<()> {
    if key.is_empty() || key.len() > 256 {
        return Err(EngineError::InvalidInput(
            "environment variable key must be 1..=256 characters".to_string(),
        ));
    }
    let first = key.chars().next().unwrap_or(' ');
    if !first.is_ascii_alphabetic() && first != '_' {
        return Err(EngineError::InvalidInput(format!(
            "environment variable key '{}' must start with a letter or underscore",
            key
        )));
    }
    let valid = |c: char| c.is_ascii_alphanumeric() || c == '_';
    if !key.chars().all(valid) {
        return Err(EngineError::InvalidInput(format!(
            "environment variable key '{}' contains invalid characters",
            key
        )));
    }
    Ok(())
}

fn validate_mount_path(path: &str, side: &str) -> EngineResult<()> {
    if path.is_empty() || path.len() > 4096 {
        return Err(EngineError::InvalidInput(format!(
            "{} mount path must be 1..=4096 characters",
            side
        )));
    }
    const DANGEROUS: &[char] = &[
        '\0', '$', '`', '!', '&', '|', ';', '<', '>', '(', ')', '{', '}', '[', ']', '*', '?',
        '\\', '"', '\'', '\n', '\r',
    ];
    if path.contains(DANGEROUS) {
        return Err(EngineError::InvalidInput(format!(
            "{} mount path contains shell metacharacters",
            side
        )));
    }
    Ok(())
}
