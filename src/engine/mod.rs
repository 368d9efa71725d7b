//! Local container engine.
//!
//! Async interface to a container engine via the Docker or Podman CLI,
//! auto-detected at construction. `ping()` is the liveness signal the
//! dispatcher's availability probe relies on.

mod types;

pub use types::{ContainerSpec, EngineError, EngineResult};

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

/// Engine flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EngineKind {
    Docker,
    #[default]
    Podman,
}

impl EngineKind {
    fn binary(&self) -> &'static str {
        match self {
            EngineKind::Docker => "docker",
            EngineKind::Podman => "podman",
        }
    }

    /// Podman bind mounts need SELinux relabeling.
    fn needs_selinux_labels(&self) -> bool {
        matches!(self, EngineKind::Podman)
    }
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.binary())
    }
}

/// Container engine operations used by the local backend.
///
/// Trait-shaped so tests can substitute a mock engine.
#[async_trait]
pub trait EngineApi: Send + Sync {
    /// Lightweight connectivity + capability check.
    async fn ping(&self) -> EngineResult<()>;

    /// Create and start a container, returning its ID.
    async fn create_container(&self, spec: &ContainerSpec) -> EngineResult<String>;

    async fn stop_container(&self, id_or_name: &str, timeout_seconds: Option<u32>)
        -> EngineResult<()>;

    async fn remove_container(&self, id_or_name: &str, force: bool) -> EngineResult<()>;

    async fn pause_container(&self, id_or_name: &str) -> EngineResult<()>;

    async fn unpause_container(&self, id_or_name: &str) -> EngineResult<()>;

    /// State status string ("running", "exited", ...); `None` when the
    /// container does not exist.
    async fn container_state_status(&self, id_or_name: &str) -> EngineResult<Option<String>>;

    /// Recent container output, for startup diagnostics.
    async fn container_logs(&self, id_or_name: &str, tail: Option<u32>) -> EngineResult<String>;

    /// Run a command inside the container, fire-and-forget.
    async fn exec_detached(&self, id_or_name: &str, command: &[&str]) -> EngineResult<()>;

    /// Run a command inside the container and return stdout.
    async fn exec_output(&self, id_or_name: &str, command: &[&str]) -> EngineResult<String>;
}

/// CLI-backed container engine.
#[derive(Debug, Clone)]
pub struct ContainerEngine {
    kind: EngineKind,
    binary: String,
}

impl Default for ContainerEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerEngine {
    /// Auto-detect the available engine. Prefers podman, falls back to
    /// docker; when neither is in PATH the instance is created anyway and
    /// every call (including `ping`) fails with `EngineUnavailable`.
    pub fn new() -> Self {
        if Self::is_binary_available("podman") {
            Self::with_kind(EngineKind::Podman)
        } else if Self::is_binary_available("docker") {
            Self::with_kind(EngineKind::Docker)
        } else {
            Self::with_kind(EngineKind::default())
        }
    }

    pub fn with_kind(kind: EngineKind) -> Self {
        Self {
            binary: kind.binary().to_string(),
            kind,
        }
    }

    pub fn kind(&self) -> EngineKind {
        self.kind
    }

    fn is_binary_available(name: &str) -> bool {
        std::process::Command::new("which")
            .arg(name)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    fn validate_id_or_name(id: &str) -> EngineResult<()> {
        if id.is_empty() || id.len() > 128 {
            return Err(EngineError::InvalidInput(
                "container ID or name must be 1..=128 characters".to_string(),
            ));
        }
        let valid = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_';
        if !id.chars().all(valid) {
            return Err(EngineError::InvalidInput(format!(
                "container ID or name '{}' contains invalid characters",
                id
            )));
        }
        Ok(())
    }

    async fn run(&self, command: &str, args: &[String]) -> EngineResult<std::process::Output> {
        Command::new(&self.binary)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    EngineError::EngineUnavailable(format!("{} binary not found", self.binary))
                } else {
                    EngineError::CommandFailed {
                        command: command.to_string(),
                        message: e.to_string(),
                    }
                }
            })
    }

    async fn run_checked(&self, command: &str, args: &[String]) -> EngineResult<String> {
        let output = self.run(command, args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Self::command_error(command, &stderr));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Classify a failed CLI invocation. Both docker and podman report a
    /// missing target with a "no such container" message.
    fn command_error(command: &str, stderr: &str) -> EngineError {
        let message = stderr.trim().to_string();
        if message.to_ascii_lowercase().contains("no such container") {
            EngineError::ContainerNotFound(message)
        } else {
            EngineError::CommandFailed {
                command: command.to_string(),
                message,
            }
        }
    }
}

#[async_trait]
impl EngineApi for ContainerEngine {
    async fn ping(&self) -> EngineResult<()> {
        let output = self
            .run("ping", &["version".to_string(), "--format".to_string(), "json".to_string()])
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EngineError::EngineUnavailable(stderr.trim().to_string()));
        }
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> EngineResult<String> {
        spec.validate()?;

        let mut args: Vec<String> = vec!["run".to_string(), "-d".to_string()];

        args.push("--name".to_string());
        args.push(spec.name.clone());

        for (host, container) in &spec.volumes {
            args.push("-v".to_string());
            if self.kind.needs_selinux_labels() {
                args.push(format!("{}:{}:Z", host, container));
            } else {
                args.push(format!("{}:{}", host, container));
            }
        }

        for (key, value) in &spec.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }

        if let Some(ref workdir) = spec.workdir {
            args.push("-w".to_string());
            args.push(workdir.clone());
        }

        args.push(spec.image.clone());
        args.extend(spec.command.iter().cloned());

        let stdout = self.run_checked("run", &args).await?;
        Ok(stdout.trim().to_string())
    }

    async fn stop_container(
        &self,
        id_or_name: &str,
        timeout_seconds: Option<u32>,
    ) -> EngineResult<()> {
        Self::validate_id_or_name(id_or_name)?;

        let mut args: Vec<String> = vec!["stop".to_string()];
        if let Some(t) = timeout_seconds {
            args.push("-t".to_string());
            args.push(t.to_string());
        }
        args.push(id_or_name.to_string());

        self.run_checked("stop", &args).await?;
        Ok(())
    }

    async fn remove_container(&self, id_or_name: &str, force: bool) -> EngineResult<()> {
        Self::validate_id_or_name(id_or_name)?;

        let mut args: Vec<String> = vec!["rm".to_string()];
        if force {
            args.push("-f".to_string());
        }
        args.push(id_or_name.to_string());

        self.run_checked("rm", &args).await?;
        Ok(())
    }

    async fn pause_container(&self, id_or_name: &str) -> EngineResult<()> {
        Self::validate_id_or_name(id_or_name)?;
        self.run_checked("pause", &["pause".to_string(), id_or_name.to_string()])
            .await?;
        Ok(())
    }

    async fn unpause_container(&self, id_or_name: &str) -> EngineResult<()> {
        Self::validate_id_or_name(id_or_name)?;
        self.run_checked("unpause", &["unpause".to_string(), id_or_name.to_string()])
            .await?;
        Ok(())
    }

    async fn container_state_status(&self, id_or_name: &str) -> EngineResult<Option<String>> {
        Self::validate_id_or_name(id_or_name)?;

        let output = self
            .run(
                "inspect",
                &[
                    "inspect".to_string(),
                    "--format".to_string(),
                    "{{.State.Status}}".to_string(),
                    id_or_name.to_string(),
                ],
            )
            .await?;

        // Missing container is not an error; callers treat it as absent.
        if !output.status.success() {
            return Ok(None);
        }

        let status = String::from_utf8_lossy(&output.stdout)
            .trim()
            .trim_matches('"')
            .to_string();
        if status.is_empty() {
            return Ok(None);
        }
        Ok(Some(status))
    }

    async fn container_logs(&self, id_or_name: &str, tail: Option<u32>) -> EngineResult<String> {
        Self::validate_id_or_name(id_or_name)?;

        let mut args: Vec<String> = vec!["logs".to_string()];
        if let Some(n) = tail {
            args.push("--tail".to_string());
            args.push(n.to_string());
        }
        args.push(id_or_name.to_string());

        let output = self.run("logs", &args).await?;
        // container stderr arrives on our stderr
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        Ok(format!("{}{}", stdout, stderr))
    }

    async fn exec_detached(&self, id_or_name: &str, command: &[&str]) -> EngineResult<()> {
        Self::validate_id_or_name(id_or_name)?;

        let mut args: Vec<String> = vec!["exec".to_string(), "-d".to_string(), id_or_name.to_string()];
        args.extend(command.iter().map(|s| s.to_string()));

        self.run_checked("exec", &args).await?;
        Ok(())
    }

    async fn exec_output(&self, id_or_name: &str, command: &[&str]) -> EngineResult<String> {
        Self::validate_id_or_name(id_or_name)?;

        let mut args: Vec<String> = vec!["exec".to_string(), id_or_name.to_string()];
        args.extend(command.iter().map(|s| s.to_string()));

        self.run_checked("exec", &args).await
    }
}
