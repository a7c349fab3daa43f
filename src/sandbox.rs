//! Isolated command execution in throwaway containers.
//!
//! A [`Sandbox`] creates one container per call with the configured memory,
//! CPU and network limits, runs the command in it, and removes it again. The
//! container is owned by a guard, so it is torn down on every exit path,
//! including when the calling future is dropped by a timeout or
//! cancellation.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;

use crate::config::SandboxConfig;
use crate::util::{command_on_path, sanitize_output};

/// Exit status of a process killed by SIGKILL, which is what the kernel OOM
/// killer delivers inside a memory-limited container.
const OOM_EXIT_CODE: i32 = 137;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Sandbox unavailable: {0}")]
    Unavailable(String),

    #[error("Sandbox resource limit exceeded: {0}")]
    ResourceLimitExceeded(String),

    #[error("Sandbox execution failed: {0}")]
    Execution(String),
}

pub type SandboxResult<T> = Result<T, SandboxError>;

/// Limits and mounts for one container.
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxSpec {
    pub image: String,
    /// Host directory mounted at `work_dir`
    pub host_dir: PathBuf,
    pub work_dir: String,
    pub memory_limit: String,
    pub cpu_limit: f64,
    pub network_enabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Container runtime capability.
#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the runtime can be used on this host.
    async fn available(&self) -> bool;

    /// Create and start a container, returning its id.
    async fn create(&self, spec: &SandboxSpec) -> SandboxResult<String>;

    async fn exec(&self, id: &str, command: &[String]) -> SandboxResult<ExecOutput>;

    async fn remove(&self, id: &str) -> SandboxResult<()>;
}

/// Docker CLI runtime.
pub struct DockerRuntime {
    binary: String,
}

impl DockerRuntime {
    pub fn new() -> Self {
        Self {
            binary: "docker".to_string(),
        }
    }

    fn run_args(spec: &SandboxSpec) -> Vec<String> {
        vec![
            "run".to_string(),
            "-d".to_string(),
            "--rm".to_string(),
            "--memory".to_string(),
            spec.memory_limit.clone(),
            "--cpus".to_string(),
            spec.cpu_limit.to_string(),
            "--pids-limit".to_string(),
            "256".to_string(),
            "--network".to_string(),
            if spec.network_enabled { "bridge" } else { "none" }.to_string(),
            "--workdir".to_string(),
            spec.work_dir.clone(),
            "-v".to_string(),
            format!("{}:{}", spec.host_dir.display(), spec.work_dir),
            spec.image.clone(),
            "sleep".to_string(),
            "infinity".to_string(),
        ]
    }
}

impl Default for DockerRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SandboxRuntime for DockerRuntime {
    fn name(&self) -> &str {
        "docker"
    }

    async fn available(&self) -> bool {
        if !command_on_path(&self.binary) {
            return false;
        }
        matches!(
            Command::new(&self.binary)
                .args(["info", "--format", "{{.ServerVersion}}"])
                .output()
                .await,
            Ok(output) if output.status.success()
        )
    }

    async fn create(&self, spec: &SandboxSpec) -> SandboxResult<String> {
        let output = Command::new(&self.binary)
            .args(Self::run_args(spec))
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    SandboxError::Unavailable(format!("{} not found on PATH", self.binary))
                } else {
                    SandboxError::Unavailable(e.to_string())
                }
            })?;
        if !output.status.success() {
            return Err(SandboxError::Unavailable(format!(
                "container create failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if id.is_empty() {
            return Err(SandboxError::Unavailable(
                "container runtime returned no id".to_string(),
            ));
        }
        Ok(id)
    }

    async fn exec(&self, id: &str, command: &[String]) -> SandboxResult<ExecOutput> {
        if command.is_empty() {
            return Err(SandboxError::Execution("Empty command".to_string()));
        }
        let output = Command::new(&self.binary)
            .arg("exec")
            .arg(id)
            .args(command)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| SandboxError::Execution(e.to_string()))?;
        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: sanitize_output(&String::from_utf8_lossy(&output.stdout)),
            stderr: sanitize_output(&String::from_utf8_lossy(&output.stderr)),
        })
    }

    async fn remove(&self, id: &str) -> SandboxResult<()> {
        let output = Command::new(&self.binary)
            .args(["rm", "-f", id])
            .output()
            .await
            .map_err(|e| SandboxError::Execution(e.to_string()))?;
        if !output.status.success() {
            return Err(SandboxError::Execution(format!(
                "container remove failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

/// Removes its container when released or dropped.
struct ContainerGuard {
    runtime: Arc<dyn SandboxRuntime>,
    id: Option<String>,
}

impl ContainerGuard {
    fn id(&self) -> &str {
        self.id.as_deref().unwrap_or_default()
    }

    async fn release(mut self) {
        if let Some(id) = self.id.take() {
            if let Err(e) = self.runtime.remove(&id).await {
                tracing::warn!(container = %id, "Failed to remove sandbox container: {}", e);
            } else {
                tracing::debug!(container = %id, "Removed sandbox container");
            }
        }
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };
        // Dropped mid-call (timeout or cancellation): tear down in the background.
        let runtime = Arc::clone(&self.runtime);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    match runtime.remove(&id).await {
                        Ok(()) => tracing::debug!(container = %id, "Removed abandoned sandbox container"),
                        Err(e) => tracing::warn!(
                            container = %id,
                            "Failed to remove abandoned sandbox container: {}",
                            e
                        ),
                    }
                });
            }
            Err(_) => {
                tracing::warn!(container = %id, "No runtime to remove sandbox container");
            }
        }
    }
}

/// Configured sandbox: a runtime plus the limits every container gets.
#[derive(Clone)]
pub struct Sandbox {
    runtime: Arc<dyn SandboxRuntime>,
    config: SandboxConfig,
}

impl Sandbox {
    pub fn new(runtime: Arc<dyn SandboxRuntime>, config: SandboxConfig) -> Self {
        Self { runtime, config }
    }

    /// Docker-backed sandbox for the `[sandbox]` table.
    pub fn docker(config: SandboxConfig) -> Self {
        Self::new(Arc::new(DockerRuntime::new()), config)
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn runtime_name(&self) -> &str {
        self.runtime.name()
    }

    pub async fn available(&self) -> bool {
        self.runtime.available().await
    }

    /// Run `command` in a fresh container with `host_dir` mounted as the
    /// working directory.
    pub async fn run(&self, command: &[String], host_dir: &Path) -> SandboxResult<ExecOutput> {
        let spec = SandboxSpec {
            image: self.config.image.clone(),
            host_dir: host_dir.to_path_buf(),
            work_dir: self.config.work_dir.clone(),
            memory_limit: self.config.memory_limit.clone(),
            cpu_limit: self.config.cpu_limit,
            network_enabled: self.config.network_enabled,
        };

        let id = self.runtime.create(&spec).await?;
        tracing::debug!(
            container = %id,
            runtime = self.runtime.name(),
            image = %spec.image,
            "Created sandbox container"
        );
        let guard = ContainerGuard {
            runtime: Arc::clone(&self.runtime),
            id: Some(id),
        };

        let result = self.runtime.exec(guard.id(), command).await;
        guard.release().await;

        let output = result?;
        if output.exit_code == OOM_EXIT_CODE {
            return Err(SandboxError::ResourceLimitExceeded(format!(
                "process killed (exit {}), memory limit {}",
                OOM_EXIT_CODE, self.config.memory_limit
            )));
        }
        Ok(output)
    }
}
