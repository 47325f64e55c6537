//! Container runtime.
//!
//! Every invocation gets a fresh container from the configured image with the
//! workspace bind-mounted read-write as the only writable path: the root
//! filesystem is read-only, there is no `/tmp` tmpfs and no IPC namespace
//! (so no `/dev/shm`). Networking is off, all capabilities are dropped and
//! memory/CPU/pid limits apply. The container is force-removed when the run
//! ends, times out, or its future is dropped; in the last case the removal
//! task is handed to the invocation's [`Lifecycle`] so the caller can await it.

use std::path::Path;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures::StreamExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Invocation, IsolationRuntime, Lifecycle, RawOutput};
use crate::error::{Result, SandboxError};
use crate::sandbox::config::DockerConfig;
use crate::sandbox::io::BoundedOutput;
use crate::sandbox::workspace::GUEST_WORKSPACE;

/// Runs Python in throwaway containers through the Docker API.
pub struct DockerRuntime {
    docker: Docker,
    config: DockerConfig,
}

impl DockerRuntime {
    /// Connect to the local Docker daemon. No request is made until the
    /// first run or [`health_check`](IsolationRuntime::health_check).
    pub fn connect(config: DockerConfig) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker, config })
    }

    /// Pull the configured image if the daemon does not have it yet.
    pub async fn ensure_image(&self) -> Result<()> {
        if self.docker.inspect_image(&self.config.image).await.is_ok() {
            return Ok(());
        }

        info!(image = %self.config.image, "pulling image");
        let options = CreateImageOptions {
            from_image: self.config.image.clone(),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            if let Some(status) = progress?.status {
                debug!(status = %status, "pull progress");
            }
        }
        Ok(())
    }

    /// Create the container, pulling the image first if the daemon does not
    /// know it.
    async fn create_container(&self, name: &str, config: Config<String>) -> Result<()> {
        let options = || {
            Some(CreateContainerOptions {
                name,
                platform: None,
            })
        };
        match self.docker.create_container(options(), config.clone()).await {
            Ok(_) => Ok(()),
            Err(e) if is_missing_image(&e) => {
                info!(image = %self.config.image, "image not present, pulling before first run");
                self.ensure_image().await?;
                self.docker.create_container(options(), config).await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn wait_for_exit(&self, name: &str) -> Result<i64> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut stream = self.docker.wait_container(name, Some(options));

        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // Non-zero exits surface as an error carrying the status code.
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(SandboxError::Docker(e)),
            None => Err(SandboxError::ExecutionFailed(
                "container wait stream ended unexpectedly".to_string(),
            )),
        }
    }

    async fn collect_logs(&self, name: &str) -> (String, String) {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        let mut stream = self.docker.logs(name, Some(options));

        let mut stdout = BoundedOutput::default();
        let mut stderr = BoundedOutput::default();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(LogOutput::StdOut { message }) => stdout.push_bytes(&message),
                Ok(LogOutput::StdErr { message }) => stderr.push_bytes(&message),
                Ok(_) => {}
                Err(e) => {
                    warn!(container = %name, error = %e, "error reading container logs");
                    break;
                }
            }
        }

        (stdout.into_string(), stderr.into_string())
    }
}

#[async_trait]
impl IsolationRuntime for DockerRuntime {
    fn name(&self) -> &str {
        "docker"
    }

    async fn run_python(&self, invocation: Invocation) -> Result<RawOutput> {
        let name = format!("code-sandbox-{}", Uuid::new_v4().simple());
        let config = container_config(&self.config, &invocation)?;

        self.create_container(&name, config).await?;
        let container = ContainerGuard::new(
            self.docker.clone(),
            name.clone(),
            invocation.lifecycle.clone(),
        );
        debug!(container = %name, "container created");

        self.docker
            .start_container(&name, None::<StartContainerOptions<String>>)
            .await?;
        invocation.lifecycle.mark_started();

        let exit_code = match tokio::time::timeout(invocation.timeout, self.wait_for_exit(&name)).await {
            Ok(Ok(code)) => code,
            Ok(Err(e)) => {
                container.release().await;
                return Err(e);
            }
            Err(_) => {
                warn!(container = %name, timeout = ?invocation.timeout, "execution timed out");
                container.release().await;
                return Err(SandboxError::Timeout(invocation.timeout));
            }
        };

        let (stdout, stderr) = self.collect_logs(&name).await;
        container.release().await;

        Ok(RawOutput {
            stdout,
            stderr,
            exit_code,
        })
    }

    async fn health_check(&self) -> Result<()> {
        self.docker.ping().await?;
        self.ensure_image().await
    }
}

/// Force-removes its container when released or dropped.
struct ContainerGuard {
    docker: Docker,
    name: Option<String>,
    lifecycle: Lifecycle,
}

impl ContainerGuard {
    fn new(docker: Docker, name: String, lifecycle: Lifecycle) -> Self {
        Self {
            docker,
            name: Some(name),
            lifecycle,
        }
    }

    async fn release(mut self) {
        if let Some(name) = self.name.take() {
            remove_container(&self.docker, &name).await;
        }
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        let Some(name) = self.name.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let docker = self.docker.clone();
                let removal = handle.spawn(async move { remove_container(&docker, &name).await });
                self.lifecycle.defer_cleanup(removal);
            }
            Err(_) => warn!(container = %name, "no runtime to remove abandoned container"),
        }
    }
}

async fn remove_container(docker: &Docker, name: &str) {
    let options = RemoveContainerOptions {
        force: true,
        v: true,
        ..Default::default()
    };
    match docker.remove_container(name, Some(options)).await {
        Ok(()) => debug!(container = %name, "container removed"),
        Err(e) => warn!(container = %name, error = %e, "failed to remove container"),
    }
}

/// The daemon answers container creation with 404 when the image is absent.
fn is_missing_image(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

/// Container settings for one invocation.
fn container_config(config: &DockerConfig, invocation: &Invocation) -> Result<Config<String>> {
    let host_dir = invocation.workspace.to_str().ok_or_else(|| {
        SandboxError::ExecutionFailed(format!(
            "workspace path is not valid UTF-8: {}",
            invocation.workspace.display()
        ))
    })?;

    let network_mode = if config.network_disabled {
        Some("none".to_string())
    } else {
        None
    };

    let host_config = HostConfig {
        binds: Some(vec![format!("{host_dir}:{GUEST_WORKSPACE}:rw")]),
        memory: config.memory_limit,
        memory_swap: config.memory_limit,
        nano_cpus: config.cpu_limit.map(|cpus| (cpus * 1_000_000_000.0) as i64),
        pids_limit: config.pids_limit,
        network_mode,
        ipc_mode: Some("none".to_string()),
        readonly_rootfs: Some(true),
        cap_drop: Some(vec!["ALL".to_string()]),
        security_opt: Some(vec!["no-new-privileges".to_string()]),
        auto_remove: Some(false),
        ..Default::default()
    };

    // Everything Python or matplotlib wants to write (config, font cache,
    // tempfile) goes under the workspace. Only top-level PNGs are collected.
    Ok(Config {
        image: Some(config.image.clone()),
        cmd: Some(vec![
            "python".to_string(),
            format!("{GUEST_WORKSPACE}/{}", invocation.script),
        ]),
        env: Some(vec![
            "MPLBACKEND=Agg".to_string(),
            format!("MPLCONFIGDIR={GUEST_WORKSPACE}/.matplotlib"),
            format!("HOME={GUEST_WORKSPACE}"),
            format!("TMPDIR={GUEST_WORKSPACE}"),
            "PYTHONDONTWRITEBYTECODE=1".to_string(),
            "PYTHONUNBUFFERED=1".to_string(),
        ]),
        working_dir: Some(GUEST_WORKSPACE.to_string()),
        user: workspace_owner(&invocation.workspace),
        network_disabled: Some(config.network_disabled),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        host_config: Some(host_config),
        ..Default::default()
    })
}

/// Run the container as the owner of the workspace so its files stay
/// removable by this process.
#[cfg(unix)]
fn workspace_owner(path: &Path) -> Option<String> {
    use std::os::unix::fs::MetadataExt;

    let metadata = std::fs::metadata(path).ok()?;
    Some(format!("{}:{}", metadata.uid(), metadata.gid()))
}

#[cfg(not(unix))]
fn workspace_owner(_path: &Path) -> Option<String> {
    None
}
