/// Docker Sandbox - Container-Isolated Execution
///
/// **Isolation Rules:**
/// 1. Pulls the language image if it is not present locally
///    (one pull per image at a time, bounded by a timeout)
/// 2. Creates a container with:
///    - Network mode `none`
///    - Memory (no swap), nano-CPU and pid limits
///    - Read-only root filesystem, no-new-privileges, all capabilities dropped
///    - Workspace bind-mounted read-only at /app, its scratch dir writable at /tmp
/// 3. Runs only the supplied argv, no shell
/// 4. Streams stdout/stderr with a per-stream cap
/// 5. Kills the container on timeout or output flood
/// 6. Removes the container afterwards through a Drop guard

use super::{CappedBuffer, Layout, Sandbox, SandboxOutput, SandboxRequest};
use crate::workspace::Workspace;
use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerWaitResponse, HostConfig};
use bollard::Docker;
use futures_util::stream::StreamExt;
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

const CONTAINER_WORKDIR: &str = "/app";
const CONTAINER_SCRATCH: &str = "/tmp";
const IMAGE_PULL_TIMEOUT: Duration = Duration::from_secs(300);

/// Guarantees container removal even if the run is cancelled or panics.
struct ContainerGuard {
    docker: Docker,
    container_id: String,
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        let docker = self.docker.clone();
        let container_id = std::mem::take(&mut self.container_id);

        tokio::spawn(async move {
            let options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };
            if let Err(e) = docker.remove_container(&container_id, Some(options)).await {
                warn!(container = %container_id, error = %e, "Failed to remove container");
            }
        });
    }
}

/// How the container run ended, before output is assembled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Completion {
    Exited(i64),
    Flooded,
    TimedOut,
}

impl Completion {
    /// The container may still be running.
    fn needs_kill(self) -> bool {
        !matches!(self, Completion::Exited(_))
    }
}

fn exit_note(code: i64) -> Option<&'static str> {
    match code {
        137 => Some("[Container killed: likely OOM or exceeded memory limit]"),
        139 => Some("[Container killed: segmentation fault]"),
        _ => None,
    }
}

/// Exit code from the first wait response.
fn wait_status(response: Option<Result<ContainerWaitResponse, bollard::errors::Error>>) -> i64 {
    match response {
        Some(Ok(response)) => response.status_code,
        // bollard reports a non-zero exit as an error carrying the code
        Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => code,
        Some(Err(e)) => {
            warn!(error = %e, "Failed to wait for container");
            1
        }
        None => {
            warn!("No wait response from container");
            1
        }
    }
}

fn settle(
    completion: Completion,
    stdout: String,
    mut stderr: String,
    timeout: Duration,
) -> SandboxOutput {
    match completion {
        Completion::Exited(code) => {
            if let Some(note) = exit_note(code) {
                stderr.push('\n');
                stderr.push_str(note);
            }
            SandboxOutput {
                stdout,
                stderr,
                exit_code: code,
            }
        }
        Completion::Flooded => SandboxOutput::output_exceeded(stdout, stderr),
        Completion::TimedOut => SandboxOutput::timed_out(stdout, stderr, timeout),
    }
}

/// Images known to be present, one cell per image so a slow pull only
/// blocks runs that need that image. A failed or timed-out fetch leaves
/// the cell empty and the next run tries again.
struct ImageCache {
    cells: Mutex<HashMap<String, Arc<OnceCell<()>>>>,
    pull_timeout: Duration,
}

impl ImageCache {
    fn new(pull_timeout: Duration) -> Self {
        Self {
            cells: Mutex::new(HashMap::new()),
            pull_timeout,
        }
    }

    async fn ensure<F, Fut>(&self, image: &str, fetch: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let cell = self
            .cells
            .lock()
            .await
            .entry(image.to_string())
            .or_default()
            .clone();

        cell.get_or_try_init(|| async {
            tokio::time::timeout(self.pull_timeout, fetch())
                .await
                .with_context(|| {
                    format!(
                        "Timed out after {}s pulling Docker image '{}'",
                        self.pull_timeout.as_secs(),
                        image
                    )
                })?
        })
        .await?;
        Ok(())
    }
}

pub struct DockerSandbox {
    docker: Docker,
    pids_limit: i64,
    images: ImageCache,
}

impl DockerSandbox {
    pub fn new(pids_limit: i64) -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().context("Failed to connect to Docker daemon")?;
        Ok(Self {
            docker,
            pids_limit,
            images: ImageCache::new(IMAGE_PULL_TIMEOUT),
        })
    }

    /// Startup health check.
    pub async fn ping(&self) -> Result<()> {
        self.docker
            .ping()
            .await
            .context("Docker daemon did not answer ping")?;
        Ok(())
    }

    /// Ensure the image is available locally, pulling it at most once per process.
    pub async fn ensure_image(&self, image: &str) -> Result<()> {
        self.images.ensure(image, || self.fetch_image(image)).await
    }

    async fn fetch_image(&self, image: &str) -> Result<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            debug!(image, "Image cache hit");
            return Ok(());
        }

        warn!(image, "Image cache miss, pulling");
        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });
        let mut stream = self.docker.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            result.with_context(|| format!("Failed to pull Docker image '{}'", image))?;
        }

        info!(image, "Image pulled");
        Ok(())
    }

    fn container_config(&self, request: &SandboxRequest<'_>) -> Config<String> {
        let workspace = request.workspace;
        let memory_bytes = i64::from(request.memory_limit_mb) * 1024 * 1024;
        let nano_cpus = (f64::from(request.cpu_limit) * 1_000_000_000.0) as i64;

        let env: Vec<String> = request
            .command
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        Config {
            image: Some(request.image.to_string()),
            cmd: Some(request.command.argv.clone()),
            env: Some(env),
            working_dir: Some(CONTAINER_WORKDIR.to_string()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            network_disabled: Some(true),
            host_config: Some(HostConfig {
                memory: Some(memory_bytes),
                memory_swap: Some(memory_bytes),
                nano_cpus: Some(nano_cpus),
                pids_limit: Some(self.pids_limit),
                network_mode: Some("none".to_string()),
                readonly_rootfs: Some(true),
                security_opt: Some(vec!["no-new-privileges".to_string()]),
                cap_drop: Some(vec!["ALL".to_string()]),
                binds: Some(vec![
                    format!("{}:{}:ro", workspace.host_path().display(), CONTAINER_WORKDIR),
                    format!(
                        "{}:{}:rw",
                        workspace.host_scratch_dir().display(),
                        CONTAINER_SCRATCH
                    ),
                ]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    async fn run_container(&self, request: &SandboxRequest<'_>) -> Result<SandboxOutput> {
        self.ensure_image(request.image).await?;

        let container_name = format!("blankcode-{}", Uuid::new_v4());
        let create_options = CreateContainerOptions {
            name: container_name.as_str(),
            platform: None,
        };
        let container = self
            .docker
            .create_container(Some(create_options), self.container_config(request))
            .await
            .context("Failed to create Docker container")?;

        let container_id = container.id.clone();
        let _guard = ContainerGuard {
            docker: self.docker.clone(),
            container_id: container_id.clone(),
        };

        let started = Instant::now();
        self.docker
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
            .context("Failed to start Docker container")?;

        let mut stdout = CappedBuffer::default();
        let mut stderr = CappedBuffer::default();

        let execution = async {
            let logs_options = Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                follow: true,
                ..Default::default()
            });
            let mut logs = self.docker.logs(&container_id, logs_options);

            while let Some(chunk) = logs.next().await {
                let within_cap = match chunk {
                    Ok(LogOutput::StdOut { message }) => stdout.push(&message),
                    Ok(LogOutput::StdErr { message }) => stderr.push(&message),
                    Ok(_) => true,
                    Err(e) => {
                        warn!(container = %container_id, error = %e, "Error reading container logs");
                        break;
                    }
                };
                if !within_cap {
                    return Completion::Flooded;
                }
            }

            let wait_options = Some(WaitContainerOptions {
                condition: "not-running",
            });
            let mut wait = self.docker.wait_container(&container_id, wait_options);
            Completion::Exited(wait_status(wait.next().await))
        };

        let completion = tokio::time::timeout(request.timeout, execution)
            .await
            .unwrap_or(Completion::TimedOut);
        if completion.needs_kill() {
            self.kill(&container_id).await;
        }
        let output = settle(
            completion,
            stdout.into_string(),
            stderr.into_string(),
            request.timeout,
        );

        debug!(
            container = %container_id,
            exit_code = output.exit_code,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Container finished"
        );
        Ok(output)
    }

    async fn kill(&self, container_id: &str) {
        if let Err(e) = self
            .docker
            .kill_container(container_id, None::<KillContainerOptions<String>>)
            .await
        {
            warn!(container = %container_id, error = %e, "Failed to kill container");
        }
    }
}

#[async_trait]
impl Sandbox for DockerSandbox {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn layout(&self, _workspace: &Workspace) -> Layout {
        Layout {
            workdir: PathBuf::from(CONTAINER_WORKDIR),
            scratch: PathBuf::from(CONTAINER_SCRATCH),
            isolated: true,
        }
    }

    #[instrument(skip_all, fields(image = request.image, command = %request.command.display()))]
    async fn run(&self, request: SandboxRequest<'_>) -> SandboxOutput {
        match self.run_container(&request).await {
            Ok(output) => output,
            Err(e) => {
                warn!(error = %format!("{:#}", e), "Container run failed");
                SandboxOutput::spawn_failure(String::new(), format!("{:#}", e))
            }
        }
    }
}
