use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::errors::Error as BollardError;
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptions, CreateImageOptions, InspectContainerOptions, KillContainerOptions,
    LogsOptions, RemoveContainerOptions, StartContainerOptions, StatsOptions, WaitContainerOptions,
};
use bollard::Docker;
use futures_util::StreamExt;
use std::collections::HashMap;
use tracing::{debug, info};

use super::container::{CapturedOutput, ContainerRuntime, ContainerSpec, RuntimeError};
use crate::assembler::{append_capped, split_combined_output};

const EXECUTION_LABEL: &str = "polyglot-sandbox.execution-id";

/// Container runtime backed by the local Docker Engine API
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect using DOCKER_HOST or the platform's default socket
    pub fn connect() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }

    pub fn with_client(docker: Docker) -> Self {
        Self { docker }
    }
}

/// 404 and 409 mean the container is already gone or already stopped
fn is_benign(error: &BollardError) -> bool {
    matches!(
        error,
        BollardError::DockerResponseServerError { status_code, .. } if *status_code == 404 || *status_code == 409
    )
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn ping(&self) -> Result<(), RuntimeError> {
        self.docker.ping().await?;
        Ok(())
    }

    async fn ensure_image(&self, image: &str) -> Result<(), RuntimeError> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        info!("Pulling image {}", image);
        let options = CreateImageOptions {
            from_image: Some(image.to_string()),
            ..Default::default()
        };
        let mut progress = self.docker.create_image(Some(options), None, None);
        while let Some(step) = progress.next().await {
            step?;
        }
        info!("Pulled image {}", image);
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let mut tmpfs = HashMap::new();
        tmpfs.insert(
            "/tmp".to_string(),
            format!("rw,exec,nosuid,size={}m", spec.tmpfs_size_mb),
        );

        let host_config = HostConfig {
            binds: Some(vec![format!(
                "{}:{}:ro",
                spec.host_dir.display(),
                spec.working_dir
            )]),
            memory: Some(spec.memory_limit_bytes),
            // Equal to memory: no swap
            memory_swap: Some(spec.memory_limit_bytes),
            cpu_period: Some(spec.cpu_period_us),
            cpu_quota: Some(spec.cpu_quota_us),
            pids_limit: Some(spec.pids_limit),
            network_mode: Some("none".to_string()),
            readonly_rootfs: Some(true),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            tmpfs: Some(tmpfs),
            auto_remove: Some(false),
            ..Default::default()
        };

        let mut labels = HashMap::new();
        labels.insert(EXECUTION_LABEL.to_string(), spec.execution_id.clone());

        let body = ContainerCreateBody {
            image: Some(spec.image.clone()),
            cmd: Some(spec.command.clone()),
            working_dir: Some(spec.working_dir.clone()),
            env: Some(spec.env.clone()),
            user: Some(spec.user.clone()),
            labels: Some(labels),
            network_disabled: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            open_stdin: Some(false),
            tty: Some(false),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: Some(spec.name.clone()),
            ..Default::default()
        };

        let response = self.docker.create_container(Some(options), body).await?;
        debug!(container = %response.id, image = %spec.image, "Created container");
        Ok(response.id)
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .start_container(id, None::<StartContainerOptions>)
            .await?;
        Ok(())
    }

    async fn wait(&self, id: &str) -> Result<i64, RuntimeError> {
        let mut stream = self.docker.wait_container(id, None::<WaitContainerOptions>);
        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // Non-zero exits surface as this error variant
            Some(Err(BollardError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(e.into()),
            None => Err(RuntimeError::Other(
                "wait stream ended before the container exited".to_string(),
            )),
        }
    }

    async fn collect_output(&self, id: &str, limit: usize) -> Result<CapturedOutput, RuntimeError> {
        let options = LogsOptions {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        };

        let mut stream = self.docker.logs(id, Some(options));
        let mut output = CapturedOutput::default();

        while let Some(frame) = stream.next().await {
            let (stdout, stderr) = match frame? {
                LogOutput::StdOut { message } => (String::from_utf8_lossy(&message).into_owned(), String::new()),
                LogOutput::StdErr { message } => (String::new(), String::from_utf8_lossy(&message).into_owned()),
                // Unframed output: fall back to the line heuristic
                LogOutput::Console { message } => split_combined_output(&String::from_utf8_lossy(&message)),
                LogOutput::StdIn { .. } => continue,
            };

            // The limit covers both streams together
            let stderr_len = output.stderr.len();
            let fits = append_capped(&mut output.stdout, &stdout, limit.saturating_sub(stderr_len));
            let stdout_len = output.stdout.len();
            let fits = fits && append_capped(&mut output.stderr, &stderr, limit.saturating_sub(stdout_len));

            if !fits {
                output.truncated = true;
                debug!(container = %id, "Output limit of {} bytes reached", limit);
                break;
            }
        }

        Ok(output)
    }

    async fn memory_usage(&self, id: &str) -> Result<u64, RuntimeError> {
        let options = StatsOptions {
            stream: false,
            one_shot: true,
            ..Default::default()
        };
        let mut stream = self.docker.stats(id, Some(options));
        match stream.next().await {
            Some(Ok(stats)) => Ok(stats
                .memory_stats
                .map(|memory| {
                    memory
                        .usage
                        .unwrap_or(0)
                        .max(memory.max_usage.unwrap_or(0))
                })
                .unwrap_or(0)),
            Some(Err(e)) => Err(e.into()),
            None => Ok(0),
        }
    }

    async fn oom_killed(&self, id: &str) -> Result<bool, RuntimeError> {
        let details = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await?;
        Ok(details
            .state
            .and_then(|state| state.oom_killed)
            .unwrap_or(false))
    }

    async fn kill(&self, id: &str) -> Result<(), RuntimeError> {
        match self
            .docker
            .kill_container(id, None::<KillContainerOptions>)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_benign(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(&self, id: &str) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        match self.docker.remove_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_benign(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
