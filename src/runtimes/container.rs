use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::assembler::TRUNCATION_MARKER;
use crate::config::ContainerConfig;
use crate::registry::ExecutionEnvironment;
use crate::runtime::{ExecutionContext, ExecutionStatus, RawOutcome, RuntimeExecutor};
use crate::sandbox::SandboxError;
use crate::watchdog::{RaceOutcome, Watchdog};
use crate::workspace::WorkingDirectory;

/// Grace period for draining logs of a container that was just killed
const POST_KILL_DRAIN: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("Container runtime error: {0}")]
    Other(String),
}

/// Everything needed to create one locked-down container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    /// Host directory bind-mounted read-only at `working_dir`
    pub host_dir: PathBuf,
    pub working_dir: String,
    pub env: Vec<String>,
    pub user: String,
    pub memory_limit_bytes: i64,
    pub cpu_period_us: i64,
    pub cpu_quota_us: i64,
    pub pids_limit: i64,
    pub tmpfs_size_mb: u64,
    pub execution_id: String,
}

/// Output captured from a container's streams
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
    pub truncated: bool,
}

/// The container runtime seam. Implemented over the Docker Engine API in production.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Returns the unique identifier for this runtime
    fn name(&self) -> &'static str;

    /// Checks the runtime is reachable
    async fn ping(&self) -> Result<(), RuntimeError>;

    /// Makes the image available locally, pulling it if needed
    async fn ensure_image(&self, image: &str) -> Result<(), RuntimeError>;

    /// Creates (but does not start) a container; returns its id
    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    async fn start(&self, id: &str) -> Result<(), RuntimeError>;

    /// Resolves with the exit code once the container stops
    async fn wait(&self, id: &str) -> Result<i64, RuntimeError>;

    /// Follows stdout/stderr until the streams close, keeping at most `limit` bytes
    async fn collect_output(&self, id: &str, limit: usize) -> Result<CapturedOutput, RuntimeError>;

    /// Current memory usage snapshot in bytes
    async fn memory_usage(&self, id: &str) -> Result<u64, RuntimeError>;

    /// Whether the kernel OOM killer terminated the container
    async fn oom_killed(&self, id: &str) -> Result<bool, RuntimeError>;

    /// Force-kills a running container; stopped containers are not an error
    async fn kill(&self, id: &str) -> Result<(), RuntimeError>;

    /// Force-removes the container; missing containers are not an error
    async fn remove(&self, id: &str) -> Result<(), RuntimeError>;
}

/// Exclusive handle on a created container.
///
/// `release` removes it; a handle dropped without release (early return,
/// panic, cancelled future) schedules a forced removal on the current runtime.
pub struct ContainerHandle {
    runtime: Arc<dyn ContainerRuntime>,
    id: String,
    released: bool,
}

impl ContainerHandle {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, id: String) -> Self {
        Self {
            runtime,
            id,
            released: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Force-remove the container; failures are logged
    pub async fn release(mut self) {
        self.released = true;
        match self.runtime.remove(&self.id).await {
            Ok(()) => debug!(container = %self.id, "Removed container"),
            Err(e) => warn!(container = %self.id, "Failed to remove container: {}", e),
        }
    }
}

impl Drop for ContainerHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let runtime = self.runtime.clone();
        let id = std::mem::take(&mut self.id);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = runtime.remove(&id).await {
                        warn!(container = %id, "Deferred container removal failed: {}", e);
                    }
                });
            }
            Err(_) => warn!(container = %id, "No async runtime available, container leaked"),
        }
    }
}

/// Quote a token for `sh -c` unless it is plainly safe
fn shell_quote(token: &str) -> String {
    let safe = !token.is_empty()
        && token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:+,@%".contains(c));
    if safe {
        token.to_string()
    } else {
        format!("'{}'", token.replace('\'', r"'\''"))
    }
}

fn shell_join(tokens: &[String]) -> String {
    tokens
        .iter()
        .map(|t| shell_quote(t))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Build the container command: compile step (if any), then the run command,
/// with stdin redirected from the sibling file or /dev/null
pub fn build_command(
    environment: &ExecutionEnvironment,
    entry_filename: &str,
    stdin_filename: Option<&str>,
) -> Vec<String> {
    let entry = shell_quote(entry_filename);

    let (compile, run) = match &environment.compile_command {
        Some(compile) => (
            Some(format!("{} {}", shell_join(compile), entry)),
            shell_join(&environment.run_command),
        ),
        None => (None, format!("{} {}", shell_join(&environment.run_command), entry)),
    };

    let input = stdin_filename
        .map(shell_quote)
        .unwrap_or_else(|| "/dev/null".to_string());
    let run = format!("{} < {}", run, input);

    let script = match compile {
        Some(compile) => format!("{} && {}", compile, run),
        None => run,
    };

    vec!["sh".to_string(), "-c".to_string(), script]
}

/// Runs non-script languages inside a locked-down container
pub struct ContainerExecutor {
    runtime: Arc<dyn ContainerRuntime>,
    temp_root: PathBuf,
    settings: ContainerConfig,
}

impl ContainerExecutor {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, temp_root: PathBuf, settings: ContainerConfig) -> Self {
        Self {
            runtime,
            temp_root,
            settings,
        }
    }

    fn container_spec(
        &self,
        ctx: &ExecutionContext<'_>,
        workdir: &WorkingDirectory,
        entry_filename: &str,
        stdin_filename: Option<&str>,
    ) -> ContainerSpec {
        let mut env = vec!["HOME=/tmp".to_string(), "TMPDIR=/tmp".to_string()];
        env.extend(ctx.environment.env.iter().cloned());

        ContainerSpec {
            name: format!("sandbox-{}", ctx.execution_id),
            image: ctx.environment.container_image.clone(),
            command: build_command(ctx.environment, entry_filename, stdin_filename),
            host_dir: workdir.path().to_path_buf(),
            working_dir: self.settings.mount_point.clone(),
            env,
            user: self.settings.user.clone(),
            memory_limit_bytes: ctx.limits.memory_limit_bytes() as i64,
            cpu_period_us: self.settings.cpu_period_us,
            cpu_quota_us: self.settings.cpu_quota_us,
            pids_limit: self.settings.pids_limit,
            tmpfs_size_mb: self.settings.tmpfs_size_mb,
            execution_id: ctx.execution_id.to_string(),
        }
    }

    /// Sample memory until `done` is notified, recording the high-water mark
    async fn sample_memory(&self, id: &str, peak: &AtomicU64, done: &Notify) {
        let interval = Duration::from_millis(self.settings.stats_interval_ms.max(10));
        loop {
            match self.runtime.memory_usage(id).await {
                Ok(bytes) => {
                    peak.fetch_max(bytes, Ordering::Relaxed);
                }
                Err(e) => debug!(container = %id, "Memory sample failed: {}", e),
            }

            tokio::select! {
                _ = done.notified() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// Running → Completed | Killed-by-Timeout | Failed-to-Start
    async fn run_container(
        &self,
        container: &ContainerHandle,
        ctx: &ExecutionContext<'_>,
    ) -> Result<RawOutcome, SandboxError> {
        let id = container.id();
        let max_output = ctx.limits.max_output_bytes;

        self.runtime
            .start(id)
            .await
            .map_err(|e| SandboxError::Infrastructure(format!("failed to start container: {}", e)))?;
        debug!(execution_id = %ctx.execution_id, container = %id, "Container started");

        let peak = AtomicU64::new(0);
        let done = Notify::new();

        let work = async {
            let finished = async {
                let result = tokio::join!(
                    self.runtime.collect_output(id, max_output),
                    self.runtime.wait(id)
                );
                done.notify_one();
                result
            };
            let (result, ()) = tokio::join!(finished, self.sample_memory(id, &peak, &done));
            result
        };

        let watchdog = Watchdog::new(ctx.limits.timeout);
        match watchdog.race(work).await {
            RaceOutcome::TimedOut => {
                let timeout_ms = watchdog.budget().as_millis();
                info!(execution_id = %ctx.execution_id, "Execution timed out after {} ms, killing container", timeout_ms);

                if let Err(e) = self.runtime.kill(id).await {
                    warn!(container = %id, "Failed to kill timed out container: {}", e);
                }

                let partial = tokio::time::timeout(
                    POST_KILL_DRAIN,
                    self.runtime.collect_output(id, max_output),
                )
                .await
                .ok()
                .and_then(Result::ok)
                .unwrap_or_default();

                let mut stderr = partial.stderr;
                if !stderr.is_empty() && !stderr.ends_with('\n') {
                    stderr.push('\n');
                }
                stderr.push_str(&format!("Execution timed out after {} ms", timeout_ms));

                Ok(RawOutcome {
                    status: ExecutionStatus::Timeout,
                    stdout: with_marker(partial.stdout, partial.truncated),
                    stderr,
                    memory_used_bytes: peak.load(Ordering::Relaxed),
                })
            }
            RaceOutcome::Completed((output, exit)) => {
                let output = output.map_err(|e| {
                    SandboxError::Infrastructure(format!("failed to read container output: {}", e))
                })?;
                let exit_code = exit.map_err(|e| {
                    SandboxError::Infrastructure(format!("failed to wait for container: {}", e))
                })?;

                let oom_killed = self.runtime.oom_killed(id).await.unwrap_or_else(|e| {
                    warn!(container = %id, "Failed to inspect container state: {}", e);
                    false
                });

                let mut stderr = output.stderr;
                let status = if oom_killed {
                    append_line(
                        &mut stderr,
                        &format!("Memory limit of {} MB exceeded", ctx.limits.memory_limit_mb),
                    );
                    ExecutionStatus::MemoryExceeded
                } else if exit_code != 0 {
                    if stderr.trim().is_empty() {
                        append_line(&mut stderr, &format!("Process exited with code {}", exit_code));
                    }
                    ExecutionStatus::Error
                } else {
                    ExecutionStatus::Success
                };

                debug!(execution_id = %ctx.execution_id, exit_code, oom_killed, "Container finished");

                Ok(RawOutcome {
                    status,
                    stdout: with_marker(output.stdout, output.truncated),
                    stderr,
                    memory_used_bytes: peak.load(Ordering::Relaxed),
                })
            }
        }
    }
}

fn with_marker(mut stdout: String, truncated: bool) -> String {
    if truncated {
        stdout.push_str(TRUNCATION_MARKER);
    }
    stdout
}

fn append_line(buffer: &mut String, line: &str) {
    if !buffer.is_empty() && !buffer.ends_with('\n') {
        buffer.push('\n');
    }
    buffer.push_str(line);
}

fn infrastructure<E: std::fmt::Display>(what: &'static str) -> impl FnOnce(E) -> SandboxError {
    move |e| SandboxError::Infrastructure(format!("{}: {}", what, e))
}

#[async_trait]
impl RuntimeExecutor for ContainerExecutor {
    fn name(&self) -> &'static str {
        "container"
    }

    async fn execute(&self, ctx: ExecutionContext<'_>) -> Result<RawOutcome, SandboxError> {
        info!(
            execution_id = %ctx.execution_id,
            language = %ctx.environment.language_key,
            image = %ctx.environment.container_image,
            "ContainerExecutor: executing request"
        );

        // Materialized
        let workdir = WorkingDirectory::create(&self.temp_root, ctx.execution_id)
            .map_err(infrastructure("could not create working directory"))?;
        let entry = workdir
            .write_source(&ctx.environment.file_extension, &ctx.request.source_code)
            .map_err(infrastructure("could not write source file"))?;
        let stdin = match &ctx.request.stdin {
            Some(stdin) => Some(
                workdir
                    .write_stdin(stdin)
                    .map_err(infrastructure("could not write stdin file"))?,
            ),
            None => None,
        };

        let spec = self.container_spec(&ctx, &workdir, &entry, stdin);

        if self.settings.pull_missing_images {
            self.runtime
                .ensure_image(&spec.image)
                .await
                .map_err(infrastructure("image unavailable"))?;
        }

        let container_id = self
            .runtime
            .create(&spec)
            .await
            .map_err(infrastructure("failed to create container"))?;
        let container = ContainerHandle::new(self.runtime.clone(), container_id);

        let outcome = self.run_container(&container, &ctx).await;

        container.release().await;
        drop(workdir);

        outcome
    }
}
