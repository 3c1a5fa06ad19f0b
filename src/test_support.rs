//! In-memory container runtime for unit tests

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;

use crate::assembler::append_capped;
use crate::runtimes::container::{CapturedOutput, ContainerRuntime, ContainerSpec, RuntimeError};

/// Scripted behaviour shared by every container the mock creates
#[derive(Debug, Clone, Default)]
pub struct MockBehavior {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
    pub oom_killed: bool,
    pub memory_bytes: u64,
    /// How long a started container "runs" before exiting on its own
    pub run_for: Duration,
    pub fail_ping: bool,
    pub fail_create: bool,
    pub fail_start: bool,
}

struct MockContainer {
    killed: watch::Sender<bool>,
}

pub struct MockRuntime {
    behavior: MockBehavior,
    containers: Mutex<HashMap<String, MockContainer>>,
    next_id: AtomicUsize,
    created: AtomicUsize,
    kills: AtomicUsize,
    pulls: AtomicUsize,
    peak_live: AtomicUsize,
    last_spec: Mutex<Option<ContainerSpec>>,
    seen_files: Mutex<Vec<String>>,
}

impl MockRuntime {
    pub fn new(behavior: MockBehavior) -> Self {
        Self {
            behavior,
            containers: Mutex::new(HashMap::new()),
            next_id: AtomicUsize::new(0),
            created: AtomicUsize::new(0),
            kills: AtomicUsize::new(0),
            pulls: AtomicUsize::new(0),
            peak_live: AtomicUsize::new(0),
            last_spec: Mutex::new(None),
            seen_files: Mutex::new(Vec::new()),
        }
    }

    pub fn dummy_spec() -> ContainerSpec {
        ContainerSpec {
            name: "sandbox-dummy".to_string(),
            image: "mock:latest".to_string(),
            command: vec!["true".to_string()],
            host_dir: std::env::temp_dir(),
            working_dir: "/sandbox".to_string(),
            env: Vec::new(),
            user: "65534:65534".to_string(),
            memory_limit_bytes: 16 * 1024 * 1024,
            cpu_period_us: 100_000,
            cpu_quota_us: 50_000,
            pids_limit: 64,
            tmpfs_size_mb: 64,
            execution_id: "dummy".to_string(),
        }
    }

    /// Containers created so far
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Containers created and not yet removed
    pub fn live(&self) -> usize {
        self.containers.lock().unwrap().len()
    }

    pub fn peak_live(&self) -> usize {
        self.peak_live.load(Ordering::SeqCst)
    }

    pub fn kills(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    pub fn pulls(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }

    pub fn last_spec(&self) -> Option<ContainerSpec> {
        self.last_spec.lock().unwrap().clone()
    }

    /// Sorted file names present in the last bind-mounted directory at create time
    pub fn seen_files(&self) -> Vec<String> {
        self.seen_files.lock().unwrap().clone()
    }

    /// Resolves true if the container was killed before it finished on its own
    async fn run_to_exit(&self, id: &str) -> Result<bool, RuntimeError> {
        let mut killed = {
            let containers = self.containers.lock().unwrap();
            containers
                .get(id)
                .ok_or_else(|| RuntimeError::Other(format!("no such container: {}", id)))?
                .killed
                .subscribe()
        };

        if *killed.borrow() {
            return Ok(true);
        }

        tokio::select! {
            _ = tokio::time::sleep(self.behavior.run_for) => Ok(false),
            _ = killed.changed() => Ok(true),
        }
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn ping(&self) -> Result<(), RuntimeError> {
        if self.behavior.fail_ping {
            return Err(RuntimeError::Other("daemon unreachable".to_string()));
        }
        Ok(())
    }

    async fn ensure_image(&self, _image: &str) -> Result<(), RuntimeError> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        if self.behavior.fail_create {
            return Err(RuntimeError::Other("no space left on device".to_string()));
        }

        let mut files: Vec<String> = std::fs::read_dir(&spec.host_dir)
            .map(|entries| {
                entries
                    .filter_map(Result::ok)
                    .map(|entry| entry.file_name().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default();
        files.sort();
        *self.seen_files.lock().unwrap() = files;
        *self.last_spec.lock().unwrap() = Some(spec.clone());

        let id = format!("mock-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let (killed, _) = watch::channel(false);

        let live = {
            let mut containers = self.containers.lock().unwrap();
            containers.insert(id.clone(), MockContainer { killed });
            containers.len()
        };
        self.created.fetch_add(1, Ordering::SeqCst);
        self.peak_live.fetch_max(live, Ordering::SeqCst);
        Ok(id)
    }

    async fn start(&self, _id: &str) -> Result<(), RuntimeError> {
        if self.behavior.fail_start {
            return Err(RuntimeError::Other("exec format error".to_string()));
        }
        Ok(())
    }

    async fn wait(&self, id: &str) -> Result<i64, RuntimeError> {
        if self.run_to_exit(id).await? {
            Ok(137)
        } else {
            Ok(self.behavior.exit_code)
        }
    }

    async fn collect_output(&self, id: &str, limit: usize) -> Result<CapturedOutput, RuntimeError> {
        self.run_to_exit(id).await?;

        let mut output = CapturedOutput::default();
        let stdout_fit = append_capped(&mut output.stdout, &self.behavior.stdout, limit);
        let stderr_fit = append_capped(
            &mut output.stderr,
            &self.behavior.stderr,
            limit.saturating_sub(output.stdout.len()),
        );
        output.truncated = !(stdout_fit && stderr_fit);
        Ok(output)
    }

    async fn memory_usage(&self, _id: &str) -> Result<u64, RuntimeError> {
        Ok(self.behavior.memory_bytes)
    }

    async fn oom_killed(&self, _id: &str) -> Result<bool, RuntimeError> {
        Ok(self.behavior.oom_killed)
    }

    async fn kill(&self, id: &str) -> Result<(), RuntimeError> {
        self.kills.fetch_add(1, Ordering::SeqCst);
        if let Some(container) = self.containers.lock().unwrap().get(id) {
            container.killed.send_replace(true);
        }
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), RuntimeError> {
        if let Some(container) = self.containers.lock().unwrap().remove(id) {
            container.killed.send_replace(true);
        }
        Ok(())
    }
}
