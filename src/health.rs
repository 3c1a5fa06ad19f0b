use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::runtimes::container::ContainerRuntime;

/// Upper bound on a runtime ping
const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Readiness detail behind the boolean health signal
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub healthy: bool,
    pub runtime: String,
    pub runtime_reachable: bool,
    pub temp_root: PathBuf,
    pub temp_root_writable: bool,
    /// Why the first failing check failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    pub checked_at: DateTime<Utc>,
}

pub struct HealthMonitor {
    runtime: Arc<dyn ContainerRuntime>,
    temp_root: PathBuf,
}

impl HealthMonitor {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, temp_root: PathBuf) -> Self {
        Self { runtime, temp_root }
    }

    /// Runtime reachable AND a marker file can be written and deleted in the temp root
    pub async fn is_healthy(&self) -> bool {
        self.check().await.healthy
    }

    pub async fn check(&self) -> HealthReport {
        let mut failures = Vec::new();

        let runtime_reachable = match tokio::time::timeout(PING_TIMEOUT, self.runtime.ping()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                failures.push(format!("container runtime unreachable: {}", e));
                false
            }
            Err(_) => {
                failures.push(format!(
                    "container runtime did not answer within {} s",
                    PING_TIMEOUT.as_secs()
                ));
                false
            }
        };

        let temp_root_writable = match probe_temp_root(&self.temp_root) {
            Ok(()) => true,
            Err(e) => {
                failures.push(format!("temp root not writable: {}", e));
                false
            }
        };

        let healthy = runtime_reachable && temp_root_writable;
        if healthy {
            debug!("Health check passed");
        } else {
            warn!("Health check failed: {}", failures.join("; "));
        }

        HealthReport {
            healthy,
            runtime: self.runtime.name().to_string(),
            runtime_reachable,
            temp_root: self.temp_root.clone(),
            temp_root_writable,
            failure: failures.into_iter().next(),
            checked_at: Utc::now(),
        }
    }
}

/// Write then delete a uniquely named marker file
fn probe_temp_root(temp_root: &Path) -> std::io::Result<()> {
    fs::create_dir_all(temp_root)?;
    let marker = temp_root.join(format!(".health-{}", uuid::Uuid::new_v4()));
    fs::write(&marker, b"ok")?;
    fs::remove_file(&marker)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MockBehavior, MockRuntime};

    #[tokio::test]
    async fn test_healthy_when_runtime_and_temp_root_ok() {
        let root = tempfile::tempdir().unwrap();
        let monitor = HealthMonitor::new(
            Arc::new(MockRuntime::new(MockBehavior::default())),
            root.path().to_path_buf(),
        );

        let report = monitor.check().await;
        assert!(report.healthy);
        assert_eq!(report.runtime, "mock");
        assert_eq!(report.failure, None);
        assert!(monitor.is_healthy().await);
        // The marker leaves nothing behind
        assert_eq!(fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_runtime_is_unhealthy() {
        let root = tempfile::tempdir().unwrap();
        let monitor = HealthMonitor::new(
            Arc::new(MockRuntime::new(MockBehavior {
                fail_ping: true,
                ..Default::default()
            })),
            root.path().to_path_buf(),
        );

        let report = monitor.check().await;
        assert!(!report.healthy);
        assert!(!report.runtime_reachable);
        assert!(report.temp_root_writable);
        assert!(report.failure.unwrap().contains("unreachable"));
    }

    #[tokio::test]
    async fn test_unwritable_temp_root_is_unhealthy() {
        let root = tempfile::tempdir().unwrap();
        // A regular file where the directory should be
        let blocked = root.path().join("not-a-dir");
        fs::write(&blocked, b"").unwrap();

        let monitor = HealthMonitor::new(Arc::new(MockRuntime::new(MockBehavior::default())), blocked);

        let report = monitor.check().await;
        assert!(!report.healthy);
        assert!(report.runtime_reachable);
        assert!(!report.temp_root_writable);
        assert!(!monitor.is_healthy().await);
    }
}
