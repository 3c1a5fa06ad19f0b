use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

use crate::analyzer::{self, ComplexityMetrics};
use crate::assembler::ResultAssembler;
use crate::config::SandboxConfig;
use crate::health::{HealthMonitor, HealthReport};
use crate::registry::{EnvironmentRegistry, ExecutionKind};
use crate::runtime::{
    ExecutionContext, ExecutionRequest, ExecutionResult, RawOutcome, ResolvedLimits,
    RuntimeExecutor,
};
use crate::runtimes::container::{ContainerExecutor, ContainerRuntime};
use crate::runtimes::script::ScriptExecutor;
use crate::telemetry::ExecutionTelemetry;
use crate::validator::{RequestValidator, ValidationError};

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Request rejected: {0}")]
    Validation(#[from] ValidationError),

    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("Execution environment error: {0}")]
    Infrastructure(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Entry point: validates a request, runs it on the matching path and
/// assembles the result.
///
/// Cheap to share behind an `Arc`; executions are independent and may run
/// concurrently.
pub struct Sandbox {
    config: SandboxConfig,
    registry: EnvironmentRegistry,
    validator: RequestValidator,
    script: ScriptExecutor,
    container: ContainerExecutor,
    assembler: ResultAssembler,
    health: HealthMonitor,
    telemetry: ExecutionTelemetry,
}

impl Sandbox {
    pub fn new(
        config: SandboxConfig,
        registry: EnvironmentRegistry,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Self {
        let validator = RequestValidator::new(config.limits.clone());
        let container = ContainerExecutor::new(
            runtime.clone(),
            config.temp_root.clone(),
            config.container.clone(),
        );
        let health = HealthMonitor::new(runtime, config.temp_root.clone());

        Self {
            config,
            registry,
            validator,
            script: ScriptExecutor::new(),
            container,
            assembler: ResultAssembler::new(),
            health,
            telemetry: ExecutionTelemetry::global(),
        }
    }

    /// Built-in registry with the configuration's language overrides applied
    pub fn from_config(config: SandboxConfig, runtime: Arc<dyn ContainerRuntime>) -> Result<Self, SandboxError> {
        config
            .validate()
            .map_err(|e| SandboxError::Config(e.to_string()))?;
        let registry = EnvironmentRegistry::with_overrides(&config.languages);
        Ok(Self::new(config, registry, runtime))
    }

    /// Use a dedicated counter set instead of the process-wide one
    pub fn with_telemetry(mut self, telemetry: ExecutionTelemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn registry(&self) -> &EnvironmentRegistry {
        &self.registry
    }

    pub fn telemetry(&self) -> &ExecutionTelemetry {
        &self.telemetry
    }

    /// Sorted canonical language keys
    pub fn supported_languages(&self) -> Vec<&str> {
        self.registry.languages()
    }

    /// Run one request to completion.
    ///
    /// Only requests rejected up front return `Err`; once accepted, every
    /// outcome (including infrastructure failures) is an `ExecutionResult`.
    pub async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult, SandboxError> {
        if let Err(e) = self.validator.validate(&request) {
            self.telemetry
                .record_rejection(&request.requester_id, &e.to_string());
            return Err(e.into());
        }

        let environment = match self.registry.lookup(&request.language) {
            Some(environment) => environment,
            None => {
                self.telemetry
                    .record_rejection(&request.requester_id, "unsupported language");
                return Err(SandboxError::UnsupportedLanguage(request.language.clone()));
            }
        };

        let accepted_at = Instant::now();
        let execution_id = Uuid::new_v4().to_string();
        let limits = ResolvedLimits::resolve_for(&request, environment, &self.config.limits);

        let span = info_span!(
            "execution",
            execution_id = %execution_id,
            language = %environment.language_key
        );

        let executor: &dyn RuntimeExecutor = match environment.kind {
            ExecutionKind::Script => &self.script,
            ExecutionKind::Container => &self.container,
        };

        let ctx = ExecutionContext {
            execution_id: &execution_id,
            request: &request,
            environment,
            limits,
        };

        let outcome = match executor.execute(ctx).instrument(span).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(execution_id = %execution_id, executor = executor.name(), "Execution failed: {}", e);
                match e {
                    SandboxError::Infrastructure(message) => RawOutcome::infrastructure_failure(message),
                    other => RawOutcome::infrastructure_failure(other),
                }
            }
        };

        let result = self.assembler.assemble(
            execution_id,
            &environment.language_key,
            &request.source_code,
            outcome,
            accepted_at,
        );

        self.telemetry.record_execution(&request.requester_id, &result);
        Ok(result)
    }

    /// Static metrics; never executes the code
    pub fn analyze(&self, source_code: &str, language: &str) -> ComplexityMetrics {
        analyzer::analyze(source_code, language)
    }

    pub async fn is_healthy(&self) -> bool {
        self.health.is_healthy().await
    }

    pub async fn health_report(&self) -> HealthReport {
        let report = self.health.check().await;
        info!(healthy = report.healthy, "Health report generated");
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::code_hash;
    use crate::runtime::ExecutionStatus;
    use crate::test_support::{MockBehavior, MockRuntime};

    fn sandbox(behavior: MockBehavior) -> (Sandbox, Arc<MockRuntime>, tempfile::TempDir) {
        let root = tempfile::tempdir().unwrap();
        let mut config = SandboxConfig::default();
        config.temp_root = root.path().to_path_buf();

        let runtime = Arc::new(MockRuntime::new(behavior));
        let sandbox = Sandbox::new(config, EnvironmentRegistry::builtin(), runtime.clone())
            .with_telemetry(ExecutionTelemetry::new());
        (sandbox, runtime, root)
    }

    #[tokio::test]
    async fn test_container_request_produces_result() {
        let (sandbox, runtime, root) = sandbox(MockBehavior {
            stdout: "42\n".to_string(),
            ..Default::default()
        });
        let source = "print(6 * 7)";

        let result = sandbox
            .execute(ExecutionRequest::new("alice", "Python", source))
            .await
            .unwrap();

        assert_eq!(result.status, ExecutionStatus::Success);
        assert_eq!(result.stdout.as_deref(), Some("42\n"));
        assert_eq!(result.language, "python");
        assert_eq!(result.code_hash, code_hash(source));
        assert!(Uuid::parse_str(&result.id).is_ok());
        assert_eq!(runtime.created(), 1);
        assert_eq!(runtime.live(), 0);
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
        assert_eq!(sandbox.telemetry().snapshot().successes, 1);
    }

    #[tokio::test]
    async fn test_rejected_requests_never_create_containers() {
        let (sandbox, runtime, root) = sandbox(MockBehavior::default());

        let oversized = "x".repeat(10_001);
        let cases = vec![
            ExecutionRequest::new("u", "python", ""),
            ExecutionRequest::new("u", "python", oversized.as_str()),
            ExecutionRequest::new("u", "python", "print(1)").with_timeout_ms(30_001),
            ExecutionRequest::new("u", "python", "print(1)").with_memory_limit_mb(513),
            ExecutionRequest::new("u", "python", "import os\nos.remove('x')"),
        ];

        for request in cases {
            let err = sandbox.execute(request).await.unwrap_err();
            assert!(matches!(err, SandboxError::Validation(_)), "{}", err);
        }

        assert_eq!(runtime.created(), 0);
        assert_eq!(std::fs::read_dir(root.path()).map(|d| d.count()).unwrap_or(0), 0);
        assert_eq!(sandbox.telemetry().snapshot().rejections, 5);
    }

    #[tokio::test]
    async fn test_unknown_language_is_rejected() {
        let (sandbox, runtime, _root) = sandbox(MockBehavior::default());
        let err = sandbox
            .execute(ExecutionRequest::new("u", "cobol", "DISPLAY 'HI'."))
            .await
            .unwrap_err();

        assert!(matches!(err, SandboxError::UnsupportedLanguage(ref l) if l == "cobol"));
        assert_eq!(runtime.created(), 0);
    }

    #[tokio::test]
    async fn test_infrastructure_failure_becomes_error_result() {
        let (sandbox, _runtime, _root) = sandbox(MockBehavior {
            fail_create: true,
            ..Default::default()
        });

        let result = sandbox
            .execute(ExecutionRequest::new("u", "go", "package main\nfunc main() {}"))
            .await
            .unwrap();

        assert_eq!(result.status, ExecutionStatus::Error);
        let stderr = result.stderr.unwrap();
        assert!(stderr.starts_with("Execution environment error:"), "{}", stderr);
        assert!(stderr.contains("no space left on device"));
        assert_eq!(stderr.matches("Execution environment error:").count(), 1);
    }

    #[tokio::test]
    async fn test_script_languages_skip_the_container_runtime() {
        let (sandbox, runtime, _root) = sandbox(MockBehavior::default());

        let result = sandbox
            .execute(ExecutionRequest::new("u", "js", "console.log(1 + 1)"))
            .await
            .unwrap();

        assert_eq!(result.status, ExecutionStatus::Success);
        assert_eq!(result.stdout.as_deref(), Some("2\n"));
        assert_eq!(result.language, "javascript");
        assert_eq!(runtime.created(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_containers_overlap_and_all_get_removed() {
        let (sandbox, runtime, root) = sandbox(MockBehavior {
            stdout: "ok\n".to_string(),
            run_for: std::time::Duration::from_millis(150),
            ..Default::default()
        });

        let (python, ruby, c, js) = tokio::join!(
            sandbox.execute(ExecutionRequest::new("a", "python", "print('ok')")),
            sandbox.execute(ExecutionRequest::new("b", "ruby", "puts 'ok'").with_timeout_ms(5_000)),
            sandbox.execute(ExecutionRequest::new("c", "c", "int main(void) { return 0; }").with_timeout_ms(2_000)),
            sandbox.execute(ExecutionRequest::new("d", "js", "console.log('script')").with_timeout_ms(1_000)),
        );

        for result in [python.unwrap(), ruby.unwrap(), c.unwrap()] {
            assert_eq!(result.status, ExecutionStatus::Success, "{}", result.language);
            assert_eq!(result.stdout.as_deref(), Some("ok\n"));
        }
        assert_eq!(js.unwrap().stdout.as_deref(), Some("script\n"));

        assert_eq!(runtime.created(), 3);
        assert!(runtime.peak_live() >= 2);
        assert_eq!(runtime.live(), 0);
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_compiled_languages_use_their_own_default_limits() {
        let (sandbox, runtime, _root) = sandbox(MockBehavior::default());

        sandbox
            .execute(ExecutionRequest::new("u", "golang", "package main\nfunc main() {}"))
            .await
            .unwrap();
        let spec = runtime.last_spec().unwrap();
        assert_eq!(spec.memory_limit_bytes, 384 * 1024 * 1024);
        assert!(spec.env.iter().any(|var| var == "GOFLAGS=-p=1"));

        sandbox
            .execute(ExecutionRequest::new("u", "python", "print(1)"))
            .await
            .unwrap();
        let spec = runtime.last_spec().unwrap();
        assert_eq!(spec.memory_limit_bytes, 128 * 1024 * 1024);
    }

    #[tokio::test]
    async fn test_health_follows_runtime() {
        let (healthy, _, _root) = sandbox(MockBehavior::default());
        assert!(healthy.is_healthy().await);

        let (unhealthy, _, _root2) = sandbox(MockBehavior {
            fail_ping: true,
            ..Default::default()
        });
        assert!(!unhealthy.is_healthy().await);
        assert!(!unhealthy.health_report().await.runtime_reachable);
    }

    #[test]
    fn test_from_config_applies_overrides_and_validates() {
        let mut config = SandboxConfig::default();
        config.languages.insert(
            "ruby".to_string(),
            crate::config::LanguageOverride {
                image: Some("ruby:3.2-slim".to_string()),
                ..Default::default()
            },
        );
        let runtime = Arc::new(MockRuntime::new(MockBehavior::default()));
        let sandbox = Sandbox::from_config(config.clone(), runtime.clone()).unwrap();
        assert_eq!(sandbox.registry().lookup("rb").unwrap().container_image, "ruby:3.2-slim");

        config.limits.default_timeout_ms = config.limits.max_timeout_ms + 1;
        assert!(matches!(
            Sandbox::from_config(config, runtime),
            Err(SandboxError::Config(_))
        ));
    }
}
