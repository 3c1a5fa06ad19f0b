use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::LimitsConfig;
use crate::registry::ExecutionEnvironment;
use crate::sandbox::SandboxError;

/// A request to run untrusted source code
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    /// Authenticated id of the caller, supplied by the identity layer
    #[serde(alias = "userId")]
    pub requester_id: String,
    pub language: String,
    pub source_code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit_mb: Option<u64>,
}

impl ExecutionRequest {
    pub fn new(
        requester_id: impl Into<String>,
        language: impl Into<String>,
        source_code: impl Into<String>,
    ) -> Self {
        Self {
            requester_id: requester_id.into(),
            language: language.into(),
            source_code: source_code.into(),
            stdin: None,
            timeout_ms: None,
            memory_limit_mb: None,
        }
    }

    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_memory_limit_mb(mut self, memory_limit_mb: u64) -> Self {
        self.memory_limit_mb = Some(memory_limit_mb);
        self
    }
}

/// Final status of an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Error,
    Timeout,
    MemoryExceeded,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Success => "success",
            ExecutionStatus::Error => "error",
            ExecutionStatus::Timeout => "timeout",
            ExecutionStatus::MemoryExceeded => "memory_exceeded",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The ExecutionResult is the canonical, immutable outcome handed back to callers.
/// Construct it through the result assembler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub id: String,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    pub execution_time_ms: u64,
    pub memory_used_bytes: u64,
    pub timestamp: DateTime<Utc>,
    pub language: String,
    pub code_hash: String,
}

/// What an executor observed, before the assembler stamps identity and timing on it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawOutcome {
    pub status: ExecutionStatus,
    pub stdout: String,
    pub stderr: String,
    pub memory_used_bytes: u64,
}

impl RawOutcome {
    /// Outcome for a failure outside the user's program (runtime down, directory not writable, ...)
    pub fn infrastructure_failure(message: impl std::fmt::Display) -> Self {
        Self {
            status: ExecutionStatus::Error,
            stdout: String::new(),
            stderr: format!("Execution environment error: {}", message),
            memory_used_bytes: 0,
        }
    }
}

/// Limits in effect for one execution, after defaults and floors are applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedLimits {
    pub timeout: Duration,
    pub memory_limit_mb: u64,
    pub max_output_bytes: usize,
}

impl ResolvedLimits {
    /// Assumes the request already passed validation against the same ceilings
    pub fn resolve(request: &ExecutionRequest, limits: &LimitsConfig) -> Self {
        Self::resolve_with_defaults(request, limits, None, None)
    }

    /// Like `resolve`, but an environment's own defaults replace the global
    /// ones. They are still held to the configured ceilings.
    pub fn resolve_for(
        request: &ExecutionRequest,
        environment: &ExecutionEnvironment,
        limits: &LimitsConfig,
    ) -> Self {
        Self::resolve_with_defaults(
            request,
            limits,
            environment.default_timeout_ms,
            environment.default_memory_mb,
        )
    }

    fn resolve_with_defaults(
        request: &ExecutionRequest,
        limits: &LimitsConfig,
        default_timeout_ms: Option<u64>,
        default_memory_mb: Option<u64>,
    ) -> Self {
        let default_timeout_ms = default_timeout_ms
            .map(|ms| ms.min(limits.max_timeout_ms))
            .unwrap_or(limits.default_timeout_ms);
        let default_memory_mb = default_memory_mb
            .map(|mb| mb.min(limits.max_memory_mb))
            .unwrap_or(limits.default_memory_mb);

        let timeout_ms = request.timeout_ms.unwrap_or(default_timeout_ms).max(1);
        let memory_limit_mb = request
            .memory_limit_mb
            .unwrap_or(default_memory_mb)
            .max(limits.min_memory_mb);

        Self {
            timeout: Duration::from_millis(timeout_ms),
            memory_limit_mb,
            max_output_bytes: limits.max_output_bytes,
        }
    }

    pub fn memory_limit_bytes(&self) -> u64 {
        self.memory_limit_mb * 1024 * 1024
    }
}

/// Everything an executor needs for one run
#[derive(Debug)]
pub struct ExecutionContext<'a> {
    pub execution_id: &'a str,
    pub request: &'a ExecutionRequest,
    pub environment: &'a ExecutionEnvironment,
    pub limits: ResolvedLimits,
}

/// The RuntimeExecutor trait is implemented once per execution path
#[async_trait]
pub trait RuntimeExecutor: Send + Sync {
    /// Returns the unique identifier for this executor
    fn name(&self) -> &'static str;

    /// Runs the request to completion, timeout or failure.
    ///
    /// Failures of the user's program are reported through the returned outcome;
    /// `Err` is reserved for the executor's own infrastructure.
    async fn execute(&self, ctx: ExecutionContext<'_>) -> Result<RawOutcome, SandboxError>;
}
