use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

use crate::runtime::{ExecutionResult, ExecutionStatus};

// Event target for per-execution records
const EXECUTION_EVENT_TARGET: &str = "polyglot_sandbox::execution";

lazy_static::lazy_static! {
    static ref GLOBAL_TELEMETRY: ExecutionTelemetry = ExecutionTelemetry::new();
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySnapshot {
    pub executions: u64,
    pub successes: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub memory_exceeded: u64,
    pub rejections: u64,
    pub total_execution_time_ms: u64,
    pub max_execution_time_ms: u64,
    pub peak_memory_used_bytes: u64,
}

/// In-process execution counters. Clones share the same counters.
#[derive(Debug, Clone, Default)]
pub struct ExecutionTelemetry {
    counters: Arc<Counters>,
}

#[derive(Debug, Default)]
struct Counters {
    executions: AtomicU64,
    successes: AtomicU64,
    errors: AtomicU64,
    timeouts: AtomicU64,
    memory_exceeded: AtomicU64,
    rejections: AtomicU64,
    total_execution_time_ms: AtomicU64,
    max_execution_time_ms: AtomicU64,
    peak_memory_used_bytes: AtomicU64,
}

impl ExecutionTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide instance shared by every sandbox that does not bring its own
    pub fn global() -> ExecutionTelemetry {
        GLOBAL_TELEMETRY.clone()
    }

    /// Record a completed execution and emit its structured event.
    ///
    /// Only the hash of the source is logged, never the source itself.
    pub fn record_execution(&self, requester_id: &str, result: &ExecutionResult) {
        let c = &self.counters;
        c.executions.fetch_add(1, Ordering::Relaxed);
        match result.status {
            ExecutionStatus::Success => c.successes.fetch_add(1, Ordering::Relaxed),
            ExecutionStatus::Error => c.errors.fetch_add(1, Ordering::Relaxed),
            ExecutionStatus::Timeout => c.timeouts.fetch_add(1, Ordering::Relaxed),
            ExecutionStatus::MemoryExceeded => c.memory_exceeded.fetch_add(1, Ordering::Relaxed),
        };
        c.total_execution_time_ms
            .fetch_add(result.execution_time_ms, Ordering::Relaxed);
        c.max_execution_time_ms
            .fetch_max(result.execution_time_ms, Ordering::Relaxed);
        c.peak_memory_used_bytes
            .fetch_max(result.memory_used_bytes, Ordering::Relaxed);

        info!(
            target: EXECUTION_EVENT_TARGET,
            execution_id = %result.id,
            requester_id = %requester_id,
            language = %result.language,
            status = %result.status,
            execution_time_ms = result.execution_time_ms,
            memory_used_bytes = result.memory_used_bytes,
            code_hash = %result.code_hash,
            "Execution completed"
        );
    }

    /// Record a request rejected before any execution resource was created
    pub fn record_rejection(&self, requester_id: &str, reason: &str) {
        self.counters.rejections.fetch_add(1, Ordering::Relaxed);
        info!(
            target: EXECUTION_EVENT_TARGET,
            requester_id = %requester_id,
            reason = %reason,
            "Execution request rejected"
        );
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        let c = &self.counters;
        TelemetrySnapshot {
            executions: c.executions.load(Ordering::Relaxed),
            successes: c.successes.load(Ordering::Relaxed),
            errors: c.errors.load(Ordering::Relaxed),
            timeouts: c.timeouts.load(Ordering::Relaxed),
            memory_exceeded: c.memory_exceeded.load(Ordering::Relaxed),
            rejections: c.rejections.load(Ordering::Relaxed),
            total_execution_time_ms: c.total_execution_time_ms.load(Ordering::Relaxed),
            max_execution_time_ms: c.max_execution_time_ms.load(Ordering::Relaxed),
            peak_memory_used_bytes: c.peak_memory_used_bytes.load(Ordering::Relaxed),
        }
    }
}
