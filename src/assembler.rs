use chrono::Utc;
use sha2::{Digest, Sha256};
use std::time::Instant;

use crate::runtime::{ExecutionResult, RawOutcome};

/// Lowercase hex SHA-256 of the source text
pub fn code_hash(source_code: &str) -> String {
    format!("{:x}", Sha256::digest(source_code.as_bytes()))
}

/// Turns an executor outcome into the canonical ExecutionResult
#[derive(Debug, Clone, Copy, Default)]
pub struct ResultAssembler;

impl ResultAssembler {
    pub fn new() -> Self {
        Self
    }

    /// `accepted_at` is when the request passed validation
    pub fn assemble(
        &self,
        execution_id: String,
        language: &str,
        source_code: &str,
        outcome: RawOutcome,
        accepted_at: Instant,
    ) -> ExecutionResult {
        ExecutionResult {
            id: execution_id,
            status: outcome.status,
            stdout: non_empty(outcome.stdout),
            stderr: non_empty(outcome.stderr),
            execution_time_ms: accepted_at.elapsed().as_millis() as u64,
            memory_used_bytes: outcome.memory_used_bytes,
            timestamp: Utc::now(),
            language: language.to_string(),
            code_hash: code_hash(source_code),
        }
    }
}

fn non_empty(text: String) -> Option<String> {
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

const ERROR_MARKERS: &[&str] = &[
    "error",
    "exception",
    "traceback",
    "panicked at",
    "segmentation fault",
    "core dumped",
    "fatal:",
    "warning:",
];

/// Best-effort split of a combined output stream into (stdout, stderr).
///
/// Lines containing an error marker go to stderr, as does everything after a
/// Python traceback header. Program output that happens to contain one of the
/// markers is misclassified.
pub fn split_combined_output(combined: &str) -> (String, String) {
    let mut stdout = String::new();
    let mut stderr = String::new();
    let mut in_traceback = false;

    for line in combined.split_inclusive('\n') {
        let lowered = line.to_lowercase();
        if lowered.starts_with("traceback (most recent call last)") {
            in_traceback = true;
        }

        if in_traceback || ERROR_MARKERS.iter().any(|marker| lowered.contains(marker)) {
            stderr.push_str(line);
        } else {
            stdout.push_str(line);
        }
    }

    (stdout, stderr)
}

/// Append `chunk` to `buffer` without exceeding `limit` bytes; returns false once truncated
pub fn append_capped(buffer: &mut String, chunk: &str, limit: usize) -> bool {
    let remaining = limit.saturating_sub(buffer.len());
    if chunk.len() <= remaining {
        buffer.push_str(chunk);
        return true;
    }

    let mut cut = remaining;
    while cut > 0 && !chunk.is_char_boundary(cut) {
        cut -= 1;
    }
    buffer.push_str(&chunk[..cut]);
    false
}

pub const TRUNCATION_MARKER: &str = "\n[output truncated]";
