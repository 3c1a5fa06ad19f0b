//! Script sandbox: runs ECMAScript source in a fresh, locked-down V8 isolate.
//!
//! The isolate exposes only the language built-ins, a console replacement that
//! captures output, and the request's stdin. Dynamic code generation, module
//! loading and the `Deno` namespace are removed before user code runs.
//!
//! V8 isolates are `!Send`, so each execution gets a dedicated thread with its
//! own single-threaded tokio runtime.

use async_trait::async_trait;
use deno_core::{v8, JsRuntime, PollEventLoopOptions, RuntimeOptions};
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::assembler::{append_capped, TRUNCATION_MARKER};
use crate::runtime::{ExecutionContext, ExecutionStatus, RawOutcome, RuntimeExecutor};
use crate::sandbox::SandboxError;
use crate::watchdog::ArmedWatchdog;

/// Installs the captured console, stdin helpers and removes code generation
/// primitives. Called with (stdin, maxOutputChars).
const PRELUDE: &str = r#"
((stdinValue, maxOutput) => {
    const stringify = JSON.stringify;
    const toText = (value) => {
        if (typeof value === 'string') return value;
        if (value instanceof Error) return String(value);
        try {
            const json = stringify(value);
            return json === undefined ? String(value) : json;
        } catch (_) {
            return String(value);
        }
    };

    let stdout = '';
    let stderr = '';
    let truncated = false;
    const write = (toStderr, args) => {
        if (truncated) return;
        let line = '';
        for (let i = 0; i < args.length; i++) {
            line += (i === 0 ? '' : ' ') + toText(args[i]);
        }
        line += '\n';
        const room = maxOutput - stdout.length - stderr.length;
        if (line.length > room) {
            line = line.slice(0, Math.max(room, 0));
            truncated = true;
        }
        if (toStderr) stderr += line; else stdout += line;
    };

    const out = (...args) => write(false, args);
    const err = (...args) => write(true, args);
    const console = Object.freeze({ log: out, info: out, debug: out, error: err, warn: err });
    Object.defineProperty(globalThis, 'console', {
        value: console, configurable: false, writable: false,
    });

    const lines = stdinValue === null ? [] : stdinValue.split('\n');
    let cursor = 0;
    Object.defineProperty(globalThis, 'stdin', {
        value: stdinValue, configurable: false, writable: false,
    });
    Object.defineProperty(globalThis, 'readline', {
        value: () => (cursor < lines.length ? lines[cursor++] : null),
        configurable: false, writable: false,
    });

    Object.defineProperty(globalThis, '__capturedOutput', {
        get: () => stringify({ stdout, stderr, truncated }),
        configurable: false, enumerable: false,
    });

    delete globalThis.Deno;
    delete globalThis.__bootstrap;
    delete globalThis.WebAssembly;
    delete globalThis.eval;

    const AsyncFunction = (async function () {}).constructor;
    const GeneratorFunction = (function* () {}).constructor;
    const AsyncGeneratorFunction = (async function* () {}).constructor;
    for (const ctor of [Function, AsyncFunction, GeneratorFunction, AsyncGeneratorFunction]) {
        Object.defineProperty(ctor.prototype, 'constructor', {
            value: undefined, configurable: false, writable: false,
        });
    }
    delete globalThis.Function;
})"#;

#[derive(Debug, Default, Deserialize)]
struct CapturedConsole {
    stdout: String,
    stderr: String,
    truncated: bool,
}

/// Everything the isolate thread needs, owned
struct ScriptJob {
    source: String,
    stdin: Option<String>,
    timeout: Duration,
    memory_limit_mb: u64,
    max_output_bytes: usize,
}

/// State for the near-heap-limit callback
struct HeapLimitState {
    handle: v8::IsolateHandle,
    triggered: AtomicBool,
}

/// Terminates execution the first time the heap approaches its limit and grants
/// 1MB so the termination can unwind.
extern "C" fn near_heap_limit_callback(
    data: *mut std::ffi::c_void,
    current_heap_limit: usize,
    _initial_heap_limit: usize,
) -> usize {
    // SAFETY: `data` points at the HeapLimitState boxed in `run_script`, which
    // unregisters this callback before the box is dropped.
    let state = unsafe { &*(data as *const HeapLimitState) };
    if !state.triggered.swap(true, Ordering::SeqCst) {
        state.handle.terminate_execution();
    }
    current_heap_limit + 1024 * 1024
}

/// The fast path for ECMAScript-family languages
#[derive(Debug, Default, Clone, Copy)]
pub struct ScriptExecutor;

impl ScriptExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl RuntimeExecutor for ScriptExecutor {
    fn name(&self) -> &'static str {
        "script"
    }

    async fn execute(&self, ctx: ExecutionContext<'_>) -> Result<RawOutcome, SandboxError> {
        info!(
            execution_id = %ctx.execution_id,
            language = %ctx.environment.language_key,
            "ScriptExecutor: executing request"
        );

        let job = ScriptJob {
            source: ctx.request.source_code.clone(),
            stdin: ctx.request.stdin.clone(),
            timeout: ctx.limits.timeout,
            memory_limit_mb: ctx.limits.memory_limit_mb,
            max_output_bytes: ctx.limits.max_output_bytes,
        };

        let (tx, rx) = tokio::sync::oneshot::channel();
        std::thread::Builder::new()
            .name("script-sandbox".to_string())
            .spawn(move || {
                let outcome = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt.block_on(run_script(job)),
                    Err(e) => Err(SandboxError::Infrastructure(format!(
                        "failed to build script runtime: {}",
                        e
                    ))),
                };
                if tx.send(outcome).is_err() {
                    warn!("Script result receiver dropped before the result was sent");
                }
            })?;

        rx.await.map_err(|_| {
            SandboxError::Infrastructure("script sandbox thread panicked".to_string())
        })?
    }
}

/// Runs on the dedicated isolate thread
async fn run_script(job: ScriptJob) -> Result<RawOutcome, SandboxError> {
    let heap_limit = (job.memory_limit_mb as usize) * 1024 * 1024;
    let create_params = v8::CreateParams::default().heap_limits(0, heap_limit);
    let mut runtime = JsRuntime::new(RuntimeOptions {
        create_params: Some(create_params),
        ..Default::default()
    });

    let heap_state = Box::new(HeapLimitState {
        handle: runtime.v8_isolate().thread_safe_handle(),
        triggered: AtomicBool::new(false),
    });
    runtime.v8_isolate().add_near_heap_limit_callback(
        near_heap_limit_callback,
        &*heap_state as *const HeapLimitState as *mut std::ffi::c_void,
    );

    let outcome = drive(&mut runtime, &heap_state, &job).await;

    runtime
        .v8_isolate()
        .remove_near_heap_limit_callback(near_heap_limit_callback, 0);
    outcome
}

async fn drive(
    runtime: &mut JsRuntime,
    heap_state: &HeapLimitState,
    job: &ScriptJob,
) -> Result<RawOutcome, SandboxError> {
    let stdin = serde_json::to_string(&job.stdin)
        .map_err(|e| SandboxError::Infrastructure(format!("failed to encode stdin: {}", e)))?;
    let prelude = format!("{}({}, {});", PRELUDE, stdin, job.max_output_bytes);
    runtime
        .execute_script("[sandbox:prelude]", prelude)
        .map_err(|e| {
            SandboxError::Infrastructure(format!("failed to initialise script sandbox: {}", e))
        })?;

    // One budget covers the synchronous run and the event loop after it
    let deadline = Instant::now() + job.timeout;
    let terminator = runtime.v8_isolate().thread_safe_handle();
    let watchdog = ArmedWatchdog::arm(job.timeout, move || {
        terminator.terminate_execution();
    })?;

    let mut settled_late = false;
    let script_error = match runtime.execute_script("main.js", job.source.clone()) {
        Ok(_) => match tokio::time::timeout(
            remaining(deadline),
            runtime.run_event_loop(PollEventLoopOptions::default()),
        )
        .await
        {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => {
                settled_late = true;
                None
            }
        },
        Err(e) => Some(e.to_string()),
    };

    let timed_out = watchdog.disarm() || settled_late;
    let heap_exceeded = heap_state.triggered.load(Ordering::SeqCst);

    // Leave the terminating state so the captured output can be read back
    runtime.v8_isolate().cancel_terminate_execution();
    let captured = read_captured(runtime).unwrap_or_else(|e| {
        warn!("Could not read captured script output: {}", e);
        CapturedConsole::default()
    });

    let mut stdout = String::new();
    let mut stderr = String::new();
    let mut truncated = captured.truncated;
    truncated |= !append_capped(&mut stdout, &captured.stdout, job.max_output_bytes);
    truncated |= !append_capped(
        &mut stderr,
        &captured.stderr,
        job.max_output_bytes.saturating_sub(stdout.len()),
    );
    if truncated {
        stdout.push_str(TRUNCATION_MARKER);
    }

    let status = if heap_exceeded {
        push_line(&mut stderr, &format!("Memory limit of {} MB exceeded", job.memory_limit_mb));
        ExecutionStatus::MemoryExceeded
    } else if timed_out {
        push_line(
            &mut stderr,
            &format!("Execution timed out after {} ms", job.timeout.as_millis()),
        );
        ExecutionStatus::Error
    } else if let Some(error) = script_error {
        push_line(&mut stderr, error.lines().next().unwrap_or("Uncaught error"));
        ExecutionStatus::Error
    } else {
        ExecutionStatus::Success
    };

    debug!(%status, timed_out, heap_exceeded, "Script finished");

    let memory_used_bytes = (stdout.len() + stderr.len() + job.source.len()) as u64;
    Ok(RawOutcome {
        status,
        stdout,
        stderr,
        memory_used_bytes,
    })
}

fn read_captured(runtime: &mut JsRuntime) -> Result<CapturedConsole, SandboxError> {
    let value = runtime
        .execute_script("[sandbox:collect]", "globalThis.__capturedOutput")
        .map_err(|e| SandboxError::Infrastructure(e.to_string()))?;

    let json = {
        let scope = &mut runtime.handle_scope();
        let local = v8::Local::new(scope, value);
        local.to_rust_string_lossy(scope)
    };

    serde_json::from_str(&json).map_err(|e| SandboxError::Infrastructure(e.to_string()))
}

/// Time left until `deadline`, zero once it has passed
fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

fn push_line(buffer: &mut String, line: &str) {
    if !buffer.is_empty() && !buffer.ends_with('\n') {
        buffer.push('\n');
    }
    buffer.push_str(line);
}
