//! Multi-language execution sandbox.
//!
//! Requests pass the [`validator`], then run either in an embedded script
//! isolate or in a locked-down container, and come back as an
//! [`runtime::ExecutionResult`]. See [`Sandbox`] for the entry point.

pub mod analyzer;
pub mod assembler;
pub mod config;
pub mod health;
pub mod registry;
pub mod runtime;
pub mod runtimes;
pub mod sandbox;
pub mod telemetry;
pub mod validator;
pub mod watchdog;
pub mod workspace;

#[cfg(test)]
mod test_support;

pub use runtime::{ExecutionRequest, ExecutionResult, ExecutionStatus};
pub use sandbox::{Sandbox, SandboxError};
