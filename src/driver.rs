//! The execution backend contract.
//!
//! The engine never runs user commands itself; it hands them to an injected
//! [`Driver`] — a container launcher, a local process runner, a remote worker
//! pool. The scheduler only assumes the contract below.
//!
//! Cancellation is cooperative the Rust way: the scheduler races the
//! [`Driver::run_node`] future against the run's cancel token and drops the
//! future on the losing side, then calls [`Driver::cancel_node`] so the
//! backend can tear down whatever the dropped future left behind.

use async_trait::async_trait;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::plan::NodeSpec;

/// Backend-reported status of a node execution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriverNodeStatus {
    Unknown,
    Running,
    Exited(i32),
}

/// Error from the execution backend. Treated as a non-zero exit code and
/// subject to the node's retry policy.
#[derive(Debug, Error, Diagnostic)]
#[error("driver error: {message}")]
#[diagnostic(code(runloom::driver::backend))]
pub struct DriverError {
    pub message: String,
}

impl DriverError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Contract between the scheduler and the execution backend.
///
/// `run_node` is synchronous from the scheduler's point of view: it resolves
/// once the task has exited, with exit code 0 iff the task succeeded. It must
/// unwind promptly when its future is dropped. `timeout_secs` is advisory
/// (0 means none); the backend is expected to enforce it and return a
/// non-zero exit code, with the scheduler falling back to hard cancellation
/// if it doesn't.
#[async_trait]
pub trait Driver: Send + Sync {
    async fn run_node(
        &self,
        run_id: &str,
        node_id: &str,
        cmd: &[String],
        env: &FxHashMap<String, String>,
        timeout_secs: f64,
    ) -> Result<i32, DriverError>;

    async fn node_status(
        &self,
        run_id: &str,
        node_id: &str,
    ) -> Result<DriverNodeStatus, DriverError>;

    /// Tear down a node execution out of band (timeout overrun, run cancel).
    async fn cancel_node(&self, run_id: &str, node_id: &str) -> Result<(), DriverError>;

    /// Release any backend resources held for a finished run.
    async fn cleanup_run(&self, run_id: &str) -> Result<(), DriverError>;
}

/// Maps a node spec to the command the driver should execute.
///
/// An empty command means the node is a successful no-op; the driver is not
/// invoked at all. The default resolver just forwards `spec.command`.
pub trait CommandResolver: Send + Sync {
    fn resolve(&self, spec: &NodeSpec) -> Vec<String>;
}

/// Resolver that uses the command embedded in the node spec.
#[derive(Clone, Copy, Debug, Default)]
pub struct SpecCommandResolver;

impl CommandResolver for SpecCommandResolver {
    fn resolve(&self, spec: &NodeSpec) -> Vec<String> {
        spec.command.clone()
    }
}
