//! The run store: authoritative state for runs, node states, node outputs,
//! and the append-only event log.
//!
//! Everything the scheduler persists goes through [`RunStore`]; the engine
//! holds it as `Arc<dyn RunStore>` so in-memory and sqlite-backed stores are
//! interchangeable. The contract both must honor:
//!
//! - `seq` numbering per run is contiguous from 1, assigned in commit order.
//! - An `append_event` that returns has made the event visible to subsequent
//!   `events_since` calls *and* delivered it to every live subscriber's
//!   channel.
//! - Run and node transitions are checked against the automata in
//!   [`crate::types`]; an illegal transition changes nothing.

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::MemoryStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use miette::Diagnostic;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::events::{Event, EventInput};
use crate::plan::{Plan, PlanError};
use crate::types::{NodeState, NodeStateUpdate, NodeStatus, Run, RunFilter, RunStatus};

/// Store-level failures.
#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    InvalidPlan(#[from] PlanError),

    #[error("{entity} not found: {id}")]
    #[diagnostic(code(runloom::store::not_found))]
    NotFound { entity: &'static str, id: String },

    #[error("run {run_id}: illegal status transition {from} -> {to}")]
    #[diagnostic(code(runloom::store::invalid_run_transition))]
    InvalidRunTransition {
        run_id: String,
        from: RunStatus,
        to: RunStatus,
    },

    #[error("run {run_id} node {node_id}: illegal status transition {from} -> {to}")]
    #[diagnostic(code(runloom::store::invalid_node_transition))]
    InvalidNodeTransition {
        run_id: String,
        node_id: String,
        from: NodeStatus,
        to: NodeStatus,
    },

    #[error("store backend error: {message}")]
    #[diagnostic(code(runloom::store::backend))]
    Backend { message: String },
}

impl StoreError {
    pub fn run_not_found(id: &str) -> Self {
        StoreError::NotFound {
            entity: "run",
            id: id.to_string(),
        }
    }

    pub fn node_not_found(id: &str) -> Self {
        StoreError::NotFound {
            entity: "node",
            id: id.to_string(),
        }
    }
}

/// Authoritative state of runs. Safe for concurrent callers.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Validate and persist a plan, creating a `queued` run.
    async fn create_run(&self, name: &str, plan: Plan) -> Result<Run, StoreError>;

    async fn get_run(&self, run_id: &str) -> Result<Run, StoreError>;

    async fn list_runs(&self, filter: RunFilter) -> Result<Vec<Run>, StoreError>;

    async fn get_plan(&self, run_id: &str) -> Result<Plan, StoreError>;

    /// Transition the run's status. The store stamps `started_at` on entering
    /// `Running` and `finished_at` on entering a terminal status.
    async fn update_run_status(&self, run_id: &str, status: RunStatus) -> Result<Run, StoreError>;

    /// Transition to `Cancelled` when the run is queued or running; a no-op
    /// on already-terminal runs.
    async fn cancel_run(&self, run_id: &str) -> Result<Run, StoreError>;

    /// Node states are created lazily: a plan node (or an iteration-scoped
    /// `"body[3]"` entry derived from one) reads as `pending` until written.
    async fn get_node_state(&self, run_id: &str, node_id: &str) -> Result<NodeState, StoreError>;

    async fn list_node_states(&self, run_id: &str) -> Result<Vec<NodeState>, StoreError>;

    async fn update_node_state(
        &self,
        run_id: &str,
        node_id: &str,
        update: NodeStateUpdate,
    ) -> Result<NodeState, StoreError>;

    async fn set_node_outputs(
        &self,
        run_id: &str,
        node_id: &str,
        outputs: Map<String, Value>,
    ) -> Result<(), StoreError>;

    async fn get_node_outputs(
        &self,
        run_id: &str,
        node_id: &str,
    ) -> Result<Option<Map<String, Value>>, StoreError>;

    /// Assign the next `seq`, timestamp, persist, then notify subscribers.
    async fn append_event(&self, run_id: &str, input: EventInput) -> Result<Event, StoreError>;

    /// Events with `seq > last_seq`, in increasing `seq` order.
    async fn events_since(&self, run_id: &str, last_seq: u64) -> Result<Vec<Event>, StoreError>;

    /// The last `n` events, in increasing `seq` order.
    async fn last_events(&self, run_id: &str, n: usize) -> Result<Vec<Event>, StoreError>;

    /// Highest committed `seq` (0 for an empty log).
    async fn tail_seq(&self, run_id: &str) -> Result<u64, StoreError>;

    /// Live push of events appended after this call. Combined with
    /// [`events_since`](Self::events_since) the fanout layer builds a
    /// gap-free stream.
    async fn subscribe_events(
        &self,
        run_id: &str,
    ) -> Result<broadcast::Receiver<Event>, StoreError>;
}

/// Whether `node_id` belongs to `plan`, either directly or as an
/// iteration-scoped `"base[3]"` entry whose base is a plan node.
pub(crate) fn is_known_node(plan: &Plan, node_id: &str) -> bool {
    if plan.node(node_id).is_some() {
        return true;
    }
    if let Some(open) = node_id.rfind('[') {
        if node_id.ends_with(']') {
            let base = &node_id[..open];
            let index = &node_id[open + 1..node_id.len() - 1];
            return !index.is_empty()
                && index.bytes().all(|b| b.is_ascii_digit())
                && plan.node(base).is_some();
        }
    }
    false
}
