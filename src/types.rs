//! Run and node state machines shared by every store implementation.
//!
//! The legality of a transition lives here, not in the stores: both the
//! in-memory and the sqlite store call [`RunStatus::can_transition_to`] and
//! [`NodeStatus::can_transition_to`] before committing anything, so every
//! observer sees the same automaton.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a run.
///
/// `Queued → Running → {Succeeded, Failed, Cancelled}`; terminal statuses are
/// permanent. `Queued → Cancelled` is also legal (cancelling before start).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    /// Whether the automaton permits moving from `self` to `next`.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, next),
            (Queued, Running) | (Queued, Cancelled) | (Running, Succeeded | Failed | Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a single node within a run.
///
/// `Pending → Running → {Succeeded, Failed}` and `Pending → Skipped`. The
/// retry loop re-enters `Pending` from `Running`; the scheduler bounds how
/// many times that edge may be taken.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl NodeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NodeStatus::Succeeded | NodeStatus::Failed | NodeStatus::Skipped
        )
    }

    pub fn can_transition_to(self, next: NodeStatus) -> bool {
        use NodeStatus::*;
        matches!(
            (self, next),
            (Pending, Running | Skipped) | (Running, Succeeded | Failed | Pending)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Running => "running",
            NodeStatus::Succeeded => "succeeded",
            NodeStatus::Failed => "failed",
            NodeStatus::Skipped => "skipped",
        }
    }

    /// Status label used in `node_status` event payloads.
    ///
    /// The event taxonomy reports a pending node as `queued` (it is queued
    /// behind its predecessors or a retry backoff); the store-level status
    /// name stays `pending`.
    pub fn wire_str(self) -> &'static str {
        match self {
            NodeStatus::Pending => "queued",
            other => other.as_str(),
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One attempted execution of a plan.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub name: String,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Per-node execution state within a run.
///
/// `retries` counts attempts already consumed; `exit_code` and `error` are
/// populated on terminal transitions only.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeState {
    pub node_id: String,
    pub status: NodeStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub retries: u32,
    pub error: Option<String>,
}

impl NodeState {
    pub fn pending(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            status: NodeStatus::Pending,
            started_at: None,
            finished_at: None,
            exit_code: None,
            retries: 0,
            error: None,
        }
    }
}

/// Partial update applied to a [`NodeState`] through the store.
///
/// Timestamps are assigned by the store at commit time so they stay monotonic
/// per run: `started_at` when entering `Running`, `finished_at` when entering
/// a terminal status.
#[derive(Clone, Debug, Default)]
pub struct NodeStateUpdate {
    pub status: Option<NodeStatus>,
    pub exit_code: Option<i32>,
    pub retries: Option<u32>,
    pub error: Option<String>,
}

impl NodeStateUpdate {
    pub fn to(status: NodeStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_exit_code(mut self, exit_code: i32) -> Self {
        self.exit_code = Some(exit_code);
        self
    }

    #[must_use]
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Filter for [`RunStore::list_runs`](crate::store::RunStore::list_runs).
#[derive(Clone, Debug, Default)]
pub struct RunFilter {
    /// Only return runs with this status.
    pub status: Option<RunStatus>,
    /// Cap the number of returned runs (0 means unlimited).
    pub limit: usize,
}
