//! Run event log records and the taxonomy of event types.
//!
//! Every state change in a run appends exactly one [`Event`]. The `kind`
//! selects the expected shape of `data`; `data` itself stays an opaque JSON
//! object so stores never need to understand payloads. Payload constructors
//! live on [`EventInput`] so the shapes are written down in one place.

pub mod fanout;
pub mod sse;

pub use fanout::{EventFanout, EventSubscription, StreamFrame, SubscribeOptions};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::types::{NodeStatus, RunStatus};

/// Event type taxonomy. Wire names are snake_case (`run_status`, ...).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Hello,
    RunStatus,
    NodeStatus,
    ConditionEvaluated,
    BranchSelected,
    BranchSkipped,
    LoopStarted,
    LoopIteration,
    LoopComplete,
    Checkpoint,
    Log,
    Progress,
    StreamData,
    Error,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Hello => "hello",
            EventKind::RunStatus => "run_status",
            EventKind::NodeStatus => "node_status",
            EventKind::ConditionEvaluated => "condition_evaluated",
            EventKind::BranchSelected => "branch_selected",
            EventKind::BranchSkipped => "branch_skipped",
            EventKind::LoopStarted => "loop_started",
            EventKind::LoopIteration => "loop_iteration",
            EventKind::LoopComplete => "loop_complete",
            EventKind::Checkpoint => "checkpoint",
            EventKind::Log => "log",
            EventKind::Progress => "progress",
            EventKind::StreamData => "stream_data",
            EventKind::Error => "error",
        }
    }
}

/// An immutable record in a run's event log.
///
/// `seq` strictly increases per run in commit order, contiguous from 1;
/// `(run_id, seq)` is unique. The string form of `seq` doubles as the SSE id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub seq: u64,
    pub run_id: String,
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub data: Value,
    pub ts: DateTime<Utc>,
}

impl Event {
    /// SSE id field: the string form of `seq`.
    pub fn id(&self) -> String {
        self.seq.to_string()
    }
}

/// What callers hand to `append_event`; the store assigns `seq` and `ts`.
#[derive(Clone, Debug, PartialEq)]
pub struct EventInput {
    pub kind: EventKind,
    pub node_id: Option<String>,
    pub data: Value,
}

impl EventInput {
    pub fn new(kind: EventKind, node_id: Option<String>, data: Value) -> Self {
        Self {
            kind,
            node_id,
            data,
        }
    }

    /// Merge one more field into the payload object.
    #[must_use]
    pub fn with_field(mut self, key: &str, value: Value) -> Self {
        if let Value::Object(map) = &mut self.data {
            map.insert(key.to_string(), value);
        }
        self
    }

    pub fn hello(run_id: &str) -> Self {
        Self::new(
            EventKind::Hello,
            None,
            json!({ "runId": run_id, "server_time": Utc::now().to_rfc3339() }),
        )
    }

    pub fn run_status(run_id: &str, status: RunStatus) -> Self {
        Self::new(
            EventKind::RunStatus,
            None,
            json!({ "runId": run_id, "status": status.as_str() }),
        )
    }

    pub fn node_status(run_id: &str, node_id: &str, status: NodeStatus) -> Self {
        Self::new(
            EventKind::NodeStatus,
            Some(node_id.to_string()),
            json!({ "runId": run_id, "nodeId": node_id, "status": status.wire_str() }),
        )
    }

    /// `node_status = queued` carrying retry bookkeeping.
    pub fn node_retry(run_id: &str, node_id: &str, attempts: u32, retry_in_secs: f64) -> Self {
        Self::node_status(run_id, node_id, NodeStatus::Pending)
            .with_field("attempts", json!(attempts))
            .with_field("retry_in", json!(retry_in_secs))
    }

    pub fn condition_evaluated(node_id: &str, expression: &str, result: &Value) -> Self {
        Self::new(
            EventKind::ConditionEvaluated,
            Some(node_id.to_string()),
            json!({ "expression": expression, "result": result }),
        )
    }

    pub fn branch_selected(node_id: &str, branch: &str, expression: &str) -> Self {
        Self::new(
            EventKind::BranchSelected,
            Some(node_id.to_string()),
            json!({ "branch": branch, "expression": expression }),
        )
    }

    /// Emitted once per node skipped because its branch was not selected.
    /// `node_id` is the skipped node; the payload names the conditional.
    pub fn branch_skipped(node_id: &str, conditional_node: &str, branch: &str) -> Self {
        Self::new(
            EventKind::BranchSkipped,
            Some(node_id.to_string()),
            json!({ "conditional_node": conditional_node, "branch": branch }),
        )
    }

    pub fn loop_started(
        node_id: &str,
        collection: &str,
        item_count: usize,
        max_parallel: u32,
    ) -> Self {
        Self::new(
            EventKind::LoopStarted,
            Some(node_id.to_string()),
            json!({
                "collection": collection,
                "item_count": item_count,
                "max_parallel": max_parallel,
            }),
        )
    }

    pub fn loop_iteration(node_id: &str, index: usize, item: &Value, total: usize) -> Self {
        Self::new(
            EventKind::LoopIteration,
            Some(node_id.to_string()),
            json!({ "index": index, "item": item, "total": total }),
        )
    }

    pub fn loop_complete(node_id: &str, iterations: usize, error: bool, skipped: bool) -> Self {
        let mut data = json!({ "iterations": iterations });
        if let Value::Object(map) = &mut data {
            if error {
                map.insert("error".into(), json!(true));
            }
            if skipped {
                map.insert("skipped".into(), json!(true));
            }
        }
        Self::new(EventKind::LoopComplete, Some(node_id.to_string()), data)
    }

    pub fn error(code: &str, message: &str, recoverable: bool) -> Self {
        Self::new(
            EventKind::Error,
            None,
            json!({ "code": code, "message": message, "recoverable": recoverable }),
        )
    }

    pub fn log(node_id: Option<&str>, level: &str, message: &str) -> Self {
        Self::new(
            EventKind::Log,
            node_id.map(str::to_string),
            json!({ "level": level, "message": message }),
        )
    }
}
