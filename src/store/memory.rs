//! In-memory run store.
//!
//! One record per run behind its own mutex; `seq` assignment happens under
//! that lock, so append order, commit order, and broadcast order are the same
//! thing. Loses everything on restart by design — the sqlite store covers
//! durability.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::{RunStore, StoreError, is_known_node};
use crate::events::{Event, EventInput};
use crate::plan::Plan;
use crate::types::{NodeState, NodeStateUpdate, NodeStatus, Run, RunFilter, RunStatus};

const DEFAULT_EVENT_BUFFER: usize = 1024;

struct RunRecord {
    run: Run,
    plan: Plan,
    nodes: FxHashMap<String, NodeState>,
    outputs: FxHashMap<String, Map<String, Value>>,
    events: Vec<Event>,
    tx: broadcast::Sender<Event>,
}

impl RunRecord {
    fn tail_seq(&self) -> u64 {
        self.events.last().map(|e| e.seq).unwrap_or(0)
    }
}

/// Volatile [`RunStore`] implementation.
pub struct MemoryStore {
    runs: RwLock<FxHashMap<String, Arc<Mutex<RunRecord>>>>,
    event_buffer: usize,
    /// Head-truncation cap applied to completed runs; `None` keeps everything.
    retention: Option<usize>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_event_buffer(DEFAULT_EVENT_BUFFER)
    }

    pub fn with_event_buffer(event_buffer: usize) -> Self {
        Self {
            runs: RwLock::new(FxHashMap::default()),
            event_buffer: event_buffer.max(1),
            retention: None,
        }
    }

    /// Cap the number of events retained for completed runs. The tail is
    /// never truncated; replay from the head may come back short.
    #[must_use]
    pub fn with_retention(mut self, retention: usize) -> Self {
        self.retention = Some(retention.max(1));
        self
    }

    fn record(&self, run_id: &str) -> Result<Arc<Mutex<RunRecord>>, StoreError> {
        self.runs
            .read()
            .get(run_id)
            .cloned()
            .ok_or_else(|| StoreError::run_not_found(run_id))
    }

    fn apply_retention(&self, record: &mut RunRecord) {
        if let Some(cap) = self.retention {
            if record.run.status.is_terminal() && record.events.len() > cap {
                let drop_count = record.events.len() - cap;
                record.events.drain(..drop_count);
            }
        }
    }
}

#[async_trait]
impl RunStore for MemoryStore {
    async fn create_run(&self, name: &str, plan: Plan) -> Result<Run, StoreError> {
        plan.validate()?;
        let run = Run {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            status: RunStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };
        let (tx, _) = broadcast::channel(self.event_buffer);
        let record = RunRecord {
            run: run.clone(),
            plan,
            nodes: FxHashMap::default(),
            outputs: FxHashMap::default(),
            events: Vec::new(),
            tx,
        };
        self.runs
            .write()
            .insert(run.id.clone(), Arc::new(Mutex::new(record)));
        Ok(run)
    }

    async fn get_run(&self, run_id: &str) -> Result<Run, StoreError> {
        Ok(self.record(run_id)?.lock().run.clone())
    }

    async fn list_runs(&self, filter: RunFilter) -> Result<Vec<Run>, StoreError> {
        let mut runs: Vec<Run> = self
            .runs
            .read()
            .values()
            .map(|record| record.lock().run.clone())
            .filter(|run| filter.status.is_none_or(|s| run.status == s))
            .collect();
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        if filter.limit > 0 {
            runs.truncate(filter.limit);
        }
        Ok(runs)
    }

    async fn get_plan(&self, run_id: &str) -> Result<Plan, StoreError> {
        Ok(self.record(run_id)?.lock().plan.clone())
    }

    async fn update_run_status(&self, run_id: &str, status: RunStatus) -> Result<Run, StoreError> {
        let record = self.record(run_id)?;
        let mut record = record.lock();
        let current = record.run.status;
        if !current.can_transition_to(status) {
            return Err(StoreError::InvalidRunTransition {
                run_id: run_id.to_string(),
                from: current,
                to: status,
            });
        }
        let now = Utc::now();
        record.run.status = status;
        if status == RunStatus::Running && record.run.started_at.is_none() {
            record.run.started_at = Some(now);
        }
        if status.is_terminal() {
            record.run.finished_at = Some(now);
        }
        self.apply_retention(&mut record);
        Ok(record.run.clone())
    }

    async fn cancel_run(&self, run_id: &str) -> Result<Run, StoreError> {
        // Terminal check and transition under one lock: concurrent cancels
        // must both succeed, with exactly one of them performing the write.
        let record = self.record(run_id)?;
        let mut record = record.lock();
        if record.run.status.is_terminal() {
            return Ok(record.run.clone());
        }
        record.run.status = RunStatus::Cancelled;
        record.run.finished_at = Some(Utc::now());
        self.apply_retention(&mut record);
        Ok(record.run.clone())
    }

    async fn get_node_state(&self, run_id: &str, node_id: &str) -> Result<NodeState, StoreError> {
        let record = self.record(run_id)?;
        let record = record.lock();
        if let Some(state) = record.nodes.get(node_id) {
            return Ok(state.clone());
        }
        if is_known_node(&record.plan, node_id) {
            return Ok(NodeState::pending(node_id));
        }
        Err(StoreError::node_not_found(node_id))
    }

    async fn list_node_states(&self, run_id: &str) -> Result<Vec<NodeState>, StoreError> {
        let record = self.record(run_id)?;
        let record = record.lock();
        let mut states: Vec<NodeState> = record
            .plan
            .nodes
            .iter()
            .map(|spec| {
                record
                    .nodes
                    .get(&spec.id)
                    .cloned()
                    .unwrap_or_else(|| NodeState::pending(&spec.id))
            })
            .collect();
        // Iteration-scoped entries come after the plan's own nodes.
        let mut extra: Vec<NodeState> = record
            .nodes
            .values()
            .filter(|state| record.plan.node(&state.node_id).is_none())
            .cloned()
            .collect();
        extra.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        states.extend(extra);
        Ok(states)
    }

    async fn update_node_state(
        &self,
        run_id: &str,
        node_id: &str,
        update: NodeStateUpdate,
    ) -> Result<NodeState, StoreError> {
        let record = self.record(run_id)?;
        let mut record = record.lock();
        if !record.nodes.contains_key(node_id) {
            if !is_known_node(&record.plan, node_id) {
                return Err(StoreError::node_not_found(node_id));
            }
            record
                .nodes
                .insert(node_id.to_string(), NodeState::pending(node_id));
        }
        // Entry guaranteed above; split borrow keeps the map access local.
        let Some(state) = record.nodes.get_mut(node_id) else {
            return Err(StoreError::node_not_found(node_id));
        };
        if let Some(status) = update.status {
            if !state.status.can_transition_to(status) {
                return Err(StoreError::InvalidNodeTransition {
                    run_id: run_id.to_string(),
                    node_id: node_id.to_string(),
                    from: state.status,
                    to: status,
                });
            }
            let now = Utc::now();
            state.status = status;
            if status == NodeStatus::Running && state.started_at.is_none() {
                state.started_at = Some(now);
            }
            if status.is_terminal() {
                state.finished_at = Some(now);
            }
        }
        if let Some(exit_code) = update.exit_code {
            state.exit_code = Some(exit_code);
        }
        if let Some(retries) = update.retries {
            state.retries = retries;
        }
        if let Some(error) = update.error {
            state.error = Some(error);
        }
        Ok(state.clone())
    }

    async fn set_node_outputs(
        &self,
        run_id: &str,
        node_id: &str,
        outputs: Map<String, Value>,
    ) -> Result<(), StoreError> {
        let record = self.record(run_id)?;
        let mut record = record.lock();
        if !is_known_node(&record.plan, node_id) {
            return Err(StoreError::node_not_found(node_id));
        }
        record.outputs.insert(node_id.to_string(), outputs);
        Ok(())
    }

    async fn get_node_outputs(
        &self,
        run_id: &str,
        node_id: &str,
    ) -> Result<Option<Map<String, Value>>, StoreError> {
        let record = self.record(run_id)?;
        let record = record.lock();
        if !is_known_node(&record.plan, node_id) {
            return Err(StoreError::node_not_found(node_id));
        }
        Ok(record.outputs.get(node_id).cloned())
    }

    async fn append_event(&self, run_id: &str, input: EventInput) -> Result<Event, StoreError> {
        let record = self.record(run_id)?;
        let mut record = record.lock();
        let event = Event {
            seq: record.tail_seq() + 1,
            run_id: run_id.to_string(),
            kind: input.kind,
            node_id: input.node_id,
            data: input.data,
            ts: Utc::now(),
        };
        record.events.push(event.clone());
        // No receivers is fine; replay covers late subscribers.
        let _ = record.tx.send(event.clone());
        Ok(event)
    }

    async fn events_since(&self, run_id: &str, last_seq: u64) -> Result<Vec<Event>, StoreError> {
        let record = self.record(run_id)?;
        let record = record.lock();
        Ok(record
            .events
            .iter()
            .filter(|e| e.seq > last_seq)
            .cloned()
            .collect())
    }

    async fn last_events(&self, run_id: &str, n: usize) -> Result<Vec<Event>, StoreError> {
        let record = self.record(run_id)?;
        let record = record.lock();
        let skip = record.events.len().saturating_sub(n);
        Ok(record.events[skip..].to_vec())
    }

    async fn tail_seq(&self, run_id: &str) -> Result<u64, StoreError> {
        Ok(self.record(run_id)?.lock().tail_seq())
    }

    async fn subscribe_events(
        &self,
        run_id: &str,
    ) -> Result<broadcast::Receiver<Event>, StoreError> {
        Ok(self.record(run_id)?.lock().tx.subscribe())
    }
}
