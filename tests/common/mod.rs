//! Shared fixtures: a scripted driver test double and event-log helpers.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::{Map, Value};
use tokio::sync::broadcast;

use runloom::driver::{Driver, DriverError, DriverNodeStatus};
use runloom::events::{Event, EventInput, EventKind};
use runloom::plan::Plan;
use runloom::store::{MemoryStore, RunStore, StoreError};
use runloom::types::{NodeState, NodeStateUpdate, NodeStatus, Run, RunFilter, RunStatus};

/// Per-node script: exit codes indexed by attempt (the last repeats), an
/// optional execution delay, and outputs written to the store on success.
#[derive(Clone, Default)]
pub struct NodeScript {
    pub exit_codes: Vec<i32>,
    pub delay: Duration,
    pub outputs: Option<Map<String, Value>>,
}

impl NodeScript {
    pub fn succeed() -> Self {
        Self::default()
    }

    pub fn exit_codes(codes: &[i32]) -> Self {
        Self {
            exit_codes: codes.to_vec(),
            ..Default::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_outputs(mut self, outputs: Map<String, Value>) -> Self {
        self.outputs = Some(outputs);
        self
    }
}

/// One recorded driver invocation.
#[derive(Clone, Debug)]
pub struct DriverCall {
    pub node_id: String,
    pub cmd: Vec<String>,
    pub env: FxHashMap<String, String>,
}

/// Driver test double with scripted outcomes and concurrency tracking.
///
/// Scripts are keyed by the node's base id, so iteration-scoped entries like
/// `"render[3]"` pick up the `"render"` script.
#[derive(Default)]
pub struct ScriptedDriver {
    store: Mutex<Option<Arc<dyn RunStore>>>,
    scripts: Mutex<FxHashMap<String, NodeScript>>,
    calls: Mutex<Vec<DriverCall>>,
    cancelled: Mutex<Vec<String>>,
    cleaned_runs: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach the store so scripted outputs can be written on success.
    pub fn attach_store(&self, store: Arc<dyn RunStore>) {
        *self.store.lock() = Some(store);
    }

    pub fn script(&self, node_id: &str, script: NodeScript) {
        self.scripts.lock().insert(node_id.to_string(), script);
    }

    pub fn calls(&self) -> Vec<DriverCall> {
        self.calls.lock().clone()
    }

    pub fn calls_for(&self, node_id: &str) -> Vec<DriverCall> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.node_id == node_id)
            .cloned()
            .collect()
    }

    pub fn cancelled_nodes(&self) -> Vec<String> {
        self.cancelled.lock().clone()
    }

    pub fn cleaned_runs(&self) -> Vec<String> {
        self.cleaned_runs.lock().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn script_for(&self, node_id: &str) -> NodeScript {
        let scripts = self.scripts.lock();
        if let Some(script) = scripts.get(node_id) {
            return script.clone();
        }
        scripts.get(base_id(node_id)).cloned().unwrap_or_default()
    }
}

/// `"render[3]"` → `"render"`.
pub fn base_id(node_id: &str) -> &str {
    match node_id.find('[') {
        Some(open) if node_id.ends_with(']') => &node_id[..open],
        _ => node_id,
    }
}

struct InFlightGuard<'a>(&'a ScriptedDriver);

impl<'a> InFlightGuard<'a> {
    fn enter(driver: &'a ScriptedDriver) -> Self {
        let now = driver.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        driver.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(driver)
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Driver for ScriptedDriver {
    async fn run_node(
        &self,
        run_id: &str,
        node_id: &str,
        cmd: &[String],
        env: &FxHashMap<String, String>,
        _timeout_secs: f64,
    ) -> Result<i32, DriverError> {
        let _guard = InFlightGuard::enter(self);
        self.calls.lock().push(DriverCall {
            node_id: node_id.to_string(),
            cmd: cmd.to_vec(),
            env: env.clone(),
        });

        let script = self.script_for(node_id);
        if !script.delay.is_zero() {
            tokio::time::sleep(script.delay).await;
        }

        let attempt: usize = env
            .get("ATTEMPT")
            .and_then(|a| a.parse().ok())
            .unwrap_or(1);
        let exit_code = match script.exit_codes.as_slice() {
            [] => 0,
            codes => *codes.get(attempt - 1).unwrap_or(codes.last().unwrap_or(&0)),
        };

        if exit_code == 0 {
            if let Some(outputs) = script.outputs {
                let store = self.store.lock().clone();
                if let Some(store) = store {
                    store
                        .set_node_outputs(run_id, node_id, outputs)
                        .await
                        .map_err(|e| DriverError::new(e.to_string()))?;
                }
            }
        }
        Ok(exit_code)
    }

    async fn node_status(
        &self,
        _run_id: &str,
        _node_id: &str,
    ) -> Result<DriverNodeStatus, DriverError> {
        Ok(DriverNodeStatus::Unknown)
    }

    async fn cancel_node(&self, _run_id: &str, node_id: &str) -> Result<(), DriverError> {
        self.cancelled.lock().push(node_id.to_string());
        Ok(())
    }

    async fn cleanup_run(&self, run_id: &str) -> Result<(), DriverError> {
        self.cleaned_runs.lock().push(run_id.to_string());
        Ok(())
    }
}

/// Store wrapper that injects backend faults on selected node-state writes.
///
/// A fault is keyed by base node id plus the status being written, so a test
/// can reject exactly the `running` transition (the node never starts) or
/// exactly the terminal write (the node sticks at `running` in the store).
pub struct FaultyStore {
    inner: Arc<MemoryStore>,
    faults: Mutex<Vec<(String, NodeStatus)>>,
}

impl FaultyStore {
    pub fn new(inner: Arc<MemoryStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            faults: Mutex::new(Vec::new()),
        })
    }

    pub fn fail_write(&self, node_id: &str, status: NodeStatus) {
        self.faults.lock().push((node_id.to_string(), status));
    }

    fn injected(&self, node_id: &str, update: &NodeStateUpdate) -> bool {
        let Some(status) = update.status else {
            return false;
        };
        self.faults
            .lock()
            .iter()
            .any(|(id, s)| id == base_id(node_id) && *s == status)
    }
}

#[async_trait]
impl RunStore for FaultyStore {
    async fn create_run(&self, name: &str, plan: Plan) -> Result<Run, StoreError> {
        self.inner.create_run(name, plan).await
    }

    async fn get_run(&self, run_id: &str) -> Result<Run, StoreError> {
        self.inner.get_run(run_id).await
    }

    async fn list_runs(&self, filter: RunFilter) -> Result<Vec<Run>, StoreError> {
        self.inner.list_runs(filter).await
    }

    async fn get_plan(&self, run_id: &str) -> Result<Plan, StoreError> {
        self.inner.get_plan(run_id).await
    }

    async fn update_run_status(&self, run_id: &str, status: RunStatus) -> Result<Run, StoreError> {
        self.inner.update_run_status(run_id, status).await
    }

    async fn cancel_run(&self, run_id: &str) -> Result<Run, StoreError> {
        self.inner.cancel_run(run_id).await
    }

    async fn get_node_state(&self, run_id: &str, node_id: &str) -> Result<NodeState, StoreError> {
        self.inner.get_node_state(run_id, node_id).await
    }

    async fn list_node_states(&self, run_id: &str) -> Result<Vec<NodeState>, StoreError> {
        self.inner.list_node_states(run_id).await
    }

    async fn update_node_state(
        &self,
        run_id: &str,
        node_id: &str,
        update: NodeStateUpdate,
    ) -> Result<NodeState, StoreError> {
        if self.injected(node_id, &update) {
            return Err(StoreError::Backend {
                message: format!("injected fault writing {node_id}"),
            });
        }
        self.inner.update_node_state(run_id, node_id, update).await
    }

    async fn set_node_outputs(
        &self,
        run_id: &str,
        node_id: &str,
        outputs: Map<String, Value>,
    ) -> Result<(), StoreError> {
        self.inner.set_node_outputs(run_id, node_id, outputs).await
    }

    async fn get_node_outputs(
        &self,
        run_id: &str,
        node_id: &str,
    ) -> Result<Option<Map<String, Value>>, StoreError> {
        self.inner.get_node_outputs(run_id, node_id).await
    }

    async fn append_event(&self, run_id: &str, input: EventInput) -> Result<Event, StoreError> {
        self.inner.append_event(run_id, input).await
    }

    async fn events_since(&self, run_id: &str, last_seq: u64) -> Result<Vec<Event>, StoreError> {
        self.inner.events_since(run_id, last_seq).await
    }

    async fn last_events(&self, run_id: &str, n: usize) -> Result<Vec<Event>, StoreError> {
        self.inner.last_events(run_id, n).await
    }

    async fn tail_seq(&self, run_id: &str) -> Result<u64, StoreError> {
        self.inner.tail_seq(run_id).await
    }

    async fn subscribe_events(
        &self,
        run_id: &str,
    ) -> Result<broadcast::Receiver<Event>, StoreError> {
        self.inner.subscribe_events(run_id).await
    }
}

/// Event-log helpers shared across tests.
pub fn kinds(events: &[Event]) -> Vec<EventKind> {
    events.iter().map(|e| e.kind).collect()
}

/// `(kind, nodeId, status)` triples for node_status events, everything else
/// as `(kind, "", "")` — a compact order fingerprint.
pub fn fingerprint(events: &[Event]) -> Vec<(EventKind, String, String)> {
    events
        .iter()
        .map(|e| {
            let node = e
                .data
                .get("nodeId")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let status = e
                .data
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            (e.kind, node, status)
        })
        .collect()
}

/// Index of the first event matching the predicate; panics if absent.
pub fn index_of<F: Fn(&Event) -> bool>(events: &[Event], what: &str, pred: F) -> usize {
    events
        .iter()
        .position(pred)
        .unwrap_or_else(|| panic!("no event matching: {what}"))
}

pub fn node_status_events<'a>(events: &'a [Event], node_id: &str) -> Vec<&'a Event> {
    events
        .iter()
        .filter(|e| {
            e.kind == EventKind::NodeStatus
                && e.data.get("nodeId").and_then(Value::as_str) == Some(node_id)
        })
        .collect()
}

pub fn statuses_of(events: &[Event], node_id: &str) -> Vec<String> {
    node_status_events(events, node_id)
        .iter()
        .filter_map(|e| e.data.get("status").and_then(Value::as_str))
        .map(str::to_string)
        .collect()
}

/// Assert seq numbers are contiguous from 1.
pub fn assert_contiguous(events: &[Event]) {
    for (i, event) in events.iter().enumerate() {
        assert_eq!(
            event.seq,
            i as u64 + 1,
            "event log must be contiguous from 1"
        );
    }
}
