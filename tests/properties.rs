//! Property-style checks over randomized plans: event-log monotonicity,
//! node-status legality, and predecessor respect.

mod common;

use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use serde_json::Value;

use common::{NodeScript, ScriptedDriver, statuses_of};
use runloom::config::EngineConfig;
use runloom::engine::Engine;
use runloom::events::{Event, EventKind};
use runloom::plan::{NodeSpec, Plan};
use runloom::store::{MemoryStore, RunStore};

/// One random node: which earlier nodes it depends on, and its scripted
/// exit codes (1s then maybe a 0) against its retry budget.
#[derive(Clone, Debug)]
struct NodePlan {
    deps: Vec<usize>,
    failures: u32,
    retries: u32,
}

fn node_plan(max_index: usize) -> impl Strategy<Value = NodePlan> {
    let deps = proptest::collection::vec(0..max_index.max(1), 0..=max_index.min(2));
    (deps, 0u32..3, 0u32..3).prop_map(|(deps, failures, retries)| {
        let mut deps = deps;
        deps.sort_unstable();
        deps.dedup();
        NodePlan {
            deps,
            failures,
            retries,
        }
    })
}

fn dag_strategy() -> impl Strategy<Value = Vec<NodePlan>> {
    (1usize..6).prop_flat_map(|n| {
        let nodes: Vec<_> = (0..n).map(node_plan).collect();
        nodes
    })
}

/// Observed wire statuses for one node must be a prefix of:
/// `queued (running queued)* running {succeeded|failed}` or `queued skipped`.
fn legal_status_sequence(statuses: &[String]) -> bool {
    let mut it = statuses.iter().map(String::as_str);
    if it.next() != Some("queued") {
        return false;
    }
    let rest: Vec<&str> = it.collect();
    if rest.is_empty() {
        return true;
    }
    if rest == ["skipped"] {
        return true;
    }
    let mut expect_running = true;
    for (i, status) in rest.iter().enumerate() {
        let last = i == rest.len() - 1;
        match (*status, expect_running, last) {
            ("running", true, _) => expect_running = false,
            ("queued", false, false) => expect_running = true,
            ("succeeded" | "failed", false, true) => {}
            _ => return false,
        }
    }
    true
}

fn run_dag(nodes: Vec<NodePlan>) -> (Vec<Event>, Vec<(String, String)>) {
    let runtime = tokio::runtime::Runtime::new().expect("runtime");
    runtime.block_on(async move {
        let store = Arc::new(MemoryStore::new());
        let driver = ScriptedDriver::new();
        driver.attach_store(Arc::clone(&store) as Arc<dyn RunStore>);
        let engine = Engine::new(
            Arc::clone(&store) as Arc<dyn RunStore>,
            Arc::clone(&driver) as Arc<dyn runloom::driver::Driver>,
            EngineConfig::default()
                .with_default_backoff_secs(0.005)
                .with_poll_interval(Duration::from_millis(5)),
        );

        let mut specs = Vec::new();
        let mut edges = Vec::new();
        for (i, node) in nodes.iter().enumerate() {
            let id = format!("n{i}");
            let mut codes: Vec<i32> = std::iter::repeat_n(1, node.failures as usize).collect();
            codes.push(0);
            driver.script(&id, NodeScript::exit_codes(&codes));
            let deps: Vec<String> = node
                .deps
                .iter()
                .filter(|d| **d < i)
                .map(|d| format!("n{d}"))
                .collect();
            for dep in &deps {
                edges.push((dep.clone(), id.clone()));
            }
            specs.push(NodeSpec::task(id, vec!["work".into()]).with_retries(node.retries));
        }

        let run = engine
            .launch("prop", Plan::new(specs, vec![]).tap_edges(&edges))
            .await
            .expect("launch");
        tokio::time::timeout(Duration::from_secs(10), engine.wait(&run.id))
            .await
            .expect("run finishes in bounded time")
            .expect("wait");

        let events = store.events_since(&run.id, 0).await.expect("events");
        (events, edges)
    })
}

/// Small helper so edges built as tuples read cleanly above.
trait TapEdges {
    fn tap_edges(self, edges: &[(String, String)]) -> Self;
}

impl TapEdges for Plan {
    fn tap_edges(mut self, edges: &[(String, String)]) -> Self {
        for (from, to) in edges {
            self.edges.push(runloom::plan::EdgeSpec {
                from: from.clone(),
                to: to.clone(),
            });
        }
        self
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    #[test]
    fn random_dags_preserve_log_invariants(nodes in dag_strategy()) {
        let n = nodes.len();
        let (events, edges) = run_dag(nodes);

        // Monotone, contiguous seq from 1.
        for (i, event) in events.iter().enumerate() {
            prop_assert_eq!(event.seq, i as u64 + 1);
        }

        // Every node's status sequence is legal.
        for i in 0..n {
            let id = format!("n{i}");
            let statuses = statuses_of(&events, &id);
            prop_assert!(
                legal_status_sequence(&statuses),
                "illegal sequence for {}: {:?}",
                id,
                statuses
            );
        }

        // Predecessor respect: v never starts before u resolves.
        for (u, v) in &edges {
            let v_running = events.iter().position(|e| {
                e.kind == EventKind::NodeStatus
                    && e.data.get("nodeId").and_then(Value::as_str) == Some(v.as_str())
                    && e.data.get("status").and_then(Value::as_str) == Some("running")
            });
            if let Some(v_running) = v_running {
                let u_resolved = events.iter().position(|e| {
                    e.kind == EventKind::NodeStatus
                        && e.data.get("nodeId").and_then(Value::as_str) == Some(u.as_str())
                        && matches!(
                            e.data.get("status").and_then(Value::as_str),
                            Some("succeeded") | Some("skipped")
                        )
                });
                prop_assert!(
                    u_resolved.is_some() && u_resolved.unwrap() < v_running,
                    "{} ran before {} resolved",
                    v,
                    u
                );
            }
        }

        // The run reached exactly one terminal status, last in the log.
        let terminal: Vec<&Event> = events
            .iter()
            .filter(|e| {
                e.kind == EventKind::RunStatus
                    && matches!(
                        e.data.get("status").and_then(Value::as_str),
                        Some("succeeded") | Some("failed") | Some("cancelled")
                    )
            })
            .collect();
        prop_assert_eq!(terminal.len(), 1);
        prop_assert_eq!(terminal[0].seq, events.last().unwrap().seq);
    }
}
