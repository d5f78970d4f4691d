mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value, json};

use common::{NodeScript, ScriptedDriver, statuses_of};
use runloom::config::EngineConfig;
use runloom::engine::Engine;
use runloom::events::{Event, EventKind};
use runloom::plan::{
    BranchTargets, ConditionalConfig, ConditionalKind, ForEachConfig, NodeSpec, Plan,
};
use runloom::store::{MemoryStore, RunStore};
use runloom::types::{NodeStatus, RunStatus};

fn fast_config() -> EngineConfig {
    EngineConfig::default()
        .with_default_backoff_secs(0.02)
        .with_poll_interval(Duration::from_millis(10))
}

struct Harness {
    store: Arc<MemoryStore>,
    driver: Arc<ScriptedDriver>,
    engine: Engine,
}

fn harness(config: EngineConfig) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let driver = ScriptedDriver::new();
    driver.attach_store(Arc::clone(&store) as Arc<dyn RunStore>);
    let engine = Engine::new(
        Arc::clone(&store) as Arc<dyn RunStore>,
        Arc::clone(&driver) as Arc<dyn runloom::driver::Driver>,
        config,
    );
    Harness {
        store,
        driver,
        engine,
    }
}

async fn events_of(store: &Arc<MemoryStore>, run_id: &str) -> Vec<Event> {
    store.events_since(run_id, 0).await.unwrap()
}

fn branches(entries: &[(&str, &[&str])]) -> BTreeMap<String, BranchTargets> {
    entries
        .iter()
        .map(|(label, targets)| {
            (
                label.to_string(),
                BranchTargets {
                    targets: targets.iter().map(|t| t.to_string()).collect(),
                },
            )
        })
        .collect()
}

fn score_outputs(score: f64) -> Map<String, Value> {
    let mut outputs = Map::new();
    outputs.insert("score".into(), json!(score));
    outputs
}

/// S3-style plan: input feeds an if-conditional; true -> ok, false -> bad
/// with a child hanging off it.
fn if_plan() -> Plan {
    Plan::new(
        vec![
            NodeSpec::task("input", vec!["produce".into()]),
            NodeSpec::conditional(
                "check",
                ConditionalConfig {
                    kind: ConditionalKind::If,
                    expression: "inputs.input.score > 0.5".into(),
                    branches: branches(&[("true", &["ok"]), ("false", &["bad"])]),
                    default_branch: None,
                },
            )
            .with_inputs(["input"]),
            NodeSpec::task("ok", vec!["ok-cmd".into()]),
            NodeSpec::task("bad", vec!["bad-cmd".into()]),
            NodeSpec::task("bad_child", vec!["bad-child-cmd".into()]).with_inputs(["bad"]),
        ],
        vec![],
    )
}

#[tokio::test]
async fn if_true_branch_skips_false_subtree() {
    let h = harness(fast_config());
    h.driver
        .script("input", NodeScript::succeed().with_outputs(score_outputs(0.9)));
    let run = h.engine.launch("s3", if_plan()).await.unwrap();
    h.engine.wait(&run.id).await.unwrap();

    assert_eq!(h.engine.status(&run.id).await.unwrap().status, RunStatus::Succeeded);

    let events = events_of(&h.store, &run.id).await;

    let evaluated = events
        .iter()
        .find(|e| e.kind == EventKind::ConditionEvaluated)
        .expect("condition_evaluated");
    assert_eq!(evaluated.data["expression"], "inputs.input.score > 0.5");
    assert_eq!(evaluated.data["result"], json!(true));

    let selected = events
        .iter()
        .find(|e| e.kind == EventKind::BranchSelected)
        .expect("branch_selected");
    assert_eq!(selected.data["branch"], "true");

    let skipped: Vec<&str> = events
        .iter()
        .filter(|e| e.kind == EventKind::BranchSkipped)
        .filter_map(|e| e.node_id.as_deref())
        .collect();
    assert_eq!(skipped, vec!["bad", "bad_child"]);
    for skipped_node in ["bad", "bad_child"] {
        let state = h.store.get_node_state(&run.id, skipped_node).await.unwrap();
        assert_eq!(state.status, NodeStatus::Skipped);
        assert_eq!(
            statuses_of(&events, skipped_node).last().map(String::as_str),
            Some("skipped")
        );
    }

    // The selected branch ran, the skipped one never reached the driver.
    assert_eq!(h.driver.calls_for("ok").len(), 1);
    assert!(h.driver.calls_for("bad").is_empty());
    assert!(h.driver.calls_for("bad_child").is_empty());

    // Skips happen before the conditional's own success unlocks downstream.
    let check_success = common::index_of(&events, "check success", |e| {
        e.kind == EventKind::NodeStatus
            && e.data.get("nodeId").and_then(Value::as_str) == Some("check")
            && e.data.get("status").and_then(Value::as_str) == Some("succeeded")
    });
    let bad_skip = common::index_of(&events, "bad skipped", |e| {
        e.kind == EventKind::NodeStatus
            && e.data.get("nodeId").and_then(Value::as_str) == Some("bad")
            && e.data.get("status").and_then(Value::as_str) == Some("skipped")
    });
    assert!(bad_skip < check_success);
}

#[tokio::test]
async fn if_false_branch_runs_the_other_side() {
    let h = harness(fast_config());
    h.driver
        .script("input", NodeScript::succeed().with_outputs(score_outputs(0.1)));
    let run = h.engine.launch("s3-false", if_plan()).await.unwrap();
    h.engine.wait(&run.id).await.unwrap();

    assert_eq!(h.engine.status(&run.id).await.unwrap().status, RunStatus::Succeeded);
    assert!(h.driver.calls_for("ok").is_empty());
    assert_eq!(h.driver.calls_for("bad").len(), 1);
    assert_eq!(h.driver.calls_for("bad_child").len(), 1);
}

#[tokio::test]
async fn switch_falls_back_to_default() {
    let h = harness(fast_config());
    let mut outputs = Map::new();
    outputs.insert("category".into(), json!("X"));
    h.driver
        .script("input", NodeScript::succeed().with_outputs(outputs));

    let plan = Plan::new(
        vec![
            NodeSpec::task("input", vec!["produce".into()]),
            NodeSpec::conditional(
                "router",
                ConditionalConfig {
                    kind: ConditionalKind::Switch,
                    expression: "inputs.input.category".into(),
                    branches: branches(&[("A", &["a"]), ("B", &["b"]), ("D", &["d"])]),
                    default_branch: Some("D".into()),
                },
            )
            .with_inputs(["input"]),
            NodeSpec::task("a", vec!["a-cmd".into()]),
            NodeSpec::task("b", vec!["b-cmd".into()]),
            NodeSpec::task("d", vec!["d-cmd".into()]),
        ],
        vec![],
    );
    let run = h.engine.launch("s4", plan).await.unwrap();
    h.engine.wait(&run.id).await.unwrap();

    let events = events_of(&h.store, &run.id).await;
    let selected = events
        .iter()
        .find(|e| e.kind == EventKind::BranchSelected)
        .expect("branch_selected");
    assert_eq!(selected.data["branch"], "D");

    assert_eq!(h.driver.calls_for("d").len(), 1);
    assert!(h.driver.calls_for("a").is_empty());
    assert!(h.driver.calls_for("b").is_empty());
    assert_eq!(h.engine.status(&run.id).await.unwrap().status, RunStatus::Succeeded);
}

#[tokio::test]
async fn switch_without_match_or_default_fails_the_node() {
    let h = harness(fast_config());
    let mut outputs = Map::new();
    outputs.insert("category".into(), json!("X"));
    h.driver
        .script("input", NodeScript::succeed().with_outputs(outputs));

    let plan = Plan::new(
        vec![
            NodeSpec::task("input", vec!["produce".into()]),
            NodeSpec::conditional(
                "router",
                ConditionalConfig {
                    kind: ConditionalKind::Switch,
                    expression: "inputs.input.category".into(),
                    branches: branches(&[("A", &["a"])]),
                    default_branch: None,
                },
            )
            .with_inputs(["input"]),
            NodeSpec::task("a", vec!["a-cmd".into()]),
        ],
        vec![],
    );
    let run = h.engine.launch("nomatch", plan).await.unwrap();
    h.engine.wait(&run.id).await.unwrap();

    assert_eq!(h.engine.status(&run.id).await.unwrap().status, RunStatus::Failed);
    let state = h.store.get_node_state(&run.id, "router").await.unwrap();
    assert_eq!(state.status, NodeStatus::Failed);
    assert!(state.error.as_deref().unwrap_or_default().contains("no branch"));
}

#[tokio::test]
async fn expression_errors_fail_without_retry() {
    let h = harness(fast_config());
    let plan = Plan::new(
        vec![
            NodeSpec::conditional(
                "broken",
                ConditionalConfig {
                    kind: ConditionalKind::If,
                    expression: "1 +".into(),
                    branches: branches(&[("true", &[]), ("false", &[])]),
                    default_branch: None,
                },
            )
            // A generous retry budget that must be ignored for control flow.
            .with_retries(5),
        ],
        vec![],
    );
    let run = h.engine.launch("exprfail", plan).await.unwrap();
    h.engine.wait(&run.id).await.unwrap();

    assert_eq!(h.engine.status(&run.id).await.unwrap().status, RunStatus::Failed);
    let events = events_of(&h.store, &run.id).await;
    // Exactly one running and one failed status; no retry requeues.
    assert_eq!(statuses_of(&events, "broken"), vec!["queued", "running", "failed"]);
}

#[tokio::test]
async fn shared_downstream_of_both_branches_is_not_skipped() {
    // `merge` hangs off both branches; skipping the losing branch must leave
    // it runnable exactly once.
    let h = harness(fast_config());
    h.driver
        .script("input", NodeScript::succeed().with_outputs(score_outputs(0.9)));
    let plan = Plan::new(
        vec![
            NodeSpec::task("input", vec!["produce".into()]),
            NodeSpec::conditional(
                "check",
                ConditionalConfig {
                    kind: ConditionalKind::If,
                    expression: "inputs.input.score > 0.5".into(),
                    branches: branches(&[("true", &["ok"]), ("false", &["bad"])]),
                    default_branch: None,
                },
            )
            .with_inputs(["input"]),
            NodeSpec::task("ok", vec!["ok-cmd".into()]),
            NodeSpec::task("bad", vec!["bad-cmd".into()]),
            NodeSpec::task("merge", vec!["merge-cmd".into()]).with_inputs(["ok", "bad"]),
        ],
        vec![],
    );
    let run = h.engine.launch("diamond", plan).await.unwrap();
    h.engine.wait(&run.id).await.unwrap();

    assert_eq!(h.engine.status(&run.id).await.unwrap().status, RunStatus::Succeeded);
    // merge ran exactly once: one skipped predecessor plus one succeeded.
    assert_eq!(h.driver.calls_for("merge").len(), 1);
    let state = h.store.get_node_state(&run.id, "merge").await.unwrap();
    assert_eq!(state.status, NodeStatus::Succeeded);
}

fn loop_plan(max_parallel: u32, items: Value) -> (Plan, Map<String, Value>) {
    let mut outputs = Map::new();
    outputs.insert("items".into(), items);
    let plan = Plan::new(
        vec![
            NodeSpec::task("seed", vec!["produce".into()]),
            NodeSpec::for_each(
                "fanout",
                ForEachConfig {
                    collection: "inputs.seed.items".into(),
                    item_var: "item".into(),
                    index_var: Some("idx".into()),
                    max_parallel,
                    body: vec!["render".into()],
                },
            )
            .with_inputs(["seed"]),
            NodeSpec::task("render", vec!["render-cmd".into()]),
            NodeSpec::task("after", vec!["after-cmd".into()]).with_inputs(["fanout"]),
        ],
        vec![],
    );
    (plan, outputs)
}

#[tokio::test]
async fn for_each_runs_all_iterations_within_the_bound() {
    let h = harness(fast_config());
    let (plan, outputs) = loop_plan(3, json!(["a", "b", "c", "d", "e", "f"]));
    h.driver
        .script("seed", NodeScript::succeed().with_outputs(outputs));
    h.driver
        .script("render", NodeScript::succeed().with_delay(Duration::from_millis(40)));

    let run = h.engine.launch("s5", plan).await.unwrap();
    h.engine.wait(&run.id).await.unwrap();

    assert_eq!(h.engine.status(&run.id).await.unwrap().status, RunStatus::Succeeded);

    let events = events_of(&h.store, &run.id).await;
    let started = events
        .iter()
        .find(|e| e.kind == EventKind::LoopStarted)
        .expect("loop_started");
    assert_eq!(started.data["item_count"], 6);
    assert_eq!(started.data["max_parallel"], 3);

    let indices: Vec<u64> = events
        .iter()
        .filter(|e| e.kind == EventKind::LoopIteration)
        .map(|e| e.data["index"].as_u64().unwrap())
        .collect();
    assert_eq!(indices.len(), 6);
    let mut sorted = indices.clone();
    sorted.sort_unstable();
    assert_eq!(sorted, vec![0, 1, 2, 3, 4, 5]);

    let complete = events
        .iter()
        .find(|e| e.kind == EventKind::LoopComplete)
        .expect("loop_complete");
    assert_eq!(complete.data["iterations"], 6);
    assert!(complete.data.get("error").is_none());

    // Six body executions, never more than 3 in flight.
    assert_eq!(h.driver.calls().iter().filter(|c| c.node_id.starts_with("render[")).count(), 6);
    assert!(h.driver.max_in_flight() <= 3, "saw {}", h.driver.max_in_flight());

    // The loop gates its dependents like any other node.
    assert_eq!(h.driver.calls_for("after").len(), 1);
}

#[tokio::test]
async fn for_each_surfaces_iteration_env() {
    let h = harness(fast_config());
    let (plan, outputs) = loop_plan(1, json!(["alpha", "beta"]));
    h.driver
        .script("seed", NodeScript::succeed().with_outputs(outputs));

    let run = h.engine.launch("loopenv", plan).await.unwrap();
    h.engine.wait(&run.id).await.unwrap();

    let mut calls = h
        .driver
        .calls()
        .into_iter()
        .filter(|c| c.node_id.starts_with("render["))
        .collect::<Vec<_>>();
    calls.sort_by(|a, b| a.node_id.cmp(&b.node_id));
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].env["ITERATION_INDEX"], "0");
    assert_eq!(calls[0].env["LOOP_ITEM"], "alpha");
    assert_eq!(calls[0].env["LOOP_IDX"], "0");
    assert_eq!(calls[0].env["ATTEMPT"], "1");
    assert_eq!(calls[1].env["ITERATION_INDEX"], "1");
    assert_eq!(calls[1].env["LOOP_ITEM"], "beta");
}

#[tokio::test]
async fn empty_collection_completes_immediately() {
    let h = harness(fast_config());
    let (plan, outputs) = loop_plan(2, json!([]));
    h.driver
        .script("seed", NodeScript::succeed().with_outputs(outputs));

    let run = h.engine.launch("empty", plan).await.unwrap();
    h.engine.wait(&run.id).await.unwrap();

    assert_eq!(h.engine.status(&run.id).await.unwrap().status, RunStatus::Succeeded);
    let events = events_of(&h.store, &run.id).await;
    let complete = events
        .iter()
        .find(|e| e.kind == EventKind::LoopComplete)
        .expect("loop_complete");
    assert_eq!(complete.data["iterations"], 0);
    assert_eq!(complete.data["skipped"], true);
    assert!(h.driver.calls().iter().all(|c| !c.node_id.starts_with("render[")));
}

#[tokio::test]
async fn for_each_fails_fast_on_body_failure() {
    let h = harness(fast_config());
    let (plan, outputs) = loop_plan(1, json!([1, 2, 3, 4, 5, 6]));
    h.driver
        .script("seed", NodeScript::succeed().with_outputs(outputs));
    // Sequential loop; the second iteration blows up.
    h.driver.script(
        "render[1]",
        NodeScript::exit_codes(&[3]),
    );

    let run = h.engine.launch("failfast", plan).await.unwrap();
    h.engine.wait(&run.id).await.unwrap();

    assert_eq!(h.engine.status(&run.id).await.unwrap().status, RunStatus::Failed);

    let events = events_of(&h.store, &run.id).await;
    let complete = events
        .iter()
        .find(|e| e.kind == EventKind::LoopComplete)
        .expect("loop_complete");
    assert_eq!(complete.data["error"], true);
    // Fail-fast: iterations stop after the failing one.
    let issued = complete.data["iterations"].as_u64().unwrap();
    assert!(issued < 6, "no further iterations after a failure, saw {issued}");

    let state = h.store.get_node_state(&run.id, "fanout").await.unwrap();
    assert_eq!(state.status, NodeStatus::Failed);
    // Downstream of the failed loop never ran.
    assert!(h.driver.calls_for("after").is_empty());
}

#[tokio::test]
async fn for_each_non_collection_fails_the_node() {
    let h = harness(fast_config());
    let mut outputs = Map::new();
    outputs.insert("items".into(), json!(42));
    let (plan, _) = loop_plan(1, json!([]));
    h.driver
        .script("seed", NodeScript::succeed().with_outputs(outputs));

    let run = h.engine.launch("notacollection", plan).await.unwrap();
    h.engine.wait(&run.id).await.unwrap();

    assert_eq!(h.engine.status(&run.id).await.unwrap().status, RunStatus::Failed);
    let state = h.store.get_node_state(&run.id, "fanout").await.unwrap();
    assert_eq!(state.status, NodeStatus::Failed);
    assert!(
        state
            .error
            .as_deref()
            .unwrap_or_default()
            .contains("collection")
    );
}

#[tokio::test]
async fn loop_body_retries_within_an_iteration() {
    let h = harness(fast_config());
    let (mut plan, outputs) = loop_plan(1, json!(["only"]));
    // Give the body node a retry budget.
    for node in &mut plan.nodes {
        if node.id == "render" {
            node.retries = Some(2);
        }
    }
    h.driver
        .script("seed", NodeScript::succeed().with_outputs(outputs));
    h.driver.script("render", NodeScript::exit_codes(&[1, 0]));

    let run = h.engine.launch("bodyretry", plan).await.unwrap();
    h.engine.wait(&run.id).await.unwrap();

    assert_eq!(h.engine.status(&run.id).await.unwrap().status, RunStatus::Succeeded);
    let attempts: Vec<String> = h
        .driver
        .calls()
        .into_iter()
        .filter(|c| c.node_id == "render[0]")
        .map(|c| c.env["ATTEMPT"].clone())
        .collect();
    assert_eq!(attempts, vec!["1", "2"]);
    let state = h.store.get_node_state(&run.id, "render[0]").await.unwrap();
    assert_eq!(state.status, NodeStatus::Succeeded);
}
