//! Conditional branch selection and bounded for-each iteration.
//!
//! Both node kinds carry no user command; their effect on the DAG comes from
//! evaluating expressions. Evaluation errors fail the node with no retry.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;

use super::{DriverVerdict, SchedulerCore, wait_cancelled};
use crate::events::EventInput;
use crate::expr::{ExprEnv, stringify, truthy};
use crate::plan::{ConditionalKind, NodeSpec};
use crate::types::{NodeStateUpdate, NodeStatus};

/// What a conditional node resolved to.
pub(crate) enum ConditionalOutcome {
    Selected {
        expression: String,
        result: Value,
        selected: String,
    },
    Failed {
        error: String,
    },
}

/// How a for-each node ended.
pub(crate) enum LoopOutcome {
    Completed,
    Failed { error: String },
    Cancelled,
}

/// Evaluate a conditional's expression and pick the branch label.
///
/// `if`: truthy result selects `"true"`, otherwise `"false"`. `switch`: the
/// stringified result must name a branch, else the default applies, else the
/// node fails.
pub(crate) fn evaluate_conditional(
    core: &Arc<SchedulerCore>,
    spec: &NodeSpec,
    env: &ExprEnv,
) -> ConditionalOutcome {
    let Some(cfg) = &spec.conditional else {
        return ConditionalOutcome::Failed {
            error: "conditional node is missing its config".to_string(),
        };
    };
    let result = match core.evaluator.evaluate(&cfg.expression, env) {
        Ok(result) => result,
        Err(err) => {
            return ConditionalOutcome::Failed {
                error: err.to_string(),
            };
        }
    };
    let selected = match cfg.kind {
        ConditionalKind::If => {
            if truthy(&result) { "true" } else { "false" }.to_string()
        }
        ConditionalKind::Switch => {
            let label = stringify(&result);
            if cfg.branches.contains_key(&label) {
                label
            } else if let Some(default) = &cfg.default_branch {
                default.clone()
            } else {
                return ConditionalOutcome::Failed {
                    error: format!("switch result {label:?} matches no branch and no default"),
                };
            }
        }
    };
    ConditionalOutcome::Selected {
        expression: cfg.expression.clone(),
        result,
        selected,
    }
}

/// Execute a for-each node: resolve the collection, then run the body for
/// each item with concurrency bounded by `max(max_parallel, 1)`. Fail-fast:
/// a failed iteration stops new issues but already-started iterations drain.
pub(crate) async fn run_for_each(
    core: &Arc<SchedulerCore>,
    run_id: &str,
    spec: &NodeSpec,
    preds: &[String],
    body_specs: Vec<NodeSpec>,
    mut cancel: watch::Receiver<bool>,
) -> LoopOutcome {
    let Some(cfg) = spec.for_each.clone() else {
        return LoopOutcome::Failed {
            error: "for_each node is missing its config".to_string(),
        };
    };

    let env = match core.build_expr_env(run_id, &spec.id, preds).await {
        Ok(env) => env,
        Err(err) => {
            return LoopOutcome::Failed {
                error: err.to_string(),
            };
        }
    };
    let items = match core.evaluator.evaluate_slice(&cfg.collection, &env) {
        Ok(items) => items,
        Err(err) => {
            return LoopOutcome::Failed {
                error: err.to_string(),
            };
        }
    };

    core.emit(
        run_id,
        EventInput::loop_started(&spec.id, &cfg.collection, items.len(), cfg.max_parallel),
    )
    .await;

    if items.is_empty() {
        core.emit(run_id, EventInput::loop_complete(&spec.id, 0, false, true))
            .await;
        return LoopOutcome::Completed;
    }

    let bound = cfg.max_parallel.max(1) as usize;
    let iteration_sem = Arc::new(Semaphore::new(bound));
    let failure: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let total = items.len();
    let mut handles: Vec<JoinHandle<IterationEnd>> = Vec::new();
    let mut issued = 0usize;
    let mut cancelled = false;

    for (index, item) in items.into_iter().enumerate() {
        if failure.lock().is_some() {
            break;
        }
        let permit = tokio::select! {
            permit = Arc::clone(&iteration_sem).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            _ = wait_cancelled(&mut cancel) => {
                cancelled = true;
                break;
            }
        };
        if *cancel.borrow() {
            cancelled = true;
            break;
        }
        // Re-check after waiting on the permit; a bounded loop learns about
        // failures while blocked here.
        if failure.lock().is_some() {
            break;
        }

        core.emit(
            run_id,
            EventInput::loop_iteration(&spec.id, index, &item, total),
        )
        .await;
        issued += 1;

        let iteration = Iteration {
            core: Arc::clone(core),
            run_id: run_id.to_string(),
            loop_id: spec.id.clone(),
            body_specs: body_specs.clone(),
            item,
            index,
            item_var: cfg.item_var.clone(),
            index_var: cfg.index_var.clone(),
            failure: Arc::clone(&failure),
            cancel: cancel.clone(),
        };
        handles.push(tokio::spawn(async move {
            let end = iteration.run().await;
            drop(permit);
            end
        }));
    }

    for handle in handles {
        match handle.await {
            Ok(IterationEnd::Completed) => {}
            Ok(IterationEnd::Failed) => {}
            Ok(IterationEnd::Cancelled) => cancelled = true,
            Err(err) => {
                let mut slot = failure.lock();
                if slot.is_none() {
                    *slot = Some(format!("iteration task failed: {err}"));
                }
            }
        }
    }

    if cancelled && failure.lock().is_none() {
        return LoopOutcome::Cancelled;
    }

    let error = failure.lock().clone();
    core.emit(
        run_id,
        EventInput::loop_complete(&spec.id, issued, error.is_some(), false),
    )
    .await;
    match error {
        Some(error) => LoopOutcome::Failed { error },
        None => LoopOutcome::Completed,
    }
}

enum IterationEnd {
    Completed,
    Failed,
    Cancelled,
}

/// One loop iteration: the body nodes, in order, each through the normal
/// task machinery (driver invocation, state updates, node_status events)
/// against iteration-scoped `"body[index]"` store entries.
struct Iteration {
    core: Arc<SchedulerCore>,
    run_id: String,
    loop_id: String,
    body_specs: Vec<NodeSpec>,
    item: Value,
    index: usize,
    item_var: String,
    index_var: Option<String>,
    failure: Arc<Mutex<Option<String>>>,
    cancel: watch::Receiver<bool>,
}

impl Iteration {
    async fn run(mut self) -> IterationEnd {
        let body_specs = self.body_specs.clone();
        for spec in &body_specs {
            match self.run_body_node(spec).await {
                BodyEnd::Succeeded => {}
                BodyEnd::Failed(error) => {
                    let mut slot = self.failure.lock();
                    if slot.is_none() {
                        *slot = Some(error);
                    }
                    return IterationEnd::Failed;
                }
                BodyEnd::Cancelled => return IterationEnd::Cancelled,
            }
        }
        IterationEnd::Completed
    }

    async fn run_body_node(&mut self, spec: &NodeSpec) -> BodyEnd {
        let scoped_id = format!("{}[{}]", spec.id, self.index);
        let max_retries = spec.retries.unwrap_or(0);
        let mut attempts = 0u32;

        loop {
            // Body driver calls share the global parallelism budget.
            let _permit = match &self.core.semaphore {
                Some(semaphore) => {
                    let acquired = tokio::select! {
                        permit = Arc::clone(semaphore).acquire_owned() => permit.ok(),
                        _ = wait_cancelled(&mut self.cancel) => return BodyEnd::Cancelled,
                    };
                    acquired
                }
                None => None,
            };
            if *self.cancel.borrow() {
                return BodyEnd::Cancelled;
            }

            if let Err(err) = self
                .core
                .store
                .update_node_state(
                    &self.run_id,
                    &scoped_id,
                    NodeStateUpdate::to(NodeStatus::Running),
                )
                .await
            {
                return BodyEnd::Failed(err.to_string());
            }
            self.emit_body_status(&scoped_id, NodeStatus::Running, None)
                .await;

            let cmd = self.core.resolver.resolve(spec);
            if cmd.is_empty() {
                return self.commit_body_success(&scoped_id, attempts).await;
            }

            let env = self.body_env(spec, attempts);
            let verdict = self
                .core
                .invoke_driver(
                    &self.run_id,
                    &scoped_id,
                    &cmd,
                    &env,
                    spec.timeout_secs,
                    &mut self.cancel,
                )
                .await;

            let error = match verdict {
                DriverVerdict::Exit(0) => {
                    return self.commit_body_success(&scoped_id, attempts).await;
                }
                DriverVerdict::Exit(code) => format!("command exited with code {code}"),
                DriverVerdict::Error(error) => error,
                DriverVerdict::TimedOut => {
                    format!("node exceeded its {}s timeout", spec.timeout_secs)
                }
                DriverVerdict::Cancelled => {
                    self.commit_body_failure(&scoped_id, attempts, "run cancelled")
                        .await;
                    return BodyEnd::Cancelled;
                }
            };

            if attempts < max_retries {
                attempts += 1;
                let backoff = self.core.backoff_secs(attempts - 1);
                let update = NodeStateUpdate::to(NodeStatus::Pending)
                    .with_retries(attempts)
                    .with_error(error.as_str());
                if let Err(err) = self
                    .core
                    .store
                    .update_node_state(&self.run_id, &scoped_id, update)
                    .await
                {
                    return BodyEnd::Failed(err.to_string());
                }
                self.core
                    .emit(
                        &self.run_id,
                        EventInput::node_retry(&self.run_id, &scoped_id, attempts, backoff)
                            .with_field("loop", serde_json::json!(self.loop_id))
                            .with_field("iteration", serde_json::json!(self.index)),
                    )
                    .await;
                // Backoff, but unwind immediately on cancellation.
                tokio::select! {
                    _ = tokio::time::sleep(std::time::Duration::from_secs_f64(backoff)) => {}
                    _ = wait_cancelled(&mut self.cancel) => return BodyEnd::Cancelled,
                }
                continue;
            }

            self.commit_body_failure(&scoped_id, attempts, &error).await;
            return BodyEnd::Failed(format!("{}: {error}", spec.id));
        }
    }

    fn body_env(&self, spec: &NodeSpec, attempts: u32) -> rustc_hash::FxHashMap<String, String> {
        let mut env = spec.env.clone();
        env.insert("ATTEMPT".to_string(), (attempts + 1).to_string());
        env.insert("ITERATION_INDEX".to_string(), self.index.to_string());
        if let Some(value) = scalar_env_value(&self.item) {
            env.insert(format!("LOOP_{}", self.item_var.to_uppercase()), value);
        }
        if let Some(index_var) = &self.index_var {
            env.insert(
                format!("LOOP_{}", index_var.to_uppercase()),
                self.index.to_string(),
            );
        }
        env
    }

    async fn commit_body_success(&self, scoped_id: &str, attempts: u32) -> BodyEnd {
        let update = NodeStateUpdate::to(NodeStatus::Succeeded)
            .with_exit_code(0)
            .with_retries(attempts);
        if let Err(err) = self
            .core
            .store
            .update_node_state(&self.run_id, scoped_id, update)
            .await
        {
            return BodyEnd::Failed(err.to_string());
        }
        self.emit_body_status(scoped_id, NodeStatus::Succeeded, None)
            .await;
        BodyEnd::Succeeded
    }

    async fn commit_body_failure(&self, scoped_id: &str, attempts: u32, error: &str) {
        let update = NodeStateUpdate::to(NodeStatus::Failed)
            .with_exit_code(-1)
            .with_retries(attempts)
            .with_error(error);
        if let Err(err) = self
            .core
            .store
            .update_node_state(&self.run_id, scoped_id, update)
            .await
        {
            // No failed event for a write the store refused.
            tracing::warn!(
                target: "runloom::scheduler",
                run_id = %self.run_id,
                node_id = %scoped_id,
                error = %err,
                "failed to persist loop-body failure"
            );
            return;
        }
        self.emit_body_status(scoped_id, NodeStatus::Failed, Some(error))
            .await;
    }

    async fn emit_body_status(&self, scoped_id: &str, status: NodeStatus, error: Option<&str>) {
        let mut input = EventInput::node_status(&self.run_id, scoped_id, status)
            .with_field("loop", serde_json::json!(self.loop_id))
            .with_field("iteration", serde_json::json!(self.index));
        if let Some(error) = error {
            input = input.with_field("error", serde_json::json!(error));
        }
        self.core.emit(&self.run_id, input).await;
    }
}

enum BodyEnd {
    Succeeded,
    Failed(String),
    Cancelled,
}

/// Environment variable rendering for simple scalar loop items; composite
/// items are observable via the `loop_iteration` event instead.
fn scalar_env_value(item: &Value) -> Option<String> {
    match item {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}
