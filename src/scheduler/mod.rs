//! The run scheduler: DAG semantics, ready-set dispatch, retries with
//! exponential backoff, conditional skipping, bounded for-each iteration, and
//! cancellation.
//!
//! Each active run gets one main-loop task. The loop is the only mutator of
//! that run's [`RunContext`]; node executions run as parallel tasks that
//! report back over a channel and never touch shared scheduling state. All
//! persistence goes through the [`RunStore`]; every transition the loop
//! commits also appends an event.

pub(crate) mod control_flow;
pub(crate) mod run_context;

use std::sync::Arc;
use std::time::{Duration, Instant};

use miette::Diagnostic;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use thiserror::Error;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use tracing::instrument;

use crate::config::EngineConfig;
use crate::driver::{CommandResolver, Driver, SpecCommandResolver};
use crate::events::EventInput;
use crate::expr::{ExprEnv, ExprEvaluator};
use crate::plan::{NodeSpec, NodeType, Plan};
use crate::store::{RunStore, StoreError};
use crate::types::{NodeStateUpdate, NodeStatus, Run, RunStatus};

use control_flow::{ConditionalOutcome, LoopOutcome};
use run_context::RunContext;

/// Longest retry backoff, regardless of attempt count.
const MAX_BACKOFF_SECS: f64 = 60.0;

/// Errors surfaced by scheduler API calls. Driver and expression failures
/// stay inside the run (they surface as node/run status events).
#[derive(Debug, Error, Diagnostic)]
pub enum SchedulerError {
    #[error("run not registered with the scheduler: {run_id}")]
    #[diagnostic(code(runloom::scheduler::not_registered))]
    NotRegistered { run_id: String },

    #[error("run already started: {run_id}")]
    #[diagnostic(code(runloom::scheduler::already_started))]
    AlreadyStarted { run_id: String },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),
}

/// Dependencies shared by the loops and node tasks of every run.
pub(crate) struct SchedulerCore {
    pub store: Arc<dyn RunStore>,
    pub driver: Arc<dyn Driver>,
    pub resolver: Arc<dyn CommandResolver>,
    pub evaluator: ExprEvaluator,
    pub config: EngineConfig,
    /// Global driver-invocation bound; `None` means unlimited.
    pub semaphore: Option<Arc<Semaphore>>,
}

/// Result of racing a driver call against cancellation and the grace window.
pub(crate) enum DriverVerdict {
    Exit(i32),
    Error(String),
    TimedOut,
    Cancelled,
}

impl SchedulerCore {
    /// Append an event, logging instead of failing: a lost event is
    /// diagnosable, a wedged run is not.
    pub(crate) async fn emit(&self, run_id: &str, input: EventInput) {
        if let Err(err) = self.store.append_event(run_id, input).await {
            tracing::warn!(
                target: "runloom::scheduler",
                run_id = %run_id,
                error = %err,
                "failed to append event"
            );
        }
    }

    pub(crate) async fn mark_node_running(
        &self,
        run_id: &str,
        node_id: &str,
    ) -> Result<(), StoreError> {
        self.store
            .update_node_state(run_id, node_id, NodeStateUpdate::to(NodeStatus::Running))
            .await?;
        self.emit(run_id, EventInput::node_status(run_id, node_id, NodeStatus::Running))
            .await;
        Ok(())
    }

    /// Environment for a control-flow node's expressions: outputs of every
    /// succeeded predecessor under `inputs.<id>`, plus run context.
    pub(crate) async fn build_expr_env(
        &self,
        run_id: &str,
        node_id: &str,
        preds: &[String],
    ) -> Result<ExprEnv, StoreError> {
        let mut env = ExprEnv::new(run_id, node_id);
        for pred in preds {
            let state = self.store.get_node_state(run_id, pred).await?;
            if state.status != NodeStatus::Succeeded {
                continue;
            }
            let outputs = self
                .store
                .get_node_outputs(run_id, pred)
                .await?
                .unwrap_or_default();
            env = env.with_input(pred.clone(), outputs);
        }
        Ok(env)
    }

    /// Run the driver, racing cancellation and (for non-zero timeouts) a
    /// hard deadline of `timeout + grace`. On either losing side the driver
    /// future is dropped and `cancel_node` is invoked so the backend can
    /// tear down.
    pub(crate) async fn invoke_driver(
        &self,
        run_id: &str,
        node_id: &str,
        cmd: &[String],
        env: &FxHashMap<String, String>,
        timeout_secs: f64,
        cancel: &mut watch::Receiver<bool>,
    ) -> DriverVerdict {
        enum Raced {
            Done(Result<i32, crate::driver::DriverError>),
            Cancel,
            Deadline,
        }

        let deadline = if timeout_secs > 0.0 {
            Some(Duration::from_secs_f64(timeout_secs) + self.config.timeout_grace)
        } else {
            None
        };
        let driver_fut = self.driver.run_node(run_id, node_id, cmd, env, timeout_secs);
        tokio::pin!(driver_fut);

        let raced = tokio::select! {
            result = &mut driver_fut => Raced::Done(result),
            _ = wait_cancelled(cancel) => Raced::Cancel,
            _ = overrun(deadline) => Raced::Deadline,
        };

        match raced {
            Raced::Done(Ok(code)) => DriverVerdict::Exit(code),
            Raced::Done(Err(err)) => DriverVerdict::Error(err.to_string()),
            Raced::Cancel => {
                self.cancel_driver_node(run_id, node_id).await;
                DriverVerdict::Cancelled
            }
            Raced::Deadline => {
                self.cancel_driver_node(run_id, node_id).await;
                DriverVerdict::TimedOut
            }
        }
    }

    async fn cancel_driver_node(&self, run_id: &str, node_id: &str) {
        if let Err(err) = self.driver.cancel_node(run_id, node_id).await {
            tracing::warn!(
                target: "runloom::scheduler",
                run_id = %run_id,
                node_id = %node_id,
                error = %err,
                "driver failed to cancel node"
            );
        }
    }

    pub(crate) fn backoff_secs(&self, attempts_used: u32) -> f64 {
        let factor = 2f64.powi(attempts_used.min(30) as i32);
        (self.config.default_backoff_secs * factor).min(MAX_BACKOFF_SECS)
    }
}

/// Resolves once the cancel token flips to true; never resolves if the
/// sender disappears first.
pub(crate) async fn wait_cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

async fn overrun(deadline: Option<Duration>) {
    match deadline {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}

struct NodeCompletion {
    node_id: String,
    outcome: TaskOutcome,
}

enum TaskOutcome {
    Success { exit_code: i32 },
    Failure { exit_code: i32, error: String },
    Branch(ConditionalOutcome),
    Loop(LoopOutcome),
    /// The store rejected the transition to running; the node never started
    /// and its state must not be advanced.
    StoreFault { error: String },
    CancelledBeforeStart,
    CancelledWhileRunning,
}

struct RunHandle {
    ctx: Arc<Mutex<RunContext>>,
    cancel: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
    started: bool,
    cancel_emitted: bool,
}

/// Owns every registered run's scheduling loop.
pub struct Scheduler {
    core: Arc<SchedulerCore>,
    runs: Arc<Mutex<FxHashMap<String, RunHandle>>>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn RunStore>, driver: Arc<dyn Driver>, config: EngineConfig) -> Self {
        Self::with_resolver(store, driver, Arc::new(SpecCommandResolver), config)
    }

    pub fn with_resolver(
        store: Arc<dyn RunStore>,
        driver: Arc<dyn Driver>,
        resolver: Arc<dyn CommandResolver>,
        config: EngineConfig,
    ) -> Self {
        let semaphore = match config.max_parallelism {
            0 => None,
            n => Some(Arc::new(Semaphore::new(n))),
        };
        Self {
            core: Arc::new(SchedulerCore {
                store,
                driver,
                resolver,
                evaluator: ExprEvaluator::new(),
                config,
                semaphore,
            }),
            runs: Arc::new(Mutex::new(FxHashMap::default())),
        }
    }

    /// Register a created run: build its context and emit the `queued`
    /// events for the run and every node.
    #[instrument(skip(self, plan), fields(run_id = %run.id))]
    pub async fn register(&self, run: &Run, plan: &Plan) -> Result<(), SchedulerError> {
        let ctx = RunContext::new(&run.id, plan, self.core.config.default_max_retries);
        let (cancel, _) = watch::channel(false);
        self.runs.lock().insert(
            run.id.clone(),
            RunHandle {
                ctx: Arc::new(Mutex::new(ctx)),
                cancel,
                join: None,
                started: false,
                cancel_emitted: false,
            },
        );
        for node in &plan.nodes {
            self.core
                .emit(
                    &run.id,
                    EventInput::node_status(&run.id, &node.id, NodeStatus::Pending),
                )
                .await;
        }
        self.core
            .emit(&run.id, EventInput::run_status(&run.id, RunStatus::Queued))
            .await;
        Ok(())
    }

    /// Transition the run to running and launch its main loop.
    #[instrument(skip(self))]
    pub async fn start(&self, run_id: &str) -> Result<(), SchedulerError> {
        let (ctx, cancel_rx) = {
            let mut runs = self.runs.lock();
            let handle = runs
                .get_mut(run_id)
                .ok_or_else(|| SchedulerError::NotRegistered {
                    run_id: run_id.to_string(),
                })?;
            if handle.started {
                return Err(SchedulerError::AlreadyStarted {
                    run_id: run_id.to_string(),
                });
            }
            handle.started = true;
            (Arc::clone(&handle.ctx), handle.cancel.subscribe())
        };

        self.core
            .store
            .update_run_status(run_id, RunStatus::Running)
            .await?;
        self.core.emit(run_id, EventInput::hello(run_id)).await;
        self.core
            .emit(run_id, EventInput::run_status(run_id, RunStatus::Running))
            .await;

        let join = tokio::spawn(main_loop(
            Arc::clone(&self.core),
            run_id.to_string(),
            ctx,
            cancel_rx,
        ));
        if let Some(handle) = self.runs.lock().get_mut(run_id) {
            handle.join = Some(join);
        }
        Ok(())
    }

    /// Cancel a run: persist the terminal status, flip the cancel token so
    /// in-flight node tasks unwind, and emit the final `run_status`.
    /// Idempotent; a no-op on already-terminal runs, including when two
    /// cancels race each other.
    #[instrument(skip(self))]
    pub async fn cancel(&self, run_id: &str) -> Result<Run, SchedulerError> {
        let before = self.core.store.get_run(run_id).await?;
        let run = self.core.store.cancel_run(run_id).await?;
        if before.status.is_terminal() {
            return Ok(run);
        }
        // Concurrent cancels can both observe a non-terminal run; the handle
        // flag keeps the terminal run_status event single-shot.
        let emit = {
            let mut runs = self.runs.lock();
            match runs.get_mut(run_id) {
                Some(handle) => {
                    let _ = handle.cancel.send(true);
                    !std::mem::replace(&mut handle.cancel_emitted, true)
                }
                None => true,
            }
        };
        if emit {
            self.core
                .emit(run_id, EventInput::run_status(run_id, RunStatus::Cancelled))
                .await;
        }
        Ok(run)
    }

    /// Wait for a started run's main loop to finish. Returns immediately for
    /// runs that never started.
    pub async fn wait(&self, run_id: &str) -> Result<(), SchedulerError> {
        let join = {
            let mut runs = self.runs.lock();
            let handle = runs
                .get_mut(run_id)
                .ok_or_else(|| SchedulerError::NotRegistered {
                    run_id: run_id.to_string(),
                })?;
            handle.join.take()
        };
        if let Some(join) = join {
            if let Err(err) = join.await {
                tracing::error!(
                    target: "runloom::scheduler",
                    run_id = %run_id,
                    error = %err,
                    "run loop task failed"
                );
            }
        }
        Ok(())
    }

    /// Cancel every active run and wait for their loops to wind down.
    pub async fn shutdown(&self) {
        let run_ids: Vec<String> = self.runs.lock().keys().cloned().collect();
        for run_id in &run_ids {
            if let Err(err) = self.cancel(run_id).await {
                tracing::warn!(
                    target: "runloom::scheduler",
                    run_id = %run_id,
                    error = %err,
                    "cancel during shutdown failed"
                );
            }
        }
        for run_id in &run_ids {
            let _ = self.wait(run_id).await;
        }
    }

    pub fn is_registered(&self, run_id: &str) -> bool {
        self.runs.lock().contains_key(run_id)
    }
}

/// One run's scheduling loop. Single-flow: dispatches ready nodes, applies
/// completions, re-checks finalization, and otherwise waits briefly for the
/// next wake-up.
async fn main_loop(
    core: Arc<SchedulerCore>,
    run_id: String,
    ctx: Arc<Mutex<RunContext>>,
    mut cancel_rx: watch::Receiver<bool>,
) {
    let (done_tx, done_rx) = flume::unbounded::<NodeCompletion>();

    loop {
        let cancelled = *cancel_rx.borrow();

        if !cancelled {
            let ready = {
                let c = ctx.lock();
                if c.faulted {
                    Vec::new()
                } else {
                    c.ready_nodes(Instant::now())
                }
            };
            for node_id in ready {
                let (spec, preds, attempt, body_specs) = {
                    let mut c = ctx.lock();
                    c.active.insert(node_id.clone());
                    c.deferred.remove(&node_id);
                    let Some(spec) = c.specs.get(&node_id).cloned() else {
                        continue;
                    };
                    let preds = c.predecessors.get(&node_id).cloned().unwrap_or_default();
                    let attempt = c.retries_used.get(&node_id).copied().unwrap_or(0);
                    let body_specs = match &spec.for_each {
                        Some(cfg) => cfg
                            .body
                            .iter()
                            .filter_map(|id| c.specs.get(id).cloned())
                            .collect(),
                        None => Vec::new(),
                    };
                    (spec, preds, attempt, body_specs)
                };
                spawn_node_task(
                    Arc::clone(&core),
                    run_id.clone(),
                    spec,
                    preds,
                    attempt,
                    body_specs,
                    done_tx.clone(),
                    cancel_rx.clone(),
                );
            }
        }

        match tokio::time::timeout(core.config.poll_interval, done_rx.recv_async()).await {
            Ok(Ok(completion)) => {
                handle_completion(&core, &run_id, &ctx, &cancel_rx, completion).await;
                while let Ok(extra) = done_rx.try_recv() {
                    handle_completion(&core, &run_id, &ctx, &cancel_rx, extra).await;
                }
            }
            Ok(Err(_)) | Err(_) => {}
        }

        let cancelled_now = *cancel_rx.borrow();
        match finalize_check(&ctx, cancelled_now) {
            Some(Finalization::Cancelled) => break,
            Some(Finalization::Succeeded) => {
                finalize_run(&core, &run_id, RunStatus::Succeeded).await;
                break;
            }
            Some(Finalization::Failed) => {
                finalize_run(&core, &run_id, RunStatus::Failed).await;
                break;
            }
            None => {}
        }
    }

    if let Err(err) = core.driver.cleanup_run(&run_id).await {
        tracing::warn!(
            target: "runloom::scheduler",
            run_id = %run_id,
            error = %err,
            "driver cleanup failed"
        );
    }
}

enum Finalization {
    Succeeded,
    Failed,
    Cancelled,
}

fn finalize_check(ctx: &Arc<Mutex<RunContext>>, cancelled: bool) -> Option<Finalization> {
    let c = ctx.lock();
    if !c.active.is_empty() {
        return None;
    }
    if cancelled {
        return Some(Finalization::Cancelled);
    }
    if c.faulted {
        return Some(Finalization::Failed);
    }
    if !c.ready_nodes(Instant::now()).is_empty() || !c.deferred.is_empty() {
        return None;
    }
    let counts = c.counts();
    if counts.running > 0 {
        return None;
    }
    if counts.all_resolved() {
        return Some(Finalization::Succeeded);
    }
    if counts.failed > 0 {
        return Some(Finalization::Failed);
    }
    if counts.pending > 0 {
        // No failure, nothing active, nothing ready: the DAG cannot make
        // progress. Treat as failed rather than hang the run.
        tracing::error!(
            target: "runloom::scheduler",
            run_id = %c.run_id,
            pending = counts.pending,
            "run stalled with pending nodes and no schedulable work"
        );
        return Some(Finalization::Failed);
    }
    None
}

async fn finalize_run(core: &Arc<SchedulerCore>, run_id: &str, status: RunStatus) {
    match core.store.update_run_status(run_id, status).await {
        Ok(_) => {
            core.emit(run_id, EventInput::run_status(run_id, status)).await;
        }
        Err(err) => {
            // A concurrent cancel can win the race to a terminal status;
            // anything else is a real store fault.
            tracing::warn!(
                target: "runloom::scheduler",
                run_id = %run_id,
                status = %status,
                error = %err,
                "could not finalize run status"
            );
        }
    }
}

fn spawn_node_task(
    core: Arc<SchedulerCore>,
    run_id: String,
    spec: NodeSpec,
    preds: Vec<String>,
    attempt: u32,
    body_specs: Vec<NodeSpec>,
    done_tx: flume::Sender<NodeCompletion>,
    cancel_rx: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let node_id = spec.id.clone();
        let outcome =
            run_node_task(&core, &run_id, spec, &preds, attempt, body_specs, cancel_rx).await;
        let _ = done_tx.send(NodeCompletion { node_id, outcome });
    });
}

async fn run_node_task(
    core: &Arc<SchedulerCore>,
    run_id: &str,
    spec: NodeSpec,
    preds: &[String],
    attempt: u32,
    body_specs: Vec<NodeSpec>,
    mut cancel: watch::Receiver<bool>,
) -> TaskOutcome {
    match spec.node_type {
        NodeType::Task => run_task(core, run_id, &spec, attempt, &mut cancel).await,
        NodeType::Conditional => {
            if let Err(err) = core.mark_node_running(run_id, &spec.id).await {
                return TaskOutcome::StoreFault {
                    error: err.to_string(),
                };
            }
            let env = match core.build_expr_env(run_id, &spec.id, preds).await {
                Ok(env) => env,
                Err(err) => {
                    return TaskOutcome::Branch(ConditionalOutcome::Failed {
                        error: err.to_string(),
                    });
                }
            };
            TaskOutcome::Branch(control_flow::evaluate_conditional(core, &spec, &env))
        }
        NodeType::ForEach => {
            if let Err(err) = core.mark_node_running(run_id, &spec.id).await {
                return TaskOutcome::StoreFault {
                    error: err.to_string(),
                };
            }
            TaskOutcome::Loop(
                control_flow::run_for_each(core, run_id, &spec, preds, body_specs, cancel).await,
            )
        }
        // Unreachable past validation.
        NodeType::Subflow => TaskOutcome::Failure {
            exit_code: -1,
            error: "subflow nodes are not supported".to_string(),
        },
    }
}

async fn run_task(
    core: &Arc<SchedulerCore>,
    run_id: &str,
    spec: &NodeSpec,
    attempt: u32,
    cancel: &mut watch::Receiver<bool>,
) -> TaskOutcome {
    // One global parallelism slot per driver invocation; waiting happens
    // here in the node task, never in the main loop.
    let _permit = match &core.semaphore {
        Some(semaphore) => {
            let acquired = tokio::select! {
                permit = Arc::clone(semaphore).acquire_owned() => permit.ok(),
                _ = wait_cancelled(cancel) => return TaskOutcome::CancelledBeforeStart,
            };
            acquired
        }
        None => None,
    };
    if *cancel.borrow() {
        return TaskOutcome::CancelledBeforeStart;
    }

    if let Err(err) = core.mark_node_running(run_id, &spec.id).await {
        return TaskOutcome::StoreFault {
            error: err.to_string(),
        };
    }

    let cmd = core.resolver.resolve(spec);
    if cmd.is_empty() {
        // No command resolved: successful no-op.
        return TaskOutcome::Success { exit_code: 0 };
    }

    let mut env = spec.env.clone();
    env.insert("ATTEMPT".to_string(), (attempt + 1).to_string());

    match core
        .invoke_driver(run_id, &spec.id, &cmd, &env, spec.timeout_secs, cancel)
        .await
    {
        DriverVerdict::Exit(0) => TaskOutcome::Success { exit_code: 0 },
        DriverVerdict::Exit(code) => TaskOutcome::Failure {
            exit_code: code,
            error: format!("command exited with code {code}"),
        },
        DriverVerdict::Error(error) => TaskOutcome::Failure {
            exit_code: -1,
            error,
        },
        DriverVerdict::TimedOut => TaskOutcome::Failure {
            exit_code: -1,
            error: format!("node exceeded its {}s timeout", spec.timeout_secs),
        },
        DriverVerdict::Cancelled => TaskOutcome::CancelledWhileRunning,
    }
}

async fn handle_completion(
    core: &Arc<SchedulerCore>,
    run_id: &str,
    ctx: &Arc<Mutex<RunContext>>,
    cancel_rx: &watch::Receiver<bool>,
    completion: NodeCompletion,
) {
    let NodeCompletion { node_id, outcome } = completion;
    ctx.lock().active.remove(&node_id);

    match outcome {
        TaskOutcome::Success { exit_code } => {
            commit_success(core, run_id, ctx, &node_id, exit_code).await;
        }
        TaskOutcome::Branch(ConditionalOutcome::Selected {
            expression,
            result,
            selected,
        }) => {
            core.emit(
                run_id,
                EventInput::condition_evaluated(&node_id, &expression, &result),
            )
            .await;
            core.emit(
                run_id,
                EventInput::branch_selected(&node_id, &selected, &expression),
            )
            .await;
            apply_branch_skips(core, run_id, ctx, &node_id, &selected).await;
            // The conditional's own success unlocks the selected targets.
            commit_success(core, run_id, ctx, &node_id, 0).await;
        }
        TaskOutcome::Branch(ConditionalOutcome::Failed { error })
        | TaskOutcome::Loop(LoopOutcome::Failed { error }) => {
            // Control-flow evaluation errors never retry.
            commit_failure(core, run_id, ctx, &node_id, -1, &error).await;
        }
        TaskOutcome::Loop(LoopOutcome::Completed) => {
            commit_success(core, run_id, ctx, &node_id, 0).await;
        }
        TaskOutcome::Failure { exit_code, error } => {
            let cancelled = *cancel_rx.borrow();
            let (attempts_used, max_retries) = {
                let c = ctx.lock();
                (
                    c.retries_used.get(&node_id).copied().unwrap_or(0),
                    c.specs
                        .get(&node_id)
                        .and_then(|s| s.retries)
                        .unwrap_or(0),
                )
            };
            if !cancelled && attempts_used < max_retries {
                schedule_retry(core, run_id, ctx, &node_id, attempts_used, &error).await;
            } else {
                commit_failure(core, run_id, ctx, &node_id, exit_code, &error).await;
            }
        }
        TaskOutcome::StoreFault { error } => {
            // The node never left pending; its state must stay untouched.
            fault_run(core, run_id, ctx, &node_id, &error).await;
        }
        TaskOutcome::Loop(LoopOutcome::Cancelled) | TaskOutcome::CancelledWhileRunning => {
            // Cancelled runs never requeue retries.
            commit_failure(core, run_id, ctx, &node_id, -1, "run cancelled").await;
        }
        TaskOutcome::CancelledBeforeStart => {
            // Never reached the driver; the node simply stays pending.
        }
    }
}

/// A store write was rejected, so node state cannot advance truthfully.
/// Record an `error` event and flip the run into the faulted path: no more
/// dispatch, terminal status `failed` once active tasks drain. The node's
/// store state is left exactly where the store says it is.
async fn fault_run(
    core: &Arc<SchedulerCore>,
    run_id: &str,
    ctx: &Arc<Mutex<RunContext>>,
    node_id: &str,
    error: &str,
) {
    tracing::error!(
        target: "runloom::scheduler",
        run_id = %run_id,
        node_id = %node_id,
        error = %error,
        "store rejected a node state write; failing the run"
    );
    core.emit(run_id, EventInput::error("store_fault", error, false))
        .await;
    ctx.lock().faulted = true;
}

async fn commit_success(
    core: &Arc<SchedulerCore>,
    run_id: &str,
    ctx: &Arc<Mutex<RunContext>>,
    node_id: &str,
    exit_code: i32,
) {
    let attempts = ctx.lock().retries_used.get(node_id).copied().unwrap_or(0);
    let update = NodeStateUpdate::to(NodeStatus::Succeeded)
        .with_exit_code(exit_code)
        .with_retries(attempts);
    if let Err(err) = core.store.update_node_state(run_id, node_id, update).await {
        // Don't report a success the store refused to record.
        fault_run(core, run_id, ctx, node_id, &err.to_string()).await;
        return;
    }
    core.emit(
        run_id,
        EventInput::node_status(run_id, node_id, NodeStatus::Succeeded),
    )
    .await;
    let mut c = ctx.lock();
    c.set_status(node_id, NodeStatus::Succeeded);
    c.unlock_dependents(node_id);
}

async fn commit_failure(
    core: &Arc<SchedulerCore>,
    run_id: &str,
    ctx: &Arc<Mutex<RunContext>>,
    node_id: &str,
    exit_code: i32,
    error: &str,
) {
    let update = NodeStateUpdate::to(NodeStatus::Failed)
        .with_exit_code(exit_code)
        .with_error(error);
    if let Err(err) = core.store.update_node_state(run_id, node_id, update).await {
        // The store's view wins: no failed event, no cache advance.
        fault_run(core, run_id, ctx, node_id, &err.to_string()).await;
        return;
    }
    core.emit(
        run_id,
        EventInput::node_status(run_id, node_id, NodeStatus::Failed)
            .with_field("error", serde_json::json!(error)),
    )
    .await;
    // Dependents stay locked: a failed node never unlocks downstream.
    ctx.lock().set_status(node_id, NodeStatus::Failed);
}

async fn schedule_retry(
    core: &Arc<SchedulerCore>,
    run_id: &str,
    ctx: &Arc<Mutex<RunContext>>,
    node_id: &str,
    attempts_used: u32,
    error: &str,
) {
    let backoff = core.backoff_secs(attempts_used);
    let attempts = attempts_used + 1;
    let update = NodeStateUpdate::to(NodeStatus::Pending)
        .with_retries(attempts)
        .with_error(error);
    if let Err(err) = core.store.update_node_state(run_id, node_id, update).await {
        // An unrecorded requeue must not run again.
        fault_run(core, run_id, ctx, node_id, &err.to_string()).await;
        return;
    }
    core.emit(run_id, EventInput::node_retry(run_id, node_id, attempts, backoff))
        .await;
    let mut c = ctx.lock();
    c.retries_used.insert(node_id.to_string(), attempts);
    c.set_status(node_id, NodeStatus::Pending);
    c.deferred.insert(
        node_id.to_string(),
        Instant::now() + Duration::from_secs_f64(backoff),
    );
}

/// Skip the subgraphs hanging off every non-selected branch.
///
/// Depth-first along `dependents`: a direct target of a non-selected branch
/// is skipped unless it is also a target of the selected branch or already
/// terminal; deeper nodes are skipped only once *all* their predecessors are
/// skipped. Every skip decrements its dependents' counters, so a node fed by
/// a mix of skipped and succeeding predecessors becomes ready exactly once.
async fn apply_branch_skips(
    core: &Arc<SchedulerCore>,
    run_id: &str,
    ctx: &Arc<Mutex<RunContext>>,
    conditional_id: &str,
    selected: &str,
) {
    let branches = {
        let c = ctx.lock();
        c.specs
            .get(conditional_id)
            .and_then(|s| s.conditional.clone())
            .map(|cfg| cfg.branches)
    };
    let Some(branches) = branches else {
        return;
    };

    let selected_targets: std::collections::HashSet<String> = branches
        .get(selected)
        .map(|b| b.targets.iter().cloned().collect())
        .unwrap_or_default();

    for (label, targets) in &branches {
        if label == selected {
            continue;
        }
        for target in &targets.targets {
            if selected_targets.contains(target) {
                continue;
            }
            skip_subtree(core, run_id, ctx, conditional_id, label, target).await;
        }
    }
}

async fn skip_subtree(
    core: &Arc<SchedulerCore>,
    run_id: &str,
    ctx: &Arc<Mutex<RunContext>>,
    conditional_id: &str,
    branch: &str,
    root: &str,
) {
    let mut stack = vec![root.to_string()];
    while let Some(node_id) = stack.pop() {
        let skip_now = {
            let c = ctx.lock();
            match c.statuses.get(&node_id) {
                Some(status) if !status.is_terminal() => true,
                _ => false,
            }
        };
        if !skip_now {
            continue;
        }

        if let Err(err) = core
            .store
            .update_node_state(run_id, &node_id, NodeStateUpdate::to(NodeStatus::Skipped))
            .await
        {
            // Unrecorded skips must not cascade.
            fault_run(core, run_id, ctx, &node_id, &err.to_string()).await;
            return;
        }
        core.emit(
            run_id,
            EventInput::branch_skipped(&node_id, conditional_id, branch),
        )
        .await;
        core.emit(
            run_id,
            EventInput::node_status(run_id, &node_id, NodeStatus::Skipped),
        )
        .await;

        let newly_orphaned: Vec<String> = {
            let mut c = ctx.lock();
            c.set_status(&node_id, NodeStatus::Skipped);
            c.unlock_dependents(&node_id);
            c.dependents
                .get(&node_id)
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .filter(|d| c.all_preds_skipped(d))
                .collect()
        };
        stack.extend(newly_orphaned);
    }
}
