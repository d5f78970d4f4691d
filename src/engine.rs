//! Engine façade: accepts plans, coordinates the scheduler and store, and
//! hands out event subscriptions.
//!
//! The engine owns the pieces; callers own the policy. A typical embedding:
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use runloom::engine::Engine;
//! # use runloom::config::EngineConfig;
//! # use runloom::store::MemoryStore;
//! # use runloom::plan::{Plan, NodeSpec};
//! # async fn example(driver: Arc<dyn runloom::driver::Driver>) -> Result<(), Box<dyn std::error::Error>> {
//! let engine = Engine::new(Arc::new(MemoryStore::new()), driver, EngineConfig::default());
//! let plan = Plan::new(
//!     vec![
//!         NodeSpec::task("build", vec!["make".into()]),
//!         NodeSpec::task("test", vec!["make".into(), "test".into()]).with_inputs(["build"]),
//!     ],
//!     vec![],
//! );
//! let run = engine.launch("ci", plan).await?;
//! engine.wait(&run.id).await?;
//! println!("{}", engine.status(&run.id).await?.status);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use miette::Diagnostic;
use thiserror::Error;
use tracing::instrument;

use crate::config::EngineConfig;
use crate::driver::{CommandResolver, Driver};
use crate::events::{EventFanout, EventSubscription, SubscribeOptions};
use crate::plan::Plan;
use crate::scheduler::{Scheduler, SchedulerError};
use crate::store::{RunStore, StoreError};
use crate::types::{NodeState, Run, RunFilter};

/// Errors surfaced by engine API calls.
#[derive(Debug, Error, Diagnostic)]
pub enum EngineError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Scheduler(#[from] SchedulerError),
}

/// Orchestrates runs end to end: validate, persist, schedule, stream.
pub struct Engine {
    store: Arc<dyn RunStore>,
    scheduler: Scheduler,
    fanout: EventFanout,
}

impl Engine {
    pub fn new(store: Arc<dyn RunStore>, driver: Arc<dyn Driver>, config: EngineConfig) -> Self {
        let scheduler = Scheduler::new(Arc::clone(&store), driver, config.clone());
        Self::assemble(store, scheduler, config)
    }

    /// Engine with a custom command resolver (e.g. image-aware launch
    /// wrappers) instead of each node's embedded command.
    pub fn with_resolver(
        store: Arc<dyn RunStore>,
        driver: Arc<dyn Driver>,
        resolver: Arc<dyn CommandResolver>,
        config: EngineConfig,
    ) -> Self {
        let scheduler = Scheduler::with_resolver(Arc::clone(&store), driver, resolver, config.clone());
        Self::assemble(store, scheduler, config)
    }

    fn assemble(store: Arc<dyn RunStore>, scheduler: Scheduler, config: EngineConfig) -> Self {
        let fanout = EventFanout::new(Arc::clone(&store))
            .with_heartbeat_interval(config.heartbeat_interval)
            .with_subscriber_buffer(config.subscriber_buffer);
        Self {
            store,
            scheduler,
            fanout,
        }
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    /// Validate and persist a plan as a queued run, registered with the
    /// scheduler. Invalid plans are rejected here; no run is created.
    #[instrument(skip(self, plan))]
    pub async fn submit(&self, name: &str, plan: Plan) -> Result<Run, EngineError> {
        let run = self.store.create_run(name, plan.clone()).await?;
        self.scheduler.register(&run, &plan).await?;
        Ok(run)
    }

    /// Begin executing a submitted run.
    pub async fn start(&self, run_id: &str) -> Result<(), EngineError> {
        self.scheduler.start(run_id).await?;
        Ok(())
    }

    /// Submit and start in one step.
    pub async fn launch(&self, name: &str, plan: Plan) -> Result<Run, EngineError> {
        let run = self.submit(name, plan).await?;
        self.start(&run.id).await?;
        Ok(run)
    }

    /// Cancel a run; idempotent, and a no-op on terminal runs.
    pub async fn cancel(&self, run_id: &str) -> Result<Run, EngineError> {
        Ok(self.scheduler.cancel(run_id).await?)
    }

    /// Block until a started run's loop finishes (terminal status reached).
    pub async fn wait(&self, run_id: &str) -> Result<(), EngineError> {
        self.scheduler.wait(run_id).await?;
        Ok(())
    }

    pub async fn status(&self, run_id: &str) -> Result<Run, EngineError> {
        Ok(self.store.get_run(run_id).await?)
    }

    pub async fn node_states(&self, run_id: &str) -> Result<Vec<NodeState>, EngineError> {
        Ok(self.store.list_node_states(run_id).await?)
    }

    pub async fn list_runs(&self, filter: RunFilter) -> Result<Vec<Run>, EngineError> {
        Ok(self.store.list_runs(filter).await?)
    }

    /// Attach an event subscriber with replay/resume semantics.
    pub async fn subscribe(
        &self,
        run_id: &str,
        options: SubscribeOptions,
    ) -> Result<EventSubscription, EngineError> {
        Ok(self.fanout.subscribe(run_id, options).await?)
    }

    /// Cancel all active runs and wait for their loops to drain.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
    }
}
