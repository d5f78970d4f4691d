//! # Runloom: DAG Run Orchestration Engine
//!
//! Runloom executes user-submitted workflows expressed as directed acyclic
//! graphs. Each submitted [`Plan`](plan::Plan) becomes a run: nodes are
//! scheduled as their predecessors succeed, an injected
//! [`Driver`](driver::Driver) executes each node, every state transition is
//! recorded durably as an ordered event, and subscribers follow those events
//! live with replay and resume-from-last-seen semantics.
//!
//! ## Core pieces
//!
//! - **Plans** ([`plan`]): task, conditional, and bounded for-each nodes with
//!   data-flow edges; validated up front (cycles, dangling references,
//!   malformed control flow).
//! - **Run store** ([`store`]): runs, per-node state, node outputs, and an
//!   append-only event log with contiguous per-run sequence numbers. Ships
//!   in-memory and sqlite-backed implementations of one contract.
//! - **Scheduler** ([`scheduler`]): ready-set dispatch, a global parallelism
//!   bound, retries with exponential backoff, conditional skipping, for-each
//!   iteration, and cooperative cancellation.
//! - **Events** ([`events`]): the event taxonomy, fan-out to live
//!   subscribers with heartbeats and backpressure handling, and SSE framing
//!   with `Last-Event-ID` resume.
//! - **Expressions** ([`expr`]): sandboxed, compile-once-cached expressions
//!   for branch selection and collection resolution.
//! - **Engine** ([`engine`]): the façade tying it together.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use runloom::config::EngineConfig;
//! use runloom::engine::Engine;
//! use runloom::events::SubscribeOptions;
//! use runloom::plan::{Plan, NodeSpec};
//! use runloom::store::MemoryStore;
//!
//! # async fn example(driver: Arc<dyn runloom::driver::Driver>) -> Result<(), Box<dyn std::error::Error>> {
//! let engine = Engine::new(
//!     Arc::new(MemoryStore::new()),
//!     driver,
//!     EngineConfig::default().with_max_parallelism(8),
//! );
//!
//! let plan = Plan::new(
//!     vec![
//!         NodeSpec::task("fetch", vec!["fetch-data".into()]),
//!         NodeSpec::task("train", vec!["train-model".into()]).with_inputs(["fetch"]),
//!     ],
//!     vec![],
//! );
//!
//! let run = engine.launch("nightly", plan).await?;
//! let subscription = engine.subscribe(&run.id, SubscribeOptions::default().with_replay(50)).await?;
//! while let Some(frame) = subscription.next_frame().await {
//!     println!("{}", runloom::events::sse::encode_frame(&frame));
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod driver;
pub mod engine;
pub mod events;
pub mod expr;
pub mod plan;
pub mod scheduler;
pub mod store;
pub mod types;
