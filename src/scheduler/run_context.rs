//! Per-run scheduling state.
//!
//! A [`RunContext`] is the scheduler's transient cache for one active run:
//! dependency indexes, remaining-predecessor counters, the active-task set,
//! and retry gates. It is derived from the plan plus store state and owned
//! exclusively by the run's main loop — node tasks never touch it.

use rustc_hash::{FxHashMap, FxHashSet};
use std::time::Instant;

use crate::plan::{NodeSpec, Plan};
use crate::types::NodeStatus;

pub(crate) struct RunContext {
    pub run_id: String,
    /// Specs with engine defaults applied (retries backfilled).
    pub specs: FxHashMap<String, NodeSpec>,
    /// Top-level node ids in plan declaration order; loop-body members are
    /// excluded — they are scheduled by their owning for-each node.
    pub order: Vec<String>,
    /// Outer-DAG adjacency, both directions.
    pub dependents: FxHashMap<String, Vec<String>>,
    pub predecessors: FxHashMap<String, Vec<String>>,
    /// Unsatisfied predecessor counts; a node is ready at zero.
    pub remaining_preds: FxHashMap<String, usize>,
    /// Status cache mirroring the store, for top-level nodes only.
    pub statuses: FxHashMap<String, NodeStatus>,
    /// Retry attempts consumed per node.
    pub retries_used: FxHashMap<String, u32>,
    /// Nodes with an in-flight task.
    pub active: FxHashSet<String>,
    /// Retry backoff gates: not ready before the given instant.
    pub deferred: FxHashMap<String, Instant>,
    /// Set when the store rejected a state write; the run stops dispatching
    /// and finalizes as failed once active tasks drain.
    pub faulted: bool,
}

impl RunContext {
    pub fn new(run_id: &str, plan: &Plan, default_retries: u32) -> Self {
        let loop_body = plan.loop_body_owners();

        let mut specs = FxHashMap::default();
        let mut order = Vec::new();
        let mut statuses = FxHashMap::default();
        let mut retries_used = FxHashMap::default();
        for node in &plan.nodes {
            let mut spec = node.clone();
            if spec.retries.is_none() {
                spec.retries = Some(default_retries);
            }
            specs.insert(spec.id.clone(), spec);
            if !loop_body.contains_key(&node.id) {
                order.push(node.id.clone());
                statuses.insert(node.id.clone(), NodeStatus::Pending);
                retries_used.insert(node.id.clone(), 0);
            }
        }

        let mut dependents: FxHashMap<String, Vec<String>> = FxHashMap::default();
        let mut predecessors: FxHashMap<String, Vec<String>> = FxHashMap::default();
        let mut remaining_preds: FxHashMap<String, usize> =
            order.iter().map(|id| (id.clone(), 0)).collect();
        for (from, to) in plan.effective_edges() {
            // Edges touching loop-body nodes play no part in the outer DAG.
            if loop_body.contains_key(&from) || loop_body.contains_key(&to) {
                continue;
            }
            dependents.entry(from.clone()).or_default().push(to.clone());
            predecessors.entry(to.clone()).or_default().push(from);
            if let Some(count) = remaining_preds.get_mut(&to) {
                *count += 1;
            }
        }

        Self {
            run_id: run_id.to_string(),
            specs,
            order,
            dependents,
            predecessors,
            remaining_preds,
            statuses,
            retries_used,
            active: FxHashSet::default(),
            deferred: FxHashMap::default(),
            faulted: false,
        }
    }

    /// Nodes ready to dispatch right now, in declaration order.
    pub fn ready_nodes(&self, now: Instant) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| {
                self.statuses.get(*id) == Some(&NodeStatus::Pending)
                    && self.remaining_preds.get(*id).copied().unwrap_or(0) == 0
                    && !self.active.contains(*id)
                    && self.deferred.get(*id).is_none_or(|at| *at <= now)
            })
            .cloned()
            .collect()
    }

    /// Mark a committed status in the cache.
    pub fn set_status(&mut self, node_id: &str, status: NodeStatus) {
        self.statuses.insert(node_id.to_string(), status);
    }

    /// Drop every dependent's counter by one after `node_id` resolved
    /// (succeeded or skipped).
    pub fn unlock_dependents(&mut self, node_id: &str) {
        if let Some(dependents) = self.dependents.get(node_id).cloned() {
            for dependent in dependents {
                if let Some(count) = self.remaining_preds.get_mut(&dependent) {
                    *count = count.saturating_sub(1);
                }
            }
        }
    }

    /// True when every predecessor of `node_id` is skipped; such a node is
    /// unreachable through any selected path and gets skipped itself.
    pub fn all_preds_skipped(&self, node_id: &str) -> bool {
        match self.predecessors.get(node_id) {
            Some(preds) if !preds.is_empty() => preds
                .iter()
                .all(|p| self.statuses.get(p) == Some(&NodeStatus::Skipped)),
            _ => false,
        }
    }

    /// Classified status counts over top-level nodes.
    pub fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for status in self.statuses.values() {
            match status {
                NodeStatus::Pending => counts.pending += 1,
                NodeStatus::Running => counts.running += 1,
                NodeStatus::Succeeded => counts.succeeded += 1,
                NodeStatus::Failed => counts.failed += 1,
                NodeStatus::Skipped => counts.skipped += 1,
            }
        }
        counts.total = self.statuses.len();
        counts
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct StatusCounts {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl StatusCounts {
    pub fn all_resolved(&self) -> bool {
        self.succeeded + self.skipped == self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{EdgeSpec, NodeSpec, Plan};

    fn linear_plan() -> Plan {
        Plan::new(
            vec![
                NodeSpec::task("a", vec!["true".into()]),
                NodeSpec::task("b", vec!["true".into()]).with_inputs(["a"]),
            ],
            vec![],
        )
    }

    #[test]
    fn initial_ready_set_is_the_roots() {
        let ctx = RunContext::new("r1", &linear_plan(), 0);
        assert_eq!(ctx.ready_nodes(Instant::now()), vec!["a".to_string()]);
        assert_eq!(ctx.remaining_preds["b"], 1);
    }

    #[test]
    fn unlocking_makes_dependents_ready() {
        let mut ctx = RunContext::new("r1", &linear_plan(), 0);
        ctx.set_status("a", NodeStatus::Succeeded);
        ctx.unlock_dependents("a");
        assert_eq!(ctx.ready_nodes(Instant::now()), vec!["b".to_string()]);
    }

    #[test]
    fn explicit_and_implicit_edges_are_merged() {
        let plan = Plan::new(
            vec![
                NodeSpec::task("a", vec![]),
                NodeSpec::task("b", vec![]).with_inputs(["a"]),
            ],
            vec![EdgeSpec {
                from: "a".into(),
                to: "b".into(),
            }],
        );
        let ctx = RunContext::new("r1", &plan, 0);
        // Duplicate edge collapses to a single predecessor.
        assert_eq!(ctx.remaining_preds["b"], 1);
    }

    #[test]
    fn retry_defaults_are_backfilled() {
        let ctx = RunContext::new("r1", &linear_plan(), 3);
        assert_eq!(ctx.specs["a"].retries, Some(3));
    }
}
