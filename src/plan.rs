//! Plan model: the static description of a DAG to execute.
//!
//! A [`Plan`] is immutable once registered. Validation happens up front in
//! [`Plan::validate`]; a plan that passes is guaranteed acyclic with all
//! references resolved, so the scheduler never has to re-check structure at
//! execution time.

use miette::Diagnostic;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

/// Kind of a node in a plan.
///
/// `Subflow` is parsed but rejected at validation; it is reserved for a
/// future extension.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    #[default]
    Task,
    Conditional,
    ForEach,
    Subflow,
}

impl NodeType {
    pub fn is_control_flow(self) -> bool {
        matches!(self, NodeType::Conditional | NodeType::ForEach)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NodeType::Task => "task",
            NodeType::Conditional => "conditional",
            NodeType::ForEach => "for_each",
            NodeType::Subflow => "subflow",
        }
    }
}

/// Branch selection strategy for a conditional node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionalKind {
    If,
    Switch,
}

/// Targets unlocked when a branch is selected.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BranchTargets {
    pub targets: Vec<String>,
}

/// Configuration block for a conditional node.
///
/// `if` conditionals must define the labels `"true"` and `"false"`; `switch`
/// conditionals route on the stringified expression result and fall back to
/// `default` when no label matches.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConditionalConfig {
    pub kind: ConditionalKind,
    pub expression: String,
    /// Branch label → targets. Ordered map so plan serialization round-trips
    /// deterministically.
    pub branches: BTreeMap<String, BranchTargets>,
    #[serde(default, rename = "default", skip_serializing_if = "Option::is_none")]
    pub default_branch: Option<String>,
}

/// Configuration block for a bounded for-each node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ForEachConfig {
    /// Expression resolving to an ordered collection.
    pub collection: String,
    pub item_var: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_var: Option<String>,
    /// 0 means sequential (effective bound of 1).
    #[serde(default)]
    pub max_parallel: u32,
    /// Node ids executed per iteration, in order.
    pub body: Vec<String>,
}

/// A single node of a plan.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: String,
    #[serde(default, rename = "type")]
    pub node_type: NodeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "FxHashMap::is_empty")]
    pub env: FxHashMap<String, String>,
    /// Predecessor node ids; each entry is an implicit edge `(input, self)`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<String>,
    /// Advisory timeout forwarded to the driver; 0 means none.
    #[serde(default)]
    pub timeout_secs: f64,
    /// Per-node retry budget; `None` falls back to the engine default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditional: Option<ConditionalConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub for_each: Option<ForEachConfig>,
    /// Reserved; any value here fails validation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subflow: Option<Value>,
}

impl NodeSpec {
    /// Shorthand for a task node with a command.
    pub fn task(id: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            id: id.into(),
            command,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_inputs<I, S>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs = inputs.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    #[must_use]
    pub fn with_timeout_secs(mut self, timeout_secs: f64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Conditional node constructor.
    pub fn conditional(id: impl Into<String>, config: ConditionalConfig) -> Self {
        Self {
            id: id.into(),
            node_type: NodeType::Conditional,
            conditional: Some(config),
            ..Default::default()
        }
    }

    /// For-each node constructor.
    pub fn for_each(id: impl Into<String>, config: ForEachConfig) -> Self {
        Self {
            id: id.into(),
            node_type: NodeType::ForEach,
            for_each: Some(config),
            ..Default::default()
        }
    }
}

/// Explicit data-flow edge.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeSpec {
    pub from: String,
    pub to: String,
}

/// The static description of a DAG to execute.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub nodes: Vec<NodeSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub edges: Vec<EdgeSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Reasons a plan is rejected at registration. No run is created for an
/// invalid plan.
#[derive(Debug, Error, Diagnostic)]
pub enum PlanError {
    #[error("plan has no nodes")]
    #[diagnostic(code(runloom::plan::empty))]
    Empty,

    #[error("duplicate node id: {id}")]
    #[diagnostic(code(runloom::plan::duplicate_node))]
    DuplicateNode { id: String },

    #[error("edge {from} -> {to} references unknown node {missing}")]
    #[diagnostic(code(runloom::plan::unknown_edge_endpoint))]
    UnknownEdgeEndpoint {
        from: String,
        to: String,
        missing: String,
    },

    #[error("node {node} lists unknown input {input}")]
    #[diagnostic(code(runloom::plan::unknown_input))]
    UnknownInput { node: String, input: String },

    #[error("plan contains a cycle through: {nodes:?}")]
    #[diagnostic(
        code(runloom::plan::cycle),
        help("Node inputs count as edges; check both `edges` and `inputs`.")
    )]
    Cycle { nodes: Vec<String> },

    #[error("node {id} has type {node_type} but no matching config block")]
    #[diagnostic(code(runloom::plan::missing_control_flow_config))]
    MissingControlFlowConfig { id: String, node_type: &'static str },

    #[error("node {id} carries a {config} block but has type {node_type}")]
    #[diagnostic(
        code(runloom::plan::unexpected_control_flow_config),
        help("Exactly one control-flow block is allowed, and only on a matching node type.")
    )]
    UnexpectedControlFlowConfig {
        id: String,
        node_type: &'static str,
        config: &'static str,
    },

    #[error("conditional {id} (kind if) must define branch label {label:?}")]
    #[diagnostic(code(runloom::plan::missing_branch_label))]
    MissingBranchLabel { id: String, label: &'static str },

    #[error("conditional {id} branch {branch:?} targets unknown node {target}")]
    #[diagnostic(code(runloom::plan::unknown_branch_target))]
    UnknownBranchTarget {
        id: String,
        branch: String,
        target: String,
    },

    #[error("conditional {id} default label {label:?} is not a defined branch")]
    #[diagnostic(code(runloom::plan::unknown_default_branch))]
    UnknownDefaultBranch { id: String, label: String },

    #[error("for_each {id} body references unknown node {body}")]
    #[diagnostic(code(runloom::plan::unknown_body_node))]
    UnknownBodyNode { id: String, body: String },

    #[error("for_each {id} body node {body} must be a task node")]
    #[diagnostic(
        code(runloom::plan::body_node_not_task),
        help("Loop bodies reuse the driver task machinery; nest control flow via separate plans.")
    )]
    BodyNodeNotTask { id: String, body: String },

    #[error("node {body} appears in the body of both {first} and {second}")]
    #[diagnostic(code(runloom::plan::body_node_shared))]
    BodyNodeShared {
        body: String,
        first: String,
        second: String,
    },

    #[error("node {dependent} depends on loop-body node {body}")]
    #[diagnostic(
        code(runloom::plan::body_node_dependent),
        help("Loop-body nodes live outside the outer DAG; depend on the for_each node instead.")
    )]
    BodyNodeHasOuterDependent { body: String, dependent: String },

    #[error("node {id} has unsupported type subflow")]
    #[diagnostic(
        code(runloom::plan::subflow_unsupported),
        help("Subflow nodes are reserved for a future extension.")
    )]
    SubflowUnsupported { id: String },
}

impl Plan {
    pub fn new(nodes: Vec<NodeSpec>, edges: Vec<EdgeSpec>) -> Self {
        Self {
            nodes,
            edges,
            metadata: None,
        }
    }

    pub fn node(&self, id: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// All edges of the dependency graph: explicit `edges`, implicit
    /// `inputs[]` edges, and implicit conditional → branch-target edges
    /// (a selected branch is unlocked by the conditional's own success).
    /// For-each body members contribute no outer edges.
    pub fn effective_edges(&self) -> Vec<(String, String)> {
        let mut out: Vec<(String, String)> = Vec::new();
        let mut seen: FxHashSet<(String, String)> = FxHashSet::default();
        let mut push = |from: String, to: String| {
            if from != to && seen.insert((from.clone(), to.clone())) {
                out.push((from, to));
            }
        };
        for edge in &self.edges {
            push(edge.from.clone(), edge.to.clone());
        }
        for node in &self.nodes {
            for input in &node.inputs {
                push(input.clone(), node.id.clone());
            }
            if let Some(cond) = &node.conditional {
                for targets in cond.branches.values() {
                    for target in &targets.targets {
                        push(node.id.clone(), target.clone());
                    }
                }
            }
        }
        out
    }

    /// Node ids claimed by some for-each body, mapped to the loop that owns
    /// them. Validation guarantees each body node has exactly one owner.
    pub fn loop_body_owners(&self) -> FxHashMap<String, String> {
        let mut owners = FxHashMap::default();
        for node in &self.nodes {
            if let Some(cfg) = &node.for_each {
                for body in &cfg.body {
                    owners.entry(body.clone()).or_insert_with(|| node.id.clone());
                }
            }
        }
        owners
    }

    /// Structural validation; see [`PlanError`] for everything checked.
    pub fn validate(&self) -> Result<(), PlanError> {
        if self.nodes.is_empty() {
            return Err(PlanError::Empty);
        }

        let mut ids: FxHashSet<&str> = FxHashSet::default();
        for node in &self.nodes {
            if !ids.insert(node.id.as_str()) {
                return Err(PlanError::DuplicateNode {
                    id: node.id.clone(),
                });
            }
        }

        for edge in &self.edges {
            for endpoint in [&edge.from, &edge.to] {
                if !ids.contains(endpoint.as_str()) {
                    return Err(PlanError::UnknownEdgeEndpoint {
                        from: edge.from.clone(),
                        to: edge.to.clone(),
                        missing: endpoint.clone(),
                    });
                }
            }
        }

        for node in &self.nodes {
            for input in &node.inputs {
                if !ids.contains(input.as_str()) {
                    return Err(PlanError::UnknownInput {
                        node: node.id.clone(),
                        input: input.clone(),
                    });
                }
            }
            self.validate_node_config(node, &ids)?;
        }

        self.validate_loop_bodies()?;
        self.validate_acyclic()?;
        Ok(())
    }

    fn validate_node_config(
        &self,
        node: &NodeSpec,
        ids: &FxHashSet<&str>,
    ) -> Result<(), PlanError> {
        // Exactly one control-flow block, iff the type asks for one.
        let blocks: [(&'static str, bool); 3] = [
            ("conditional", node.conditional.is_some()),
            ("for_each", node.for_each.is_some()),
            ("subflow", node.subflow.is_some()),
        ];
        let expected = match node.node_type {
            NodeType::Task => None,
            NodeType::Conditional => Some("conditional"),
            NodeType::ForEach => Some("for_each"),
            NodeType::Subflow => {
                return Err(PlanError::SubflowUnsupported {
                    id: node.id.clone(),
                });
            }
        };
        for (name, present) in blocks {
            if present && expected != Some(name) {
                return Err(PlanError::UnexpectedControlFlowConfig {
                    id: node.id.clone(),
                    node_type: node.node_type.as_str(),
                    config: name,
                });
            }
        }
        if let Some(name) = expected {
            let present = blocks.iter().any(|(n, p)| *n == name && *p);
            if !present {
                return Err(PlanError::MissingControlFlowConfig {
                    id: node.id.clone(),
                    node_type: node.node_type.as_str(),
                });
            }
        }

        if let Some(cond) = &node.conditional {
            if cond.kind == ConditionalKind::If {
                for label in ["true", "false"] {
                    if !cond.branches.contains_key(label) {
                        return Err(PlanError::MissingBranchLabel {
                            id: node.id.clone(),
                            label,
                        });
                    }
                }
            }
            if let Some(default) = &cond.default_branch {
                if !cond.branches.contains_key(default) {
                    return Err(PlanError::UnknownDefaultBranch {
                        id: node.id.clone(),
                        label: default.clone(),
                    });
                }
            }
            for (branch, targets) in &cond.branches {
                for target in &targets.targets {
                    if !ids.contains(target.as_str()) {
                        return Err(PlanError::UnknownBranchTarget {
                            id: node.id.clone(),
                            branch: branch.clone(),
                            target: target.clone(),
                        });
                    }
                }
            }
        }

        if let Some(cfg) = &node.for_each {
            for body in &cfg.body {
                if !ids.contains(body.as_str()) {
                    return Err(PlanError::UnknownBodyNode {
                        id: node.id.clone(),
                        body: body.clone(),
                    });
                }
                if let Some(body_spec) = self.node(body) {
                    if body_spec.node_type != NodeType::Task {
                        return Err(PlanError::BodyNodeNotTask {
                            id: node.id.clone(),
                            body: body.clone(),
                        });
                    }
                }
            }
        }

        Ok(())
    }

    fn validate_loop_bodies(&self) -> Result<(), PlanError> {
        let mut owners: FxHashMap<&str, &str> = FxHashMap::default();
        for node in &self.nodes {
            if let Some(cfg) = &node.for_each {
                for body in &cfg.body {
                    if let Some(first) = owners.insert(body.as_str(), node.id.as_str()) {
                        if first != node.id {
                            return Err(PlanError::BodyNodeShared {
                                body: body.clone(),
                                first: first.to_string(),
                                second: node.id.clone(),
                            });
                        }
                    }
                }
            }
        }
        // Body nodes are scoped to their loop; nothing outside may depend on
        // them through the outer DAG.
        if !owners.is_empty() {
            for (from, to) in self.effective_edges() {
                if owners.contains_key(from.as_str()) && !owners.contains_key(to.as_str()) {
                    return Err(PlanError::BodyNodeHasOuterDependent {
                        body: from,
                        dependent: to,
                    });
                }
            }
        }
        Ok(())
    }

    /// Kahn's algorithm over the effective edge set.
    fn validate_acyclic(&self) -> Result<(), PlanError> {
        let mut indegree: FxHashMap<&str, usize> =
            self.nodes.iter().map(|n| (n.id.as_str(), 0)).collect();
        let mut adjacency: FxHashMap<&str, Vec<&str>> = FxHashMap::default();
        let edges = self.effective_edges();
        for (from, to) in &edges {
            if let Some(entry) = indegree.get_mut(to.as_str()) {
                *entry += 1;
            }
            adjacency.entry(from.as_str()).or_default().push(to.as_str());
        }

        let mut queue: Vec<&str> = self
            .nodes
            .iter()
            .map(|n| n.id.as_str())
            .filter(|id| indegree[id] == 0)
            .collect();
        let mut visited = 0usize;
        while let Some(id) = queue.pop() {
            visited += 1;
            if let Some(dependents) = adjacency.get(id) {
                for &dep in dependents {
                    if let Some(entry) = indegree.get_mut(dep) {
                        *entry -= 1;
                        if *entry == 0 {
                            queue.push(dep);
                        }
                    }
                }
            }
        }

        if visited != self.nodes.len() {
            let mut stuck: Vec<String> = indegree
                .into_iter()
                .filter(|(_, d)| *d > 0)
                .map(|(id, _)| id.to_string())
                .collect();
            stuck.sort();
            return Err(PlanError::Cycle { nodes: stuck });
        }
        Ok(())
    }
}
