//! Sandboxed expression evaluation for control-flow nodes.
//!
//! Expressions are compiled once per source string and cached; evaluation
//! runs against a scope assembled from predecessor outputs and run context.
//! The engine is locked down: no I/O, bounded operation count, bounded
//! nesting, and a hard cap on expression length. Every failure is
//! recoverable — the scheduler turns it into a failed control-flow node, not
//! a crashed run.

use miette::Diagnostic;
use parking_lot::Mutex;
use rhai::{AST, Dynamic, Engine, Scope};
use rustc_hash::FxHashMap;
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;

/// Hard cap on expression source length.
pub const MAX_EXPRESSION_LEN: usize = 4096;

/// Ceiling on interpreter operations per evaluation.
const MAX_OPERATIONS: u64 = 100_000;

/// Errors from compiling or evaluating an expression. All recoverable.
#[derive(Debug, Error, Diagnostic)]
pub enum ExprError {
    #[error("expression is {len} chars, over the {max} char limit")]
    #[diagnostic(code(runloom::expr::too_long))]
    TooLong { len: usize, max: usize },

    #[error("expression failed to compile: {message}")]
    #[diagnostic(code(runloom::expr::compile))]
    Compile { message: String },

    #[error("expression evaluation failed: {message}")]
    #[diagnostic(code(runloom::expr::eval))]
    Eval { message: String },

    #[error("expression produced {type_name}, expected an ordered collection")]
    #[diagnostic(
        code(runloom::expr::not_a_collection),
        help("for_each collections must evaluate to an array.")
    )]
    NotACollection { type_name: String },
}

/// Environment an expression is evaluated against.
///
/// Shape seen by expressions:
///
/// ```text
/// inputs.<predecessor_id>.<output_name>   succeeded predecessor outputs
/// context.run_id / context.node_id / ...  run context and iteration vars
/// <var>                                   context vars flattened at top level
/// ```
#[derive(Clone, Debug, Default)]
pub struct ExprEnv {
    inputs: Map<String, Value>,
    context: Map<String, Value>,
}

impl ExprEnv {
    pub fn new(run_id: impl Into<String>, node_id: impl Into<String>) -> Self {
        let mut context = Map::new();
        context.insert("run_id".into(), Value::String(run_id.into()));
        context.insert("node_id".into(), Value::String(node_id.into()));
        Self {
            inputs: Map::new(),
            context,
        }
    }

    /// Attach one predecessor's outputs under `inputs.<node_id>`.
    #[must_use]
    pub fn with_input(mut self, node_id: impl Into<String>, outputs: Map<String, Value>) -> Self {
        self.inputs.insert(node_id.into(), Value::Object(outputs));
        self
    }

    /// Add a context variable (also flattened to top-level scope when its
    /// name is a valid identifier).
    #[must_use]
    pub fn with_context_var(mut self, name: impl Into<String>, value: Value) -> Self {
        self.context.insert(name.into(), value);
        self
    }

    pub fn context_var(&self, name: &str) -> Option<&Value> {
        self.context.get(name)
    }

    fn to_scope(&self) -> Result<Scope<'static>, ExprError> {
        let mut scope = Scope::new();
        scope.push_constant_dynamic("inputs", json_to_dynamic(&Value::Object(self.inputs.clone()))?);
        scope.push_constant_dynamic(
            "context",
            json_to_dynamic(&Value::Object(self.context.clone()))?,
        );
        for (name, value) in &self.context {
            if is_identifier(name) && name != "inputs" && name != "context" {
                scope.push_constant_dynamic(name.as_str(), json_to_dynamic(value)?);
            }
        }
        Ok(scope)
    }
}

/// Compiling, caching evaluator around a sandboxed rhai engine.
pub struct ExprEvaluator {
    engine: Engine,
    cache: Mutex<FxHashMap<String, Arc<AST>>>,
}

impl Default for ExprEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl ExprEvaluator {
    pub fn new() -> Self {
        let mut engine = Engine::new();
        engine.set_max_operations(MAX_OPERATIONS);
        engine.set_max_expr_depths(64, 64);
        engine.set_max_string_size(64 * 1024);
        engine.set_max_array_size(16 * 1024);
        engine.set_max_map_size(16 * 1024);
        Self {
            engine,
            cache: Mutex::new(FxHashMap::default()),
        }
    }

    /// Evaluate to a JSON value.
    pub fn evaluate(&self, source: &str, env: &ExprEnv) -> Result<Value, ExprError> {
        let ast = self.compile(source)?;
        let mut scope = env.to_scope()?;
        let result: Dynamic = self
            .engine
            .eval_ast_with_scope(&mut scope, &ast)
            .map_err(|e| ExprError::Eval {
                message: e.to_string(),
            })?;
        dynamic_to_json(&result)
    }

    /// Evaluate under the truthiness rule: `false`, `0`, `0.0`, the empty
    /// string, and null are false; anything else is true.
    pub fn evaluate_bool(&self, source: &str, env: &ExprEnv) -> Result<bool, ExprError> {
        Ok(truthy(&self.evaluate(source, env)?))
    }

    /// Evaluate to a string; non-strings are stringified as compact JSON,
    /// which is deterministic for a given value.
    pub fn evaluate_string(&self, source: &str, env: &ExprEnv) -> Result<String, ExprError> {
        let value = self.evaluate(source, env)?;
        Ok(stringify(&value))
    }

    /// Evaluate to an ordered collection; anything but an array is an error.
    pub fn evaluate_slice(&self, source: &str, env: &ExprEnv) -> Result<Vec<Value>, ExprError> {
        match self.evaluate(source, env)? {
            Value::Array(items) => Ok(items),
            other => Err(ExprError::NotACollection {
                type_name: json_type_name(&other).to_string(),
            }),
        }
    }

    fn compile(&self, source: &str) -> Result<Arc<AST>, ExprError> {
        if source.len() > MAX_EXPRESSION_LEN {
            return Err(ExprError::TooLong {
                len: source.len(),
                max: MAX_EXPRESSION_LEN,
            });
        }
        if let Some(ast) = self.cache.lock().get(source) {
            return Ok(Arc::clone(ast));
        }
        let ast = self
            .engine
            .compile_expression(source)
            .map_err(|e| ExprError::Compile {
                message: e.to_string(),
            })?;
        let ast = Arc::new(ast);
        self.cache
            .lock()
            .insert(source.to_string(), Arc::clone(&ast));
        Ok(ast)
    }
}

/// Truthiness over JSON values.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i != 0
            } else if let Some(u) = n.as_u64() {
                u != 0
            } else {
                n.as_f64().is_some_and(|f| f != 0.0)
            }
        }
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Deterministic string form: strings verbatim, everything else compact JSON.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn json_to_dynamic(value: &Value) -> Result<Dynamic, ExprError> {
    rhai::serde::to_dynamic(value).map_err(|e| ExprError::Eval {
        message: e.to_string(),
    })
}

fn dynamic_to_json(value: &Dynamic) -> Result<Value, ExprError> {
    rhai::serde::from_dynamic(value).map_err(|e| ExprError::Eval {
        message: e.to_string(),
    })
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
