//! Execution state shared across a running workflow.
//!
//! [`ExecutionContext`] carries the identity, cancellation and event wiring
//! of one execution. [`ValueScope`] holds node outputs: one scope per
//! composite body, chained to its parent so children read outer outputs and
//! the per-iteration overlays a composite runner installs, while writes
//! stay local to the scope.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use handlebars::Handlebars;
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use canvasflow_core::error::WorkflowError;
use canvasflow_core::schema::{FieldInfo, NodeSchema};
use canvasflow_core::types::VariableSource;

use crate::ports::ExecutionEvent;

/// Identity and control surface of one workflow execution.
#[derive(Clone)]
pub struct ExecutionContext {
    pub execution_id: Uuid,
    pub workflow_id: i64,
    pub cancellation: CancellationToken,
    pub deadline: Option<Instant>,
    /// Workflow-scoped variables written by VariableAssigner nodes.
    pub variables: Arc<RwLock<HashMap<String, Value>>>,
    /// Inputs the caller supplied for suspended nodes, keyed by node key.
    /// Populated on resume.
    pub provided_inputs: Arc<HashMap<String, Value>>,
    /// Conversation the execution is bound to, for chat-related nodes.
    pub conversation_id: Option<i64>,
    events: Option<mpsc::Sender<ExecutionEvent>>,
}

impl ExecutionContext {
    pub fn new(workflow_id: i64) -> Self {
        Self {
            execution_id: Uuid::new_v4(),
            workflow_id,
            cancellation: CancellationToken::new(),
            deadline: None,
            variables: Arc::new(RwLock::new(HashMap::new())),
            provided_inputs: Arc::new(HashMap::new()),
            conversation_id: None,
            events: None,
        }
    }

    pub fn with_execution_id(mut self, execution_id: Uuid) -> Self {
        self.execution_id = execution_id;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn with_events(mut self, events: mpsc::Sender<ExecutionEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_provided_inputs(mut self, inputs: HashMap<String, Value>) -> Self {
        self.provided_inputs = Arc::new(inputs);
        self
    }

    pub fn with_conversation(mut self, conversation_id: i64) -> Self {
        self.conversation_id = Some(conversation_id);
        self
    }

    /// Poll the cancellation signal and the workflow deadline. Every
    /// suspension point calls this before doing work.
    pub fn check_live(&self) -> Result<(), WorkflowError> {
        if self.cancellation.is_cancelled() {
            return Err(WorkflowError::operation("execution cancelled"));
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(WorkflowError::operation("workflow deadline exceeded"));
            }
        }
        Ok(())
    }

    pub async fn emit(&self, event: ExecutionEvent) {
        if let Some(events) = &self.events {
            // A closed event channel means nobody is listening; execution
            // continues regardless.
            let _ = events.send(event).await;
        }
    }
}

/// Node outputs of one scope, chained to the enclosing scope.
pub struct ValueScope {
    local: RwLock<HashMap<String, Value>>,
    parent: Option<Arc<ValueScope>>,
}

impl ValueScope {
    pub fn root() -> Arc<Self> {
        Arc::new(Self {
            local: RwLock::new(HashMap::new()),
            parent: None,
        })
    }

    pub fn child(parent: &Arc<ValueScope>) -> Arc<Self> {
        Arc::new(Self {
            local: RwLock::new(HashMap::new()),
            parent: Some(Arc::clone(parent)),
        })
    }

    pub async fn set(&self, node_key: &str, value: Value) {
        self.local.write().await.insert(node_key.to_string(), value);
    }

    pub async fn get(&self, node_key: &str) -> Option<Value> {
        let mut scope = self;
        loop {
            if let Some(value) = scope.local.read().await.get(node_key) {
                return Some(value.clone());
            }
            scope = scope.parent.as_deref()?;
        }
    }

    /// Snapshot of the local layer. Composite runners use it to collect an
    /// iteration's outputs.
    pub async fn local_snapshot(&self) -> HashMap<String, Value> {
        self.local.read().await.clone()
    }
}

/// Navigate a value along a field path. A `"*"` step flattens into the list
/// itself (runtime values are concrete, the element view only exists in the
/// type system). Missing fields resolve to `null` rather than failing: the
/// validator already guaranteed well-typed references, and execution-time
/// nulls flow into downstream defaults.
pub fn value_at_path(value: &Value, path: &[String]) -> Value {
    let mut current = value;
    for step in path {
        if step == "*" {
            continue;
        }
        match current.get(step) {
            Some(next) => current = next,
            None => return Value::Null,
        }
    }
    current.clone()
}

/// Resolve one variable source against the scope.
pub async fn resolve_source(
    source: &VariableSource,
    scope: &ValueScope,
) -> Result<Value, WorkflowError> {
    match source {
        VariableSource::Literal { value } => Ok(value.clone()),
        VariableSource::Reference { node_key, path } => {
            let produced = scope.get(node_key).await.ok_or_else(|| {
                WorkflowError::operation(format!(
                    "input references node {node_key} which has not produced output"
                ))
            })?;
            Ok(value_at_path(&produced, path))
        }
    }
}

/// Resolve every input slot of a node into one JSON object keyed by the
/// slot path.
pub async fn resolve_inputs(
    node: &NodeSchema,
    scope: &ValueScope,
) -> Result<Value, WorkflowError> {
    let mut object = serde_json::Map::new();
    for field in &node.input_sources {
        let value = match &field.source {
            Some(source) => resolve_source(source, scope).await?,
            None => Value::Null,
        };
        insert_at_path(&mut object, &field.path, value);
    }
    Ok(Value::Object(object))
}

fn insert_at_path(object: &mut serde_json::Map<String, Value>, path: &[String], value: Value) {
    match path {
        [] => {}
        [leaf] => {
            object.insert(leaf.clone(), value);
        }
        [head, rest @ ..] => {
            let entry = object
                .entry(head.clone())
                .or_insert_with(|| Value::Object(serde_json::Map::new()));
            if let Value::Object(inner) = entry {
                insert_at_path(inner, rest, value);
            }
        }
    }
}

/// Render a `{{name}}` template over resolved inputs. Prompts and emitter
/// content use the same renderer the rest of the platform uses for its
/// templates.
pub fn render_template(template: &str, inputs: &Value) -> Result<String, WorkflowError> {
    let mut registry = Handlebars::new();
    registry.set_strict_mode(false);
    registry
        .render_template(template, inputs)
        .map_err(|e| WorkflowError::operation(format!("template render failed: {e}")))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn scopes_chain_to_parents() {
        let root = ValueScope::root();
        root.set("entry", json!({ "input": "hi" })).await;

        let child = ValueScope::child(&root);
        child.set("iter", json!({ "item": 1 })).await;

        assert_eq!(child.get("entry").await, Some(json!({ "input": "hi" })));
        assert_eq!(child.get("iter").await, Some(json!({ "item": 1 })));
        // Writes stay local.
        assert_eq!(root.get("iter").await, None);
    }

    #[tokio::test]
    async fn resolve_reference_walks_paths() {
        let scope = ValueScope::root();
        scope
            .set("llm", json!({ "result": { "answer": "42" } }))
            .await;
        let source = VariableSource::reference("llm", &["result", "answer"]);
        assert_eq!(resolve_source(&source, &scope).await.unwrap(), json!("42"));

        let missing = VariableSource::reference("llm", &["result", "nope"]);
        assert_eq!(resolve_source(&missing, &scope).await.unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn unresolved_node_is_an_error() {
        let scope = ValueScope::root();
        let source = VariableSource::reference("ghost", &["x"]);
        assert!(resolve_source(&source, &scope).await.is_err());
    }

    #[test]
    fn templates_render_nested_fields() {
        let inputs = json!({ "user": { "name": "ada" }, "n": 3 });
        let text = render_template("{{user.name}} has {{n}} items", &inputs).unwrap();
        assert_eq!(text, "ada has 3 items");
    }

    #[test]
    fn deadline_is_enforced() {
        let ctx = ExecutionContext::new(1).with_deadline(Instant::now() - Duration::from_secs(1));
        assert!(ctx.check_live().is_err());

        let ctx = ExecutionContext::new(1).with_timeout(Duration::from_secs(60));
        assert!(ctx.check_live().is_ok());
    }

    #[test]
    fn cancellation_is_observed() {
        let ctx = ExecutionContext::new(1);
        assert!(ctx.check_live().is_ok());
        ctx.cancellation.cancel();
        assert!(ctx.check_live().is_err());
    }
}
