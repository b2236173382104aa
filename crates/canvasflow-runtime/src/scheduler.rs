//! # DAG Scheduler
//!
//! Executes a compiled schema: nodes are units of work on the tokio pool,
//! data-independent nodes run in parallel up to `max_parallel`, and a node
//! becomes ready when its control predecessors have resolved (with exactly
//! one branch firing per decision) and its data dependencies have produced
//! output. Composite nodes fork child scopes through the runners in
//! [`crate::composite`]; sub-workflow nodes nest a full execution.
//!
//! Checkpointing: when the schema requires it, every completed node's output
//! is persisted keyed `(execution_id, node_key)`. A resumed execution seeds
//! those outputs and skips the nodes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use canvasflow_core::error::WorkflowError;
use canvasflow_core::node_type::NodeType;
use canvasflow_core::schema::{NodeSchema, WorkflowSchema};

use crate::checkpoint::{CheckpointStore, MemoryCheckpointStore};
use crate::context::{resolve_inputs, ExecutionContext, ValueScope};
use crate::exception::{run_with_policy, PolicyVerdict};
use crate::executor::{ExecutorSet, LoopControl, NodeOutput};
use crate::ports::ExecutionEvent;

/// Default worker-pool width per scope.
const DEFAULT_MAX_PARALLEL: usize = 8;

/// How an execution ended.
#[derive(Debug)]
pub enum ExecutionOutcome {
    Completed {
        output: Value,
    },
    /// Execution stopped at a node awaiting caller input. Resume with the
    /// same execution id and the node's input in `provided_inputs`.
    Suspended {
        node_key: String,
        prompt: Value,
    },
}

/// Result of running one scope (the top level or a composite body).
pub(crate) struct ScopeRun {
    pub control: Option<LoopControl>,
    pub suspended: Option<(String, Value)>,
}

#[derive(Debug, Clone, PartialEq)]
enum NodeState {
    Pending,
    Running,
    Done { fired: Option<String> },
    Skipped,
}

/// What one spawned node task reports back.
enum TaskResult {
    Done { fired: Option<String>, value: Value },
    Control(LoopControl),
    Suspend { prompt: Value },
}

#[derive(Clone)]
pub struct WorkflowExecutor {
    executors: ExecutorSet,
    checkpoints: Arc<dyn CheckpointStore>,
    max_parallel: usize,
}

impl WorkflowExecutor {
    pub fn new(executors: ExecutorSet) -> Self {
        Self {
            executors,
            checkpoints: Arc::new(MemoryCheckpointStore::new()),
            max_parallel: DEFAULT_MAX_PARALLEL,
        }
    }

    pub fn with_checkpoints(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = store;
        self
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    /// Run a workflow to completion, suspension or failure.
    ///
    /// `input` is the entry parameter object. On resume, pass the same
    /// `execution_id` in the context; checkpointed nodes are skipped.
    pub async fn execute(
        &self,
        schema: Arc<WorkflowSchema>,
        input: Value,
        ctx: ExecutionContext,
    ) -> Result<ExecutionOutcome, WorkflowError> {
        ctx.check_live()?;
        let scope = ValueScope::root();

        // Seed persisted outputs so resumed executions skip finished nodes.
        if schema.require_checkpoint {
            for (node_key, payload) in self.checkpoints.list(ctx.execution_id).await? {
                match serde_json::from_slice::<Value>(&payload) {
                    Ok(value) => scope.set(&node_key, value).await,
                    Err(e) => warn!(node_key, %e, "discarding unreadable checkpoint"),
                }
            }
        }

        let Some(entry) = schema.nodes.iter().find(|n| n.node_type == NodeType::Entry) else {
            return Err(WorkflowError::invalid_parameter("schema has no entry node"));
        };
        if scope.get(&entry.key).await.is_none() {
            scope.set(&entry.key, input).await;
            self.checkpoint(&schema, &ctx, &entry.key, &scope).await?;
        }

        let keys: Vec<String> = schema
            .top_level_keys()
            .into_iter()
            .map(str::to_string)
            .collect();
        let run = self.run_scope(Arc::clone(&schema), keys, scope.clone(), ctx.clone()).await?;

        if let Some((node_key, prompt)) = run.suspended {
            ctx.emit(ExecutionEvent::Suspended {
                node_key: node_key.clone(),
                execution_id: ctx.execution_id,
            })
            .await;
            return Ok(ExecutionOutcome::Suspended { node_key, prompt });
        }

        let exit = schema
            .nodes
            .iter()
            .find(|n| n.node_type == NodeType::Exit)
            .ok_or_else(|| WorkflowError::invalid_parameter("schema has no exit node"))?;
        let output = scope.get(&exit.key).await.unwrap_or(Value::Null);

        if schema.require_checkpoint {
            self.checkpoints.clear(ctx.execution_id).await?;
        }
        Ok(ExecutionOutcome::Completed { output })
    }

    /// Run one scope to quiescence. Scope members are `keys`; everything
    /// else in the schema is invisible here except through value reads.
    pub(crate) fn run_scope(
        &self,
        schema: Arc<WorkflowSchema>,
        keys: Vec<String>,
        scope: Arc<ValueScope>,
        ctx: ExecutionContext,
    ) -> BoxFuture<'static, Result<ScopeRun, WorkflowError>> {
        let this = self.clone();
        async move {
            let key_set: HashSet<&str> = keys.iter().map(String::as_str).collect();
            let mut states: HashMap<String, NodeState> = HashMap::new();
            for key in &keys {
                let state = if scope.get(key).await.is_some() {
                    NodeState::Done { fired: None }
                } else {
                    NodeState::Pending
                };
                states.insert(key.clone(), state);
            }

            // Scope-local wiring: control edges and data dependencies.
            let connections: Vec<_> = schema
                .connections
                .iter()
                .filter(|c| key_set.contains(c.from_node.as_str()) && key_set.contains(c.to_node.as_str()))
                .cloned()
                .collect();
            let data_deps: HashMap<String, Vec<String>> = keys
                .iter()
                .filter_map(|key| schema.node(key).map(|n| (key, n)))
                .map(|(key, node)| {
                    let deps = node
                        .referenced_nodes()
                        .into_iter()
                        .filter(|r| key_set.contains(r) && *r != key.as_str())
                        .map(str::to_string)
                        .collect();
                    (key.clone(), deps)
                })
                .collect();

            let semaphore = Arc::new(Semaphore::new(this.max_parallel));
            let mut join_set: JoinSet<(String, Result<TaskResult, WorkflowError>)> = JoinSet::new();
            let mut control: Option<LoopControl> = None;
            let mut suspended: Option<(String, Value)> = None;

            loop {
                ctx.check_live()?;

                // Stop scheduling new work once the scope is winding down.
                // Skips can unblock further nodes, so plan to a fixpoint.
                while control.is_none() && suspended.is_none() {
                    let transitions = plan_transitions(&keys, &states, &connections, &data_deps);
                    if transitions.run.is_empty() && transitions.skip.is_empty() {
                        break;
                    }
                    for key in transitions.skip {
                        states.insert(key.clone(), NodeState::Skipped);
                        scope.set(&key, Value::Null).await;
                        ctx.emit(ExecutionEvent::NodeSkipped { node_key: key }).await;
                    }
                    for key in transitions.run {
                        let node = schema
                            .node(&key)
                            .ok_or_else(|| {
                                WorkflowError::operation(format!("scope node {key} missing from schema"))
                            })?
                            .clone();
                        states.insert(key.clone(), NodeState::Running);
                        ctx.emit(ExecutionEvent::NodeStarted { node_key: key.clone() }).await;

                        let task_self = this.clone();
                        let task_schema = Arc::clone(&schema);
                        let task_scope = Arc::clone(&scope);
                        let task_ctx = ctx.clone();
                        let task_semaphore = Arc::clone(&semaphore);
                        join_set.spawn(async move {
                            let _permit = task_semaphore.acquire().await;
                            let result = task_self
                                .run_node(task_schema, node, task_scope, task_ctx)
                                .await;
                            (key, result)
                        });
                    }
                }

                let Some(joined) = join_set.join_next().await else {
                    break;
                };
                let (key, result) = joined
                    .map_err(|e| WorkflowError::operation(format!("node task panicked: {e}")))?;
                match result? {
                    TaskResult::Done { fired, value } => {
                        scope.set(&key, value).await;
                        this.checkpoint(&schema, &ctx, &key, &scope).await?;
                        states.insert(key.clone(), NodeState::Done { fired });
                        ctx.emit(ExecutionEvent::NodeFinished { node_key: key }).await;
                    }
                    TaskResult::Control(signal) => {
                        states.insert(key.clone(), NodeState::Done { fired: None });
                        control = Some(signal);
                    }
                    TaskResult::Suspend { prompt } => {
                        states.insert(key.clone(), NodeState::Pending);
                        suspended = Some((key, prompt));
                    }
                }
            }

            if control.is_none() && suspended.is_none() {
                let stalled: Vec<&String> = states
                    .iter()
                    .filter(|(_, s)| **s == NodeState::Pending)
                    .map(|(k, _)| k)
                    .collect();
                if !stalled.is_empty() {
                    return Err(WorkflowError::operation(format!(
                        "execution stalled; unrunnable nodes: {stalled:?}"
                    )));
                }
            }

            Ok(ScopeRun { control, suspended })
        }
        .boxed()
    }

    /// Execute one scope member: composites fork runners, sub-workflows
    /// nest an execution, plain nodes go through the exception policy.
    async fn run_node(
        &self,
        schema: Arc<WorkflowSchema>,
        node: NodeSchema,
        scope: Arc<ValueScope>,
        ctx: ExecutionContext,
    ) -> Result<TaskResult, WorkflowError> {
        match node.node_type {
            NodeType::Loop => {
                let value = self.run_loop(&schema, &node, &scope, &ctx).await?;
                Ok(TaskResult::Done { fired: None, value })
            }
            NodeType::Batch => {
                let value = self.run_batch(&schema, &node, &scope, &ctx).await?;
                Ok(TaskResult::Done { fired: None, value })
            }
            NodeType::SubWorkflow => self.run_sub_workflow(&node, &scope, &ctx).await,
            _ => {
                let inputs = resolve_inputs(&node, &scope).await?;
                let verdict = run_with_policy(&node.key, node.exception_configs.as_ref(), |attempt| {
                    let inputs = inputs.clone();
                    let node = &node;
                    let schema = &schema;
                    let scope = &scope;
                    let ctx = &ctx;
                    async move {
                        self.executors
                            .execute(schema, node, inputs, scope, ctx, attempt)
                            .await
                    }
                })
                .await?;

                Ok(match verdict {
                    PolicyVerdict::Output(NodeOutput::Value(value)) => TaskResult::Done {
                        fired: None,
                        value,
                    },
                    PolicyVerdict::Output(NodeOutput::Decision { port, value }) => TaskResult::Done {
                        fired: Some(port),
                        value,
                    },
                    PolicyVerdict::Output(NodeOutput::Control(signal)) => TaskResult::Control(signal),
                    PolicyVerdict::Output(NodeOutput::Suspend { prompt }) => {
                        TaskResult::Suspend { prompt }
                    }
                    PolicyVerdict::DefaultData(value) => TaskResult::Done {
                        fired: None,
                        value,
                    },
                    PolicyVerdict::ExceptionRoute { message } => TaskResult::Done {
                        fired: Some(canvasflow_core::canvas::port::EXCEPTION.to_string()),
                        value: serde_json::json!({
                            "is_success": false,
                            "error_body": message,
                        }),
                    },
                })
            }
        }
    }

    async fn run_sub_workflow(
        &self,
        node: &NodeSchema,
        scope: &Arc<ValueScope>,
        ctx: &ExecutionContext,
    ) -> Result<TaskResult, WorkflowError> {
        let Some(sub_schema) = &node.sub_workflow_schema else {
            return Err(WorkflowError::operation(format!(
                "sub-workflow node {} has no embedded schema",
                node.key
            )));
        };
        let inputs = resolve_inputs(node, scope).await?;

        // The nested execution shares cancellation, deadline and events but
        // owns its variables and value space.
        let mut sub_ctx = ExecutionContext::new(
            node.sub_workflow_basic
                .as_ref()
                .map(|b| b.workflow_id)
                .unwrap_or(ctx.workflow_id),
        )
        .with_cancellation(ctx.cancellation.child_token());
        sub_ctx.deadline = ctx.deadline;
        sub_ctx.conversation_id = ctx.conversation_id;

        let outcome = self
            .clone()
            .execute(Arc::new((**sub_schema).clone()), inputs, sub_ctx)
            .await?;
        match outcome {
            ExecutionOutcome::Completed { output } => Ok(TaskResult::Done {
                fired: None,
                value: output,
            }),
            ExecutionOutcome::Suspended { prompt, .. } => Ok(TaskResult::Suspend { prompt }),
        }
    }

    async fn checkpoint(
        &self,
        schema: &WorkflowSchema,
        ctx: &ExecutionContext,
        node_key: &str,
        scope: &ValueScope,
    ) -> Result<(), WorkflowError> {
        if !schema.require_checkpoint {
            return Ok(());
        }
        let Some(value) = scope.get(node_key).await else {
            return Ok(());
        };
        let payload = serde_json::to_vec(&value)?;
        self.checkpoints
            .put(ctx.execution_id, node_key, payload)
            .await?;
        debug!(node_key, execution_id = %ctx.execution_id, "checkpointed node output");
        Ok(())
    }
}

struct Transitions {
    run: Vec<String>,
    skip: Vec<String>,
}

/// Decide which pending nodes can start and which will never fire.
fn plan_transitions(
    keys: &[String],
    states: &HashMap<String, NodeState>,
    connections: &[canvasflow_core::schema::Connection],
    data_deps: &HashMap<String, Vec<String>>,
) -> Transitions {
    let mut run = Vec::new();
    let mut skip = Vec::new();

    for key in keys {
        if states.get(key) != Some(&NodeState::Pending) {
            continue;
        }

        let inbound: Vec<_> = connections.iter().filter(|c| &c.to_node == key).collect();
        let all_resolved = inbound.iter().all(|c| {
            matches!(
                states.get(&c.from_node),
                Some(NodeState::Done { .. }) | Some(NodeState::Skipped)
            )
        });
        if !all_resolved {
            continue;
        }

        // A connection fires when its source finished on the matching port.
        let enabled = inbound.is_empty()
            || inbound.iter().any(|c| match states.get(&c.from_node) {
                Some(NodeState::Done { fired }) => fired == &c.from_port,
                _ => false,
            });
        if !enabled {
            skip.push(key.clone());
            continue;
        }

        let deps_resolved = data_deps
            .get(key)
            .into_iter()
            .flatten()
            .all(|dep| {
                matches!(
                    states.get(dep),
                    Some(NodeState::Done { .. }) | Some(NodeState::Skipped) | None
                )
            });
        if deps_resolved {
            run.push(key.clone());
        }
    }

    Transitions { run, skip }
}
