//! Composite runners: Loop and Batch bodies.
//!
//! Both fork child value scopes off the enclosing scope and publish a view
//! of the composite under its own key, so children resolve per-iteration
//! values (current element, index, loop variables) by referencing their
//! parent. Loops run their body sequentially and honor Break/Continue;
//! batches run elements in waves of `batch_size` with up to
//! `concurrent_size` elements in flight.

use std::sync::Arc;

use serde_json::{json, Map, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::debug;

use canvasflow_core::error::WorkflowError;
use canvasflow_core::schema::configs::{BatchConfig, LoopConfig, LoopMode, NodeConfigs};
use canvasflow_core::schema::{NodeSchema, WorkflowSchema};
use canvasflow_core::types::VariableSource;

use crate::context::{resolve_inputs, resolve_source, value_at_path, ExecutionContext, ValueScope};
use crate::executor::LoopControl;
use crate::scheduler::WorkflowExecutor;

impl WorkflowExecutor {
    /// Run a Loop composite to completion and produce its output object.
    pub(crate) async fn run_loop(
        &self,
        schema: &Arc<WorkflowSchema>,
        node: &NodeSchema,
        scope: &Arc<ValueScope>,
        ctx: &ExecutionContext,
    ) -> Result<Value, WorkflowError> {
        let NodeConfigs::Loop(cfg) = &node.configs else {
            return Err(WorkflowError::operation(format!(
                "node {} is not a loop",
                node.key
            )));
        };
        let children: Vec<String> = schema
            .hierarchy
            .iter()
            .filter(|(_, parent)| parent.as_str() == node.key)
            .map(|(child, _)| child.clone())
            .collect();
        let inputs = resolve_inputs(node, scope).await?;

        // The loop view starts as the resolved inputs plus the declared
        // loop variables; VariableAssignerWithinLoop updates it in place.
        let mut view = inputs.as_object().cloned().unwrap_or_default();
        for variable in &cfg.variables {
            let initial = match &variable.source {
                Some(source) => resolve_source(source, scope).await?,
                None => Value::Null,
            };
            view.insert(variable.name.clone(), initial);
        }

        let plan = iteration_plan(cfg, &inputs, &node.key)?;
        let mut last_body: Option<Arc<ValueScope>> = None;
        let mut index: u64 = 0;

        loop {
            ctx.check_live()?;
            let element = match &plan {
                IterationPlan::Array { list } => match list.get(index as usize) {
                    Some(element) => Some(element.clone()),
                    None => break,
                },
                IterationPlan::Count { count } => {
                    if index >= *count {
                        break;
                    }
                    None
                }
                IterationPlan::Infinite => None,
            };

            let body = ValueScope::child(scope);
            let mut iteration_view = view.clone();
            iteration_view.insert("index".to_string(), json!(index));
            if let (Some(element), IterationPlan::Array { .. }) = (&element, &plan) {
                // Array mode: each list input name resolves element-wise.
                for (name, value) in list_inputs(&inputs) {
                    let item = value
                        .as_array()
                        .and_then(|a| a.get(index as usize))
                        .cloned()
                        .unwrap_or(Value::Null);
                    iteration_view.insert(name, item);
                }
                iteration_view.insert("item".to_string(), element.clone());
            }
            body.set(&node.key, Value::Object(iteration_view)).await;

            let run = self
                .run_scope(
                    Arc::clone(schema),
                    children.clone(),
                    Arc::clone(&body),
                    ctx.clone(),
                )
                .await?;
            if let Some((node_key, prompt)) = run.suspended {
                // Suspension bubbles out; the loop restarts from its first
                // iteration on resume since only completed composites are
                // checkpointed.
                return Err(WorkflowError::operation(format!(
                    "node {node_key} suspended inside loop {}: {prompt}",
                    node.key
                )));
            }

            // Carry variable mutations into the next iteration.
            if let Some(Value::Object(updated)) = body.get(&node.key).await {
                for variable in &cfg.variables {
                    if let Some(value) = updated.get(&variable.name) {
                        view.insert(variable.name.clone(), value.clone());
                    }
                }
            }
            last_body = Some(body);
            index += 1;

            match run.control {
                Some(LoopControl::Break) => break,
                Some(LoopControl::Continue) | None => continue,
            }
        }

        debug!(node_key = %node.key, iterations = index, "loop finished");
        self.collect_composite_outputs(node, &view, last_body.as_deref()).await
    }

    /// Run a Batch composite: waves of `batch_size`, `concurrent_size`
    /// children in flight, outputs aggregated positionally.
    pub(crate) async fn run_batch(
        &self,
        schema: &Arc<WorkflowSchema>,
        node: &NodeSchema,
        scope: &Arc<ValueScope>,
        ctx: &ExecutionContext,
    ) -> Result<Value, WorkflowError> {
        let NodeConfigs::Batch(BatchConfig {
            batch_size,
            concurrent_size,
        }) = &node.configs
        else {
            return Err(WorkflowError::operation(format!(
                "node {} is not a batch",
                node.key
            )));
        };
        let children: Vec<String> = schema
            .hierarchy
            .iter()
            .filter(|(_, parent)| parent.as_str() == node.key)
            .map(|(child, _)| child.clone())
            .collect();
        let inputs = resolve_inputs(node, scope).await?;

        let lists = list_inputs(&inputs);
        let total = lists
            .iter()
            .filter_map(|(_, v)| v.as_array().map(Vec::len))
            .min()
            .unwrap_or(0);

        let semaphore = Arc::new(Semaphore::new((*concurrent_size).max(1) as usize));
        let mut element_outputs: Vec<Option<Arc<ValueScope>>> = (0..total).map(|_| None).collect();

        for wave in (0..total).collect::<Vec<_>>().chunks((*batch_size).max(1) as usize) {
            ctx.check_live()?;
            let mut join_set: JoinSet<(usize, Result<Arc<ValueScope>, WorkflowError>)> =
                JoinSet::new();

            for &index in wave {
                let body = ValueScope::child(scope);
                let mut view = Map::new();
                view.insert("index".to_string(), json!(index));
                for (name, value) in &lists {
                    let item = value
                        .as_array()
                        .and_then(|a| a.get(index))
                        .cloned()
                        .unwrap_or(Value::Null);
                    view.insert(name.clone(), item);
                }
                let seeded = Value::Object(view);

                let this = self.clone();
                let task_schema = Arc::clone(schema);
                let task_children = children.clone();
                let task_ctx = ctx.clone();
                let task_key = node.key.clone();
                let task_semaphore = Arc::clone(&semaphore);
                join_set.spawn(async move {
                    let _permit = task_semaphore.acquire().await;
                    body.set(&task_key, seeded).await;
                    let result = this
                        .run_scope(task_schema, task_children, Arc::clone(&body), task_ctx)
                        .await;
                    match result {
                        Ok(run) if run.suspended.is_some() => (
                            index,
                            Err(WorkflowError::operation(
                                "node suspended inside batch body",
                            )),
                        ),
                        Ok(_) => (index, Ok(body)),
                        Err(e) => (index, Err(e)),
                    }
                });
            }

            while let Some(joined) = join_set.join_next().await {
                let (index, result) = joined
                    .map_err(|e| WorkflowError::operation(format!("batch task panicked: {e}")))?;
                element_outputs[index] = Some(result?);
            }
        }

        // Aggregate positionally: each output field collects its referenced
        // per-element value in index order.
        let mut out = Map::new();
        for field in &node.output_sources {
            let Some(name) = field.path.first() else {
                continue;
            };
            let mut collected = Vec::with_capacity(total);
            for body in element_outputs.iter().flatten() {
                collected.push(resolve_element_output(field.source.as_ref(), body).await?);
            }
            out.insert(name.clone(), Value::Array(collected));
        }
        debug!(node_key = %node.key, elements = total, "batch finished");
        Ok(Value::Object(out))
    }

    /// Resolve a composite's declared outputs after its body finished:
    /// sources referencing children resolve in the final body scope, and
    /// loop-variable names resolve from the variable view.
    async fn collect_composite_outputs(
        &self,
        node: &NodeSchema,
        view: &Map<String, Value>,
        last_body: Option<&ValueScope>,
    ) -> Result<Value, WorkflowError> {
        let mut out = Map::new();
        for field in &node.output_sources {
            let Some(name) = field.path.first() else {
                continue;
            };
            let value = match &field.source {
                Some(VariableSource::Reference { node_key, path }) => {
                    if node_key == &node.key {
                        // A reference to the loop itself reads the variable
                        // view (loop variables, index, element bindings).
                        value_at_path(&Value::Object(view.clone()), path)
                    } else if let Some(body) = last_body {
                        match body.get(node_key).await {
                            Some(produced) => value_at_path(&produced, path),
                            None => Value::Null,
                        }
                    } else {
                        Value::Null
                    }
                }
                Some(VariableSource::Literal { value }) => value.clone(),
                None => view.get(name).cloned().unwrap_or(Value::Null),
            };
            out.insert(name.clone(), value);
        }
        Ok(Value::Object(out))
    }
}

enum IterationPlan {
    Array { list: Vec<Value> },
    Count { count: u64 },
    Infinite,
}

fn iteration_plan(
    cfg: &LoopConfig,
    inputs: &Value,
    node_key: &str,
) -> Result<IterationPlan, WorkflowError> {
    match cfg.mode {
        LoopMode::Array => {
            let list = list_inputs(inputs)
                .into_iter()
                .next()
                .and_then(|(_, v)| v.as_array().cloned())
                .ok_or_else(|| {
                    WorkflowError::invalid_parameter(format!(
                        "loop {node_key} has no list input to iterate"
                    ))
                })?;
            Ok(IterationPlan::Array { list })
        }
        LoopMode::Count => {
            let count = cfg.count.ok_or_else(|| {
                WorkflowError::invalid_parameter(format!("loop {node_key} has no count"))
            })?;
            Ok(IterationPlan::Count { count })
        }
        LoopMode::Infinite => Ok(IterationPlan::Infinite),
    }
}

/// The list-valued fields of a resolved input object, in field order.
fn list_inputs(inputs: &Value) -> Vec<(String, Value)> {
    inputs
        .as_object()
        .map(|o| {
            o.iter()
                .filter(|(_, v)| v.is_array())
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        })
        .unwrap_or_default()
}

async fn resolve_element_output(
    source: Option<&VariableSource>,
    body: &ValueScope,
) -> Result<Value, WorkflowError> {
    match source {
        Some(VariableSource::Reference { node_key, path }) => {
            match body.get(node_key).await {
                Some(produced) => Ok(value_at_path(&produced, path)),
                None => Ok(Value::Null),
            }
        }
        Some(VariableSource::Literal { value }) => Ok(value.clone()),
        None => Ok(Value::Null),
    }
}
