//! Batch-mode expansion.
//!
//! An author can flip any plain node into batch mode instead of dragging an
//! explicit Batch composite. The compiler rewrites such a node into the
//! composite form before adaptation: a Batch parent that keeps the node's
//! key and its `list<object>` output, and a generated `{key}_inner` child
//! that runs once per element and emits the element object. The parent and
//! child are wired with the two inline edges every composite body carries.

use serde_json::json;

use crate::canvas::{port, Canvas, CanvasEdge, CanvasNode, NodeData};
use crate::error::WorkflowError;
use crate::node_type::NodeType;
use crate::types::{DataType, Variable, VariableSource};

/// Expand every batch-enabled node in place. Returns the keys of the
/// generated inner nodes, in canvas order.
pub fn expand_batch_nodes(canvas: &mut Canvas) -> Result<Vec<String>, WorkflowError> {
    let mut generated = Vec::new();

    for node in canvas.nodes.iter_mut() {
        // Batch mode inside a composite body would nest composites, which
        // the schema forbids.
        for child in &node.blocks {
            if child
                .data
                .node_batch_info
                .as_ref()
                .is_some_and(|b| b.enabled)
            {
                return Err(WorkflowError::invalid_parameter(format!(
                    "node {} cannot use batch mode inside a composite",
                    child.id
                )));
            }
        }

        let enabled = node
            .data
            .node_batch_info
            .as_ref()
            .is_some_and(|b| b.enabled);
        if !enabled {
            continue;
        }
        expand_one(node)?;
        generated.push(format!("{}_inner", node.id));
    }

    Ok(generated)
}

fn expand_one(node: &mut CanvasNode) -> Result<(), WorkflowError> {
    if NodeType::parse(&node.node_type).is_some_and(|t| t.is_composite()) {
        return Err(WorkflowError::invalid_parameter(format!(
            "composite node {} cannot also use batch mode",
            node.id
        )));
    }

    let Some(batch_info) = node.data.node_batch_info.take() else {
        return Ok(());
    };

    if node.data.outputs.len() != 1 {
        return Err(WorkflowError::invalid_parameter(format!(
            "batch-mode node {} must declare exactly one output, found {}",
            node.id,
            node.data.outputs.len()
        )));
    }
    let list_output = node.data.outputs[0].clone();
    let element_fields = match &list_output.var_type {
        DataType::List { element } => match element.as_ref() {
            DataType::Object { fields } => fields.clone(),
            other => {
                return Err(WorkflowError::invalid_parameter(format!(
                    "batch-mode node {} output must be list<object>, found list<{}>",
                    node.id, other
                )))
            }
        },
        other => {
            return Err(WorkflowError::invalid_parameter(format!(
                "batch-mode node {} output must be list<object>, found {}",
                node.id, other
            )))
        }
    };

    let inner_key = format!("{}_inner", node.id);
    let parent_name = node
        .data
        .name
        .clone()
        .unwrap_or_else(|| NodeType::Batch.display_name().to_string());

    // The inner node is the original node: same type, the original inputs
    // and exception policy, emitting one element object per run.
    let inner = CanvasNode {
        id: inner_key.clone(),
        node_type: node.node_type.clone(),
        meta: None,
        data: NodeData {
            name: Some(format!("{parent_name}_inner")),
            inputs: std::mem::take(&mut node.data.inputs),
            outputs: element_fields
                .iter()
                .map(|(name, ty)| Variable::new(name.clone(), ty.clone()))
                .collect(),
            configs: std::mem::take(&mut node.data.configs),
            settings: node.data.settings.take(),
            node_batch_info: None,
        },
        blocks: Vec::new(),
        edges: Vec::new(),
    };

    // The parent becomes the Batch composite: list inputs, concurrency
    // configuration, and the list output sourced positionally from the
    // inner node's element.
    let element_source = match element_fields.keys().next() {
        Some(field) if element_fields.len() == 1 => {
            VariableSource::reference(inner_key.clone(), &[field.as_str()])
        }
        _ => VariableSource::reference(inner_key.clone(), &[]),
    };
    node.node_type = NodeType::Batch.as_str().to_string();
    node.data.name = Some(parent_name);
    node.data.inputs = batch_info.input_lists.clone();
    node.data.outputs = vec![list_output.with_source(element_source)];
    node.data.configs = json!({
        "batch_size": batch_info.batch_size,
        "concurrent_size": batch_info.concurrent_size,
    });

    node.edges = vec![
        CanvasEdge::new(node.id.clone(), inner_key.clone())
            .with_source_port(port::BATCH_INLINE_OUTPUT),
        CanvasEdge::new(inner_key, node.id.clone()).with_target_port(port::BATCH_INLINE_INPUT),
    ];
    node.blocks = vec![inner];

    Ok(())
}
