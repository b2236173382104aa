//! Adaptors for the composite nodes, Loop and Batch.

use std::sync::Arc;

use crate::canvas::CanvasNode;
use crate::error::WorkflowError;
use crate::node_type::NodeType;
use crate::schema::configs::{BatchConfig, LoopConfig, LoopMode};
use crate::schema::{NodeConfigs, NodeSchema};
use crate::types::DataType;

use super::{base_schema, parse_configs, NodeAdaptor};

pub(super) fn adaptors() -> Vec<Arc<dyn NodeAdaptor>> {
    vec![Arc::new(LoopAdaptor), Arc::new(BatchAdaptor)]
}

struct LoopAdaptor;

impl NodeAdaptor for LoopAdaptor {
    fn node_type(&self) -> NodeType {
        NodeType::Loop
    }

    fn adapt(&self, node: &CanvasNode) -> Result<NodeSchema, WorkflowError> {
        let cfg: LoopConfig = parse_configs(node)?;
        match cfg.mode {
            LoopMode::Count if cfg.count.is_none() => {
                return Err(WorkflowError::conversion(
                    &node.id,
                    "count-mode loop needs a count",
                ));
            }
            LoopMode::Array => {
                let has_list_input = node
                    .data
                    .inputs
                    .iter()
                    .any(|v| matches!(v.var_type, DataType::List { .. }));
                if !has_list_input {
                    return Err(WorkflowError::conversion(
                        &node.id,
                        "array-mode loop needs a list input to iterate",
                    ));
                }
            }
            _ => {}
        }
        base_schema(node, NodeType::Loop, NodeConfigs::Loop(cfg))
    }
}

struct BatchAdaptor;

impl NodeAdaptor for BatchAdaptor {
    fn node_type(&self) -> NodeType {
        NodeType::Batch
    }

    fn adapt(&self, node: &CanvasNode) -> Result<NodeSchema, WorkflowError> {
        let cfg: BatchConfig = parse_configs(node)?;
        if cfg.batch_size == 0 || cfg.concurrent_size == 0 {
            return Err(WorkflowError::conversion(
                &node.id,
                "batch_size and concurrent_size must be at least 1",
            ));
        }
        base_schema(node, NodeType::Batch, NodeConfigs::Batch(cfg))
    }
}
