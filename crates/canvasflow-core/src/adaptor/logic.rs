//! Adaptors for the branching nodes (Selector, IntentDetector,
//! QuestionAnswer) and the loop controls (Break, Continue).
//!
//! Branch *ports* are a compiler concern: these adaptors validate the
//! configuration that determines how many branches exist, and the compiler
//! normalizes the outgoing canvas ports against it.

use std::sync::Arc;

use serde::Deserialize;

use crate::canvas::CanvasNode;
use crate::error::WorkflowError;
use crate::node_type::NodeType;
use crate::schema::configs::{
    AnswerType, IntentDetectorConfig, QuestionAnswerConfig, SelectorClause,
};
use crate::schema::{NodeConfigs, NodeSchema};

use super::{base_schema, parse_configs, NodeAdaptor};

pub(super) fn adaptors() -> Vec<Arc<dyn NodeAdaptor>> {
    vec![
        Arc::new(SelectorAdaptor),
        Arc::new(IntentDetectorAdaptor),
        Arc::new(QuestionAnswerAdaptor),
        Arc::new(LoopControlAdaptor(NodeType::Break)),
        Arc::new(LoopControlAdaptor(NodeType::Continue)),
    ]
}

#[derive(Debug, Deserialize)]
struct RawSelectorConfig {
    clauses: Vec<SelectorClause>,
}

struct SelectorAdaptor;

impl NodeAdaptor for SelectorAdaptor {
    fn node_type(&self) -> NodeType {
        NodeType::Selector
    }

    fn adapt(&self, node: &CanvasNode) -> Result<NodeSchema, WorkflowError> {
        let raw: RawSelectorConfig = parse_configs(node)?;
        if raw.clauses.is_empty() {
            return Err(WorkflowError::conversion(
                &node.id,
                "selector needs at least one condition clause",
            ));
        }
        for (i, clause) in raw.clauses.iter().enumerate() {
            if clause.conditions.is_empty() {
                return Err(WorkflowError::conversion(
                    &node.id,
                    format!("clause {i} has no conditions"),
                ));
            }
            for cond in &clause.conditions {
                if cond.op.is_unary() && cond.right.is_some() {
                    return Err(WorkflowError::conversion(
                        &node.id,
                        format!("clause {i}: {:?} takes no right operand", cond.op),
                    ));
                }
                if !cond.op.is_unary() && cond.right.is_none() {
                    return Err(WorkflowError::conversion(
                        &node.id,
                        format!("clause {i}: {:?} needs a right operand", cond.op),
                    ));
                }
            }
        }
        base_schema(
            node,
            NodeType::Selector,
            NodeConfigs::Selector { clauses: raw.clauses },
        )
    }
}

struct IntentDetectorAdaptor;

impl NodeAdaptor for IntentDetectorAdaptor {
    fn node_type(&self) -> NodeType {
        NodeType::IntentDetector
    }

    fn adapt(&self, node: &CanvasNode) -> Result<NodeSchema, WorkflowError> {
        let cfg: IntentDetectorConfig = parse_configs(node)?;
        if cfg.intents.is_empty() {
            return Err(WorkflowError::conversion(
                &node.id,
                "intent detector needs at least one intent",
            ));
        }
        base_schema(
            node,
            NodeType::IntentDetector,
            NodeConfigs::IntentDetector(cfg),
        )
    }
}

struct QuestionAnswerAdaptor;

impl NodeAdaptor for QuestionAnswerAdaptor {
    fn node_type(&self) -> NodeType {
        NodeType::QuestionAnswer
    }

    fn adapt(&self, node: &CanvasNode) -> Result<NodeSchema, WorkflowError> {
        let cfg: QuestionAnswerConfig = parse_configs(node)?;
        if cfg.question.trim().is_empty() {
            return Err(WorkflowError::conversion(&node.id, "question must not be empty"));
        }
        if cfg.answer_type == AnswerType::Option && cfg.options.is_empty() {
            return Err(WorkflowError::conversion(
                &node.id,
                "option answers need at least one option",
            ));
        }
        base_schema(
            node,
            NodeType::QuestionAnswer,
            NodeConfigs::QuestionAnswer(cfg),
        )
    }
}

/// Break and Continue carry no IO and no configuration; their meaning is the
/// control connection to the parent loop that the compiler emits.
struct LoopControlAdaptor(NodeType);

impl NodeAdaptor for LoopControlAdaptor {
    fn node_type(&self) -> NodeType {
        self.0
    }

    fn adapt(&self, node: &CanvasNode) -> Result<NodeSchema, WorkflowError> {
        let configs = match self.0 {
            NodeType::Break => NodeConfigs::Break,
            _ => NodeConfigs::Continue,
        };
        base_schema(node, self.0, configs)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::canvas::NodeData;

    fn selector_node(configs: serde_json::Value) -> CanvasNode {
        CanvasNode {
            id: "sel".to_string(),
            node_type: "selector".to_string(),
            data: NodeData {
                configs,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn selector_parses_clauses() {
        let node = selector_node(json!({
            "clauses": [{
                "logic": "and",
                "conditions": [{
                    "left": { "kind": "reference", "node_key": "100001", "path": ["input"] },
                    "op": "eq",
                    "right": { "kind": "literal", "value": "yes" },
                }],
            }],
        }));
        let schema = SelectorAdaptor.adapt(&node).unwrap();
        assert!(matches!(schema.configs, NodeConfigs::Selector { .. }));
    }

    #[test]
    fn unary_op_rejects_right_operand() {
        let node = selector_node(json!({
            "clauses": [{
                "logic": "and",
                "conditions": [{
                    "left": { "kind": "reference", "node_key": "100001", "path": ["input"] },
                    "op": "is_empty",
                    "right": { "kind": "literal", "value": 1 },
                }],
            }],
        }));
        assert!(SelectorAdaptor.adapt(&node).is_err());
    }

    #[test]
    fn binary_op_requires_right_operand() {
        let node = selector_node(json!({
            "clauses": [{
                "logic": "or",
                "conditions": [{
                    "left": { "kind": "reference", "node_key": "100001", "path": ["input"] },
                    "op": "gt",
                }],
            }],
        }));
        assert!(SelectorAdaptor.adapt(&node).is_err());
    }

    #[test]
    fn question_options_are_validated() {
        let node = CanvasNode {
            id: "qa".to_string(),
            node_type: "question_answer".to_string(),
            data: NodeData {
                configs: json!({
                    "question": "Which tier?",
                    "answer_type": "option",
                    "options": [],
                }),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(QuestionAnswerAdaptor.adapt(&node).is_err());
    }
}
