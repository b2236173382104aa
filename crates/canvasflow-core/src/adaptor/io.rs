//! Adaptors for the IO and variable-plumbing nodes: Entry, Exit,
//! InputReceiver, OutputEmitter, TextProcessor, JSON conversion and the
//! variable assigner/aggregator family.

use std::sync::Arc;

use serde::Deserialize;

use crate::canvas::CanvasNode;
use crate::error::WorkflowError;
use crate::node_type::NodeType;
use crate::schema::configs::{TerminatePlan, TextProcessorConfig};
use crate::schema::{NodeConfigs, NodeSchema};

use super::{base_schema, parse_configs, NodeAdaptor};

pub(super) fn adaptors() -> Vec<Arc<dyn NodeAdaptor>> {
    vec![
        Arc::new(EntryAdaptor),
        Arc::new(ExitAdaptor),
        Arc::new(InputReceiverAdaptor),
        Arc::new(OutputEmitterAdaptor),
        Arc::new(TextProcessorAdaptor),
        Arc::new(JsonAdaptor(NodeType::JsonSerialization)),
        Arc::new(JsonAdaptor(NodeType::JsonDeserialization)),
        Arc::new(AssignerAdaptor(NodeType::VariableAssigner)),
        Arc::new(AssignerAdaptor(NodeType::VariableAssignerWithinLoop)),
        Arc::new(AggregatorAdaptor),
    ]
}

struct EntryAdaptor;

impl NodeAdaptor for EntryAdaptor {
    fn node_type(&self) -> NodeType {
        NodeType::Entry
    }

    fn adapt(&self, node: &CanvasNode) -> Result<NodeSchema, WorkflowError> {
        if node.data.outputs.is_empty() {
            return Err(WorkflowError::conversion(
                &node.id,
                "entry node must declare at least one output parameter",
            ));
        }
        base_schema(node, NodeType::Entry, NodeConfigs::Entry)
    }
}

struct ExitAdaptor;

impl NodeAdaptor for ExitAdaptor {
    fn node_type(&self) -> NodeType {
        NodeType::Exit
    }

    fn adapt(&self, node: &CanvasNode) -> Result<NodeSchema, WorkflowError> {
        // The canvas stores the exit plan flat; fold it into the enum here.
        let raw = &node.data.configs;
        let plan = match raw.get("terminate_plan").and_then(|v| v.as_str()) {
            Some("use_answer_content") => TerminatePlan::UseAnswerContent {
                streaming_output: raw
                    .get("streaming_output")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false),
                content: raw
                    .get("content")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
            },
            Some("return_variables") | None => TerminatePlan::ReturnVariables,
            Some(other) => {
                return Err(WorkflowError::conversion(
                    &node.id,
                    format!("unknown terminate plan {other:?}"),
                ))
            }
        };

        let streaming = matches!(
            plan,
            TerminatePlan::UseAnswerContent {
                streaming_output: true,
                ..
            }
        );
        let mut schema = base_schema(node, NodeType::Exit, NodeConfigs::Exit { terminate_plan: plan })?;
        schema.stream_configs.requires_streaming_input = streaming;
        Ok(schema)
    }
}

struct InputReceiverAdaptor;

impl NodeAdaptor for InputReceiverAdaptor {
    fn node_type(&self) -> NodeType {
        NodeType::InputReceiver
    }

    fn adapt(&self, node: &CanvasNode) -> Result<NodeSchema, WorkflowError> {
        if node.data.outputs.is_empty() {
            return Err(WorkflowError::conversion(
                &node.id,
                "input receiver must declare the fields it collects",
            ));
        }
        base_schema(node, NodeType::InputReceiver, NodeConfigs::InputReceiver)
    }
}

#[derive(Debug, Deserialize)]
struct RawEmitterConfig {
    #[serde(default)]
    content: String,
    #[serde(default)]
    streaming_output: bool,
}

struct OutputEmitterAdaptor;

impl NodeAdaptor for OutputEmitterAdaptor {
    fn node_type(&self) -> NodeType {
        NodeType::OutputEmitter
    }

    fn adapt(&self, node: &CanvasNode) -> Result<NodeSchema, WorkflowError> {
        let raw: RawEmitterConfig = parse_configs(node)?;
        let mut schema = base_schema(
            node,
            NodeType::OutputEmitter,
            NodeConfigs::OutputEmitter {
                content: raw.content,
                streaming_output: raw.streaming_output,
            },
        )?;
        // A streaming emitter relays chunks: it consumes a stream and is
        // itself a stream source for anything downstream.
        schema.stream_configs.requires_streaming_input = raw.streaming_output;
        schema.stream_configs.can_generate_stream = raw.streaming_output;
        Ok(schema)
    }
}

struct TextProcessorAdaptor;

impl NodeAdaptor for TextProcessorAdaptor {
    fn node_type(&self) -> NodeType {
        NodeType::TextProcessor
    }

    fn adapt(&self, node: &CanvasNode) -> Result<NodeSchema, WorkflowError> {
        let cfg: TextProcessorConfig = parse_configs(node)?;
        if let TextProcessorConfig::Split { separators } = &cfg {
            if separators.is_empty() {
                return Err(WorkflowError::conversion(
                    &node.id,
                    "split requires at least one separator",
                ));
            }
        }
        base_schema(node, NodeType::TextProcessor, NodeConfigs::TextProcessor(cfg))
    }
}

/// JSON serialization and deserialization share a shape: one input, one
/// output, no configuration.
struct JsonAdaptor(NodeType);

impl NodeAdaptor for JsonAdaptor {
    fn node_type(&self) -> NodeType {
        self.0
    }

    fn adapt(&self, node: &CanvasNode) -> Result<NodeSchema, WorkflowError> {
        if node.data.inputs.len() != 1 {
            return Err(WorkflowError::conversion(
                &node.id,
                "JSON conversion takes exactly one input",
            ));
        }
        let configs = match self.0 {
            NodeType::JsonSerialization => NodeConfigs::JsonSerialization,
            _ => NodeConfigs::JsonDeserialization,
        };
        base_schema(node, self.0, configs)
    }
}

/// Both assigner flavors write their inputs into named variables; the
/// within-loop flavor is scoped to the enclosing loop iteration set and is
/// validated against its parent by the compiler.
struct AssignerAdaptor(NodeType);

impl NodeAdaptor for AssignerAdaptor {
    fn node_type(&self) -> NodeType {
        self.0
    }

    fn adapt(&self, node: &CanvasNode) -> Result<NodeSchema, WorkflowError> {
        if node.data.inputs.is_empty() {
            return Err(WorkflowError::conversion(
                &node.id,
                "assigner needs at least one input to assign",
            ));
        }
        let configs = match self.0 {
            NodeType::VariableAssigner => NodeConfigs::VariableAssigner,
            _ => NodeConfigs::VariableAssignerWithinLoop,
        };
        base_schema(node, self.0, configs)
    }
}

#[derive(Debug, Deserialize)]
struct RawAggregatorConfig {
    #[serde(default)]
    groups: Vec<String>,
}

struct AggregatorAdaptor;

impl NodeAdaptor for AggregatorAdaptor {
    fn node_type(&self) -> NodeType {
        NodeType::VariableAggregator
    }

    fn adapt(&self, node: &CanvasNode) -> Result<NodeSchema, WorkflowError> {
        let raw: RawAggregatorConfig = parse_configs(node)?;
        base_schema(
            node,
            NodeType::VariableAggregator,
            NodeConfigs::VariableAggregator { groups: raw.groups },
        )
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::canvas::NodeData;
    use crate::types::{DataType, Variable};

    fn node(node_type: &str, data: NodeData) -> CanvasNode {
        CanvasNode {
            id: "n1".to_string(),
            node_type: node_type.to_string(),
            data,
            ..Default::default()
        }
    }

    #[test]
    fn entry_requires_outputs() {
        let err = EntryAdaptor.adapt(&node("entry", NodeData::default())).unwrap_err();
        assert!(matches!(err, WorkflowError::SchemaConversionFail { .. }));
    }

    #[test]
    fn exit_streaming_plan_sets_stream_flag() {
        let data = NodeData {
            inputs: vec![Variable::new("output", DataType::String)],
            configs: json!({
                "terminate_plan": "use_answer_content",
                "streaming_output": true,
                "content": "{{output}}",
            }),
            ..Default::default()
        };
        let schema = ExitAdaptor.adapt(&node("exit", data)).unwrap();
        assert!(schema.stream_configs.requires_streaming_input);
        assert!(matches!(
            schema.configs,
            NodeConfigs::Exit {
                terminate_plan: TerminatePlan::UseAnswerContent { .. }
            }
        ));
    }

    #[test]
    fn exit_defaults_to_return_variables() {
        let schema = ExitAdaptor.adapt(&node("exit", NodeData::default())).unwrap();
        assert!(matches!(
            schema.configs,
            NodeConfigs::Exit {
                terminate_plan: TerminatePlan::ReturnVariables
            }
        ));
        assert!(!schema.stream_configs.requires_streaming_input);
    }

    #[test]
    fn streaming_emitter_relays() {
        let data = NodeData {
            configs: json!({ "content": "{{chunk}}", "streaming_output": true }),
            ..Default::default()
        };
        let schema = OutputEmitterAdaptor.adapt(&node("output_emitter", data)).unwrap();
        assert!(schema.stream_configs.can_generate_stream);
        assert!(schema.stream_configs.requires_streaming_input);
    }

    #[test]
    fn split_needs_separators() {
        let data = NodeData {
            configs: json!({ "method": "split", "separators": [] }),
            ..Default::default()
        };
        let err = TextProcessorAdaptor.adapt(&node("text_processor", data)).unwrap_err();
        assert!(matches!(err, WorkflowError::SchemaConversionFail { .. }));
    }
}
