//! # Compiled Workflow Schema
//!
//! [`WorkflowSchema`] is the execution-ready form of a canvas: typed nodes,
//! port-normalized connections, the composite hierarchy, branch metadata and
//! the derived workflow-level flags (`require_checkpoint`,
//! `require_streaming`, `history_rounds`). It is always derived from a
//! canvas by the compiler, never persisted, and cached per
//! `(workflow_id, commit_id)` at runtime.
//!
//! Node keys stay opaque strings so schema identity survives canvas edits;
//! indices into `nodes` are an internal lookup detail rebuilt by
//! [`WorkflowSchema::init`].

pub mod configs;
mod equality;

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::node_type::NodeType;
use crate::types::{DataType, VariableSource};

pub use configs::NodeConfigs;

/// Sentinel connection target: the terminal of the current (possibly
/// composite) scope.
pub const END: &str = "END";

/// What happens when a node fails after exhausting its retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessType {
    /// Propagate the error and abort the workflow.
    Throw,
    /// Substitute the authored `data_on_err` JSON as the node output.
    ReturnDefaultData,
    /// Route control flow along the node's designated exception edge.
    ExceptionBranch,
}

/// Compiled exception policy of one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionConfig {
    /// Upper bound for a single attempt plus all retries combined.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub max_retry: u32,
    pub process_type: ProcessType,
    /// Raw JSON text; validated non-empty and well-formed at publish time
    /// for `ReturnDefaultData`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_on_err: Option<String>,
    /// Fallback model parameters, applied only on LLM retry attempts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_llm_param: Option<serde_json::Value>,
}

/// Streaming capabilities of one node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default)]
    pub can_generate_stream: bool,
    #[serde(default)]
    pub requires_streaming_input: bool,
}

/// Identity of a referenced sub-workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubWorkflowBasic {
    pub workflow_id: i64,
    /// `None` means the draft.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// One typed field slot of a node: its path within the node's IO object and
/// where the value originates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldInfo {
    pub path: Vec<String>,
    /// `None` on outputs the node produces itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<VariableSource>,
}

impl FieldInfo {
    pub fn produced(path: Vec<String>) -> Self {
        Self { path, source: None }
    }

    pub fn sourced(path: Vec<String>, source: VariableSource) -> Self {
        Self {
            path,
            source: Some(source),
        }
    }

    pub fn referenced_node(&self) -> Option<&str> {
        self.source.as_ref().and_then(|s| s.referenced_node())
    }
}

/// A directed, port-qualified edge of the compiled graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub from_node: String,
    pub to_node: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_port: Option<String>,
}

impl Connection {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from_node: from.into(),
            to_node: to.into(),
            from_port: None,
        }
    }

    pub fn with_port(mut self, port: impl Into<String>) -> Self {
        self.from_port = Some(port.into());
        self
    }

    /// Stable identity used by schema equality and the scheduler.
    pub fn id(&self) -> String {
        format!(
            "{}:{}>{}",
            self.from_node,
            self.from_port.as_deref().unwrap_or(""),
            self.to_node
        )
    }
}

/// Normalized outgoing branch ports of a selector-like node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchSchema {
    pub ports: BTreeSet<String>,
}

impl BranchSchema {
    pub fn from_ports(ports: impl IntoIterator<Item = String>) -> Self {
        Self {
            ports: ports.into_iter().collect(),
        }
    }

    /// Ports must be `branch_0..branch_n` (contiguous from zero) plus an
    /// optional `default`.
    pub fn is_normalized(&self) -> bool {
        let mut indices = Vec::new();
        for port in &self.ports {
            if port == "default" {
                continue;
            }
            match port.strip_prefix("branch_").and_then(|s| s.parse::<usize>().ok()) {
                Some(i) => indices.push(i),
                None => return false,
            }
        }
        indices.sort_unstable();
        indices.iter().enumerate().all(|(want, have)| want == *have)
    }
}

/// A compiled node: typed IO, configs, exception and stream policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSchema {
    pub key: String,
    pub node_type: NodeType,
    pub name: String,
    #[serde(default)]
    pub input_sources: Vec<FieldInfo>,
    #[serde(default)]
    pub output_sources: Vec<FieldInfo>,
    #[serde(default)]
    pub input_types: BTreeMap<String, DataType>,
    #[serde(default)]
    pub output_types: BTreeMap<String, DataType>,
    pub configs: NodeConfigs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception_configs: Option<ExceptionConfig>,
    #[serde(default)]
    pub stream_configs: StreamConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_workflow_basic: Option<SubWorkflowBasic>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_workflow_schema: Option<Box<WorkflowSchema>>,
}

impl NodeSchema {
    /// Output type at a referenced path, e.g. `["results", "*", "answer"]`.
    pub fn output_type_at(&self, path: &[String]) -> Option<&DataType> {
        let (head, rest) = path.split_first()?;
        self.output_types.get(head)?.at_path(rest)
    }

    /// Keys of nodes this node reads fields from.
    pub fn referenced_nodes(&self) -> BTreeSet<&str> {
        self.input_sources
            .iter()
            .filter_map(FieldInfo::referenced_node)
            .collect()
    }
}

/// The compiled, execution-ready graph.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowSchema {
    pub nodes: Vec<NodeSchema>,
    pub connections: Vec<Connection>,
    /// `child key → parent key` for composite children.
    #[serde(default)]
    pub hierarchy: BTreeMap<String, String>,
    #[serde(default)]
    pub branches: BTreeMap<String, BranchSchema>,
    /// Keys of inner nodes produced by batch-mode expansion.
    #[serde(default)]
    pub generated_nodes: Vec<String>,
    #[serde(default)]
    pub require_checkpoint: bool,
    #[serde(default)]
    pub require_streaming: bool,
    #[serde(default)]
    pub history_rounds: u32,
    #[serde(skip)]
    pub(crate) node_map: HashMap<String, usize>,
}

impl WorkflowSchema {
    /// Rebuild the node index and the derived workflow-level properties.
    /// Must be called after construction and after any node mutation.
    pub fn init(&mut self) {
        self.node_map = self
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.key.clone(), i))
            .collect();
        self.require_checkpoint = self.compute_require_checkpoint();
        self.require_streaming = self.compute_require_streaming();
        self.history_rounds = self.compute_history_rounds();
    }

    pub fn node(&self, key: &str) -> Option<&NodeSchema> {
        self.node_map.get(key).map(|&i| &self.nodes[i])
    }

    pub fn node_mut(&mut self, key: &str) -> Option<&mut NodeSchema> {
        let idx = *self.node_map.get(key)?;
        self.nodes.get_mut(idx)
    }

    pub fn composites(&self) -> impl Iterator<Item = &NodeSchema> {
        self.nodes.iter().filter(|n| n.node_type.is_composite())
    }

    /// Direct children of a composite node.
    pub fn children_of(&self, parent: &str) -> Vec<&NodeSchema> {
        self.hierarchy
            .iter()
            .filter(|(_, p)| p.as_str() == parent)
            .filter_map(|(child, _)| self.node(child))
            .collect()
    }

    /// Keys of top-level nodes (no composite parent).
    pub fn top_level_keys(&self) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|n| !self.hierarchy.contains_key(&n.key))
            .map(|n| n.key.as_str())
            .collect()
    }

    pub fn connection_id_set(&self) -> BTreeSet<String> {
        self.connections.iter().map(Connection::id).collect()
    }

    fn compute_require_checkpoint(&self) -> bool {
        self.nodes.iter().any(|n| {
            n.node_type.requires_checkpoint()
                || n.configs.history_rounds().is_some()
                || n.sub_workflow_schema
                    .as_ref()
                    .is_some_and(|s| s.require_checkpoint)
        })
    }

    fn compute_history_rounds(&self) -> u32 {
        self.nodes
            .iter()
            .map(|n| {
                let own = n.configs.history_rounds().unwrap_or(0);
                let sub = n
                    .sub_workflow_schema
                    .as_ref()
                    .map(|s| s.history_rounds)
                    .unwrap_or(0);
                own.max(sub)
            })
            .max()
            .unwrap_or(0)
    }

    /// True iff some stream producer reaches a streaming-input consumer by
    /// following `input_sources` references. BFS over the producer set;
    /// intermediate nodes (aggregators, emitters) pass streams through.
    fn compute_require_streaming(&self) -> bool {
        let mut downstream: HashMap<&str, Vec<&NodeSchema>> = HashMap::new();
        for node in &self.nodes {
            for referenced in node.referenced_nodes() {
                downstream.entry(referenced).or_default().push(node);
            }
        }

        let mut queue: VecDeque<&str> = self
            .nodes
            .iter()
            .filter(|n| n.stream_configs.can_generate_stream)
            .map(|n| n.key.as_str())
            .collect();
        let mut visited: BTreeSet<&str> = queue.iter().copied().collect();

        while let Some(key) = queue.pop_front() {
            for consumer in downstream.get(key).into_iter().flatten() {
                if consumer.stream_configs.requires_streaming_input {
                    return true;
                }
                if visited.insert(consumer.key.as_str()) {
                    queue.push_back(consumer.key.as_str());
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_node(key: &str, node_type: NodeType, configs: NodeConfigs) -> NodeSchema {
        NodeSchema {
            key: key.to_string(),
            node_type,
            name: key.to_string(),
            input_sources: Vec::new(),
            output_sources: Vec::new(),
            input_types: BTreeMap::new(),
            output_types: BTreeMap::new(),
            configs,
            exception_configs: None,
            stream_configs: StreamConfig::default(),
            sub_workflow_basic: None,
            sub_workflow_schema: None,
        }
    }

    #[test]
    fn connection_ids_include_port() {
        let plain = Connection::new("a", "b");
        let ported = Connection::new("a", "b").with_port("branch_0");
        assert_ne!(plain.id(), ported.id());
        assert_eq!(plain.id(), "a:>b");
    }

    #[test]
    fn branch_schema_normalization_check() {
        let good = BranchSchema::from_ports(
            ["branch_0", "branch_1", "default"].map(String::from),
        );
        assert!(good.is_normalized());

        let gap = BranchSchema::from_ports(["branch_0", "branch_2"].map(String::from));
        assert!(!gap.is_normalized());

        let raw = BranchSchema::from_ports(["true"].map(String::from));
        assert!(!raw.is_normalized());
    }

    #[test]
    fn streaming_flag_needs_a_path() {
        let mut producer = bare_node(
            "llm",
            NodeType::Llm,
            NodeConfigs::CodeRunner {
                language: configs::CodeLanguage::Python,
                code: String::new(),
            },
        );
        producer.stream_configs.can_generate_stream = true;
        producer.output_types.insert("output".into(), DataType::String);

        let mut consumer = bare_node(
            "exit",
            NodeType::Exit,
            NodeConfigs::Exit {
                terminate_plan: configs::TerminatePlan::ReturnVariables,
            },
        );
        consumer.stream_configs.requires_streaming_input = true;

        // No reference between them yet: no streaming requirement.
        let mut schema = WorkflowSchema {
            nodes: vec![producer, consumer],
            ..Default::default()
        };
        schema.init();
        assert!(!schema.require_streaming);

        schema.node_mut("exit").unwrap().input_sources.push(FieldInfo::sourced(
            vec!["output".into()],
            VariableSource::reference("llm", &["output"]),
        ));
        schema.init();
        assert!(schema.require_streaming);
    }

    #[test]
    fn checkpoint_propagates_from_sub_workflow() {
        let mut inner = WorkflowSchema::default();
        inner.nodes.push(bare_node(
            "recv",
            NodeType::InputReceiver,
            NodeConfigs::InputReceiver,
        ));
        inner.init();
        assert!(inner.require_checkpoint);

        let mut outer = WorkflowSchema::default();
        let mut sub = bare_node(
            "sub",
            NodeType::SubWorkflow,
            NodeConfigs::SubWorkflow(configs::SubWorkflowConfig {
                workflow_id: 1,
                version: None,
            }),
        );
        sub.sub_workflow_schema = Some(Box::new(inner));
        outer.nodes.push(sub);
        outer.init();
        assert!(outer.require_checkpoint);
    }

    #[test]
    fn history_rounds_takes_the_max() {
        let mut schema = WorkflowSchema::default();
        schema.nodes.push(bare_node(
            "hist",
            NodeType::ConversationHistory,
            NodeConfigs::ConversationHistory { rounds: 6 },
        ));
        let mut sub_inner = WorkflowSchema::default();
        sub_inner.nodes.push(bare_node(
            "hist2",
            NodeType::ConversationHistory,
            NodeConfigs::ConversationHistory { rounds: 11 },
        ));
        sub_inner.init();
        let mut sub = bare_node(
            "sub",
            NodeType::SubWorkflow,
            NodeConfigs::SubWorkflow(configs::SubWorkflowConfig {
                workflow_id: 2,
                version: None,
            }),
        );
        sub.sub_workflow_schema = Some(Box::new(sub_inner));
        schema.nodes.push(sub);
        schema.init();
        assert_eq!(schema.history_rounds, 11);
    }
}
