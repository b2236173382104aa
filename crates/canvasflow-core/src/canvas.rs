//! # Canvas Model
//!
//! The canvas is the author-facing JSON graph produced by the visual editor:
//! nodes with typed input/output variables, edges between node ports, and
//! nested `blocks`/`edges` for composite nodes. The engine treats the canvas
//! as data to compile, never as an execution structure, so everything here
//! is plain serde types plus the built-in templates used when a workflow is
//! created or switched to ChatFlow mode.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::schema::ProcessType;
use crate::types::{DataType, Variable};

/// Canvas port ids with engine-level meaning.
pub mod port {
    /// Inbound port on a composite that marks the end of its body.
    pub const LOOP_INLINE_INPUT: &str = "loop-function-inline-input";
    pub const BATCH_INLINE_INPUT: &str = "batch-function-inline-input";
    /// Outbound port on a composite that starts its body.
    pub const LOOP_INLINE_OUTPUT: &str = "loop-function-inline-output";
    pub const BATCH_INLINE_OUTPUT: &str = "batch-function-inline-output";
    /// Designated exception edge of a node with an `ExceptionBranch` policy.
    pub const EXCEPTION: &str = "exception";
}

/// Node key of the entry node in generated canvases.
pub const ENTRY_KEY: &str = "100001";
/// Node key of the exit node in generated canvases.
pub const EXIT_KEY: &str = "900001";

/// Well-known entry fields appended in ChatFlow mode.
pub const USER_INPUT: &str = "USER_INPUT";
pub const CONVERSATION_NAME: &str = "CONVERSATION_NAME";

/// The authored workflow graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Canvas {
    #[serde(default)]
    pub nodes: Vec<CanvasNode>,
    #[serde(default)]
    pub edges: Vec<CanvasEdge>,
}

/// One node on the canvas. Composite nodes carry their children in `blocks`
/// and the body wiring in `edges`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CanvasNode {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<CanvasNodeMeta>,
    #[serde(default)]
    pub data: NodeData,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocks: Vec<CanvasNode>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub edges: Vec<CanvasEdge>,
}

/// Cosmetic node metadata. Never part of the compiled schema, and never part
/// of schema equality.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CanvasNodeMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// The semantic payload of a node: variable declarations, the type-specific
/// raw configuration an adaptor interprets, and per-node policies.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeData {
    /// Semantic node name, addressable from prompts and references. Unlike
    /// `meta.title` this is a logical field and participates in schema
    /// equality. Defaults to the node type's display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub inputs: Vec<Variable>,
    #[serde(default)]
    pub outputs: Vec<Variable>,
    /// Type-specific configuration, parsed by the node adaptor.
    #[serde(default)]
    pub configs: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<ExceptionSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_batch_info: Option<NodeBatchInfo>,
}

/// Batch-mode authoring flag on an ordinary node. The compiler expands an
/// enabled node into a Batch parent plus an `_inner` child.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeBatchInfo {
    #[serde(default)]
    pub enabled: bool,
    pub batch_size: u32,
    pub concurrent_size: u32,
    #[serde(default)]
    pub input_lists: Vec<Variable>,
}

/// Raw exception configuration as authored on the canvas.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExceptionSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retry: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_type: Option<ProcessType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_on_err: Option<String>,
    /// Editor toggle; together with `data_on_err` it implies
    /// `ReturnDefaultData` when `process_type` is unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub switch: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ext: Option<ExceptionExt>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExceptionExt {
    /// Fallback model parameters, used only on LLM retry attempts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_llm_param: Option<Value>,
}

/// One directed edge between node ports.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CanvasEdge {
    pub source_node_id: String,
    pub target_node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_port_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_port_id: Option<String>,
}

impl CanvasEdge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source_node_id: source.into(),
            target_node_id: target.into(),
            source_port_id: None,
            target_port_id: None,
        }
    }

    pub fn with_source_port(mut self, port: impl Into<String>) -> Self {
        self.source_port_id = Some(port.into());
        self
    }

    pub fn with_target_port(mut self, port: impl Into<String>) -> Self {
        self.target_port_id = Some(port.into());
        self
    }
}

impl Canvas {
    pub fn from_json(raw: &str) -> Result<Self, crate::error::WorkflowError> {
        serde_json::from_str(raw).map_err(Into::into)
    }

    pub fn to_json(&self) -> Result<String, crate::error::WorkflowError> {
        serde_json::to_string(self).map_err(Into::into)
    }

    pub fn node(&self, id: &str) -> Option<&CanvasNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn node_mut(&mut self, id: &str) -> Option<&mut CanvasNode> {
        self.nodes.iter_mut().find(|n| n.id == id)
    }

    pub fn entry_node(&self) -> Option<&CanvasNode> {
        self.nodes.iter().find(|n| n.node_type == "entry")
    }

    pub fn exit_node(&self) -> Option<&CanvasNode> {
        self.nodes.iter().find(|n| n.node_type == "exit")
    }

    /// Depth-first walk over every node, including composite children.
    pub fn walk_nodes<'a>(&'a self, visit: &mut dyn FnMut(&'a CanvasNode)) {
        fn walk<'a>(nodes: &'a [CanvasNode], visit: &mut dyn FnMut(&'a CanvasNode)) {
            for node in nodes {
                visit(node);
                walk(&node.blocks, visit);
            }
        }
        walk(&self.nodes, visit);
    }

    /// All nodes, composite children included, as a flat list.
    pub fn all_nodes(&self) -> Vec<&CanvasNode> {
        let mut out = Vec::new();
        self.walk_nodes(&mut |n| out.push(n));
        out
    }
}

impl CanvasNode {
    pub fn new(id: impl Into<String>, node_type: &str) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.to_string(),
            ..Default::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Built-in canvases
// ---------------------------------------------------------------------------

/// The canvas a freshly created Workflow starts from: an Entry with a single
/// string output wired straight into the Exit.
pub fn initial_canvas() -> Canvas {
    let entry = CanvasNode {
        id: ENTRY_KEY.to_string(),
        node_type: "entry".to_string(),
        data: NodeData {
            outputs: vec![Variable::new("input", DataType::String)],
            ..Default::default()
        },
        ..Default::default()
    };
    let exit = CanvasNode {
        id: EXIT_KEY.to_string(),
        node_type: "exit".to_string(),
        data: NodeData {
            inputs: vec![
                Variable::new("output", DataType::String).with_reference(ENTRY_KEY, &["input"]),
            ],
            configs: json!({ "terminate_plan": "return_variables" }),
            ..Default::default()
        },
        ..Default::default()
    };
    Canvas {
        nodes: vec![entry, exit],
        edges: vec![CanvasEdge::new(ENTRY_KEY, EXIT_KEY)],
    }
}

/// The canvas a freshly created ChatFlow starts from. The Entry carries the
/// two well-known chat fields and the Exit answers with streaming output.
pub fn initial_chat_canvas() -> Canvas {
    let mut canvas = initial_canvas();
    ensure_chat_entry(&mut canvas);
    canvas
}

/// Make a canvas ChatFlow-capable in place. Appends `USER_INPUT` (required)
/// and `CONVERSATION_NAME` (optional) to the Entry outputs when absent and
/// switches the Exit to streaming answer-content termination. Returns whether
/// anything changed, so callers know to re-save the draft.
pub fn ensure_chat_entry(canvas: &mut Canvas) -> bool {
    let mut changed = false;

    if let Some(entry) = canvas.nodes.iter_mut().find(|n| n.node_type == "entry") {
        if !entry.data.outputs.iter().any(|v| v.name == USER_INPUT) {
            entry
                .data
                .outputs
                .push(Variable::new(USER_INPUT, DataType::String).required());
            changed = true;
        }
        if !entry.data.outputs.iter().any(|v| v.name == CONVERSATION_NAME) {
            entry
                .data
                .outputs
                .push(Variable::new(CONVERSATION_NAME, DataType::String));
            changed = true;
        }
    }

    if let Some(exit) = canvas.nodes.iter_mut().find(|n| n.node_type == "exit") {
        let wanted = json!({
            "terminate_plan": "use_answer_content",
            "streaming_output": true,
            "content": "{{output}}",
        });
        if exit.data.configs != wanted {
            exit.data.configs = wanted;
            changed = true;
        }
    }

    changed
}
