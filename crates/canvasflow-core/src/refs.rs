//! Cross-workflow reference edges.
//!
//! A workflow refers to another either by embedding it as a sub-workflow
//! node or by exposing it to an LLM node as a function-call tool. Reference
//! edges are re-derived from the canvas on every publish and replace the
//! previous edge set atomically; the sub-workflow projection of the graph
//! must stay acyclic.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::canvas::{Canvas, CanvasNode};
use crate::node_type::NodeType;
use crate::schema::configs::{LlmToolRef, SubWorkflowConfig};

/// Why one workflow refers to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferType {
    SubWorkflow,
    Tool,
}

/// What kind of resource is doing the referring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferringBizType {
    Workflow,
    Agent,
}

/// Directed relation `referring → referred`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReferenceEdge {
    pub referring_id: i64,
    pub referred_id: i64,
    pub refer_type: ReferType,
    pub referring_biz_type: ReferringBizType,
}

impl ReferenceEdge {
    pub fn sub_workflow(referring_id: i64, referred_id: i64) -> Self {
        Self {
            referring_id,
            referred_id,
            refer_type: ReferType::SubWorkflow,
            referring_biz_type: ReferringBizType::Workflow,
        }
    }

    pub fn tool(referring_id: i64, referred_id: i64) -> Self {
        Self {
            referring_id,
            referred_id,
            refer_type: ReferType::Tool,
            referring_biz_type: ReferringBizType::Workflow,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawToolList {
    #[serde(default)]
    tools: Vec<LlmToolRef>,
}

/// Derive the full reference-edge set of a canvas. Walks every node,
/// composite children included. Nodes whose configuration fails to parse are
/// skipped: reference extraction runs on drafts too, and a half-authored
/// node must not block a save.
pub fn canvas_to_refs(referring_id: i64, canvas: &Canvas) -> BTreeSet<ReferenceEdge> {
    let mut edges = BTreeSet::new();
    canvas.walk_nodes(&mut |node| collect_node_refs(referring_id, node, &mut edges));
    edges
}

fn collect_node_refs(referring_id: i64, node: &CanvasNode, edges: &mut BTreeSet<ReferenceEdge>) {
    match NodeType::parse(&node.node_type) {
        Some(NodeType::SubWorkflow) => {
            if let Ok(cfg) = serde_json::from_value::<SubWorkflowConfig>(node.data.configs.clone())
            {
                edges.insert(ReferenceEdge::sub_workflow(referring_id, cfg.workflow_id));
            }
        }
        Some(NodeType::Llm) => {
            if let Ok(raw) = serde_json::from_value::<RawToolList>(node.data.configs.clone()) {
                for tool in raw.tools {
                    if let LlmToolRef::Workflow { workflow_id, .. } = tool {
                        edges.insert(ReferenceEdge::tool(referring_id, workflow_id));
                    }
                }
            }
        }
        _ => {}
    }
}

/// All workflow ids a canvas references as sub-workflows, with the pinned
/// version when one is set. Used to build the transitive closure for copy
/// and validation.
pub fn sub_workflow_targets(canvas: &Canvas) -> Vec<(i64, Option<String>)> {
    let mut targets = Vec::new();
    canvas.walk_nodes(&mut |node| {
        if NodeType::parse(&node.node_type) == Some(NodeType::SubWorkflow) {
            if let Ok(cfg) = serde_json::from_value::<SubWorkflowConfig>(node.data.configs.clone())
            {
                targets.push((cfg.workflow_id, cfg.version));
            }
        }
    });
    targets
}

/// Iterative DFS with a color map over the sub-workflow projection.
/// Returns the id that closes a cycle, if any.
pub fn find_reference_cycle(start: i64, edges: &HashMap<i64, Vec<i64>>) -> Option<i64> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        Gray,
        Black,
    }

    let mut colors: HashMap<i64, Color> = HashMap::new();
    // Stack entries: (node, child cursor).
    let mut stack: Vec<(i64, usize)> = vec![(start, 0)];
    colors.insert(start, Color::Gray);

    while let Some((node, cursor)) = stack.pop() {
        let children = edges.get(&node).map(Vec::as_slice).unwrap_or(&[]);
        if cursor < children.len() {
            stack.push((node, cursor + 1));
            let child = children[cursor];
            match colors.get(&child) {
                Some(Color::Gray) => return Some(child),
                Some(Color::Black) => {}
                None => {
                    colors.insert(child, Color::Gray);
                    stack.push((child, 0));
                }
            }
        } else {
            colors.insert(node, Color::Black);
        }
    }
    None
}
