//! # Canvas Compiler
//!
//! Turns an authored [`Canvas`] into an executable [`WorkflowSchema`]. The
//! passes run in a fixed order:
//!
//! 1. isolation pruning,
//! 2. batch-mode expansion,
//! 3. structural checks on composite bodies,
//! 4. node adaptation through the [`AdaptorRegistry`] (sub-workflows load
//!    and compile recursively),
//! 5. hierarchy recording,
//! 6. connection assembly (Break/Continue → parent, inline ports → `END`),
//! 7. port normalization,
//! 8. branch construction and schema init.
//!
//! The compiler is panic-proof: a panic anywhere in the passes is caught
//! and returned as [`WorkflowError::OperationFail`].

mod batch;
mod prune;

pub use batch::expand_batch_nodes;
pub use prune::prune_isolated;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::{BoxFuture, FutureExt};
use tracing::debug;

use crate::adaptor::AdaptorRegistry;
use crate::canvas::{port, Canvas, CanvasEdge, CanvasNode};
use crate::error::WorkflowError;
use crate::node_type::NodeType;
use crate::schema::{BranchSchema, Connection, NodeSchema, WorkflowSchema, END};

/// Loads the canvas of a referenced sub-workflow: the draft when no version
/// is pinned, the published version otherwise. Implementations must return
/// [`WorkflowError::WorkflowNotFound`] keyed by the referenced id when the
/// target is missing.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SubWorkflowLoader: Send + Sync {
    async fn load_canvas<'a>(
        &self,
        workflow_id: i64,
        version: Option<&'a str>,
    ) -> Result<Canvas, WorkflowError>;
}

/// Loader for canvases with no sub-workflow nodes; any lookup fails.
pub struct NoSubWorkflows;

#[async_trait]
impl SubWorkflowLoader for NoSubWorkflows {
    async fn load_canvas<'a>(
        &self,
        workflow_id: i64,
        version: Option<&'a str>,
    ) -> Result<Canvas, WorkflowError> {
        Err(WorkflowError::not_found(workflow_id, version))
    }
}

pub struct CanvasCompiler {
    registry: Arc<AdaptorRegistry>,
    loader: Arc<dyn SubWorkflowLoader>,
}

impl CanvasCompiler {
    pub fn new(loader: Arc<dyn SubWorkflowLoader>) -> Self {
        Self::with_registry(AdaptorRegistry::global(), loader)
    }

    pub fn with_registry(
        registry: Arc<AdaptorRegistry>,
        loader: Arc<dyn SubWorkflowLoader>,
    ) -> Self {
        Self { registry, loader }
    }

    /// Compile a canvas with no sub-workflow references.
    pub fn standalone() -> Self {
        Self::new(Arc::new(NoSubWorkflows))
    }

    pub async fn compile(&self, canvas: &Canvas) -> Result<WorkflowSchema, WorkflowError> {
        let fut = self.compile_scoped(canvas, Vec::new());
        match std::panic::AssertUnwindSafe(fut).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(WorkflowError::operation(format!(
                    "canvas compilation panicked: {message}"
                )))
            }
        }
    }

    /// The recursive compile. `stack` carries the `(id, version)` keys of
    /// every sub-workflow currently being compiled, so a reference cycle in
    /// drafts fails fast instead of recursing forever.
    fn compile_scoped<'a>(
        &'a self,
        canvas: &'a Canvas,
        stack: Vec<(i64, Option<String>)>,
    ) -> BoxFuture<'a, Result<WorkflowSchema, WorkflowError>> {
        async move {
            let mut canvas = prune_isolated(canvas);
            let generated_nodes = expand_batch_nodes(&mut canvas)?;
            check_structure(&canvas)?;

            let mut nodes: Vec<NodeSchema> = Vec::new();
            let mut hierarchy: BTreeMap<String, String> = BTreeMap::new();
            let mut connections: Vec<Connection> = Vec::new();

            for node in &canvas.nodes {
                if let Some(schema) = self.adapt_node(node, &stack).await? {
                    nodes.push(schema);
                }
                for child in &node.blocks {
                    if let Some(child_schema) = self.adapt_node(child, &stack).await? {
                        hierarchy.insert(child.id.clone(), node.id.clone());
                        nodes.push(child_schema);
                    }
                }
            }

            let comment_keys: Vec<&str> = canvas
                .all_nodes()
                .into_iter()
                .filter(|n| n.node_type == "comment")
                .map(|n| n.id.as_str())
                .collect();

            let node_types: BTreeMap<&str, NodeType> = nodes
                .iter()
                .map(|n| (n.key.as_str(), n.node_type))
                .collect();

            for edge in canvas
                .edges
                .iter()
                .chain(canvas.nodes.iter().flat_map(|n| n.edges.iter()))
            {
                if comment_keys.contains(&edge.source_node_id.as_str())
                    || comment_keys.contains(&edge.target_node_id.as_str())
                {
                    continue;
                }
                connections.push(assemble_connection(edge, &node_types));
            }

            // Break and Continue implicitly hand control back to their loop.
            for (child, parent) in &hierarchy {
                if node_types
                    .get(child.as_str())
                    .is_some_and(NodeType::is_loop_control)
                {
                    connections.push(Connection::new(child.clone(), parent.clone()));
                }
            }

            let branches = build_branches(&nodes, &connections);

            let mut schema = WorkflowSchema {
                nodes,
                connections,
                hierarchy,
                branches,
                generated_nodes,
                ..Default::default()
            };
            schema.init();
            debug!(
                nodes = schema.nodes.len(),
                connections = schema.connections.len(),
                require_streaming = schema.require_streaming,
                require_checkpoint = schema.require_checkpoint,
                "canvas compiled"
            );
            Ok(schema)
        }
        .boxed()
    }

    /// Adapt one canvas node; `None` for comments. Sub-workflow nodes load
    /// and embed the referenced schema.
    async fn adapt_node(
        &self,
        node: &CanvasNode,
        stack: &[(i64, Option<String>)],
    ) -> Result<Option<NodeSchema>, WorkflowError> {
        let Some(node_type) = NodeType::parse(&node.node_type) else {
            return Err(WorkflowError::conversion(
                &node.id,
                format!("unknown node type {:?}", node.node_type),
            ));
        };
        if node_type == NodeType::Comment {
            return Ok(None);
        }

        let adaptor = self.registry.adaptor(node_type).ok_or_else(|| {
            WorkflowError::conversion(
                &node.id,
                format!("no adaptor registered for {}", node_type.as_str()),
            )
        })?;
        let mut schema = adaptor.adapt(node)?;

        if let Some(basic) = schema.sub_workflow_basic.clone() {
            let key = (basic.workflow_id, basic.version.clone());
            if stack.contains(&key) {
                return Err(WorkflowError::ReferenceCycle {
                    workflow_id: basic.workflow_id,
                });
            }
            let sub_canvas = self
                .loader
                .load_canvas(basic.workflow_id, basic.version.as_deref())
                .await?;
            let mut sub_stack = stack.to_vec();
            sub_stack.push(key);
            let sub_schema = self.compile_scoped(&sub_canvas, sub_stack).await?;
            schema.sub_workflow_schema = Some(Box::new(sub_schema));
        }

        Ok(Some(schema))
    }
}

/// Composite bodies must stay flat: no composite children, and no child
/// carrying its own edge list.
fn check_structure(canvas: &Canvas) -> Result<(), WorkflowError> {
    for node in &canvas.nodes {
        for child in &node.blocks {
            let child_is_composite = NodeType::parse(&child.node_type)
                .is_some_and(|t| t.is_composite())
                || !child.blocks.is_empty();
            if child_is_composite {
                return Err(WorkflowError::invalid_parameter(format!(
                    "composite {} nests composite {}",
                    node.id, child.id
                )));
            }
            if !child.edges.is_empty() {
                return Err(WorkflowError::invalid_parameter(format!(
                    "child node {} must not carry its own edges",
                    child.id
                )));
            }
        }
    }
    Ok(())
}

/// Map a canvas edge to a connection, folding inline body-end ports into the
/// `END` sentinel and normalizing the source port.
fn assemble_connection(edge: &CanvasEdge, node_types: &BTreeMap<&str, NodeType>) -> Connection {
    let to_node = match edge.target_port_id.as_deref() {
        Some(port::LOOP_INLINE_INPUT) | Some(port::BATCH_INLINE_INPUT) => END.to_string(),
        _ => edge.target_node_id.clone(),
    };

    let from_type = node_types.get(edge.source_node_id.as_str()).copied();
    let from_port = normalize_port(edge.source_port_id.as_deref(), from_type);

    Connection {
        from_node: edge.source_node_id.clone(),
        to_node,
        from_port,
    }
}

/// Port normalization: empty ports erase, composite inline-output ports
/// nullify, selector ports map `true → branch_0`, `true_N → branch_N`,
/// `false → default`.
fn normalize_port(raw: Option<&str>, from_type: Option<NodeType>) -> Option<String> {
    let raw = match raw {
        None | Some("") => return None,
        Some(port::LOOP_INLINE_OUTPUT) | Some(port::BATCH_INLINE_OUTPUT) => return None,
        Some(p) => p,
    };

    if from_type == Some(NodeType::Selector) {
        if raw == "true" {
            return Some("branch_0".to_string());
        }
        if raw == "false" {
            return Some("default".to_string());
        }
        if let Some(n) = raw.strip_prefix("true_") {
            if n.chars().all(|c| c.is_ascii_digit()) {
                return Some(format!("branch_{n}"));
            }
        }
    }

    Some(raw.to_string())
}

/// One [`BranchSchema`] per selector-like node, built from its outgoing
/// normalized port set.
fn build_branches(
    nodes: &[NodeSchema],
    connections: &[Connection],
) -> BTreeMap<String, BranchSchema> {
    nodes
        .iter()
        .filter(|n| n.node_type.has_branches())
        .map(|n| {
            let ports = connections
                .iter()
                .filter(|c| c.from_node == n.key)
                .filter_map(|c| c.from_port.clone());
            (n.key.clone(), BranchSchema::from_ports(ports))
        })
        .collect()
}
