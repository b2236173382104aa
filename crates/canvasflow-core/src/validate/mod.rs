//! # Schema Validation
//!
//! The validator runs over a compiled [`WorkflowSchema`] — structure,
//! typing, exception policies, capability constraints — and over a tree of
//! schemas when sub-workflows are embedded. It reports, it does not fail:
//! every finding is a [`ValidateIssue`] and the caller decides what blocks
//! publish. Resource existence (plugins, knowledge, databases) is the one
//! async concern, checked through the [`ResourceResolver`] port.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::WorkflowError;
use crate::mode::WorkflowMode;
use crate::node_type::NodeType;
use crate::schema::configs::NodeConfigs;
use crate::schema::{NodeSchema, ProcessType, WorkflowSchema, END};
use crate::types::{DataType, VariableSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Error,
}

/// One validation finding, anchored to a node when one is at fault.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidateIssue {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_key: Option<String>,
    pub message: String,
    pub severity: Severity,
}

impl ValidateIssue {
    pub fn error(node_key: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            node_key: node_key.map(str::to_string),
            message: message.into(),
            severity: Severity::Error,
        }
    }

    pub fn warning(node_key: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            node_key: node_key.map(str::to_string),
            message: message.into(),
            severity: Severity::Warning,
        }
    }
}

/// Issues of one workflow in a validated tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidateTreeInfo {
    pub workflow_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub issues: Vec<ValidateIssue>,
}

/// Capability constraint families applied by `WorkflowSchemaCheck`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckType {
    /// The full structural pass.
    Structure,
    /// ChatFlows embedded in a bot agent must not touch conversations
    /// directly; the agent owns the conversation lifecycle.
    BotAgent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub check: CheckType,
    pub passed: bool,
    pub issues: Vec<ValidateIssue>,
}

/// Resolves external resource references during validation.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResourceResolver: Send + Sync {
    async fn plugin_exists(&self, plugin_id: i64) -> Result<bool, WorkflowError>;
    async fn knowledge_exists(&self, knowledge_id: i64) -> Result<bool, WorkflowError>;
    async fn database_exists(&self, database_id: i64) -> Result<bool, WorkflowError>;
}

/// Resolver that accepts every reference. Useful where the platform has no
/// resource registries wired, and in tests.
pub struct AllowAllResources;

#[async_trait]
impl ResourceResolver for AllowAllResources {
    async fn plugin_exists(&self, _plugin_id: i64) -> Result<bool, WorkflowError> {
        Ok(true)
    }
    async fn knowledge_exists(&self, _knowledge_id: i64) -> Result<bool, WorkflowError> {
        Ok(true)
    }
    async fn database_exists(&self, _database_id: i64) -> Result<bool, WorkflowError> {
        Ok(true)
    }
}

pub struct SchemaValidator<'a> {
    schema: &'a WorkflowSchema,
}

impl<'a> SchemaValidator<'a> {
    pub fn new(schema: &'a WorkflowSchema) -> Self {
        Self { schema }
    }

    /// The synchronous structural pass.
    pub fn validate(&self) -> Vec<ValidateIssue> {
        let mut issues = Vec::new();
        self.check_endpoints(&mut issues);
        self.check_reachability(&mut issues);
        self.check_branches(&mut issues);
        self.check_types(&mut issues);
        self.check_exception_configs(&mut issues);
        issues
    }

    /// Every connection endpoint (except `END`) must be a known node.
    fn check_endpoints(&self, issues: &mut Vec<ValidateIssue>) {
        for conn in &self.schema.connections {
            if self.schema.node(&conn.from_node).is_none() {
                issues.push(ValidateIssue::error(
                    None,
                    format!("connection source {} does not exist", conn.from_node),
                ));
            }
            if conn.to_node != END && self.schema.node(&conn.to_node).is_none() {
                issues.push(ValidateIssue::error(
                    None,
                    format!("connection target {} does not exist", conn.to_node),
                ));
            }
        }
    }

    /// Every non-terminal top-level node must have a path to the Exit node.
    /// Composite internals are their own scope and are skipped here.
    fn check_reachability(&self, issues: &mut Vec<ValidateIssue>) {
        let top: BTreeSet<&str> = self.schema.top_level_keys().into_iter().collect();
        let Some(exit) = self
            .schema
            .nodes
            .iter()
            .find(|n| n.node_type == NodeType::Exit)
        else {
            issues.push(ValidateIssue::error(None, "workflow has no exit node"));
            return;
        };

        // Reverse-BFS from Exit over top-level connections.
        let mut reverse: HashMap<&str, Vec<&str>> = HashMap::new();
        for conn in &self.schema.connections {
            if top.contains(conn.from_node.as_str()) && top.contains(conn.to_node.as_str()) {
                reverse
                    .entry(conn.to_node.as_str())
                    .or_default()
                    .push(conn.from_node.as_str());
            }
        }
        let mut reaches_exit: HashSet<&str> = HashSet::from([exit.key.as_str()]);
        let mut queue = VecDeque::from([exit.key.as_str()]);
        while let Some(key) = queue.pop_front() {
            for &prev in reverse.get(key).into_iter().flatten() {
                if reaches_exit.insert(prev) {
                    queue.push_back(prev);
                }
            }
        }

        for &key in &top {
            if !reaches_exit.contains(key) {
                issues.push(ValidateIssue::error(
                    Some(key),
                    "node has no path to the exit node",
                ));
            }
        }
    }

    /// Branch port sets must be normalized: `branch_0..branch_n` contiguous
    /// plus an optional `default`.
    fn check_branches(&self, issues: &mut Vec<ValidateIssue>) {
        for (key, branch) in &self.schema.branches {
            if !branch.is_normalized() {
                issues.push(ValidateIssue::error(
                    Some(key.as_str()),
                    format!("branch ports are not normalized: {:?}", branch.ports),
                ));
            }
        }
    }

    /// Every input reference must resolve to a producer field whose declared
    /// type unifies with the consumer's declared type.
    fn check_types(&self, issues: &mut Vec<ValidateIssue>) {
        for node in &self.schema.nodes {
            for field in &node.input_sources {
                let Some(VariableSource::Reference { node_key, path }) = &field.source else {
                    continue;
                };
                let Some(producer) = self.schema.node(node_key) else {
                    issues.push(ValidateIssue::error(
                        Some(node.key.as_str()),
                        format!("input references unknown node {node_key}"),
                    ));
                    continue;
                };

                let produced = self.resolve_produced_type(node, producer, path);
                let Some(produced) = produced else {
                    issues.push(ValidateIssue::error(
                        Some(node.key.as_str()),
                        format!("input references unknown field {}.{}", node_key, path.join(".")),
                    ));
                    continue;
                };

                let declared = field.path.first().and_then(|f| node.input_types.get(f));
                if let Some(declared) = declared {
                    if !produced.unifies_with(declared) {
                        issues.push(ValidateIssue::error(
                            Some(node.key.as_str()),
                            format!(
                                "input {} expects {} but {}.{} produces {}",
                                field.path.join("."),
                                declared,
                                node_key,
                                path.join("."),
                                produced
                            ),
                        ));
                    }
                }
            }
        }
    }

    /// The type a producer exposes at `path`. A child referencing its own
    /// composite parent additionally sees the parent's inputs and loop
    /// variables (the per-element and per-iteration views).
    fn resolve_produced_type(
        &self,
        consumer: &NodeSchema,
        producer: &NodeSchema,
        path: &[String],
    ) -> Option<DataType> {
        if let Some(ty) = producer.output_type_at(path) {
            return Some(ty.clone());
        }

        let is_parent = self
            .schema
            .hierarchy
            .get(&consumer.key)
            .is_some_and(|p| p == &producer.key);
        if !is_parent {
            return None;
        }

        let (head, rest) = path.split_first()?;
        if let Some(input) = producer.input_types.get(head) {
            if let Some(ty) = input.at_path(rest) {
                return Some(ty.clone());
            }
            // A composite parent's list input is seen element-wise by its
            // children.
            if let DataType::List { element } = input {
                if let Some(ty) = element.at_path(rest) {
                    return Some(ty.clone());
                }
            }
        }
        if let NodeConfigs::Loop(cfg) = &producer.configs {
            if let Some(var) = cfg.variables.iter().find(|v| &v.name == head) {
                return var.var_type.at_path(rest).cloned();
            }
        }
        None
    }

    /// Exception policy checks (S6): `ReturnDefaultData` needs well-formed
    /// non-empty JSON, `ExceptionBranch` needs exactly one exception edge.
    fn check_exception_configs(&self, issues: &mut Vec<ValidateIssue>) {
        for node in &self.schema.nodes {
            let Some(cfg) = &node.exception_configs else {
                continue;
            };
            match cfg.process_type {
                ProcessType::ReturnDefaultData => match cfg.data_on_err.as_deref() {
                    None | Some("") => issues.push(ValidateIssue::error(
                        Some(node.key.as_str()),
                        "return-default-data requires non-empty data_on_err",
                    )),
                    Some(raw) => {
                        if serde_json::from_str::<serde_json::Value>(raw).is_err() {
                            issues.push(ValidateIssue::error(
                                Some(node.key.as_str()),
                                "data_on_err is not valid JSON",
                            ));
                        }
                    }
                },
                ProcessType::ExceptionBranch => {
                    let exception_edges = self
                        .schema
                        .connections
                        .iter()
                        .filter(|c| {
                            c.from_node == node.key
                                && c.from_port.as_deref() == Some(crate::canvas::port::EXCEPTION)
                        })
                        .count();
                    if exception_edges != 1 {
                        issues.push(ValidateIssue::error(
                            Some(node.key.as_str()),
                            format!(
                                "exception-branch policy needs exactly one exception edge, found {exception_edges}"
                            ),
                        ));
                    }
                }
                ProcessType::Throw => {}
            }
        }
    }
}

/// Capability checks over one schema.
pub fn schema_check(
    schema: &WorkflowSchema,
    mode: WorkflowMode,
    checks: &[CheckType],
) -> Vec<CheckResult> {
    checks
        .iter()
        .map(|check| {
            let issues = match check {
                CheckType::Structure => SchemaValidator::new(schema).validate(),
                CheckType::BotAgent => check_bot_agent(schema, mode),
            };
            CheckResult {
                check: *check,
                passed: issues.iter().all(|i| i.severity != Severity::Error),
                issues,
            }
        })
        .collect()
}

fn check_bot_agent(schema: &WorkflowSchema, mode: WorkflowMode) -> Vec<ValidateIssue> {
    if !mode.is_chat() {
        return Vec::new();
    }
    schema
        .nodes
        .iter()
        .filter(|n| n.node_type.is_conversation_related())
        .map(|n| {
            ValidateIssue::error(
                Some(n.key.as_str()),
                "conversation nodes are not allowed in a bot-agent chat flow",
            )
        })
        .collect()
}

/// Check external resource references of one schema.
pub async fn check_resources(
    schema: &WorkflowSchema,
    resolver: &dyn ResourceResolver,
) -> Result<Vec<ValidateIssue>, WorkflowError> {
    let mut issues = Vec::new();
    for node in &schema.nodes {
        for plugin_id in node.configs.plugin_ids() {
            if !resolver.plugin_exists(plugin_id).await? {
                issues.push(ValidateIssue::error(
                    Some(node.key.as_str()),
                    format!("plugin {plugin_id} does not resolve"),
                ));
            }
        }
        for knowledge_id in node.configs.knowledge_ids() {
            if !resolver.knowledge_exists(knowledge_id).await? {
                issues.push(ValidateIssue::error(
                    Some(node.key.as_str()),
                    format!("knowledge base {knowledge_id} does not resolve"),
                ));
            }
        }
        for database_id in node.configs.database_ids() {
            if !resolver.database_exists(database_id).await? {
                issues.push(ValidateIssue::error(
                    Some(node.key.as_str()),
                    format!("database {database_id} does not resolve"),
                ));
            }
        }
    }
    Ok(issues)
}

/// Validate a compiled tree: the root schema and every embedded sub-schema,
/// each reported once even when referenced from several places. The visited
/// set is keyed `(workflow_id, version)`, draft being the `None` version.
pub fn validate_tree(root_id: i64, root: &WorkflowSchema) -> Vec<ValidateTreeInfo> {
    let mut out = Vec::new();
    let mut visited: HashSet<(i64, Option<String>)> = HashSet::new();
    walk_tree(root_id, None, root, &mut visited, &mut out);
    out
}

fn walk_tree(
    workflow_id: i64,
    version: Option<String>,
    schema: &WorkflowSchema,
    visited: &mut HashSet<(i64, Option<String>)>,
    out: &mut Vec<ValidateTreeInfo>,
) {
    if !visited.insert((workflow_id, version.clone())) {
        return;
    }
    let issues = SchemaValidator::new(schema).validate();
    out.push(ValidateTreeInfo {
        workflow_id,
        version,
        issues,
    });

    for node in &schema.nodes {
        if let (Some(basic), Some(sub)) = (&node.sub_workflow_basic, &node.sub_workflow_schema) {
            walk_tree(basic.workflow_id, basic.version.clone(), sub, visited, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::canvas::{initial_canvas, Canvas, CanvasEdge, CanvasNode, NodeData};
    use crate::compile::CanvasCompiler;
    use crate::schema::ExceptionConfig;
    use crate::types::Variable;

    fn compile(canvas: &Canvas) -> WorkflowSchema {
        tokio_test::block_on(CanvasCompiler::standalone().compile(canvas)).unwrap()
    }

    #[test]
    fn clean_canvas_validates() {
        let schema = compile(&initial_canvas());
        assert!(SchemaValidator::new(&schema).validate().is_empty());
    }

    #[test]
    fn type_mismatch_is_reported() {
        let mut canvas = initial_canvas();
        // Exit declares an integer but the entry produces a string.
        canvas.node_mut("900001").unwrap().data.inputs = vec![
            Variable::new("output", DataType::Integer).with_reference("100001", &["input"]),
        ];
        let schema = compile(&canvas);
        let issues = SchemaValidator::new(&schema).validate();
        assert_eq!(issues.len(), 1);
        assert!(issues[0].message.contains("expects integer"));
    }

    #[test]
    fn unknown_reference_is_reported() {
        let mut canvas = initial_canvas();
        canvas.node_mut("900001").unwrap().data.inputs = vec![
            Variable::new("output", DataType::String).with_reference("ghost", &["input"]),
        ];
        let schema = compile(&canvas);
        let issues = SchemaValidator::new(&schema).validate();
        assert!(issues.iter().any(|i| i.message.contains("unknown node ghost")));
    }

    #[test]
    fn dead_end_nodes_are_reported() {
        let mut canvas = initial_canvas();
        let node = CanvasNode {
            id: "dead".to_string(),
            node_type: "code_runner".to_string(),
            data: NodeData {
                configs: json!({ "language": "python", "code": "pass" }),
                ..Default::default()
            },
            ..Default::default()
        };
        canvas.nodes.push(node);
        // Fed from entry but never reaching exit.
        canvas.edges.push(CanvasEdge::new("100001", "dead"));
        let schema = compile(&canvas);
        let issues = SchemaValidator::new(&schema).validate();
        assert!(issues
            .iter()
            .any(|i| i.node_key.as_deref() == Some("dead")
                && i.message.contains("no path to the exit")));
    }

    #[test]
    fn return_default_data_needs_json() {
        let mut schema = compile(&initial_canvas());
        schema.node_mut("100001").unwrap().exception_configs = Some(ExceptionConfig {
            timeout_ms: None,
            max_retry: 0,
            process_type: ProcessType::ReturnDefaultData,
            data_on_err: Some(String::new()),
            backup_llm_param: None,
        });
        let issues = SchemaValidator::new(&schema).validate();
        assert!(issues.iter().any(|i| i.message.contains("non-empty data_on_err")));

        schema.node_mut("100001").unwrap().exception_configs = Some(ExceptionConfig {
            timeout_ms: None,
            max_retry: 0,
            process_type: ProcessType::ReturnDefaultData,
            data_on_err: Some("{not json".to_string()),
            backup_llm_param: None,
        });
        let issues = SchemaValidator::new(&schema).validate();
        assert!(issues.iter().any(|i| i.message.contains("not valid JSON")));
    }

    #[test]
    fn exception_branch_needs_designated_edge() {
        let mut schema = compile(&initial_canvas());
        schema.node_mut("100001").unwrap().exception_configs = Some(ExceptionConfig {
            timeout_ms: None,
            max_retry: 0,
            process_type: ProcessType::ExceptionBranch,
            data_on_err: None,
            backup_llm_param: None,
        });
        let issues = SchemaValidator::new(&schema).validate();
        assert!(issues
            .iter()
            .any(|i| i.message.contains("exactly one exception edge")));
    }

    #[test]
    fn bot_agent_check_rejects_conversation_nodes() {
        let mut canvas = initial_canvas();
        canvas.nodes.push(CanvasNode {
            id: "conv".to_string(),
            node_type: "create_conversation".to_string(),
            ..Default::default()
        });
        canvas.edges.push(CanvasEdge::new("100001", "conv"));
        canvas.edges.push(CanvasEdge::new("conv", "900001"));
        let schema = compile(&canvas);

        let results = schema_check(&schema, WorkflowMode::ChatFlow, &[CheckType::BotAgent]);
        assert_eq!(results.len(), 1);
        assert!(!results[0].passed);

        // The same schema in a plain workflow context passes the check.
        let results = schema_check(&schema, WorkflowMode::Workflow, &[CheckType::BotAgent]);
        assert!(results[0].passed);
    }

    #[test]
    fn resource_checks_go_through_the_resolver() {
        let mut canvas = initial_canvas();
        canvas.nodes.push(CanvasNode {
            id: "kb".to_string(),
            node_type: "knowledge_retriever".to_string(),
            data: NodeData {
                configs: json!({
                    "knowledge_ids": [404],
                    "top_k": 3,
                    "strategy": "semantic",
                }),
                ..Default::default()
            },
            ..Default::default()
        });
        canvas.edges.push(CanvasEdge::new("100001", "kb"));
        canvas.edges.push(CanvasEdge::new("kb", "900001"));
        let schema = compile(&canvas);

        let mut resolver = MockResourceResolver::new();
        resolver
            .expect_knowledge_exists()
            .returning(|id| Ok(id != 404));
        let issues =
            tokio_test::block_on(check_resources(&schema, &resolver)).unwrap();
        assert_eq!(issues.len(), 1);
        assert!(issues[0].message.contains("knowledge base 404"));
    }
}
