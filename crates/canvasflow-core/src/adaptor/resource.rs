//! Adaptors for the nodes that reach external resources: LLM, sub-workflow,
//! plugin, code runner, HTTP, knowledge and database operations.

use std::sync::Arc;

use crate::canvas::CanvasNode;
use crate::error::WorkflowError;
use crate::node_type::NodeType;
use crate::schema::configs::{
    DbCondition, HttpConfig, KnowledgeRetrieverConfig, LlmConfig, OrderBy, PluginConfig,
    SubWorkflowConfig,
};
use crate::schema::{NodeConfigs, NodeSchema, SubWorkflowBasic};

use super::{base_schema, parse_configs, NodeAdaptor};

pub(super) fn adaptors() -> Vec<Arc<dyn NodeAdaptor>> {
    vec![
        Arc::new(LlmAdaptor),
        Arc::new(SubWorkflowAdaptor),
        Arc::new(PluginAdaptor),
        Arc::new(CodeRunnerAdaptor),
        Arc::new(HttpRequesterAdaptor),
        Arc::new(KnowledgeIndexerAdaptor),
        Arc::new(KnowledgeRetrieverAdaptor),
        Arc::new(KnowledgeDeleterAdaptor),
        Arc::new(DatabaseInsertAdaptor),
        Arc::new(DatabaseUpdateAdaptor),
        Arc::new(DatabaseQueryAdaptor),
        Arc::new(DatabaseDeleteAdaptor),
        Arc::new(DatabaseCustomSqlAdaptor),
    ]
}

struct LlmAdaptor;

impl NodeAdaptor for LlmAdaptor {
    fn node_type(&self) -> NodeType {
        NodeType::Llm
    }

    fn adapt(&self, node: &CanvasNode) -> Result<NodeSchema, WorkflowError> {
        let cfg: LlmConfig = parse_configs(node)?;
        if cfg.user_prompt.trim().is_empty() {
            return Err(WorkflowError::conversion(&node.id, "user prompt must not be empty"));
        }
        if cfg.param.model.trim().is_empty() {
            return Err(WorkflowError::conversion(&node.id, "model must be selected"));
        }
        let mut schema = base_schema(node, NodeType::Llm, NodeConfigs::Llm(cfg))?;
        schema.stream_configs.can_generate_stream = true;
        Ok(schema)
    }
}

struct SubWorkflowAdaptor;

impl NodeAdaptor for SubWorkflowAdaptor {
    fn node_type(&self) -> NodeType {
        NodeType::SubWorkflow
    }

    fn adapt(&self, node: &CanvasNode) -> Result<NodeSchema, WorkflowError> {
        let cfg: SubWorkflowConfig = parse_configs(node)?;
        let basic = SubWorkflowBasic {
            workflow_id: cfg.workflow_id,
            version: cfg.version.clone(),
        };
        // The embedded sub-schema is attached by the compiler, which owns
        // loading and recursion.
        let mut schema = base_schema(node, NodeType::SubWorkflow, NodeConfigs::SubWorkflow(cfg))?;
        schema.sub_workflow_basic = Some(basic);
        Ok(schema)
    }
}

struct PluginAdaptor;

impl NodeAdaptor for PluginAdaptor {
    fn node_type(&self) -> NodeType {
        NodeType::Plugin
    }

    fn adapt(&self, node: &CanvasNode) -> Result<NodeSchema, WorkflowError> {
        let cfg: PluginConfig = parse_configs(node)?;
        base_schema(node, NodeType::Plugin, NodeConfigs::Plugin(cfg))
    }
}

#[derive(Debug, serde::Deserialize)]
struct RawCodeConfig {
    language: crate::schema::configs::CodeLanguage,
    code: String,
}

struct CodeRunnerAdaptor;

impl NodeAdaptor for CodeRunnerAdaptor {
    fn node_type(&self) -> NodeType {
        NodeType::CodeRunner
    }

    fn adapt(&self, node: &CanvasNode) -> Result<NodeSchema, WorkflowError> {
        let raw: RawCodeConfig = parse_configs(node)?;
        if raw.code.trim().is_empty() {
            return Err(WorkflowError::conversion(&node.id, "code must not be empty"));
        }
        base_schema(
            node,
            NodeType::CodeRunner,
            NodeConfigs::CodeRunner {
                language: raw.language,
                code: raw.code,
            },
        )
    }
}

struct HttpRequesterAdaptor;

impl NodeAdaptor for HttpRequesterAdaptor {
    fn node_type(&self) -> NodeType {
        NodeType::HttpRequester
    }

    fn adapt(&self, node: &CanvasNode) -> Result<NodeSchema, WorkflowError> {
        let cfg: HttpConfig = parse_configs(node)?;
        if cfg.url.trim().is_empty() {
            return Err(WorkflowError::conversion(&node.id, "request URL must not be empty"));
        }
        base_schema(node, NodeType::HttpRequester, NodeConfigs::HttpRequester(cfg))
    }
}

#[derive(Debug, serde::Deserialize)]
struct RawKnowledgeId {
    knowledge_id: i64,
}

struct KnowledgeIndexerAdaptor;

impl NodeAdaptor for KnowledgeIndexerAdaptor {
    fn node_type(&self) -> NodeType {
        NodeType::KnowledgeIndexer
    }

    fn adapt(&self, node: &CanvasNode) -> Result<NodeSchema, WorkflowError> {
        let raw: RawKnowledgeId = parse_configs(node)?;
        base_schema(
            node,
            NodeType::KnowledgeIndexer,
            NodeConfigs::KnowledgeIndexer {
                knowledge_id: raw.knowledge_id,
            },
        )
    }
}

struct KnowledgeRetrieverAdaptor;

impl NodeAdaptor for KnowledgeRetrieverAdaptor {
    fn node_type(&self) -> NodeType {
        NodeType::KnowledgeRetriever
    }

    fn adapt(&self, node: &CanvasNode) -> Result<NodeSchema, WorkflowError> {
        let cfg: KnowledgeRetrieverConfig = parse_configs(node)?;
        if cfg.knowledge_ids.is_empty() {
            return Err(WorkflowError::conversion(
                &node.id,
                "retriever needs at least one knowledge base",
            ));
        }
        if cfg.top_k == 0 {
            return Err(WorkflowError::conversion(&node.id, "top_k must be at least 1"));
        }
        base_schema(
            node,
            NodeType::KnowledgeRetriever,
            NodeConfigs::KnowledgeRetriever(cfg),
        )
    }
}

struct KnowledgeDeleterAdaptor;

impl NodeAdaptor for KnowledgeDeleterAdaptor {
    fn node_type(&self) -> NodeType {
        NodeType::KnowledgeDeleter
    }

    fn adapt(&self, node: &CanvasNode) -> Result<NodeSchema, WorkflowError> {
        let raw: RawKnowledgeId = parse_configs(node)?;
        base_schema(
            node,
            NodeType::KnowledgeDeleter,
            NodeConfigs::KnowledgeDeleter {
                knowledge_id: raw.knowledge_id,
            },
        )
    }
}

#[derive(Debug, serde::Deserialize)]
struct RawDatabaseId {
    database_id: i64,
}

#[derive(Debug, serde::Deserialize)]
struct RawDatabaseCondition {
    database_id: i64,
    condition: DbCondition,
}

#[derive(Debug, serde::Deserialize)]
struct RawDatabaseQuery {
    database_id: i64,
    #[serde(default)]
    condition: Option<DbCondition>,
    #[serde(default)]
    select_fields: Vec<String>,
    #[serde(default)]
    order_by: Option<OrderBy>,
    #[serde(default)]
    limit: Option<u32>,
}

#[derive(Debug, serde::Deserialize)]
struct RawDatabaseSql {
    database_id: i64,
    sql: String,
}

struct DatabaseInsertAdaptor;

impl NodeAdaptor for DatabaseInsertAdaptor {
    fn node_type(&self) -> NodeType {
        NodeType::DatabaseInsert
    }

    fn adapt(&self, node: &CanvasNode) -> Result<NodeSchema, WorkflowError> {
        let raw: RawDatabaseId = parse_configs(node)?;
        if node.data.inputs.is_empty() {
            return Err(WorkflowError::conversion(&node.id, "insert needs column inputs"));
        }
        base_schema(
            node,
            NodeType::DatabaseInsert,
            NodeConfigs::DatabaseInsert {
                database_id: raw.database_id,
            },
        )
    }
}

struct DatabaseUpdateAdaptor;

impl NodeAdaptor for DatabaseUpdateAdaptor {
    fn node_type(&self) -> NodeType {
        NodeType::DatabaseUpdate
    }

    fn adapt(&self, node: &CanvasNode) -> Result<NodeSchema, WorkflowError> {
        let raw: RawDatabaseCondition = parse_configs(node)?;
        base_schema(
            node,
            NodeType::DatabaseUpdate,
            NodeConfigs::DatabaseUpdate {
                database_id: raw.database_id,
                condition: raw.condition,
            },
        )
    }
}

struct DatabaseQueryAdaptor;

impl NodeAdaptor for DatabaseQueryAdaptor {
    fn node_type(&self) -> NodeType {
        NodeType::DatabaseQuery
    }

    fn adapt(&self, node: &CanvasNode) -> Result<NodeSchema, WorkflowError> {
        let raw: RawDatabaseQuery = parse_configs(node)?;
        base_schema(
            node,
            NodeType::DatabaseQuery,
            NodeConfigs::DatabaseQuery {
                database_id: raw.database_id,
                condition: raw.condition,
                select_fields: raw.select_fields,
                order_by: raw.order_by,
                limit: raw.limit,
            },
        )
    }
}

struct DatabaseDeleteAdaptor;

impl NodeAdaptor for DatabaseDeleteAdaptor {
    fn node_type(&self) -> NodeType {
        NodeType::DatabaseDelete
    }

    fn adapt(&self, node: &CanvasNode) -> Result<NodeSchema, WorkflowError> {
        let raw: RawDatabaseCondition = parse_configs(node)?;
        base_schema(
            node,
            NodeType::DatabaseDelete,
            NodeConfigs::DatabaseDelete {
                database_id: raw.database_id,
                condition: raw.condition,
            },
        )
    }
}

struct DatabaseCustomSqlAdaptor;

impl NodeAdaptor for DatabaseCustomSqlAdaptor {
    fn node_type(&self) -> NodeType {
        NodeType::DatabaseCustomSql
    }

    fn adapt(&self, node: &CanvasNode) -> Result<NodeSchema, WorkflowError> {
        let raw: RawDatabaseSql = parse_configs(node)?;
        if raw.sql.trim().is_empty() {
            return Err(WorkflowError::conversion(&node.id, "sql must not be empty"));
        }
        base_schema(
            node,
            NodeType::DatabaseCustomSql,
            NodeConfigs::DatabaseCustomSql {
                database_id: raw.database_id,
                sql: raw.sql,
            },
        )
    }
}
