//! External collaborator ports.
//!
//! The runtime reaches every external system through one of these traits:
//! model providers, knowledge bases, plugins, user databases, conversation
//! storage, code sandboxes and object storage. Only the contracts matter
//! here; implementations live with the platform that embeds the engine.
//! All ports are mockable for tests.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use canvasflow_core::error::WorkflowError;
use canvasflow_core::schema::configs::{LlmParam, OrderBy, RetrievalStrategy};

use crate::streaming::StreamChunk;

/// One turn of model input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// A tool surfaced to the model for function calling. The model
/// implementation owns the call loop; the engine only declares what is
/// callable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolSpec {
    Workflow {
        workflow_id: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<String>,
    },
    Plugin {
        plugin_id: i64,
        tool_id: i64,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub messages: Vec<ChatMessage>,
    /// Ask the model for a JSON object instead of prose.
    #[serde(default)]
    pub json_output: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub content: String,
}

/// A built model session. `stream` sends deltas through the provided
/// channel and closes it with a finishing chunk.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn generate(&self, request: ChatRequest) -> Result<ChatResponse, WorkflowError>;

    async fn stream(
        &self,
        request: ChatRequest,
        node_key: String,
        field: String,
        sink: mpsc::Sender<StreamChunk>,
    ) -> Result<ChatResponse, WorkflowError>;
}

/// Builds chat models from node-level parameters.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LlmFactory: Send + Sync {
    async fn build(&self, param: &LlmParam) -> Result<Arc<dyn ChatModel>, WorkflowError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub knowledge_id: i64,
    pub document_id: String,
    pub content: String,
    pub score: f64,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KnowledgeService: Send + Sync {
    /// Index a document; returns the stored document id.
    async fn index(&self, knowledge_id: i64, document: Value) -> Result<String, WorkflowError>;

    async fn retrieve(
        &self,
        knowledge_ids: &[i64],
        query: &str,
        top_k: u32,
        min_score: Option<f64>,
        strategy: RetrievalStrategy,
    ) -> Result<Vec<RetrievedChunk>, WorkflowError>;

    async fn delete(&self, knowledge_id: i64, document_id: &str) -> Result<(), WorkflowError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PluginRegistry: Send + Sync {
    async fn invoke_tool(
        &self,
        plugin_id: i64,
        tool_id: i64,
        args: Value,
    ) -> Result<Value, WorkflowError>;
}

/// Conditions arrive fully resolved: every clause value is a concrete JSON
/// value, shaped `{ "logic": ..., "clauses": [{ "field", "op", "value" }] }`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DatabaseService: Send + Sync {
    async fn insert(&self, database_id: i64, row: Value) -> Result<Value, WorkflowError>;

    async fn update(
        &self,
        database_id: i64,
        condition: Value,
        values: Value,
    ) -> Result<u64, WorkflowError>;

    async fn query<'a>(
        &self,
        database_id: i64,
        condition: Option<Value>,
        select_fields: &'a [String],
        order_by: Option<&'a OrderBy>,
        limit: Option<u32>,
    ) -> Result<Vec<Value>, WorkflowError>;

    async fn delete(&self, database_id: i64, condition: Value) -> Result<u64, WorkflowError>;

    /// Validated, parameterized custom SQL.
    async fn custom_sql(&self, database_id: i64, sql: &str, params: Value)
        -> Result<Value, WorkflowError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationInfo {
    pub conversation_id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub message_id: i64,
    pub role: ChatRole,
    pub content: String,
}

/// Conversation and message storage consumed by the chat-related nodes.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn create_conversation(&self, name: &str) -> Result<ConversationInfo, WorkflowError>;
    async fn update_conversation(
        &self,
        conversation_id: i64,
        name: &str,
    ) -> Result<ConversationInfo, WorkflowError>;
    async fn delete_conversation(&self, conversation_id: i64) -> Result<(), WorkflowError>;
    async fn list_conversations(&self) -> Result<Vec<ConversationInfo>, WorkflowError>;

    async fn history(
        &self,
        conversation_id: i64,
        rounds: u32,
    ) -> Result<Vec<StoredMessage>, WorkflowError>;
    async fn clear_history(&self, conversation_id: i64) -> Result<(), WorkflowError>;

    async fn create_message(
        &self,
        conversation_id: i64,
        role: ChatRole,
        content: &str,
    ) -> Result<StoredMessage, WorkflowError>;
    async fn edit_message(
        &self,
        message_id: i64,
        content: &str,
    ) -> Result<StoredMessage, WorkflowError>;
    async fn delete_message(&self, message_id: i64) -> Result<(), WorkflowError>;
    async fn list_messages(
        &self,
        conversation_id: i64,
        limit: Option<u32>,
    ) -> Result<Vec<StoredMessage>, WorkflowError>;
}

/// Sandbox for the CodeRunner node.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CodeSandbox: Send + Sync {
    async fn run(
        &self,
        language: canvasflow_core::schema::configs::CodeLanguage,
        code: &str,
        inputs: Value,
    ) -> Result<Value, WorkflowError>;
}

/// Object storage for icons and file-typed inputs.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put_object(&self, key: &str, bytes: Vec<u8>) -> Result<(), WorkflowError>;
    async fn get_object(&self, key: &str) -> Result<Vec<u8>, WorkflowError>;
    async fn get_url(&self, key: &str) -> Result<String, WorkflowError>;
}

/// Events the runtime reports while an execution progresses. Callers that
/// want live output (chat streaming, progress UIs) subscribe through an
/// event channel; batch callers ignore it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ExecutionEvent {
    NodeStarted { node_key: String },
    NodeFinished { node_key: String },
    NodeSkipped { node_key: String },
    AnswerDelta { chunk: StreamChunk },
    Suspended { node_key: String, execution_id: Uuid },
}
