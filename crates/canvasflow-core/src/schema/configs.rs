//! Typed per-node configuration.
//!
//! The canvas carries node configuration as free-form JSON; the adaptor for
//! each node type parses it into the matching [`NodeConfigs`] variant, so
//! everything after compilation works with strongly typed values. The enum
//! is the tagged union keyed by node type — one variant per configurable
//! node, unit-like variants for nodes whose behavior is fully described by
//! their input/output declarations.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{Variable, VariableSource};

/// How the Exit node terminates the workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "plan", rename_all = "snake_case")]
pub enum TerminatePlan {
    /// Return the exit node's resolved input variables as the result object.
    ReturnVariables,
    /// Render an answer template, optionally streaming it chunk by chunk.
    UseAnswerContent { streaming_output: bool, content: String },
}

/// Comparison operator in selector and database conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Contains,
    NotContains,
    IsEmpty,
    IsNotEmpty,
}

impl CompareOp {
    /// Unary operators take no right-hand operand.
    pub fn is_unary(&self) -> bool {
        matches!(self, CompareOp::IsEmpty | CompareOp::IsNotEmpty)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicOp {
    And,
    Or,
}

/// A single comparison inside a selector clause.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub left: VariableSource,
    pub op: CompareOp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub right: Option<VariableSource>,
}

/// One branch of a selector: its conditions joined by `logic`. Branch `i`
/// maps to the normalized outgoing port `branch_i`; a selector with no
/// matching clause falls through to `default`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectorClause {
    pub logic: LogicOp,
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopMode {
    /// Iterate a list input, one iteration per element.
    Array,
    /// Iterate a fixed number of times.
    Count,
    /// Iterate until a Break fires or the execution is cancelled.
    Infinite,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopConfig {
    pub mode: LoopMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    /// Loop-local variables, mutable through `VariableAssignerWithinLoop`.
    #[serde(default)]
    pub variables: Vec<Variable>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Elements per wave.
    pub batch_size: u32,
    /// Children running concurrently within a wave.
    pub concurrent_size: u32,
}

/// Model parameters for LLM-backed nodes. `provider` and `model` address the
/// LLM factory; the rest tune sampling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmParam {
    pub provider: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    Text,
    Markdown,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChatHistorySetting {
    pub enabled: bool,
    pub rounds: u32,
}

/// A tool the LLM node may call through function calling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LlmToolRef {
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

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmConfig {
    pub param: LlmParam,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    pub user_prompt: String,
    #[serde(default = "default_output_format")]
    pub output_format: OutputFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_history: Option<ChatHistorySetting>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<LlmToolRef>,
}

fn default_output_format() -> OutputFormat {
    OutputFormat::Text
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentDetectorConfig {
    pub param: LlmParam,
    /// Intent `i` routes to the normalized port `branch_i`.
    pub intents: Vec<Intent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_history: Option<ChatHistorySetting>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerType {
    /// Free-form reply captured into the output.
    Text,
    /// The user picks one option; option `i` routes to `branch_i`.
    Option,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionAnswerConfig {
    pub question: String,
    pub answer_type: AnswerType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpConfig {
    pub method: HttpMethod,
    pub url: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<HttpBody>,
    /// Per-request timeout; the node-level exception timeout still caps the
    /// total across retries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "content_type", rename_all = "snake_case")]
pub enum HttpBody {
    Json { data: Value },
    FormUrlencoded { fields: BTreeMap<String, String> },
    RawText { text: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodeLanguage {
    Python,
    Javascript,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum TextProcessorConfig {
    /// Render a template over the inputs, e.g. `"{{a}} and {{b}}"`.
    Concat { template: String },
    /// Split a single string input on the separators.
    Split { separators: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubWorkflowConfig {
    pub workflow_id: i64,
    /// `None` runs the referenced workflow's draft.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginConfig {
    pub plugin_id: i64,
    pub tool_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin_version: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalStrategy {
    Semantic,
    FullText,
    Hybrid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeRetrieverConfig {
    pub knowledge_ids: Vec<i64>,
    pub top_k: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_score: Option<f64>,
    pub strategy: RetrievalStrategy,
}

/// One comparison clause of a database condition; the value side resolves
/// like any node input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DbClause {
    pub field: String,
    pub op: CompareOp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<VariableSource>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DbCondition {
    pub logic: LogicOp,
    pub clauses: Vec<DbClause>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    pub descending: bool,
}

/// The tagged union of all node configurations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum NodeConfigs {
    Entry,
    Exit {
        terminate_plan: TerminatePlan,
    },
    Selector {
        clauses: Vec<SelectorClause>,
    },
    Loop(LoopConfig),
    Batch(BatchConfig),
    Break,
    Continue,
    InputReceiver,
    JsonSerialization,
    JsonDeserialization,
    VariableAssigner,
    VariableAssignerWithinLoop,
    VariableAggregator {
        /// Groups merge in declaration order; the first non-empty value of a
        /// group wins.
        groups: Vec<String>,
    },
    Plugin(PluginConfig),
    CodeRunner {
        language: CodeLanguage,
        code: String,
    },
    OutputEmitter {
        content: String,
        streaming_output: bool,
    },
    TextProcessor(TextProcessorConfig),
    SubWorkflow(SubWorkflowConfig),
    IntentDetector(IntentDetectorConfig),
    QuestionAnswer(QuestionAnswerConfig),
    HttpRequester(HttpConfig),
    Llm(LlmConfig),
    KnowledgeIndexer {
        knowledge_id: i64,
    },
    KnowledgeRetriever(KnowledgeRetrieverConfig),
    KnowledgeDeleter {
        knowledge_id: i64,
    },
    DatabaseInsert {
        database_id: i64,
    },
    DatabaseUpdate {
        database_id: i64,
        condition: DbCondition,
    },
    DatabaseQuery {
        database_id: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        condition: Option<DbCondition>,
        #[serde(default)]
        select_fields: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        order_by: Option<OrderBy>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<u32>,
    },
    DatabaseDelete {
        database_id: i64,
        condition: DbCondition,
    },
    DatabaseCustomSql {
        database_id: i64,
        sql: String,
    },
    CreateConversation,
    UpdateConversation,
    DeleteConversation,
    ListConversation,
    ConversationHistory {
        rounds: u32,
    },
    ClearConversationHistory,
    CreateMessage,
    EditMessage,
    DeleteMessage,
    MessageList {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<u32>,
    },
}

impl NodeConfigs {
    /// Chat-history rounds this node consumes, if it is history-aware and
    /// history is enabled.
    pub fn history_rounds(&self) -> Option<u32> {
        match self {
            NodeConfigs::Llm(cfg) => cfg
                .chat_history
                .filter(|h| h.enabled)
                .map(|h| h.rounds),
            NodeConfigs::IntentDetector(cfg) => cfg
                .chat_history
                .filter(|h| h.enabled)
                .map(|h| h.rounds),
            NodeConfigs::ConversationHistory { rounds } => Some(*rounds),
            _ => None,
        }
    }

    /// Plugin ids this node depends on.
    pub fn plugin_ids(&self) -> Vec<i64> {
        match self {
            NodeConfigs::Plugin(cfg) => vec![cfg.plugin_id],
            NodeConfigs::Llm(cfg) => cfg
                .tools
                .iter()
                .filter_map(|t| match t {
                    LlmToolRef::Plugin { plugin_id, .. } => Some(*plugin_id),
                    LlmToolRef::Workflow { .. } => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Knowledge base ids this node depends on.
    pub fn knowledge_ids(&self) -> Vec<i64> {
        match self {
            NodeConfigs::KnowledgeIndexer { knowledge_id }
            | NodeConfigs::KnowledgeDeleter { knowledge_id } => vec![*knowledge_id],
            NodeConfigs::KnowledgeRetriever(cfg) => cfg.knowledge_ids.clone(),
            _ => Vec::new(),
        }
    }

    /// Database ids this node depends on.
    pub fn database_ids(&self) -> Vec<i64> {
        match self {
            NodeConfigs::DatabaseInsert { database_id }
            | NodeConfigs::DatabaseUpdate { database_id, .. }
            | NodeConfigs::DatabaseQuery { database_id, .. }
            | NodeConfigs::DatabaseDelete { database_id, .. }
            | NodeConfigs::DatabaseCustomSql { database_id, .. } => vec![*database_id],
            _ => Vec::new(),
        }
    }

    /// Workflow ids referenced as LLM function-call tools.
    pub fn workflow_tool_refs(&self) -> Vec<(i64, Option<String>)> {
        match self {
            NodeConfigs::Llm(cfg) => cfg
                .tools
                .iter()
                .filter_map(|t| match t {
                    LlmToolRef::Workflow { workflow_id, version } => {
                        Some((*workflow_id, version.clone()))
                    }
                    LlmToolRef::Plugin { .. } => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn configs_serialize_with_node_tag() {
        let cfg = NodeConfigs::Batch(BatchConfig {
            batch_size: 4,
            concurrent_size: 2,
        });
        let raw = serde_json::to_value(&cfg).unwrap();
        assert_eq!(raw["node"], json!("batch"));
        assert_eq!(raw["batch_size"], json!(4));
        let back: NodeConfigs = serde_json::from_value(raw).unwrap();
        assert_eq!(back, cfg);
    }

    #[test]
    fn history_rounds_respects_enabled_flag() {
        let mut llm = LlmConfig {
            param: LlmParam {
                provider: "openai".into(),
                model: "gpt-4o".into(),
                temperature: None,
                max_tokens: None,
                top_p: None,
            },
            system_prompt: None,
            user_prompt: "{{input}}".into(),
            output_format: OutputFormat::Text,
            chat_history: Some(ChatHistorySetting {
                enabled: false,
                rounds: 10,
            }),
            tools: Vec::new(),
        };
        assert_eq!(NodeConfigs::Llm(llm.clone()).history_rounds(), None);

        llm.chat_history = Some(ChatHistorySetting {
            enabled: true,
            rounds: 10,
        });
        assert_eq!(NodeConfigs::Llm(llm).history_rounds(), Some(10));
    }

    #[test]
    fn dependency_harvest_covers_tools() {
        let cfg = NodeConfigs::Llm(LlmConfig {
            param: LlmParam {
                provider: "anthropic".into(),
                model: "claude".into(),
                temperature: None,
                max_tokens: None,
                top_p: None,
            },
            system_prompt: None,
            user_prompt: "hi".into(),
            output_format: OutputFormat::Text,
            chat_history: None,
            tools: vec![
                LlmToolRef::Workflow {
                    workflow_id: 7,
                    version: Some("v1.0.0".into()),
                },
                LlmToolRef::Plugin {
                    plugin_id: 11,
                    tool_id: 3,
                },
            ],
        });
        assert_eq!(cfg.workflow_tool_refs(), vec![(7, Some("v1.0.0".to_string()))]);
        assert_eq!(cfg.plugin_ids(), vec![11]);
    }
}
