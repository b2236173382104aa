//! The closed set of node types a canvas may contain, plus the static
//! per-type metadata the engine consults during compilation (composite and
//! terminal classification, default timeouts, checkpoint requirements) and
//! the display catalog served by `ListNodeMeta`.

use serde::{Deserialize, Serialize};

/// Every node type the canvas compiler understands. Unknown type strings are
/// rejected during compilation unless the node is a [`NodeType::Comment`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Entry,
    Exit,
    Selector,
    Loop,
    Batch,
    Break,
    Continue,
    InputReceiver,
    JsonSerialization,
    JsonDeserialization,
    VariableAssigner,
    VariableAssignerWithinLoop,
    VariableAggregator,
    Plugin,
    CodeRunner,
    OutputEmitter,
    TextProcessor,
    SubWorkflow,
    IntentDetector,
    QuestionAnswer,
    HttpRequester,
    Llm,
    KnowledgeIndexer,
    KnowledgeRetriever,
    KnowledgeDeleter,
    DatabaseInsert,
    DatabaseUpdate,
    DatabaseQuery,
    DatabaseDelete,
    DatabaseCustomSql,
    CreateConversation,
    UpdateConversation,
    DeleteConversation,
    ListConversation,
    ConversationHistory,
    ClearConversationHistory,
    CreateMessage,
    EditMessage,
    DeleteMessage,
    MessageList,
    Comment,
}

/// Display grouping used by the node palette.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeCategory {
    Basic,
    Logic,
    Ai,
    Data,
    Conversation,
    Utility,
}

impl NodeType {
    /// Parse the canvas `type` string. Returns `None` for unknown types so
    /// the compiler can distinguish "unknown" from "comment".
    pub fn parse(raw: &str) -> Option<Self> {
        serde_json::from_value(serde_json::Value::String(raw.to_string())).ok()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Entry => "entry",
            NodeType::Exit => "exit",
            NodeType::Selector => "selector",
            NodeType::Loop => "loop",
            NodeType::Batch => "batch",
            NodeType::Break => "break",
            NodeType::Continue => "continue",
            NodeType::InputReceiver => "input_receiver",
            NodeType::JsonSerialization => "json_serialization",
            NodeType::JsonDeserialization => "json_deserialization",
            NodeType::VariableAssigner => "variable_assigner",
            NodeType::VariableAssignerWithinLoop => "variable_assigner_within_loop",
            NodeType::VariableAggregator => "variable_aggregator",
            NodeType::Plugin => "plugin",
            NodeType::CodeRunner => "code_runner",
            NodeType::OutputEmitter => "output_emitter",
            NodeType::TextProcessor => "text_processor",
            NodeType::SubWorkflow => "sub_workflow",
            NodeType::IntentDetector => "intent_detector",
            NodeType::QuestionAnswer => "question_answer",
            NodeType::HttpRequester => "http_requester",
            NodeType::Llm => "llm",
            NodeType::KnowledgeIndexer => "knowledge_indexer",
            NodeType::KnowledgeRetriever => "knowledge_retriever",
            NodeType::KnowledgeDeleter => "knowledge_deleter",
            NodeType::DatabaseInsert => "database_insert",
            NodeType::DatabaseUpdate => "database_update",
            NodeType::DatabaseQuery => "database_query",
            NodeType::DatabaseDelete => "database_delete",
            NodeType::DatabaseCustomSql => "database_custom_sql",
            NodeType::CreateConversation => "create_conversation",
            NodeType::UpdateConversation => "update_conversation",
            NodeType::DeleteConversation => "delete_conversation",
            NodeType::ListConversation => "list_conversation",
            NodeType::ConversationHistory => "conversation_history",
            NodeType::ClearConversationHistory => "clear_conversation_history",
            NodeType::CreateMessage => "create_message",
            NodeType::EditMessage => "edit_message",
            NodeType::DeleteMessage => "delete_message",
            NodeType::MessageList => "message_list",
            NodeType::Comment => "comment",
        }
    }

    pub const fn all() -> &'static [NodeType] {
        use NodeType::*;
        &[
            Entry, Exit, Selector, Loop, Batch, Break, Continue, InputReceiver,
            JsonSerialization, JsonDeserialization, VariableAssigner,
            VariableAssignerWithinLoop, VariableAggregator, Plugin, CodeRunner,
            OutputEmitter, TextProcessor, SubWorkflow, IntentDetector, QuestionAnswer,
            HttpRequester, Llm, KnowledgeIndexer, KnowledgeRetriever, KnowledgeDeleter,
            DatabaseInsert, DatabaseUpdate, DatabaseQuery, DatabaseDelete,
            DatabaseCustomSql, CreateConversation, UpdateConversation,
            DeleteConversation, ListConversation, ConversationHistory,
            ClearConversationHistory, CreateMessage, EditMessage, DeleteMessage,
            MessageList, Comment,
        ]
    }

    /// Composite nodes own child blocks and internal edges.
    pub fn is_composite(&self) -> bool {
        matches!(self, NodeType::Loop | NodeType::Batch)
    }

    /// Control nodes that terminate their enclosing loop scope.
    pub fn is_loop_control(&self) -> bool {
        matches!(self, NodeType::Break | NodeType::Continue)
    }

    /// Selector-like nodes that pick exactly one outgoing branch.
    pub fn has_branches(&self) -> bool {
        matches!(
            self,
            NodeType::Selector | NodeType::IntentDetector | NodeType::QuestionAnswer
        )
    }

    /// Nodes that suspend the execution until the caller supplies input, and
    /// therefore force checkpointing for the whole workflow.
    pub fn requires_checkpoint(&self) -> bool {
        matches!(self, NodeType::InputReceiver | NodeType::QuestionAnswer)
    }

    /// Nodes forbidden outside ChatFlow, and inside ChatFlows that run in a
    /// bot-agent context.
    pub fn is_conversation_related(&self) -> bool {
        matches!(
            self,
            NodeType::CreateConversation
                | NodeType::UpdateConversation
                | NodeType::DeleteConversation
                | NodeType::ListConversation
                | NodeType::ConversationHistory
                | NodeType::ClearConversationHistory
                | NodeType::CreateMessage
                | NodeType::EditMessage
                | NodeType::DeleteMessage
                | NodeType::MessageList
        )
    }

    /// Default single-node timeout covering the attempt plus all retries.
    /// `None` means the node inherits only the workflow-level deadline.
    pub fn default_timeout_ms(&self) -> Option<u64> {
        match self {
            NodeType::Llm | NodeType::IntentDetector | NodeType::QuestionAnswer => Some(60_000),
            NodeType::CodeRunner => Some(60_000),
            NodeType::HttpRequester | NodeType::Plugin => Some(30_000),
            NodeType::KnowledgeIndexer
            | NodeType::KnowledgeRetriever
            | NodeType::KnowledgeDeleter => Some(30_000),
            NodeType::DatabaseInsert
            | NodeType::DatabaseUpdate
            | NodeType::DatabaseQuery
            | NodeType::DatabaseDelete
            | NodeType::DatabaseCustomSql => Some(10_000),
            _ => None,
        }
    }

    pub fn category(&self) -> NodeCategory {
        use NodeType::*;
        match self {
            Entry | Exit | InputReceiver | OutputEmitter => NodeCategory::Basic,
            Selector | Loop | Batch | Break | Continue | IntentDetector | QuestionAnswer => {
                NodeCategory::Logic
            }
            Llm | SubWorkflow | Plugin | CodeRunner | HttpRequester => NodeCategory::Ai,
            KnowledgeIndexer | KnowledgeRetriever | KnowledgeDeleter | DatabaseInsert
            | DatabaseUpdate | DatabaseQuery | DatabaseDelete | DatabaseCustomSql => {
                NodeCategory::Data
            }
            CreateConversation | UpdateConversation | DeleteConversation | ListConversation
            | ConversationHistory | ClearConversationHistory | CreateMessage | EditMessage
            | DeleteMessage | MessageList => NodeCategory::Conversation,
            JsonSerialization | JsonDeserialization | VariableAssigner
            | VariableAssignerWithinLoop | VariableAggregator | TextProcessor | Comment => {
                NodeCategory::Utility
            }
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            NodeType::Entry => "Start",
            NodeType::Exit => "End",
            NodeType::Selector => "Condition",
            NodeType::Loop => "Loop",
            NodeType::Batch => "Batch",
            NodeType::Break => "Break",
            NodeType::Continue => "Continue",
            NodeType::InputReceiver => "Input",
            NodeType::JsonSerialization => "JSON serialize",
            NodeType::JsonDeserialization => "JSON parse",
            NodeType::VariableAssigner => "Set variable",
            NodeType::VariableAssignerWithinLoop => "Set loop variable",
            NodeType::VariableAggregator => "Merge variables",
            NodeType::Plugin => "Plugin",
            NodeType::CodeRunner => "Code",
            NodeType::OutputEmitter => "Output",
            NodeType::TextProcessor => "Text processing",
            NodeType::SubWorkflow => "Workflow",
            NodeType::IntentDetector => "Intent recognition",
            NodeType::QuestionAnswer => "Question",
            NodeType::HttpRequester => "HTTP request",
            NodeType::Llm => "LLM",
            NodeType::KnowledgeIndexer => "Knowledge writing",
            NodeType::KnowledgeRetriever => "Knowledge retrieval",
            NodeType::KnowledgeDeleter => "Knowledge deletion",
            NodeType::DatabaseInsert => "Insert row",
            NodeType::DatabaseUpdate => "Update rows",
            NodeType::DatabaseQuery => "Query rows",
            NodeType::DatabaseDelete => "Delete rows",
            NodeType::DatabaseCustomSql => "SQL",
            NodeType::CreateConversation => "Create conversation",
            NodeType::UpdateConversation => "Update conversation",
            NodeType::DeleteConversation => "Delete conversation",
            NodeType::ListConversation => "List conversations",
            NodeType::ConversationHistory => "Conversation history",
            NodeType::ClearConversationHistory => "Clear history",
            NodeType::CreateMessage => "Create message",
            NodeType::EditMessage => "Edit message",
            NodeType::DeleteMessage => "Delete message",
            NodeType::MessageList => "List messages",
            NodeType::Comment => "Comment",
        }
    }
}

/// Palette metadata for one node type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeMetaInfo {
    pub node_type: NodeType,
    pub name: &'static str,
    pub category: NodeCategory,
    /// Types hidden from the palette (internal or chat-only surfaces are
    /// filtered by the service layer, not here).
    pub listable: bool,
}

/// The full palette catalog. Comments are a canvas affordance, not a
/// schedulable node, so they are not listable.
pub fn node_catalog() -> Vec<NodeMetaInfo> {
    NodeType::all()
        .iter()
        .map(|ty| NodeMetaInfo {
            node_type: *ty,
            name: ty.display_name(),
            category: ty.category(),
            listable: !matches!(ty, NodeType::Comment),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_round_trips_every_type() {
        for ty in NodeType::all() {
            assert_eq!(NodeType::parse(ty.as_str()), Some(*ty), "{}", ty.as_str());
        }
        assert_eq!(NodeType::parse("warp_drive"), None);
    }

    #[test]
    fn composites_and_controls_are_classified() {
        assert!(NodeType::Loop.is_composite());
        assert!(NodeType::Batch.is_composite());
        assert!(NodeType::Break.is_loop_control());
        assert!(!NodeType::Selector.is_composite());
        assert!(NodeType::Selector.has_branches());
    }

    #[test]
    fn catalog_covers_all_types_once() {
        let catalog = node_catalog();
        assert_eq!(catalog.len(), NodeType::all().len());
        assert!(catalog.iter().any(|m| !m.listable && m.node_type == NodeType::Comment));
    }
}
