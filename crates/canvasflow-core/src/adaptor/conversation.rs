//! Adaptors for the conversation and message nodes. Only allowed in
//! ChatFlow workflows; the validator enforces the mode and the bot-agent
//! capability constraint.

use std::sync::Arc;

use crate::canvas::CanvasNode;
use crate::error::WorkflowError;
use crate::node_type::NodeType;
use crate::schema::{NodeConfigs, NodeSchema};

use super::{base_schema, parse_configs, NodeAdaptor};

pub(super) fn adaptors() -> Vec<Arc<dyn NodeAdaptor>> {
    vec![
        Arc::new(PlainConversationAdaptor(NodeType::CreateConversation)),
        Arc::new(PlainConversationAdaptor(NodeType::UpdateConversation)),
        Arc::new(PlainConversationAdaptor(NodeType::DeleteConversation)),
        Arc::new(PlainConversationAdaptor(NodeType::ListConversation)),
        Arc::new(ConversationHistoryAdaptor),
        Arc::new(PlainConversationAdaptor(NodeType::ClearConversationHistory)),
        Arc::new(PlainConversationAdaptor(NodeType::CreateMessage)),
        Arc::new(PlainConversationAdaptor(NodeType::EditMessage)),
        Arc::new(PlainConversationAdaptor(NodeType::DeleteMessage)),
        Arc::new(MessageListAdaptor),
    ]
}

/// Conversation and message CRUD nodes are fully described by their inputs
/// and outputs; the config carries nothing beyond the variant itself.
struct PlainConversationAdaptor(NodeType);

impl NodeAdaptor for PlainConversationAdaptor {
    fn node_type(&self) -> NodeType {
        self.0
    }

    fn adapt(&self, node: &CanvasNode) -> Result<NodeSchema, WorkflowError> {
        let configs = match self.0 {
            NodeType::CreateConversation => NodeConfigs::CreateConversation,
            NodeType::UpdateConversation => NodeConfigs::UpdateConversation,
            NodeType::DeleteConversation => NodeConfigs::DeleteConversation,
            NodeType::ListConversation => NodeConfigs::ListConversation,
            NodeType::ClearConversationHistory => NodeConfigs::ClearConversationHistory,
            NodeType::CreateMessage => NodeConfigs::CreateMessage,
            NodeType::EditMessage => NodeConfigs::EditMessage,
            NodeType::DeleteMessage => NodeConfigs::DeleteMessage,
            other => {
                return Err(WorkflowError::conversion(
                    &node.id,
                    format!("{} is not a plain conversation node", other.as_str()),
                ))
            }
        };
        base_schema(node, self.0, configs)
    }
}

#[derive(Debug, serde::Deserialize)]
struct RawHistoryConfig {
    rounds: u32,
}

struct ConversationHistoryAdaptor;

impl NodeAdaptor for ConversationHistoryAdaptor {
    fn node_type(&self) -> NodeType {
        NodeType::ConversationHistory
    }

    fn adapt(&self, node: &CanvasNode) -> Result<NodeSchema, WorkflowError> {
        let raw: RawHistoryConfig = parse_configs(node)?;
        if raw.rounds == 0 {
            return Err(WorkflowError::conversion(&node.id, "rounds must be at least 1"));
        }
        base_schema(
            node,
            NodeType::ConversationHistory,
            NodeConfigs::ConversationHistory { rounds: raw.rounds },
        )
    }
}

#[derive(Debug, serde::Deserialize, Default)]
struct RawMessageListConfig {
    #[serde(default)]
    limit: Option<u32>,
}

struct MessageListAdaptor;

impl NodeAdaptor for MessageListAdaptor {
    fn node_type(&self) -> NodeType {
        NodeType::MessageList
    }

    fn adapt(&self, node: &CanvasNode) -> Result<NodeSchema, WorkflowError> {
        let raw: RawMessageListConfig = if node.data.configs.is_null() {
            RawMessageListConfig::default()
        } else {
            parse_configs(node)?
        };
        base_schema(
            node,
            NodeType::MessageList,
            NodeConfigs::MessageList { limit: raw.limit },
        )
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::canvas::NodeData;

    #[test]
    fn history_rounds_flow_into_configs() {
        let node = CanvasNode {
            id: "hist".to_string(),
            node_type: "conversation_history".to_string(),
            data: NodeData {
                configs: json!({ "rounds": 8 }),
                ..Default::default()
            },
            ..Default::default()
        };
        let schema = ConversationHistoryAdaptor.adapt(&node).unwrap();
        assert_eq!(schema.configs.history_rounds(), Some(8));
    }

    #[test]
    fn zero_rounds_rejected() {
        let node = CanvasNode {
            id: "hist".to_string(),
            node_type: "conversation_history".to_string(),
            data: NodeData {
                configs: json!({ "rounds": 0 }),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(ConversationHistoryAdaptor.adapt(&node).is_err());
    }
}
