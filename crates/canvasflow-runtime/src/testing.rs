//! In-memory fakes for the collaborator ports.
//!
//! Tests (and local development without providers) wire these into an
//! [`crate::executor::ExecutorSet`]. They are deliberately simple: the
//! scripted model replays canned replies, the conversation store is a
//! vector behind a lock, the sandbox echoes its inputs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};

use canvasflow_core::error::WorkflowError;
use canvasflow_core::schema::configs::{CodeLanguage, LlmParam};

use crate::ports::{
    ChatMessage, ChatModel, ChatRequest, ChatResponse, ChatRole, CodeSandbox, ConversationInfo,
    ConversationStore, LlmFactory, StoredMessage,
};
use crate::streaming::StreamChunk;

/// A model that replays scripted replies in order, then repeats the last
/// one. Streams split the reply into a few chunks so streaming paths are
/// exercised.
pub struct ScriptedChatModel {
    replies: Vec<String>,
    cursor: AtomicUsize,
    /// Errors to produce before the first successful reply; lets tests
    /// drive retry and backup-model paths.
    failures: AtomicUsize,
}

impl ScriptedChatModel {
    pub fn new(replies: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            replies: replies.into_iter().map(Into::into).collect(),
            cursor: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
        }
    }

    pub fn failing_first(self, failures: usize) -> Self {
        self.failures.store(failures, Ordering::SeqCst);
        self
    }

    fn next_reply(&self) -> Result<String, WorkflowError> {
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |f| f.checked_sub(1))
            .is_ok()
        {
            return Err(WorkflowError::operation("scripted model failure"));
        }
        let index = self.cursor.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .replies
            .get(index)
            .or_else(|| self.replies.last())
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl ChatModel for ScriptedChatModel {
    async fn generate(&self, _request: ChatRequest) -> Result<ChatResponse, WorkflowError> {
        Ok(ChatResponse {
            content: self.next_reply()?,
        })
    }

    async fn stream(
        &self,
        _request: ChatRequest,
        node_key: String,
        field: String,
        sink: mpsc::Sender<StreamChunk>,
    ) -> Result<ChatResponse, WorkflowError> {
        let content = self.next_reply()?;
        let mid = content.len() / 2;
        let (head, tail) = content.split_at(mid);
        for delta in [head, tail] {
            if !delta.is_empty() {
                let _ = sink
                    .send(StreamChunk::delta(&node_key, &field, delta))
                    .await;
            }
        }
        let _ = sink.send(StreamChunk::finish(&node_key, &field)).await;
        Ok(ChatResponse { content })
    }
}

/// Factory handing out one shared scripted model regardless of parameters,
/// while recording which parameters were requested.
pub struct ScriptedLlmFactory {
    model: Arc<ScriptedChatModel>,
    pub requested: Mutex<Vec<LlmParam>>,
}

impl ScriptedLlmFactory {
    pub fn new(model: ScriptedChatModel) -> Self {
        Self {
            model: Arc::new(model),
            requested: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl LlmFactory for ScriptedLlmFactory {
    async fn build(&self, param: &LlmParam) -> Result<Arc<dyn ChatModel>, WorkflowError> {
        self.requested.lock().await.push(param.clone());
        Ok(Arc::clone(&self.model) as Arc<dyn ChatModel>)
    }
}

/// Conversation storage backed by maps.
#[derive(Default)]
pub struct MemoryConversationStore {
    next_id: AtomicI64,
    conversations: Mutex<HashMap<i64, ConversationInfo>>,
    messages: Mutex<HashMap<i64, Vec<StoredMessage>>>,
}

impl MemoryConversationStore {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
            ..Default::default()
        }
    }

    fn allocate(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }
}

#[async_trait]
impl ConversationStore for MemoryConversationStore {
    async fn create_conversation(&self, name: &str) -> Result<ConversationInfo, WorkflowError> {
        let info = ConversationInfo {
            conversation_id: self.allocate(),
            name: name.to_string(),
        };
        self.conversations
            .lock()
            .await
            .insert(info.conversation_id, info.clone());
        Ok(info)
    }

    async fn update_conversation(
        &self,
        conversation_id: i64,
        name: &str,
    ) -> Result<ConversationInfo, WorkflowError> {
        let mut conversations = self.conversations.lock().await;
        let info = conversations
            .get_mut(&conversation_id)
            .ok_or_else(|| WorkflowError::operation("conversation not found"))?;
        info.name = name.to_string();
        Ok(info.clone())
    }

    async fn delete_conversation(&self, conversation_id: i64) -> Result<(), WorkflowError> {
        self.conversations.lock().await.remove(&conversation_id);
        self.messages.lock().await.remove(&conversation_id);
        Ok(())
    }

    async fn list_conversations(&self) -> Result<Vec<ConversationInfo>, WorkflowError> {
        let mut list: Vec<ConversationInfo> =
            self.conversations.lock().await.values().cloned().collect();
        list.sort_by_key(|c| c.conversation_id);
        Ok(list)
    }

    async fn history(
        &self,
        conversation_id: i64,
        rounds: u32,
    ) -> Result<Vec<StoredMessage>, WorkflowError> {
        let messages = self.messages.lock().await;
        let all = messages.get(&conversation_id).cloned().unwrap_or_default();
        let take = (rounds as usize) * 2;
        Ok(all.iter().rev().take(take).rev().cloned().collect())
    }

    async fn clear_history(&self, conversation_id: i64) -> Result<(), WorkflowError> {
        self.messages.lock().await.remove(&conversation_id);
        Ok(())
    }

    async fn create_message(
        &self,
        conversation_id: i64,
        role: ChatRole,
        content: &str,
    ) -> Result<StoredMessage, WorkflowError> {
        let message = StoredMessage {
            message_id: self.allocate(),
            role,
            content: content.to_string(),
        };
        self.messages
            .lock()
            .await
            .entry(conversation_id)
            .or_default()
            .push(message.clone());
        Ok(message)
    }

    async fn edit_message(
        &self,
        message_id: i64,
        content: &str,
    ) -> Result<StoredMessage, WorkflowError> {
        let mut messages = self.messages.lock().await;
        for thread in messages.values_mut() {
            if let Some(message) = thread.iter_mut().find(|m| m.message_id == message_id) {
                message.content = content.to_string();
                return Ok(message.clone());
            }
        }
        Err(WorkflowError::operation("message not found"))
    }

    async fn delete_message(&self, message_id: i64) -> Result<(), WorkflowError> {
        let mut messages = self.messages.lock().await;
        for thread in messages.values_mut() {
            thread.retain(|m| m.message_id != message_id);
        }
        Ok(())
    }

    async fn list_messages(
        &self,
        conversation_id: i64,
        limit: Option<u32>,
    ) -> Result<Vec<StoredMessage>, WorkflowError> {
        let messages = self.messages.lock().await;
        let mut all = messages.get(&conversation_id).cloned().unwrap_or_default();
        if let Some(limit) = limit {
            all.truncate(limit as usize);
        }
        Ok(all)
    }
}

/// Sandbox that echoes its inputs back under `output`, tagged with the
/// language. Enough to assert data flow through CodeRunner nodes.
pub struct EchoSandbox;

#[async_trait]
impl CodeSandbox for EchoSandbox {
    async fn run(
        &self,
        language: CodeLanguage,
        _code: &str,
        inputs: Value,
    ) -> Result<Value, WorkflowError> {
        Ok(json!({
            "output": inputs,
            "language": language,
        }))
    }
}

/// A chat message helper for history assertions.
pub fn user_message(content: &str) -> ChatMessage {
    ChatMessage {
        role: ChatRole::User,
        content: content.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_model_replays_and_fails() {
        let model = ScriptedChatModel::new(["one", "two"]).failing_first(1);
        assert!(model.generate(ChatRequest::default()).await.is_err());
        assert_eq!(
            model.generate(ChatRequest::default()).await.unwrap().content,
            "one"
        );
        assert_eq!(
            model.generate(ChatRequest::default()).await.unwrap().content,
            "two"
        );
        // Replays the last reply once exhausted.
        assert_eq!(
            model.generate(ChatRequest::default()).await.unwrap().content,
            "two"
        );
    }

    #[tokio::test]
    async fn memory_store_tracks_history_rounds() {
        let store = MemoryConversationStore::new();
        let conv = store.create_conversation("test").await.unwrap();
        for i in 0..6 {
            store
                .create_message(conv.conversation_id, ChatRole::User, &format!("m{i}"))
                .await
                .unwrap();
        }
        let history = store.history(conv.conversation_id, 1).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].content, "m5");
    }
}
