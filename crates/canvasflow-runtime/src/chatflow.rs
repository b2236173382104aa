//! ChatFlow execution adapter.
//!
//! ChatFlow workflows take the two well-known entry slots (`USER_INPUT`,
//! `CONVERSATION_NAME`) and stream their answer. The adapter shapes caller
//! input into the entry object, fills the conversation-name default, binds
//! the conversation, and exposes the answer deltas as a stream while the
//! execution runs.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use canvasflow_core::canvas::{CONVERSATION_NAME, USER_INPUT};
use canvasflow_core::error::WorkflowError;
use canvasflow_core::schema::WorkflowSchema;

use crate::context::ExecutionContext;
use crate::ports::ExecutionEvent;
use crate::scheduler::{ExecutionOutcome, WorkflowExecutor};
use crate::streaming::StreamChunk;

/// Buffered events per chat turn before back-pressure applies.
const EVENT_BUFFER: usize = 256;

/// One chat invocation.
#[derive(Debug, Clone)]
pub struct ChatTurn {
    pub user_input: String,
    /// Defaults to [`DEFAULT_CONVERSATION_NAME`] when the caller is silent.
    pub conversation_name: Option<String>,
    pub conversation_id: Option<i64>,
}

pub const DEFAULT_CONVERSATION_NAME: &str = "Default";

/// A running chat turn: answer deltas arrive on `events` while `result`
/// resolves to the final outcome.
pub struct ChatRun {
    pub events: mpsc::Receiver<ExecutionEvent>,
    pub result: JoinHandle<Result<ExecutionOutcome, WorkflowError>>,
}

impl ChatRun {
    /// Drain the run to completion, returning the concatenated answer text
    /// and the final outcome.
    pub async fn collect(mut self) -> Result<(String, ExecutionOutcome), WorkflowError> {
        let mut answer = String::new();
        while let Some(event) = self.events.recv().await {
            if let ExecutionEvent::AnswerDelta {
                chunk: StreamChunk { delta, .. },
            } = event
            {
                answer.push_str(&delta);
            }
        }
        let outcome = self
            .result
            .await
            .map_err(|e| WorkflowError::operation(format!("chat execution panicked: {e}")))??;
        Ok((answer, outcome))
    }
}

/// Build the entry object for a chat turn.
pub fn chat_entry_input(turn: &ChatTurn) -> Value {
    json!({
        USER_INPUT: turn.user_input,
        CONVERSATION_NAME: turn
            .conversation_name
            .clone()
            .unwrap_or_else(|| DEFAULT_CONVERSATION_NAME.to_string()),
    })
}

/// Start a ChatFlow execution and hand back the live event stream.
pub fn run_chat(
    executor: WorkflowExecutor,
    schema: Arc<WorkflowSchema>,
    turn: ChatTurn,
    base_ctx: ExecutionContext,
) -> ChatRun {
    let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
    let mut ctx = base_ctx.with_events(events_tx);
    if let Some(conversation_id) = turn.conversation_id {
        ctx = ctx.with_conversation(conversation_id);
    }
    let input = chat_entry_input(&turn);

    let result = tokio::spawn(async move { executor.execute(schema, input, ctx).await });
    ChatRun {
        events: events_rx,
        result,
    }
}
