//! Workflow execution modes.

use serde::{Deserialize, Serialize};

/// How a workflow is invoked and what IO contract its Entry/Exit carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowMode {
    /// Plain request/response: caller supplies the entry parameters and
    /// receives the exit object.
    Workflow,
    /// Chat semantics: `USER_INPUT` and `CONVERSATION_NAME` entry slots and
    /// a streaming answer on exit.
    ChatFlow,
}

impl WorkflowMode {
    pub fn is_chat(&self) -> bool {
        matches!(self, WorkflowMode::ChatFlow)
    }
}

impl Default for WorkflowMode {
    fn default() -> Self {
        WorkflowMode::Workflow
    }
}
