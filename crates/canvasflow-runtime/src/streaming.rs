//! Streaming channels.
//!
//! Node output streams are bounded multi-producer single-consumer channels
//! with explicit close semantics: the producer drops its sender (or sends a
//! final chunk) and the consumer observes the end of the stream. The
//! workflow-level answer stream is the same shape, fed by whichever node the
//! exit emitter consumes.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Default chunk buffer per stream. Producers back-pressure on a slow
/// consumer instead of buffering unboundedly.
pub const STREAM_BUFFER: usize = 64;

/// One delta of a streaming field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    /// Node that produced the delta.
    pub node_key: String,
    /// Output field the delta belongs to.
    pub field: String,
    pub delta: String,
    /// Set on the last chunk of the stream.
    #[serde(default)]
    pub finished: bool,
}

impl StreamChunk {
    pub fn delta(node_key: impl Into<String>, field: impl Into<String>, delta: impl Into<String>) -> Self {
        Self {
            node_key: node_key.into(),
            field: field.into(),
            delta: delta.into(),
            finished: false,
        }
    }

    pub fn finish(node_key: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            node_key: node_key.into(),
            field: field.into(),
            delta: String::new(),
            finished: true,
        }
    }
}

/// Create a bounded stream pair.
pub fn stream_channel() -> (mpsc::Sender<StreamChunk>, mpsc::Receiver<StreamChunk>) {
    mpsc::channel(STREAM_BUFFER)
}

/// Drain a stream to completion, concatenating deltas per field. Used when
/// a streaming producer feeds a non-streaming consumer.
pub async fn collect_stream(mut rx: mpsc::Receiver<StreamChunk>) -> String {
    let mut text = String::new();
    while let Some(chunk) = rx.recv().await {
        text.push_str(&chunk.delta);
        if chunk.finished {
            break;
        }
    }
    text
}
