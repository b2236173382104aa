//! Per-node exception policy: retries, the combined timeout, and the
//! configured failure disposition.

use std::future::Future;
use std::time::Duration;

use serde_json::Value;
use tracing::warn;

use canvasflow_core::error::WorkflowError;
use canvasflow_core::schema::{ExceptionConfig, ProcessType};

/// What the policy decided after running a node.
#[derive(Debug)]
pub enum PolicyVerdict<T> {
    /// The node succeeded (possibly after retries).
    Output(T),
    /// The node failed and its policy substitutes the authored default.
    DefaultData(Value),
    /// The node failed and control routes along its exception edge.
    ExceptionRoute { message: String },
}

/// Run a node attempt function under its exception policy.
///
/// `timeout_ms` caps the first attempt plus every retry combined. The
/// attempt function receives the zero-based attempt number so LLM nodes can
/// switch to `backup_llm_param` on retries.
pub async fn run_with_policy<T, F, Fut>(
    node_key: &str,
    config: Option<&ExceptionConfig>,
    attempt_fn: F,
) -> Result<PolicyVerdict<T>, WorkflowError>
where
    F: Fn(u32) -> Fut,
    Fut: Future<Output = Result<T, WorkflowError>>,
{
    let max_retry = config.map_or(0, |c| c.max_retry);

    let attempts = async {
        let mut last_error = None;
        for attempt in 0..=max_retry {
            match attempt_fn(attempt).await {
                Ok(output) => return Ok(output),
                Err(error) => {
                    warn!(node_key, attempt, %error, "node attempt failed");
                    last_error = Some(error);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| WorkflowError::operation("node produced no attempts")))
    };

    let result = match config.and_then(|c| c.timeout_ms) {
        Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), attempts).await {
            Ok(result) => result,
            Err(_) => Err(WorkflowError::operation(format!(
                "node {node_key} timed out after {ms}ms across all retries"
            ))),
        },
        None => attempts.await,
    };

    let error = match result {
        Ok(output) => return Ok(PolicyVerdict::Output(output)),
        Err(error) => error,
    };

    match config.map(|c| c.process_type) {
        Some(ProcessType::ReturnDefaultData) => {
            let raw = config
                .and_then(|c| c.data_on_err.as_deref())
                .filter(|s| !s.is_empty())
                .ok_or_else(|| {
                    WorkflowError::invalid_parameter(format!(
                        "node {node_key}: return-default-data without data_on_err"
                    ))
                })?;
            let value = serde_json::from_str(raw).map_err(|e| {
                WorkflowError::invalid_parameter(format!(
                    "node {node_key}: data_on_err is not valid JSON: {e}"
                ))
            })?;
            Ok(PolicyVerdict::DefaultData(value))
        }
        Some(ProcessType::ExceptionBranch) => Ok(PolicyVerdict::ExceptionRoute {
            message: error.to_string(),
        }),
        Some(ProcessType::Throw) | None => Err(error),
    }
}
