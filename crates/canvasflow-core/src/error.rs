//! # Error Handling for the Workflow Engine
//!
//! All fallible operations in the engine return [`WorkflowError`]. The enum
//! mirrors the failure surface of the engine end to end: canvas parsing and
//! adaptation, reference resolution, the draft/version lifecycle, and
//! execution-time failures that escape a node's exception policy.
//!
//! Two conventions hold across the crates:
//!
//! - The canvas compiler and the validator never let a panic escape; panics
//!   are caught and surfaced as [`WorkflowError::OperationFail`].
//! - Best-effort paths (entry/exit parameter extraction during save) log a
//!   warning and continue instead of returning an error.

use crate::validate::ValidateIssue;

/// Primary error type for all workflow engine operations.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    /// Malformed canvas or missing/invalid request fields.
    #[error("invalid parameter: {message}")]
    InvalidParameter {
        /// What was malformed or missing
        message: String,
    },

    /// Canvas JSON (or another payload) could not be serialized or parsed.
    #[error("serialization failed: {message}")]
    SerializationFail {
        /// Details from the underlying serializer
        message: String,
    },

    /// A node adaptor rejected a canvas node during compilation.
    #[error("schema conversion failed for node {node_key}: {message}")]
    SchemaConversionFail {
        /// Canvas id of the offending node
        node_key: String,
        /// Why the adaptor rejected it
        message: String,
    },

    /// A referenced workflow id or version does not exist.
    #[error("workflow {workflow_id} not found{}", .version.as_deref().map(|v| format!(" (version {v})")).unwrap_or_default())]
    WorkflowNotFound {
        /// The referenced workflow id
        workflow_id: i64,
        /// The requested version, if any; `None` means the draft
        version: Option<String>,
    },

    /// User/space mismatch. Raised by the application layer, carried here so
    /// downstream callers see one error type.
    #[error("permission denied: {message}")]
    PermissionDenied { message: String },

    /// A publish attempted a version that does not strictly follow the
    /// latest published version under the `vA.B.C` ordering.
    #[error("version {attempted} must be strictly greater than {latest}")]
    VersionMonotonicity {
        /// The version string that was attempted
        attempted: String,
        /// The current latest published version ("none" if unpublished)
        latest: String,
    },

    /// Publish without `force` while the draft has no successful test run.
    #[error("workflow {workflow_id} requires a successful test run before publish")]
    TestRunRequired { workflow_id: i64 },

    /// The sub-workflow reference closure contains a cycle.
    #[error("reference cycle detected through workflow {workflow_id}")]
    ReferenceCycle { workflow_id: i64 },

    /// Validation produced one or more issues; the issues carry node keys
    /// and severities for the caller to surface.
    #[error("validation failed with {} issue(s)", issues.len())]
    ValidationFailed { issues: Vec<ValidateIssue> },

    /// Wrapper for downstream failures (repository, model providers,
    /// plugins, storage) and for recovered panics.
    #[error("operation failed: {message}")]
    OperationFail { message: String },
}

impl WorkflowError {
    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::InvalidParameter { message: message.into() }
    }

    pub fn conversion(node_key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SchemaConversionFail {
            node_key: node_key.into(),
            message: message.into(),
        }
    }

    pub fn not_found(workflow_id: i64, version: Option<&str>) -> Self {
        Self::WorkflowNotFound {
            workflow_id,
            version: version.map(str::to_string),
        }
    }

    pub fn operation(message: impl Into<String>) -> Self {
        Self::OperationFail { message: message.into() }
    }

    /// True when the error should be reported against a missing workflow id,
    /// letting callers key the failure by the referenced workflow.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::WorkflowNotFound { .. })
    }
}

impl From<serde_json::Error> for WorkflowError {
    fn from(error: serde_json::Error) -> Self {
        WorkflowError::SerializationFail {
            message: error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_formats_version() {
        let err = WorkflowError::not_found(42, Some("v1.0.0"));
        assert_eq!(err.to_string(), "workflow 42 not found (version v1.0.0)");

        let err = WorkflowError::not_found(42, None);
        assert_eq!(err.to_string(), "workflow 42 not found");
    }

    #[test]
    fn serde_errors_map_to_serialization_fail() {
        let parse_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: WorkflowError = parse_err.into();
        assert!(matches!(err, WorkflowError::SerializationFail { .. }));
    }
}
