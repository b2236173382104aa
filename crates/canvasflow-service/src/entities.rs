//! Persistent entities and operation policies of the workflow domain.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use canvasflow_core::mode::WorkflowMode;
use canvasflow_core::node_type::NodeType;
use canvasflow_core::schema::SubWorkflowBasic;
use canvasflow_core::types::{DataType, Variable};

/// Workflow identity and display data. The id is globally unique and
/// immutable; `(space_id, name)` carries no uniqueness guarantee.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowMeta {
    pub id: i64,
    pub space_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_id: Option<i64>,
    pub name: String,
    #[serde(default)]
    pub desc: String,
    #[serde(default)]
    pub icon: String,
    pub mode: WorkflowMode,
    pub creator_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_published_version: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

/// The editable state of a workflow. One row per workflow; every save
/// produces a new commit id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Draft {
    pub workflow_id: i64,
    pub canvas_json: String,
    /// Entry-node outputs, extracted best-effort on save.
    #[serde(default)]
    pub input_params: Vec<Variable>,
    /// Exit-node inputs, extracted best-effort on save.
    #[serde(default)]
    pub output_params: Vec<Variable>,
    pub commit_id: i64,
    pub test_run_success: bool,
    pub modified: bool,
    pub updated_at: DateTime<Utc>,
}

/// An immutable published snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Version {
    pub workflow_id: i64,
    pub version: String,
    pub canvas_json: String,
    #[serde(default)]
    pub input_params: Vec<Variable>,
    #[serde(default)]
    pub output_params: Vec<Variable>,
    pub commit_id: i64,
    pub creator_id: i64,
    #[serde(default)]
    pub description: String,
    pub created_at: DateTime<Utc>,
}

/// Maps a published workflow version to a delivery channel of an app.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectorBinding {
    pub app_id: i64,
    pub connector_id: i64,
    pub workflow_id: i64,
    pub version: String,
}

/// Per-workflow chat persona configuration, draft-versus-versioned like the
/// workflow itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatFlowRole {
    pub workflow_id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub avatar: String,
    #[serde(default)]
    pub onboarding: String,
    #[serde(default)]
    pub suggested_replies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_config: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_input_config: Option<Value>,
}

/// Per-connector conversation defaults of a ChatFlow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvRelatedInfo {
    pub workflow_id: i64,
    pub connector_id: i64,
    pub conversation_naming: String,
}

/// Aggregate returned by the read operations: the meta plus, unless
/// meta-only was requested, the selected canvas state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub meta: WorkflowMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canvas_json: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_id: Option<i64>,
    /// The published version this aggregate was read from; `None` for the
    /// draft.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub input_params: Vec<Variable>,
    #[serde(default)]
    pub output_params: Vec<Variable>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_run_success: Option<bool>,
}

/// Which canvas state a read addresses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GetSelector {
    #[default]
    Draft,
    Version(String),
    LatestPublished,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetPolicy {
    pub workflow_id: i64,
    pub selector: GetSelector,
    #[serde(default)]
    pub meta_only: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MGetPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<i64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub space_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<WorkflowMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_keyword: Option<String>,
    /// Only workflows with at least one published version.
    #[serde(default)]
    pub published_only: bool,
    #[serde(default = "default_selector")]
    pub selector: GetSelector,
    #[serde(default)]
    pub meta_only: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<Page>,
}

fn default_selector() -> GetSelector {
    GetSelector::Draft
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub offset: u32,
    pub limit: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DeletePolicy {
    ById(i64),
    ByIds(Vec<i64>),
    ByAppId(i64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishPolicy {
    pub workflow_id: i64,
    pub version: String,
    #[serde(default)]
    pub description: String,
    pub creator_id: i64,
    /// Skip the test-run gate.
    #[serde(default)]
    pub force: bool,
}

/// Id rewrites applied when workflows move across scopes (copy to library,
/// duplicate to another app, release): old id → new id per resource family.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExternalResourceRelated {
    #[serde(default)]
    pub workflow_ids: HashMap<i64, i64>,
    #[serde(default)]
    pub plugin_ids: HashMap<i64, i64>,
    #[serde(default)]
    pub plugin_tool_ids: HashMap<i64, i64>,
    #[serde(default)]
    pub knowledge_ids: HashMap<i64, i64>,
    #[serde(default)]
    pub database_ids: HashMap<i64, i64>,
}

impl ExternalResourceRelated {
    pub fn is_empty(&self) -> bool {
        self.workflow_ids.is_empty()
            && self.plugin_ids.is_empty()
            && self.plugin_tool_ids.is_empty()
            && self.knowledge_ids.is_empty()
            && self.database_ids.is_empty()
    }
}

/// External resources a workflow depends on, by family.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DependenceResource {
    pub plugin_ids: Vec<i64>,
    pub knowledge_ids: Vec<i64>,
    pub database_ids: Vec<i64>,
}

/// Summary of one compiled node, served by `QueryNodeProperties`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeProperty {
    pub node_type: NodeType,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_workflow: Option<SubWorkflowBasic>,
    #[serde(default)]
    pub input_types: std::collections::BTreeMap<String, DataType>,
    #[serde(default)]
    pub output_types: std::collections::BTreeMap<String, DataType>,
}

/// Release request for every workflow of an app.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseConfig {
    pub version: String,
    pub connector_ids: Vec<i64>,
    pub creator_id: i64,
    #[serde(default)]
    pub related: ExternalResourceRelated,
}
