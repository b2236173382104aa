//! Persistence and infrastructure ports of the workflow domain.
//!
//! The repository groups every table the domain owns. `publish` is the one
//! transactional write: the version row, the replaced reference-edge set
//! and the meta's latest-version pointer commit together or not at all.

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use canvasflow_core::error::WorkflowError;
use canvasflow_core::mode::WorkflowMode;
use canvasflow_core::refs::ReferenceEdge;

use crate::entities::{
    ChatFlowRole, ConnectorBinding, ConvRelatedInfo, Draft, Page, Version, WorkflowMeta,
};

/// Filter for meta listings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetaFilter {
    pub ids: Option<Vec<i64>>,
    pub space_id: Option<i64>,
    pub app_id: Option<i64>,
    pub mode: Option<WorkflowMode>,
    pub name_keyword: Option<String>,
    pub published_only: bool,
    pub page: Option<Page>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WorkflowRepository: Send + Sync {
    // -- meta ---------------------------------------------------------------

    async fn create_meta(&self, meta: &WorkflowMeta) -> Result<(), WorkflowError>;

    /// `None` for unknown or soft-deleted ids.
    async fn get_meta(&self, workflow_id: i64) -> Result<Option<WorkflowMeta>, WorkflowError>;

    async fn update_meta(&self, meta: &WorkflowMeta) -> Result<(), WorkflowError>;

    /// Matching metas plus the total count before pagination.
    async fn list_metas(
        &self,
        filter: &MetaFilter,
    ) -> Result<(Vec<WorkflowMeta>, usize), WorkflowError>;

    async fn soft_delete(&self, workflow_ids: &[i64]) -> Result<Vec<i64>, WorkflowError>;

    // -- draft --------------------------------------------------------------

    async fn upsert_draft(&self, draft: &Draft) -> Result<(), WorkflowError>;

    async fn get_draft(&self, workflow_id: i64) -> Result<Option<Draft>, WorkflowError>;

    async fn set_test_run_success(
        &self,
        workflow_id: i64,
        success: bool,
    ) -> Result<(), WorkflowError>;

    // -- versions + references (transactional) ------------------------------

    /// Insert the version, atomically replace the reference edges of
    /// `(version.workflow_id, Workflow)` and advance
    /// `latest_published_version`.
    async fn publish(
        &self,
        version: &Version,
        references: &BTreeSet<ReferenceEdge>,
    ) -> Result<(), WorkflowError>;

    async fn get_version(
        &self,
        workflow_id: i64,
        version: &str,
    ) -> Result<Option<Version>, WorkflowError>;

    /// Edges where the given workflow is the referring side.
    async fn references_from(
        &self,
        workflow_id: i64,
    ) -> Result<Vec<ReferenceEdge>, WorkflowError>;

    /// Edges where the given workflow is the referred side.
    async fn references_to(&self, workflow_id: i64) -> Result<Vec<ReferenceEdge>, WorkflowError>;

    // -- connector bindings --------------------------------------------------

    async fn bind_connector(&self, binding: &ConnectorBinding) -> Result<(), WorkflowError>;

    async fn connector_bindings(
        &self,
        app_id: i64,
    ) -> Result<Vec<ConnectorBinding>, WorkflowError>;

    // -- chat role -----------------------------------------------------------

    async fn save_role(&self, role: &ChatFlowRole) -> Result<(), WorkflowError>;

    /// Draft role for `version == None`, else the snapshot taken at that
    /// publish.
    async fn get_role<'a>(
        &self,
        workflow_id: i64,
        version: Option<&'a str>,
    ) -> Result<Option<ChatFlowRole>, WorkflowError>;

    /// Snapshot the current draft role under the version string.
    async fn snapshot_role(&self, workflow_id: i64, version: &str) -> Result<(), WorkflowError>;

    // -- conversation binding ------------------------------------------------

    async fn bind_conv_info(&self, info: &ConvRelatedInfo) -> Result<(), WorkflowError>;

    async fn get_conv_info(
        &self,
        workflow_id: i64,
        connector_id: i64,
    ) -> Result<Option<ConvRelatedInfo>, WorkflowError>;
}

/// Monotonic 64-bit id source for workflow ids and draft commit ids.
pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> i64;
}

/// Resource-change notifications published on create/publish/delete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ResourceChangeEvent {
    WorkflowCreated { workflow_id: i64 },
    WorkflowPublished { workflow_id: i64, version: String },
    WorkflowsDeleted { workflow_ids: Vec<i64> },
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, event: ResourceChangeEvent) -> Result<(), WorkflowError>;
}

/// Event bus that drops everything; the default where no broker is wired.
pub struct NoopEventBus;

#[async_trait]
impl EventBus for NoopEventBus {
    async fn publish(&self, _event: ResourceChangeEvent) -> Result<(), WorkflowError> {
        Ok(())
    }
}
