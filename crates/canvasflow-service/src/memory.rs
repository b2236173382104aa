//! In-memory repository.
//!
//! Backs tests and single-process deployments. Tables are maps behind one
//! `RwLock` so the transactional `publish` is trivially atomic: the whole
//! store locks for the duration of the write.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use canvasflow_core::error::WorkflowError;
use canvasflow_core::refs::{ReferenceEdge, ReferringBizType};

use crate::entities::{
    ChatFlowRole, ConnectorBinding, ConvRelatedInfo, Draft, Version, WorkflowMeta,
};
use crate::repository::{IdGenerator, MetaFilter, WorkflowRepository};

#[derive(Default)]
struct Tables {
    metas: HashMap<i64, WorkflowMeta>,
    drafts: HashMap<i64, Draft>,
    versions: HashMap<(i64, String), Version>,
    references: BTreeSet<ReferenceEdge>,
    bindings: Vec<ConnectorBinding>,
    draft_roles: HashMap<i64, ChatFlowRole>,
    version_roles: HashMap<(i64, String), ChatFlowRole>,
    conv_infos: HashMap<(i64, i64), ConvRelatedInfo>,
}

#[derive(Default)]
pub struct MemoryRepository {
    tables: RwLock<Tables>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowRepository for MemoryRepository {
    async fn create_meta(&self, meta: &WorkflowMeta) -> Result<(), WorkflowError> {
        let mut tables = self.tables.write().await;
        if tables.metas.contains_key(&meta.id) {
            return Err(WorkflowError::operation(format!(
                "workflow {} already exists",
                meta.id
            )));
        }
        tables.metas.insert(meta.id, meta.clone());
        Ok(())
    }

    async fn get_meta(&self, workflow_id: i64) -> Result<Option<WorkflowMeta>, WorkflowError> {
        let tables = self.tables.read().await;
        Ok(tables
            .metas
            .get(&workflow_id)
            .filter(|m| m.deleted_at.is_none())
            .cloned())
    }

    async fn update_meta(&self, meta: &WorkflowMeta) -> Result<(), WorkflowError> {
        let mut tables = self.tables.write().await;
        if !tables.metas.contains_key(&meta.id) {
            return Err(WorkflowError::not_found(meta.id, None));
        }
        tables.metas.insert(meta.id, meta.clone());
        Ok(())
    }

    async fn list_metas(
        &self,
        filter: &MetaFilter,
    ) -> Result<(Vec<WorkflowMeta>, usize), WorkflowError> {
        let tables = self.tables.read().await;
        let mut matching: Vec<WorkflowMeta> = tables
            .metas
            .values()
            .filter(|m| m.deleted_at.is_none())
            .filter(|m| filter.ids.as_ref().is_none_or(|ids| ids.contains(&m.id)))
            .filter(|m| filter.space_id.is_none_or(|s| m.space_id == s))
            .filter(|m| filter.app_id.is_none_or(|a| m.app_id == Some(a)))
            .filter(|m| filter.mode.is_none_or(|mode| m.mode == mode))
            .filter(|m| {
                filter
                    .name_keyword
                    .as_deref()
                    .is_none_or(|kw| m.name.contains(kw))
            })
            .filter(|m| !filter.published_only || m.latest_published_version.is_some())
            .cloned()
            .collect();
        matching.sort_by_key(|m| m.id);
        let total = matching.len();
        if let Some(page) = filter.page {
            matching = matching
                .into_iter()
                .skip(page.offset as usize)
                .take(page.limit as usize)
                .collect();
        }
        Ok((matching, total))
    }

    async fn soft_delete(&self, workflow_ids: &[i64]) -> Result<Vec<i64>, WorkflowError> {
        let mut tables = self.tables.write().await;
        let now = Utc::now();
        let mut deleted = Vec::new();
        for id in workflow_ids {
            if let Some(meta) = tables.metas.get_mut(id) {
                if meta.deleted_at.is_none() {
                    meta.deleted_at = Some(now);
                    deleted.push(*id);
                }
            }
        }
        // Soft-delete cascades logically: reference edges from deleted
        // workflows stop resolving.
        tables
            .references
            .retain(|e| !deleted.contains(&e.referring_id));
        Ok(deleted)
    }

    async fn upsert_draft(&self, draft: &Draft) -> Result<(), WorkflowError> {
        let mut tables = self.tables.write().await;
        tables.drafts.insert(draft.workflow_id, draft.clone());
        Ok(())
    }

    async fn get_draft(&self, workflow_id: i64) -> Result<Option<Draft>, WorkflowError> {
        let tables = self.tables.read().await;
        Ok(tables.drafts.get(&workflow_id).cloned())
    }

    async fn set_test_run_success(
        &self,
        workflow_id: i64,
        success: bool,
    ) -> Result<(), WorkflowError> {
        let mut tables = self.tables.write().await;
        let draft = tables
            .drafts
            .get_mut(&workflow_id)
            .ok_or_else(|| WorkflowError::not_found(workflow_id, None))?;
        draft.test_run_success = success;
        draft.updated_at = Utc::now();
        Ok(())
    }

    async fn publish(
        &self,
        version: &Version,
        references: &BTreeSet<ReferenceEdge>,
    ) -> Result<(), WorkflowError> {
        let mut tables = self.tables.write().await;
        let key = (version.workflow_id, version.version.clone());
        if tables.versions.contains_key(&key) {
            return Err(WorkflowError::operation(format!(
                "version {} of workflow {} already exists",
                version.version, version.workflow_id
            )));
        }
        let meta = tables
            .metas
            .get_mut(&version.workflow_id)
            .ok_or_else(|| WorkflowError::not_found(version.workflow_id, None))?;
        meta.latest_published_version = Some(version.version.clone());
        meta.updated_at = Utc::now();

        tables.versions.insert(key, version.clone());
        tables.references.retain(|e| {
            !(e.referring_id == version.workflow_id
                && e.referring_biz_type == ReferringBizType::Workflow)
        });
        tables.references.extend(references.iter().cloned());

        if let Some(draft) = tables.drafts.get_mut(&version.workflow_id) {
            draft.modified = false;
        }
        Ok(())
    }

    async fn get_version(
        &self,
        workflow_id: i64,
        version: &str,
    ) -> Result<Option<Version>, WorkflowError> {
        let tables = self.tables.read().await;
        Ok(tables
            .versions
            .get(&(workflow_id, version.to_string()))
            .cloned())
    }

    async fn references_from(
        &self,
        workflow_id: i64,
    ) -> Result<Vec<ReferenceEdge>, WorkflowError> {
        let tables = self.tables.read().await;
        Ok(tables
            .references
            .iter()
            .filter(|e| e.referring_id == workflow_id)
            .cloned()
            .collect())
    }

    async fn references_to(&self, workflow_id: i64) -> Result<Vec<ReferenceEdge>, WorkflowError> {
        let tables = self.tables.read().await;
        Ok(tables
            .references
            .iter()
            .filter(|e| e.referred_id == workflow_id)
            .cloned()
            .collect())
    }

    async fn bind_connector(&self, binding: &ConnectorBinding) -> Result<(), WorkflowError> {
        let mut tables = self.tables.write().await;
        tables.bindings.retain(|b| {
            !(b.app_id == binding.app_id
                && b.connector_id == binding.connector_id
                && b.workflow_id == binding.workflow_id)
        });
        tables.bindings.push(binding.clone());
        Ok(())
    }

    async fn connector_bindings(
        &self,
        app_id: i64,
    ) -> Result<Vec<ConnectorBinding>, WorkflowError> {
        let tables = self.tables.read().await;
        Ok(tables
            .bindings
            .iter()
            .filter(|b| b.app_id == app_id)
            .cloned()
            .collect())
    }

    async fn save_role(&self, role: &ChatFlowRole) -> Result<(), WorkflowError> {
        let mut tables = self.tables.write().await;
        tables.draft_roles.insert(role.workflow_id, role.clone());
        Ok(())
    }

    async fn get_role(
        &self,
        workflow_id: i64,
        version: Option<&str>,
    ) -> Result<Option<ChatFlowRole>, WorkflowError> {
        let tables = self.tables.read().await;
        Ok(match version {
            None => tables.draft_roles.get(&workflow_id).cloned(),
            Some(v) => tables
                .version_roles
                .get(&(workflow_id, v.to_string()))
                .cloned(),
        })
    }

    async fn snapshot_role(&self, workflow_id: i64, version: &str) -> Result<(), WorkflowError> {
        let mut tables = self.tables.write().await;
        if let Some(role) = tables.draft_roles.get(&workflow_id).cloned() {
            tables
                .version_roles
                .insert((workflow_id, version.to_string()), role);
        }
        Ok(())
    }

    async fn bind_conv_info(&self, info: &ConvRelatedInfo) -> Result<(), WorkflowError> {
        let mut tables = self.tables.write().await;
        tables
            .conv_infos
            .insert((info.workflow_id, info.connector_id), info.clone());
        Ok(())
    }

    async fn get_conv_info(
        &self,
        workflow_id: i64,
        connector_id: i64,
    ) -> Result<Option<ConvRelatedInfo>, WorkflowError> {
        let tables = self.tables.read().await;
        Ok(tables
            .conv_infos
            .get(&(workflow_id, connector_id))
            .cloned())
    }
}

/// Process-local monotonic ids, seeded high enough to stay clear of the
/// fixture ids tests hand-pick.
pub struct SequentialIdGenerator {
    next: AtomicI64,
}

impl SequentialIdGenerator {
    pub fn new() -> Self {
        Self::starting_at(7_000_000)
    }

    pub fn starting_at(first: i64) -> Self {
        Self {
            next: AtomicI64::new(first),
        }
    }
}

impl Default for SequentialIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdGenerator for SequentialIdGenerator {
    fn next_id(&self) -> i64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }
}
