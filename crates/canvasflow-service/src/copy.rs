//! Cross-scope workflow movement: in-place copy, app → library extraction,
//! app duplication, whole-app release and related-resource sync.
//!
//! All of these rewrite canvases through [`rewrite_canvas`]: sub-workflow
//! references, LLM tool references and external resource ids are remapped
//! with an [`ExternalResourceRelated`] table before the rewritten canvas is
//! saved under the new owner.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use serde_json::Value;
use tracing::info;

use canvasflow_core::canvas::{Canvas, CanvasNode};
use canvasflow_core::error::WorkflowError;
use canvasflow_core::node_type::NodeType;
use canvasflow_core::refs::sub_workflow_targets;
use canvasflow_core::validate::ValidateTreeInfo;

use crate::entities::{
    ConnectorBinding, DeletePolicy, ExternalResourceRelated, GetPolicy, GetSelector,
    PublishPolicy, ReleaseConfig, Workflow, WorkflowMeta,
};
use crate::repository::{MetaFilter, ResourceChangeEvent};
use crate::service::WorkflowService;

/// The version every library copy is published at.
const INITIAL_VERSION: &str = "v0.0.1";

impl WorkflowService {
    /// Copy a single workflow inside its space: fresh id, `name_suffix`
    /// appended, draft state duplicated (test-run flag reset by the save
    /// path since the copy has no prior draft).
    pub async fn copy_workflow(
        &self,
        workflow_id: i64,
        name_suffix: &str,
    ) -> Result<Workflow, WorkflowError> {
        let source = self
            .get(GetPolicy {
                workflow_id,
                selector: GetSelector::Draft,
                meta_only: false,
            })
            .await?;

        let new_id = self.ids.next_id();
        let now = Utc::now();
        let meta = WorkflowMeta {
            id: new_id,
            name: format!("{}{}", source.meta.name, name_suffix),
            latest_published_version: None,
            created_at: now,
            updated_at: now,
            ..source.meta.clone()
        };
        self.repo.create_meta(&meta).await?;
        self.save(
            new_id,
            source
                .canvas_json
                .as_deref()
                .ok_or_else(|| WorkflowError::not_found(workflow_id, None))?,
        )
        .await?;
        if source.meta.mode.is_chat() {
            if let Some(mut role) = self.repo.get_role(workflow_id, None).await? {
                role.workflow_id = new_id;
                self.repo.save_role(&role).await?;
            }
        }
        self.events
            .publish(ResourceChangeEvent::WorkflowCreated { workflow_id: new_id })
            .await?;

        self.get(GetPolicy {
            workflow_id: new_id,
            selector: GetSelector::Draft,
            meta_only: false,
        })
        .await
    }

    /// Extract a workflow (and its app-scoped sub-workflow closure) from an
    /// app into the library. The whole closure validates first; the copies
    /// are created children-before-parents, reference-rewritten through the
    /// produced id map and published at `v0.0.1`.
    ///
    /// Returns the new root id and the id map, or the blocking issues.
    pub async fn copy_workflow_from_app_to_library(
        &self,
        workflow_id: i64,
        app_id: i64,
        related: &ExternalResourceRelated,
    ) -> Result<Result<(i64, HashMap<i64, i64>), Vec<ValidateTreeInfo>>, WorkflowError> {
        let closure = self.app_scoped_closure(workflow_id, app_id).await?;

        let mut issues = Vec::new();
        for &member in &closure {
            issues.extend(self.validate_tree(member).await?);
        }
        if WorkflowService::has_blocking_issues(&issues) {
            return Ok(Err(issues));
        }

        let mut id_map: HashMap<i64, i64> = HashMap::new();
        for &old_id in &closure {
            id_map.insert(old_id, self.ids.next_id());
        }

        // The closure is post-ordered (children before parents), so every
        // published copy only references already-published copies.
        for &old_id in &closure {
            let new_id = id_map[&old_id];
            let source = self
                .get(GetPolicy {
                    workflow_id: old_id,
                    selector: GetSelector::Draft,
                    meta_only: false,
                })
                .await?;

            let mut canvas = Canvas::from_json(
                source
                    .canvas_json
                    .as_deref()
                    .ok_or_else(|| WorkflowError::not_found(old_id, None))?,
            )?;
            let mut effective = related.clone();
            effective.workflow_ids.extend(id_map.iter().map(|(k, v)| (*k, *v)));
            rewrite_canvas(&mut canvas, &effective, Some(INITIAL_VERSION));

            let now = Utc::now();
            let meta = WorkflowMeta {
                id: new_id,
                app_id: None,
                latest_published_version: None,
                created_at: now,
                updated_at: now,
                ..source.meta.clone()
            };
            self.repo.create_meta(&meta).await?;
            self.save(new_id, &canvas.to_json()?).await?;
            if source.meta.mode.is_chat() {
                if let Some(mut role) = self.repo.get_role(old_id, None).await? {
                    role.workflow_id = new_id;
                    self.repo.save_role(&role).await?;
                }
            }
            self.publish(PublishPolicy {
                workflow_id: new_id,
                version: INITIAL_VERSION.to_string(),
                description: "copied to library".to_string(),
                creator_id: source.meta.creator_id,
                force: true,
            })
            .await?;
        }

        let new_root = id_map[&workflow_id];
        info!(workflow_id, new_root, members = closure.len(), "copied workflow to library");
        Ok(Ok((new_root, id_map)))
    }

    /// Duplicate every workflow of `src_app` into `dst_app`, rewriting
    /// mutual references through the allocated id map.
    pub async fn duplicate_workflows_by_app_id(
        &self,
        src_app: i64,
        dst_app: i64,
        related: &ExternalResourceRelated,
    ) -> Result<Vec<Workflow>, WorkflowError> {
        let (metas, _) = self
            .repo
            .list_metas(&MetaFilter {
                app_id: Some(src_app),
                ..Default::default()
            })
            .await?;

        let mut id_map: HashMap<i64, i64> = HashMap::new();
        for meta in &metas {
            id_map.insert(meta.id, self.ids.next_id());
        }

        let mut copies = Vec::with_capacity(metas.len());
        for meta in &metas {
            let source = self
                .get(GetPolicy {
                    workflow_id: meta.id,
                    selector: GetSelector::Draft,
                    meta_only: false,
                })
                .await?;
            let mut canvas = Canvas::from_json(
                source
                    .canvas_json
                    .as_deref()
                    .ok_or_else(|| WorkflowError::not_found(meta.id, None))?,
            )?;
            let mut effective = related.clone();
            effective.workflow_ids.extend(id_map.iter().map(|(k, v)| (*k, *v)));
            // Duplicated drafts reference sibling drafts, not versions.
            rewrite_canvas(&mut canvas, &effective, None);

            let new_id = id_map[&meta.id];
            let now = Utc::now();
            let copy_meta = WorkflowMeta {
                id: new_id,
                app_id: Some(dst_app),
                latest_published_version: None,
                created_at: now,
                updated_at: now,
                ..meta.clone()
            };
            self.repo.create_meta(&copy_meta).await?;
            self.save(new_id, &canvas.to_json()?).await?;
            if meta.mode.is_chat() {
                if let Some(mut role) = self.repo.get_role(meta.id, None).await? {
                    role.workflow_id = new_id;
                    self.repo.save_role(&role).await?;
                }
            }
            copies.push(
                self.get(GetPolicy {
                    workflow_id: new_id,
                    selector: GetSelector::Draft,
                    meta_only: false,
                })
                .await?,
            );
        }
        Ok(copies)
    }

    /// Release every workflow of an app: validate all of them, rewrite
    /// external resource ids, publish the shared version string, publish
    /// chat roles, and record one connector binding per channel.
    ///
    /// Returns the blocking issues; an empty list means the release went
    /// through.
    pub async fn release_application_workflows(
        &self,
        app_id: i64,
        config: &ReleaseConfig,
    ) -> Result<Vec<ValidateTreeInfo>, WorkflowError> {
        let (metas, _) = self
            .repo
            .list_metas(&MetaFilter {
                app_id: Some(app_id),
                ..Default::default()
            })
            .await?;

        let mut issues = Vec::new();
        for meta in &metas {
            issues.extend(self.validate_tree(meta.id).await?);
        }
        if WorkflowService::has_blocking_issues(&issues) {
            return Ok(issues);
        }

        for meta in &metas {
            if !config.related.is_empty() {
                let draft = self
                    .get(GetPolicy {
                        workflow_id: meta.id,
                        selector: GetSelector::Draft,
                        meta_only: false,
                    })
                    .await?;
                if let Some(canvas_json) = draft.canvas_json.as_deref() {
                    let mut canvas = Canvas::from_json(canvas_json)?;
                    rewrite_canvas(&mut canvas, &config.related, None);
                    self.save(meta.id, &canvas.to_json()?).await?;
                }
            }
            self.publish(PublishPolicy {
                workflow_id: meta.id,
                version: config.version.clone(),
                description: format!("app {app_id} release"),
                creator_id: config.creator_id,
                force: true,
            })
            .await?;
            for &connector_id in &config.connector_ids {
                self.repo
                    .bind_connector(&ConnectorBinding {
                        app_id,
                        connector_id,
                        workflow_id: meta.id,
                        version: config.version.clone(),
                    })
                    .await?;
            }
        }
        info!(app_id, version = %config.version, count = metas.len(), "application workflows released");
        Ok(Vec::new())
    }

    /// Rewrite resource references of the app workflows that were *not*
    /// individually remapped (`related_map` names the already-handled ones)
    /// and mint fresh draft commits for them, test-run flag reset.
    pub async fn sync_related_workflow_resources(
        &self,
        app_id: i64,
        related_map: &HashMap<i64, i64>,
        related: &ExternalResourceRelated,
    ) -> Result<(), WorkflowError> {
        let (metas, _) = self
            .repo
            .list_metas(&MetaFilter {
                app_id: Some(app_id),
                ..Default::default()
            })
            .await?;
        for meta in metas {
            if related_map.contains_key(&meta.id) {
                continue;
            }
            let Some(draft) = self.repo.get_draft(meta.id).await? else {
                continue;
            };
            let mut canvas = Canvas::from_json(&draft.canvas_json)?;
            rewrite_canvas(&mut canvas, related, None);
            self.save(meta.id, &canvas.to_json()?).await?;
            // Rewritten references invalidate any prior test run even when
            // the ids happened to map onto an equivalent schema.
            self.repo.set_test_run_success(meta.id, false).await?;
        }
        Ok(())
    }

    /// Delete every workflow of an app. Convenience over [`Self::delete`].
    pub async fn delete_app_workflows(&self, app_id: i64) -> Result<Vec<i64>, WorkflowError> {
        self.delete(DeletePolicy::ByAppId(app_id)).await
    }

    /// The sub-workflow closure of `root`, restricted to workflows of the
    /// app, in post-order: children before parents, the root last. Shared
    /// children (diamonds) appear once.
    async fn app_scoped_closure(
        &self,
        root: i64,
        app_id: i64,
    ) -> Result<Vec<i64>, WorkflowError> {
        enum Frame {
            Enter(i64),
            Exit(i64),
        }

        let mut order = Vec::new();
        let mut seen: HashSet<i64> = HashSet::new();
        let mut stack = vec![Frame::Enter(root)];
        while let Some(frame) = stack.pop() {
            match frame {
                Frame::Enter(id) => {
                    if !seen.insert(id) {
                        continue;
                    }
                    stack.push(Frame::Exit(id));
                    let Some(draft) = self.repo.get_draft(id).await? else {
                        continue;
                    };
                    let canvas = Canvas::from_json(&draft.canvas_json)?;
                    for (target, _) in sub_workflow_targets(&canvas) {
                        let in_app = self
                            .repo
                            .get_meta(target)
                            .await?
                            .is_some_and(|m| m.app_id == Some(app_id));
                        if in_app && !seen.contains(&target) {
                            stack.push(Frame::Enter(target));
                        }
                    }
                }
                Frame::Exit(id) => order.push(id),
            }
        }
        Ok(order)
    }
}

/// Remap every cross-resource reference of a canvas in place. When
/// `pinned_version` is set, remapped sub-workflow references are pinned to
/// it (library copies are addressed by their initial published version).
pub fn rewrite_canvas(
    canvas: &mut Canvas,
    related: &ExternalResourceRelated,
    pinned_version: Option<&str>,
) {
    fn rewrite_nodes(
        nodes: &mut [CanvasNode],
        related: &ExternalResourceRelated,
        pinned_version: Option<&str>,
    ) {
        for node in nodes {
            rewrite_node(node, related, pinned_version);
            rewrite_nodes(&mut node.blocks, related, pinned_version);
        }
    }
    rewrite_nodes(&mut canvas.nodes, related, pinned_version);
}

fn rewrite_node(
    node: &mut CanvasNode,
    related: &ExternalResourceRelated,
    pinned_version: Option<&str>,
) {
    let configs = &mut node.data.configs;
    match NodeType::parse(&node.node_type) {
        Some(NodeType::SubWorkflow) => {
            if let Some(new_id) = remap(configs.get("workflow_id"), &related.workflow_ids) {
                configs["workflow_id"] = Value::from(new_id);
                if let Some(version) = pinned_version {
                    configs["version"] = Value::from(version);
                }
            }
        }
        Some(NodeType::Llm) => {
            if let Some(tools) = configs.get_mut("tools").and_then(Value::as_array_mut) {
                for tool in tools {
                    if let Some(new_id) = remap(tool.get("workflow_id"), &related.workflow_ids) {
                        tool["workflow_id"] = Value::from(new_id);
                        if let Some(version) = pinned_version {
                            tool["version"] = Value::from(version);
                        }
                    }
                    if let Some(new_id) = remap(tool.get("plugin_id"), &related.plugin_ids) {
                        tool["plugin_id"] = Value::from(new_id);
                    }
                    if let Some(new_id) = remap(tool.get("tool_id"), &related.plugin_tool_ids) {
                        tool["tool_id"] = Value::from(new_id);
                    }
                }
            }
        }
        Some(NodeType::Plugin) => {
            if let Some(new_id) = remap(configs.get("plugin_id"), &related.plugin_ids) {
                configs["plugin_id"] = Value::from(new_id);
            }
            if let Some(new_id) = remap(configs.get("tool_id"), &related.plugin_tool_ids) {
                configs["tool_id"] = Value::from(new_id);
            }
        }
        Some(NodeType::KnowledgeIndexer) | Some(NodeType::KnowledgeDeleter) => {
            if let Some(new_id) = remap(configs.get("knowledge_id"), &related.knowledge_ids) {
                configs["knowledge_id"] = Value::from(new_id);
            }
        }
        Some(NodeType::KnowledgeRetriever) => {
            if let Some(ids) = configs.get_mut("knowledge_ids").and_then(Value::as_array_mut) {
                for id in ids {
                    if let Some(new_id) = remap(Some(id), &related.knowledge_ids) {
                        *id = Value::from(new_id);
                    }
                }
            }
        }
        Some(
            NodeType::DatabaseInsert
            | NodeType::DatabaseUpdate
            | NodeType::DatabaseQuery
            | NodeType::DatabaseDelete
            | NodeType::DatabaseCustomSql,
        ) => {
            if let Some(new_id) = remap(configs.get("database_id"), &related.database_ids) {
                configs["database_id"] = Value::from(new_id);
            }
        }
        _ => {}
    }
}

fn remap(raw: Option<&Value>, table: &HashMap<i64, i64>) -> Option<i64> {
    raw.and_then(Value::as_i64).and_then(|id| table.get(&id).copied())
}
