//! # Workflow Domain Service
//!
//! The single entry point the application layer talks to. It composes the
//! repository, id generator, event bus, resource resolver, compiled-schema
//! cache and (optionally) the execution runtime, and implements the
//! draft/version lifecycle on top of the core compiler.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, warn};

use canvasflow_core::canvas::{self, Canvas};
use canvasflow_core::compile::{CanvasCompiler, SubWorkflowLoader};
use canvasflow_core::error::WorkflowError;
use canvasflow_core::mode::WorkflowMode;
use canvasflow_core::node_type::{node_catalog, NodeCategory, NodeMetaInfo};
use canvasflow_core::refs::canvas_to_refs;
use canvasflow_core::schema::{ProcessType, WorkflowSchema};
use canvasflow_core::validate::{
    check_resources, schema_check, validate_tree, AllowAllResources, CheckResult, CheckType,
    ResourceResolver, Severity, ValidateTreeInfo,
};
use canvasflow_core::version::ensure_monotonic;
use canvasflow_runtime::context::ExecutionContext;
use canvasflow_runtime::scheduler::{ExecutionOutcome, WorkflowExecutor};

use crate::cache::SchemaCache;
use crate::entities::{
    ChatFlowRole, ConvRelatedInfo, DeletePolicy, DependenceResource, Draft, GetPolicy,
    GetSelector, MGetPolicy, NodeProperty, PublishPolicy, Version, Workflow, WorkflowMeta,
};
use crate::memory::SequentialIdGenerator;
use crate::repository::{
    EventBus, IdGenerator, MetaFilter, NoopEventBus, ResourceChangeEvent, WorkflowRepository,
};

/// Parameters for creating a workflow.
#[derive(Debug, Clone)]
pub struct CreateWorkflowRequest {
    pub space_id: i64,
    pub app_id: Option<i64>,
    pub name: String,
    pub desc: String,
    pub icon: String,
    pub mode: WorkflowMode,
    pub creator_id: i64,
}

pub struct WorkflowService {
    pub(crate) repo: Arc<dyn WorkflowRepository>,
    pub(crate) ids: Arc<dyn IdGenerator>,
    pub(crate) events: Arc<dyn EventBus>,
    resources: Arc<dyn ResourceResolver>,
    cache: SchemaCache,
    runner: Option<WorkflowExecutor>,
}

pub struct WorkflowServiceBuilder {
    repo: Arc<dyn WorkflowRepository>,
    ids: Arc<dyn IdGenerator>,
    events: Arc<dyn EventBus>,
    resources: Arc<dyn ResourceResolver>,
    runner: Option<WorkflowExecutor>,
}

impl WorkflowService {
    pub fn builder(repo: Arc<dyn WorkflowRepository>) -> WorkflowServiceBuilder {
        WorkflowServiceBuilder {
            repo,
            ids: Arc::new(SequentialIdGenerator::new()),
            events: Arc::new(NoopEventBus),
            resources: Arc::new(AllowAllResources),
            runner: None,
        }
    }

    fn compiler(&self) -> CanvasCompiler {
        CanvasCompiler::new(Arc::new(RepoLoader {
            repo: Arc::clone(&self.repo),
        }))
    }

    async fn meta_or_not_found(&self, workflow_id: i64) -> Result<WorkflowMeta, WorkflowError> {
        self.repo
            .get_meta(workflow_id)
            .await?
            .ok_or_else(|| WorkflowError::not_found(workflow_id, None))
    }

    async fn draft_or_not_found(&self, workflow_id: i64) -> Result<Draft, WorkflowError> {
        self.repo
            .get_draft(workflow_id)
            .await?
            .ok_or_else(|| WorkflowError::not_found(workflow_id, None))
    }

    /// Compile the current draft, reading through the schema cache.
    pub async fn compile_draft(
        &self,
        workflow_id: i64,
    ) -> Result<(Arc<WorkflowSchema>, Draft), WorkflowError> {
        let draft = self.draft_or_not_found(workflow_id).await?;
        if let Some(schema) = self.cache.get(workflow_id, draft.commit_id) {
            return Ok((schema, draft));
        }
        let canvas = Canvas::from_json(&draft.canvas_json)?;
        let schema = Arc::new(self.compiler().compile(&canvas).await?);
        self.cache.put(workflow_id, draft.commit_id, Arc::clone(&schema));
        Ok((schema, draft))
    }

    // -- palette -------------------------------------------------------------

    /// The node palette, grouped by category. `filter` narrows to one
    /// category.
    pub fn list_node_meta(
        &self,
        filter: Option<NodeCategory>,
    ) -> (BTreeMap<NodeCategory, Vec<NodeMetaInfo>>, Vec<NodeCategory>) {
        let mut grouped: BTreeMap<NodeCategory, Vec<NodeMetaInfo>> = BTreeMap::new();
        for info in node_catalog() {
            if !info.listable {
                continue;
            }
            if filter.is_some_and(|f| f != info.category) {
                continue;
            }
            grouped.entry(info.category).or_default().push(info);
        }
        let categories = grouped.keys().copied().collect();
        (grouped, categories)
    }

    // -- lifecycle -----------------------------------------------------------

    pub async fn create(&self, request: CreateWorkflowRequest) -> Result<i64, WorkflowError> {
        if request.name.trim().is_empty() {
            return Err(WorkflowError::invalid_parameter("workflow name must not be empty"));
        }
        let now = Utc::now();
        let meta = WorkflowMeta {
            id: self.ids.next_id(),
            space_id: request.space_id,
            app_id: request.app_id,
            name: request.name,
            desc: request.desc,
            icon: request.icon,
            mode: request.mode,
            creator_id: request.creator_id,
            latest_published_version: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        self.repo.create_meta(&meta).await?;

        let initial = match meta.mode {
            WorkflowMode::ChatFlow => canvas::initial_chat_canvas(),
            WorkflowMode::Workflow => canvas::initial_canvas(),
        };
        self.save(meta.id, &initial.to_json()?).await?;

        self.events
            .publish(ResourceChangeEvent::WorkflowCreated { workflow_id: meta.id })
            .await?;
        info!(workflow_id = meta.id, "workflow created");
        Ok(meta.id)
    }

    /// Persist a new draft state. Parameter extraction is best-effort;
    /// `test_run_success` is inherited when the compiled schema did not
    /// change, reset otherwise.
    pub async fn save(&self, workflow_id: i64, canvas_json: &str) -> Result<Draft, WorkflowError> {
        self.meta_or_not_found(workflow_id).await?;
        let canvas = Canvas::from_json(canvas_json)?;

        let (input_params, output_params) = extract_io_params(&canvas);

        let previous = self.repo.get_draft(workflow_id).await?;
        let test_run_success = self
            .inherit_or_reset(&canvas, previous.as_ref())
            .await;

        let draft = Draft {
            workflow_id,
            canvas_json: canvas.to_json()?,
            input_params,
            output_params,
            commit_id: self.ids.next_id(),
            test_run_success,
            modified: true,
            updated_at: Utc::now(),
        };
        self.repo.upsert_draft(&draft).await?;
        debug!(workflow_id, commit_id = draft.commit_id, test_run_success, "draft saved");
        Ok(draft)
    }

    /// Inherit the previous test-run flag only when both canvases compile
    /// and the compiled schemas are execution-equivalent.
    async fn inherit_or_reset(&self, canvas: &Canvas, previous: Option<&Draft>) -> bool {
        let Some(previous) = previous else {
            return false;
        };
        if !previous.test_run_success {
            return false;
        }
        let compiler = self.compiler();
        let new_schema = match compiler.compile(canvas).await {
            Ok(schema) => schema,
            Err(e) => {
                debug!(%e, "new canvas does not compile; resetting test-run flag");
                return false;
            }
        };
        let old_canvas = match Canvas::from_json(&previous.canvas_json) {
            Ok(canvas) => canvas,
            Err(_) => return false,
        };
        let old_schema = match compiler.compile(&old_canvas).await {
            Ok(schema) => schema,
            Err(_) => return false,
        };
        new_schema.execution_equivalent(&old_schema)
    }

    /// Publish the draft as an immutable version. The version row and the
    /// re-derived reference edges commit atomically.
    pub async fn publish(&self, policy: PublishPolicy) -> Result<Version, WorkflowError> {
        let meta = self.meta_or_not_found(policy.workflow_id).await?;
        ensure_monotonic(&policy.version, meta.latest_published_version.as_deref())?;

        let draft = self.draft_or_not_found(policy.workflow_id).await?;
        if !policy.force && !draft.test_run_success {
            return Err(WorkflowError::TestRunRequired {
                workflow_id: policy.workflow_id,
            });
        }

        let canvas = Canvas::from_json(&draft.canvas_json)?;
        // Compilation recurses through sub-workflow references, so cyclic
        // reference graphs and missing targets surface here.
        let schema = self.compiler().compile(&canvas).await?;
        check_publishable_exceptions(&schema)?;

        let references = canvas_to_refs(policy.workflow_id, &canvas);
        let version = Version {
            workflow_id: policy.workflow_id,
            version: policy.version.clone(),
            canvas_json: draft.canvas_json.clone(),
            input_params: draft.input_params.clone(),
            output_params: draft.output_params.clone(),
            commit_id: draft.commit_id,
            creator_id: policy.creator_id,
            description: policy.description.clone(),
            created_at: Utc::now(),
        };
        self.repo.publish(&version, &references).await?;

        if meta.mode.is_chat() {
            self.repo
                .snapshot_role(policy.workflow_id, &policy.version)
                .await?;
        }
        self.cache.invalidate(policy.workflow_id);
        self.events
            .publish(ResourceChangeEvent::WorkflowPublished {
                workflow_id: policy.workflow_id,
                version: policy.version.clone(),
            })
            .await?;
        info!(workflow_id = policy.workflow_id, version = %policy.version, "workflow published");
        Ok(version)
    }

    pub async fn delete(&self, policy: DeletePolicy) -> Result<Vec<i64>, WorkflowError> {
        let ids = match policy {
            DeletePolicy::ById(id) => vec![id],
            DeletePolicy::ByIds(ids) => ids,
            DeletePolicy::ByAppId(app_id) => {
                let (metas, _) = self
                    .repo
                    .list_metas(&MetaFilter {
                        app_id: Some(app_id),
                        ..Default::default()
                    })
                    .await?;
                metas.into_iter().map(|m| m.id).collect()
            }
        };
        let deleted = self.repo.soft_delete(&ids).await?;
        for id in &deleted {
            self.cache.invalidate(*id);
        }
        if !deleted.is_empty() {
            self.events
                .publish(ResourceChangeEvent::WorkflowsDeleted {
                    workflow_ids: deleted.clone(),
                })
                .await?;
        }
        Ok(deleted)
    }

    // -- reads ---------------------------------------------------------------

    pub async fn get(&self, policy: GetPolicy) -> Result<Workflow, WorkflowError> {
        let meta = self.meta_or_not_found(policy.workflow_id).await?;
        if policy.meta_only {
            return Ok(meta_only(meta));
        }
        self.assemble(meta, &policy.selector).await
    }

    pub async fn mget(&self, policy: MGetPolicy) -> Result<(Vec<Workflow>, usize), WorkflowError> {
        let filter = MetaFilter {
            ids: policy.ids.clone(),
            space_id: policy.space_id,
            app_id: policy.app_id,
            mode: policy.mode,
            name_keyword: policy.name_keyword.clone(),
            published_only: policy.published_only,
            page: policy.page,
        };
        let (metas, total) = self.repo.list_metas(&filter).await?;
        let mut workflows = Vec::with_capacity(metas.len());
        for meta in metas {
            if policy.meta_only {
                workflows.push(meta_only(meta));
                continue;
            }
            match self.assemble(meta.clone(), &policy.selector).await {
                Ok(workflow) => workflows.push(workflow),
                Err(e) => {
                    // Listings tolerate individual gaps (e.g. never-published
                    // workflows under a published selector).
                    warn!(workflow_id = meta.id, %e, "skipping canvas state in listing");
                    workflows.push(meta_only(meta));
                }
            }
        }
        Ok((workflows, total))
    }

    async fn assemble(
        &self,
        meta: WorkflowMeta,
        selector: &GetSelector,
    ) -> Result<Workflow, WorkflowError> {
        match selector {
            GetSelector::Draft => {
                let draft = self.draft_or_not_found(meta.id).await?;
                Ok(Workflow {
                    meta,
                    canvas_json: Some(draft.canvas_json),
                    commit_id: Some(draft.commit_id),
                    version: None,
                    input_params: draft.input_params,
                    output_params: draft.output_params,
                    test_run_success: Some(draft.test_run_success),
                })
            }
            GetSelector::Version(version) => {
                let row = self
                    .repo
                    .get_version(meta.id, version)
                    .await?
                    .ok_or_else(|| WorkflowError::not_found(meta.id, Some(version)))?;
                Ok(version_aggregate(meta, row))
            }
            GetSelector::LatestPublished => {
                let latest = meta
                    .latest_published_version
                    .clone()
                    .ok_or_else(|| WorkflowError::not_found(meta.id, Some("latest")))?;
                let row = self
                    .repo
                    .get_version(meta.id, &latest)
                    .await?
                    .ok_or_else(|| WorkflowError::not_found(meta.id, Some(&latest)))?;
                Ok(version_aggregate(meta, row))
            }
        }
    }

    // -- schema-derived reads ------------------------------------------------

    pub async fn query_node_properties(
        &self,
        workflow_id: i64,
    ) -> Result<HashMap<String, NodeProperty>, WorkflowError> {
        let (schema, _) = self.compile_draft(workflow_id).await?;
        Ok(schema
            .nodes
            .iter()
            .map(|node| {
                (
                    node.key.clone(),
                    NodeProperty {
                        node_type: node.node_type,
                        name: node.name.clone(),
                        sub_workflow: node.sub_workflow_basic.clone(),
                        input_types: node.input_types.clone(),
                        output_types: node.output_types.clone(),
                    },
                )
            })
            .collect())
    }

    /// Workflows that reference the given one (as sub-workflow or tool).
    pub async fn get_workflow_reference(
        &self,
        workflow_id: i64,
    ) -> Result<HashMap<i64, WorkflowMeta>, WorkflowError> {
        let edges = self.repo.references_to(workflow_id).await?;
        let mut referring = HashMap::new();
        for edge in edges {
            if let Some(meta) = self.repo.get_meta(edge.referring_id).await? {
                referring.insert(meta.id, meta);
            }
        }
        Ok(referring)
    }

    pub async fn get_dependence_resource(
        &self,
        workflow_id: i64,
    ) -> Result<DependenceResource, WorkflowError> {
        let (schema, _) = self.compile_draft(workflow_id).await?;
        let mut plugins = BTreeSet::new();
        let mut knowledge = BTreeSet::new();
        let mut databases = BTreeSet::new();
        for node in &schema.nodes {
            plugins.extend(node.configs.plugin_ids());
            knowledge.extend(node.configs.knowledge_ids());
            databases.extend(node.configs.database_ids());
        }
        Ok(DependenceResource {
            plugin_ids: plugins.into_iter().collect(),
            knowledge_ids: knowledge.into_iter().collect(),
            database_ids: databases.into_iter().collect(),
        })
    }

    pub async fn workflow_schema_check(
        &self,
        workflow_id: i64,
        checks: &[CheckType],
    ) -> Result<Vec<CheckResult>, WorkflowError> {
        let meta = self.meta_or_not_found(workflow_id).await?;
        let (schema, _) = self.compile_draft(workflow_id).await?;
        Ok(schema_check(&schema, meta.mode, checks))
    }

    /// Validate the draft and every sub-workflow it references. Compilation
    /// failures (missing references, reference cycles) surface as errors;
    /// validation findings come back as per-workflow issue lists.
    pub async fn validate_tree(
        &self,
        workflow_id: i64,
    ) -> Result<Vec<ValidateTreeInfo>, WorkflowError> {
        let (schema, _) = self.compile_draft(workflow_id).await?;
        let mut infos = validate_tree(workflow_id, &schema);
        let resource_issues = check_resources(&schema, self.resources.as_ref()).await?;
        if let Some(root) = infos.iter_mut().find(|i| i.workflow_id == workflow_id) {
            root.issues.extend(resource_issues);
        }
        Ok(infos)
    }

    /// Whether validate_tree found any blocking issue.
    pub fn has_blocking_issues(infos: &[ValidateTreeInfo]) -> bool {
        infos
            .iter()
            .any(|info| info.issues.iter().any(|i| i.severity == Severity::Error))
    }

    // -- test runs -----------------------------------------------------------

    /// Execute the draft through the runtime and, on completion, mark the
    /// draft's test run successful.
    pub async fn test_run(
        &self,
        workflow_id: i64,
        input: Value,
    ) -> Result<ExecutionOutcome, WorkflowError> {
        let runner = self.runner.as_ref().ok_or_else(|| {
            WorkflowError::operation("no execution runtime wired into the service")
        })?;
        let (schema, _) = self.compile_draft(workflow_id).await?;
        let outcome = runner
            .execute(schema, input, ExecutionContext::new(workflow_id))
            .await?;
        if matches!(outcome, ExecutionOutcome::Completed { .. }) {
            self.repo.set_test_run_success(workflow_id, true).await?;
        }
        Ok(outcome)
    }

    /// Record an externally run test as successful.
    pub async fn mark_test_run_success(&self, workflow_id: i64) -> Result<(), WorkflowError> {
        self.repo.set_test_run_success(workflow_id, true).await
    }

    // -- chat flow -----------------------------------------------------------

    /// Switch a workflow to ChatFlow mode, amending the entry and exit
    /// nodes with the chat IO contract when they lack it.
    pub async fn convert_to_chat_flow(&self, workflow_id: i64) -> Result<(), WorkflowError> {
        let mut meta = self.meta_or_not_found(workflow_id).await?;
        let draft = self.draft_or_not_found(workflow_id).await?;

        if meta.mode != WorkflowMode::ChatFlow {
            meta.mode = WorkflowMode::ChatFlow;
            meta.updated_at = Utc::now();
            self.repo.update_meta(&meta).await?;
        }

        let mut canvas = Canvas::from_json(&draft.canvas_json)?;
        if canvas::ensure_chat_entry(&mut canvas) {
            self.save(workflow_id, &canvas.to_json()?).await?;
        }
        Ok(())
    }

    pub async fn save_role(&self, role: ChatFlowRole) -> Result<(), WorkflowError> {
        let meta = self.meta_or_not_found(role.workflow_id).await?;
        if !meta.mode.is_chat() {
            return Err(WorkflowError::invalid_parameter(
                "role configuration applies to chat flows only",
            ));
        }
        self.repo.save_role(&role).await
    }

    pub async fn get_role(
        &self,
        workflow_id: i64,
        version: Option<&str>,
    ) -> Result<Option<ChatFlowRole>, WorkflowError> {
        self.repo.get_role(workflow_id, version).await
    }

    pub async fn bind_conv_related_info(
        &self,
        info: ConvRelatedInfo,
    ) -> Result<(), WorkflowError> {
        self.meta_or_not_found(info.workflow_id).await?;
        self.repo.bind_conv_info(&info).await
    }

    pub async fn get_conv_related_info(
        &self,
        workflow_id: i64,
        connector_id: i64,
    ) -> Result<Option<ConvRelatedInfo>, WorkflowError> {
        self.repo.get_conv_info(workflow_id, connector_id).await
    }
}

impl WorkflowServiceBuilder {
    pub fn ids(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn events(mut self, events: Arc<dyn EventBus>) -> Self {
        self.events = events;
        self
    }

    pub fn resources(mut self, resources: Arc<dyn ResourceResolver>) -> Self {
        self.resources = resources;
        self
    }

    pub fn runner(mut self, runner: WorkflowExecutor) -> Self {
        self.runner = Some(runner);
        self
    }

    pub fn build(self) -> WorkflowService {
        WorkflowService {
            repo: self.repo,
            ids: self.ids,
            events: self.events,
            resources: self.resources,
            cache: SchemaCache::default(),
            runner: self.runner,
        }
    }
}

/// Loads sub-workflow canvases from the repository: the draft when no
/// version is pinned, the published version otherwise.
struct RepoLoader {
    repo: Arc<dyn WorkflowRepository>,
}

#[async_trait]
impl SubWorkflowLoader for RepoLoader {
    async fn load_canvas<'a>(
        &self,
        workflow_id: i64,
        version: Option<&'a str>,
    ) -> Result<Canvas, WorkflowError> {
        let canvas_json = match version {
            None => self
                .repo
                .get_draft(workflow_id)
                .await?
                .map(|d| d.canvas_json),
            Some(v) => self
                .repo
                .get_version(workflow_id, v)
                .await?
                .map(|row| row.canvas_json),
        };
        let canvas_json =
            canvas_json.ok_or_else(|| WorkflowError::not_found(workflow_id, version))?;
        Canvas::from_json(&canvas_json)
    }
}

fn meta_only(meta: WorkflowMeta) -> Workflow {
    Workflow {
        meta,
        canvas_json: None,
        commit_id: None,
        version: None,
        input_params: Vec::new(),
        output_params: Vec::new(),
        test_run_success: None,
    }
}

fn version_aggregate(meta: WorkflowMeta, row: Version) -> Workflow {
    Workflow {
        meta,
        canvas_json: Some(row.canvas_json),
        commit_id: Some(row.commit_id),
        version: Some(row.version),
        input_params: row.input_params,
        output_params: row.output_params,
        test_run_success: None,
    }
}

/// Best-effort extraction of the workflow IO parameter lists: entry-node
/// outputs and exit-node inputs. Never fails a save; a canvas mid-edit may
/// not have them yet.
fn extract_io_params(
    canvas: &Canvas,
) -> (
    Vec<canvasflow_core::types::Variable>,
    Vec<canvasflow_core::types::Variable>,
) {
    let input_params = match canvas.entry_node() {
        Some(entry) => entry.data.outputs.clone(),
        None => {
            warn!("canvas has no entry node; input parameters left empty");
            Vec::new()
        }
    };
    let output_params = match canvas.exit_node() {
        Some(exit) => exit.data.inputs.clone(),
        None => {
            warn!("canvas has no exit node; output parameters left empty");
            Vec::new()
        }
    };
    (input_params, output_params)
}

/// The publish-time exception gate (S6): a `ReturnDefaultData` policy must
/// carry non-empty, well-formed JSON.
fn check_publishable_exceptions(schema: &WorkflowSchema) -> Result<(), WorkflowError> {
    for node in &schema.nodes {
        let Some(cfg) = &node.exception_configs else {
            continue;
        };
        if cfg.process_type != ProcessType::ReturnDefaultData {
            continue;
        }
        match cfg.data_on_err.as_deref() {
            None | Some("") => {
                return Err(WorkflowError::invalid_parameter(format!(
                    "node {}: return-default-data requires data_on_err",
                    node.key
                )))
            }
            Some(raw) => {
                if serde_json::from_str::<Value>(raw).is_err() {
                    return Err(WorkflowError::invalid_parameter(format!(
                        "node {}: data_on_err is not valid JSON",
                        node.key
                    )));
                }
            }
        }
    }
    Ok(())
}
