//! Draft/version lifecycle scenarios: minimal save+publish (S1), test-run
//! inheritance (S4), reference-edge maintenance and read policies.

use std::sync::Arc;

use serde_json::json;

use canvasflow_core::canvas::{initial_canvas, Canvas, CanvasNode, NodeData};
use canvasflow_core::error::WorkflowError;
use canvasflow_core::mode::WorkflowMode;
use canvasflow_core::refs::canvas_to_refs;
use canvasflow_service::entities::{GetPolicy, GetSelector, MGetPolicy, PublishPolicy};
use canvasflow_service::memory::MemoryRepository;
use canvasflow_service::repository::WorkflowRepository;
use canvasflow_service::{CreateWorkflowRequest, DeletePolicy, WorkflowService};

fn service() -> (WorkflowService, Arc<MemoryRepository>) {
    let repo = Arc::new(MemoryRepository::new());
    let service = WorkflowService::builder(repo.clone()).build();
    (service, repo)
}

fn create_request(name: &str) -> CreateWorkflowRequest {
    CreateWorkflowRequest {
        space_id: 1,
        app_id: None,
        name: name.to_string(),
        desc: String::new(),
        icon: String::new(),
        mode: WorkflowMode::Workflow,
        creator_id: 42,
    }
}

fn publish_policy(workflow_id: i64, version: &str, force: bool) -> PublishPolicy {
    PublishPolicy {
        workflow_id,
        version: version.to_string(),
        description: String::new(),
        creator_id: 42,
        force,
    }
}

#[tokio::test]
async fn minimal_save_and_publish() {
    // S1: create, inspect the draft, publish twice with monotonicity
    // enforcement.
    let (service, repo) = service();
    let id = service.create(create_request("hello")).await.unwrap();

    let draft = repo.get_draft(id).await.unwrap().unwrap();
    assert!(!draft.test_run_success);
    assert_eq!(draft.input_params.len(), 1);
    assert_eq!(draft.input_params[0].name, "input");
    assert_eq!(draft.output_params.len(), 1);

    service.publish(publish_policy(id, "v0.0.1", true)).await.unwrap();
    let meta = repo.get_meta(id).await.unwrap().unwrap();
    assert_eq!(meta.latest_published_version.as_deref(), Some("v0.0.1"));
    assert!(repo.references_from(id).await.unwrap().is_empty());

    // Same version again: rejected.
    let err = service
        .publish(publish_policy(id, "v0.0.1", true))
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::VersionMonotonicity { .. }));

    service.publish(publish_policy(id, "v0.0.2", true)).await.unwrap();
    let err = service
        .publish(publish_policy(id, "v0.0.2", true))
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::VersionMonotonicity { .. }));
}

#[tokio::test]
async fn publish_requires_a_test_run_unless_forced() {
    let (service, _repo) = service();
    let id = service.create(create_request("gated")).await.unwrap();

    let err = service
        .publish(publish_policy(id, "v0.0.1", false))
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::TestRunRequired { .. }));

    service.mark_test_run_success(id).await.unwrap();
    service.publish(publish_policy(id, "v0.0.1", false)).await.unwrap();
}

#[tokio::test]
async fn save_inherits_test_run_over_cosmetic_edits() {
    // S4: a title-only edit keeps the flag, a structural edit resets it.
    let (service, repo) = service();
    let id = service.create(create_request("inherit")).await.unwrap();
    service.mark_test_run_success(id).await.unwrap();

    let draft_before = repo.get_draft(id).await.unwrap().unwrap();
    let mut canvas = Canvas::from_json(&draft_before.canvas_json).unwrap();
    canvas.node_mut("100001").unwrap().meta = Some(canvasflow_core::canvas::CanvasNodeMeta {
        title: Some("renamed in the editor".to_string()),
        ..Default::default()
    });

    let draft_after = service.save(id, &canvas.to_json().unwrap()).await.unwrap();
    assert_ne!(draft_after.commit_id, draft_before.commit_id);
    assert!(draft_after.test_run_success, "cosmetic edit must inherit");

    // Adding a node changes the compiled schema.
    let mut canvas = Canvas::from_json(&draft_after.canvas_json).unwrap();
    canvas.nodes.push(CanvasNode {
        id: "coder".to_string(),
        node_type: "code_runner".to_string(),
        data: NodeData {
            configs: json!({ "language": "python", "code": "pass" }),
            ..Default::default()
        },
        ..Default::default()
    });
    canvas
        .edges
        .push(canvasflow_core::canvas::CanvasEdge::new("100001", "coder"));
    canvas
        .edges
        .push(canvasflow_core::canvas::CanvasEdge::new("coder", "900001"));

    let draft_changed = service.save(id, &canvas.to_json().unwrap()).await.unwrap();
    assert!(!draft_changed.test_run_success, "structural edit must reset");
}

#[tokio::test]
async fn resaving_the_same_canvas_preserves_the_flag() {
    let (service, repo) = service();
    let id = service.create(create_request("idem")).await.unwrap();
    service.mark_test_run_success(id).await.unwrap();

    let before = repo.get_draft(id).await.unwrap().unwrap();
    let after = service.save(id, &before.canvas_json).await.unwrap();
    assert_ne!(after.commit_id, before.commit_id);
    assert!(after.test_run_success);
}

#[tokio::test]
async fn published_reference_edges_match_the_canvas() {
    let (service, repo) = service();
    let child = service.create(create_request("child")).await.unwrap();
    service.publish(publish_policy(child, "v0.0.1", true)).await.unwrap();

    let parent = service.create(create_request("parent")).await.unwrap();
    let mut canvas = initial_canvas();
    canvas.nodes.push(CanvasNode {
        id: "sw".to_string(),
        node_type: "sub_workflow".to_string(),
        data: NodeData {
            configs: json!({ "workflow_id": child, "version": "v0.0.1" }),
            ..Default::default()
        },
        ..Default::default()
    });
    canvas
        .edges
        .push(canvasflow_core::canvas::CanvasEdge::new("100001", "sw"));
    canvas
        .edges
        .push(canvasflow_core::canvas::CanvasEdge::new("sw", "900001"));
    service.save(parent, &canvas.to_json().unwrap()).await.unwrap();
    service.publish(publish_policy(parent, "v0.0.1", true)).await.unwrap();

    let stored: std::collections::BTreeSet<_> = repo
        .references_from(parent)
        .await
        .unwrap()
        .into_iter()
        .collect();
    assert_eq!(stored, canvas_to_refs(parent, &canvas));

    let referring = service.get_workflow_reference(child).await.unwrap();
    assert!(referring.contains_key(&parent));
}

#[tokio::test]
async fn cyclic_sub_workflow_references_fail_publish() {
    // S3: W2 publishes against a stub, then both drafts point at each
    // other; publishing W1 walks W2's published canvas back into W1's
    // draft and trips the cycle guard.
    let (service, repo) = service();
    let w1 = service.create(create_request("w1")).await.unwrap();
    let w2 = service.create(create_request("w2")).await.unwrap();

    let sub_node = |target: i64, version: Option<&str>| {
        let mut configs = json!({ "workflow_id": target });
        if let Some(v) = version {
            configs["version"] = json!(v);
        }
        CanvasNode {
            id: "sw".to_string(),
            node_type: "sub_workflow".to_string(),
            data: NodeData {
                configs,
                ..Default::default()
            },
            ..Default::default()
        }
    };
    let canvas_referencing = |target: i64, version: Option<&str>| {
        let mut canvas = initial_canvas();
        canvas.nodes.push(sub_node(target, version));
        canvas
            .edges
            .push(canvasflow_core::canvas::CanvasEdge::new("100001", "sw"));
        canvas
            .edges
            .push(canvasflow_core::canvas::CanvasEdge::new("sw", "900001"));
        canvas
    };

    // W2 references W1 while W1 is still a stub (no references of its
    // own), so publishing W2 succeeds.
    let w2_canvas = canvas_referencing(w1, None);
    service.save(w2, &w2_canvas.to_json().unwrap()).await.unwrap();
    service.publish(publish_policy(w2, "v0.0.1", true)).await.unwrap();

    // Now W1 references W2's published version, closing the loop:
    // W1 draft → W2 v0.0.1 → W1 draft.
    let w1_canvas = canvas_referencing(w2, Some("v0.0.1"));
    service.save(w1, &w1_canvas.to_json().unwrap()).await.unwrap();

    let err = service
        .publish(publish_policy(w1, "v0.0.1", true))
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::ReferenceCycle { .. }));

    // The same cycle is reported by tree validation.
    let err = service.validate_tree(w1).await.unwrap_err();
    assert!(matches!(err, WorkflowError::ReferenceCycle { .. }));

    // W2's published version kept its original canvas, so the version-
    // pinned path stays usable.
    assert!(repo.get_version(w2, "v0.0.1").await.unwrap().is_some());
}

#[tokio::test]
async fn get_and_mget_read_policies() {
    let (service, _repo) = service();
    let id = service.create(create_request("reader")).await.unwrap();
    service.publish(publish_policy(id, "v0.0.1", true)).await.unwrap();

    let draft = service
        .get(GetPolicy {
            workflow_id: id,
            selector: GetSelector::Draft,
            meta_only: false,
        })
        .await
        .unwrap();
    assert!(draft.canvas_json.is_some());
    assert_eq!(draft.version, None);

    let latest = service
        .get(GetPolicy {
            workflow_id: id,
            selector: GetSelector::LatestPublished,
            meta_only: false,
        })
        .await
        .unwrap();
    assert_eq!(latest.version.as_deref(), Some("v0.0.1"));

    let meta_only = service
        .get(GetPolicy {
            workflow_id: id,
            selector: GetSelector::Draft,
            meta_only: true,
        })
        .await
        .unwrap();
    assert!(meta_only.canvas_json.is_none());

    let unpublished = service.create(create_request("unpublished")).await.unwrap();
    let (listed, total) = service
        .mget(MGetPolicy {
            space_id: Some(1),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(total, 2);
    assert_eq!(listed.len(), 2);
    assert!(listed.iter().any(|w| w.meta.id == unpublished));

    let (published_only, _) = service
        .mget(MGetPolicy {
            space_id: Some(1),
            published_only: true,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(published_only.len(), 1);
    assert_eq!(published_only[0].meta.id, id);
}

#[tokio::test]
async fn delete_hides_the_workflow() {
    let (service, _repo) = service();
    let id = service.create(create_request("doomed")).await.unwrap();
    let deleted = service.delete(DeletePolicy::ById(id)).await.unwrap();
    assert_eq!(deleted, vec![id]);

    let err = service
        .get(GetPolicy {
            workflow_id: id,
            selector: GetSelector::Draft,
            meta_only: true,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::WorkflowNotFound { .. }));
}

#[tokio::test]
async fn bad_default_data_blocks_publish() {
    // S6 publish side: a ReturnDefaultData policy with empty data_on_err is
    // an invalid parameter at publish time.
    let (service, repo) = service();
    let id = service.create(create_request("exceptional")).await.unwrap();

    let draft = repo.get_draft(id).await.unwrap().unwrap();
    let mut canvas = Canvas::from_json(&draft.canvas_json).unwrap();
    canvas.nodes.push(CanvasNode {
        id: "llm".to_string(),
        node_type: "llm".to_string(),
        data: NodeData {
            configs: json!({
                "param": { "provider": "p", "model": "m" },
                "user_prompt": "hi",
            }),
            settings: Some(canvasflow_core::canvas::ExceptionSettings {
                process_type: Some(canvasflow_core::schema::ProcessType::ReturnDefaultData),
                data_on_err: Some(String::new()),
                ..Default::default()
            }),
            ..Default::default()
        },
        ..Default::default()
    });
    canvas
        .edges
        .push(canvasflow_core::canvas::CanvasEdge::new("100001", "llm"));
    canvas
        .edges
        .push(canvasflow_core::canvas::CanvasEdge::new("llm", "900001"));
    service.save(id, &canvas.to_json().unwrap()).await.unwrap();

    let err = service
        .publish(publish_policy(id, "v0.0.1", true))
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::InvalidParameter { .. }));
}

#[tokio::test]
async fn list_node_meta_groups_by_category() {
    let (service, _repo) = service();
    let (grouped, categories) = service.list_node_meta(None);
    assert!(!categories.is_empty());
    let listed: usize = grouped.values().map(Vec::len).sum();
    // Every type except Comment is listable.
    assert_eq!(listed, canvasflow_core::node_type::NodeType::all().len() - 1);

    let (only_ai, _) = service.list_node_meta(Some(canvasflow_core::node_type::NodeCategory::Ai));
    assert_eq!(only_ai.len(), 1);
}
