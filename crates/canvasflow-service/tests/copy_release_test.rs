//! Cross-scope flows: copy to library with closure rewriting, app
//! duplication, whole-app release with connector bindings, and related
//! resource sync.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;

use canvasflow_core::canvas::{initial_canvas, Canvas, CanvasEdge, CanvasNode, NodeData};
use canvasflow_core::mode::WorkflowMode;
use canvasflow_core::refs::sub_workflow_targets;
use canvasflow_service::entities::{
    ExternalResourceRelated, GetPolicy, GetSelector, ReleaseConfig,
};
use canvasflow_service::memory::MemoryRepository;
use canvasflow_service::repository::WorkflowRepository;
use canvasflow_service::{CreateWorkflowRequest, WorkflowService};

fn service() -> (WorkflowService, Arc<MemoryRepository>) {
    let repo = Arc::new(MemoryRepository::new());
    let service = WorkflowService::builder(repo.clone()).build();
    (service, repo)
}

fn create_request(name: &str, app_id: Option<i64>) -> CreateWorkflowRequest {
    CreateWorkflowRequest {
        space_id: 1,
        app_id,
        name: name.to_string(),
        desc: String::new(),
        icon: String::new(),
        mode: WorkflowMode::Workflow,
        creator_id: 7,
    }
}

fn referencing_canvas(target: i64) -> Canvas {
    let mut canvas = initial_canvas();
    canvas.nodes.push(CanvasNode {
        id: "sw".to_string(),
        node_type: "sub_workflow".to_string(),
        data: NodeData {
            configs: json!({ "workflow_id": target }),
            ..Default::default()
        },
        ..Default::default()
    });
    canvas.edges.push(CanvasEdge::new("100001", "sw"));
    canvas.edges.push(CanvasEdge::new("sw", "900001"));
    canvas
}

async fn draft_canvas(service: &WorkflowService, id: i64) -> Canvas {
    let workflow = service
        .get(GetPolicy {
            workflow_id: id,
            selector: GetSelector::Draft,
            meta_only: false,
        })
        .await
        .unwrap();
    Canvas::from_json(workflow.canvas_json.as_deref().unwrap()).unwrap()
}

#[tokio::test]
async fn copy_workflow_duplicates_the_draft() {
    let (service, _repo) = service();
    let id = service.create(create_request("original", None)).await.unwrap();
    service.mark_test_run_success(id).await.unwrap();

    let copy = service.copy_workflow(id, "_copy").await.unwrap();
    assert_ne!(copy.meta.id, id);
    assert_eq!(copy.meta.name, "original_copy");
    assert_eq!(copy.meta.latest_published_version, None);
    // A fresh copy has never test-run.
    assert_eq!(copy.test_run_success, Some(false));
    assert!(copy.canvas_json.is_some());
}

#[tokio::test]
async fn copy_to_library_rewrites_the_closure() {
    let (service, repo) = service();
    let app_id = 55;
    let child = service.create(create_request("child", Some(app_id))).await.unwrap();
    let root = service.create(create_request("root", Some(app_id))).await.unwrap();
    service
        .save(root, &referencing_canvas(child).to_json().unwrap())
        .await
        .unwrap();

    let related = ExternalResourceRelated::default();
    let (new_root, id_map) = service
        .copy_workflow_from_app_to_library(root, app_id, &related)
        .await
        .unwrap()
        .expect("closure validates");

    assert_eq!(id_map.len(), 2);
    assert_ne!(new_root, root);

    // Both copies live in the library and are published at v0.0.1.
    for (&old_id, &new_id) in &id_map {
        let meta = repo.get_meta(new_id).await.unwrap().unwrap();
        assert_eq!(meta.app_id, None);
        assert_eq!(meta.latest_published_version.as_deref(), Some("v0.0.1"));
        assert_ne!(old_id, new_id);
    }

    // The copied root references only ids from the produced map, pinned to
    // the initial version.
    let canvas = draft_canvas(&service, new_root).await;
    let targets = sub_workflow_targets(&canvas);
    assert_eq!(targets.len(), 1);
    assert_eq!(targets[0].0, id_map[&child]);
    assert_eq!(targets[0].1.as_deref(), Some("v0.0.1"));
    assert!(!id_map.keys().any(|old| targets.iter().any(|(t, _)| t == old)));
}

#[tokio::test]
async fn copy_to_library_aborts_on_validation_issues() {
    let (service, _repo) = service();
    let app_id = 56;
    let root = service.create(create_request("broken", Some(app_id))).await.unwrap();

    // A node fed from the entry that never reaches the exit.
    let mut canvas = initial_canvas();
    canvas.nodes.push(CanvasNode {
        id: "dead".to_string(),
        node_type: "code_runner".to_string(),
        data: NodeData {
            configs: json!({ "language": "python", "code": "pass" }),
            ..Default::default()
        },
        ..Default::default()
    });
    canvas.edges.push(CanvasEdge::new("100001", "dead"));
    service.save(root, &canvas.to_json().unwrap()).await.unwrap();

    let issues = service
        .copy_workflow_from_app_to_library(root, app_id, &ExternalResourceRelated::default())
        .await
        .unwrap()
        .expect_err("validation must block the copy");
    assert!(WorkflowService::has_blocking_issues(&issues));
}

#[tokio::test]
async fn duplicate_app_rewrites_sibling_references() {
    let (service, repo) = service();
    let src_app = 60;
    let dst_app = 61;
    let helper = service.create(create_request("helper", Some(src_app))).await.unwrap();
    let main = service.create(create_request("main", Some(src_app))).await.unwrap();
    service
        .save(main, &referencing_canvas(helper).to_json().unwrap())
        .await
        .unwrap();

    let copies = service
        .duplicate_workflows_by_app_id(src_app, dst_app, &ExternalResourceRelated::default())
        .await
        .unwrap();
    assert_eq!(copies.len(), 2);
    assert!(copies.iter().all(|w| w.meta.app_id == Some(dst_app)));

    let new_main = copies.iter().find(|w| w.meta.name == "main").unwrap();
    let new_helper = copies.iter().find(|w| w.meta.name == "helper").unwrap();
    let canvas = Canvas::from_json(new_main.canvas_json.as_deref().unwrap()).unwrap();
    let targets = sub_workflow_targets(&canvas);
    assert_eq!(targets.len(), 1);
    assert_eq!(targets[0].0, new_helper.meta.id);

    // Source stayed untouched.
    let src_canvas = draft_canvas(&service, main).await;
    assert_eq!(sub_workflow_targets(&src_canvas)[0].0, helper);
    assert!(repo.get_meta(main).await.unwrap().is_some());
}

#[tokio::test]
async fn release_publishes_everything_and_binds_connectors() {
    let (service, repo) = service();
    let app_id = 70;
    let a = service.create(create_request("a", Some(app_id))).await.unwrap();
    let b = service.create(create_request("b", Some(app_id))).await.unwrap();

    let config = ReleaseConfig {
        version: "v1.0.0".to_string(),
        connector_ids: vec![1001, 1002],
        creator_id: 7,
        related: ExternalResourceRelated::default(),
    };
    let issues = service
        .release_application_workflows(app_id, &config)
        .await
        .unwrap();
    assert!(issues.is_empty());

    for id in [a, b] {
        let meta = repo.get_meta(id).await.unwrap().unwrap();
        assert_eq!(meta.latest_published_version.as_deref(), Some("v1.0.0"));
    }
    let bindings = repo.connector_bindings(app_id).await.unwrap();
    assert_eq!(bindings.len(), 4);
    assert!(bindings.iter().any(|x| x.connector_id == 1001 && x.workflow_id == a));
    assert!(bindings.iter().all(|x| x.version == "v1.0.0"));
}

#[tokio::test]
async fn release_stops_on_blocking_issues() {
    let (service, repo) = service();
    let app_id = 71;
    let good = service.create(create_request("good", Some(app_id))).await.unwrap();
    let bad = service.create(create_request("bad", Some(app_id))).await.unwrap();

    let mut canvas = initial_canvas();
    canvas.nodes.push(CanvasNode {
        id: "dead".to_string(),
        node_type: "code_runner".to_string(),
        data: NodeData {
            configs: json!({ "language": "python", "code": "pass" }),
            ..Default::default()
        },
        ..Default::default()
    });
    canvas.edges.push(CanvasEdge::new("100001", "dead"));
    service.save(bad, &canvas.to_json().unwrap()).await.unwrap();

    let config = ReleaseConfig {
        version: "v1.0.0".to_string(),
        connector_ids: vec![1001],
        creator_id: 7,
        related: ExternalResourceRelated::default(),
    };
    let issues = service
        .release_application_workflows(app_id, &config)
        .await
        .unwrap();
    assert!(WorkflowService::has_blocking_issues(&issues));

    // Nothing was published or bound.
    for id in [good, bad] {
        let meta = repo.get_meta(id).await.unwrap().unwrap();
        assert_eq!(meta.latest_published_version, None);
    }
    assert!(repo.connector_bindings(app_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn sync_rewrites_unrelated_workflows_and_resets_their_flag() {
    let (service, repo) = service();
    let app_id = 80;
    let handled = service.create(create_request("handled", Some(app_id))).await.unwrap();
    let synced = service.create(create_request("synced", Some(app_id))).await.unwrap();

    // Give the synced workflow a knowledge reference and a green test run.
    let mut canvas = initial_canvas();
    canvas.nodes.push(CanvasNode {
        id: "kb".to_string(),
        node_type: "knowledge_retriever".to_string(),
        data: NodeData {
            configs: json!({ "knowledge_ids": [500], "top_k": 3, "strategy": "semantic" }),
            ..Default::default()
        },
        ..Default::default()
    });
    canvas.edges.push(CanvasEdge::new("100001", "kb"));
    canvas.edges.push(CanvasEdge::new("kb", "900001"));
    service.save(synced, &canvas.to_json().unwrap()).await.unwrap();
    service.mark_test_run_success(synced).await.unwrap();
    service.mark_test_run_success(handled).await.unwrap();

    let related = ExternalResourceRelated {
        knowledge_ids: HashMap::from([(500, 900)]),
        ..Default::default()
    };
    service
        .sync_related_workflow_resources(app_id, &HashMap::from([(handled, handled)]), &related)
        .await
        .unwrap();

    // The unrelated workflow was rewritten and its test run reset.
    let draft = repo.get_draft(synced).await.unwrap().unwrap();
    assert!(!draft.test_run_success);
    let rewritten = Canvas::from_json(&draft.canvas_json).unwrap();
    let kb = rewritten.node("kb").unwrap();
    assert_eq!(kb.data.configs["knowledge_ids"], json!([900]));

    // The handled workflow kept its state.
    let handled_draft = repo.get_draft(handled).await.unwrap().unwrap();
    assert!(handled_draft.test_run_success);
}
