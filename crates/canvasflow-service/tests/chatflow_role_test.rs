//! ChatFlow specifics at the service level: mode conversion, role
//! draft/version lifecycle, conversation-related bindings and test runs
//! through the wired runtime.

use std::sync::Arc;

use serde_json::json;

use canvasflow_core::canvas::{Canvas, CONVERSATION_NAME, USER_INPUT};
use canvasflow_core::error::WorkflowError;
use canvasflow_core::mode::WorkflowMode;
use canvasflow_core::validate::CheckType;
use canvasflow_service::entities::{
    ChatFlowRole, ConvRelatedInfo, GetPolicy, GetSelector, PublishPolicy,
};
use canvasflow_service::memory::MemoryRepository;
use canvasflow_service::{CreateWorkflowRequest, WorkflowService};

use canvasflow_runtime::executor::ExecutorSet;
use canvasflow_runtime::scheduler::ExecutionOutcome;
use canvasflow_runtime::testing::EchoSandbox;
use canvasflow_runtime::WorkflowExecutor;

fn chat_request(name: &str) -> CreateWorkflowRequest {
    CreateWorkflowRequest {
        space_id: 1,
        app_id: None,
        name: name.to_string(),
        desc: String::new(),
        icon: String::new(),
        mode: WorkflowMode::ChatFlow,
        creator_id: 9,
    }
}

fn service_with_runner() -> WorkflowService {
    let repo = Arc::new(MemoryRepository::new());
    let runner = WorkflowExecutor::new(
        ExecutorSet::builder().sandbox(Arc::new(EchoSandbox)).build(),
    );
    WorkflowService::builder(repo).runner(runner).build()
}

#[tokio::test]
async fn chat_flow_creation_seeds_the_chat_entry() {
    let service = service_with_runner();
    let id = service.create(chat_request("chatty")).await.unwrap();

    let workflow = service
        .get(GetPolicy {
            workflow_id: id,
            selector: GetSelector::Draft,
            meta_only: false,
        })
        .await
        .unwrap();
    let canvas = Canvas::from_json(workflow.canvas_json.as_deref().unwrap()).unwrap();
    let entry = canvas.entry_node().unwrap();
    let names: Vec<&str> = entry.data.outputs.iter().map(|v| v.name.as_str()).collect();
    assert!(names.contains(&USER_INPUT));
    assert!(names.contains(&CONVERSATION_NAME));

    let exit = canvas.exit_node().unwrap();
    assert_eq!(exit.data.configs["streaming_output"], json!(true));
}

#[tokio::test]
async fn converting_a_workflow_amends_the_entry() {
    let service = service_with_runner();
    let id = service
        .create(CreateWorkflowRequest {
            mode: WorkflowMode::Workflow,
            ..chat_request("converted")
        })
        .await
        .unwrap();

    service.convert_to_chat_flow(id).await.unwrap();

    let workflow = service
        .get(GetPolicy {
            workflow_id: id,
            selector: GetSelector::Draft,
            meta_only: false,
        })
        .await
        .unwrap();
    assert_eq!(workflow.meta.mode, WorkflowMode::ChatFlow);
    let canvas = Canvas::from_json(workflow.canvas_json.as_deref().unwrap()).unwrap();
    let entry = canvas.entry_node().unwrap();
    assert!(entry.data.outputs.iter().any(|v| v.name == USER_INPUT));

    // Converting twice changes nothing further.
    let commit_before = service
        .get(GetPolicy {
            workflow_id: id,
            selector: GetSelector::Draft,
            meta_only: false,
        })
        .await
        .unwrap()
        .commit_id;
    service.convert_to_chat_flow(id).await.unwrap();
    let commit_after = service
        .get(GetPolicy {
            workflow_id: id,
            selector: GetSelector::Draft,
            meta_only: false,
        })
        .await
        .unwrap()
        .commit_id;
    assert_eq!(commit_before, commit_after);
}

#[tokio::test]
async fn roles_version_with_the_workflow() {
    let service = service_with_runner();
    let id = service.create(chat_request("persona")).await.unwrap();

    service
        .save_role(ChatFlowRole {
            workflow_id: id,
            name: "Concierge".to_string(),
            onboarding: "How can I help?".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

    service
        .publish(PublishPolicy {
            workflow_id: id,
            version: "v0.0.1".to_string(),
            description: String::new(),
            creator_id: 9,
            force: true,
        })
        .await
        .unwrap();

    // The draft role keeps evolving; the published snapshot stays.
    service
        .save_role(ChatFlowRole {
            workflow_id: id,
            name: "Concierge v2".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

    let draft_role = service.get_role(id, None).await.unwrap().unwrap();
    assert_eq!(draft_role.name, "Concierge v2");
    let published_role = service.get_role(id, Some("v0.0.1")).await.unwrap().unwrap();
    assert_eq!(published_role.name, "Concierge");
}

#[tokio::test]
async fn roles_are_chat_only() {
    let service = service_with_runner();
    let id = service
        .create(CreateWorkflowRequest {
            mode: WorkflowMode::Workflow,
            ..chat_request("plain")
        })
        .await
        .unwrap();
    let err = service
        .save_role(ChatFlowRole {
            workflow_id: id,
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::InvalidParameter { .. }));
}

#[tokio::test]
async fn conv_related_info_round_trips() {
    let service = service_with_runner();
    let id = service.create(chat_request("bound")).await.unwrap();

    service
        .bind_conv_related_info(ConvRelatedInfo {
            workflow_id: id,
            connector_id: 3001,
            conversation_naming: "support-{{date}}".to_string(),
        })
        .await
        .unwrap();

    let info = service.get_conv_related_info(id, 3001).await.unwrap().unwrap();
    assert_eq!(info.conversation_naming, "support-{{date}}");
    assert!(service.get_conv_related_info(id, 9999).await.unwrap().is_none());
}

#[tokio::test]
async fn bot_agent_check_flags_conversation_nodes() {
    let service = service_with_runner();
    let id = service.create(chat_request("agented")).await.unwrap();

    let workflow = service
        .get(GetPolicy {
            workflow_id: id,
            selector: GetSelector::Draft,
            meta_only: false,
        })
        .await
        .unwrap();
    let mut canvas = Canvas::from_json(workflow.canvas_json.as_deref().unwrap()).unwrap();
    canvas.nodes.push(canvasflow_core::canvas::CanvasNode {
        id: "conv".to_string(),
        node_type: "create_conversation".to_string(),
        ..Default::default()
    });
    canvas
        .edges
        .push(canvasflow_core::canvas::CanvasEdge::new("100001", "conv"));
    canvas
        .edges
        .push(canvasflow_core::canvas::CanvasEdge::new("conv", "900001"));
    service.save(id, &canvas.to_json().unwrap()).await.unwrap();

    let results = service
        .workflow_schema_check(id, &[CheckType::BotAgent])
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert!(!results[0].passed);
}

#[tokio::test]
async fn test_run_marks_the_draft_green() {
    let service = service_with_runner();
    let id = service.create(chat_request("runnable")).await.unwrap();

    let outcome = service
        .test_run(id, json!({ "input": "ping", "USER_INPUT": "ping" }))
        .await
        .unwrap();
    assert!(matches!(outcome, ExecutionOutcome::Completed { .. }));

    let workflow = service
        .get(GetPolicy {
            workflow_id: id,
            selector: GetSelector::Draft,
            meta_only: false,
        })
        .await
        .unwrap();
    assert_eq!(workflow.test_run_success, Some(true));

    // A green draft publishes without force.
    service
        .publish(PublishPolicy {
            workflow_id: id,
            version: "v0.0.1".to_string(),
            description: String::new(),
            creator_id: 9,
            force: false,
        })
        .await
        .unwrap();
}
