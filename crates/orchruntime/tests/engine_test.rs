mod common;

use chrono::{Duration, Utc};
use common::{harness, harness_with, linear, node, response, ScriptedHttp};
use orchcore::{
    EngineError, ExecutionEvent, ExecutionStatus, InstanceStatus, NodeError, NodeKind, NodeSpec,
    StartRequest, WaitKind, WorkflowDefinition, WorkflowError,
};
use serde_json::json;

#[tokio::test]
async fn test_task_workflow_waits_with_due_date() {
    let h = harness();
    h.save(&linear("onboard", vec![node("task", NodeKind::Task, json!({"dueInHours": 1}))]))
        .await;

    let before = Utc::now();
    let id = h.engine.start(StartRequest::new("onboard")).await.unwrap();
    let instance = h.engine.get_instance(&id).await.unwrap();

    assert_eq!(instance.status, InstanceStatus::Waiting);
    assert_eq!(instance.current_node_id.as_deref(), Some("task"));
    let wait = instance.waiting_for.clone().expect("waiting instance records its correlation id");
    assert_eq!(wait.kind, WaitKind::Task);

    let tasks = h.store.tasks().await;
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].id, wait.id);
    let due = tasks[0].due_date.unwrap();
    assert!(due >= before + Duration::hours(1));
    assert!(due <= Utc::now() + Duration::hours(1));
}

#[tokio::test]
async fn test_decision_routes_by_edge_label() {
    let h = harness();
    let mut wf = WorkflowDefinition::new("branch", "branch");
    wf.add_node(NodeSpec::new("start", NodeKind::Start));
    wf.add_node(node("check", NodeKind::Decision, json!({"condition": "2 > 1"})));
    wf.add_node(node("approve", NodeKind::Assignment, json!({"assignments": [{"variable": "path", "value": 1}]})));
    wf.add_node(node("reject", NodeKind::Assignment, json!({"assignments": [{"variable": "path", "value": 2}]})));
    wf.add_node(NodeSpec::new("end", NodeKind::End));
    wf.connect("start", "check");
    wf.connect("check", "reject").with_label("No");
    wf.connect("check", "approve").with_label("Yes");
    wf.connect("approve", "end");
    wf.connect("reject", "end");
    h.save(&wf).await;

    let id = h.engine.start(StartRequest::new("branch")).await.unwrap();
    let instance = h.engine.get_instance(&id).await.unwrap();

    assert_eq!(instance.status, InstanceStatus::Completed);
    assert_eq!(instance.variables["path"], json!(1));
    assert!(instance.node_statuses.contains_key("approve"));
    assert!(!instance.node_statuses.contains_key("reject"));
    assert_eq!(instance.variables["check"], json!({"condition": "2 > 1", "result": true}));
}

#[tokio::test]
async fn test_decision_edge_without_handle_or_keyword_is_not_taken() {
    let h = harness();
    let mut wf = WorkflowDefinition::new("branch", "branch");
    wf.add_node(NodeSpec::new("start", NodeKind::Start));
    wf.add_node(node("check", NodeKind::Decision, json!({"condition": "1 > 2"})));
    wf.add_node(NodeSpec::new("other", NodeKind::End));
    wf.add_node(NodeSpec::new("no_end", NodeKind::End));
    wf.connect("start", "check");
    wf.connect("check", "other").with_label("Maybe");
    wf.connect("check", "no_end").with_handle("no");
    h.save(&wf).await;

    let id = h.engine.start(StartRequest::new("branch")).await.unwrap();
    let instance = h.engine.get_instance(&id).await.unwrap();

    assert_eq!(instance.status, InstanceStatus::Completed);
    assert!(instance.node_statuses.contains_key("no_end"));
    assert!(!instance.node_statuses.contains_key("other"));
}

#[tokio::test]
async fn test_create_record_retries_unavailable_storage_three_times() {
    let h = harness();
    h.store.fail_collection("orders", "orders service unavailable").await;
    h.save(&linear(
        "persist",
        vec![node("save", NodeKind::CreateRecord, json!({"collection": "orders", "fields": {"a": 1}}))],
    ))
    .await;

    let id = h.engine.start(StartRequest::new("persist")).await.unwrap();
    let instance = h.engine.get_instance(&id).await.unwrap();

    assert_eq!(h.store.collection_calls("orders").await, 3);
    assert_eq!(instance.status, InstanceStatus::Failed);
    assert!(instance.error.as_deref().unwrap().contains("orders service unavailable"));
    let entry = instance.execution_log.last().unwrap();
    assert_eq!((entry.node_id.as_str(), entry.retry_count), ("save", 2));
    assert_eq!(instance.node_statuses["save"], ExecutionStatus::Failed);
}

#[tokio::test]
async fn test_action_timeout_is_retried() {
    let h = harness_with(ScriptedHttp::always(Err(NodeError::Timeout { seconds: 30 })));
    h.save(&linear("call", vec![node("http", NodeKind::Action, json!({"url": "https://svc"}))]))
        .await;
    let mut events = h.engine.subscribe_events();

    let id = h.engine.start(StartRequest::new("call")).await.unwrap();
    let instance = h.engine.get_instance(&id).await.unwrap();

    assert_eq!(h.http.calls(), 3);
    assert_eq!(instance.status, InstanceStatus::Failed);
    assert_eq!(instance.error.as_deref(), Some("Timeout after 30s"));

    let mut retries = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let ExecutionEvent::NodeRetrying { attempt, .. } = event {
            retries.push(attempt);
        }
    }
    assert_eq!(retries, [1, 2]);
}

#[tokio::test]
async fn test_action_recovers_after_transient_failure() {
    let http = ScriptedHttp::status(200, "fine").then(Ok(response(503, "busy")));
    let h = harness_with(http);
    h.save(&linear("call", vec![node("http", NodeKind::Action, json!({"url": "https://svc"}))]))
        .await;

    let id = h.engine.start(StartRequest::new("call")).await.unwrap();
    let instance = h.engine.get_instance(&id).await.unwrap();

    assert_eq!(instance.status, InstanceStatus::Completed);
    assert_eq!(h.http.calls(), 2);
    assert_eq!(instance.variables["http"]["body"], json!("fine"));
}

#[tokio::test]
async fn test_action_not_found_is_not_retried() {
    let h = harness_with(ScriptedHttp::status(404, "missing"));
    h.save(&linear("call", vec![node("http", NodeKind::Action, json!({"url": "https://svc"}))]))
        .await;

    let id = h.engine.start(StartRequest::new("call")).await.unwrap();
    let instance = h.engine.get_instance(&id).await.unwrap();

    assert_eq!(h.http.calls(), 1);
    assert_eq!(instance.error.as_deref(), Some("HTTP 404: missing"));
    assert_eq!(
        instance.friendly_error.as_deref(),
        Some("The requested resource could not be found.")
    );
}

#[tokio::test]
async fn test_unknown_node_type_fails_without_retry() {
    let h = harness();
    let unknown: NodeSpec = serde_json::from_value(json!({"id": "warp", "type": "warp_drive"})).unwrap();
    h.save(&linear("odd", vec![unknown])).await;

    let id = h.engine.start(StartRequest::new("odd")).await.unwrap();
    let instance = h.engine.get_instance(&id).await.unwrap();

    assert_eq!(instance.status, InstanceStatus::Failed);
    assert_eq!(instance.error.as_deref(), Some("Unknown node type: warp_drive"));
    let attempts = instance.execution_log.iter().filter(|e| e.node_id == "warp").count();
    assert_eq!(attempts, 1);
}

#[tokio::test]
async fn test_missing_start_node_fails_instance() {
    let h = harness();
    let mut wf = WorkflowDefinition::new("headless", "headless");
    wf.add_node(NodeSpec::new("end", NodeKind::End));
    h.save(&wf).await;

    let id = h.engine.start(StartRequest::new("headless")).await.unwrap();
    let instance = h.engine.get_instance(&id).await.unwrap();

    assert_eq!(instance.status, InstanceStatus::Failed);
    assert!(instance.error.unwrap().contains("no start node"));
    assert!(instance.completed_at.is_some());
}

#[tokio::test]
async fn test_start_unknown_workflow_is_an_error() {
    let h = harness();

    let err = h.engine.start(StartRequest::new("ghost")).await.unwrap_err();

    assert!(matches!(err, EngineError::Workflow(WorkflowError::NotFound(id)) if id == "ghost"));
}

#[tokio::test]
async fn test_resume_without_data_leaves_variables_unchanged() {
    let h = harness();
    h.save(&linear("review", vec![node("task", NodeKind::Task, json!({"title": "Check"}))]))
        .await;
    let id = h
        .engine
        .start(StartRequest::new("review").with_input("amount", json!(42)))
        .await
        .unwrap();
    let before = h.engine.get_instance(&id).await.unwrap();

    h.engine.resume(&id, "task", None).await.unwrap();
    let after = h.engine.get_instance(&id).await.unwrap();

    assert_eq!(after.variables, before.variables);
    assert_eq!(after.status, InstanceStatus::Completed);
    assert_eq!(after.node_statuses["task"], ExecutionStatus::Completed);
    let task_runs = after.execution_log.iter().filter(|e| e.node_id == "task").count();
    assert_eq!(task_runs, 1, "the waited node is not re-executed");
}

#[tokio::test]
async fn test_resume_records_result_data() {
    let h = harness();
    h.save(&linear("form", vec![node("intake", NodeKind::Form, json!({"form_id": "f1"}))]))
        .await;
    let id = h.engine.start(StartRequest::new("form")).await.unwrap();

    h.engine
        .resume(&id, "intake", Some(json!({"name": "Ada"})))
        .await
        .unwrap();
    let instance = h.engine.get_instance(&id).await.unwrap();

    assert_eq!(instance.variables["intake"], json!({"name": "Ada"}));
    assert_eq!(instance.status, InstanceStatus::Completed);
}

#[tokio::test]
async fn test_pause_resume_and_cancel_transitions() {
    let h = harness();
    h.save(&linear(
        "two_steps",
        vec![
            node("first", NodeKind::Screen, json!({})),
            node("second", NodeKind::Screen, json!({})),
        ],
    ))
    .await;
    let id = h.engine.start(StartRequest::new("two_steps")).await.unwrap();

    h.engine.pause(&id).await.unwrap();
    let paused = h.engine.get_instance(&id).await.unwrap();
    assert_eq!(paused.status, InstanceStatus::Paused);
    assert_eq!(paused.waiting_for.as_ref().unwrap().id, "first");

    h.engine.resume(&id, "first", None).await.unwrap();
    assert_eq!(h.engine.get_instance(&id).await.unwrap().status, InstanceStatus::Waiting);

    h.engine.cancel(&id).await.unwrap();
    let cancelled = h.engine.get_instance(&id).await.unwrap();
    assert_eq!(cancelled.status, InstanceStatus::Cancelled);

    for result in [
        h.engine.cancel(&id).await,
        h.engine.pause(&id).await,
        h.engine.resume(&id, "second", None).await,
    ] {
        assert!(matches!(
            result,
            Err(EngineError::Workflow(WorkflowError::InvalidTransition { .. }))
        ));
    }
}

#[tokio::test]
async fn test_resume_running_instance_is_rejected() {
    let h = harness();
    h.save(&linear("quick", vec![])).await;
    let id = h.engine.start(StartRequest::new("quick")).await.unwrap();

    let err = h.engine.resume(&id, "start", None).await.unwrap_err();

    assert!(err.to_string().contains("Cannot resume"));
}

#[tokio::test]
async fn test_step_node_runs_a_single_node() {
    let h = harness();
    let mut wf = WorkflowDefinition::new("steps", "steps");
    wf.add_node(NodeSpec::new("start", NodeKind::Start));
    wf.add_node(node("wait", NodeKind::Screen, json!({})));
    wf.add_node(node("calc", NodeKind::Calculate, json!({"expression": "x * 2", "output_variable": "y"})));
    wf.add_node(node("check", NodeKind::Decision, json!({"condition": "y > 5"})));
    wf.add_node(NodeSpec::new("big", NodeKind::End));
    wf.add_node(NodeSpec::new("small", NodeKind::End));
    wf.connect("start", "wait");
    wf.connect("wait", "calc");
    wf.connect("calc", "check");
    wf.connect("check", "big").with_handle("yes");
    wf.connect("check", "small").with_handle("no");
    h.save(&wf).await;
    let id = h
        .engine
        .start(StartRequest::new("steps").with_input("x", json!(4)))
        .await
        .unwrap();

    let calc = h.engine.step_node(&id, "calc").await.unwrap();
    assert_eq!(calc.result.status, ExecutionStatus::Completed);
    assert_eq!(calc.next_node_ids, ["check"]);
    assert_eq!(calc.variables["y"], json!(8));

    let check = h.engine.step_node(&id, "check").await.unwrap();
    assert_eq!(check.result.route.as_deref(), Some("true"));
    assert_eq!(check.next_node_ids, ["big"]);

    let instance = h.engine.get_instance(&id).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Waiting, "stepping does not change status");
    assert_eq!(instance.variables["y"], json!(8));
}

#[tokio::test]
async fn test_fan_out_runs_branches_in_order() {
    let h = harness();
    let mut wf = WorkflowDefinition::new("fan", "fan");
    wf.add_node(NodeSpec::new("start", NodeKind::Start));
    wf.add_node(NodeSpec::new("split", NodeKind::Parallel));
    wf.add_node(node("left", NodeKind::Assignment, json!({"assignments": [{"variable": "l", "value": 1}]})));
    wf.add_node(node("right", NodeKind::Assignment, json!({"assignments": [{"variable": "r", "value": 2}]})));
    wf.add_node(NodeSpec::new("done", NodeKind::End));
    wf.connect("start", "split");
    wf.connect("split", "left");
    wf.connect("split", "right");
    wf.connect("right", "done");
    h.save(&wf).await;

    let id = h.engine.start(StartRequest::new("fan")).await.unwrap();
    let instance = h.engine.get_instance(&id).await.unwrap();

    let order: Vec<&str> = instance.execution_log.iter().map(|e| e.node_id.as_str()).collect();
    assert_eq!(order, ["start", "split", "left", "right", "done"]);
    assert_eq!(instance.status, InstanceStatus::Completed);
    assert_eq!((instance.variables["l"].clone(), instance.variables["r"].clone()), (json!(1), json!(2)));
}

#[tokio::test]
async fn test_branches_joining_at_an_end_all_run() {
    let h = harness();
    let mut wf = WorkflowDefinition::new("join", "join");
    wf.add_node(NodeSpec::new("start", NodeKind::Start));
    wf.add_node(NodeSpec::new("split", NodeKind::Parallel));
    wf.add_node(node("left", NodeKind::Assignment, json!({"assignments": [{"variable": "l", "value": 1}]})));
    wf.add_node(node("right", NodeKind::Assignment, json!({"assignments": [{"variable": "r", "value": 2}]})));
    wf.add_node(NodeSpec::new("join", NodeKind::Merge));
    wf.add_node(NodeSpec::new("done", NodeKind::End));
    wf.connect("start", "split");
    wf.connect("split", "left");
    wf.connect("split", "right");
    wf.connect("left", "join");
    wf.connect("right", "join");
    wf.connect("join", "done");
    h.save(&wf).await;
    let mut events = h.engine.subscribe_events();

    let id = h.engine.start(StartRequest::new("join")).await.unwrap();
    let instance = h.engine.get_instance(&id).await.unwrap();

    let order: Vec<&str> = instance.execution_log.iter().map(|e| e.node_id.as_str()).collect();
    assert_eq!(order, ["start", "split", "left", "join", "done", "right", "join", "done"]);
    assert_eq!(instance.status, InstanceStatus::Completed);
    assert_eq!(instance.variables["r"], json!(2));

    let mut completions = 0;
    while let Ok(event) = events.try_recv() {
        if let ExecutionEvent::InstanceStatusChanged { status: InstanceStatus::Completed, .. } = event {
            completions += 1;
        }
    }
    assert_eq!(completions, 1);
}

#[tokio::test]
async fn test_walk_without_end_node_completes() {
    let h = harness();
    let mut wf = WorkflowDefinition::new("leaf", "leaf");
    wf.add_node(NodeSpec::new("start", NodeKind::Start));
    wf.add_node(node("a", NodeKind::Assignment, json!({"assignments": [{"variable": "x", "value": 1}]})));
    wf.connect("start", "a");
    h.save(&wf).await;

    let id = h.engine.start(StartRequest::new("leaf")).await.unwrap();
    let instance = h.engine.get_instance(&id).await.unwrap();

    assert_eq!(instance.status, InstanceStatus::Completed);
    assert!(instance.completed_at.is_some());
    assert_eq!(instance.variables["x"], json!(1));
}

#[tokio::test]
async fn test_self_loop_is_failed_after_step_budget() {
    let h = harness();
    let mut wf = WorkflowDefinition::new("spin", "spin");
    wf.add_node(NodeSpec::new("start", NodeKind::Start));
    wf.add_node(node("a", NodeKind::Assignment, json!({"assignments": [{"variable": "x", "value": 1}]})));
    wf.add_node(NodeSpec::new("end", NodeKind::End));
    wf.connect("start", "a");
    wf.connect("a", "a");
    h.save(&wf).await;

    let id = h.engine.start(StartRequest::new("spin")).await.unwrap();
    let instance = h.engine.get_instance(&id).await.unwrap();

    assert_eq!(instance.status, InstanceStatus::Failed);
    assert!(instance.error.unwrap().contains("exceeded"));
    assert_eq!(instance.execution_log.len(), h.engine.config().max_steps_per_traversal);
}

#[tokio::test]
async fn test_events_trace_instance_lifecycle() {
    let h = harness();
    h.save(&linear("quick", vec![])).await;
    let mut events = h.engine.subscribe_events();

    h.engine.start(StartRequest::new("quick")).await.unwrap();

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        kinds.push(match event {
            ExecutionEvent::InstanceStarted { .. } => "started",
            ExecutionEvent::NodeStarted { .. } => "node_started",
            ExecutionEvent::NodeCompleted { .. } => "node_completed",
            ExecutionEvent::InstanceStatusChanged { status, .. } => {
                assert_eq!(status, InstanceStatus::Completed);
                "status"
            }
            _ => "other",
        });
    }
    assert_eq!(
        kinds,
        ["started", "node_started", "node_completed", "node_started", "node_completed", "status"]
    );
}
