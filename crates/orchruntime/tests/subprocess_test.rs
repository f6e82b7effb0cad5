mod common;

use chrono::{Duration, Utc};
use common::{harness, harness_with, linear, node, Harness, ScriptedHttp};
use orchcore::{
    InstanceStatus, LifecycleStatus, NodeKind, NodeSpec, StartRequest, Storage, WaitKind,
    WorkflowDefinition, WorkflowVersion,
};
use serde_json::json;

fn subprocess(id: &str, data: serde_json::Value) -> NodeSpec {
    node(id, NodeKind::Subprocess, data)
}

async fn save_child(h: &Harness, child: WorkflowDefinition) {
    let mut child = child;
    child.subprocess_compatible = true;
    h.save(&child).await;
}

#[tokio::test]
async fn test_sync_child_maps_outputs_into_parent() {
    let h = harness();
    save_child(
        &h,
        linear(
            "scoring",
            vec![node("calc", NodeKind::Calculate, json!({"expression": "base + 5", "output_variable": "score"}))],
        ),
    )
    .await;
    h.save(&linear(
        "parent",
        vec![subprocess(
            "sub",
            json!({
                "workflowId": "scoring",
                "inputMapping": {"base": "amount"},
                "outputMapping": {"final_score": "score"},
            }),
        )],
    ))
    .await;

    let id = h
        .engine
        .start(StartRequest::new("parent").with_input("amount", json!(10)))
        .await
        .unwrap();
    let parent = h.engine.get_instance(&id).await.unwrap();

    assert_eq!(parent.status, InstanceStatus::Completed);
    assert_eq!(parent.variables["final_score"], json!(15));
    assert_eq!(parent.children.len(), 1);
    let child_id = parent.children[0].instance_id.clone();
    assert_eq!(
        parent.variables["sub"],
        json!({"child_instance_id": child_id, "status": "completed", "outputs": {"final_score": 15}})
    );

    let child = h.engine.get_instance(&child_id).await.unwrap();
    assert_eq!(child.parent_instance_id.as_deref(), Some(id.as_str()));
    assert_eq!(child.nesting_level, 1);
    assert_eq!(child.triggered_by, format!("subprocess:{id}"));
}

#[tokio::test]
async fn test_isolated_child_sees_only_mapped_inputs() {
    for (isolated, expected_keys) in [(true, vec!["a"]), (false, vec!["a", "x", "y"])] {
        let h = harness();
        save_child(&h, linear("child", vec![])).await;
        h.save(&linear(
            "parent",
            vec![subprocess(
                "sub",
                json!({"workflow_id": "child", "input_mapping": {"a": "x"}, "isolated": isolated}),
            )],
        ))
        .await;

        let id = h
            .engine
            .start(
                StartRequest::new("parent")
                    .with_input("x", json!(1))
                    .with_input("y", json!(2)),
            )
            .await
            .unwrap();
        let parent = h.engine.get_instance(&id).await.unwrap();
        let child = h
            .engine
            .get_instance(&parent.children[0].instance_id)
            .await
            .unwrap();

        let mut keys: Vec<&str> = child.variables.keys().map(String::as_str).collect();
        keys.sort();
        assert_eq!(keys, expected_keys, "isolated = {isolated}");
        assert_eq!(child.variables["a"], json!(1));
    }
}

#[tokio::test]
async fn test_input_mapping_accepts_expressions() {
    let h = harness();
    save_child(&h, linear("child", vec![])).await;
    h.save(&linear(
        "parent",
        vec![subprocess(
            "sub",
            json!({"workflow_id": "child", "input_mapping": {"doubled": "${x} * 2"}, "isolated": true}),
        )],
    ))
    .await;

    let id = h
        .engine
        .start(StartRequest::new("parent").with_input("x", json!(21)))
        .await
        .unwrap();
    let parent = h.engine.get_instance(&id).await.unwrap();
    let child = h
        .engine
        .get_instance(&parent.children[0].instance_id)
        .await
        .unwrap();

    assert_eq!(child.variables["doubled"], json!(42));
}

#[tokio::test]
async fn test_waiting_child_resumes_parent_when_it_finishes() {
    let h = harness();
    save_child(
        &h,
        linear("review", vec![node("check", NodeKind::Task, json!({"title": "Check"}))]),
    )
    .await;
    h.save(&linear(
        "parent",
        vec![subprocess(
            "sub",
            json!({"workflow_id": "review", "output_mapping": {"verdict": "check.decision"}}),
        )],
    ))
    .await;

    let id = h.engine.start(StartRequest::new("parent")).await.unwrap();
    let parent = h.engine.get_instance(&id).await.unwrap();
    assert_eq!(parent.status, InstanceStatus::Waiting);
    let wait = parent.waiting_for.unwrap();
    assert_eq!(wait.kind, WaitKind::Subprocess);
    assert!(parent.children.is_empty());

    let child_id = wait.id;
    let child = h.engine.get_instance(&child_id).await.unwrap();
    assert_eq!(child.status, InstanceStatus::Waiting);

    h.engine
        .resume(&child_id, "check", Some(json!({"decision": "approve"})))
        .await
        .unwrap();

    let child = h.engine.get_instance(&child_id).await.unwrap();
    assert_eq!(child.status, InstanceStatus::Completed);
    let parent = h.engine.get_instance(&id).await.unwrap();
    assert_eq!(parent.status, InstanceStatus::Completed);
    assert_eq!(parent.variables["verdict"], json!("approve"));
    assert_eq!(parent.children.len(), 1);
    assert_eq!(parent.children[0].instance_id, child_id);
    assert_eq!(parent.children[0].node_id, "sub");
    assert_eq!(parent.children[0].status, InstanceStatus::Completed);
}

#[tokio::test]
async fn test_paused_parent_keeps_child_outcome_until_resumed() {
    let h = harness();
    save_child(
        &h,
        linear("review", vec![node("check", NodeKind::Task, json!({"title": "Check"}))]),
    )
    .await;
    h.save(&linear(
        "parent",
        vec![subprocess(
            "sub",
            json!({"workflow_id": "review", "output_mapping": {"verdict": "check.decision"}}),
        )],
    ))
    .await;

    let id = h.engine.start(StartRequest::new("parent")).await.unwrap();
    let child_id = h.engine.get_instance(&id).await.unwrap().waiting_for.unwrap().id;
    h.engine.pause(&id).await.unwrap();

    h.engine
        .resume(&child_id, "check", Some(json!({"decision": "approve"})))
        .await
        .unwrap();

    let parent = h.engine.get_instance(&id).await.unwrap();
    assert_eq!(parent.status, InstanceStatus::Paused);
    assert!(parent.waiting_for.is_none());
    assert_eq!(parent.variables["verdict"], json!("approve"));
    assert_eq!(parent.children.len(), 1);
    assert_eq!(parent.children[0].status, InstanceStatus::Completed);

    h.engine.resume(&id, "sub", None).await.unwrap();
    let parent = h.engine.get_instance(&id).await.unwrap();
    assert_eq!(parent.status, InstanceStatus::Completed);
    assert_eq!(parent.variables["verdict"], json!("approve"));
    assert_eq!(parent.children.len(), 1);
}

#[tokio::test]
async fn test_failed_child_fails_parent() {
    let h = harness_with(ScriptedHttp::status(404, "missing"));
    save_child(
        &h,
        linear("fetch", vec![node("call", NodeKind::Action, json!({"url": "https://svc/item"}))]),
    )
    .await;
    h.save(&linear("parent", vec![subprocess("sub", json!({"workflow_id": "fetch"}))]))
        .await;

    let id = h.engine.start(StartRequest::new("parent")).await.unwrap();
    let parent = h.engine.get_instance(&id).await.unwrap();

    assert_eq!(parent.status, InstanceStatus::Failed);
    let child_id = &parent.children[0].instance_id;
    assert_eq!(
        parent.error.as_deref(),
        Some(format!("Subprocess {child_id} failed: HTTP 404: missing").as_str())
    );
    assert_eq!(parent.children[0].status, InstanceStatus::Failed);
}

#[tokio::test]
async fn test_cancelled_child_fails_waiting_parent() {
    let h = harness();
    save_child(&h, linear("review", vec![node("check", NodeKind::Task, json!({}))])).await;
    h.save(&linear("parent", vec![subprocess("sub", json!({"workflow_id": "review"}))]))
        .await;
    let id = h.engine.start(StartRequest::new("parent")).await.unwrap();
    let child_id = h.engine.get_instance(&id).await.unwrap().waiting_for.unwrap().id;

    h.engine.cancel(&child_id).await.unwrap();

    let parent = h.engine.get_instance(&id).await.unwrap();
    assert_eq!(parent.status, InstanceStatus::Failed);
    assert!(parent.error.unwrap().ends_with("failed: cancelled"));
}

#[tokio::test]
async fn test_nesting_limit_is_enforced() {
    let h = harness();
    save_child(&h, linear("leaf", vec![])).await;
    h.save(&linear("parent", vec![subprocess("sub", json!({"workflow_id": "leaf"}))]))
        .await;

    let mut at_four = StartRequest::new("parent");
    at_four.nesting_level = 4;
    let ok = h.engine.start(at_four).await.unwrap();
    assert_eq!(
        h.engine.get_instance(&ok).await.unwrap().status,
        InstanceStatus::Completed
    );

    let mut at_five = StartRequest::new("parent");
    at_five.nesting_level = 5;
    let limited = h.engine.start(at_five).await.unwrap();
    let instance = h.engine.get_instance(&limited).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Failed);
    assert!(instance.error.unwrap().contains("Maximum subprocess nesting level (5) exceeded"));
    assert!(instance.children.is_empty());

    let mut at_six = StartRequest::new("leaf");
    at_six.nesting_level = 6;
    assert!(h.engine.start(at_six).await.is_err());
}

#[tokio::test]
async fn test_validation_reports_errors_and_warnings() {
    let h = harness();
    let manager = h.engine.subprocesses();

    let missing = manager.validate("ghost", "latest").await.unwrap();
    assert!(!missing.valid);
    assert!(missing.errors[0].contains("not found"));

    h.save(&linear("archived", vec![]).with_status(LifecycleStatus::Archived))
        .await;
    let archived = manager.validate("archived", "latest").await.unwrap();
    assert!(!archived.valid);
    assert!(archived.errors[0].contains("archived"));

    h.save(&linear("recursive", vec![subprocess("again", json!({"workflow_id": "recursive"}))]))
        .await;
    let recursive = manager.validate("recursive", "latest").await.unwrap();
    assert!(recursive.errors.iter().any(|e| e.contains("invokes itself")));

    let mut headless = WorkflowDefinition::new("headless", "headless");
    headless.add_node(NodeSpec::new("end", NodeKind::End));
    h.save(&headless).await;
    let headless = manager.validate("headless", "latest").await.unwrap();
    assert!(headless.errors.iter().any(|e| e.contains("no start node")));

    let mut open = WorkflowDefinition::new("open", "open");
    open.add_node(NodeSpec::new("start", NodeKind::Start));
    open.add_node(node("work", NodeKind::Assignment, json!({})));
    open.add_node(node("stray", NodeKind::Assignment, json!({})));
    open.connect("start", "work");
    h.save(&open).await;
    let open = manager.validate("open", "latest").await.unwrap();
    assert!(open.valid, "warnings do not invalidate: {:?}", open.errors);
    assert_eq!(open.warnings.len(), 3, "{:?}", open.warnings);
    assert!(open.warnings.iter().any(|w| w.contains("not marked subprocess compatible")));
    assert!(open.warnings.iter().any(|w| w.contains("no end node")));
    assert!(open.warnings.iter().any(|w| w.contains("stray")));
}

#[tokio::test]
async fn test_invalid_child_fails_subprocess_node() {
    let h = harness();
    h.save(&linear("parent", vec![subprocess("sub", json!({"workflow_id": "ghost"}))]))
        .await;

    let id = h.engine.start(StartRequest::new("parent")).await.unwrap();
    let parent = h.engine.get_instance(&id).await.unwrap();

    assert_eq!(parent.status, InstanceStatus::Failed);
    assert!(parent
        .error
        .unwrap()
        .starts_with("Subprocess validation failed: Workflow ghost"));
}

#[tokio::test]
async fn test_published_version_is_pinned() {
    let h = harness();
    let mut v1 = linear("child", vec![node("mark", NodeKind::Assignment, json!({"assignments": [{"variable": "v", "value": 1}]}))]);
    v1.subprocess_compatible = true;
    let mut v2 = linear("child", vec![node("mark", NodeKind::Assignment, json!({"assignments": [{"variable": "v", "value": 2}]}))]);
    v2.subprocess_compatible = true;
    let mut live = linear("child", vec![node("mark", NodeKind::Assignment, json!({"assignments": [{"variable": "v", "value": 3}]}))]);
    live.subprocess_compatible = true;
    h.save(&live).await;

    let now = Utc::now();
    for (version, definition, created_at) in [
        ("1", v1, now - Duration::days(2)),
        ("2", v2, now - Duration::days(1)),
    ] {
        h.store
            .save_workflow_version(&WorkflowVersion {
                workflow_id: "child".into(),
                version: version.into(),
                status: LifecycleStatus::Published,
                created_at,
                definition: definition.with_status(LifecycleStatus::Published),
            })
            .await
            .unwrap();
    }
    h.save(&linear(
        "parent",
        vec![subprocess(
            "sub",
            json!({"workflow_id": "child", "version": "published", "output_mapping": {"v": "v"}}),
        )],
    ))
    .await;

    let id = h.engine.start(StartRequest::new("parent")).await.unwrap();
    let parent = h.engine.get_instance(&id).await.unwrap();
    let child = h
        .engine
        .get_instance(&parent.children[0].instance_id)
        .await
        .unwrap();

    assert_eq!(child.workflow_version.as_deref(), Some("2"));
    assert_eq!(parent.variables["v"], json!(2));

    let exact = h
        .engine
        .start(StartRequest::new("child").with_version("1"))
        .await
        .unwrap();
    let exact = h.engine.get_instance(&exact).await.unwrap();
    assert_eq!((exact.workflow_version.as_deref(), exact.variables["v"].clone()), (Some("1"), json!(1)));

    let latest = h
        .engine
        .start(StartRequest::new("child").with_version("latest"))
        .await
        .unwrap();
    let latest = h.engine.get_instance(&latest).await.unwrap();
    assert_eq!((latest.workflow_version, latest.variables["v"].clone()), (None, json!(3)));
}

#[tokio::test]
async fn test_execution_tree_nests_children() {
    let h = harness();
    save_child(&h, linear("leaf", vec![])).await;
    save_child(&h, linear("middle", vec![subprocess("inner", json!({"workflow_id": "leaf"}))])).await;
    h.save(&linear("root", vec![subprocess("outer", json!({"workflow_id": "middle"}))]))
        .await;

    let id = h.engine.start(StartRequest::new("root")).await.unwrap();

    let tree = h.engine.execution_tree(&id, 10).await.unwrap();
    assert_eq!(tree.instance_id, id);
    assert_eq!(tree.status, InstanceStatus::Completed);
    assert_eq!(tree.children.len(), 1);
    let middle = &tree.children[0];
    assert_eq!((middle.workflow_id.as_str(), middle.nesting_level), ("middle", 1));
    assert_eq!(middle.children.len(), 1);
    let leaf = &middle.children[0];
    assert_eq!((leaf.workflow_id.as_str(), leaf.nesting_level), ("leaf", 2));
    assert!(!leaf.has_error);
    assert!(leaf.duration_seconds >= 0.0);

    let shallow = h.engine.execution_tree(&id, 1).await.unwrap();
    assert!(shallow.children[0].children.is_empty());

    assert!(h.engine.execution_tree("nope", 3).await.is_err());
}
