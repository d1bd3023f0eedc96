//! End-to-end command scenarios against an in-memory accessibility tree.

use axkit_core::platform::memory::{MemoryTree, NodeSpec};
use axkit_core::prelude::*;
use axkit_core::{parse_id, Response};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

const PID: i32 = 4242;

/// A login window: three buttons on one row (inserted out of screen order)
/// and two text fields stacked above them.
fn login_window() -> (MemoryTree, usize) {
    let tree = MemoryTree::new();
    let app = tree.add_app("Login", Some("com.example.login"), PID);
    let window = tree.add_node(
        app,
        NodeSpec::new("AXWindow")
            .title("Sign in")
            .frame(0.0, 0.0, 500.0, 400.0)
            .child(
                NodeSpec::new("AXButton")
                    .title("Help")
                    .frame(300.0, 300.0, 80.0, 24.0)
                    .action("AXPress"),
            )
            .child(
                NodeSpec::new("AXButton")
                    .title("Submit")
                    .frame(20.0, 304.0, 80.0, 24.0)
                    .action("AXPress"),
            )
            .child(
                NodeSpec::new("AXButton")
                    .title("Cancel")
                    .frame(160.0, 302.0, 80.0, 24.0)
                    .action("AXPress"),
            )
            .child(
                NodeSpec::new("AXTextField")
                    .description("Password")
                    .frame(20.0, 120.0, 300.0, 24.0),
            )
            .child(
                NodeSpec::new("AXTextField")
                    .description("Email")
                    .frame(20.0, 60.0, 300.0, 24.0),
            ),
    );
    (tree, window)
}

fn orchestrator(tree: &MemoryTree) -> Orchestrator {
    Orchestrator::new(Arc::new(tree.clone()), Config::default())
}

fn run(orch: &Orchestrator, envelope: Value) -> Response {
    let env: CommandEnvelope = serde_json::from_value(envelope).unwrap();
    orch.execute(&env)
}

fn error_kind(response: &Response) -> String {
    serde_json::to_value(response).unwrap()["error"]["kind"]
        .as_str()
        .unwrap_or_default()
        .to_string()
}

fn title_of<'a>(elements: &'a [Value], id: &str) -> &'a Value {
    let record = elements
        .iter()
        .find(|e| e["id"] == id)
        .unwrap_or_else(|| panic!("no element {}", id));
    if record["title"].is_null() {
        &record["description"]
    } else {
        &record["title"]
    }
}

#[test]
fn and_locator_returns_only_the_submit_button() {
    let (tree, _) = login_window();
    let response = run(
        &orchestrator(&tree),
        json!({
            "command": "query",
            "application": "Login",
            "locator": {
                "criteria": [
                    {"attribute": "role", "value": "AXButton"},
                    {"attribute": "title", "value": "Submit"}
                ],
                "matchAll": true
            }
        }),
    );
    assert!(response.success, "{:?}", response.error);
    let data = response.data.unwrap();
    assert_eq!(data["count"], 1);
    assert_eq!(data["elements"][0]["role"], "AXButton");
    assert_eq!(data["elements"][0]["title"], "Submit");
}

#[test]
fn partial_application_name_resolves() {
    let (tree, _) = login_window();
    let response = run(
        &orchestrator(&tree),
        json!({
            "command": "query",
            "application": "log",
            "locator": {"criteria": [{"attribute": "title", "value": "Help"}]}
        }),
    );
    assert!(response.success, "{:?}", response.error);
    assert_eq!(response.data.unwrap()["count"], 1);

    // A longer name sharing the prefix scores lower.
    tree.add_app("Login Helper", None, 4343);
    let response = run(
        &orchestrator(&tree),
        json!({
            "command": "query",
            "application": "Logi",
            "locator": {"criteria": [{"attribute": "title", "value": "Help"}]}
        }),
    );
    assert!(response.success, "{:?}", response.error);
}

#[test]
fn collect_all_assigns_ids_in_position_order() {
    let (tree, _) = login_window();
    let response = run(
        &orchestrator(&tree),
        json!({
            "command": "collectAll",
            "application": "com.example.login",
            "detailLevel": "essential",
            "locator": {
                "criteria": [
                    {"attribute": "role", "value": "AXButton"},
                    {"attribute": "role", "value": "AXTextField"}
                ],
                "matchAll": false
            }
        }),
    );
    assert!(response.success, "{:?}", response.error);
    let data = response.data.unwrap();
    let elements = data["result"]["elements"].as_array().unwrap().clone();

    let mut ids: Vec<&str> = elements.iter().map(|e| e["id"].as_str().unwrap()).collect();
    ids.sort();
    assert_eq!(ids, vec!["B1", "B2", "B3", "T1", "T2"]);

    // Buttons share a row within tolerance, so x decides.
    assert_eq!(title_of(&elements, "B1"), "Submit");
    assert_eq!(title_of(&elements, "B2"), "Cancel");
    assert_eq!(title_of(&elements, "B3"), "Help");
    assert_eq!(title_of(&elements, "T1"), "Email");
    assert_eq!(title_of(&elements, "T2"), "Password");
    assert_eq!(data["result"]["app"]["window_title"], "Sign in");
}

#[test]
fn ids_are_unique_deterministic_and_parse_back() {
    let (tree, _) = login_window();
    let orch = orchestrator(&tree);
    let collect = json!({"command": "collectAll", "application": "PID:4242"});

    let first = run(&orch, collect.clone()).data.unwrap();
    let second = run(&orch, collect).data.unwrap();
    let ids = |data: &Value| -> Vec<String> {
        data["result"]["elements"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["id"].as_str().unwrap().to_string())
            .collect()
    };

    let a = ids(&first);
    assert_eq!(a, ids(&second));
    let unique: HashSet<&String> = a.iter().collect();
    assert_eq!(unique.len(), a.len());
    for id in &a {
        let parsed = parse_id(id).unwrap();
        assert_eq!(format!("{}{}", parsed.category.prefix(), parsed.index), *id);
    }
}

#[test]
fn failed_path_hint_does_not_fall_back_to_full_scan() {
    let (tree, window) = login_window();
    // A "Back" button exists, but not under a toolbar.
    tree.add_node(window, NodeSpec::new("AXButton").title("Back").action("AXPress"));

    let response = run(
        &orchestrator(&tree),
        json!({
            "command": "query",
            "application": "Login",
            "locator": {
                "pathFromRoot": [
                    {"attribute": "role", "value": "AXWindow", "depth": 1},
                    {"attribute": "identifier", "value": "toolbar", "depth": 3}
                ],
                "criteria": [{"attribute": "title", "value": "Back"}]
            }
        }),
    );
    assert!(!response.success);
    assert_eq!(error_kind(&response), "LOCATOR_PATH_NOT_FOUND");
    assert_eq!(response.error.unwrap().context.unwrap()["step"], 1);
}

#[test]
fn path_hint_narrows_search_root() {
    let (tree, window) = login_window();
    tree.add_node(
        window,
        NodeSpec::new("AXToolbar")
            .identifier("toolbar")
            .child(NodeSpec::new("AXButton").title("Back").action("AXPress")),
    );

    let response = run(
        &orchestrator(&tree),
        json!({
            "command": "query",
            "application": "Login",
            "locator": {
                "pathFromRoot": [
                    {"attribute": "role", "value": "AXWindow", "depth": 1},
                    {"attribute": "identifier", "value": "toolbar", "depth": 3}
                ],
                "criteria": [{"attribute": "role", "value": "AXButton"}]
            }
        }),
    );
    assert!(response.success, "{:?}", response.error);
    let data = response.data.unwrap();
    assert_eq!(data["count"], 1);
    assert_eq!(data["elements"][0]["title"], "Back");
}

#[test]
fn destroyed_element_is_stale_on_action_by_id() {
    let (tree, window) = login_window();
    let dir = tempfile::tempdir().unwrap();
    let orch = orchestrator(&tree).with_session_store(SessionStore::new(dir.path(), 5).unwrap());

    let response = run(
        &orch,
        json!({
            "command": "collectAll",
            "application": "Login",
            "sessionId": "new"
        }),
    );
    assert!(response.success, "{:?}", response.error);
    let data = response.data.unwrap();
    let session = data["session_id"].as_str().unwrap().to_string();
    let submit = data["result"]["elements"]
        .as_array()
        .unwrap()
        .iter()
        .find(|e| e["title"] == "Submit")
        .unwrap()["id"]
        .as_str()
        .unwrap()
        .to_string();

    let press = json!({
        "command": "performAction",
        "sessionId": session,
        "elementId": submit,
        "action": "press"
    });

    // Still alive: resolves and presses.
    let response = run(&orch, press.clone());
    assert!(response.success, "{:?}", response.error);
    let submit_node = tree.children_of(window)[1];
    assert_eq!(tree.performed_actions(submit_node), vec!["AXPress"]);

    tree.destroy(submit_node);
    let response = run(&orch, press);
    assert!(!response.success);
    assert_eq!(error_kind(&response), "STALE_ELEMENT");
}

#[test]
fn depth_bound_is_respected() {
    let tree = MemoryTree::new();
    let app = tree.add_app("Deep", None, 7);
    let mut spec = NodeSpec::new("AXStaticText").value("leaf");
    for _ in 0..8 {
        spec = NodeSpec::new("AXGroup").child(spec);
    }
    tree.add_node(app, spec);

    let response = run(
        &orchestrator(&tree),
        json!({
            "command": "collectAll",
            "application": "Deep",
            "maxDepthForSearch": 3
        }),
    );
    assert!(response.success, "{:?}", response.error);
    let elements = response.data.unwrap()["result"]["elements"].as_array().unwrap().clone();
    assert_eq!(elements.len(), 4);
    assert!(elements.iter().all(|e| e["depth"].as_u64().unwrap() <= 3));
}

#[test]
fn slow_tree_returns_within_budget() {
    let tree = MemoryTree::new();
    let app = tree.add_app("Slow", None, 8);
    for i in 0..40 {
        tree.add_node(
            app,
            NodeSpec::new("AXGroup")
                .child(NodeSpec::new("AXButton").title(&format!("b{}", i)))
                .child(NodeSpec::new("AXStaticText").value("x")),
        );
    }
    tree.set_latency(Duration::from_millis(2));
    let orch = orchestrator(&tree);

    let started = Instant::now();
    let response = run(
        &orch,
        json!({"command": "collectAll", "application": "Slow", "timeoutMs": 40}),
    );
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(response.success, "{:?}", response.error);
    let data = response.data.unwrap();
    assert_eq!(data["result"]["partial"], true);
    assert!(data["result"]["elements"].as_array().unwrap().len() < 121);

    let started = Instant::now();
    let response = run(
        &orch,
        json!({
            "command": "query",
            "application": "Slow",
            "locator": {"criteria": [{"attribute": "title", "value": "missing"}]},
            "timeoutMs": 40
        }),
    );
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(error_kind(&response), "SEARCH_TIMEOUT");
}

#[test]
fn batch_continues_or_stops_by_policy() {
    let (tree, _) = login_window();
    let orch = orchestrator(&tree);
    let commands = json!([
        {"command": "query", "application": "Login", "locator": {"criteria": [{"attribute": "title", "value": "Nope"}]}},
        {"command": "query", "application": "Login", "locator": {"criteria": [{"attribute": "title", "value": "Help"}]}}
    ]);

    let keep_going = run(
        &orch,
        json!({"command": "batch", "failFast": false, "commands": commands.clone()}),
    );
    assert!(!keep_going.success);
    assert_eq!(keep_going.data.as_ref().unwrap()["completed"], 2);
    assert_eq!(keep_going.data.unwrap()["failed"], 1);

    let stop = run(
        &orch,
        json!({"command": "batch", "failFast": true, "commands": commands}),
    );
    assert_eq!(stop.data.as_ref().unwrap()["completed"], 1);
    assert_eq!(error_kind(&stop), "ELEMENT_NOT_FOUND");
}
