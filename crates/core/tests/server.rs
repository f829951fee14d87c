//! HTTP service flow: execute, poll, cancel, validate, and the workflow
//! store, driven over a real listener.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use trellis_core::config::AppConfig;
use trellis_core::registry::build_default_registry;
use trellis_core::server::{app_router, AppState};

async fn spawn_server() -> (String, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("temp dir should be created");
    let state = AppState::new(
        Arc::new(build_default_registry()),
        AppConfig::default(),
        dir.path().join("workflows"),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener should bind");
    let addr = listener.local_addr().expect("listener should have an address");

    tokio::spawn(async move {
        axum::serve(listener, app_router(state))
            .await
            .expect("server should run");
    });

    (format!("http://{addr}"), dir)
}

async fn poll_until_terminal(client: &reqwest::Client, base: &str, task_id: &str) -> Value {
    for _ in 0..400 {
        let body: Value = client
            .get(format!("{base}/api/status/{task_id}"))
            .send()
            .await
            .expect("status request should succeed")
            .json()
            .await
            .expect("status body should be JSON");

        match body["status"].as_str() {
            Some("pending") | Some("running") => {
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
            _ => return body,
        }
    }
    panic!("run did not reach a terminal status in time");
}

#[tokio::test]
async fn test_health() {
    let (base, _dir) = spawn_server().await;
    let body: Value = reqwest::get(format!("{base}/api/health"))
        .await
        .expect("health request should succeed")
        .json()
        .await
        .expect("health body should be JSON");
    assert_eq!(body["status"], json!("ok"));
}

#[tokio::test]
async fn test_execute_and_poll_to_completion() {
    let (base, _dir) = spawn_server().await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{base}/api/execute"))
        .json(&json!({
            "workflow": {
                "nodes": {
                    "src": { "type": "TextInput", "inputs": { "text": "  hi  " } },
                    "strip": { "type": "TextStrip", "inputs": {} }
                },
                "connections": [
                    { "from_node": "src", "from_port": "text", "to_node": "strip", "to_port": "text" }
                ]
            }
        }))
        .send()
        .await
        .expect("execute request should succeed");
    assert_eq!(response.status(), reqwest::StatusCode::CREATED);

    let body: Value = response.json().await.expect("execute body should be JSON");
    let task_id = body["task_id"].as_str().expect("task_id should be present");

    let terminal = poll_until_terminal(&client, &base, task_id).await;
    assert_eq!(terminal["status"], json!("completed"));
    assert_eq!(terminal["result"]["strip"]["text"], json!("hi"));
}

#[tokio::test]
async fn test_execute_rejects_invalid_workflow() {
    let (base, _dir) = spawn_server().await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{base}/api/execute"))
        .json(&json!({
            "workflow": {
                "nodes": {
                    "mystery": { "type": "NoSuchType", "inputs": {} }
                },
                "connections": []
            }
        }))
        .send()
        .await
        .expect("execute request should succeed");

    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.expect("error body should be JSON");
    assert!(body["error"]
        .as_str()
        .expect("error should be a string")
        .contains("unknown node type"));
}

#[tokio::test]
async fn test_status_of_unknown_task_is_not_found() {
    let (base, _dir) = spawn_server().await;

    let response = reqwest::get(format!("{base}/api/status/no-such-task"))
        .await
        .expect("status request should succeed");
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

    let body: Value = response.json().await.expect("status body should be JSON");
    assert_eq!(body["status"], json!("not_found"));
}

#[tokio::test]
async fn test_cancel_interrupts_a_hanging_run() {
    let (base, _dir) = spawn_server().await;
    let client = reqwest::Client::new();

    // A local socket that accepts connections and never answers keeps the
    // HttpRequest node suspended until the run is cancelled.
    let hang_listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("hang listener should bind");
    let hang_addr = hang_listener
        .local_addr()
        .expect("hang listener should have an address");
    tokio::spawn(async move {
        let mut held = Vec::new();
        loop {
            match hang_listener.accept().await {
                Ok((socket, _)) => held.push(socket),
                Err(_) => break,
            }
        }
    });

    let response = client
        .post(format!("{base}/api/execute"))
        .json(&json!({
            "workflow": {
                "nodes": {
                    "fetch": {
                        "type": "HttpRequest",
                        "inputs": { "url": format!("http://{hang_addr}/slow") }
                    }
                },
                "connections": []
            }
        }))
        .send()
        .await
        .expect("execute request should succeed");
    let body: Value = response.json().await.expect("execute body should be JSON");
    let task_id = body["task_id"]
        .as_str()
        .expect("task_id should be present")
        .to_string();

    tokio::time::sleep(Duration::from_millis(150)).await;

    let cancel_body: Value = client
        .post(format!("{base}/api/cancel/{task_id}"))
        .send()
        .await
        .expect("cancel request should succeed")
        .json()
        .await
        .expect("cancel body should be JSON");
    assert_eq!(cancel_body["status"], json!("cancelled"));

    let terminal = poll_until_terminal(&client, &base, &task_id).await;
    assert_eq!(terminal["status"], json!("cancelled"));
}

#[tokio::test]
async fn test_error_status_exposes_partial_results() {
    let (base, _dir) = spawn_server().await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{base}/api/execute"))
        .json(&json!({
            "workflow": {
                "nodes": {
                    "ok": { "type": "TextInput", "inputs": { "text": "fine" } },
                    "boom": { "type": "MathOperation", "inputs": { "a": 1, "b": 0, "operation": "divide" } }
                },
                "connections": []
            }
        }))
        .send()
        .await
        .expect("execute request should succeed");
    let body: Value = response.json().await.expect("execute body should be JSON");
    let task_id = body["task_id"].as_str().expect("task_id should be present");

    let terminal = poll_until_terminal(&client, &base, task_id).await;
    assert_eq!(terminal["status"], json!("error"));
    assert!(terminal["error"]
        .as_str()
        .expect("error should be a string")
        .contains("division by zero"));
    // Partial results stay inspectable on error. The independent text node
    // may or may not have completed before shutdown; when present it must
    // carry its output.
    if let Some(ok_results) = terminal["result"].get("ok") {
        assert_eq!(ok_results["text"], json!("fine"));
    }
}

#[tokio::test]
async fn test_validate_endpoint_reports_problems() {
    let (base, _dir) = spawn_server().await;
    let client = reqwest::Client::new();

    let body: Value = client
        .post(format!("{base}/api/validate"))
        .json(&json!({
            "nodes": {
                "strip": { "type": "TextStrip", "inputs": { "text": "x" } }
            },
            "connections": [],
            "result_node_id": "strip",
            "result_port_name": "nope"
        }))
        .send()
        .await
        .expect("validate request should succeed")
        .json()
        .await
        .expect("validate body should be JSON");

    assert_eq!(body["valid"], json!(false));
    let errors = body["errors"].as_array().expect("errors should be an array");
    assert!(errors
        .iter()
        .any(|e| e.as_str().unwrap_or_default().contains("ForEachItem")));
    assert!(errors
        .iter()
        .any(|e| e.as_str().unwrap_or_default().contains("no output port 'nope'")));
}

#[tokio::test]
async fn test_validate_endpoint_accepts_good_sub_workflow() {
    let (base, _dir) = spawn_server().await;
    let client = reqwest::Client::new();

    let body: Value = client
        .post(format!("{base}/api/validate"))
        .json(&json!({
            "nodes": {
                "item": { "type": "ForEachItem", "inputs": {} },
                "strip": { "type": "TextStrip", "inputs": {} }
            },
            "connections": [
                { "from_node": "item", "from_port": "item", "to_node": "strip", "to_port": "text" }
            ],
            "result_node_id": "strip",
            "result_port_name": "text"
        }))
        .send()
        .await
        .expect("validate request should succeed")
        .json()
        .await
        .expect("validate body should be JSON");

    assert_eq!(body["valid"], json!(true));
}

#[tokio::test]
async fn test_nodes_endpoint_lists_descriptors() {
    let (base, _dir) = spawn_server().await;

    let body: Value = reqwest::get(format!("{base}/api/nodes"))
        .await
        .expect("nodes request should succeed")
        .json()
        .await
        .expect("nodes body should be JSON");

    let descriptors = body.as_array().expect("nodes body should be an array");
    let foreach = descriptors
        .iter()
        .find(|d| d["node_type"] == json!("ForEach"))
        .expect("ForEach descriptor should be listed");
    assert_eq!(foreach["category"], json!("control"));
}

#[tokio::test]
async fn test_workflow_store_crud() {
    let (base, _dir) = spawn_server().await;
    let client = reqwest::Client::new();

    let workflow = json!({
        "nodes": {
            "src": { "type": "TextInput", "inputs": { "text": "saved" } }
        },
        "connections": []
    });

    let response = client
        .post(format!("{base}/api/workflows"))
        .json(&json!({ "name": "smoke", "workflow": workflow }))
        .send()
        .await
        .expect("save request should succeed");
    assert_eq!(response.status(), reqwest::StatusCode::CREATED);

    let list: Value = client
        .get(format!("{base}/api/workflows"))
        .send()
        .await
        .expect("list request should succeed")
        .json()
        .await
        .expect("list body should be JSON");
    assert_eq!(list["workflows"], json!(["smoke"]));

    let loaded: Value = client
        .get(format!("{base}/api/workflows/smoke"))
        .send()
        .await
        .expect("load request should succeed")
        .json()
        .await
        .expect("load body should be JSON");
    assert_eq!(loaded, workflow);

    let response = client
        .delete(format!("{base}/api/workflows/smoke"))
        .send()
        .await
        .expect("delete request should succeed");
    assert_eq!(response.status(), reqwest::StatusCode::NO_CONTENT);

    let response = client
        .get(format!("{base}/api/workflows/smoke"))
        .send()
        .await
        .expect("load request should succeed");
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_workflow_name_sanitization_over_http() {
    let (base, _dir) = spawn_server().await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{base}/api/workflows"))
        .json(&json!({ "name": "nested/escape", "workflow": { "nodes": {} } }))
        .send()
        .await
        .expect("save request should succeed");
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
}
