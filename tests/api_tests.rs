//! HTTP surface tests driven through `tower::ServiceExt::oneshot`.

mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, BodyDataStream};
use axum::http::{Request, StatusCode};
use chrono::Utc;
use futures::StreamExt;
use mcp_hub::api::{create_router, AppState};
use mcp_hub::instance::{InstanceManager, MemoryInstanceStore};
use mcp_hub::logging::{LogBuffer, LogEntry, LogLevel};
use mcp_hub::mcp::BackendConnector;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tower::ServiceExt;

use common::{initialize_request, MockConnector};

struct Harness {
    app: axum::Router,
    logs: Arc<LogBuffer>,
    connector: Arc<MockConnector>,
}

fn harness() -> Harness {
    let connector = Arc::new(
        MockConnector::new()
            .with_backend("fs", &["read", "write"])
            .with_backend("web", &["fetch"]),
    );
    let manager = Arc::new(
        InstanceManager::new(Arc::new(MemoryInstanceStore::new()))
            .with_connector(Arc::clone(&connector) as Arc<dyn BackendConnector>)
            .with_public_base("http://hub.test"),
    );
    let logs = Arc::new(LogBuffer::new());
    let app = create_router(Arc::new(AppState::new(manager, Arc::clone(&logs))));
    Harness {
        app,
        logs,
        connector,
    }
}

async fn send(app: &axum::Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(value) => {
            request = request.header("content-type", "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };
    let response = app
        .clone()
        .oneshot(request.body(body).expect("request should build"))
        .await
        .expect("router should respond");
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body should be readable");
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
    };
    (status, value)
}

async fn create_instance(app: &axum::Router, nodes: Value) -> String {
    let (status, body) = send(
        app,
        "POST",
        "/api/instances",
        Some(json!({ "name": "Docs", "nodes": nodes })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    body["id"].as_str().expect("created instance has an id").to_string()
}

fn fs_node() -> Value {
    json!({ "id": "n1", "name": "fs", "type": "stdio", "command": "/opt/mcp/fs" })
}

/// Read SSE blocks until one with the given event name arrives; returns its data.
async fn next_event(stream: &mut BodyDataStream, buffer: &mut String, wanted: &str) -> String {
    loop {
        while let Some(end) = buffer.find("\n\n") {
            let block: String = buffer.drain(..end + 2).collect();
            let mut event = "message";
            let mut data = Vec::new();
            for line in block.lines() {
                if let Some(name) = line.strip_prefix("event:") {
                    event = name.trim();
                } else if let Some(value) = line.strip_prefix("data:") {
                    data.push(value.trim_start().to_string());
                }
            }
            if event == wanted {
                return data.join("\n");
            }
        }
        let chunk = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("event should arrive in time")
            .expect("stream should stay open")
            .expect("chunk should be readable");
        buffer.push_str(&String::from_utf8_lossy(&chunk));
    }
}

#[tokio::test]
async fn health_reports_healthy() {
    let harness = harness();
    let (status, body) = send(&harness.app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn instance_crud_round_trip() {
    let harness = harness();
    let id = create_instance(&harness.app, json!([fs_node()])).await;

    let (status, body) = send(&harness.app, "GET", &format!("/api/instances/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "stopped");
    assert_eq!(
        body["accessAddress"],
        format!("http://hub.test/api/mcp/{id}/sse")
    );

    let (status, body) = send(
        &harness.app,
        "PUT",
        &format!("/api/instances/{id}"),
        Some(json!({ "name": "Renamed", "description": "docs search" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "Renamed");
    assert_eq!(body["nodes"][0]["id"], "n1");

    let (status, body) = send(&harness.app, "GET", "/api/instances", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().map(Vec::len), Some(1));

    let (status, _) = send(&harness.app, "DELETE", &format!("/api/instances/{id}"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, body) = send(&harness.app, "DELETE", &format!("/api/instances/{id}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().is_some_and(|e| e.contains(&id)));
}

#[tokio::test]
async fn invalid_nodes_are_rejected_as_bad_request() {
    let harness = harness();
    let (status, body) = send(
        &harness.app,
        "POST",
        "/api/instances",
        Some(json!({
            "name": "Broken",
            "nodes": [{ "id": "n1", "type": "stream", "url": "ftp://example.com" }]
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().is_some_and(|e| e.contains("http")));
}

#[tokio::test]
async fn lifecycle_endpoints_drive_the_router() {
    let harness = harness();
    let id = create_instance(&harness.app, json!([fs_node()])).await;

    let (status, body) = send(&harness.app, "GET", &format!("/api/instances/{id}/tools"), None).await;
    assert_eq!(status, StatusCode::CONFLICT, "tools of a stopped instance: {body}");

    let (status, body) = send(&harness.app, "POST", &format!("/api/instances/{id}/start"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "status": "running" }));

    let (_, body) = send(&harness.app, "GET", &format!("/api/instances/{id}/tools"), None).await;
    let names: Vec<&str> = body
        .as_array()
        .expect("tools should be a list")
        .iter()
        .filter_map(|tool| tool["name"].as_str())
        .collect();
    assert_eq!(names, vec!["read", "write"]);

    let (status, body) = send(
        &harness.app,
        "PUT",
        &format!("/api/instances/{id}/nodes"),
        Some(json!({
            "nodes": [
                fs_node(),
                { "id": "n2", "name": "web", "type": "stdio", "command": "/opt/mcp/web" }
            ]
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let views: Vec<(&str, &str)> = body
        .as_array()
        .expect("node views should be a list")
        .iter()
        .map(|view| {
            (
                view["name"].as_str().unwrap_or_default(),
                view["status"].as_str().unwrap_or_default(),
            )
        })
        .collect();
    assert_eq!(views, vec![("fs", "connected"), ("web", "connected")]);
    assert_eq!(harness.connector.connect_count("fs"), 1, "survivor is not reconnected");

    let (_, body) = send(&harness.app, "POST", &format!("/api/instances/{id}/restart"), None).await;
    assert_eq!(body["status"], "running");

    let (_, body) = send(&harness.app, "POST", &format!("/api/instances/{id}/stop"), None).await;
    assert_eq!(body["status"], "stopped");

    let (_, body) = send(&harness.app, "GET", &format!("/api/instances/{id}/nodes"), None).await;
    assert_eq!(body[0]["status"], "disconnected");
}

#[tokio::test]
async fn logs_endpoint_filters_and_clears() {
    let harness = harness();
    for (level, message) in [
        (LogLevel::Info, "started"),
        (LogLevel::Warn, "backend slow"),
        (LogLevel::Error, "backend failed"),
    ] {
        harness.logs.push(LogEntry {
            timestamp: Utc::now(),
            level,
            category: "backend".into(),
            message: message.into(),
            instance_id: Some("inst-1".into()),
        });
    }

    let (status, body) = send(&harness.app, "GET", "/api/instances/inst-1/logs?level=warn", None).await;
    assert_eq!(status, StatusCode::OK);
    let messages: Vec<&str> = body
        .as_array()
        .expect("logs should be a list")
        .iter()
        .filter_map(|entry| entry["message"].as_str())
        .collect();
    assert_eq!(messages, vec!["backend slow", "backend failed"]);

    let (status, _) = send(&harness.app, "GET", "/api/instances/inst-1/logs?level=loud", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, body) = send(&harness.app, "DELETE", "/api/instances/inst-1/logs", None).await;
    assert_eq!(body, json!({ "cleared": 3 }));
    let (_, body) = send(&harness.app, "GET", "/api/instances/inst-1/logs", None).await;
    assert_eq!(body, json!([]));
}

#[tokio::test]
async fn sse_requires_a_running_instance() {
    let harness = harness();
    let id = create_instance(&harness.app, json!([fs_node()])).await;

    let (status, _) = send(&harness.app, "GET", &format!("/api/mcp/{id}/sse"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(&harness.app, "GET", "/api/mcp/missing/sse", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn sse_session_handshake_and_message_errors() {
    let harness = harness();
    let id = create_instance(&harness.app, json!([fs_node()])).await;
    send(&harness.app, "POST", &format!("/api/instances/{id}/start"), None).await;

    let response = harness
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/api/mcp/{id}/sse"))
                .body(Body::empty())
                .expect("request should build"),
        )
        .await
        .expect("router should respond");
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response
        .headers()
        .get("content-type")
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("text/event-stream")));

    let mut stream = response.into_body().into_data_stream();
    let mut buffer = String::new();
    let endpoint = next_event(&mut stream, &mut buffer, "endpoint").await;
    let prefix = format!("/api/mcp/{id}/messages?sessionId=");
    assert!(endpoint.starts_with(&prefix), "unexpected endpoint {endpoint}");

    let post = |uri: String, body: String| {
        let app = harness.app.clone();
        async move {
            app.oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .expect("request should build"),
            )
            .await
            .expect("router should respond")
            .status()
        }
    };

    assert_eq!(
        post(endpoint.clone(), initialize_request(1)).await,
        StatusCode::ACCEPTED
    );
    let reply: Value = serde_json::from_str(&next_event(&mut stream, &mut buffer, "message").await)
        .expect("message event should carry json");
    assert_eq!(reply["id"], 1);
    assert_eq!(reply["result"]["serverInfo"]["name"], "Docs");

    assert_eq!(
        post(format!("/api/mcp/{id}/messages"), initialize_request(2)).await,
        StatusCode::BAD_REQUEST
    );
    assert_eq!(
        post(format!("{prefix}unknown"), initialize_request(3)).await,
        StatusCode::NOT_FOUND
    );
    assert_eq!(
        post(endpoint.clone(), "{not json".to_string()).await,
        StatusCode::BAD_REQUEST
    );
    assert_eq!(
        post(format!("/api/mcp/missing/messages?sessionId=x"), initialize_request(4)).await,
        StatusCode::NOT_FOUND
    );
}
