//! End-to-end coverage of the context API on a single node.

mod common;

use std::time::Duration;

use serde_json::{json, Value};

use common::spawn_node;
use ctxmesh_sync::UpstreamClient;
use ctxmesh_types::{ContextId, NodeRole, StreamEventKind};

async fn put_context(base: &str, id: &str, body: Value) -> reqwest::Response {
    reqwest::Client::new()
        .put(format!("{base}/contexts/{id}"))
        .json(&body)
        .send()
        .await
        .unwrap()
}

#[tokio::test]
async fn write_read_and_version_bump() {
    let node = spawn_node(NodeRole::Central, None).await;

    let response = put_context(&node.base, "c1", json!({"context": {"x": 1}})).await;
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["contextId"], "c1");
    assert_eq!(body["metadata"]["version"], 1);

    let payload: Value = reqwest::get(format!("{}/contexts/c1", node.base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(payload, json!({"x": 1}));

    let body: Value = put_context(&node.base, "c1", json!({"context": {"x": 2}}))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(body["metadata"]["version"], 2);

    let payload: Value = reqwest::get(format!("{}/contexts/c1", node.base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(payload, json!({"x": 2}));
}

#[tokio::test]
async fn delete_then_recreate_resets_version() {
    let node = spawn_node(NodeRole::Central, None).await;
    let client = reqwest::Client::new();

    put_context(&node.base, "c1", json!({"context": {"x": 1}})).await;

    let response = client
        .delete(format!("{}/contexts/c1", node.base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["success"], true);

    let response = reqwest::get(format!("{}/contexts/c1", node.base)).await.unwrap();
    assert_eq!(response.status(), 404);

    let body: Value = put_context(&node.base, "c1", json!({"context": {"x": 3}}))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(body["metadata"]["version"], 1);
}

#[tokio::test]
async fn all_contexts_stream_announces_mutations() {
    let node = spawn_node(NodeRole::Central, None).await;
    let client = UpstreamClient::new(&node.base).unwrap();

    let mut stream = client.subscribe("test", "subscriber-1").await.unwrap();
    let connected = stream.next_event().await.unwrap().unwrap();
    assert_eq!(connected.event, StreamEventKind::Connected);

    put_context(&node.base, "c2", json!({"context": {"y": 1}})).await;

    let update = tokio::time::timeout(Duration::from_secs(1), stream.next_event())
        .await
        .expect("update within a second")
        .unwrap()
        .unwrap();
    assert_eq!(update.event, StreamEventKind::Update);
    assert_eq!(update.context_id.unwrap().as_str(), "c2");
    assert_eq!(update.metadata.unwrap().version, 1);

    reqwest::Client::new()
        .delete(format!("{}/contexts/c2", node.base))
        .send()
        .await
        .unwrap();

    let delete = tokio::time::timeout(Duration::from_secs(1), stream.next_event())
        .await
        .expect("delete within a second")
        .unwrap()
        .unwrap();
    assert_eq!(delete.event, StreamEventKind::Delete);
    assert_eq!(delete.context_id.unwrap().as_str(), "c2");
}

#[tokio::test]
async fn per_context_stream_filters_and_closes_on_delete() {
    let node = spawn_node(NodeRole::Central, None).await;
    let client = UpstreamClient::new(&node.base).unwrap();
    let id = ContextId::new("watched").unwrap();

    let mut stream = client.subscribe_context(&id).await.unwrap();
    assert_eq!(
        stream.next_event().await.unwrap().unwrap().event,
        StreamEventKind::Connected
    );

    // A mutation on a different context must not reach this stream.
    put_context(&node.base, "other", json!({"context": {"z": 1}})).await;
    put_context(&node.base, "watched", json!({"context": {"z": 2}})).await;

    let update = tokio::time::timeout(Duration::from_secs(1), stream.next_event())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(update.event, StreamEventKind::Update);
    assert_eq!(update.context_id.as_ref().unwrap().as_str(), "watched");

    reqwest::Client::new()
        .delete(format!("{}/contexts/watched", node.base))
        .send()
        .await
        .unwrap();

    let delete = tokio::time::timeout(Duration::from_secs(1), stream.next_event())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(delete.event, StreamEventKind::Delete);

    // Stream ends after the delete was delivered.
    let end = tokio::time::timeout(Duration::from_secs(1), stream.next_event())
        .await
        .unwrap()
        .unwrap();
    assert!(end.is_none());
}

#[tokio::test]
async fn listings_with_and_without_metadata() {
    let node = spawn_node(NodeRole::Central, None).await;

    put_context(&node.base, "a", json!({"context": 1})).await;
    put_context(
        &node.base,
        "b",
        json!({"context": 2, "metadata": {"agentId": "a-9"}}),
    )
    .await;

    let ids: Value = reqwest::get(format!("{}/contexts", node.base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(ids, json!(["a", "b"]));

    let entries: Value = reqwest::get(format!("{}/contexts?includeMetadata=true", node.base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let entries = entries.as_array().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[1]["id"], "b");
    assert_eq!(entries[1]["metadata"]["version"], 1);
    assert_eq!(entries[1]["metadata"]["agentId"], "a-9");
}

#[tokio::test]
async fn metadata_endpoint_and_error_mapping() {
    let node = spawn_node(NodeRole::Central, None).await;
    let client = reqwest::Client::new();

    put_context(&node.base, "c1", json!({"context": {"x": 1}})).await;

    let metadata: Value = reqwest::get(format!("{}/contexts/c1/metadata", node.base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(metadata["version"], 1);
    assert!(metadata.get("lastModified").is_some());

    // Unknown context.
    let response = reqwest::get(format!("{}/contexts/nope", node.base)).await.unwrap();
    assert_eq!(response.status(), 404);
    let body: Value = response.json().await.unwrap();
    assert!(body.get("error").is_some());

    // Id with a path separator (encoded so it reaches the handler).
    let response = reqwest::get(format!("{}/contexts/bad%2Fid", node.base)).await.unwrap();
    assert_eq!(response.status(), 400);

    // Body without a context payload.
    let response = client
        .put(format!("{}/contexts/c1", node.base))
        .json(&json!({"something": "else"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn health_status_and_metrics_endpoints() {
    let node = spawn_node(NodeRole::Central, None).await;

    put_context(&node.base, "c1", json!({"context": {}})).await;

    let health: Value = reqwest::get(format!("{}/health", node.base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["serverType"], "central");
    assert_eq!(health["regionId"], "test-region");
    assert!(health["nodeId"].as_str().is_some());

    let status: Value = reqwest::get(format!("{}/status", node.base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["serverType"], "central");
    assert_eq!(status["contexts"], 1);
    assert!(status["peers"].as_array().is_some());

    let response = reqwest::get(format!("{}/metrics", node.base)).await.unwrap();
    assert!(response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/plain"));
    let text = response.text().await.unwrap();
    assert!(text.contains("ctxmesh_saves_total 1"));
    assert!(text.contains("ctxmesh_contexts 1"));
}

#[tokio::test]
async fn replica_without_upstream_rejects_writes_but_serves_reads() {
    let node = spawn_node(NodeRole::Regional, None).await;

    let response = put_context(&node.base, "c1", json!({"context": {"x": 1}})).await;
    assert_eq!(response.status(), 503);

    // Reads keep working from local (empty) state.
    let ids: Value = reqwest::get(format!("{}/contexts", node.base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(ids, json!([]));
}
