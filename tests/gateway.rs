//! HTTP gateway tests, driven through the router without a socket

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use kvmesh::common::config::{RaftConfig, RingConfig};
use kvmesh::common::storage::MemStore;
use kvmesh::common::tracing_middleware::REQUEST_ID_HEADER;
use kvmesh::consensus::{ClusterNode, ConsensusGroup, LocalRouter, RaftGroup, RaftGroupConfig};
use kvmesh::coordinator::http::{create_router, GatewayState};
use kvmesh::coordinator::{ClusterCoordinator, ReplicatedStateMachine, StaticMembership};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

struct Harness {
    router: Router,
    group: Arc<RaftGroup>,
    _dir: tempfile::TempDir,
}

async fn single_node() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let raft = RaftConfig {
        tick_interval_ms: 10,
        ..RaftConfig::default()
    };
    let node = ClusterNode::new("n1", "n1:7000");
    let machine = Arc::new(ReplicatedStateMachine::new(Arc::new(MemStore::new())));
    let group = Arc::new(
        RaftGroup::open(
            RaftGroupConfig {
                node: node.clone(),
                data_dir: dir.path().to_path_buf(),
                bootstrap: true,
                raft: raft.clone(),
            },
            machine.clone(),
            Arc::new(LocalRouter::new()),
        )
        .await
        .unwrap(),
    );
    for _ in 0..300 {
        if group.is_leader() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(group.is_leader());

    let coordinator = Arc::new(ClusterCoordinator::new(
        group.clone(),
        machine,
        RingConfig::default(),
        &raft,
    ));
    coordinator.spawn_membership_sync(Arc::new(StaticMembership::new([node])));

    Harness {
        router: create_router(GatewayState { coordinator }),
        group,
        _dir: dir,
    }
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, json)
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn set_get_delete_over_http() {
    let h = single_node().await;

    let (status, body) = send(&h.router, get("/kv/nope")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["key"], "nope");

    let (status, body) = send(&h.router, post("/kv", json!({"op": "set", "key": "x", "value": "1"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["index"].as_u64().unwrap() > 0);

    let (status, body) = send(&h.router, get("/kv/x")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"key": "x", "value": "1"}));

    let (status, _) = send(&h.router, post("/kv", json!({"op": "delete", "key": "x"}))).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(&h.router, get("/kv/x")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    h.group.shutdown().await;
}

#[tokio::test]
async fn rejects_bad_writes() {
    let h = single_node().await;

    let (status, body) = send(&h.router, post("/kv", json!({"op": "append", "key": "x"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["retryable"], false);

    let (status, _) = send(&h.router, post("/kv", json!({"op": "set", "key": "x"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Rejected writes leave the log alone.
    assert_eq!(h.group.status().applied_index, h.group.status().commit_index);
    let (status, _) = send(&h.router, get("/kv/x")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    h.group.shutdown().await;
}

#[tokio::test]
async fn status_ring_and_health() {
    let h = single_node().await;

    let (status, body) = send(&h.router, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["role"], "leader");

    let (status, body) = send(&h.router, get("/status")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cluster"]["node_id"], "n1");
    assert_eq!(body["cluster"]["members"][0]["address"], "n1:7000");
    assert_eq!(body["raft"]["role"], "leader");

    let mut owners = Value::Null;
    for _ in 0..100 {
        let (status, body) = send(&h.router, get("/ring/some-key")).await;
        if status == StatusCode::OK {
            owners = body["owners"].clone();
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(owners, json!([{"id": "n1", "address": "n1:7000"}]));

    h.group.shutdown().await;
}

#[tokio::test]
async fn request_id_is_echoed_except_on_raft_route() {
    let h = single_node().await;

    let request = Request::builder()
        .uri("/health")
        .header(REQUEST_ID_HEADER, "req-42")
        .body(Body::empty())
        .unwrap();
    let response = h.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.headers().get(REQUEST_ID_HEADER).unwrap(), "req-42");

    let request = Request::builder()
        .method("POST")
        .uri("/raft")
        .body(Body::from("not an envelope"))
        .unwrap();
    let response = h.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(response.headers().get(REQUEST_ID_HEADER).is_none());

    h.group.shutdown().await;
}

#[tokio::test]
async fn metrics_are_prometheus_text() {
    let h = single_node().await;
    send(&h.router, post("/kv", json!({"op": "set", "key": "m", "value": "1"}))).await;

    let response = h.router.clone().oneshot(get("/metrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("# TYPE kvmesh_writes_total counter"));
    assert!(text.contains("kvmesh_write_duration_ms_count"));

    h.group.shutdown().await;
}
