//! HTTP gateway
//!
//! Thin axum layer over [`ClusterCoordinator`]. Every route except the
//! internal `/raft` endpoint gets a request id and a logging span.

use crate::common::metrics::METRICS;
use crate::common::tracing_middleware::request_tracing_middleware;
use crate::common::Error;
use crate::consensus::{ConsensusGroup, Envelope, RaftGroup};
use crate::coordinator::cluster::ClusterCoordinator;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderValue, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tracing::{debug, warn};

/// Response header naming the leader's address on a 307.
pub const LEADER_HEADER: &str = "x-kvmesh-leader";

const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct GatewayState {
    pub coordinator: Arc<ClusterCoordinator<RaftGroup>>,
}

pub fn create_router(state: GatewayState) -> Router {
    Router::new()
        .route("/kv", post(write_key))
        .route("/kv/:key", get(get_key))
        .route("/join", post(join))
        .route("/leave", post(leave))
        .route("/status", get(status))
        .route("/ring/:key", get(route_key))
        .route("/snapshot", post(snapshot))
        .route("/metrics", get(metrics))
        .route("/health", get(health))
        .route_layer(middleware::from_fn(request_tracing_middleware))
        .route("/raft", post(raft_message))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .with_state(state)
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.to_http_status();
        let body = Json(json!({
            "error": self.to_string(),
            "retryable": self.is_retryable(),
        }));
        let mut response = (status, body).into_response();
        if let Error::NotLeader(leader) = &self {
            if let Ok(value) = HeaderValue::from_str(leader) {
                response.headers_mut().insert(LEADER_HEADER, value);
            }
        }
        response
    }
}

#[derive(Debug, Deserialize)]
struct WriteRequest {
    op: String,
    key: String,
    #[serde(default)]
    value: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JoinRequest {
    addr: String,
    id: String,
}

#[derive(Debug, Deserialize)]
struct LeaveRequest {
    id: String,
}

async fn get_key(State(state): State<GatewayState>, Path(key): Path<String>) -> Response {
    match state.coordinator.get(&key) {
        Ok(Some(value)) => Json(json!({ "key": key, "value": value })).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "key not found", "key": key })),
        )
            .into_response(),
        Err(e) => e.into_response(),
    }
}

async fn write_key(
    State(state): State<GatewayState>,
    Json(request): Json<WriteRequest>,
) -> Result<Json<serde_json::Value>, Error> {
    let commit = match (request.op.as_str(), request.value) {
        ("set", Some(value)) => state.coordinator.set(&request.key, &value).await?,
        ("set", None) => {
            return Err(Error::MalformedCommand("set requires a value".into()));
        }
        ("delete", _) => state.coordinator.delete(&request.key).await?,
        (op, _) => return Err(Error::MalformedCommand(format!("unknown op {:?}", op))),
    };
    Ok(Json(json!({
        "key": request.key,
        "index": commit.index,
        "term": commit.term,
    })))
}

async fn join(
    State(state): State<GatewayState>,
    Json(request): Json<JoinRequest>,
) -> Result<Json<serde_json::Value>, Error> {
    if request.id.trim().is_empty() || request.addr.trim().is_empty() {
        return Err(Error::InvalidConfig("join needs both id and addr".into()));
    }
    state.coordinator.join(&request.id, &request.addr).await?;
    Ok(Json(json!({ "status": "ok", "id": request.id, "addr": request.addr })))
}

async fn leave(
    State(state): State<GatewayState>,
    Json(request): Json<LeaveRequest>,
) -> Result<Json<serde_json::Value>, Error> {
    state.coordinator.leave(&request.id).await?;
    Ok(Json(json!({ "status": "ok", "id": request.id })))
}

async fn status(State(state): State<GatewayState>) -> Result<Json<serde_json::Value>, Error> {
    let cluster = state.coordinator.status().await?;
    let raft = state.coordinator.consensus().status();
    Ok(Json(json!({ "cluster": cluster, "raft": raft })))
}

async fn route_key(
    State(state): State<GatewayState>,
    Path(key): Path<String>,
) -> Result<Json<serde_json::Value>, Error> {
    let route = state.coordinator.route(&key)?;
    Ok(Json(json!(route)))
}

async fn snapshot(State(state): State<GatewayState>) -> Result<Json<serde_json::Value>, Error> {
    let index = state.coordinator.consensus().snapshot_now().await?;
    Ok(Json(json!({ "index": index })))
}

async fn metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        METRICS.to_prometheus(),
    )
}

async fn health(State(state): State<GatewayState>) -> Response {
    let group = state.coordinator.consensus();
    let raft = group.status();
    let body = json!({
        "status": if raft.halted.is_some() { "halted" } else { "ok" },
        "node_id": group.local_node().id,
        "role": raft.role,
        "term": raft.term,
        "version": crate::VERSION,
    });
    if raft.halted.is_some() {
        (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
    } else {
        Json(body).into_response()
    }
}

async fn raft_message(State(state): State<GatewayState>, body: Bytes) -> StatusCode {
    match Envelope::decode(&body) {
        Ok(envelope) => {
            debug!(from = %envelope.from, "Raft message received");
            state.coordinator.consensus().deliver(envelope);
            StatusCode::NO_CONTENT
        }
        Err(e) => {
            warn!(error = %e, "Rejected raft message");
            StatusCode::BAD_REQUEST
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    #[tokio::test]
    async fn test_not_leader_response_carries_leader() {
        let response = Error::NotLeader("10.0.0.2:7000".into()).into_response();
        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(
            response.headers().get(LEADER_HEADER).unwrap(),
            "10.0.0.2:7000"
        );

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["retryable"], true);
    }

    #[tokio::test]
    async fn test_apply_timeout_response() {
        let response = Error::ApplyTimeout(Duration::from_millis(50)).into_response();
        assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
        assert!(response.headers().get(LEADER_HEADER).is_none());
    }
}
