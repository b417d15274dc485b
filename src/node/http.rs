//! HTTP surface of a node daemon
//!
//! Protocol calls live under `/nomad`. A rejection is a normal answer
//! (200 with `accepted: false`); non-2xx statuses mean the node could not
//! process the call at all.
//!
//! While the repository is still loading, the daemon serves
//! `startup_router` instead, which reports `STARTING` on `/state`.

use crate::common::{Error, LogicalServerState};
use crate::node::registry::CapabilityRegistry;
use crate::protocol::{
    AcceptRejectBody, CommitMessage, ForceStateMessage, NomadServer, PrepareMessage,
    RollbackMessage,
};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Router,
};
use serde_json::json;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};

/// Protocol messages carry whole topologies; keep bodies bounded anyway
const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

#[derive(Clone)]
pub struct NodeState {
    pub server: Arc<NomadServer>,
    pub registry: CapabilityRegistry,
    /// Configured role, reported once the node is serving the protocol
    pub logical_state: LogicalServerState,
}

pub fn create_router(state: NodeState) -> Router {
    Router::new()
        // Protocol
        .route("/nomad/discover", axum::routing::get(discover))
        .route("/nomad/prepare", axum::routing::post(prepare))
        .route("/nomad/commit", axum::routing::post(commit))
        .route("/nomad/rollback", axum::routing::post(rollback))
        .route("/nomad/force", axum::routing::post(force_state))
        // Inspection
        .route("/state", axum::routing::get(logical_state))
        .route("/topology", axum::routing::get(topology))
        .route("/capabilities", axum::routing::get(capabilities))
        .route("/health", axum::routing::get(health))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES)),
        )
        .with_state(state)
}

/// Placeholder surface while the node loads its repository
pub fn startup_router(name: &str) -> Router {
    let name = name.to_string();
    Router::new()
        .route(
            "/state",
            axum::routing::get(|| async {
                axum::Json(json!({ "state": LogicalServerState::Starting }))
            }),
        )
        .route(
            "/health",
            axum::routing::get(move || async move {
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    axum::Json(json!({ "status": "starting", "node": name })),
                )
            }),
        )
        .layer(TraceLayer::new_for_http())
}

fn error_response(e: Error) -> Response {
    (
        e.to_http_status(),
        axum::Json(json!({ "error": e.to_string() })),
    )
        .into_response()
}

async fn discover(State(state): State<NodeState>) -> Response {
    match state.server.discover() {
        Ok(response) => (StatusCode::OK, axum::Json(response)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn prepare(
    State(state): State<NodeState>,
    axum::Json(message): axum::Json<PrepareMessage>,
) -> impl IntoResponse {
    let body: AcceptRejectBody = state.server.prepare(&message).into();
    axum::Json(body)
}

async fn commit(
    State(state): State<NodeState>,
    axum::Json(message): axum::Json<CommitMessage>,
) -> impl IntoResponse {
    let body: AcceptRejectBody = state.server.commit(&message).into();
    axum::Json(body)
}

async fn rollback(
    State(state): State<NodeState>,
    axum::Json(message): axum::Json<RollbackMessage>,
) -> impl IntoResponse {
    let body: AcceptRejectBody = state.server.rollback(&message).into();
    axum::Json(body)
}

async fn force_state(
    State(state): State<NodeState>,
    axum::Json(message): axum::Json<ForceStateMessage>,
) -> impl IntoResponse {
    let body: AcceptRejectBody = state.server.force_state(&message).into();
    axum::Json(body)
}

async fn logical_state(State(state): State<NodeState>) -> impl IntoResponse {
    axum::Json(json!({ "state": state.logical_state }))
}

async fn topology(State(state): State<NodeState>) -> Response {
    match state.server.topology_view() {
        Ok(view) => (StatusCode::OK, axum::Json(view)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn capabilities(State(state): State<NodeState>) -> impl IntoResponse {
    axum::Json(state.registry.describe())
}

async fn health(State(state): State<NodeState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        axum::Json(json!({
            "status": "ok",
            "node": state.server.name(),
            "version": env!("CARGO_PKG_VERSION"),
        })),
    )
}
