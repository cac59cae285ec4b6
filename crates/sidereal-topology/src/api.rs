//! HTTP status API for operators.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;

use crate::reconcile::PassReport;
use crate::scheduler::ReconciliationScheduler;
use crate::types::TopologyKey;

/// Shared application state.
pub struct AppState {
    pub scheduler: Arc<ReconciliationScheduler>,
}

/// Creates the API router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health endpoints
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        // Pass reports
        .route("/topologies", get(list_topologies))
        .route("/topologies/{name}", get(get_cluster_topology))
        .route("/topologies/{namespace}/{name}", get(get_namespaced_topology))
        // Metrics
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Health check endpoint.
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse { status: "healthy" })
}

/// Ready once the desired-state source has synced, even if it holds no topologies.
async fn readiness_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let body = ReadyResponse {
        ready: state.scheduler.is_synced(),
        topologies: state.scheduler.scheduled_count(),
        passes: state.scheduler.passes_completed(),
    };
    if body.ready {
        (StatusCode::OK, Json(body))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(body))
    }
}

/// Latest report of every topology.
async fn list_topologies(State(state): State<Arc<AppState>>) -> Json<Vec<PassReport>> {
    Json(state.scheduler.reports())
}

async fn get_cluster_topology(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<PassReport>, StatusCode> {
    latest(&state, &TopologyKey::cluster(name))
}

async fn get_namespaced_topology(
    State(state): State<Arc<AppState>>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<PassReport>, StatusCode> {
    latest(&state, &TopologyKey::namespaced(namespace, name))
}

fn latest(state: &AppState, key: &TopologyKey) -> Result<Json<PassReport>, StatusCode> {
    state
        .scheduler
        .latest(key)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

/// Metrics endpoint.
async fn metrics(State(state): State<Arc<AppState>>) -> String {
    let reports = state.scheduler.reports();
    let degraded = reports.iter().filter(|r| !r.is_clean()).count();
    let labelled: usize = reports.iter().map(|r| r.published.len()).sum();

    format!(
        "# HELP topology_scheduled Number of scheduled topologies\n\
         # TYPE topology_scheduled gauge\n\
         topology_scheduled {}\n\n\
         # HELP topology_passes_total Reconciliation passes finished\n\
         # TYPE topology_passes_total counter\n\
         topology_passes_total {}\n\n\
         # HELP topology_node_failures_total Node publish failures\n\
         # TYPE topology_node_failures_total counter\n\
         topology_node_failures_total {}\n\n\
         # HELP topology_degraded Topologies whose last pass was degraded\n\
         # TYPE topology_degraded gauge\n\
         topology_degraded {}\n\n\
         # HELP topology_nodes_labelled Nodes with current cost labels\n\
         # TYPE topology_nodes_labelled gauge\n\
         topology_nodes_labelled {}\n",
        state.scheduler.scheduled_count(),
        state.scheduler.passes_completed(),
        state.scheduler.node_failures(),
        degraded,
        labelled,
    )
}

// Response types

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Serialize)]
struct ReadyResponse {
    ready: bool,
    topologies: usize,
    passes: u64,
}
