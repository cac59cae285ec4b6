//! Integration tests for the status API.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::fixtures::{triangle, triangle_nodes};
use common::TestOperator;
use serde_json::Value;
use sidereal_topology::{api, TopologyKey, TopologySpec};
use tower::ServiceExt;

async fn get_json(operator: &TestOperator, uri: &str) -> (StatusCode, Value) {
    let response = api::router(operator.app_state.clone())
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, value)
}

#[tokio::test]
async fn readiness_follows_source_sync() {
    let operator = TestOperator::new(triangle_nodes(), triangle());

    let (status, body) = get_json(&operator, "/ready").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["ready"], false);

    // A cluster with no Topology resources is still ready.
    operator.scheduler.mark_synced();
    let (status, body) = get_json(&operator, "/ready").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["topologies"], 0);
    assert_eq!(body["passes"], 0);

    let mut reports = operator.scheduler.subscribe();
    operator
        .scheduler
        .apply(TopologyKey::cluster("mesh"), TopologySpec::all_nodes(300))
        .unwrap();
    reports.recv().await.unwrap();

    let (status, body) = get_json(&operator, "/ready").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["topologies"], 1);
    assert_eq!(body["passes"], 1);

    operator.scheduler.shutdown().await;
}

#[tokio::test]
async fn topology_report_lists_costs_and_omissions() {
    let operator = TestOperator::new(triangle_nodes(), triangle());
    let mut reports = operator.scheduler.subscribe();
    operator
        .scheduler
        .apply(
            TopologyKey::namespaced("default", "mesh"),
            TopologySpec::with_names(["A", "X"], 300),
        )
        .unwrap();
    reports.recv().await.unwrap();

    let (status, body) = get_json(&operator, "/topologies").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().map(Vec::len), Some(1));

    let (status, report) = get_json(&operator, "/topologies/default/mesh").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["trigger"], "event");
    assert_eq!(report["rule"], "names");
    assert_eq!(report["resolved"], serde_json::json!(["A"]));
    assert_eq!(report["omitted"][0]["name"], "X");
    assert_eq!(report["telemetry"]["status"], "fresh");
    assert_eq!(report["published"][0]["labels"]["network.cost.C"], "100");
    assert_eq!(report["requeue_after_secs"], 300);

    operator.scheduler.shutdown().await;
}

#[tokio::test]
async fn unknown_topology_is_not_found() {
    let operator = TestOperator::new(triangle_nodes(), triangle());
    let (status, _) = get_json(&operator, "/topologies/default/missing").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
