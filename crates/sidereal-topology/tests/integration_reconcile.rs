//! Integration tests for single reconciliation passes.

mod common;

use std::time::Duration;

use common::fixtures::{latencies, triangle, triangle_nodes, NodeBuilder};
use common::TestOperator;
use rstest::rstest;
use sidereal_topology::{
    NodeFailureKind, PassTrigger, RawLatencies, ResolutionRule, TelemetryStatus, TopologyKey,
    TopologySpec,
};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn worked_example_publishes_normalised_costs() {
    let operator = TestOperator::new(triangle_nodes(), triangle());

    let report = operator.run_pass(&TopologySpec::all_nodes(30)).await;

    assert!(report.is_clean());
    assert_eq!(report.published.len(), 3);
    assert_eq!(operator.cost("A", "B"), Some(1));
    assert_eq!(operator.cost("A", "C"), Some(100));
    assert_eq!(operator.cost("B", "C"), Some(50));
    assert_eq!(operator.cost("C", "B"), Some(50));
    for node in ["A", "B", "C"] {
        assert_eq!(operator.cost(node, node), Some(1));
    }
}

#[tokio::test]
async fn empty_snapshot_yields_only_self_labels() {
    let operator = TestOperator::new(
        vec![NodeBuilder::new("A").build(), NodeBuilder::new("B").build()],
        RawLatencies::new(),
    );

    let report = operator.run_pass(&TopologySpec::all_nodes(30)).await;

    assert_eq!(report.telemetry, Some(TelemetryStatus::Fresh { sources: 0 }));
    assert_eq!(
        operator.cost_labels("A"),
        vec![("network.cost.A".to_owned(), "1".to_owned())]
    );
    assert_eq!(
        operator.cost_labels("B"),
        vec![("network.cost.B".to_owned(), "1".to_owned())]
    );
}

#[tokio::test]
async fn missing_named_node_is_reported_not_fatal() {
    let operator = TestOperator::new(triangle_nodes(), triangle());

    let report = operator
        .run_pass(&TopologySpec::with_names(["A", "X"], 30))
        .await;

    assert_eq!(report.resolved, vec!["A"]);
    assert_eq!(report.omitted.len(), 1);
    assert_eq!(report.omitted[0].name, "X");
    assert_eq!(report.requeue_after, Duration::from_secs(30));
    assert_eq!(operator.cost("A", "C"), Some(100));
    assert!(operator.cost_labels("B").is_empty());
}

#[tokio::test]
async fn names_take_priority_over_selector() {
    let nodes = vec![
        NodeBuilder::new("A").in_zone("eu").build(),
        NodeBuilder::new("B").in_zone("eu").build(),
        NodeBuilder::new("C").in_zone("us").build(),
    ];
    let operator = TestOperator::new(nodes, triangle());
    let mut spec = TopologySpec::with_names(["C"], 30);
    spec.node_selector = Some([("topology.kubernetes.io/zone".to_owned(), "eu".to_owned())].into());

    let report = operator.run_pass(&spec).await;

    assert_eq!(report.rule, Some(ResolutionRule::Names));
    assert_eq!(report.resolved, vec!["C"]);
    assert!(operator.cost_labels("A").is_empty());
    assert_eq!(operator.cost("C", "A"), Some(100));
}

#[tokio::test]
async fn selector_scopes_publication() {
    let nodes = vec![
        NodeBuilder::new("A").in_zone("eu").build(),
        NodeBuilder::new("B").in_zone("eu").build(),
        NodeBuilder::new("C").in_zone("us").build(),
    ];
    let operator = TestOperator::new(nodes, triangle());

    let report = operator
        .run_pass(&TopologySpec::with_selector([("topology.kubernetes.io/zone", "eu")], 30))
        .await;

    assert_eq!(report.rule, Some(ResolutionRule::Selector));
    assert_eq!(report.resolved, vec!["A", "B"]);
    assert!(operator.cost_labels("C").is_empty());
    // The scale still comes from the whole snapshot.
    assert_eq!(operator.cost("B", "C"), Some(50));
}

#[tokio::test]
async fn repeated_pass_is_idempotent() {
    let operator = TestOperator::new(triangle_nodes(), triangle());
    let spec = TopologySpec::all_nodes(30);

    operator.run_pass(&spec).await;
    let first: Vec<_> = ["A", "B", "C"].iter().map(|n| operator.cost_labels(n)).collect();

    let report = operator.run_pass(&spec).await;
    let second: Vec<_> = ["A", "B", "C"].iter().map(|n| operator.cost_labels(n)).collect();

    assert_eq!(first, second);
    assert!(report.published.iter().all(|p| p.unchanged));
    for node in ["A", "B", "C"] {
        assert_eq!(operator.inventory.patch_attempts(node), 1);
    }
}

#[rstest]
#[case::equal(latencies(&[("A", "B", 5.0), ("B", "A", 5.0)]))]
#[case::empty(RawLatencies::new())]
#[case::self_only(latencies(&[("A", "A", 0.5)]))]
#[tokio::test]
async fn degenerate_range_maps_to_min(#[case] raw: RawLatencies) {
    let operator = TestOperator::new(
        vec![NodeBuilder::new("A").build(), NodeBuilder::new("B").build()],
        raw,
    );

    operator.run_pass(&TopologySpec::all_nodes(30)).await;

    for node in ["A", "B"] {
        assert!(operator
            .cost_labels(node)
            .iter()
            .all(|(_, value)| value == "1"));
        assert_eq!(operator.cost(node, node), Some(1));
    }
}

#[tokio::test]
async fn negative_sample_stretches_range_and_is_clamped() {
    let operator = TestOperator::new(
        triangle_nodes(),
        latencies(&[("A", "B", -5.0), ("A", "C", 20.0), ("B", "C", 10.0)]),
    );

    let report = operator.run_pass(&TopologySpec::all_nodes(30)).await;

    assert!(report.is_clean());
    assert_eq!(report.range.map(|r| r.lowest), Some(-5.0));
    assert_eq!(operator.cost("A", "B"), Some(1));
    assert_eq!(operator.cost("A", "C"), Some(100));
    // floor((10 - -5) * 99 / 25) + 1
    assert_eq!(operator.cost("B", "C"), Some(60));
}

#[tokio::test]
async fn foreign_labels_survive_publication() {
    let nodes = vec![
        NodeBuilder::new("A").with_label("owner", "ops").build(),
        NodeBuilder::new("B").build(),
    ];
    let operator = TestOperator::new(nodes, latencies(&[("A", "B", 3.0)]));

    operator.run_pass(&TopologySpec::all_nodes(30)).await;

    let labels = operator.inventory.labels("A").unwrap_or_default();
    assert_eq!(labels.get("owner").map(String::as_str), Some("ops"));
}

#[tokio::test]
async fn stale_peer_labels_are_not_pruned() {
    let operator = TestOperator::new(triangle_nodes(), triangle());
    let spec = TopologySpec::all_nodes(30);
    operator.run_pass(&spec).await;

    operator
        .telemetry
        .set_latencies(latencies(&[("A", "B", 10.0), ("B", "A", 20.0)]));
    operator.run_pass(&spec).await;

    assert_eq!(operator.cost("A", "B"), Some(1));
    assert_eq!(operator.cost("A", "C"), Some(100));
}

#[tokio::test]
async fn concurrent_writer_forces_retry() {
    let operator = TestOperator::new(triangle_nodes(), triangle());
    operator.inventory.inject_conflicts("B", 2);

    let report = operator.run_pass(&TopologySpec::all_nodes(30)).await;

    assert!(report.failures.is_empty());
    let b = report.published_for("B").map(|p| p.attempts);
    assert_eq!(b, Some(3));
    assert_eq!(operator.cost("B", "C"), Some(50));
}

#[tokio::test]
async fn exhausted_retries_fail_only_that_node() {
    let operator = TestOperator::new(triangle_nodes(), triangle());
    operator.inventory.inject_conflicts("A", 100);

    let report = operator.run_pass(&TopologySpec::all_nodes(30)).await;

    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].node, "A");
    assert_eq!(report.failures[0].kind, NodeFailureKind::ConflictExhausted);
    assert_eq!(report.published.len(), 2);
    assert!(operator.cost_labels("A").is_empty());
}

#[tokio::test(start_paused = true)]
async fn slow_telemetry_falls_back_to_min_cost() {
    let operator = TestOperator::new(triangle_nodes(), triangle());
    operator.telemetry.set_delay(Some(Duration::from_secs(600)));

    let report = operator.run_pass(&TopologySpec::all_nodes(30)).await;

    assert!(report
        .telemetry
        .as_ref()
        .is_some_and(TelemetryStatus::is_unavailable));
    assert_eq!(report.published.len(), 3);
    assert_eq!(operator.cost_labels("A").len(), 1);
    assert_eq!(operator.cost("A", "A"), Some(1));
}

#[tokio::test(start_paused = true)]
async fn cancellation_aborts_in_flight_writes() {
    let operator = TestOperator::new(triangle_nodes(), triangle());
    operator
        .inventory
        .set_patch_delay(Some(Duration::from_millis(1500)));
    let cancel = CancellationToken::new();
    let key = TopologyKey::cluster("test");
    let spec = TopologySpec::all_nodes(30);

    let (report, ()) = tokio::join!(
        operator
            .reconciler
            .run_once(&key, &spec, PassTrigger::Manual, &cancel),
        async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            cancel.cancel();
        }
    );

    assert!(report.cancelled);
    assert_eq!(report.failures.len(), 3);
    assert!(report
        .failures
        .iter()
        .all(|f| f.kind == NodeFailureKind::Cancelled));
    for node in ["A", "B", "C"] {
        assert!(operator.cost_labels(node).is_empty());
    }
}
