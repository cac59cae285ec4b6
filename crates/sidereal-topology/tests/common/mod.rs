//! Common test utilities for topology integration tests.

#![allow(dead_code)]

pub mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use sidereal_topology::{
    api::AppState, cost_label_key, InMemoryNodeInventory, NodeRecord, PassReport, PassTrigger,
    RawLatencies, Reconciler, ReconciliationScheduler, StaticLatencySource, TopologyConfig,
    TopologyKey, TopologySpec,
};
use tokio_util::sync::CancellationToken;

/// Complete controller setup with in-memory cluster and telemetry.
pub struct TestOperator {
    pub inventory: Arc<InMemoryNodeInventory>,
    pub telemetry: StaticLatencySource,
    pub reconciler: Arc<Reconciler>,
    pub scheduler: Arc<ReconciliationScheduler>,
    pub app_state: Arc<AppState>,
}

impl TestOperator {
    /// Creates an operator over `nodes` with telemetry reporting `latencies`.
    pub fn new(nodes: Vec<NodeRecord>, latencies: RawLatencies) -> Self {
        Self::with_config(nodes, latencies, &Self::config())
    }

    /// Creates an operator with custom configuration.
    pub fn with_config(
        nodes: Vec<NodeRecord>,
        latencies: RawLatencies,
        config: &TopologyConfig,
    ) -> Self {
        let inventory = Arc::new(InMemoryNodeInventory::with_nodes(nodes));
        let telemetry = StaticLatencySource::with_latencies(latencies);
        let reconciler = Arc::new(Reconciler::new(
            inventory.clone(),
            Arc::new(telemetry.clone()),
            config,
        ));
        let scheduler = Arc::new(ReconciliationScheduler::new(reconciler.clone()));
        let app_state = Arc::new(AppState {
            scheduler: scheduler.clone(),
        });

        Self {
            inventory,
            telemetry,
            reconciler,
            scheduler,
            app_state,
        }
    }

    /// Default configuration with short timeouts.
    pub fn config() -> TopologyConfig {
        let mut config = TopologyConfig::default();
        config.telemetry.timeout = Duration::from_secs(2);
        config.cluster.request_timeout = Duration::from_secs(2);
        config.cluster.max_conflict_retries = 3;
        config
    }

    /// Runs one pass outside the scheduler.
    pub async fn run_pass(&self, spec: &TopologySpec) -> PassReport {
        self.reconciler
            .run_once(
                &TopologyKey::cluster("test"),
                spec,
                PassTrigger::Manual,
                &CancellationToken::new(),
            )
            .await
    }

    /// Published cost from `node` towards `peer`, if labelled.
    pub fn cost(&self, node: &str, peer: &str) -> Option<u32> {
        self.inventory
            .labels(node)?
            .get(&cost_label_key(peer))
            .and_then(|v| v.parse().ok())
    }

    /// Every cost label on `node`.
    pub fn cost_labels(&self, node: &str) -> Vec<(String, String)> {
        self.inventory
            .labels(node)
            .unwrap_or_default()
            .into_iter()
            .filter(|(k, _)| k.starts_with("network.cost."))
            .collect()
    }
}
