//! One reconciliation pass: resolve, fetch, normalise, publish.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::TopologyConfig;
use crate::cost::CostRange;
use crate::inventory::NodeInventory;
use crate::publisher::{LabelPublisher, NodeFailure, NodeOutcome, PublishedNode};
use crate::resolver::{NodeSetResolver, Omission, ResolutionRule, ResolvedNodes};
use crate::telemetry::{fetch_snapshot, LatencySource, SnapshotFetch, TelemetryStatus};
use crate::types::{NodeName, TopologyKey, TopologySpec};

/// What started a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PassTrigger {
    /// The desired-state resource was created or updated.
    Event,
    /// The run interval elapsed since the previous pass.
    Timer,
    /// Requested directly, outside the scheduler.
    Manual,
}

impl fmt::Display for PassTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Event => f.write_str("event"),
            Self::Timer => f.write_str("timer"),
            Self::Manual => f.write_str("manual"),
        }
    }
}

/// Everything that happened during one pass.
#[derive(Debug, Clone, Serialize)]
pub struct PassReport {
    /// Resource the pass ran for.
    pub key: TopologyKey,
    /// What started the pass.
    pub trigger: PassTrigger,
    /// Wall-clock start.
    pub started_at: DateTime<Utc>,
    /// Wall-clock end.
    pub finished_at: DateTime<Utc>,
    /// Resolution rule that applied, if resolution succeeded.
    pub rule: Option<ResolutionRule>,
    /// Nodes in scope.
    pub resolved: Vec<NodeName>,
    /// Named nodes that were skipped.
    pub omitted: Vec<Omission>,
    /// Why the node set could not be resolved.
    pub resolution_error: Option<String>,
    /// How the latency snapshot was obtained; absent if the pass ended earlier.
    pub telemetry: Option<TelemetryStatus>,
    /// Global cost range of the snapshot.
    pub range: Option<CostRange>,
    /// Nodes whose labels are current.
    pub published: Vec<PublishedNode>,
    /// Nodes that could not be written.
    pub failures: Vec<NodeFailure>,
    /// True if the pass was cancelled before completing.
    pub cancelled: bool,
    /// Delay before the next timer-triggered pass.
    #[serde(rename = "requeue_after_secs", serialize_with = "as_secs")]
    pub requeue_after: Duration,
}

impl PassReport {
    fn start(key: &TopologyKey, trigger: PassTrigger, requeue_after: Duration) -> Self {
        Self {
            key: key.clone(),
            trigger,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            rule: None,
            resolved: Vec::new(),
            omitted: Vec::new(),
            resolution_error: None,
            telemetry: None,
            range: None,
            published: Vec::new(),
            failures: Vec::new(),
            cancelled: false,
            requeue_after,
        }
    }

    /// Returns true if every node in scope was published and nothing was degraded.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        !self.cancelled
            && self.resolution_error.is_none()
            && self.omitted.is_empty()
            && self.failures.is_empty()
            && !self.telemetry.as_ref().is_some_and(TelemetryStatus::is_unavailable)
    }

    /// Labels published for `node` in this pass.
    #[must_use]
    pub fn published_for(&self, node: &str) -> Option<&PublishedNode> {
        self.published.iter().find(|p| p.node == node)
    }
}

fn as_secs<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_secs())
}

/// Runs reconciliation passes.
///
/// The reconciler holds no per-resource state; callers serialise passes for
/// the same resource.
pub struct Reconciler {
    resolver: NodeSetResolver,
    publisher: LabelPublisher,
    telemetry: Arc<dyn LatencySource>,
    telemetry_timeout: Duration,
}

impl Reconciler {
    /// Creates a reconciler over the given cluster inventory and latency source.
    pub fn new(
        inventory: Arc<dyn NodeInventory>,
        telemetry: Arc<dyn LatencySource>,
        config: &TopologyConfig,
    ) -> Self {
        Self {
            resolver: NodeSetResolver::new(Arc::clone(&inventory), config.cluster.request_timeout),
            publisher: LabelPublisher::new(inventory, &config.cluster),
            telemetry,
            telemetry_timeout: config.telemetry.timeout,
        }
    }

    /// Runs one pass for `key`.
    ///
    /// Never fails. Resolution errors, telemetry outages and node failures
    /// are recorded in the returned report, which always carries the
    /// topology's run interval as the requeue delay.
    pub async fn run_once(
        &self,
        key: &TopologyKey,
        spec: &TopologySpec,
        trigger: PassTrigger,
        cancel: &CancellationToken,
    ) -> PassReport {
        let clock = Instant::now();
        let mut report = PassReport::start(key, trigger, spec.run_interval());

        let resolved = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            resolved = self.resolver.resolve(spec) => Some(resolved),
        };
        let resolved = match resolved {
            None => return Self::finish(report, clock, true),
            Some(Ok(resolved)) => resolved,
            Some(Err(e)) => {
                warn!(topology = %key, error = %e, "failed to resolve node set");
                report.resolution_error = Some(e.to_string());
                return Self::finish(report, clock, false);
            }
        };
        Self::record_resolution(&mut report, &resolved);

        let fetched = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            fetched = fetch_snapshot(self.telemetry.as_ref(), self.telemetry_timeout) => Some(fetched),
        };
        let Some(SnapshotFetch { snapshot, status }) = fetched else {
            return Self::finish(report, clock, true);
        };
        report.telemetry = Some(status);

        // Computed over the whole snapshot before anything is published.
        let range = CostRange::from_snapshot(&snapshot);
        report.range = Some(range);

        let outcomes = self
            .publisher
            .publish_all(&resolved.nodes, &snapshot, range, cancel)
            .await;
        for outcome in outcomes {
            match outcome {
                NodeOutcome::Published(p) => report.published.push(p),
                NodeOutcome::Failed(f) => report.failures.push(f),
            }
        }

        let cancelled = cancel.is_cancelled();
        Self::finish(report, clock, cancelled)
    }

    fn record_resolution(report: &mut PassReport, resolved: &ResolvedNodes) {
        report.rule = Some(resolved.rule);
        report.resolved = resolved.names();
        report.omitted.clone_from(&resolved.omitted);
        for omission in &resolved.omitted {
            warn!(
                topology = %report.key,
                node = %omission.name,
                reason = %omission.reason,
                "named node omitted from pass"
            );
        }
    }

    fn finish(mut report: PassReport, clock: Instant, cancelled: bool) -> PassReport {
        report.cancelled = cancelled;
        report.finished_at = Utc::now();

        info!(
            topology = %report.key,
            trigger = %report.trigger,
            resolved = report.resolved.len(),
            omitted = report.omitted.len(),
            published = report.published.len(),
            failed = report.failures.len(),
            cancelled,
            elapsed_ms = u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX),
            requeue_after_secs = report.requeue_after.as_secs(),
            "reconciliation pass finished"
        );
        report
    }
}

impl fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reconciler")
            .field("resolver", &self.resolver)
            .field("publisher", &self.publisher)
            .field("telemetry", &self.telemetry.name())
            .field("telemetry_timeout", &self.telemetry_timeout)
            .finish()
    }
}
