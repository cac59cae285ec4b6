//! Latency telemetry consumption.
//!
//! Each reconciliation pass takes exactly one [`LatencySnapshot`] from a
//! [`LatencySource`]. The fetch is bounded by a timeout; on failure or timeout
//! the pass continues with an empty snapshot so every node falls back to the
//! minimum cost.

mod client;

pub use client::HttpLatencySource;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{Result, TopologyError};
use crate::types::NodeName;

/// Raw telemetry payload: source node to peer node to average latency (ms).
pub type RawLatencies = BTreeMap<String, BTreeMap<String, f64>>;

/// Pairwise average latencies for one pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LatencySnapshot {
    latencies: BTreeMap<NodeName, BTreeMap<NodeName, f64>>,
}

impl LatencySnapshot {
    /// Creates an empty snapshot.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Builds a snapshot, discarding samples that are not finite.
    ///
    /// Negative samples are kept: they take part in the range and their
    /// costs are clamped by [`CostRange::normalize`](crate::cost::CostRange::normalize).
    #[must_use]
    pub fn from_raw(raw: RawLatencies) -> Self {
        let mut latencies = BTreeMap::new();
        for (source, peers) in raw {
            let mut kept = BTreeMap::new();
            for (peer, latency) in peers {
                if latency.is_finite() {
                    kept.insert(peer, latency);
                } else {
                    warn!(
                        source = %source,
                        peer = %peer,
                        latency,
                        "discarding malformed latency sample"
                    );
                }
            }
            if !kept.is_empty() {
                latencies.insert(source, kept);
            }
        }
        Self { latencies }
    }

    /// Returns true if the snapshot holds no samples.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.latencies.is_empty()
    }

    /// Number of source nodes with at least one sample.
    #[must_use]
    pub fn source_count(&self) -> usize {
        self.latencies.len()
    }

    /// Latencies measured from `source` to each peer.
    #[must_use]
    pub fn peers_of(&self, source: &str) -> Option<&BTreeMap<NodeName, f64>> {
        self.latencies.get(source)
    }

    /// Every latency value in the snapshot.
    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.latencies.values().flat_map(|peers| peers.values().copied())
    }
}

impl<S, P> FromIterator<(S, P, f64)> for LatencySnapshot
where
    S: Into<NodeName>,
    P: Into<NodeName>,
{
    fn from_iter<I: IntoIterator<Item = (S, P, f64)>>(iter: I) -> Self {
        let mut raw = RawLatencies::new();
        for (source, peer, latency) in iter {
            raw.entry(source.into())
                .or_default()
                .insert(peer.into(), latency);
        }
        Self::from_raw(raw)
    }
}

/// Consumer side of the telemetry service.
#[async_trait]
pub trait LatencySource: Send + Sync {
    /// Fetches the current average latency between every measured node pair.
    ///
    /// An empty map is a valid answer.
    async fn fetch_average_latencies(&self) -> Result<RawLatencies>;

    /// Returns the source name for logging.
    fn name(&self) -> &'static str;
}

/// Outcome of a telemetry fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TelemetryStatus {
    /// Telemetry answered in time.
    Fresh {
        /// Number of source nodes reported.
        sources: usize,
    },
    /// Telemetry failed or timed out; the pass used an empty snapshot.
    Unavailable {
        /// Why the fetch failed.
        reason: String,
    },
}

impl TelemetryStatus {
    /// Returns true if the fetch failed.
    #[must_use]
    pub const fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

/// A snapshot together with how it was obtained.
#[derive(Debug, Clone)]
pub struct SnapshotFetch {
    /// The snapshot to normalise against.
    pub snapshot: LatencySnapshot,
    /// Whether it came from telemetry or is the fallback.
    pub status: TelemetryStatus,
}

/// Takes one snapshot from `source`, waiting at most `timeout`.
///
/// Never fails: errors and timeouts yield an empty snapshot and an
/// [`TelemetryStatus::Unavailable`] status.
pub async fn fetch_snapshot(source: &dyn LatencySource, timeout: Duration) -> SnapshotFetch {
    let outcome = match tokio::time::timeout(timeout, source.fetch_average_latencies()).await {
        Ok(result) => result,
        Err(_) => Err(TopologyError::Timeout {
            operation: "telemetry fetch",
            after: timeout,
        }),
    };

    match outcome {
        Ok(raw) => {
            let snapshot = LatencySnapshot::from_raw(raw);
            debug!(
                source = source.name(),
                sources = snapshot.source_count(),
                "latency snapshot fetched"
            );
            SnapshotFetch {
                status: TelemetryStatus::Fresh {
                    sources: snapshot.source_count(),
                },
                snapshot,
            }
        }
        Err(e) => {
            warn!(
                source = source.name(),
                error = %e,
                "telemetry unavailable, falling back to empty snapshot"
            );
            SnapshotFetch {
                snapshot: LatencySnapshot::empty(),
                status: TelemetryStatus::Unavailable {
                    reason: e.to_string(),
                },
            }
        }
    }
}

/// Latency source returning a configurable answer.
///
/// Used by tests and by dry runs without a telemetry service.
#[derive(Debug, Clone, Default)]
pub struct StaticLatencySource {
    state: Arc<Mutex<StaticState>>,
}

#[derive(Debug, Default)]
struct StaticState {
    latencies: RawLatencies,
    failure: Option<String>,
    delay: Option<Duration>,
    calls: u32,
}

impl StaticLatencySource {
    /// Creates a source that reports no data.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a source that reports `latencies`.
    #[must_use]
    pub fn with_latencies(latencies: RawLatencies) -> Self {
        let source = Self::new();
        source.set_latencies(latencies);
        source
    }

    /// Replaces the reported latencies.
    pub fn set_latencies(&self, latencies: RawLatencies) {
        self.state.lock().latencies = latencies;
    }

    /// Makes subsequent fetches fail with `reason`, or succeed again with `None`.
    pub fn set_failure(&self, reason: Option<&str>) {
        self.state.lock().failure = reason.map(ToOwned::to_owned);
    }

    /// Delays subsequent fetches.
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.state.lock().delay = delay;
    }

    /// Number of fetches served.
    #[must_use]
    pub fn calls(&self) -> u32 {
        self.state.lock().calls
    }
}

#[async_trait]
impl LatencySource for StaticLatencySource {
    async fn fetch_average_latencies(&self) -> Result<RawLatencies> {
        let (delay, answer) = {
            let mut state = self.state.lock();
            state.calls += 1;
            let answer = match &state.failure {
                Some(reason) => Err(TopologyError::telemetry(reason.clone())),
                None => Ok(state.latencies.clone()),
            };
            (state.delay, answer)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        answer
    }

    fn name(&self) -> &'static str {
        "static"
    }
}
