//! Trigger discipline for reconciliation passes.
//!
//! Every desired-state resource gets its own worker task. A worker runs one
//! pass at a time and then waits for whichever comes first: a new event for
//! its resource, or the resource's run interval. Events arriving during a
//! pass are coalesced into a single follow-up pass against the latest spec.
//! Workers for distinct resources run independently.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::reconcile::{PassReport, PassTrigger, Reconciler};
use crate::types::{TopologyKey, TopologySpec};

/// Capacity of the pass report broadcast.
const REPORT_CHANNEL_CAPACITY: usize = 256;

struct Worker {
    spec: watch::Sender<TopologySpec>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct Shared {
    reconciler: Arc<Reconciler>,
    latest: DashMap<TopologyKey, PassReport>,
    report_sender: broadcast::Sender<PassReport>,
    passes: AtomicU64,
    node_failures: AtomicU64,
}

impl Shared {
    fn record(&self, report: PassReport) {
        self.passes.fetch_add(1, Ordering::Relaxed);
        let failures = u64::try_from(report.failures.len()).unwrap_or(u64::MAX);
        self.node_failures.fetch_add(failures, Ordering::Relaxed);
        self.latest.insert(report.key.clone(), report.clone());
        let _ = self.report_sender.send(report);
    }
}

/// Runs passes for every known desired-state resource.
pub struct ReconciliationScheduler {
    shared: Arc<Shared>,
    workers: DashMap<TopologyKey, Worker>,
    synced: AtomicBool,
    cancel: CancellationToken,
}

impl ReconciliationScheduler {
    /// Creates a scheduler with no resources.
    #[must_use]
    pub fn new(reconciler: Arc<Reconciler>) -> Self {
        let (report_sender, _) = broadcast::channel(REPORT_CHANNEL_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                reconciler,
                latest: DashMap::new(),
                report_sender,
                passes: AtomicU64::new(0),
                node_failures: AtomicU64::new(0),
            }),
            workers: DashMap::new(),
            synced: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    /// Records that the desired-state source has delivered its full set.
    pub fn mark_synced(&self) {
        if !self.synced.swap(true, Ordering::Relaxed) {
            info!(topologies = self.workers.len(), "desired state synced");
        }
    }

    /// Returns true once the desired-state source has delivered its full set.
    #[must_use]
    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::Relaxed)
    }

    /// Records a created or updated resource.
    ///
    /// Starts a worker for a new resource. For a known resource the spec is
    /// replaced and a pass is triggered as soon as the current one, if any,
    /// finishes. Invalid specs are rejected and leave any running worker
    /// untouched.
    pub fn apply(&self, key: TopologyKey, spec: TopologySpec) -> Result<()> {
        spec.validate()?;

        match self.workers.entry(key) {
            Entry::Occupied(entry) => {
                debug!(topology = %entry.key(), "topology updated");
                entry.get().spec.send_replace(spec);
            }
            Entry::Vacant(entry) => {
                info!(
                    topology = %entry.key(),
                    run_interval_secs = spec.run_interval_seconds,
                    "topology scheduled"
                );
                let worker = self.spawn(entry.key().clone(), spec);
                entry.insert(worker);
            }
        }
        Ok(())
    }

    fn spawn(&self, key: TopologyKey, spec: TopologySpec) -> Worker {
        let (spec_tx, spec_rx) = watch::channel(spec);
        let cancel = self.cancel.child_token();
        let handle = tokio::spawn(run_worker(
            key,
            spec_rx,
            Arc::clone(&self.shared),
            cancel.clone(),
        ));
        Worker {
            spec: spec_tx,
            cancel,
            handle,
        }
    }

    /// Stops scheduling a resource.
    ///
    /// Cancels any pass in progress and waits for the worker to exit, so no
    /// write for the resource happens after this returns. Returns false if
    /// the resource was unknown.
    pub async fn remove(&self, key: &TopologyKey) -> bool {
        let Some((_, worker)) = self.workers.remove(key) else {
            return false;
        };
        worker.cancel.cancel();
        if let Err(e) = worker.handle.await {
            warn!(topology = %key, error = %e, "topology worker ended abnormally");
        }
        self.shared.latest.remove(key);
        info!(topology = %key, "topology unscheduled");
        true
    }

    /// Cancels every worker and waits for them to exit.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let keys: Vec<TopologyKey> = self.workers.iter().map(|w| w.key().clone()).collect();
        for key in keys {
            if let Some((_, worker)) = self.workers.remove(&key) {
                if let Err(e) = worker.handle.await {
                    warn!(topology = %key, error = %e, "topology worker ended abnormally");
                }
            }
        }
        info!("scheduler stopped");
    }

    /// Subscribes to reports of finished passes.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PassReport> {
        self.shared.report_sender.subscribe()
    }

    /// Latest report for a resource.
    #[must_use]
    pub fn latest(&self, key: &TopologyKey) -> Option<PassReport> {
        self.shared.latest.get(key).map(|r| r.clone())
    }

    /// Latest report of every resource, ordered by key.
    #[must_use]
    pub fn reports(&self) -> Vec<PassReport> {
        let mut reports: Vec<PassReport> =
            self.shared.latest.iter().map(|r| r.value().clone()).collect();
        reports.sort_by(|a, b| a.key.cmp(&b.key));
        reports
    }

    /// Returns true if the resource has a worker.
    #[must_use]
    pub fn is_scheduled(&self, key: &TopologyKey) -> bool {
        self.workers.contains_key(key)
    }

    /// Keys of every scheduled resource, ordered.
    #[must_use]
    pub fn keys(&self) -> Vec<TopologyKey> {
        let mut keys: Vec<TopologyKey> = self.workers.iter().map(|w| w.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Number of scheduled resources.
    #[must_use]
    pub fn scheduled_count(&self) -> usize {
        self.workers.len()
    }

    /// Passes finished since start.
    #[must_use]
    pub fn passes_completed(&self) -> u64 {
        self.shared.passes.load(Ordering::Relaxed)
    }

    /// Node failures reported since start.
    #[must_use]
    pub fn node_failures(&self) -> u64 {
        self.shared.node_failures.load(Ordering::Relaxed)
    }
}

impl Drop for ReconciliationScheduler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for ReconciliationScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconciliationScheduler")
            .field("scheduled", &self.workers.len())
            .field("passes", &self.passes_completed())
            .finish_non_exhaustive()
    }
}

async fn run_worker(
    key: TopologyKey,
    mut spec_rx: watch::Receiver<TopologySpec>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) {
    let mut trigger = PassTrigger::Event;

    loop {
        let spec = spec_rx.borrow_and_update().clone();
        let report = shared
            .reconciler
            .run_once(&key, &spec, trigger, &cancel)
            .await;
        let requeue_after = report.requeue_after;

        if report.cancelled {
            debug!(topology = %key, "pass cancelled, worker exiting");
            break;
        }
        shared.record(report);

        trigger = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            changed = spec_rx.changed() => match changed {
                Ok(()) => PassTrigger::Event,
                Err(_) => break,
            },
            () = tokio::time::sleep(requeue_after) => PassTrigger::Timer,
        };
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::TopologyConfig;
    use crate::inventory::{InMemoryNodeInventory, NodeRecord};
    use crate::telemetry::StaticLatencySource;
    use std::time::Duration;

    fn scheduler() -> (Arc<InMemoryNodeInventory>, ReconciliationScheduler) {
        let inventory = Arc::new(InMemoryNodeInventory::with_nodes([
            NodeRecord::new("a"),
            NodeRecord::new("b"),
        ]));
        let reconciler = Reconciler::new(
            inventory.clone(),
            Arc::new(StaticLatencySource::new()),
            &TopologyConfig::default(),
        );
        (inventory, ReconciliationScheduler::new(Arc::new(reconciler)))
    }

    #[tokio::test(start_paused = true)]
    async fn first_pass_is_event_then_timer() {
        let (_, scheduler) = scheduler();
        let mut reports = scheduler.subscribe();
        let key = TopologyKey::cluster("edge");

        scheduler
            .apply(key.clone(), TopologySpec::all_nodes(30))
            .unwrap();

        let first = reports.recv().await.unwrap();
        assert_eq!(first.trigger, PassTrigger::Event);
        let after_first = tokio::time::Instant::now();

        let second = reports.recv().await.unwrap();
        assert_eq!(second.trigger, PassTrigger::Timer);
        assert!(after_first.elapsed() >= Duration::from_secs(30));

        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn update_triggers_pass_before_interval() {
        let (_, scheduler) = scheduler();
        let mut reports = scheduler.subscribe();
        let key = TopologyKey::cluster("edge");

        scheduler
            .apply(key.clone(), TopologySpec::all_nodes(3600))
            .unwrap();
        reports.recv().await.unwrap();
        let before = tokio::time::Instant::now();

        scheduler
            .apply(key.clone(), TopologySpec::with_names(["a"], 3600))
            .unwrap();
        let report = reports.recv().await.unwrap();

        assert_eq!(report.trigger, PassTrigger::Event);
        assert_eq!(report.resolved, vec!["a"]);
        assert!(before.elapsed() < Duration::from_secs(3600));
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_spec_is_rejected() {
        let (_, scheduler) = scheduler();
        let key = TopologyKey::cluster("edge");

        assert!(scheduler.apply(key.clone(), TopologySpec::all_nodes(0)).is_err());
        assert!(!scheduler.is_scheduled(&key));
    }

    #[tokio::test(start_paused = true)]
    async fn remove_stops_worker() {
        let (_, scheduler) = scheduler();
        let mut reports = scheduler.subscribe();
        let key = TopologyKey::namespaced("default", "edge");

        scheduler.apply(key.clone(), TopologySpec::all_nodes(5)).unwrap();
        reports.recv().await.unwrap();
        assert!(scheduler.latest(&key).is_some());

        assert!(scheduler.remove(&key).await);
        assert!(!scheduler.is_scheduled(&key));
        assert!(scheduler.latest(&key).is_none());
        assert!(!scheduler.remove(&key).await);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(matches!(
            reports.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn resources_are_independent() {
        let (_, scheduler) = scheduler();
        let mut reports = scheduler.subscribe();

        scheduler
            .apply(TopologyKey::cluster("fast"), TopologySpec::all_nodes(10))
            .unwrap();
        scheduler
            .apply(TopologyKey::cluster("slow"), TopologySpec::all_nodes(1000))
            .unwrap();

        let mut fast = 0;
        let mut slow = 0;
        while fast < 4 {
            match reports.recv().await.unwrap().key.name.as_str() {
                "fast" => fast += 1,
                _ => slow += 1,
            }
        }
        assert_eq!(slow, 1);
        assert_eq!(scheduler.keys().len(), 2);
        assert_eq!(scheduler.reports().len(), 2);
        assert_eq!(scheduler.passes_completed(), 5);

        scheduler.shutdown().await;
        assert_eq!(scheduler.scheduled_count(), 0);
    }
}
