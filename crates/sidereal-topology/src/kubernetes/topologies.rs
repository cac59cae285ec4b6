//! Watch on `Topology` custom resources.
//!
//! The resource is read as a [`DynamicObject`] so the controller does not need
//! its schema compiled in; only `.spec` is interpreted.

use std::collections::HashSet;
use std::sync::Arc;

use futures::StreamExt;
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::runtime::watcher::{self, watcher};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SourceConfig;
use crate::error::{Result, TopologyError};
use crate::scheduler::ReconciliationScheduler;
use crate::types::{TopologyKey, TopologySpec};

/// API resource described by the source configuration.
#[must_use]
pub fn api_resource(source: &SourceConfig) -> ApiResource {
    let gvk = GroupVersionKind::gvk(&source.group, &source.version, &source.kind_name);
    ApiResource::from_gvk_with_plural(&gvk, &source.plural)
}

fn key_of(object: &DynamicObject) -> Result<TopologyKey> {
    let name = object
        .metadata
        .name
        .clone()
        .ok_or_else(|| TopologyError::InvalidSpec("resource has no name".to_owned()))?;
    Ok(TopologyKey {
        namespace: object.metadata.namespace.clone(),
        name,
    })
}

/// Extracts the key and a validated spec from a resource.
pub fn parse_topology(object: &DynamicObject) -> Result<(TopologyKey, TopologySpec)> {
    let key = key_of(object)?;
    let raw = object
        .data
        .get("spec")
        .cloned()
        .ok_or_else(|| TopologyError::InvalidSpec(format!("{key}: missing spec")))?;
    let spec: TopologySpec = serde_json::from_value(raw)
        .map_err(|e| TopologyError::InvalidSpec(format!("{key}: {e}")))?;
    spec.validate()?;
    Ok((key, spec))
}

/// Applies watch events to the scheduler.
///
/// A relist replaces the known set: resources that existed before the relist
/// but were not listed again are unscheduled once the listing completes.
struct Tracker {
    scheduler: Arc<ReconciliationScheduler>,
    relisted: Option<HashSet<TopologyKey>>,
}

impl Tracker {
    fn new(scheduler: Arc<ReconciliationScheduler>) -> Self {
        Self {
            scheduler,
            relisted: None,
        }
    }

    async fn handle(&mut self, event: watcher::Event<DynamicObject>) {
        match event {
            watcher::Event::Init => {
                debug!("topology relist started");
                self.relisted = Some(HashSet::new());
            }
            watcher::Event::InitApply(object) => {
                if let Some(key) = self.apply(&object) {
                    if let Some(seen) = self.relisted.as_mut() {
                        seen.insert(key);
                    }
                }
            }
            watcher::Event::InitDone => {
                let seen = self.relisted.take().unwrap_or_default();
                for key in self.scheduler.keys() {
                    if !seen.contains(&key) {
                        info!(topology = %key, "topology gone after relist");
                        self.scheduler.remove(&key).await;
                    }
                }
                self.scheduler.mark_synced();
            }
            watcher::Event::Apply(object) => {
                self.apply(&object);
            }
            watcher::Event::Delete(object) => match key_of(&object) {
                Ok(key) => {
                    self.scheduler.remove(&key).await;
                }
                Err(e) => warn!(error = %e, "ignoring deletion of unnamed topology"),
            },
        }
    }

    fn apply(&self, object: &DynamicObject) -> Option<TopologyKey> {
        let (key, spec) = match parse_topology(object) {
            Ok(parsed) => parsed,
            Err(e) => {
                error!(error = %e, "invalid topology resource, skipping");
                return None;
            }
        };
        match self.scheduler.apply(key.clone(), spec) {
            Ok(()) => Some(key),
            Err(e) => {
                error!(topology = %key, error = %e, "failed to schedule topology");
                None
            }
        }
    }
}

/// Streams `Topology` resources from the cluster into the scheduler.
pub struct TopologyWatcher {
    api: Api<DynamicObject>,
    tracker: Tracker,
}

impl TopologyWatcher {
    /// Creates a watcher over every namespace.
    #[must_use]
    pub fn new(
        client: Client,
        source: &SourceConfig,
        scheduler: Arc<ReconciliationScheduler>,
    ) -> Self {
        let resource = api_resource(source);
        info!(
            group = %resource.group,
            version = %resource.version,
            plural = %resource.plural,
            "watching topology resources"
        );
        Self {
            api: Api::all_with(client, &resource),
            tracker: Tracker::new(scheduler),
        }
    }

    /// Runs until `cancel` fires or the watch stream ends.
    ///
    /// Watch errors are retried with backoff and never end the loop.
    pub async fn run(mut self, cancel: CancellationToken) {
        let stream = watcher(self.api.clone(), watcher::Config::default()).default_backoff();
        let mut stream = std::pin::pin!(stream);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                next = stream.next() => match next {
                    Some(Ok(event)) => self.tracker.handle(event).await,
                    Some(Err(e)) => warn!(error = %e, "topology watch error"),
                    None => {
                        warn!("topology watch stream ended");
                        break;
                    }
                },
            }
        }
        info!("topology watcher stopped");
    }
}
