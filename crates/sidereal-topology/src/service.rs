//! Service lifecycle management.
//!
//! Provides the main service runner with signal handling and graceful shutdown.

use std::sync::Arc;

use tokio::signal;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::api;
use crate::config::{SourceKind, TopologyConfig};
use crate::error::{Result, TopologyError};
use crate::inventory::NodeInventory;
use crate::kubernetes::{self, KubeNodeInventory, TopologyWatcher};
use crate::reconcile::{PassReport, PassTrigger, Reconciler};
use crate::scheduler::ReconciliationScheduler;
use crate::telemetry::{HttpLatencySource, LatencySource};

/// The topology controller service.
///
/// Owns:
/// - the cluster and telemetry clients
/// - the reconciliation scheduler and its desired-state source
/// - the status API server
pub struct TopologyService {
    config: TopologyConfig,
    cancel: CancellationToken,
}

impl TopologyService {
    /// Create a new service with the given configuration.
    #[must_use]
    pub fn new(config: TopologyConfig) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Run the controller until a shutdown signal.
    ///
    /// This will:
    /// 1. Connect to the cluster API and the telemetry service
    /// 2. Start the scheduler and feed it from the configured source
    /// 3. Start the status API server, if enabled
    /// 4. Wait for shutdown, then stop every worker
    pub async fn run(&self) -> Result<()> {
        let client = kubernetes::connect().await?;
        let inventory: Arc<dyn NodeInventory> = Arc::new(KubeNodeInventory::new(client.clone()));
        let reconciler = self.reconciler(inventory)?;
        let scheduler = Arc::new(ReconciliationScheduler::new(Arc::new(reconciler)));

        let mut tasks = JoinSet::new();

        match self.config.source.kind {
            SourceKind::Kubernetes => {
                let watcher = TopologyWatcher::new(client, &self.config.source, Arc::clone(&scheduler));
                tasks.spawn(watcher.run(self.cancel.clone()));
            }
            SourceKind::Static => {
                for declaration in &self.config.topologies {
                    scheduler.apply(declaration.key(), declaration.spec.clone())?;
                }
                info!(count = self.config.topologies.len(), "static topologies scheduled");
                scheduler.mark_synced();
            }
        }

        if self.config.api.enabled {
            let state = Arc::new(api::AppState {
                scheduler: Arc::clone(&scheduler),
            });
            let listener = tokio::net::TcpListener::bind(self.config.api.listen_addr)
                .await
                .map_err(|e| TopologyError::Config(format!("failed to bind status API: {e}")))?;
            info!(addr = %self.config.api.listen_addr, "status API listening");

            let cancel = self.cancel.clone();
            tasks.spawn(async move {
                if let Err(e) = axum::serve(listener, api::router(state))
                    .with_graceful_shutdown(async move { cancel.cancelled().await })
                    .await
                {
                    error!(error = %e, "status API failed");
                }
            });
        }

        shutdown_signal(self.cancel.clone()).await;
        self.cancel.cancel();

        scheduler.shutdown().await;
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "background task ended abnormally");
            }
        }

        info!("topology service shutdown complete");
        Ok(())
    }

    /// Runs one pass for every statically declared topology, then returns.
    pub async fn run_once(&self) -> Result<Vec<PassReport>> {
        let client = kubernetes::connect().await?;
        let inventory: Arc<dyn NodeInventory> = Arc::new(KubeNodeInventory::new(client));
        let reconciler = self.reconciler(inventory)?;

        let mut reports = Vec::with_capacity(self.config.topologies.len());
        for declaration in &self.config.topologies {
            let report = reconciler
                .run_once(
                    &declaration.key(),
                    &declaration.spec,
                    PassTrigger::Manual,
                    &self.cancel,
                )
                .await;
            reports.push(report);
        }
        Ok(reports)
    }

    /// Request graceful shutdown.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    fn reconciler(&self, inventory: Arc<dyn NodeInventory>) -> Result<Reconciler> {
        let telemetry = HttpLatencySource::new(&self.config.telemetry)?;
        info!(url = %telemetry.url(), "telemetry client configured");
        let telemetry: Arc<dyn LatencySource> = Arc::new(telemetry);
        Ok(Reconciler::new(inventory, telemetry, &self.config))
    }
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            info!("received SIGTERM, initiating shutdown");
        }
        () = cancel.cancelled() => {
            info!("shutdown requested");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_creation() {
        let service = TopologyService::new(TopologyConfig::default());
        assert!(!service.cancel.is_cancelled());
    }

    #[test]
    fn service_shutdown() {
        let service = TopologyService::new(TopologyConfig::default());
        service.shutdown();
        assert!(service.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn shutdown_signal_honours_cancel() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        shutdown_signal(cancel).await;
    }
}
