//! Sidereal topology controller binary.
//!
//! Keeps `network.cost.<peer>` labels on cluster nodes in line with observed
//! latency.

use std::path::PathBuf;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sidereal_topology::config::DEFAULT_CONFIG_FILE;
use sidereal_topology::{TopologyConfig, TopologyService};

#[derive(Debug, Parser)]
#[command(name = "sidereal-topology", version, about)]
struct Args {
    /// Configuration file.
    #[arg(long, short, env = "SIDEREAL_TOPOLOGY_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Run one pass for every statically declared topology and exit.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialise tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("sidereal_topology=info".parse()?),
        )
        .init();

    let args = Args::parse();
    info!("Sidereal topology controller starting");

    let config = TopologyConfig::from_file(&args.config)?;
    info!(
        config = %args.config.display(),
        telemetry = %config.telemetry.url,
        source = ?config.source.kind,
        api_enabled = config.api.enabled,
        "configuration loaded"
    );

    let service = TopologyService::new(config);

    if args.once {
        let reports = service.run_once().await?;
        for report in &reports {
            let summary = serde_json::to_string(report)?;
            if report.is_clean() {
                info!(topology = %report.key, report = %summary, "pass report");
            } else {
                warn!(topology = %report.key, report = %summary, "pass was degraded");
            }
        }
        return Ok(());
    }

    service.run().await?;
    Ok(())
}
