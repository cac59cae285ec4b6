//! Configuration types for the topology controller.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;

use crate::error::{Result, TopologyError};
use crate::types::TopologyDeclaration;

/// Environment variable prefix for configuration overrides.
pub const ENV_PREFIX: &str = "SIDEREAL_TOPOLOGY_";

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "topology.toml";

/// Topology controller configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    /// Telemetry service configuration.
    pub telemetry: TelemetryConfig,
    /// Cluster API configuration.
    pub cluster: ClusterConfig,
    /// Status API configuration.
    pub api: ApiConfig,
    /// Where desired-state resources come from.
    pub source: SourceConfig,
    /// Statically declared topologies.
    pub topologies: Vec<TopologyDeclaration>,
}

impl TopologyConfig {
    /// Load configuration from the default sources.
    ///
    /// Later sources override earlier ones:
    /// 1. Default values
    /// 2. `topology.toml` in the current directory (if present)
    /// 3. Environment variables with `SIDEREAL_TOPOLOGY_` prefix
    pub fn load() -> Result<Self> {
        Self::from_file(DEFAULT_CONFIG_FILE)
    }

    /// Load configuration from a specific TOML file, with environment overrides.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| TopologyError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks values that serde cannot.
    pub fn validate(&self) -> Result<()> {
        if self.cluster.publish_concurrency == 0 {
            return Err(TopologyError::Config(
                "cluster.publish_concurrency must be at least 1".to_owned(),
            ));
        }
        if self.telemetry.timeout.is_zero() {
            return Err(TopologyError::Config(
                "telemetry.timeout_secs must be greater than zero".to_owned(),
            ));
        }
        if self.cluster.request_timeout.is_zero() {
            return Err(TopologyError::Config(
                "cluster.request_timeout_secs must be greater than zero".to_owned(),
            ));
        }
        for declaration in &self.topologies {
            declaration.spec.validate().map_err(|e| {
                TopologyError::Config(format!("topology {}: {e}", declaration.key()))
            })?;
        }
        Ok(())
    }
}

/// Telemetry service configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Base URL of the telemetry service.
    pub url: String,
    /// Path of the average-latency endpoint.
    pub latency_path: String,
    /// Upper bound on a snapshot fetch.
    #[serde(rename = "timeout_secs", with = "serde_duration_secs")]
    pub timeout: Duration,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8080".to_owned(),
            latency_path: "/latencies/average".to_owned(),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Cluster API configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Upper bound on each node read or write.
    #[serde(rename = "request_timeout_secs", with = "serde_duration_secs")]
    pub request_timeout: Duration,
    /// Re-read and retry attempts after a write conflict.
    pub max_conflict_retries: u32,
    /// Node patches in flight at once within a pass.
    pub publish_concurrency: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            max_conflict_retries: 5,
            publish_concurrency: 8,
        }
    }
}

/// Status API configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Whether to serve the status API.
    pub enabled: bool,
    /// Address to listen on.
    pub listen_addr: SocketAddr,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8084),
        }
    }
}

/// Desired-state source configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Source kind.
    pub kind: SourceKind,
    /// Custom resource API group.
    pub group: String,
    /// Custom resource API version.
    pub version: String,
    /// Custom resource kind.
    pub kind_name: String,
    /// Custom resource plural name.
    pub plural: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: SourceKind::default(),
            group: "unict.it".to_owned(),
            version: "v1".to_owned(),
            kind_name: "Topology".to_owned(),
            plural: "topologies".to_owned(),
        }
    }
}

/// Where desired-state resources come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Watch `Topology` custom resources in the cluster.
    #[default]
    Kubernetes,
    /// Use the `topologies` list from configuration.
    Static,
}

/// Serde helper for Duration as seconds.
mod serde_duration_secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
