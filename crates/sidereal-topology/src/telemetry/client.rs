//! HTTP client for the telemetry service.

use async_trait::async_trait;
use reqwest::Client;

use crate::config::TelemetryConfig;
use crate::error::{Result, TopologyError};

use super::{LatencySource, RawLatencies};

/// Reads average node-to-node latencies from the telemetry service's HTTP API.
#[derive(Debug, Clone)]
pub struct HttpLatencySource {
    client: Client,
    url: String,
}

impl HttpLatencySource {
    /// Create a new telemetry client from configuration.
    pub fn new(config: &TelemetryConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(TopologyError::Http)?;

        Ok(Self {
            client,
            url: format!(
                "{}/{}",
                config.url.trim_end_matches('/'),
                config.latency_path.trim_start_matches('/')
            ),
        })
    }

    /// The endpoint this client polls.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl LatencySource for HttpLatencySource {
    async fn fetch_average_latencies(&self) -> Result<RawLatencies> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(TopologyError::Http)?;

        if !response.status().is_success() {
            return Err(TopologyError::telemetry(format!(
                "latency query failed: {}",
                response.status()
            )));
        }

        let body = response.bytes().await.map_err(TopologyError::Http)?;
        serde_json::from_slice(&body).map_err(|e| TopologyError::Serialisation(e.to_string()))
    }

    fn name(&self) -> &'static str {
        "http"
    }
}
