//! Client for a remote worker's health endpoint.

use std::time::Duration;

use reqwest::header::ACCEPT;

use super::aggregator::HealthSnapshot;
use crate::error::HealthError;

/// Queries a worker's health endpoint.
#[derive(Debug, Clone, Default)]
pub struct HealthClient {
    http: reqwest::Client,
}

impl HealthClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }

    /// Fetch `url` and return the `ok` flag of the body.
    ///
    /// The status code is ignored; the body alone decides health.
    pub async fn check(&self, url: &str, timeout: Duration) -> Result<bool, HealthError> {
        let response = self
            .http
            .get(url)
            .header(ACCEPT, "application/json")
            .timeout(timeout)
            .send()
            .await?;
        let body = response.text().await?;

        let snapshot: HealthSnapshot = serde_json::from_str(&body)
            .map_err(|e| HealthError::MalformedResponse(format!("{e}: {body}")))?;
        if !snapshot.ok {
            tracing::debug!(failed = ?snapshot.failed_jobs, "Worker reported failed tasks");
        }
        Ok(snapshot.ok)
    }
}
