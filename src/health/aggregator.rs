//! Aggregate health across all jobs.

use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize};

use crate::job::Job;

/// Body of a health response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub ok: bool,
    /// Names of unhealthy tasks. Omitted when empty.
    #[serde(
        default,
        skip_serializing_if = "Vec::is_empty",
        deserialize_with = "null_as_empty"
    )]
    pub failed_jobs: Vec<String>,
}

fn null_as_empty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}

impl HealthSnapshot {
    pub fn from_failed(failed_jobs: Vec<String>) -> Self {
        Self {
            ok: failed_jobs.is_empty(),
            failed_jobs,
        }
    }
}

/// Read-only view over every job's health.
#[derive(Debug, Clone)]
pub struct HealthAggregator {
    jobs: Arc<[Arc<Job>]>,
}

impl HealthAggregator {
    pub fn new(jobs: impl IntoIterator<Item = Arc<Job>>) -> Self {
        Self {
            jobs: jobs.into_iter().collect(),
        }
    }

    /// Take each job's lock in turn and collect the unhealthy ones.
    pub async fn snapshot(&self) -> HealthSnapshot {
        let mut failed = Vec::new();
        for job in self.jobs.iter() {
            if !job.is_healthy().await {
                failed.push(job.name().to_string());
            }
        }
        HealthSnapshot::from_failed(failed)
    }
}
