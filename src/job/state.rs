//! Job health state and execution history.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Health of a job as seen by the health endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    /// Last settled cycle succeeded (or no cycle has settled yet).
    #[default]
    Healthy,
    /// Last settled cycle exhausted its retries.
    Unhealthy,
}

impl HealthState {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
        };
        write!(f, "{s}")
    }
}

/// Outcome of one attempt. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionRecord {
    /// 0-based attempt index within its cycle.
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub succeeded: bool,
    pub failure_reason: Option<String>,
}

impl ExecutionRecord {
    pub fn success(attempt: u32, started_at: DateTime<Utc>) -> Self {
        Self {
            attempt,
            started_at,
            succeeded: true,
            failure_reason: None,
        }
    }

    pub fn failure(attempt: u32, started_at: DateTime<Utc>, reason: impl Into<String>) -> Self {
        Self {
            attempt,
            started_at,
            succeeded: false,
            failure_reason: Some(reason.into()),
        }
    }
}

/// Mutable per-job state, guarded by the job's lock.
#[derive(Debug, Default)]
pub struct JobState {
    pub health: HealthState,
    /// Append-only.
    pub history: Vec<ExecutionRecord>,
}

impl JobState {
    /// Number of successful attempts recorded so far.
    pub fn successes(&self) -> usize {
        self.history.iter().filter(|r| r.succeeded).count()
    }

    pub fn record(&mut self, record: ExecutionRecord) {
        self.history.push(record);
    }
}
