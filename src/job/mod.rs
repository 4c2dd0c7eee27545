//! Per-task runtime actor.
//!
//! A `Job` owns one task's spec, its health state and its execution history.
//! - `execute()` runs a single attempt
//! - `run_with_retry()` runs one cycle: attempts plus backoff until success,
//!   exhaustion or cancellation
//! - `health()` / `history()` are shared-lock reads safe to call concurrently

pub mod command;
pub mod retry;
pub mod state;
pub mod template;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{Local, Utc};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::config::TaskSpec;
use crate::error::ExecError;

pub use command::{CommandOutput, CommandRunner, Invocation, ProcessRunner};
pub use retry::{RetryLimit, RetryPolicy};
pub use state::{ExecutionRecord, HealthState, JobState};
pub use template::TemplateContext;

/// How a retry cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Succeeded { attempts: u32 },
    Exhausted { attempts: u32 },
    /// Abandoned on cancellation. Health is left as it was.
    Cancelled { attempts: u32 },
}

/// Marks a job's cycle as in flight until dropped.
#[derive(Debug)]
pub struct CycleGuard<'a> {
    running: &'a AtomicBool,
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

pub struct Job {
    spec: Arc<TaskSpec>,
    policy: RetryPolicy,
    runner: Arc<dyn CommandRunner>,
    state: RwLock<JobState>,
    running: AtomicBool,
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("name", &self.spec.name)
            .field("policy", &self.policy)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl Job {
    pub fn new(spec: Arc<TaskSpec>, runner: Arc<dyn CommandRunner>) -> Self {
        let policy = RetryPolicy::from_spec(&spec);
        Self {
            spec,
            policy,
            runner,
            state: RwLock::new(JobState::default()),
            running: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &TaskSpec {
        &self.spec
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn health(&self) -> HealthState {
        self.state.read().await.health
    }

    pub async fn is_healthy(&self) -> bool {
        self.health().await.is_healthy()
    }

    /// Snapshot of every recorded attempt, oldest first.
    pub async fn history(&self) -> Vec<ExecutionRecord> {
        self.state.read().await.history.clone()
    }

    /// Whether a cycle is currently in flight.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Claim the in-flight slot. `None` if a cycle is already running.
    pub fn try_start(&self) -> Option<CycleGuard<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| CycleGuard {
                running: &self.running,
            })
    }

    /// Run a single attempt of the task's command.
    pub async fn execute(&self, cancel: &CancellationToken) -> Result<(), ExecError> {
        let invocation = self.invocation().await?;

        tracing::info!(
            task = %self.name(),
            command = %invocation.display(),
            "Task started executing command"
        );

        let output = self
            .runner
            .run(&invocation, cancel)
            .await
            .inspect_err(|e| tracing::warn!(task = %self.name(), "Task failed to run command: {e}"))?;

        if !output.stdout.is_empty() {
            tracing::info!(task = %self.name(), "Task wrote to stdout: {}", output.stdout);
        }
        if !output.stderr.is_empty() {
            tracing::warn!(task = %self.name(), "Task wrote to stderr: {}", output.stderr);
        }

        output
            .check(&invocation.command)
            .inspect_err(|e| tracing::warn!(task = %self.name(), "Task command failed: {e}"))
    }

    /// Run one cycle: attempt, back off and retry per the task's policy.
    ///
    /// Success marks the job healthy, exhaustion marks it unhealthy (unless
    /// the task falls through). Cancellation ends the cycle without a verdict.
    pub async fn run_with_retry(&self, cancel: &CancellationToken) -> CycleOutcome {
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                tracing::info!(task = %self.name(), attempt, "Cycle abandoned: cancelled");
                return CycleOutcome::Cancelled { attempts: attempt };
            }

            let started_at = Utc::now();
            let result = self.execute(cancel).await;

            match result {
                Ok(()) => {
                    let mut state = self.state.write().await;
                    state.record(ExecutionRecord::success(attempt, started_at));
                    state.health = HealthState::Healthy;
                    drop(state);

                    tracing::info!(task = %self.name(), attempt, "Task finished successfully");
                    return CycleOutcome::Succeeded {
                        attempts: attempt + 1,
                    };
                }
                Err(e) => {
                    self.state
                        .write()
                        .await
                        .record(ExecutionRecord::failure(attempt, started_at, e.to_string()));

                    if e.is_cancelled() {
                        tracing::info!(task = %self.name(), attempt, "Cycle abandoned: cancelled");
                        return CycleOutcome::Cancelled {
                            attempts: attempt + 1,
                        };
                    }
                    if !self.policy.should_retry(attempt) {
                        break;
                    }

                    let wait = self.policy.backoff(attempt);
                    tracing::warn!(
                        task = %self.name(),
                        attempt,
                        limit = ?self.policy.limit,
                        wait_secs = wait.as_secs(),
                        "Task failed, will retry: {e}"
                    );

                    if !sleep_or_cancel(wait, cancel).await {
                        tracing::info!(task = %self.name(), attempt, "Cycle abandoned during backoff");
                        return CycleOutcome::Cancelled {
                            attempts: attempt + 1,
                        };
                    }
                    attempt += 1;
                }
            }
        }

        if self.spec.fallthrough {
            tracing::warn!(task = %self.name(), "Task exceeded retry limit (fallthrough, health unchanged)");
        } else {
            tracing::error!(task = %self.name(), "Task exceeded retry limit");
            self.state.write().await.health = HealthState::Unhealthy;
        }
        CycleOutcome::Exhausted {
            attempts: attempt + 1,
        }
    }

    /// Resolve environment and arguments for the next attempt.
    async fn invocation(&self) -> Result<Invocation, ExecError> {
        let env = self.effective_env();
        let mut args = self.spec.args.clone();

        if self.spec.use_template {
            let successes = self.state.read().await.successes();
            let ctx = TemplateContext {
                name: self.name(),
                env: &env,
                successes,
                now: Local::now(),
            };
            for arg in args.iter_mut() {
                let rendered = template::render(arg, &ctx).map_err(|e| ExecError::Template {
                    arg: arg.clone(),
                    source: e,
                })?;
                tracing::debug!(task = %self.name(), "Rendered argument: {arg} -> {rendered}");
                *arg = rendered;
            }
        }

        Ok(Invocation {
            command: self.spec.command.clone(),
            args,
            env,
            timeout: (self.spec.timeout > 0).then(|| Duration::from_secs(self.spec.timeout)),
        })
    }

    /// Task env, seeded from the process env when propagation is enabled.
    /// Task entries win on collision.
    fn effective_env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        if self.spec.propagate_env {
            env.extend(
                std::env::vars_os()
                    .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?))),
            );
        }
        env.extend(self.spec.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        env
    }
}

/// Sleep for `wait`. Returns `false` if cancelled first.
async fn sleep_or_cancel(wait: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(wait) => true,
        _ = cancel.cancelled() => false,
    }
}
