//! Top-level coordinator.
//!
//! The Worker owns every Job, the scheduler and the optional health server.
//! `run()` blocks until cancellation (clean exit) or a health server failure
//! (error). Fires from the scheduler arrive on a channel and each one is
//! dispatched onto its own task, so retry backoff never blocks scheduling.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::config::{Config, HealthCheckConfig};
use crate::error::{ConfigError, HealthError, WorkerError};
use crate::health::{HealthAggregator, HealthServer};
use crate::job::{CommandRunner, Job, ProcessRunner};
use crate::worker::scheduler::{Fire, Scheduler, Zone};

/// Capacity of the fire queue between tickers and dispatch.
const FIRE_QUEUE: usize = 64;

type ServerTask = JoinHandle<Result<(), HealthError>>;

pub struct Worker {
    jobs: Vec<Arc<Job>>,
    scheduler: Scheduler,
    healthcheck: Option<HealthCheckConfig>,
}

impl Worker {
    /// Build jobs with the process runner.
    pub fn new(config: &Config) -> Result<Self, ConfigError> {
        Self::with_runner(config, Arc::new(ProcessRunner::new()))
    }

    /// Build jobs that run their commands through `runner`.
    ///
    /// Fails on an unknown time zone or an invalid schedule.
    pub fn with_runner(
        config: &Config,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self, ConfigError> {
        let zone = Zone::resolve(config.time_zone.as_deref())?;
        let mut scheduler = Scheduler::new(zone);
        let mut jobs = Vec::with_capacity(config.tasks.len());

        for spec in config.tasks.values() {
            scheduler.add(&spec.name, &spec.schedule)?;
            jobs.push(Arc::new(Job::new(
                Arc::new(spec.clone()),
                Arc::clone(&runner),
            )));
            tracing::info!(task = %spec.name, schedule = %spec.schedule, "Task registered");
        }

        Ok(Self {
            jobs,
            scheduler,
            healthcheck: config.healthcheck.clone(),
        })
    }

    pub fn jobs(&self) -> &[Arc<Job>] {
        &self.jobs
    }

    pub fn job(&self, name: &str) -> Option<&Arc<Job>> {
        self.jobs.iter().find(|j| j.name() == name)
    }

    pub fn zone(&self) -> Zone {
        self.scheduler.zone()
    }

    pub fn aggregator(&self) -> HealthAggregator {
        HealthAggregator::new(self.jobs.iter().cloned())
    }

    /// Run until `cancel` fires or the health server fails.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), WorkerError> {
        let mut server = match self.healthcheck {
            Some(ref config) => Some(self.start_health_server(config, &cancel).await?),
            None => None,
        };

        tracing::info!(time_zone = %self.zone(), "Worker started");

        let (tx, mut fires) = mpsc::channel(FIRE_QUEUE);
        let mut tickers = self.scheduler.start(tx, cancel.child_token());
        for (index, job) in self.jobs.iter().enumerate() {
            match self.scheduler.next_fire(index) {
                Some(next) => {
                    tracing::info!(task = %job.name(), next = %next, "Task scheduled, first run pending")
                }
                None => tracing::warn!(task = %job.name(), "Task has no upcoming run"),
            }
        }

        let cycle_cancel = cancel.child_token();
        let mut cycles = JoinSet::new();

        let result = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Worker cancelled, stopping");
                    break Ok(());
                }
                exit = server_exit(&mut server) => {
                    if cancel.is_cancelled() {
                        break Ok(());
                    }
                    break exit;
                }
                Some(fire) = fires.recv() => {
                    self.dispatch(fire, &mut cycles, &cycle_cancel);
                }
                Some(done) = cycles.join_next(), if !cycles.is_empty() => {
                    if let Err(e) = done {
                        tracing::error!("Retry cycle task failed: {e}");
                    }
                }
            }
        };

        // Stop firing, then let in-flight cycles observe cancellation.
        tickers.shutdown().await;
        cycle_cancel.cancel();
        while cycles.join_next().await.is_some() {}

        if let Some(handle) = server.take() {
            handle.abort();
            let _ = handle.await;
        }

        tracing::info!("Worker stopped");
        result
    }

    async fn start_health_server(
        &self,
        config: &HealthCheckConfig,
        cancel: &CancellationToken,
    ) -> Result<ServerTask, WorkerError> {
        let server = HealthServer::bind(config, self.aggregator())
            .await
            .inspect_err(|e| tracing::error!("Health check server failed to start: {e}"))?;

        tracing::info!(
            addr = %server.local_addr(),
            path = %config.path,
            "Health check server started"
        );
        Ok(tokio::spawn(server.serve(cancel.child_token())))
    }

    /// Spawn one retry cycle for a fire. A fire for a job whose previous
    /// cycle is still in flight is dropped.
    fn dispatch(&self, fire: Fire, cycles: &mut JoinSet<()>, cancel: &CancellationToken) {
        let Some(job) = self.jobs.get(fire.index).cloned() else {
            tracing::warn!(index = fire.index, "Fire for unknown task index ignored");
            return;
        };
        tracing::debug!(task = %job.name(), at = %fire.at, "Task fired");

        let cancel = cancel.clone();
        cycles.spawn(async move {
            let Some(_guard) = job.try_start() else {
                tracing::warn!(
                    task = %job.name(),
                    "Previous cycle still running, skipping this run"
                );
                return;
            };
            job.run_with_retry(&cancel).await;
        });
    }
}

/// Resolves when the health server task ends. Pending forever without one.
async fn server_exit(server: &mut Option<ServerTask>) -> Result<(), WorkerError> {
    let Some(handle) = server.as_mut() else {
        return std::future::pending().await;
    };
    let joined = handle.await;
    *server = None;

    match joined {
        Ok(Ok(())) => Err(WorkerError::HealthServerAborted(
            "server stopped unexpectedly".to_string(),
        )),
        Ok(Err(e)) => {
            tracing::error!("Health check server stopped: {e}");
            Err(e.into())
        }
        Err(e) => Err(WorkerError::HealthServerAborted(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::config::{RetryType, TaskSpec};
    use crate::error::ExecError;
    use crate::job::{CommandOutput, HealthState, Invocation};

    /// Exits with the code given as the command, e.g. `"1"`.
    struct ExitCode;

    #[async_trait]
    impl CommandRunner for ExitCode {
        async fn run(
            &self,
            invocation: &Invocation,
            _cancel: &CancellationToken,
        ) -> Result<CommandOutput, ExecError> {
            Ok(CommandOutput {
                code: invocation.command.parse().ok(),
                ..Default::default()
            })
        }
    }

    /// Blocks until cancelled.
    struct Hang;

    #[async_trait]
    impl CommandRunner for Hang {
        async fn run(
            &self,
            invocation: &Invocation,
            cancel: &CancellationToken,
        ) -> Result<CommandOutput, ExecError> {
            cancel.cancelled().await;
            Err(ExecError::Cancelled {
                command: invocation.command.clone(),
            })
        }
    }

    #[test]
    fn invalid_schedule_is_fatal_and_names_task() {
        let config = Config::with_tasks([TaskSpec::new("broken", "true", "every tuesday")]);
        let err = Worker::new(&config).err().unwrap();
        assert!(matches!(err, ConfigError::InvalidSchedule { ref task, .. } if task == "broken"));
    }

    #[test]
    fn invalid_time_zone_is_fatal() {
        let mut config = Config::with_tasks([TaskSpec::new("t", "true", "@hourly")]);
        config.time_zone = Some("Atlantis/Capital".to_string());
        assert!(matches!(
            Worker::new(&config),
            Err(ConfigError::InvalidTimeZone(_))
        ));
    }

    #[test]
    fn builds_one_job_per_task() {
        let config = Config::with_tasks([
            TaskSpec::new("a", "true", "@hourly"),
            TaskSpec::new("b", "true", "@every 5m"),
        ]);
        let worker = Worker::new(&config).unwrap();
        assert_eq!(worker.jobs().len(), 2);
        assert!(worker.job("a").is_some());
        assert!(worker.job("missing").is_none());
        assert_eq!(worker.zone(), Zone::Local);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_task_turns_unhealthy() {
        let config = Config::with_tasks([
            TaskSpec::new("bad", "1", "@every 1s"),
            TaskSpec::new("good", "0", "@every 1s"),
        ]);
        let worker = Arc::new(Worker::with_runner(&config, Arc::new(ExitCode)).unwrap());
        let cancel = CancellationToken::new();

        let handle = tokio::spawn({
            let worker = Arc::clone(&worker);
            let cancel = cancel.clone();
            async move { worker.run(cancel).await }
        });
        tokio::time::sleep(Duration::from_millis(3500)).await;

        let bad = worker.job("bad").unwrap();
        assert_eq!(bad.health().await, HealthState::Unhealthy);
        assert!(bad.history().await.len() >= 2);
        assert!(worker.job("good").unwrap().is_healthy().await);

        let snapshot = worker.aggregator().snapshot().await;
        assert_eq!(snapshot.failed_jobs, vec!["bad"]);

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_fires_are_skipped() {
        let config = Config::with_tasks([
            TaskSpec::new("slow", "1", "@every 1s").with_retry(-1, 10, RetryType::Fixed)
        ]);
        let worker = Arc::new(Worker::with_runner(&config, Arc::new(ExitCode)).unwrap());
        let cancel = CancellationToken::new();

        let handle = tokio::spawn({
            let worker = Arc::clone(&worker);
            let cancel = cancel.clone();
            async move { worker.run(cancel).await }
        });
        // One cycle starts at 1s and retries at 11s and 21s; fires in
        // between are dropped.
        tokio::time::sleep(Duration::from_millis(25_500)).await;

        let slow = worker.job("slow").unwrap();
        assert!(slow.is_running());
        assert_eq!(slow.history().await.len(), 3);
        assert!(slow.is_healthy().await);

        cancel.cancel();
        handle.await.unwrap().unwrap();
        assert!(!slow.is_running());
    }

    #[tokio::test]
    async fn cancellation_stops_in_flight_cycles() {
        let config = Config::with_tasks([TaskSpec::new("hang", "sleep", "@every 1s")]);
        let worker = Arc::new(Worker::with_runner(&config, Arc::new(Hang)).unwrap());
        let cancel = CancellationToken::new();

        let handle = tokio::spawn({
            let worker = Arc::clone(&worker);
            let cancel = cancel.clone();
            async move { worker.run(cancel).await }
        });
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(worker.job("hang").unwrap().is_running());

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("worker should stop promptly")
            .unwrap()
            .unwrap();

        let job = worker.job("hang").unwrap();
        assert!(!job.is_running());
        assert!(job.is_healthy().await);
    }

    #[tokio::test]
    async fn health_bind_failure_is_fatal() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut config = Config::with_tasks([TaskSpec::new("t", "0", "@every 1s")]);
        config.healthcheck = Some(HealthCheckConfig {
            host: "127.0.0.1".to_string(),
            port: taken.local_addr().unwrap().port(),
            path: "/health".to_string(),
        });
        let worker = Worker::with_runner(&config, Arc::new(ExitCode)).unwrap();

        let err = tokio::time::timeout(Duration::from_secs(5), worker.run(CancellationToken::new()))
            .await
            .expect("bind failure should return immediately")
            .unwrap_err();
        assert!(matches!(err, WorkerError::HealthServer(HealthError::Bind { .. })));
        assert!(worker.jobs()[0].history().await.is_empty());
    }
}
