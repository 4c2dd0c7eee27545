//! Schedule parsing and fire-event tickers.
//!
//! Each registered task gets its own ticker task that sleeps until the next
//! matching instant and then emits a [`Fire`] on the dispatch channel. Tickers
//! never run task commands themselves, so a slow cycle cannot delay the next
//! firing of any task.

use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use chrono_tz::Tz;
use regex::Regex;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::ConfigError;

const EVERY_PREFIX: &str = "@every";

static DURATION_PART: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)(ms|h|m|s)").expect("valid duration regex"));

/// Time zone schedules are evaluated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Zone {
    Local,
    Named(Tz),
}

impl Zone {
    /// Resolve an optional IANA name. `None` means the host's local zone.
    pub fn resolve(name: Option<&str>) -> Result<Self, ConfigError> {
        match name.map(str::trim) {
            None | Some("") => Ok(Self::Local),
            Some(name) => name
                .parse::<Tz>()
                .map(Self::Named)
                .map_err(|_| ConfigError::InvalidTimeZone(name.to_string())),
        }
    }
}

impl std::fmt::Display for Zone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "Local"),
            Self::Named(tz) => write!(f, "{}", tz.name()),
        }
    }
}

/// A parsed schedule expression.
#[derive(Debug, Clone)]
pub enum Schedule {
    Cron(Box<cron::Schedule>),
    /// Fixed interval, first firing one period after start.
    Every(Duration),
}

impl Schedule {
    /// Parse `expr` for the named task.
    pub fn parse(task: &str, expr: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidSchedule {
            task: task.to_string(),
            expr: expr.to_string(),
            reason,
        };

        let expr_trimmed = expr.trim();
        if let Some(rest) = expr_trimmed.strip_prefix(EVERY_PREFIX) {
            return parse_duration(rest).map(Self::Every).map_err(invalid);
        }

        cron::Schedule::from_str(expr_trimmed)
            .map(|s| Self::Cron(Box::new(s)))
            .map_err(|e| invalid(e.to_string()))
    }

    /// Next firing strictly after `after`, evaluated in `zone`.
    pub fn next_after(&self, after: DateTime<Utc>, zone: Zone) -> Option<DateTime<Utc>> {
        match self {
            Self::Cron(schedule) => match zone {
                Zone::Local => schedule
                    .after(&after.with_timezone(&Local))
                    .next()
                    .map(|t| t.with_timezone(&Utc)),
                Zone::Named(tz) => schedule
                    .after(&after.with_timezone(&tz))
                    .next()
                    .map(|t| t.with_timezone(&Utc)),
            },
            Self::Every(period) => chrono::Duration::from_std(*period)
                .ok()
                .and_then(|d| after.checked_add_signed(d)),
        }
    }
}

/// Go-style duration: `1h30m`, `45s`, `500ms`.
fn parse_duration(text: &str) -> Result<Duration, String> {
    let text = text.trim();
    if text.is_empty() {
        return Err("missing duration after @every".to_string());
    }

    let mut rest = text;
    let mut total = Duration::ZERO;
    while !rest.is_empty() {
        let caps = DURATION_PART
            .captures(rest)
            .ok_or_else(|| format!("invalid duration {text:?}"))?;
        let n: u64 = caps[1]
            .parse()
            .map_err(|_| format!("duration out of range {text:?}"))?;
        let part = match &caps[2] {
            "h" => Duration::from_secs(n.saturating_mul(3600)),
            "m" => Duration::from_secs(n.saturating_mul(60)),
            "s" => Duration::from_secs(n),
            _ => Duration::from_millis(n),
        };
        total = total.saturating_add(part);
        rest = &rest[caps[0].len()..];
    }

    if total.is_zero() {
        return Err("duration must be positive".to_string());
    }
    Ok(total)
}

/// A schedule matched for the task registered at `index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fire {
    pub index: usize,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Entry {
    task: String,
    schedule: Schedule,
}

/// Holds every task's schedule and drives their tickers.
#[derive(Debug)]
pub struct Scheduler {
    zone: Zone,
    entries: Vec<Entry>,
}

impl Scheduler {
    pub fn new(zone: Zone) -> Self {
        Self {
            zone,
            entries: Vec::new(),
        }
    }

    pub fn zone(&self) -> Zone {
        self.zone
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Register a task's schedule. Returns the index fires will carry.
    pub fn add(&mut self, task: &str, expr: &str) -> Result<usize, ConfigError> {
        let schedule = Schedule::parse(task, expr)?;
        self.entries.push(Entry {
            task: task.to_string(),
            schedule,
        });
        Ok(self.entries.len() - 1)
    }

    /// Next fire time for the task at `index`, computed from now.
    pub fn next_fire(&self, index: usize) -> Option<DateTime<Utc>> {
        self.entries
            .get(index)
            .and_then(|e| e.schedule.next_after(Utc::now(), self.zone))
    }

    /// Spawn one ticker per registered task. Tickers exit when `cancel`
    /// fires or the receiving side of `tx` is dropped.
    pub fn start(&self, tx: mpsc::Sender<Fire>, cancel: CancellationToken) -> JoinSet<()> {
        let mut tickers = JoinSet::new();
        for (index, entry) in self.entries.iter().enumerate() {
            let entry = entry.clone();
            let tx = tx.clone();
            let cancel = cancel.clone();
            let zone = self.zone;
            tickers.spawn(async move {
                match entry.schedule {
                    Schedule::Every(period) => run_interval(index, period, tx, cancel).await,
                    Schedule::Cron(_) => run_cron(index, entry, zone, tx, cancel).await,
                }
            });
        }
        tickers
    }
}

async fn run_interval(
    index: usize,
    period: Duration,
    tx: mpsc::Sender<Fire>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let fire = Fire { index, at: Utc::now() };
                if tx.send(fire).await.is_err() {
                    break;
                }
            }
            _ = cancel.cancelled() => break,
        }
    }
}

async fn run_cron(
    index: usize,
    entry: Entry,
    zone: Zone,
    tx: mpsc::Sender<Fire>,
    cancel: CancellationToken,
) {
    // Never fire the same instant twice, even if the sleep wakes early.
    let mut cursor = Utc::now();

    loop {
        let Some(next) = entry.schedule.next_after(cursor, zone) else {
            tracing::warn!(task = %entry.task, "Schedule has no upcoming fire time, ticker stopped");
            break;
        };
        let wait = (next - Utc::now()).to_std().unwrap_or_default();

        tokio::select! {
            _ = tokio::time::sleep(wait) => {
                if tx.send(Fire { index, at: next }).await.is_err() {
                    break;
                }
                cursor = next.max(Utc::now());
            }
            _ = cancel.cancelled() => break,
        }
    }
}
