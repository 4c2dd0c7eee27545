//! Configuration types and loading.
//!
//! A config file declares a log level, an optional IANA time zone, an
//! optional health check listener and the set of tasks keyed by name. The
//! format is picked from the file extension (YAML, JSON or TOML).

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default health check endpoint path.
pub const DEFAULT_HEALTH_PATH: &str = "/health";

/// Log verbosity for the process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    #[serde(alias = "")]
    Info,
    Warn,
    Error,
    /// Only fatal diagnostics. Logged at `error` since tracing has no fatal level.
    Fatal,
}

impl LogLevel {
    /// The `EnvFilter` directive for this level.
    pub fn as_filter(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error | Self::Fatal => "error",
        }
    }
}

/// How the wait between attempts grows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryType {
    /// Wait `retry_wait` seconds before every retry.
    #[default]
    Fixed,
    /// Wait `retry_wait * 2^attempt` seconds.
    Exponential,
    /// Any other value. Rejected by validation; the engine treats it as fixed.
    #[serde(other)]
    Unrecognized,
}

impl std::fmt::Display for RetryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Fixed => "fixed",
            Self::Exponential => "exponential",
            Self::Unrecognized => "unrecognized",
        };
        write!(f, "{s}")
    }
}

/// Health check listener settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(default = "default_health_host")]
    pub host: String,
    #[serde(default = "default_health_port")]
    pub port: u16,
    #[serde(default = "default_health_path")]
    pub path: String,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            host: default_health_host(),
            port: default_health_port(),
            path: default_health_path(),
        }
    }
}

impl HealthCheckConfig {
    /// `host:port` to bind.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_health_host() -> String {
    "localhost".to_string()
}

fn default_health_port() -> u16 {
    8080
}

fn default_health_path() -> String {
    DEFAULT_HEALTH_PATH.to_string()
}

fn default_retry_wait() -> u64 {
    1
}

/// A single schedulable task. Immutable once the config is loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Task name (injected from the map key).
    #[serde(skip)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Executable to run.
    pub command: String,
    /// Arguments, optionally containing template actions.
    #[serde(default)]
    pub args: Vec<String>,
    /// Cron expression or `@every <duration>`.
    pub schedule: String,
    /// Render `args` through the template engine before each attempt.
    #[serde(default)]
    pub use_template: bool,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Seed the command environment from the worker's own environment.
    #[serde(default)]
    pub propagate_env: bool,
    /// Per-attempt timeout in seconds. 0 disables it.
    #[serde(default)]
    pub timeout: u64,
    /// 0 = never retry, -1 = retry forever, N = retry up to N times.
    #[serde(default)]
    pub retry_limit: i64,
    /// Base wait between attempts in seconds.
    #[serde(default = "default_retry_wait")]
    pub retry_wait: u64,
    #[serde(default)]
    pub retry_type: RetryType,
    /// Reserved for health sensitivity.
    #[serde(default)]
    pub failure_count: u32,
    /// Exhausting retries does not mark the task unhealthy.
    #[serde(default)]
    pub fallthrough: bool,
}

impl TaskSpec {
    /// Create a task with default retry settings.
    pub fn new(
        name: impl Into<String>,
        command: impl Into<String>,
        schedule: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            command: command.into(),
            args: Vec::new(),
            schedule: schedule.into(),
            use_template: false,
            env: BTreeMap::new(),
            propagate_env: false,
            timeout: 0,
            retry_limit: 0,
            retry_wait: default_retry_wait(),
            retry_type: RetryType::Fixed,
            failure_count: 0,
            fallthrough: false,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_template(mut self, use_template: bool) -> Self {
        self.use_template = use_template;
        self
    }

    pub fn with_propagate_env(mut self, propagate: bool) -> Self {
        self.propagate_env = propagate;
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout = seconds;
        self
    }

    pub fn with_retry(mut self, limit: i64, wait: u64, retry_type: RetryType) -> Self {
        self.retry_limit = limit;
        self.retry_wait = wait;
        self.retry_type = retry_type;
        self
    }

    pub fn with_fallthrough(mut self, fallthrough: bool) -> Self {
        self.fallthrough = fallthrough;
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let key = |field: &str| format!("tasks.{}.{}", self.name, field);

        if self.command.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: key("command"),
                message: "must not be empty".to_string(),
            });
        }
        if self.schedule.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: key("schedule"),
                message: "must not be empty".to_string(),
            });
        }
        if self.retry_limit < -1 {
            return Err(ConfigError::InvalidValue {
                key: key("retry_limit"),
                message: format!("must be -1, 0 or positive, got {}", self.retry_limit),
            });
        }
        if self.retry_wait == 0 {
            return Err(ConfigError::InvalidValue {
                key: key("retry_wait"),
                message: "must be greater than 0".to_string(),
            });
        }
        if self.retry_type == RetryType::Unrecognized {
            return Err(ConfigError::InvalidValue {
                key: key("retry_type"),
                message: "must be one of fixed, exponential".to_string(),
            });
        }
        Ok(())
    }
}

/// Supported config file formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Yaml,
    Json,
    Toml,
}

impl ConfigFormat {
    /// Pick the format from a file extension.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();
        match extension {
            "yaml" | "yml" => Ok(Self::Yaml),
            "json" => Ok(Self::Json),
            "toml" => Ok(Self::Toml),
            other => Err(ConfigError::UnsupportedFormat {
                extension: other.to_string(),
            }),
        }
    }
}

/// Process configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub log_level: LogLevel,
    /// IANA time zone applied to schedules. Local time when absent.
    #[serde(default)]
    pub time_zone: Option<String>,
    pub tasks: BTreeMap<String, TaskSpec>,
    #[serde(default)]
    pub healthcheck: Option<HealthCheckConfig>,
}

impl Config {
    /// Build a config from tasks, without a health check listener.
    pub fn with_tasks(tasks: impl IntoIterator<Item = TaskSpec>) -> Self {
        Self {
            log_level: LogLevel::default(),
            time_zone: None,
            tasks: tasks.into_iter().map(|t| (t.name.clone(), t)).collect(),
            healthcheck: None,
        }
    }

    /// Read, parse and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let format = ConfigFormat::from_path(path)?;
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents, format)
    }

    /// Parse and validate config text in the given format.
    pub fn parse(contents: &str, format: ConfigFormat) -> Result<Self, ConfigError> {
        let mut config: Config = match format {
            ConfigFormat::Yaml => serde_yaml::from_str(contents)
                .map_err(|e| ConfigError::ParseError(e.to_string()))?,
            ConfigFormat::Json => serde_json::from_str(contents)
                .map_err(|e| ConfigError::ParseError(e.to_string()))?,
            ConfigFormat::Toml => {
                toml::from_str(contents).map_err(|e| ConfigError::ParseError(e.to_string()))?
            }
        };

        for (name, task) in config.tasks.iter_mut() {
            task.name = name.clone();
        }
        if config.time_zone.as_deref().is_some_and(|tz| tz.trim().is_empty()) {
            config.time_zone = None;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check the invariants the engine relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tasks.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "tasks".to_string(),
                message: "at least one task is required".to_string(),
            });
        }
        for task in self.tasks.values() {
            task.validate()?;
        }

        if let Some(ref tz) = self.time_zone {
            tz.parse::<chrono_tz::Tz>()
                .map_err(|_| ConfigError::InvalidTimeZone(tz.clone()))?;
        }

        if let Some(ref health) = self.healthcheck {
            if health.port == 0 {
                return Err(ConfigError::InvalidValue {
                    key: "healthcheck.port".to_string(),
                    message: "must be between 1 and 65535".to_string(),
                });
            }
            if !health.path.starts_with('/') {
                return Err(ConfigError::InvalidValue {
                    key: "healthcheck.path".to_string(),
                    message: format!("must start with '/', got {:?}", health.path),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const JSON: &str = r#"{
        "log_level": "debug",
        "time_zone": "Asia/Tokyo",
        "healthcheck": { "host": "0.0.0.0", "port": 30001 },
        "tasks": {
            "hello": {
                "description": "hello",
                "command": "echo",
                "args": ["hoge", "fuga"],
                "use_template": true,
                "schedule": "0 0 0 * * *",
                "env": { "TZ": "Asia/Tokyo" },
                "timeout": 30,
                "retry_limit": 3,
                "retry_wait": 30,
                "retry_type": "fixed",
                "failure_count": 1
            }
        }
    }"#;

    const YAML: &str = r#"
log_level: debug
time_zone: Asia/Tokyo
healthcheck:
  host: 0.0.0.0
  port: 30001
tasks:
  hello:
    description: hello
    command: echo
    args:
      - hoge
      - fuga
    use_template: true
    schedule: 0 0 0 * * *
    timeout: 30
    retry_limit: 3
    retry_wait: 30
    retry_type: fixed
    failure_count: 1
    env:
      TZ: Asia/Tokyo
"#;

    const TOML: &str = r#"
log_level = "debug"
time_zone = "Asia/Tokyo"

[healthcheck]
host = "0.0.0.0"
port = 30001

[tasks.hello]
description = "hello"
command = "echo"
args = ["hoge", "fuga"]
schedule = "0 0 0 * * *"
use_template = true
timeout = 30
retry_limit = 3
retry_wait = 30
retry_type = "fixed"
failure_count = 1

  [tasks.hello.env]
  TZ = "Asia/Tokyo"
"#;

    fn expected() -> Config {
        let mut task = TaskSpec::new("hello", "echo", "0 0 0 * * *")
            .with_args(["hoge", "fuga"])
            .with_template(true)
            .with_env("TZ", "Asia/Tokyo")
            .with_timeout(30)
            .with_retry(3, 30, RetryType::Fixed);
        task.description = "hello".to_string();
        task.failure_count = 1;

        Config {
            log_level: LogLevel::Debug,
            time_zone: Some("Asia/Tokyo".to_string()),
            tasks: BTreeMap::from([("hello".to_string(), task)]),
            healthcheck: Some(HealthCheckConfig {
                host: "0.0.0.0".to_string(),
                port: 30001,
                path: DEFAULT_HEALTH_PATH.to_string(),
            }),
        }
    }

    #[test]
    fn parses_all_formats_identically() {
        for (text, format) in [
            (JSON, ConfigFormat::Json),
            (YAML, ConfigFormat::Yaml),
            (TOML, ConfigFormat::Toml),
        ] {
            let config = Config::parse(text, format).unwrap();
            assert_eq!(config, expected(), "format {format:?}");
        }
    }

    #[test]
    fn format_from_extension() {
        assert_eq!(
            ConfigFormat::from_path(Path::new("a.yml")).unwrap(),
            ConfigFormat::Yaml
        );
        assert_eq!(
            ConfigFormat::from_path(Path::new("a.yaml")).unwrap(),
            ConfigFormat::Yaml
        );
        assert_eq!(
            ConfigFormat::from_path(Path::new("a.json")).unwrap(),
            ConfigFormat::Json
        );
        assert_eq!(
            ConfigFormat::from_path(Path::new("a.toml")).unwrap(),
            ConfigFormat::Toml
        );
        assert!(matches!(
            ConfigFormat::from_path(Path::new("a.ini")),
            Err(ConfigError::UnsupportedFormat { .. })
        ));
    }

    #[test]
    fn defaults_applied() {
        let config = Config::parse(
            r#"{"tasks": {"t": {"command": "true", "schedule": "@every 1s"}}, "healthcheck": {}}"#,
            ConfigFormat::Json,
        )
        .unwrap();
        assert_eq!(config.log_level, LogLevel::Info);
        assert!(config.time_zone.is_none());
        let task = &config.tasks["t"];
        assert_eq!(task.name, "t");
        assert_eq!(task.retry_limit, 0);
        assert_eq!(task.retry_wait, 1);
        assert_eq!(task.retry_type, RetryType::Fixed);
        assert_eq!(config.healthcheck.unwrap(), HealthCheckConfig::default());
    }

    #[test]
    fn empty_log_level_means_info() {
        let config = Config::parse(
            r#"{"log_level": "", "tasks": {"t": {"command": "true", "schedule": "@hourly"}}}"#,
            ConfigFormat::Json,
        )
        .unwrap();
        assert_eq!(config.log_level, LogLevel::Info);
    }

    #[test]
    fn rejects_unknown_retry_type() {
        let err = Config::parse(
            r#"{"tasks": {"t": {"command": "true", "schedule": "@hourly", "retry_type": "linear"}}}"#,
            ConfigFormat::Json,
        )
        .unwrap_err();
        assert!(err.to_string().contains("tasks.t.retry_type"));
    }

    #[test]
    fn rejects_bad_retry_values() {
        let err = Config::parse(
            r#"{"tasks": {"t": {"command": "true", "schedule": "@hourly", "retry_limit": -2}}}"#,
            ConfigFormat::Json,
        )
        .unwrap_err();
        assert!(err.to_string().contains("retry_limit"));

        let err = Config::parse(
            r#"{"tasks": {"t": {"command": "true", "schedule": "@hourly", "retry_wait": 0}}}"#,
            ConfigFormat::Json,
        )
        .unwrap_err();
        assert!(err.to_string().contains("retry_wait"));
    }

    #[test]
    fn rejects_unknown_time_zone() {
        let err = Config::parse(
            r#"{"time_zone": "Mars/Olympus", "tasks": {"t": {"command": "true", "schedule": "@hourly"}}}"#,
            ConfigFormat::Json,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidTimeZone(tz) if tz == "Mars/Olympus"));
    }

    #[test]
    fn rejects_empty_tasks() {
        let err = Config::parse(r#"{"tasks": {}}"#, ConfigFormat::Json).unwrap_err();
        assert!(err.to_string().contains("at least one task"));
    }

    #[test]
    fn rejects_relative_health_path() {
        let err = Config::parse(
            r#"{"healthcheck": {"path": "health"}, "tasks": {"t": {"command": "true", "schedule": "@hourly"}}}"#,
            ConfigFormat::Json,
        )
        .unwrap_err();
        assert!(err.to_string().contains("healthcheck.path"));
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chronos.toml");
        std::fs::write(&path, TOML).unwrap();
        assert_eq!(Config::load(&path).unwrap(), expected());
    }

    #[test]
    fn log_level_filters() {
        assert_eq!(LogLevel::Debug.as_filter(), "debug");
        assert_eq!(LogLevel::Fatal.as_filter(), "error");
        assert_eq!(LogLevel::default().as_filter(), "info");
    }
}
