//! Error types for Chronos.

use std::time::Duration;

/// Configuration-related errors. All of these are fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Unsupported config file extension {extension:?}: must be one of yaml, yml, json, toml")]
    UnsupportedFormat { extension: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Invalid schedule {expr:?} for task `{task}`: {reason}")]
    InvalidSchedule {
        task: String,
        expr: String,
        reason: String,
    },

    #[error("Unknown time zone: {0}")]
    InvalidTimeZone(String),

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Argument template rendering errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    #[error("unclosed action starting at byte {offset}")]
    Unclosed { offset: usize },

    #[error("malformed action {action:?}")]
    Malformed { action: String },

    #[error("unknown function `{name}`")]
    UnknownFunction { name: String },

    #[error("function `{name}` takes {expected} argument(s), got {got}")]
    Arity {
        name: String,
        expected: usize,
        got: usize,
    },

    #[error("invalid time layout {layout:?}")]
    TimeLayout { layout: String },
}

/// Errors from a single execution attempt. Contained inside the Job.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("failed to render argument {arg:?}: {source}")]
    Template {
        arg: String,
        #[source]
        source: TemplateError,
    },

    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed waiting on `{command}`: {source}")]
    Wait {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with {}", exit_description(.code))]
    Exit { command: String, code: Option<i32> },

    #[error("`{command}` timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("`{command}` cancelled")]
    Cancelled { command: String },
}

fn exit_description(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!("exit code {c}"),
        None => "termination by signal".to_string(),
    }
}

impl ExecError {
    /// Whether the attempt ended because the governing context was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// Health server and health client errors.
#[derive(Debug, thiserror::Error)]
pub enum HealthError {
    #[error("failed to bind health server on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("health server stopped: {0}")]
    Serve(#[source] std::io::Error),

    #[error("failed to request health endpoint: {0}")]
    Request(#[from] reqwest::Error),

    #[error("malformed health response: {0}")]
    MalformedResponse(String),
}

/// Errors that escape the Worker boundary.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    HealthServer(#[from] HealthError),

    #[error("health server task aborted: {0}")]
    HealthServerAborted(String),
}
