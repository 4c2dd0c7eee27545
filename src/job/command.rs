//! External command execution.
//!
//! Provides the process runner used by jobs:
//! - Exact environment control (the child sees only the effective env)
//! - Per-attempt timeout enforcement
//! - Prompt termination on cancellation
//! - Separate stdout/stderr capture

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::error::ExecError;

/// A fully resolved command ready to spawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub command: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub timeout: Option<Duration>,
}

impl Invocation {
    /// Command line for log output.
    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.command.clone()
        } else {
            format!("{} {}", self.command, self.args.join(" "))
        }
    }
}

/// Captured output of a command that ran to completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when terminated by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Convert a non-zero exit into an error.
    pub fn check(&self, command: &str) -> Result<(), ExecError> {
        if self.success() {
            Ok(())
        } else {
            Err(ExecError::Exit {
                command: command.to_string(),
                code: self.code,
            })
        }
    }
}

/// Runs a resolved invocation to completion.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run the command to completion. Errors only when it could not be run
    /// or did not finish (spawn failure, timeout, cancellation).
    async fn run(
        &self,
        invocation: &Invocation,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, ExecError>;
}

/// Spawns real child processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(
        &self,
        invocation: &Invocation,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, ExecError> {
        let mut command = Command::new(&invocation.command);
        command
            .args(&invocation.args)
            .env_clear()
            .envs(&invocation.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command.spawn().map_err(|e| ExecError::Spawn {
            command: invocation.command.clone(),
            source: e,
        })?;

        // Dropping `wait` on timeout/cancel kills the child.
        let wait = child.wait_with_output();
        let deadline = async {
            match invocation.timeout {
                Some(t) => tokio::time::sleep(t).await,
                None => std::future::pending().await,
            }
        };

        let output = tokio::select! {
            result = wait => result.map_err(|e| ExecError::Wait {
                command: invocation.command.clone(),
                source: e,
            })?,
            _ = deadline => {
                return Err(ExecError::Timeout {
                    command: invocation.command.clone(),
                    timeout: invocation.timeout.unwrap_or_default(),
                });
            }
            _ = cancel.cancelled() => {
                return Err(ExecError::Cancelled {
                    command: invocation.command.clone(),
                });
            }
        };

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: trim_newline(&output.stdout),
            stderr: trim_newline(&output.stderr),
        })
    }
}

fn trim_newline(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches(['\n', '\r'])
        .to_string()
}
