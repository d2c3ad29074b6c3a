//! Worker Invoker: runs the external face/plate redaction process.
//!
//! One child per pipeline run, argument shape
//! `<program> <leading_args..> --input <path> [<model-flag> <model-path>]..`.
//! stdout carries the payloads, stderr is diagnostics only. The wait is
//! bounded by `WorkerConfig::timeout`; an expired child is killed.

use std::ffi::OsString;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;

use crate::config::WorkerConfig;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Failed to spawn worker '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Worker exited with status {}", describe_exit(.exit_code))]
    Failed {
        exit_code: Option<i32>,
        stderr_excerpt: String,
    },

    #[error("Worker timed out after {0:?}")]
    TimedOut(Duration),

    #[error("I/O error while collecting worker output: {0}")]
    Io(#[from] std::io::Error),

    #[error("Worker admission closed")]
    AdmissionClosed,
}

/// Everything the worker produced on a zero exit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

/// Seam between the orchestrator and whatever performs redaction.
#[async_trait]
pub trait RedactionWorker: Send + Sync {
    /// Run redaction on the staged image at `input`.
    async fn invoke(&self, input: &Path) -> Result<RawOutput, WorkerError>;
}

/// Spawns the configured worker program as a child process.
pub struct ProcessWorker {
    config: WorkerConfig,
}

impl ProcessWorker {
    pub fn new(config: WorkerConfig) -> Self {
        Self { config }
    }

    /// Arguments after the program name, in order.
    pub fn command_args(&self, input: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = self
            .config
            .leading_args
            .iter()
            .map(OsString::from)
            .collect();
        args.push(OsString::from(&self.config.input_flag));
        args.push(input.as_os_str().to_os_string());
        for model in &self.config.models {
            args.push(OsString::from(&model.flag));
            args.push(model.path.as_os_str().to_os_string());
        }
        args
    }
}

#[async_trait]
impl RedactionWorker for ProcessWorker {
    async fn invoke(&self, input: &Path) -> Result<RawOutput, WorkerError> {
        let started = Instant::now();
        let mut command = Command::new(&self.config.program);
        command
            .args(self.command_args(input))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command.spawn().map_err(|source| WorkerError::Spawn {
            program: self.config.program.display().to_string(),
            source,
        })?;
        let pid = child.id();
        tracing::debug!(pid, input = %input.display(), "Worker spawned");

        // Dropping the wait future on timeout drops the child, and
        // kill_on_drop terminates it.
        let output = match tokio::time::timeout(self.config.timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                tracing::warn!(
                    pid,
                    timeout_secs = self.config.timeout.as_secs_f64(),
                    "Worker timed out, killing"
                );
                return Err(WorkerError::TimedOut(self.config.timeout));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let exit_code = output.status.code();

        if !output.status.success() {
            return Err(WorkerError::Failed {
                exit_code,
                stderr_excerpt: excerpt_tail(&stderr, self.config.stderr_excerpt_chars),
            });
        }

        tracing::debug!(
            pid,
            elapsed_ms = started.elapsed().as_millis() as u64,
            stdout_bytes = stdout.len(),
            stderr_bytes = stderr.len(),
            "Worker finished"
        );

        Ok(RawOutput {
            stdout,
            stderr,
            exit_code,
        })
    }
}

fn describe_exit(code: &Option<i32>) -> String {
    code.map_or_else(|| "signal".to_string(), |c| c.to_string())
}

/// Last `max_chars` characters of `text`, trimmed. Tracebacks end at the bottom.
pub fn excerpt_tail(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    let count = trimmed.chars().count();
    if count <= max_chars {
        return trimmed.to_string();
    }
    let tail: String = trimmed.chars().skip(count - max_chars).collect();
    format!("…{tail}")
}
