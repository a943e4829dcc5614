//! Runner module - Process execution layer
//!
//! Runs one shell command line to completion and hands back what it printed:
//! - `ShellRunner`: spawns `sh -c` in its own process group on the host
//!
//! The runner module does NOT:
//! - Pick toolchains or build command lines
//! - Decide whether a run succeeded from the user's point of view
//! - Touch the workspace files

pub mod shell;

use anyhow::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Shell command specification for execution
#[derive(Debug, Clone)]
pub struct ShellCommand {
    /// Command line passed to `sh -c`
    pub script: String,
    /// Working directory
    pub work_dir: PathBuf,
    /// Extra environment variables
    pub env: Vec<(String, String)>,
}

impl ShellCommand {
    pub fn new(script: impl Into<String>, work_dir: impl AsRef<Path>) -> Self {
        Self {
            script: script.into(),
            work_dir: work_dir.as_ref().to_path_buf(),
            env: Vec::new(),
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Bounds applied to one process
#[derive(Debug, Clone)]
pub struct RunLimits {
    /// Wall-clock limit
    pub timeout: Duration,
    /// Bytes kept per output stream; the rest is drained and dropped
    pub max_output_bytes: usize,
}

impl RunLimits {
    pub fn new(timeout: Duration, max_output_bytes: usize) -> Self {
        Self {
            timeout,
            max_output_bytes,
        }
    }
}

impl Default for RunLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_output_bytes: 1024 * 1024,
        }
    }
}

/// Execution status (raw, no interpretation)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Program exited normally with given exit code
    Exited(i32),
    /// Killed by signal
    Signaled(i32),
    /// Wall-clock limit exceeded, process group killed
    TimedOut,
    /// Caller cancelled, process group killed
    Cancelled,
}

impl RunStatus {
    /// Check if execution was successful (exited with code 0)
    pub fn is_success(&self) -> bool {
        matches!(self, RunStatus::Exited(0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// `stream` had produced `lines` complete lines at this point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineMark {
    pub stream: OutputStream,
    pub lines: usize,
}

/// Outcome of running a command
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: RunStatus,
    /// Stdout content (lossy UTF-8)
    pub stdout: String,
    /// Stderr content (lossy UTF-8)
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    /// Arrival order of completed lines across both streams, empty if unknown
    pub line_order: Vec<LineMark>,
    /// Wall time in milliseconds
    pub elapsed_ms: u64,
}

impl RunOutcome {
    /// Outcome of a command that was never started
    pub fn not_started(status: RunStatus) -> Self {
        Self {
            status,
            stdout: String::new(),
            stderr: String::new(),
            stdout_truncated: false,
            stderr_truncated: false,
            line_order: Vec::new(),
            elapsed_ms: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Exit code, if the process exited on its own
    pub fn exit_code(&self) -> Option<i32> {
        match self.status {
            RunStatus::Exited(code) => Some(code),
            _ => None,
        }
    }
}

/// Runner trait for executing commands
#[async_trait]
pub trait Runner: Send + Sync {
    /// Run a command to completion, timeout, or cancellation
    async fn run(
        &self,
        cmd: &ShellCommand,
        limits: &RunLimits,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome>;
}

pub use shell::ShellRunner;
