//! Execution dispatcher
//!
//! Runs one request through resolve -> save -> compile -> run. Every request
//! is its own tokio task and reports through its own oneshot channel; nothing
//! about an execution is shared with other requests.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{oneshot, Semaphore};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use crate::formatter::{self, TerminalLine};
use crate::languages::{LanguageTable, ResolveError, ToolchainCommand};
use crate::runner::{RunLimits, RunOutcome, RunStatus, Runner, ShellCommand};
use crate::workspace::{validate_file_name, Workspace, WorkspaceError};

/// Environment variable naming the per-run scratch directory for build artifacts
pub const BUILD_DIR_ENV: &str = "BUILD_DIR";

/// A request to run source code
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    pub code: String,
    #[serde(default)]
    pub language: String,
    pub file_name: String,
}

/// Limits applied to the phases of one request
#[derive(Debug, Clone)]
pub struct ExecutionLimits {
    pub compile_timeout: Duration,
    pub run_timeout: Duration,
    pub max_output_bytes: usize,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            compile_timeout: Duration::from_secs(30),
            run_timeout: Duration::from_secs(10),
            max_output_bytes: 1024 * 1024,
        }
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Unsupported(#[from] ResolveError),

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    #[error("Failed to prepare build directory: {0}")]
    BuildDir(std::io::Error),

    #[error("Process execution failed: {0:#}")]
    Process(anyhow::Error),

    #[error("Execution cancelled")]
    Cancelled,

    #[error("Execution task ended without reporting a result")]
    TaskLost,
}

/// Everything that happened while executing one request
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub request: ExecutionRequest,
    pub command: ToolchainCommand,
    /// Present for compiled languages
    pub compile: Option<RunOutcome>,
    /// Absent when the compile step failed
    pub run: Option<RunOutcome>,
}

impl ExecutionReport {
    pub fn lines(&self) -> Vec<TerminalLine> {
        formatter::format(
            &self.request,
            &self.command,
            self.compile.as_ref(),
            self.run.as_ref(),
        )
    }

    /// Captured stdout of the run step (empty if it never ran)
    pub fn output(&self) -> &str {
        self.run.as_ref().map(|r| r.stdout.as_str()).unwrap_or_default()
    }

    pub fn error(&self) -> Option<String> {
        formatter::error_summary(
            &self.request,
            &self.command,
            self.compile.as_ref(),
            self.run.as_ref(),
        )
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.run.as_ref().and_then(RunOutcome::exit_code)
    }

    pub fn timed_out(&self) -> bool {
        self.compile
            .iter()
            .chain(self.run.iter())
            .any(|o| o.status == RunStatus::TimedOut)
    }

    pub fn duration_ms(&self) -> u64 {
        self.compile
            .iter()
            .chain(self.run.iter())
            .map(|o| o.elapsed_ms)
            .sum()
    }
}

/// Handle to a submitted execution; dropping it cancels the execution
pub struct RunHandle {
    result: oneshot::Receiver<Result<ExecutionReport, DispatchError>>,
    guard: DropGuard,
}

impl RunHandle {
    /// Wait for the execution's single result
    pub async fn join(self) -> Result<ExecutionReport, DispatchError> {
        let RunHandle { result, guard } = self;
        let report = result.await.map_err(|_| DispatchError::TaskLost)?;
        guard.disarm();
        report
    }
}

struct Inner {
    workspace: Workspace,
    languages: Arc<LanguageTable>,
    runner: Arc<dyn Runner>,
    limits: ExecutionLimits,
    permits: Option<Arc<Semaphore>>,
}

#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn new(
        workspace: Workspace,
        languages: Arc<LanguageTable>,
        runner: Arc<dyn Runner>,
        limits: ExecutionLimits,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                workspace,
                languages,
                runner,
                limits,
                permits: None,
            }),
        }
    }

    /// Bound the number of executions in flight; 0 means unbounded
    pub fn with_max_concurrent(self, max: usize) -> Self {
        if max == 0 {
            return self;
        }
        let inner = Inner {
            workspace: self.inner.workspace.clone(),
            languages: self.inner.languages.clone(),
            runner: self.inner.runner.clone(),
            limits: self.inner.limits.clone(),
            permits: Some(Arc::new(Semaphore::new(max))),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Start executing a request on its own task
    pub fn submit(&self, request: ExecutionRequest) -> RunHandle {
        let token = CancellationToken::new();
        let (tx, rx) = oneshot::channel();

        let dispatcher = self.clone();
        let task_token = token.clone();
        tokio::spawn(async move {
            let result = dispatcher.execute(request, &task_token).await;
            if tx.send(result).is_err() {
                debug!("Execution result dropped, caller went away");
            }
        });

        RunHandle {
            result: rx,
            guard: token.drop_guard(),
        }
    }

    /// Execute a request on the current task
    pub async fn execute(
        &self,
        request: ExecutionRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecutionReport, DispatchError> {
        let inner = &self.inner;

        validate_file_name(&request.file_name)?;
        let command = inner
            .languages
            .resolve(&request.language, &request.file_name)?;

        let _permit = match &inner.permits {
            Some(permits) => tokio::select! {
                permit = permits.clone().acquire_owned() => Some(permit.map_err(|_| DispatchError::Cancelled)?),
                _ = cancel.cancelled() => return Err(DispatchError::Cancelled),
            },
            None => None,
        };
        if cancel.is_cancelled() {
            return Err(DispatchError::Cancelled);
        }

        inner
            .workspace
            .write(&request.file_name, &request.code)
            .await?;

        info!(
            "Running {} as {} ({}{})",
            request.file_name,
            command.language,
            command.toolchain,
            if command.is_compiled() { ", compiled" } else { "" }
        );

        let build_dir = tempfile::Builder::new()
            .prefix("polyrun-build-")
            .tempdir()
            .map_err(DispatchError::BuildDir)?;
        let build_dir_value = build_dir.path().to_string_lossy().into_owned();
        let step = |script: &str| {
            ShellCommand::new(script, inner.workspace.root())
                .with_env(BUILD_DIR_ENV, build_dir_value.clone())
        };

        let mut report = ExecutionReport {
            request,
            command,
            compile: None,
            run: None,
        };

        if let Some(compile_step) = report.command.compile_step.clone() {
            let limits = RunLimits::new(inner.limits.compile_timeout, inner.limits.max_output_bytes);
            let outcome = inner
                .runner
                .run(&step(&compile_step), &limits, cancel)
                .await
                .map_err(DispatchError::Process)?;

            let compiled = outcome.is_success();
            report.compile = Some(outcome);
            if !compiled {
                info!("Compilation of {} failed", report.request.file_name);
                return Ok(report);
            }
        }

        let limits = RunLimits::new(inner.limits.run_timeout, inner.limits.max_output_bytes);
        let outcome = inner
            .runner
            .run(&step(&report.command.run_step), &limits, cancel)
            .await
            .map_err(DispatchError::Process)?;

        if !outcome.is_success() {
            warn!(
                "{} finished with {:?} after {} ms",
                report.request.file_name, outcome.status, outcome.elapsed_ms
            );
        } else {
            info!(
                "{} finished in {} ms",
                report.request.file_name, outcome.elapsed_ms
            );
        }
        report.run = Some(outcome);

        Ok(report)
    }
}
