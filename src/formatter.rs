//! Result formatter
//!
//! Turns raw process results into the typed, ordered lines shown in the
//! terminal panel. Compile-phase lines always come before run-phase lines.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::dispatcher::{DispatchError, ExecutionRequest};
use crate::languages::{ResolveError, ToolchainCommand};
use crate::runner::{OutputStream, RunOutcome, RunStatus};
use crate::workspace::WorkspaceError;

/// Kind of a terminal line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineKind {
    Info,
    Success,
    Error,
    Input,
}

/// Which failure an error line reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Failure {
    UnsupportedLanguage,
    CompileFailure,
    RuntimeFailure,
    Timeout,
    Cancelled,
    StorageFailure,
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Failure::UnsupportedLanguage => "unsupported_language",
            Failure::CompileFailure => "compile_failure",
            Failure::RuntimeFailure => "runtime_failure",
            Failure::Timeout => "timeout",
            Failure::Cancelled => "cancelled",
            Failure::StorageFailure => "storage_failure",
        };
        write!(f, "{}", s)
    }
}

/// One line of terminal output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalLine {
    #[serde(rename = "type")]
    pub kind: LineKind,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<Failure>,
}

impl TerminalLine {
    pub fn info(text: impl Into<String>) -> Self {
        Self::plain(LineKind::Info, text)
    }

    pub fn success(text: impl Into<String>) -> Self {
        Self::plain(LineKind::Success, text)
    }

    pub fn input(text: impl Into<String>) -> Self {
        Self::plain(LineKind::Input, text)
    }

    /// Error line without a failure tag (bad terminal command, missing file, ...)
    pub fn error(text: impl Into<String>) -> Self {
        Self::plain(LineKind::Error, text)
    }

    pub fn failure(failure: Failure, text: impl Into<String>) -> Self {
        Self {
            kind: LineKind::Error,
            text: text.into(),
            failure: Some(failure),
        }
    }

    fn plain(kind: LineKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
            failure: None,
        }
    }
}

/// Format the results of one execution request
pub fn format(
    request: &ExecutionRequest,
    command: &ToolchainCommand,
    compile: Option<&RunOutcome>,
    run: Option<&RunOutcome>,
) -> Vec<TerminalLine> {
    let mut lines = Vec::new();
    let target = describe(request, command);

    if let Some(compile) = compile {
        if compile.is_success() {
            lines.push(TerminalLine::info(format!(
                "Compiled {} in {} ms",
                target, compile.elapsed_ms
            )));
            // Warnings from a successful build
            lines.extend(non_empty_lines(&compile.stderr).map(TerminalLine::info));
        } else {
            lines.push(compile_failure_line(&target, compile));
            return lines;
        }
    }

    let Some(run) = run else {
        return lines;
    };

    lines.extend(run_output_lines(run));
    if run.stdout_truncated {
        lines.push(TerminalLine::info("[stdout truncated]"));
    }
    if run.stderr_truncated {
        lines.push(TerminalLine::failure(
            Failure::RuntimeFailure,
            "[stderr truncated]",
        ));
    }

    match run.status {
        RunStatus::Exited(0) if run.stderr.is_empty() => {
            lines.push(TerminalLine::success(format!(
                "Process finished in {} ms",
                run.elapsed_ms
            )));
        }
        RunStatus::Exited(0) => {}
        _ => lines.push(run_failure_line(&target, run)),
    }

    lines
}

/// Lines for a request that failed before or outside process execution
pub fn format_error(err: &DispatchError) -> Vec<TerminalLine> {
    let line = match err {
        DispatchError::Unsupported(ResolveError::UnsupportedLanguage { .. }) => {
            TerminalLine::failure(Failure::UnsupportedLanguage, err.to_string())
        }
        DispatchError::Workspace(WorkspaceError::Storage { .. }) | DispatchError::BuildDir(_) => {
            TerminalLine::failure(Failure::StorageFailure, err.to_string())
        }
        DispatchError::Workspace(_) => TerminalLine::error(err.to_string()),
        DispatchError::Cancelled => TerminalLine::failure(Failure::Cancelled, err.to_string()),
        DispatchError::Process(_) | DispatchError::TaskLost => {
            TerminalLine::failure(Failure::RuntimeFailure, err.to_string())
        }
    };
    vec![line]
}

/// Single message for the `error` field of the run response
pub fn error_summary(
    request: &ExecutionRequest,
    command: &ToolchainCommand,
    compile: Option<&RunOutcome>,
    run: Option<&RunOutcome>,
) -> Option<String> {
    let target = describe(request, command);

    if let Some(compile) = compile.filter(|c| !c.is_success()) {
        return Some(match compile.status {
            RunStatus::TimedOut | RunStatus::Cancelled => status_message("Compilation", &target, compile),
            _ => compiler_diagnostics(compile),
        });
    }

    let run = run?;
    if !run.stderr.is_empty() {
        return Some(run.stderr.clone());
    }
    match run.status {
        RunStatus::Exited(0) => None,
        _ => Some(status_message("Execution", &target, run)),
    }
}

fn compile_failure_line(target: &str, compile: &RunOutcome) -> TerminalLine {
    match compile.status {
        RunStatus::TimedOut => {
            TerminalLine::failure(Failure::Timeout, status_message("Compilation", target, compile))
        }
        RunStatus::Cancelled => {
            TerminalLine::failure(Failure::Cancelled, status_message("Compilation", target, compile))
        }
        _ => TerminalLine::failure(
            Failure::CompileFailure,
            format!(
                "Compilation failed for {}:\n{}",
                target,
                compiler_diagnostics(compile)
            ),
        ),
    }
}

fn run_failure_line(target: &str, run: &RunOutcome) -> TerminalLine {
    let failure = match run.status {
        RunStatus::TimedOut => Failure::Timeout,
        RunStatus::Cancelled => Failure::Cancelled,
        _ => Failure::RuntimeFailure,
    };
    TerminalLine::failure(failure, status_message("Execution", target, run))
}

/// Compiler output, falling back to stdout and then a generic message
fn compiler_diagnostics(compile: &RunOutcome) -> String {
    if !compile.stderr.trim().is_empty() {
        compile.stderr.trim_end().to_string()
    } else if !compile.stdout.trim().is_empty() {
        compile.stdout.trim_end().to_string()
    } else {
        match compile.status {
            RunStatus::Signaled(signal) => format!("Compiler crashed (signal {})", signal),
            RunStatus::Exited(code) => format!("Compilation failed with exit code {}", code),
            _ => "Compilation failed".to_string(),
        }
    }
}

fn status_message(phase: &str, target: &str, outcome: &RunOutcome) -> String {
    match outcome.status {
        RunStatus::Exited(code) => format!("{} of {} exited with code {}", phase, target, code),
        RunStatus::Signaled(signal) => {
            format!("{} of {} was killed by signal {}", phase, target, signal)
        }
        RunStatus::TimedOut => format!(
            "{} of {} timed out after {} ms",
            phase, target, outcome.elapsed_ms
        ),
        RunStatus::Cancelled => format!("{} of {} was cancelled", phase, target),
    }
}

fn describe(request: &ExecutionRequest, command: &ToolchainCommand) -> String {
    format!("{} ({}, {})", request.file_name, command.language, command.toolchain)
}

/// Run output with stdout and stderr lines merged in arrival order
fn run_output_lines(run: &RunOutcome) -> Vec<TerminalLine> {
    let stdout: Vec<&str> = run.stdout.split('\n').collect();
    let stderr: Vec<&str> = run.stderr.split('\n').collect();
    let (mut stdout_pos, mut stderr_pos) = (0, 0);
    let mut lines = Vec::new();

    for mark in &run.line_order {
        match mark.stream {
            OutputStream::Stdout => {
                push_stream_lines(&mut lines, mark.stream, &stdout, &mut stdout_pos, mark.lines)
            }
            OutputStream::Stderr => {
                push_stream_lines(&mut lines, mark.stream, &stderr, &mut stderr_pos, mark.lines)
            }
        }
    }
    // Unterminated tails, or everything when no order was recorded
    push_stream_lines(&mut lines, OutputStream::Stdout, &stdout, &mut stdout_pos, stdout.len());
    push_stream_lines(&mut lines, OutputStream::Stderr, &stderr, &mut stderr_pos, stderr.len());
    lines
}

fn push_stream_lines(
    lines: &mut Vec<TerminalLine>,
    stream: OutputStream,
    segments: &[&str],
    pos: &mut usize,
    upto: usize,
) {
    let upto = upto.min(segments.len());
    if *pos >= upto {
        return;
    }
    for segment in &segments[*pos..upto] {
        let text = segment.strip_suffix('\r').unwrap_or(segment);
        if text.trim().is_empty() {
            continue;
        }
        lines.push(match stream {
            OutputStream::Stdout => TerminalLine::info(text),
            OutputStream::Stderr => TerminalLine::failure(Failure::RuntimeFailure, text),
        });
    }
    *pos = upto;
}

fn non_empty_lines(text: &str) -> impl Iterator<Item = &str> {
    text.lines().filter(|line| !line.trim().is_empty())
}
