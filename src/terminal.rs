//! Terminal command handling
//!
//! Interprets the commands typed into the terminal panel. Every command is
//! echoed back as an `input` line before its own output.

use serde::Serialize;

use crate::dispatcher::{Dispatcher, ExecutionRequest};
use crate::formatter::{self, TerminalLine};
use crate::workspace::{Workspace, WorkspaceError};

pub const HELP_TEXT: &str =
    "Commands: clear, ls, run [file], python3 [file], node [file], help, version";

pub const VERSION_TEXT: &str = concat!("polyrun v", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalCommand {
    Clear,
    Help,
    Ls,
    Version,
    /// Run a workspace file; `None` means the caller's active file
    Run { target: Option<String> },
    Unknown(String),
}

impl TerminalCommand {
    pub fn parse(input: &str) -> Self {
        let trimmed = input.trim();
        let mut words = trimmed.split_whitespace();
        let Some(head) = words.next() else {
            return TerminalCommand::Unknown(String::new());
        };
        let target = words.next().map(str::to_string);

        match head.to_lowercase().as_str() {
            "clear" => TerminalCommand::Clear,
            "help" => TerminalCommand::Help,
            "ls" => TerminalCommand::Ls,
            "version" => TerminalCommand::Version,
            "run" => TerminalCommand::Run { target },
            cmd if cmd.starts_with("python") || cmd.starts_with("node") => {
                TerminalCommand::Run { target }
            }
            _ => TerminalCommand::Unknown(trimmed.to_lowercase()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TerminalResponse {
    pub lines: Vec<TerminalLine>,
    /// The client should wipe its terminal before appending `lines`
    pub clear: bool,
}

/// Execute one terminal command against the workspace
pub async fn handle(
    input: &str,
    active_file: Option<&str>,
    workspace: &Workspace,
    dispatcher: &Dispatcher,
) -> TerminalResponse {
    let command = TerminalCommand::parse(input);
    if command == TerminalCommand::Clear {
        return TerminalResponse {
            lines: Vec::new(),
            clear: true,
        };
    }

    let mut lines = vec![TerminalLine::input(input)];
    match command {
        TerminalCommand::Clear => {}
        TerminalCommand::Help => lines.push(TerminalLine::info(HELP_TEXT)),
        TerminalCommand::Version => lines.push(TerminalLine::success(VERSION_TEXT)),
        TerminalCommand::Ls => match workspace.names().await {
            Ok(names) => lines.push(TerminalLine::info(names.join("  "))),
            Err(e) => lines.push(storage_line(&e)),
        },
        TerminalCommand::Run { target } => {
            let file = target.as_deref().or(active_file);
            lines.extend(run_file(file, workspace, dispatcher).await);
        }
        TerminalCommand::Unknown(cmd) => lines.push(TerminalLine::error(format!(
            "Command not found: {}. Type \"help\" for list.",
            cmd
        ))),
    }

    TerminalResponse {
        lines,
        clear: false,
    }
}

async fn run_file(
    file: Option<&str>,
    workspace: &Workspace,
    dispatcher: &Dispatcher,
) -> Vec<TerminalLine> {
    let Some(file_name) = file else {
        return vec![TerminalLine::error("No target file selected.")];
    };

    let code = match workspace.read(file_name).await {
        Ok(code) => code,
        Err(e) => return vec![storage_line(&e)],
    };

    let request = ExecutionRequest {
        code,
        language: String::new(),
        file_name: file_name.to_string(),
    };
    match dispatcher.submit(request).join().await {
        Ok(report) => report.lines(),
        Err(e) => formatter::format_error(&e),
    }
}

fn storage_line(err: &WorkspaceError) -> TerminalLine {
    match err {
        WorkspaceError::Storage { .. } => {
            TerminalLine::failure(formatter::Failure::StorageFailure, err.to_string())
        }
        _ => TerminalLine::error(err.to_string()),
    }
}
