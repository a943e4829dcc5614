//! Shell runner implementation
//!
//! Executes a command line through `sh -c` directly on the host. Each child
//! leads its own process group so that a timeout or cancellation can take
//! down everything it started.

use anyhow::{Context, Result};
use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{LineMark, OutputStream, RunLimits, RunOutcome, RunStatus, Runner, ShellCommand};

/// How long to keep reading pipes after the process itself is gone
const DRAIN_GRACE: Duration = Duration::from_secs(1);

const READ_CHUNK: usize = 8192;

/// Runner that executes commands through the host shell
pub struct ShellRunner {
    shell: String,
}

impl ShellRunner {
    pub fn new() -> Self {
        Self {
            shell: "sh".to_string(),
        }
    }

    /// Run a command line directly
    pub async fn execute(
        &self,
        cmd: &ShellCommand,
        limits: &RunLimits,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome> {
        if cancel.is_cancelled() {
            return Ok(RunOutcome::not_started(RunStatus::Cancelled));
        }

        debug!("Running `{}` in {:?}", cmd.script, cmd.work_dir);

        let mut command = Command::new(&self.shell);
        command
            .arg("-c")
            .arg(&cmd.script)
            .current_dir(&cmd.work_dir)
            .envs(cmd.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        let started = Instant::now();
        let mut child = command
            .spawn()
            .with_context(|| format!("Failed to spawn `{}`", cmd.script))?;
        let group = ProcessGroup::new(child.id());

        let drain = CancellationToken::new();
        let marks = Arc::new(Mutex::new(Vec::new()));
        let stdout = child.stdout.take().context("Child stdout was not captured")?;
        let stderr = child.stderr.take().context("Child stderr was not captured")?;
        let stdout_task = tokio::spawn(capture(
            stdout,
            OutputStream::Stdout,
            limits.max_output_bytes,
            marks.clone(),
            drain.clone(),
        ));
        let stderr_task = tokio::spawn(capture(
            stderr,
            OutputStream::Stderr,
            limits.max_output_bytes,
            marks.clone(),
            drain.clone(),
        ));

        let stop = tokio::select! {
            waited = child.wait() => Stop::Exited(waited),
            _ = tokio::time::sleep(limits.timeout) => Stop::TimedOut,
            _ = cancel.cancelled() => Stop::Cancelled,
        };

        let status = match stop {
            Stop::Exited(waited) => to_run_status(waited.context("Failed to wait for child")?),
            Stop::TimedOut => RunStatus::TimedOut,
            Stop::Cancelled => RunStatus::Cancelled,
        };
        if matches!(status, RunStatus::TimedOut | RunStatus::Cancelled) {
            group.kill();
            // Reap the shell so it does not linger as a zombie
            if let Err(e) = child.wait().await {
                warn!("Failed to reap killed child: {}", e);
            }
            debug!("`{}` stopped early: {:?}", cmd.script, status);
        }
        let elapsed_ms = started.elapsed().as_millis() as u64;

        // Background children left behind by the command go with it
        group.finish();

        let captures = async { (stdout_task.await, stderr_task.await) };
        tokio::pin!(captures);
        let (stdout, stderr) = match tokio::time::timeout(DRAIN_GRACE, &mut captures).await {
            Ok(joined) => joined,
            Err(_) => {
                warn!("Output pipes of `{}` still open, closing them", cmd.script);
                drain.cancel();
                captures.await
            }
        };
        let stdout = joined(stdout, "stdout")?;
        let stderr = joined(stderr, "stderr")?;
        let line_order = marks
            .lock()
            .map(|mut marks| std::mem::take(&mut *marks))
            .unwrap_or_default();

        Ok(RunOutcome {
            status,
            stdout: stdout.text,
            stderr: stderr.text,
            stdout_truncated: stdout.truncated,
            stderr_truncated: stderr.truncated,
            line_order,
            elapsed_ms,
        })
    }
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Runner for ShellRunner {
    async fn run(
        &self,
        cmd: &ShellCommand,
        limits: &RunLimits,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome> {
        self.execute(cmd, limits, cancel).await
    }
}

enum Stop {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

fn to_run_status(status: ExitStatus) -> RunStatus {
    match (status.code(), status.signal()) {
        (Some(code), _) => RunStatus::Exited(code),
        (None, Some(signal)) => RunStatus::Signaled(signal),
        (None, None) => RunStatus::Exited(-1),
    }
}

/// Kills the child's process group when finished or dropped
struct ProcessGroup {
    pgid: Option<i32>,
}

impl ProcessGroup {
    fn new(pid: Option<u32>) -> Self {
        Self {
            pgid: pid.map(|pid| pid as i32),
        }
    }

    fn kill(&self) {
        let Some(pgid) = self.pgid else {
            return;
        };
        match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => warn!("Failed to kill process group {}: {}", pgid, e),
        }
    }

    fn finish(mut self) {
        self.kill();
        self.pgid = None;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

struct Captured {
    text: String,
    truncated: bool,
}

/// Read a stream to EOF, keeping at most `limit` bytes
///
/// Every chunk that completes a line is recorded in `marks`, shared with the
/// other stream's reader, so the two streams can be merged in arrival order.
async fn capture<R>(
    mut reader: R,
    stream: OutputStream,
    limit: usize,
    marks: Arc<Mutex<Vec<LineMark>>>,
    stop: CancellationToken,
) -> std::io::Result<Captured>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let mut chunk = [0u8; READ_CHUNK];
    let mut truncated = false;
    let mut lines = 0;

    loop {
        let n = tokio::select! {
            read = reader.read(&mut chunk) => read?,
            _ = stop.cancelled() => break,
        };
        if n == 0 {
            break;
        }
        let room = limit.saturating_sub(buf.len());
        let kept = if n > room {
            truncated = true;
            &chunk[..room]
        } else {
            &chunk[..n]
        };
        buf.extend_from_slice(kept);

        let completed = kept.iter().filter(|&&b| b == b'\n').count();
        if completed > 0 {
            lines += completed;
            if let Ok(mut marks) = marks.lock() {
                marks.push(LineMark { stream, lines });
            }
        }
    }

    Ok(Captured {
        text: String::from_utf8_lossy(&buf).into_owned(),
        truncated,
    })
}

fn joined(
    result: std::result::Result<std::io::Result<Captured>, tokio::task::JoinError>,
    stream: &str,
) -> Result<Captured> {
    result
        .with_context(|| format!("Reader task for {} failed", stream))?
        .with_context(|| format!("Failed to read {}", stream))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn limits(timeout_ms: u64) -> RunLimits {
        RunLimits::new(Duration::from_millis(timeout_ms), 1024 * 1024)
    }

    async fn run_in(dir: &Path, script: &str, limits: &RunLimits) -> RunOutcome {
        ShellRunner::new()
            .execute(&ShellCommand::new(script, dir), limits, &CancellationToken::new())
            .await
            .unwrap()
    }

    /// A process is running if /proc has it and it is not a zombie
    fn is_running(pid: i32) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Err(_) => false,
            Ok(stat) => match stat.rsplit_once(')') {
                Some((_, rest)) => !rest.trim_start().starts_with(['Z', 'X']),
                None => false,
            },
        }
    }

    async fn wait_until_gone(pid: i32) -> bool {
        for _ in 0..50 {
            if !is_running(pid) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_captures_streams_separately() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = run_in(dir.path(), "echo out; echo err >&2; echo out2", &limits(5000)).await;
        assert_eq!(outcome.status, RunStatus::Exited(0));
        assert_eq!(outcome.stdout, "out\nout2\n");
        assert_eq!(outcome.stderr, "err\n");
        assert!(outcome.is_success());
    }

    #[tokio::test]
    async fn test_records_line_arrival_order() {
        let dir = tempfile::tempdir().unwrap();
        let script = "echo a; sleep 0.2; echo b >&2; sleep 0.2; echo c; echo d";
        let outcome = run_in(dir.path(), script, &limits(5000)).await;

        assert_eq!(outcome.stdout, "a\nc\nd\n");
        assert_eq!(outcome.stderr, "b\n");
        let order: Vec<_> = outcome.line_order.iter().map(|m| (m.stream, m.lines)).collect();
        assert_eq!(order[0], (OutputStream::Stdout, 1));
        assert_eq!(order[1], (OutputStream::Stderr, 1));
        assert_eq!(order.last(), Some(&(OutputStream::Stdout, 3)));
    }

    #[tokio::test]
    async fn test_reports_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = run_in(dir.path(), "exit 3", &limits(5000)).await;
        assert_eq!(outcome.status, RunStatus::Exited(3));
        assert_eq!(outcome.exit_code(), Some(3));
    }

    #[tokio::test]
    async fn test_reports_signal() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = run_in(dir.path(), "kill -9 $$", &limits(5000)).await;
        assert_eq!(outcome.status, RunStatus::Signaled(9));
        assert_eq!(outcome.exit_code(), None);
    }

    #[tokio::test]
    async fn test_runs_in_working_directory_with_env() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("input.txt"), "hello").unwrap();
        let cmd = ShellCommand::new("cat input.txt; echo \" $GREETING\"", dir.path())
            .with_env("GREETING", "world");
        let outcome = ShellRunner::new()
            .execute(&cmd, &limits(5000), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.stdout, "hello world\n");
    }

    #[tokio::test]
    async fn test_stdin_is_closed() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = run_in(dir.path(), "cat; echo done", &limits(5000)).await;
        assert_eq!(outcome.stdout, "done\n");
    }

    #[tokio::test]
    async fn test_timeout_kills_process_group() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = run_in(
            dir.path(),
            "sleep 30 & echo $! > bg.pid; echo $$ > sh.pid; wait",
            &limits(300),
        )
        .await;
        assert_eq!(outcome.status, RunStatus::TimedOut);
        assert!(outcome.elapsed_ms < 5000);

        let shell_pid: i32 = std::fs::read_to_string(dir.path().join("sh.pid"))
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        let bg_pid: i32 = std::fs::read_to_string(dir.path().join("bg.pid"))
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert!(wait_until_gone(shell_pid).await);
        assert!(wait_until_gone(bg_pid).await);
    }

    #[tokio::test]
    async fn test_cancellation_kills_process() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let cmd = ShellCommand::new("echo $$ > sh.pid; sleep 30", dir.path());
        let outcome = ShellRunner::new()
            .execute(&cmd, &limits(60_000), &cancel)
            .await
            .unwrap();
        assert_eq!(outcome.status, RunStatus::Cancelled);

        let pid: i32 = std::fs::read_to_string(dir.path().join("sh.pid"))
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert!(wait_until_gone(pid).await);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_spawns_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let cmd = ShellCommand::new("touch marker", dir.path());
        let outcome = ShellRunner::new()
            .execute(&cmd, &limits(5000), &cancel)
            .await
            .unwrap();
        assert_eq!(outcome.status, RunStatus::Cancelled);
        assert!(!dir.path().join("marker").exists());
    }

    #[tokio::test]
    async fn test_background_children_do_not_hold_output() {
        let dir = tempfile::tempdir().unwrap();
        let started = Instant::now();
        let outcome = run_in(dir.path(), "sleep 30 & echo started", &limits(10_000)).await;
        assert_eq!(outcome.status, RunStatus::Exited(0));
        assert_eq!(outcome.stdout, "started\n");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_output_is_capped() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = run_in(
            dir.path(),
            "head -c 100000 /dev/zero | tr '\\0' 'a'",
            &RunLimits::new(Duration::from_secs(5), 1000),
        )
        .await;
        assert_eq!(outcome.status, RunStatus::Exited(0));
        assert_eq!(outcome.stdout.len(), 1000);
        assert!(outcome.stdout_truncated);
        assert!(!outcome.stderr_truncated);
    }

    #[tokio::test]
    async fn test_concurrent_runs_do_not_block_each_other() {
        let dir = tempfile::tempdir().unwrap();
        let runner = std::sync::Arc::new(ShellRunner::new());
        let started = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let runner = runner.clone();
            let dir = dir.path().to_path_buf();
            handles.push(tokio::spawn(async move {
                runner
                    .execute(
                        &ShellCommand::new("sleep 0.5", &dir),
                        &RunLimits::default(),
                        &CancellationToken::new(),
                    )
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_success());
        }
        assert!(started.elapsed() < Duration::from_millis(1900));
    }

    #[tokio::test]
    async fn test_spawn_failure_in_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");
        let result = ShellRunner::new()
            .execute(
                &ShellCommand::new("true", &missing),
                &limits(1000),
                &CancellationToken::new(),
            )
            .await;
        assert!(result.is_err());
    }
}
