//! Supervised execution of one external command.
//!
//! This is the non-pooled sibling of the worker channel: spawn a process
//! with a replacement environment, copy its output into an [`ActionSink`]
//! while scanning for an embedded status line, and fold exit code, status
//! line and timeout state into one [`Status`].

use crate::alarm::{kill_process, Alarm, TimeoutHandler};
use crate::error::CommandError;
use crate::sink::ActionSink;
use rth_common::{interpret_exit, ExitMap, Status, StatusLineScanner, STDERR_STREAM, STDOUT_STREAM};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, warn};

const COPY_BUF: usize = 8 * 1024;

/// Extra wait beyond a diagnostic handler's declared budget before the
/// process is killed without its completion signal.
pub(crate) const HANDLER_GRACE: Duration = Duration::from_secs(5);

/// One command to run under supervision.
pub struct ProcessCommand {
    argv: Vec<String>,
    env: HashMap<String, String>,
    work_dir: PathBuf,
    timeout: Option<(Duration, Arc<dyn TimeoutHandler>)>,
    exit_map: Option<ExitMap>,
}

impl ProcessCommand {
    /// The inherited environment is not consulted: `env` is the entire
    /// environment the command will see.
    pub fn new(
        argv: Vec<String>,
        env: HashMap<String, String>,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            argv,
            env,
            work_dir: work_dir.into(),
            timeout: None,
            exit_map: None,
        }
    }

    /// Kill the command and report a timeout if it runs past `limit`. The
    /// handler gets to collect diagnostics first. Callers apply any global
    /// timeout factor before passing `limit`.
    #[must_use]
    pub fn with_timeout(mut self, limit: Duration, handler: Arc<dyn TimeoutHandler>) -> Self {
        self.timeout = Some((limit, handler));
        self
    }

    /// Map exit codes to statuses instead of the plain zero/non-zero rule.
    #[must_use]
    pub fn with_exit_map(mut self, map: ExitMap) -> Self {
        self.exit_map = Some(map);
        self
    }

    /// Run to completion. Output lands in the sink's `stdout`/`stderr`
    /// streams; stdout is scanned for an embedded status line.
    pub async fn run(&self, sink: &Arc<ActionSink>) -> Result<Status, CommandError> {
        let (program, args) = self.argv.split_first().ok_or_else(|| {
            CommandError::Spawn(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty argument vector",
            ))
        })?;
        let started = Instant::now();

        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(&self.work_dir)
            .env_clear()
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        debug!(program, "starting supervised command");
        let mut child = command.spawn().map_err(CommandError::Spawn)?;
        let pid = child.id();

        let stdout = take_pipe(child.stdout.take())?;
        let stderr = take_pipe(child.stderr.take())?;

        let mut handler_done: Option<oneshot::Receiver<bool>> = None;
        let alarm = self.timeout.as_ref().map(|(limit, handler)| {
            let (done_tx, done_rx) = oneshot::channel();
            handler_done = Some(done_rx);
            let handler = handler.clone();
            Alarm::schedule(*limit, move || {
                tokio::spawn(async move {
                    warn!(?pid, "command timeout elapsed; running diagnostic handler");
                    let budget = handler.budget() + HANDLER_GRACE;
                    let join = tokio::time::timeout(
                        budget,
                        tokio::task::spawn_blocking(move || handler.handle_timeout(pid)),
                    )
                    .await;
                    let completed = matches!(join, Ok(Ok(())));
                    if !completed {
                        warn!("diagnostic handler did not finish within its budget");
                    }
                    if let Some(pid) = pid {
                        kill_process(pid, true);
                    }
                    let _ = done_tx.send(completed);
                });
            })
        });

        let out_task = tokio::spawn(copy_and_scan(stdout, sink.clone()));
        let err_task = tokio::spawn(copy_stream(stderr, sink.clone()));

        let exit = child.wait().await;
        if let Some(alarm) = &alarm {
            alarm.cancel();
        }
        let exit = exit?;

        let scanned = out_task.await.unwrap_or(None);
        let _ = err_task.await;

        if let Some(alarm) = &alarm {
            if alarm.fired() {
                let budget = self
                    .timeout
                    .as_ref()
                    .map(|(_, handler)| handler.budget())
                    .unwrap_or_default();
                let completed = wait_for_handler(handler_done, budget).await;
                let elapsed = started.elapsed();
                warn!(?elapsed, completed, "supervised command timed out");
                return Ok(Status::error(format!(
                    "timed out after {} (diagnostic handler completed: {completed})",
                    humantime::format_duration(Duration::from_secs(elapsed.as_secs())),
                )));
            }
        }

        let status = match exit.code() {
            None => signal_status(&exit),
            code => interpret_exit(code, scanned.as_ref(), self.exit_map.as_ref()),
        };
        debug!(status = %status, elapsed = ?started.elapsed(), "supervised command finished");
        Ok(status)
    }
}

/// Bounded wait for the handler-completion signal; the timeout outcome is
/// never raised before the handler finishes or exhausts its budget.
pub(crate) async fn wait_for_handler(
    done: Option<oneshot::Receiver<bool>>,
    budget: Duration,
) -> bool {
    match done {
        Some(rx) => tokio::time::timeout(budget + 2 * HANDLER_GRACE, rx)
            .await
            .map(|sent| sent.unwrap_or(false))
            .unwrap_or(false),
        None => false,
    }
}

fn take_pipe<T>(pipe: Option<T>) -> Result<T, CommandError> {
    pipe.ok_or_else(|| CommandError::Io(std::io::Error::other("child pipe unavailable")))
}

async fn copy_and_scan<R>(mut reader: R, sink: Arc<ActionSink>) -> Option<Status>
where
    R: AsyncRead + Unpin,
{
    let mut scanner = StatusLineScanner::new();
    let mut buf = vec![0u8; COPY_BUF];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                scanner.feed(&buf[..n]);
                sink.append(STDOUT_STREAM, &String::from_utf8_lossy(&buf[..n]));
            }
            Err(e) => {
                debug!("stdout copy ended: {e}");
                break;
            }
        }
    }
    scanner.finish()
}

async fn copy_stream<R>(mut reader: R, sink: Arc<ActionSink>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => sink.append(STDERR_STREAM, &String::from_utf8_lossy(&buf[..n])),
            Err(e) => {
                debug!("stderr copy ended: {e}");
                break;
            }
        }
    }
}

#[cfg(unix)]
fn signal_status(exit: &std::process::ExitStatus) -> Status {
    use std::os::unix::process::ExitStatusExt;
    match exit.signal() {
        Some(signal) => Status::error(format!("process terminated by signal {signal}")),
        None => Status::error("process terminated abnormally"),
    }
}

#[cfg(not(unix))]
fn signal_status(_exit: &std::process::ExitStatus) -> Status {
    Status::error("process terminated abnormally")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rth_common::StatusKind;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn sh(script: &str) -> Vec<String> {
        vec!["/bin/sh".into(), "-c".into(), script.into()]
    }

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_empty_argv_is_a_spawn_error() {
        let sink = ActionSink::new();
        let command = ProcessCommand::new(Vec::new(), HashMap::new(), ".");
        let err = command.run(&sink).await.expect_err("must not spawn");
        assert!(matches!(err, CommandError::Spawn(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_zero_passes_and_output_is_captured() {
        let sink = ActionSink::new();
        let command = ProcessCommand::new(sh("echo hello; echo oops >&2"), HashMap::new(), ".");
        let status = command.run(&sink).await.expect("run");
        assert_eq!(status.kind, StatusKind::Passed);
        assert!(sink.stream(STDOUT_STREAM).unwrap_or_default().contains("hello"));
        assert!(sink.stream(STDERR_STREAM).unwrap_or_default().contains("oops"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_fails_with_raw_code() {
        let sink = ActionSink::new();
        let command = ProcessCommand::new(sh("exit 3"), HashMap::new(), ".");
        let status = command.run(&sink).await.expect("run");
        assert_eq!(status.kind, StatusKind::Failed);
        assert!(status.reason.contains('3'), "{}", status.reason);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_environment_is_replaced_not_merged() {
        let sink = ActionSink::new();
        let command = ProcessCommand::new(
            sh("echo \"V=$V\"; echo \"H=$HOME\""),
            env(&[("V", "alpha")]),
            ".",
        );
        let status = command.run(&sink).await.expect("run");
        assert_eq!(status.kind, StatusKind::Passed);
        let out = sink.stream(STDOUT_STREAM).unwrap_or_default();
        assert!(out.contains("V=alpha"), "{out}");
        assert!(out.contains("H=\n"), "inherited HOME must be gone: {out}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_runs_in_requested_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let expected = dir.path().canonicalize().expect("canonicalize");
        let sink = ActionSink::new();
        let command = ProcessCommand::new(sh("pwd"), HashMap::new(), dir.path());
        command.run(&sink).await.expect("run");
        let out = sink.stream(STDOUT_STREAM).unwrap_or_default();
        assert_eq!(out.trim(), expected.to_string_lossy());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_status_line_overrides_exit_code_when_consistent() {
        let sink = ActionSink::new();
        let command = ProcessCommand::new(
            sh("echo 'RTH-STATUS:failed compilation failed unexpectedly'; exit 96"),
            HashMap::new(),
            ".",
        );
        let status = command.run(&sink).await.expect("run");
        assert_eq!(status.kind, StatusKind::Failed);
        assert_eq!(status.reason, "compilation failed unexpectedly");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_status_line_exit_mismatch_is_an_integrity_error() {
        let sink = ActionSink::new();
        let command = ProcessCommand::new(
            sh("echo 'RTH-STATUS:passed all good'; exit 1"),
            HashMap::new(),
            ".",
        );
        let status = command.run(&sink).await.expect("run");
        assert_eq!(status.kind, StatusKind::Error);
        assert!(status.reason.contains("does not match"), "{}", status.reason);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_map_translates_codes() {
        let map = ExitMap::new(Status::error("tool crashed"))
            .with(7, Status::passed("expected exit"));
        let sink = ActionSink::new();
        let command =
            ProcessCommand::new(sh("exit 7"), HashMap::new(), ".").with_exit_map(map);
        let status = command.run(&sink).await.expect("run");
        assert_eq!(status.kind, StatusKind::Passed);
        assert_eq!(status.reason, "expected exit");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_map_default_is_augmented_with_raw_code() {
        let map = ExitMap::new(Status::error("tool crashed"));
        let sink = ActionSink::new();
        let command =
            ProcessCommand::new(sh("exit 41"), HashMap::new(), ".").with_exit_map(map);
        let status = command.run(&sink).await.expect("run");
        assert_eq!(status.kind, StatusKind::Error);
        assert!(status.reason.contains("tool crashed"), "{}", status.reason);
        assert!(status.reason.contains("41"), "{}", status.reason);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_and_reports_after_handler_runs() {
        struct Recorder(AtomicBool);
        impl TimeoutHandler for Recorder {
            fn budget(&self) -> Duration {
                Duration::from_secs(1)
            }
            fn handle_timeout(&self, _pid: Option<u32>) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let handler = Arc::new(Recorder(AtomicBool::new(false)));
        let sink = ActionSink::new();
        let command = ProcessCommand::new(sh("exec sleep 30"), HashMap::new(), ".")
            .with_timeout(Duration::from_millis(200), handler.clone());
        let started = Instant::now();
        let status = command.run(&sink).await.expect("run");
        assert_eq!(status.kind, StatusKind::Error);
        assert!(status.reason.contains("timed out"), "{}", status.reason);
        assert!(status.reason.contains("completed: true"), "{}", status.reason);
        assert!(handler.0.load(Ordering::SeqCst), "handler must run first");
        assert!(
            started.elapsed() < Duration::from_secs(20),
            "timeout must cut the sleep short"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_fast_exit_cancels_the_alarm() {
        let handler = Arc::new(crate::alarm::TraceTimeoutHandler);
        let sink = ActionSink::new();
        let command = ProcessCommand::new(sh("exit 0"), HashMap::new(), ".")
            .with_timeout(Duration::from_secs(30), handler);
        let status = command.run(&sink).await.expect("run");
        assert_eq!(status.kind, StatusKind::Passed);
    }
}
