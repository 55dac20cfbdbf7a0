//! Runner module owning the single test-framework process.
//!
//! Key responsibilities:
//! - Allow at most one framework process at a time (`Idle` -> `Running` -> `Idle`)
//! - Stream stdout line by line, turning `PASSED:`/`FAILED:` lines into live events
//! - Resolve the pending output as soon as the summary line arrives
//! - Emit `run finished` exactly once per process, on exit or kill

use explorer_core::extract::SUMMARY_READY_MARKER;
use explorer_core::{Config, ExecutionStateEvent, TestState};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader, Lines};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::sink::SharedSink;

/// Output handed back when the process exits without a summary.
pub const EMPTY_OUTPUT: &str = "{}";

/// Formatter class loaded from `formatter_path`.
pub const FORMATTER_CLASS: &str = "CustomFormatter";

const PASSED_PREFIX: &str = "PASSED: ";
const FAILED_PREFIX: &str = "FAILED: ";

/// How long to keep reading stdout and stderr once the process has exited.
///
/// Background children (preloaders, `cmd &`) inherit the pipes and can hold
/// them open long after the test process is gone.
const PIPE_DRAIN_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("a test process is already running")]
    AlreadyRunning,
    #[error("test process was killed")]
    Killed,
}

pub type Result<T> = std::result::Result<T, RunnerError>;

/// One line of framework stdout, classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputLine<'a> {
    Passed(&'a str),
    Failed(&'a str),
    JsonReady,
    Other,
}

pub fn classify_line(line: &str) -> OutputLine<'_> {
    if let Some(id) = line.strip_prefix(PASSED_PREFIX) {
        OutputLine::Passed(id.trim_end())
    } else if let Some(id) = line.strip_prefix(FAILED_PREFIX) {
        OutputLine::Failed(id.trim_end())
    } else if line.contains(SUMMARY_READY_MARKER) {
        OutputLine::JsonReady
    } else {
        OutputLine::Other
    }
}

/// A shell command line and the directory to run it in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub command_line: String,
    pub cwd: PathBuf,
}

impl Invocation {
    pub fn new(command_line: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            command_line: command_line.into(),
            cwd: cwd.into(),
        }
    }

    /// `test_command`, the formatter options when configured, then `args`.
    pub fn from_config<I, S>(config: &Config, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut command_line = config.test_command.clone();
        if let Some(formatter) = &config.formatter_path {
            command_line.push_str(" --require ");
            command_line.push_str(&shell_quote(&formatter.to_string_lossy()));
            command_line.push_str(" --format ");
            command_line.push_str(FORMATTER_CLASS);
        }
        for arg in args {
            command_line.push(' ');
            command_line.push_str(&shell_quote(arg.as_ref()));
        }
        Self::new(command_line, config.project_root.clone())
    }

    fn command(&self) -> Command {
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&self.command_line)
            .current_dir(&self.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

/// Quote an argument for `sh` unless it is made of safe characters.
pub fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@%+,".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Idle,
    Running,
}

/// Output of a started process, available once the summary line arrives
/// or the process exits.
#[derive(Debug)]
pub struct PendingOutput {
    rx: oneshot::Receiver<String>,
}

impl PendingOutput {
    pub async fn output(self) -> String {
        self.rx.await.unwrap_or_else(|_| EMPTY_OUTPUT.to_string())
    }
}

struct Inner {
    events: SharedSink,
    slot: Mutex<Option<CancellationToken>>,
    state: watch::Sender<RunnerState>,
}

impl Inner {
    fn lock_slot(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self) {
        *self.lock_slot() = None;
        self.state.send_replace(RunnerState::Idle);
    }
}

/// Owner of the single process slot.
#[derive(Clone)]
pub struct ProcessRunner {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ProcessRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessRunner")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ProcessRunner {
    pub fn new(events: SharedSink) -> Self {
        let (state, _) = watch::channel(RunnerState::Idle);
        Self {
            inner: Arc::new(Inner {
                events,
                slot: Mutex::new(None),
                state,
            }),
        }
    }

    pub fn state(&self) -> RunnerState {
        *self.inner.state.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.state() == RunnerState::Running
    }

    fn claim(&self) -> Result<CancellationToken> {
        let mut slot = self.inner.lock_slot();
        if slot.is_some() {
            return Err(RunnerError::AlreadyRunning);
        }
        let token = CancellationToken::new();
        *slot = Some(token.clone());
        self.inner.state.send_replace(RunnerState::Running);
        Ok(token)
    }

    /// Start a streamed run.
    ///
    /// Fails only if another process holds the slot. A spawn failure is
    /// reported like an immediate exit: `run finished` is emitted and the
    /// output resolves to `{}`.
    pub fn start(&self, invocation: &Invocation) -> Result<PendingOutput> {
        let cancel = self.claim()?;
        let (tx, rx) = oneshot::channel();

        debug!(
            command = %invocation.command_line,
            cwd = %invocation.cwd.display(),
            "spawning test process"
        );

        match invocation.command().spawn() {
            Ok(child) => {
                tokio::spawn(drive(Arc::clone(&self.inner), child, cancel, tx));
            }
            Err(err) => {
                warn!(
                    command = %invocation.command_line,
                    error = %err,
                    "failed to spawn test process"
                );
                self.inner.events.emit(ExecutionStateEvent::finished());
                self.inner.release();
                let _ = tx.send(EMPTY_OUTPUT.to_string());
            }
        }

        Ok(PendingOutput { rx })
    }

    /// Run to completion and return all of stdout.
    ///
    /// Used for discovery; holds the same slot as [`ProcessRunner::start`].
    /// Emits nothing unless killed, in which case `run finished` is sent.
    pub async fn capture(&self, invocation: &Invocation) -> Result<String> {
        let cancel = self.claim()?;
        let result = capture_output(invocation, &cancel).await;
        if matches!(result, Err(RunnerError::Killed)) {
            info!("capture process killed");
            self.inner.events.emit(ExecutionStateEvent::finished());
        }
        self.inner.release();

        let output = result?;
        if !output.status.success() {
            debug!(
                exit_code = output.status.code().unwrap_or(-1),
                "capture process exited unsuccessfully"
            );
        }
        if !output.stderr.is_empty() {
            debug!(stderr = %String::from_utf8_lossy(&output.stderr), "capture process stderr");
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Terminate the running process, if any, and wait until the slot is free.
    pub async fn kill(&self) {
        let token = self.inner.lock_slot().clone();
        let Some(token) = token else {
            debug!("kill requested while idle");
            return;
        };
        info!("killing test process");
        token.cancel();
        self.wait_idle().await;
    }

    /// Wait until no process holds the slot.
    pub async fn wait_idle(&self) {
        let mut rx = self.inner.state.subscribe();
        let _ = rx.wait_for(|state| *state == RunnerState::Idle).await;
    }
}

async fn capture_output(
    invocation: &Invocation,
    cancel: &CancellationToken,
) -> Result<std::process::Output> {
    let child = invocation.command().spawn()?;
    tokio::select! {
        output = child.wait_with_output() => Ok(output?),
        () = cancel.cancelled() => Err(RunnerError::Killed),
    }
}

/// Stream one process to its end.
///
/// The process exiting ends the run even if a background child still holds
/// stdout; whatever is already buffered is read for a short grace period.
async fn drive(
    inner: Arc<Inner>,
    mut child: Child,
    cancel: CancellationToken,
    tx: oneshot::Sender<String>,
) {
    let mut pending = Some(tx);
    let mut stderr_task = child.stderr.take().map(|stderr| tokio::spawn(drain(stderr)));
    let mut lines = child.stdout.take().map(|stdout| BufReader::new(stdout).lines());

    let killed = loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break true,
            line = next_line(&mut lines) => match line {
                Ok(Some(line)) => handle_line(&inner, &line, &mut pending),
                Ok(None) => lines = None,
                Err(err) => {
                    warn!(error = %err, "failed to read test output");
                    lines = None;
                }
            },
            status = child.wait() => {
                match status {
                    Ok(status) => debug!(exit_code = status.code().unwrap_or(-1), "test process exited"),
                    Err(err) => warn!(error = %err, "failed to wait for test process"),
                }
                break false;
            }
        }
    };

    if killed {
        if let Err(err) = child.kill().await {
            warn!(error = %err, "failed to kill test process");
        }
        info!("test process killed");
        if let Some(task) = stderr_task.take() {
            task.abort();
        }
    } else {
        let deadline = Instant::now() + PIPE_DRAIN_TIMEOUT;
        if let Some(mut lines) = lines.take() {
            loop {
                match timeout_at(deadline, lines.next_line()).await {
                    Ok(Ok(Some(line))) => handle_line(&inner, &line, &mut pending),
                    Ok(Ok(None)) => break,
                    Ok(Err(err)) => {
                        warn!(error = %err, "failed to read test output");
                        break;
                    }
                    Err(_) => {
                        debug!("stdout still open after exit, leaving it to background children");
                        break;
                    }
                }
            }
        }
        if let Some(mut task) = stderr_task.take() {
            match timeout_at(deadline, &mut task).await {
                Ok(Ok(stderr)) if !stderr.is_empty() => {
                    debug!(stderr = %stderr, "test process stderr");
                }
                Ok(Ok(_)) => {}
                Ok(Err(err)) => warn!(error = %err, "stderr task panicked"),
                Err(_) => {
                    task.abort();
                    debug!("stderr still open after exit");
                }
            }
        }
    }

    // Emit before releasing so anyone waiting for idle has seen the event.
    inner.events.emit(ExecutionStateEvent::finished());
    inner.release();
    if let Some(tx) = pending.take() {
        let _ = tx.send(EMPTY_OUTPUT.to_string());
    }
}

/// Next stdout line, or never once stdout is closed.
async fn next_line<R: AsyncBufRead + Unpin>(
    lines: &mut Option<Lines<R>>,
) -> std::io::Result<Option<String>> {
    match lines {
        Some(lines) => lines.next_line().await,
        None => std::future::pending().await,
    }
}

/// Emit progress events and resolve the pending output with the summary
/// line, which carries the whole JSON payload.
fn handle_line(inner: &Inner, line: &str, pending: &mut Option<oneshot::Sender<String>>) {
    match classify_line(line) {
        OutputLine::Passed(id) => inner
            .events
            .emit(ExecutionStateEvent::test(id, TestState::Passed)),
        OutputLine::Failed(id) => inner
            .events
            .emit(ExecutionStateEvent::test(id, TestState::Failed)),
        OutputLine::JsonReady => {
            if let Some(tx) = pending.take() {
                debug!(line_bytes = line.len(), "summary received");
                let _ = tx.send(line.to_string());
            }
        }
        OutputLine::Other => trace!("unclassified output line"),
    }
}

async fn drain<R: AsyncRead + Unpin>(mut reader: R) -> String {
    let mut buf = Vec::new();
    if let Err(err) = reader.read_to_end(&mut buf).await {
        debug!(error = %err, "stderr read failed");
    }
    String::from_utf8_lossy(&buf).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::RecordingSink;
    use tempfile::TempDir;

    fn runner() -> (ProcessRunner, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::new());
        (ProcessRunner::new(sink.clone()), sink)
    }

    fn finished_count(sink: &RecordingSink) -> usize {
        sink.events()
            .iter()
            .filter(|event| **event == ExecutionStateEvent::finished())
            .count()
    }

    #[test]
    fn classify_line_recognizes_progress_and_summary() {
        assert_eq!(
            classify_line("PASSED: ./spec/a_spec.rb[1:1]"),
            OutputLine::Passed("./spec/a_spec.rb[1:1]")
        );
        assert_eq!(
            classify_line("FAILED: ./spec/a_spec.rb[1:2]\r"),
            OutputLine::Failed("./spec/a_spec.rb[1:2]")
        );
        assert_eq!(
            classify_line("noise START_OF_RSPEC_JSON more"),
            OutputLine::JsonReady
        );
        assert_eq!(classify_line("Coverage report generated"), OutputLine::Other);
        assert_eq!(classify_line("  PASSED: indented"), OutputLine::Other);
    }

    #[test]
    fn shell_quote_wraps_unsafe_arguments() {
        assert_eq!(shell_quote("./spec/a_spec.rb:12"), "./spec/a_spec.rb:12");
        assert_eq!(shell_quote("my dir/a_spec.rb"), "'my dir/a_spec.rb'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("a_spec.rb[1:1]"), "'a_spec.rb[1:1]'");
    }

    #[test]
    fn invocation_appends_formatter_and_args() {
        let config = Config {
            test_command: "bin/rspec".to_string(),
            formatter_path: Some(PathBuf::from("/opt/formatter.rb")),
            project_root: PathBuf::from("/proj"),
            ..Config::default()
        };
        let invocation = Invocation::from_config(&config, ["./spec/a_spec.rb"]);
        assert_eq!(
            invocation.command_line,
            "bin/rspec --require /opt/formatter.rb --format CustomFormatter ./spec/a_spec.rb"
        );
        assert_eq!(invocation.cwd, PathBuf::from("/proj"));
    }

    #[test]
    fn invocation_without_formatter_or_args() {
        let invocation = Invocation::from_config(&Config::default(), Vec::<String>::new());
        assert_eq!(invocation.command_line, "bundle exec rspec");
    }

    #[tokio::test]
    async fn progress_lines_emit_events_and_summary_resolves_output() {
        let dir = TempDir::new().unwrap();
        let (runner, sink) = runner();
        let script = r#"echo "PASSED: a[1:1]"; echo "FAILED: a[1:2]"; echo 'START_OF_RSPEC_JSON START_OF_TEST_JSON{"examples":[]}END_OF_TEST_JSON'"#;

        let pending = runner.start(&Invocation::new(script, dir.path())).unwrap();
        let output = pending.output().await;
        runner.wait_idle().await;

        assert_eq!(
            output,
            r#"START_OF_RSPEC_JSON START_OF_TEST_JSON{"examples":[]}END_OF_TEST_JSON"#
        );
        assert_eq!(
            sink.events(),
            vec![
                ExecutionStateEvent::test("a[1:1]", TestState::Passed),
                ExecutionStateEvent::test("a[1:2]", TestState::Failed),
                ExecutionStateEvent::finished(),
            ]
        );
        assert_eq!(runner.state(), RunnerState::Idle);
    }

    #[tokio::test]
    async fn earlier_marker_noise_is_not_part_of_output() {
        let dir = TempDir::new().unwrap();
        let (runner, _sink) = runner();
        let script = r#"echo 'warning: START_OF_TEST_JSON{ seen in a log line'; echo 'START_OF_RSPEC_JSON START_OF_TEST_JSON{"examples":[{"id":"a[1:1]","status":"passed"}]}END_OF_TEST_JSON'"#;

        let pending = runner.start(&Invocation::new(script, dir.path())).unwrap();
        let output = pending.output().await;
        runner.wait_idle().await;

        assert!(!output.contains("warning"));
        assert_eq!(
            explorer_core::extract::extract_json(&output),
            Some(r#"{"examples":[{"id":"a[1:1]","status":"passed"}]}"#)
        );
    }

    #[tokio::test]
    async fn background_child_holding_stdout_does_not_delay_finish() {
        let dir = TempDir::new().unwrap();
        let (runner, sink) = runner();

        let started = std::time::Instant::now();
        let pending = runner
            .start(&Invocation::new(
                "sleep 3 & echo 'PASSED: a[1:1]'; exit 0",
                dir.path(),
            ))
            .unwrap();
        assert_eq!(pending.output().await, EMPTY_OUTPUT);
        runner.wait_idle().await;

        assert!(
            started.elapsed() < Duration::from_secs(2),
            "finish took {:?}",
            started.elapsed()
        );
        assert_eq!(
            sink.events(),
            vec![
                ExecutionStateEvent::test("a[1:1]", TestState::Passed),
                ExecutionStateEvent::finished(),
            ]
        );
        assert_eq!(runner.state(), RunnerState::Idle);
    }

    #[tokio::test]
    async fn exit_without_summary_resolves_empty_output() {
        let dir = TempDir::new().unwrap();
        let (runner, sink) = runner();

        let pending = runner
            .start(&Invocation::new("echo 'PASSED: ./spec/a_spec.rb[1:1]'", dir.path()))
            .unwrap();
        assert_eq!(pending.output().await, EMPTY_OUTPUT);
        runner.wait_idle().await;

        assert_eq!(finished_count(&sink), 1);
        assert_eq!(
            sink.events()[0],
            ExecutionStateEvent::test("./spec/a_spec.rb[1:1]", TestState::Passed)
        );
    }

    #[tokio::test]
    async fn nonzero_exit_still_finishes() {
        let dir = TempDir::new().unwrap();
        let (runner, sink) = runner();

        let pending = runner.start(&Invocation::new("exit 3", dir.path())).unwrap();
        assert_eq!(pending.output().await, EMPTY_OUTPUT);
        runner.wait_idle().await;
        assert_eq!(finished_count(&sink), 1);
    }

    #[tokio::test]
    async fn second_start_is_rejected_while_running() {
        let dir = TempDir::new().unwrap();
        let (runner, _sink) = runner();

        let pending = runner.start(&Invocation::new("sleep 10", dir.path())).unwrap();
        assert!(runner.is_running());
        let second = runner.start(&Invocation::new("true", dir.path()));
        assert!(matches!(second, Err(RunnerError::AlreadyRunning)));

        runner.kill().await;
        assert_eq!(pending.output().await, EMPTY_OUTPUT);
    }

    #[tokio::test]
    async fn kill_while_idle_is_a_noop() {
        let (runner, sink) = runner();
        runner.kill().await;
        assert_eq!(runner.state(), RunnerState::Idle);
        assert!(sink.events().is_empty());
    }

    #[tokio::test]
    async fn kill_while_running_finishes_exactly_once() {
        let dir = TempDir::new().unwrap();
        let (runner, sink) = runner();

        let pending = runner
            .start(&Invocation::new("echo 'PASSED: a[1:1]'; sleep 10", dir.path()))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        runner.kill().await;

        assert_eq!(runner.state(), RunnerState::Idle);
        assert_eq!(pending.output().await, EMPTY_OUTPUT);
        assert_eq!(finished_count(&sink), 1);

        // Slot is free again.
        let pending = runner.start(&Invocation::new("true", dir.path())).unwrap();
        pending.output().await;
        runner.wait_idle().await;
        assert_eq!(finished_count(&sink), 2);
    }

    #[tokio::test]
    async fn spawn_failure_finishes_and_frees_slot() {
        let (runner, sink) = runner();
        let invocation = Invocation::new("true", "/nonexistent/dir/for/test");

        let pending = runner.start(&invocation).unwrap();
        assert_eq!(pending.output().await, EMPTY_OUTPUT);
        assert_eq!(runner.state(), RunnerState::Idle);
        assert_eq!(sink.events(), vec![ExecutionStateEvent::finished()]);
    }

    #[tokio::test]
    async fn capture_returns_stdout_without_events() {
        let dir = TempDir::new().unwrap();
        let (runner, sink) = runner();

        let output = runner
            .capture(&Invocation::new("echo one; echo two >&2; echo three", dir.path()))
            .await
            .unwrap();
        assert_eq!(output, "one\nthree\n");
        assert!(sink.events().is_empty());
        assert_eq!(runner.state(), RunnerState::Idle);
    }

    #[tokio::test]
    async fn capture_can_be_killed() {
        let dir = TempDir::new().unwrap();
        let (runner, sink) = runner();

        let capture_runner = runner.clone();
        let cwd = dir.path().to_path_buf();
        let task = tokio::spawn(async move {
            capture_runner
                .capture(&Invocation::new("sleep 10", cwd))
                .await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(runner.is_running());
        runner.kill().await;

        let result = task.await.unwrap();
        assert!(matches!(result, Err(RunnerError::Killed)));
        assert_eq!(runner.state(), RunnerState::Idle);
        assert_eq!(sink.events(), vec![ExecutionStateEvent::finished()]);
    }
}
