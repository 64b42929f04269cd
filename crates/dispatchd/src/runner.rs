//! Runner module for executing the `modal` CLI.
//!
//! Two entry points:
//! - [`Runner::run`] waits for the process and returns its combined output.
//! - [`Runner::spawn`] returns immediately and streams output line by line to
//!   a [`LineSink`] and the event bus, finishing with one completion event.
//!
//! Asynchronous invocations are registered in the [`ProcessRegistry`] while
//! their child is alive and can be cancelled by id.

use dispatch_core::{Config, ExecutionState, Id, Invocation, RunResult, UiEvent};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::Child;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::command::CommandBuilder;
use crate::events::{EventBus, LineSink};
use crate::recorder::Recorder;
use crate::registry::ProcessRegistry;

/// Interval between heartbeat log messages while a process is running.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Timeout for draining stdout/stderr after the process exits or is killed.
///
/// A grandchild holding the pipes open must not hang the runner.
const IO_CAPTURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Pending lines or chunks buffered between the pipe readers and the runner.
const CHANNEL_CAPACITY: usize = 256;

/// How long to wait for a pipe reader to report once output is drained.
const READER_JOIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Line delivered to the sink and the UI when a user cancels an invocation.
pub const CANCELLED_NOTICE: &str = "command cancelled by user";

/// How the process wait loop terminated.
#[derive(Debug)]
enum ProcessOutcome {
    Completed(std::process::ExitStatus),
    WaitFailed(std::io::Error),
    TimedOut,
    Cancelled,
}

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("modal CLI not found: {0}")]
    CliNotFound(String),
    #[error("working directory does not exist: {0}")]
    WorkingDirMissing(String),
    #[error("failed to start process: {0}")]
    Spawn(std::io::Error),
    #[error("process failed with exit code {0}")]
    ExitCode(i32),
    #[error("process terminated by signal")]
    Signaled,
    #[error("timeout after {0} seconds")]
    Timeout(u32),
    #[error("process killed")]
    Killed,
}

pub type Result<T> = std::result::Result<T, RunnerError>;

/// Runner configuration.
#[derive(Debug, Clone, Default)]
pub struct RunnerConfig {
    /// Timeout for synchronous runs in seconds (0 = no timeout).
    pub timeout_sec: u32,
}

impl RunnerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            timeout_sec: config.run_timeout_sec,
        }
    }
}

/// Handle to an asynchronous invocation.
#[derive(Debug)]
pub struct ExecutionHandle {
    pub id: Id,
    state: watch::Receiver<ExecutionState>,
    join: JoinHandle<RunResult>,
}

impl ExecutionHandle {
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Current lifecycle state. Terminal once the registry slot is cleared.
    pub fn state(&self) -> ExecutionState {
        *self.state.borrow()
    }

    /// Wait for the terminal result.
    pub async fn wait(self) -> RunResult {
        join_result(self.join).await
    }

    /// Run `cleanup` once the invocation has terminated.
    pub fn on_terminated<F>(self, cleanup: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let Self { id, state, join } = self;
        let join = tokio::spawn(async move {
            let result = join_result(join).await;
            cleanup();
            result
        });
        Self { id, state, join }
    }
}

/// Cancel token and state channel of one registered invocation.
#[derive(Debug)]
struct Tracking {
    cancel: CancellationToken,
    state: watch::Sender<ExecutionState>,
}

async fn join_result(join: JoinHandle<RunResult>) -> RunResult {
    match join.await {
        Ok(result) => result,
        Err(err) => RunResult::failed(String::new(), format!("execution task failed: {err}")),
    }
}

/// Runner for the external CLI.
#[derive(Debug, Clone)]
pub struct Runner {
    builder: CommandBuilder,
    config: RunnerConfig,
    registry: Arc<ProcessRegistry>,
    events: EventBus,
    recorder: Option<Recorder>,
}

impl Runner {
    pub fn new(builder: CommandBuilder, config: RunnerConfig, events: EventBus) -> Self {
        Self {
            builder,
            config,
            registry: Arc::new(ProcessRegistry::new()),
            events,
            recorder: None,
        }
    }

    /// Finalize execution log entries through this recorder.
    pub fn with_recorder(mut self, recorder: Recorder) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn builder(&self) -> &CommandBuilder {
        &self.builder
    }

    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Run to completion and return the combined output.
    ///
    /// Bounded only by `RunnerConfig::timeout_sec`.
    pub async fn run(&self, invocation: Invocation) -> RunResult {
        self.run_with_cancel(invocation, CancellationToken::new())
            .await
    }

    /// Run to completion, killing the process if `cancel` fires first.
    pub async fn run_with_cancel(
        &self,
        invocation: Invocation,
        cancel: CancellationToken,
    ) -> RunResult {
        let id = Id::new();
        let command_line = self.builder.display(&invocation);
        info!(execution_id = %id, command = %command_line, "running command");
        self.events.publish(UiEvent::ExecutionStarted {
            execution_id: id.clone(),
            subcommand: invocation.subcommand.clone(),
        });

        let result = self.capture(&id, &invocation, &cancel).await;
        self.report(&id, &command_line, &result);
        result
    }

    /// Run to completion without publishing anything to the event bus.
    ///
    /// For housekeeping calls such as the version check.
    pub async fn run_silent(&self, invocation: Invocation) -> RunResult {
        let id = Id::new();
        let command_line = self.builder.display(&invocation);
        debug!(execution_id = %id, command = %command_line, "running command silently");
        let result = self
            .capture(&id, &invocation, &CancellationToken::new())
            .await;
        log_result(&id, &command_line, &result);
        result
    }

    /// Spawn, wait, and collect the combined output as raw bytes.
    async fn capture(
        &self,
        id: &Id,
        invocation: &Invocation,
        cancel: &CancellationToken,
    ) -> RunResult {
        let mut child = match self.start(invocation) {
            Ok(child) => child,
            Err(err) => return RunResult::failed(String::new(), err.to_string()),
        };

        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(CHANNEL_CAPACITY);
        let readers: Vec<_> = [
            child.stdout.take().map(|out| tokio::spawn(forward_chunks(out, tx.clone()))),
            child.stderr.take().map(|err| tokio::spawn(forward_chunks(err, tx.clone()))),
        ]
        .into_iter()
        .flatten()
        .collect();
        drop(tx);

        let mut output = Vec::new();
        let outcome = self
            .supervise(
                id,
                &mut child,
                &mut rx,
                cancel,
                self.config.timeout_sec,
                |chunk: Vec<u8>| output.extend_from_slice(&chunk),
            )
            .await;
        let pipe_error = collect_reader_errors(id, readers).await;

        let output = String::from_utf8_lossy(&output).into_owned();
        self.result_for(outcome, pipe_error, output)
    }

    /// Start an invocation without waiting for it.
    ///
    /// The child is spawned and registered before this returns, so a cancel
    /// issued right after sees it. Spawn failures are reported through the
    /// handle and the completion event; nothing is registered for them.
    pub async fn spawn(
        &self,
        invocation: Invocation,
        sink: Arc<dyn LineSink>,
        log_id: Option<Id>,
    ) -> ExecutionHandle {
        self.spawn_as(Id::new(), invocation, sink, log_id).await
    }

    /// [`Runner::spawn`] under a caller-chosen execution id.
    pub async fn spawn_as(
        &self,
        id: Id,
        invocation: Invocation,
        sink: Arc<dyn LineSink>,
        log_id: Option<Id>,
    ) -> ExecutionHandle {
        let command_line = self.builder.display(&invocation);
        info!(execution_id = %id, command = %command_line, log_id = ?log_id, "starting command");
        self.events.publish(UiEvent::ExecutionStarted {
            execution_id: id.clone(),
            subcommand: invocation.subcommand.clone(),
        });

        let child = match self.start(&invocation) {
            Ok(child) => child,
            Err(err) => {
                let message = err.to_string();
                sink.on_line(&id, &message);
                self.events.publish(UiEvent::OutputLine {
                    execution_id: id.clone(),
                    line: message.clone(),
                });
                let result = RunResult::failed(message.clone(), message);
                let (_, state) = watch::channel(ExecutionState::Failed);
                let runner = self.clone();
                let task_id = id.clone();
                let join = tokio::spawn(async move {
                    runner
                        .finish(&task_id, &command_line, log_id.as_ref(), &result)
                        .await;
                    result
                });
                return ExecutionHandle { id, state, join };
            }
        };

        let token = CancellationToken::new();
        self.registry.try_register(id.clone(), token.clone()).await;
        let (state_tx, state) = watch::channel(ExecutionState::Running);
        let tracking = Tracking {
            cancel: token,
            state: state_tx,
        };

        let runner = self.clone();
        let task_id = id.clone();
        let join = tokio::spawn(async move {
            runner
                .drive(task_id, command_line, child, tracking, sink, log_id)
                .await
        });
        ExecutionHandle { id, state, join }
    }

    /// Cancel one asynchronous invocation. False if it is not running.
    pub async fn cancel(&self, id: &Id) -> bool {
        let signalled = self.registry.signal(id).await;
        if signalled {
            warn!(execution_id = %id, "cancellation requested");
        } else {
            debug!(execution_id = %id, "nothing to cancel");
        }
        signalled
    }

    /// Cancel the most recently started invocation. False if none is running.
    pub async fn cancel_running(&self) -> bool {
        match self.registry.signal_latest().await {
            Some(id) => {
                warn!(execution_id = %id, "cancellation requested");
                true
            }
            None => {
                debug!("nothing to cancel");
                false
            }
        }
    }

    /// Build and spawn the child process.
    fn start(&self, invocation: &Invocation) -> Result<Child> {
        if let Some(dir) = self.builder.working_dir(invocation) {
            if !dir.is_dir() {
                return Err(RunnerError::WorkingDirMissing(dir.display().to_string()));
            }
        }

        self.builder
            .build(invocation)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_error(e, self.builder.binary()))
    }

    /// Body of an asynchronous invocation, from spawned child to terminal report.
    async fn drive(
        self,
        id: Id,
        command_line: String,
        mut child: Child,
        tracking: Tracking,
        sink: Arc<dyn LineSink>,
        log_id: Option<Id>,
    ) -> RunResult {
        let (tx, mut rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);
        let readers: Vec<_> = [
            child.stdout.take().map(|out| tokio::spawn(forward_lines(out, tx.clone()))),
            child.stderr.take().map(|err| tokio::spawn(forward_lines(err, tx.clone()))),
        ]
        .into_iter()
        .flatten()
        .collect();
        drop(tx);

        let mut output = String::new();
        let events = self.events.clone();
        let outcome = self
            .supervise(&id, &mut child, &mut rx, &tracking.cancel, 0, |line: String| {
                sink.on_line(&id, &line);
                output.push_str(&line);
                output.push('\n');
                events.publish(UiEvent::OutputLine {
                    execution_id: id.clone(),
                    line,
                });
            })
            .await;
        let pipe_error = collect_reader_errors(&id, readers).await;

        if matches!(outcome, ProcessOutcome::Cancelled) {
            sink.on_line(&id, CANCELLED_NOTICE);
            self.events.publish(UiEvent::OutputLine {
                execution_id: id.clone(),
                line: CANCELLED_NOTICE.to_string(),
            });
        }

        let result = self.result_for(outcome, pipe_error, output);

        // Cleared before anything observes the terminal result.
        self.registry.clear(&id).await;
        tracking.state.send_replace(ExecutionState::from(result.status));
        self.finish(&id, &command_line, log_id.as_ref(), &result).await;
        result
    }

    /// Wait for the child while feeding captured output to `on_item`.
    ///
    /// Kills the child on cancellation or when `timeout_sec` (if nonzero)
    /// elapses, then drains what the readers still have buffered.
    async fn supervise<T>(
        &self,
        id: &Id,
        child: &mut Child,
        rx: &mut mpsc::Receiver<T>,
        cancel: &CancellationToken,
        timeout_sec: u32,
        mut on_item: impl FnMut(T),
    ) -> ProcessOutcome {
        let started = Instant::now();
        let deadline =
            (timeout_sec > 0).then(|| started + Duration::from_secs(u64::from(timeout_sec)));
        let mut heartbeat =
            tokio::time::interval_at(started + HEARTBEAT_INTERVAL, HEARTBEAT_INTERVAL);
        let mut open = true;

        let outcome = loop {
            tokio::select! {
                item = rx.recv(), if open => match item {
                    Some(item) => on_item(item),
                    None => open = false,
                },
                result = child.wait() => {
                    break match result {
                        Ok(status) => ProcessOutcome::Completed(status),
                        Err(err) => ProcessOutcome::WaitFailed(err),
                    };
                }
                () = cancel.cancelled() => {
                    info!(execution_id = %id, "cancellation requested; killing process");
                    kill_child(id, child).await;
                    break ProcessOutcome::Cancelled;
                }
                () = sleep_until_deadline(deadline) => {
                    warn!(execution_id = %id, timeout_sec, "process timed out; killing");
                    kill_child(id, child).await;
                    break ProcessOutcome::TimedOut;
                }
                _ = heartbeat.tick() => {
                    info!(
                        execution_id = %id,
                        elapsed_sec = started.elapsed().as_secs(),
                        "modal still running"
                    );
                }
            }
        };

        if open {
            let drained = timeout(IO_CAPTURE_TIMEOUT, async {
                while let Some(item) = rx.recv().await {
                    on_item(item);
                }
            })
            .await;
            if drained.is_err() {
                warn!(execution_id = %id, "output capture timed out");
            }
        }

        outcome
    }

    fn result_for(
        &self,
        outcome: ProcessOutcome,
        pipe_error: Option<std::io::Error>,
        output: String,
    ) -> RunResult {
        match outcome {
            ProcessOutcome::Cancelled => RunResult::killed(output, RunnerError::Killed.to_string()),
            ProcessOutcome::TimedOut => RunResult::killed(
                output,
                RunnerError::Timeout(self.config.timeout_sec).to_string(),
            ),
            ProcessOutcome::WaitFailed(err) => {
                RunResult::failed(output, RunnerError::Io(err).to_string())
            }
            ProcessOutcome::Completed(status) => match (status.code(), pipe_error) {
                (Some(0), None) => RunResult::completed(output),
                (Some(0), Some(err)) => RunResult::failed(output, RunnerError::Io(err).to_string()),
                (Some(code), _) => RunResult::failed(output, RunnerError::ExitCode(code).to_string()),
                (None, _) => RunResult::failed(output, RunnerError::Signaled.to_string()),
            },
        }
    }

    /// Log the terminal result of a synchronous run and publish it.
    fn report(&self, id: &Id, command_line: &str, result: &RunResult) {
        log_result(id, command_line, result);
        self.events.publish(UiEvent::ExecutionCompleted {
            execution_id: id.clone(),
            result: result.clone(),
        });
    }

    /// Finalize the log entry (if any) and publish the completion event.
    async fn finish(&self, id: &Id, command_line: &str, log_id: Option<&Id>, result: &RunResult) {
        log_result(id, command_line, result);

        if let (Some(recorder), Some(log_id)) = (&self.recorder, log_id) {
            if let Err(err) = recorder
                .update(log_id, result.log_status(), &result.output)
                .await
            {
                warn!(execution_id = %id, log_id = %log_id, error = %err, "failed to update execution log");
            }
        }

        self.events.publish(UiEvent::ExecutionCompleted {
            execution_id: id.clone(),
            result: result.clone(),
        });
    }
}

fn log_result(id: &Id, command_line: &str, result: &RunResult) {
    if result.succeeded {
        info!(
            execution_id = %id,
            command = %command_line,
            output_bytes = result.output.len(),
            "command succeeded"
        );
    } else {
        warn!(
            execution_id = %id,
            command = %command_line,
            status = result.status.as_str(),
            error = result.error.as_deref().unwrap_or(""),
            output_bytes = result.output.len(),
            "command failed"
        );
    }
}

fn spawn_error(err: std::io::Error, binary: &Path) -> RunnerError {
    if err.kind() == std::io::ErrorKind::NotFound {
        RunnerError::CliNotFound(binary.display().to_string())
    } else {
        RunnerError::Spawn(err)
    }
}

async fn kill_child(id: &Id, child: &mut Child) {
    if let Err(err) = child.kill().await {
        warn!(execution_id = %id, error = %err, "failed to kill process");
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Forward raw chunks until EOF or until the receiver goes away.
async fn forward_chunks<R: AsyncRead + Unpin>(
    mut reader: R,
    tx: mpsc::Sender<Vec<u8>>,
) -> std::io::Result<()> {
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        if tx.send(chunk[..n].to_vec()).await.is_err() {
            break;
        }
    }
    Ok(())
}

/// Forward newline-delimited lines with no length limit.
///
/// A trailing `\r` is stripped and invalid UTF-8 is replaced. A final line
/// without a newline is still delivered.
async fn forward_lines<R: AsyncRead + Unpin>(
    reader: R,
    tx: mpsc::Sender<String>,
) -> std::io::Result<()> {
    let mut segments = BufReader::new(reader).split(b'\n');
    while let Some(mut bytes) = segments.next_segment().await? {
        if bytes.last() == Some(&b'\r') {
            bytes.pop();
        }
        let line = String::from_utf8_lossy(&bytes).into_owned();
        if tx.send(line).await.is_err() {
            break;
        }
    }
    Ok(())
}

/// First I/O error reported by a pipe reader.
///
/// Each reader gets [`READER_JOIN_TIMEOUT`] to report; one still blocked
/// after that (a grandchild holding the pipe) is aborted.
async fn collect_reader_errors(
    id: &Id,
    readers: Vec<JoinHandle<std::io::Result<()>>>,
) -> Option<std::io::Error> {
    let mut first = None;
    for mut reader in readers {
        match timeout(READER_JOIN_TIMEOUT, &mut reader).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(err))) => {
                warn!(execution_id = %id, error = %err, "output pipe failed");
                first.get_or_insert(err);
            }
            Ok(Err(err)) => {
                warn!(execution_id = %id, error = %err, "output reader task panicked");
            }
            Err(_) => {
                debug!(execution_id = %id, "output reader still blocked; aborting");
                reader.abort();
            }
        }
    }
    first
}
