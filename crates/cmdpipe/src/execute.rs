//! Run-to-completion facade over [`PipelineBuilder`].
//!
//! [`Cmdline`] launches a pipeline, optionally enforces a timeout through
//! the background supervisor, waits for every stage and every handler, and
//! returns an [`ExecutionResult`] carrying an [`ExecutionInfo`] report. When
//! no stderr handler is set, stderr is summarised into a bounded snapshot
//! that ends up in the report.

use std::ffi::OsString;
use std::fmt;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::{Duration, Instant, SystemTime};

use cmdpipe_core::config::SnapshotConfig;
use cmdpipe_core::{Config, EnvVar, env};
use tracing::{info, warn};

use crate::capture;
use crate::cell::CompletionCell;
use crate::command::CommandSpec;
use crate::error::{Error, TaskError};
use crate::executor::TaskExecutor;
use crate::launcher::PipelineBuilder;
use crate::pipeline::Pipeline;
use crate::processor::{ReadProcessor, StreamProcessor, WriteProcessor};
use crate::stage::{self, Stage};
use crate::stdio::Slot;

/// What happens to the pipeline's stderr.
enum StderrMode<E> {
    Snapshot,
    Handler(ReadProcessor<E>),
    Inherit,
}

/// One pipeline run, configured builder-style.
///
/// `O` and `E` are the result types of the stdout and stderr handlers.
pub struct Cmdline<O = (), E = ()> {
    builder: PipelineBuilder,
    timeout: Option<Duration>,
    stdin: Option<WriteProcessor<()>>,
    stdout: Option<ReadProcessor<O>>,
    stderr: StderrMode<E>,
    snapshot: SnapshotConfig,
}

impl Cmdline {
    /// A single-stage command line. Add more stages with [`pipe`](Self::pipe).
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            builder: PipelineBuilder::new().cmdline(argv),
            timeout: None,
            stdin: None,
            stdout: None,
            stderr: StderrMode::Snapshot,
            snapshot: SnapshotConfig::default(),
        }
    }
}

impl<O, E> Cmdline<O, E>
where
    O: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    #[must_use]
    pub fn pipe<I, S>(mut self, argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.builder = self.builder.pipe(argv);
        self
    }

    /// Apply lifecycle and snapshot settings from `config`.
    #[must_use]
    pub fn configure(mut self, config: &Config) -> Self {
        self.builder = self
            .builder
            .auto_grant_executable(config.lifecycle.auto_grant_executable)
            .kill_grace(config.lifecycle.kill_grace());
        self.snapshot = config.snapshot;
        self
    }

    #[must_use]
    pub fn env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.builder = self.builder.env(name, value);
        self
    }

    #[must_use]
    pub fn secret_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.builder = self.builder.secret_env(name, value);
        self
    }

    #[must_use]
    pub fn env_remove(mut self, name: impl Into<String>) -> Self {
        self.builder = self.builder.env_remove(name);
        self
    }

    #[must_use]
    pub fn env_var(mut self, var: EnvVar) -> Self {
        self.builder = self.builder.env_var(var);
        self
    }

    #[must_use]
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.builder = self.builder.working_dir(dir);
        self
    }

    /// Kill the pipeline if it runs longer than `timeout`.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn auto_grant_executable(mut self, enabled: bool) -> Self {
        self.builder = self.builder.auto_grant_executable(enabled);
        self
    }

    #[must_use]
    pub const fn snapshot(mut self, config: SnapshotConfig) -> Self {
        self.snapshot = config;
        self
    }

    /// Inherit the caller's stream for `slot`, dropping any handler bound
    /// to it.
    #[must_use]
    pub fn inherit_io(mut self, slot: Slot) -> Self {
        match slot {
            Slot::Stdin => self.stdin = None,
            Slot::Stdout => self.stdout = None,
            Slot::Stderr => self.stderr = StderrMode::Inherit,
        }
        self.builder = self.builder.inherit_io(slot, true);
        self
    }

    /// Feed `data` to the pipeline's stdin.
    #[must_use]
    pub fn stdin_bytes(self, data: impl Into<Vec<u8>>) -> Self {
        self.handle_stdin(capture::feed(data))
    }

    #[must_use]
    pub fn handle_stdin(mut self, processor: WriteProcessor<()>) -> Self {
        self.builder = self.builder.inherit_io(Slot::Stdin, false);
        self.stdin = Some(processor);
        self
    }

    pub fn handle_stdout<O2>(self, processor: ReadProcessor<O2>) -> Cmdline<O2, E> {
        Cmdline {
            builder: self.builder.inherit_io(Slot::Stdout, false),
            timeout: self.timeout,
            stdin: self.stdin,
            stdout: Some(processor),
            stderr: self.stderr,
            snapshot: self.snapshot,
        }
    }

    /// Collect stdout as text.
    pub fn capture_stdout(self) -> Cmdline<String, E> {
        self.handle_stdout(capture::collect_string())
    }

    /// Replace the default stderr snapshot with a handler of its own.
    pub fn handle_stderr<E2>(self, processor: ReadProcessor<E2>) -> Cmdline<O, E2> {
        Cmdline {
            builder: self.builder.inherit_io(Slot::Stderr, false),
            timeout: self.timeout,
            stdin: self.stdin,
            stdout: self.stdout,
            stderr: StderrMode::Handler(processor),
            snapshot: self.snapshot,
        }
    }

    /// Launch, wait for every stage and handler, and report.
    ///
    /// A non-zero exit status is not an error; inspect
    /// [`ExecutionResult::status`]. Timeouts and handler failures are.
    pub async fn execute(
        self,
        executor: &TaskExecutor,
    ) -> Result<ExecutionResult<O, E>, ExecuteError> {
        let mut builder = self.builder;
        if let Some(p) = &self.stdin {
            builder = builder.handle_stdin(p);
        }
        if let Some(p) = &self.stdout {
            builder = builder.handle_stdout(p);
        }
        let (stderr, snapshot) = match self.stderr {
            StderrMode::Snapshot => {
                let p = capture::snapshot_stderr(self.snapshot);
                builder = builder.handle_stderr(&p);
                (None, Some(p))
            }
            StderrMode::Handler(p) => {
                builder = builder.handle_stderr(&p);
                (Some(p), None)
            }
            StderrMode::Inherit => (None, None),
        };

        let spec = builder.spec().clone();
        let started_at = SystemTime::now();
        let clock = Instant::now();

        let pipeline = builder.launch(executor).await.map_err(ExecuteError::Launch)?;
        let supervisor = self
            .timeout
            .map(|timeout| pipeline.background_timeout_kill(timeout));

        let status = pipeline.wait_all().await.map_err(ExecuteError::Wait)?;
        let timed_out = match &supervisor {
            Some(cell) => !cell.outcome().await.map_err(ExecuteError::Supervisor)?,
            None => false,
        };

        let handlers = Handlers {
            stdin: self.stdin.as_ref(),
            stdout: self.stdout.as_ref(),
            stderr: stderr.as_ref(),
            snapshot: snapshot.as_ref(),
        };
        let settled = handlers.settle(&pipeline).await;

        let cmdline = spec.clone();
        let info = ExecutionInfo {
            command_line: spec.command_line(),
            env: spec.env,
            working_dir: spec.working_dir,
            pid: pipeline.first().and_then(Stage::pid),
            started_at,
            ended_at: SystemTime::now(),
            elapsed: clock.elapsed(),
            exit_code: stage::exit_code(status),
            timed_out,
            stderr_snapshot: settled.snapshot.and_then(Result::ok),
        };
        info!(
            pipeline = %pipeline.id(),
            exit_code = info.exit_code,
            elapsed_ms = info.elapsed.as_millis(),
            timed_out,
            "Pipeline finished"
        );

        let failures = HandlerFailures {
            stdin: settled.stdin.and_then(Result::err),
            stdout: settled.stdout.as_ref().and_then(|r| r.as_ref().err().cloned()),
            stderr: settled.stderr.as_ref().and_then(|r| r.as_ref().err().cloned()),
        };

        if let (true, Some(timeout)) = (timed_out, self.timeout) {
            return Err(ExecuteError::Timeout {
                timeout,
                failures,
                info: Box::new(info),
            });
        }
        if let Some(first) = failures.first().cloned() {
            return Err(ExecuteError::Handler {
                first,
                failures,
                info: Box::new(info),
            });
        }

        Ok(ExecutionResult {
            cmdline,
            status,
            stdout: settled.stdout.and_then(Result::ok),
            stderr: settled.stderr.and_then(Result::ok),
            info,
        })
    }
}

struct Handlers<'a, O, E> {
    stdin: Option<&'a WriteProcessor<()>>,
    stdout: Option<&'a ReadProcessor<O>>,
    stderr: Option<&'a ReadProcessor<E>>,
    snapshot: Option<&'a ReadProcessor<String>>,
}

struct Settled<O, E> {
    stdin: Option<Result<(), TaskError>>,
    stdout: Option<Result<O, TaskError>>,
    stderr: Option<Result<E, TaskError>>,
    snapshot: Option<Result<String, TaskError>>,
}

impl<O, E> Handlers<'_, O, E>
where
    O: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Wait for every handler. Handlers still blocked a grace period after
    /// the stages exited are reading a pipe held open by a stray
    /// descendant; the streams are force-closed to release them.
    async fn settle(&self, pipeline: &Pipeline) -> Settled<O, E> {
        let grace = pipeline.kill_grace();
        if tokio::time::timeout(grace, self.wait_all()).await.is_err() {
            warn!(pipeline = %pipeline.id(), "Handlers still running after exit, closing streams");
            pipeline.stop_all(true);
            self.wait_all().await;
        }
        Settled {
            stdin: self.stdin.map(outcome),
            stdout: self.stdout.map(outcome),
            stderr: self.stderr.map(outcome),
            snapshot: self.snapshot.map(outcome),
        }
    }

    async fn wait_all(&self) {
        wait(self.stdin.map(StreamProcessor::outcome)).await;
        wait(self.stdout.map(StreamProcessor::outcome)).await;
        wait(self.stderr.map(StreamProcessor::outcome)).await;
        wait(self.snapshot.map(StreamProcessor::outcome)).await;
    }
}

async fn wait<T>(cell: Option<CompletionCell<T>>) {
    if let Some(cell) = cell {
        let _ = cell.wait().await;
    }
}

fn outcome<S, R: Clone>(processor: &StreamProcessor<S, R>) -> Result<R, TaskError> {
    match processor.outcome().get() {
        Some(result) => result.clone(),
        None => Err(TaskError::Cancelled),
    }
}

/// Outcome of a successful run.
#[derive(Debug, Clone)]
pub struct ExecutionResult<O, E> {
    /// The stages, environment overlay and working directory that ran.
    pub cmdline: CommandSpec,
    pub status: ExitStatus,
    /// Value of the stdout handler, if one was set.
    pub stdout: Option<O>,
    /// Value of a custom stderr handler, if one was set.
    pub stderr: Option<E>,
    pub info: ExecutionInfo,
}

/// Report on one run.
#[derive(Debug, Clone)]
pub struct ExecutionInfo {
    pub command_line: Vec<String>,
    pub env: Vec<EnvVar>,
    pub working_dir: Option<PathBuf>,
    /// Pid of the first stage.
    pub pid: Option<u32>,
    pub started_at: SystemTime,
    pub ended_at: SystemTime,
    pub elapsed: Duration,
    pub exit_code: i32,
    pub timed_out: bool,
    pub stderr_snapshot: Option<String>,
}

impl fmt::Display for ExecutionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "command: {}", self.command_line.join(" "))?;
        if let Some(dir) = &self.working_dir {
            writeln!(f, "working dir: {}", dir.display())?;
        }
        if !self.env.is_empty() {
            writeln!(f, "env: {}", env::display_list(&self.env))?;
        }
        if let Some(pid) = self.pid {
            writeln!(f, "pid: {pid}")?;
        }
        write!(
            f,
            "exit code: {} after {}ms",
            self.exit_code,
            self.elapsed.as_millis()
        )?;
        if self.timed_out {
            write!(f, " (timed out)")?;
        }
        if let Some(snapshot) = self.stderr_snapshot.as_deref().filter(|s| !s.is_empty()) {
            write!(f, "\nstderr:\n{snapshot}")?;
        }
        Ok(())
    }
}

/// Per-slot handler failures of one run.
#[derive(Debug, Clone, Default)]
pub struct HandlerFailures {
    pub stdin: Option<TaskError>,
    pub stdout: Option<TaskError>,
    pub stderr: Option<TaskError>,
}

impl HandlerFailures {
    /// First failure in output, error, input order.
    pub fn first(&self) -> Option<&TaskError> {
        self.stdout
            .as_ref()
            .or(self.stderr.as_ref())
            .or(self.stdin.as_ref())
    }

    pub fn is_empty(&self) -> bool {
        self.first().is_none()
    }
}

/// Why [`Cmdline::execute`] did not produce a result.
#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    #[error("Failed to launch pipeline: {0}")]
    Launch(#[source] Error),

    #[error("Failed to wait for pipeline: {0}")]
    Wait(#[source] Error),

    #[error("Timeout supervisor failed: {0}")]
    Supervisor(#[source] TaskError),

    #[error("Pipeline timed out after {}ms\n{info}", .timeout.as_millis())]
    Timeout {
        timeout: Duration,
        failures: HandlerFailures,
        info: Box<ExecutionInfo>,
    },

    #[error("{first}\n{info}")]
    Handler {
        #[source]
        first: TaskError,
        failures: HandlerFailures,
        info: Box<ExecutionInfo>,
    },
}

impl ExecuteError {
    /// The run report, when the pipeline got far enough to produce one.
    pub fn info(&self) -> Option<&ExecutionInfo> {
        match self {
            Self::Timeout { info, .. } | Self::Handler { info, .. } => Some(info.as_ref()),
            _ => None,
        }
    }
}
