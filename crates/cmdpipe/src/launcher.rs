//! Pipeline launcher.
//!
//! [`PipelineBuilder`] collects the stages, the environment overlay, the
//! per-slot inherit flags and the stream processors, then
//! [`launch`](PipelineBuilder::launch) spawns the chain with stage `i`'s
//! stdout piped into stage `i + 1`'s stdin and schedules every bound
//! processor on the caller's [`TaskExecutor`].
//!
//! A failed launch leaves nothing behind: stages that did start are
//! force-killed and reaped, and every bound processor's cell is failed with
//! [`TaskError::LaunchFailed`].

use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use cmdpipe_core::{Config, EnvVar, env};
use tokio::process::Child;
use tracing::{debug, info, warn};

use crate::command::{CommandSpec, StageSpec};
use crate::error::{Error, Result, TaskError};
use crate::executor::TaskExecutor;
use crate::permission;
use crate::pipeline::Pipeline;
use crate::processor::{BoundProcessor, ReadProcessor, StreamContext, WriteProcessor};
use crate::stage::Stage;
use crate::stdio::{Slot, StdioPolicy};
use crate::stream::{PipeReader, PipeWriter};
use crate::tree_kill;

/// Grace period between a graceful and a forced kill.
const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(5);

/// A processor bound to a slot, and whether this launch holds its guard.
struct Binding<S> {
    processor: Box<dyn BoundProcessor<S>>,
    claimed: bool,
}

impl<S> Binding<S> {
    fn new(processor: Box<dyn BoundProcessor<S>>) -> Self {
        Self {
            processor,
            claimed: false,
        }
    }

    fn claim(&mut self, slot: Slot) -> Result<()> {
        self.processor.claim(slot)?;
        self.claimed = true;
        Ok(())
    }

    /// Fail the processor's cell, unless it belongs to another launch.
    fn fail(&mut self, err: &Error) {
        if self.claimed || self.processor.try_claim() {
            self.claimed = true;
            self.processor.abandon(TaskError::launch_failed(err));
        }
    }
}

#[derive(Default)]
struct Bindings {
    stdin: Option<Binding<PipeWriter>>,
    stdout: Option<Binding<PipeReader>>,
    stderr: Option<Binding<PipeReader>>,
}

impl Bindings {
    const fn is_bound(&self, slot: Slot) -> bool {
        match slot {
            Slot::Stdin => self.stdin.is_some(),
            Slot::Stdout => self.stdout.is_some(),
            Slot::Stderr => self.stderr.is_some(),
        }
    }

    const fn any(&self) -> bool {
        self.stdin.is_some() || self.stdout.is_some() || self.stderr.is_some()
    }

    /// Take every guard. All of them are attempted so that a reuse on one
    /// slot is reported before anything is spawned.
    fn claim_all(&mut self) -> Result<()> {
        let mut first_err = None;
        if let Some(b) = &mut self.stdin {
            if let Err(e) = b.claim(Slot::Stdin) {
                first_err.get_or_insert(e);
            }
        }
        if let Some(b) = &mut self.stdout {
            if let Err(e) = b.claim(Slot::Stdout) {
                first_err.get_or_insert(e);
            }
        }
        if let Some(b) = &mut self.stderr {
            if let Err(e) = b.claim(Slot::Stderr) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn fail_all(&mut self, err: &Error) {
        if let Some(b) = &mut self.stdin {
            b.fail(err);
        }
        if let Some(b) = &mut self.stdout {
            b.fail(err);
        }
        if let Some(b) = &mut self.stderr {
            b.fail(err);
        }
    }
}

/// Pipes taken from the spawned chain before the stages are handed to
/// their reapers.
struct VisibleStreams {
    stdin: Option<tokio::process::ChildStdin>,
    stdout: Option<tokio::process::ChildStdout>,
    stderr: Option<tokio::process::ChildStderr>,
}

/// A spawn that failed part way through the chain.
struct SpawnFailure {
    stage: usize,
    program: String,
    source: io::Error,
    started: Vec<Child>,
}

impl SpawnFailure {
    /// Force-kill and reap the stages that did start.
    async fn reap(self) -> (Error, bool) {
        for mut child in self.started {
            if let Some(pid) = child.id() {
                tree_kill::kill_descendants(pid, true, tree_kill::system());
            }
            if let Err(e) = child.kill().await {
                warn!(error = %e, "Failed to reap stage after spawn failure");
            }
        }
        let denied = permission::is_permission_denied(&self.source);
        let err = Error::Spawn {
            stage: self.stage,
            program: self.program,
            source: self.source,
        };
        (err, denied)
    }
}

/// Builder for a process pipeline.
pub struct PipelineBuilder {
    spec: CommandSpec,
    policy: StdioPolicy,
    bindings: Bindings,
    auto_grant_executable: bool,
    kill_grace: Duration,
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self {
            spec: CommandSpec::default(),
            policy: StdioPolicy::default(),
            bindings: Bindings::default(),
            auto_grant_executable: false,
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }

    /// Start from the lifecycle settings in `config`.
    pub fn from_config(config: &Config) -> Self {
        Self {
            auto_grant_executable: config.lifecycle.auto_grant_executable,
            kill_grace: config.lifecycle.kill_grace(),
            ..Self::new()
        }
    }

    /// Replace all stages with a single command line.
    #[must_use]
    pub fn cmdline<I, S>(mut self, argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.spec.stages = vec![StageSpec::from_argv(argv)];
        self
    }

    /// Append a stage fed by the previous one.
    #[must_use]
    pub fn pipe<I, S>(mut self, argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.spec.stages.push(StageSpec::from_argv(argv));
        self
    }

    #[must_use]
    pub fn stage(mut self, stage: StageSpec) -> Self {
        self.spec.stages.push(stage);
        self
    }

    /// Replace all stages with pre-built [`std::process::Command`]s.
    /// Their stdio settings are ignored.
    #[must_use]
    pub fn commands<'a>(mut self, commands: impl IntoIterator<Item = &'a std::process::Command>) -> Self {
        self.spec.stages = commands.into_iter().map(StageSpec::from_command).collect();
        self
    }

    /// Run every stage in `dir` instead of the caller's working directory.
    #[must_use]
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.spec.working_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn env(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_var(EnvVar::set(name, value))
    }

    /// Like [`env`](Self::env), but the value is masked in logs.
    #[must_use]
    pub fn secret_env(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_var(EnvVar::secret(name, value))
    }

    /// Remove `name` from the inherited environment.
    #[must_use]
    pub fn env_remove(self, name: impl Into<String>) -> Self {
        self.env_var(EnvVar::unset(name))
    }

    #[must_use]
    pub fn env_var(mut self, var: EnvVar) -> Self {
        self.spec.env.push(var);
        self
    }

    /// Inherit the parent's stream for `slot` instead of piping or
    /// discarding it.
    #[must_use]
    pub fn inherit_io(mut self, slot: Slot, inherit: bool) -> Self {
        self.policy.set_inherit(slot, inherit);
        self
    }

    /// Bind a handler to the pipeline's stdout. Clears the inherit flag.
    #[must_use]
    pub fn handle_stdout<R>(mut self, processor: &ReadProcessor<R>) -> Self
    where
        R: Send + Sync + 'static,
    {
        self.policy.set_inherit(Slot::Stdout, false);
        self.bindings.stdout = Some(Binding::new(Box::new(processor.clone())));
        self
    }

    /// Bind a handler to the pipeline's stderr. Clears the inherit flag.
    #[must_use]
    pub fn handle_stderr<R>(mut self, processor: &ReadProcessor<R>) -> Self
    where
        R: Send + Sync + 'static,
    {
        self.policy.set_inherit(Slot::Stderr, false);
        self.bindings.stderr = Some(Binding::new(Box::new(processor.clone())));
        self
    }

    /// Bind a handler to the pipeline's stdin. Clears the inherit flag.
    #[must_use]
    pub fn handle_stdin<R>(mut self, processor: &WriteProcessor<R>) -> Self
    where
        R: Send + Sync + 'static,
    {
        self.policy.set_inherit(Slot::Stdin, false);
        self.bindings.stdin = Some(Binding::new(Box::new(processor.clone())));
        self
    }

    /// On a "permission denied" spawn failure, add the owner-execute bit to
    /// stage programs that have no execute bit and retry once.
    #[must_use]
    pub const fn auto_grant_executable(mut self, enabled: bool) -> Self {
        self.auto_grant_executable = enabled;
        self
    }

    /// Delay between the graceful and the forced kill of a timed-out
    /// pipeline.
    #[must_use]
    pub const fn kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub const fn spec(&self) -> &CommandSpec {
        &self.spec
    }

    /// Spawn the pipeline and schedule its stream processors on `executor`.
    pub async fn launch(mut self, executor: &TaskExecutor) -> Result<Pipeline> {
        let checked = self.bindings.claim_all().and_then(|()| self.check(executor));
        if let Err(err) = checked {
            warn!(error = %err, "Rejected pipeline launch");
            self.bindings.fail_all(&err);
            return Err(err);
        }

        let mut children = match self.spawn_with_remediation(executor).await {
            Ok(children) => children,
            Err(err) => {
                warn!(error = %err, "Failed to launch pipeline");
                self.bindings.fail_all(&err);
                return Err(err);
            }
        };

        let mut streams = VisibleStreams {
            stdin: children.first_mut().and_then(|c| c.stdin.take()),
            stdout: children.last_mut().and_then(|c| c.stdout.take()),
            stderr: children.last_mut().and_then(|c| c.stderr.take()),
        };
        if self.bindings.stdin.is_none() {
            // Nobody will write to it; the child sees EOF right away.
            drop(streams.stdin.take());
        }

        let stages = children
            .into_iter()
            .zip(&self.spec.stages)
            .enumerate()
            .map(|(index, (child, spec))| {
                Stage::start(index, spec.display_name(), child, executor.handle())
            })
            .collect();
        let pipeline = Pipeline::new(stages, executor.clone(), self.kill_grace);

        info!(
            pipeline = %pipeline.id(),
            stages = pipeline.len(),
            pid = ?pipeline.first().and_then(Stage::pid),
            command = %self.spec.command_line().join(" "),
            "Pipeline launched"
        );
        if !self.spec.env.is_empty() {
            debug!(pipeline = %pipeline.id(), env = %env::display_list(&self.spec.env), "Environment overlay");
        }

        if let Err(err) = self.wire(&pipeline, streams) {
            warn!(pipeline = %pipeline.id(), error = %err, "Failed to start stream handlers");
            pipeline.stop_all(true);
            if let Err(e) = pipeline.wait_all().await {
                debug!(error = %e, "Wait after failed wiring");
            }
            self.bindings.fail_all(&err);
            return Err(err);
        }
        Ok(pipeline)
    }

    /// Reject launches that cannot succeed, before any OS call.
    fn check(&self, executor: &TaskExecutor) -> Result<()> {
        self.spec.validate()?;
        for slot in Slot::ALL {
            if self.bindings.is_bound(slot) && self.policy.is_inherited(slot) {
                return Err(Error::Config(format!(
                    "{slot} is inherited but has a handler bound"
                )));
            }
        }
        if self.bindings.any() && executor.is_closed() {
            return Err(Error::ExecutorClosed {
                task: "stream handlers".to_string(),
            });
        }
        Ok(())
    }

    async fn spawn_with_remediation(&self, executor: &TaskExecutor) -> Result<Vec<Child>> {
        let failure = match self.spawn_chain(executor) {
            Ok(children) => return Ok(children),
            Err(failure) => failure,
        };
        let (err, denied) = failure.reap().await;
        if !(self.auto_grant_executable && denied) {
            return Err(err);
        }
        if !permission::grant_all(&self.spec.stages) {
            debug!("No stage program could be made executable");
            return Err(err);
        }
        info!(error = %err, "Retrying launch after granting execute permission");
        match self.spawn_chain(executor) {
            Ok(children) => Ok(children),
            Err(failure) => Err(failure.reap().await.0),
        }
    }

    /// Spawn every stage, chaining stdout into the next stage's stdin.
    fn spawn_chain(&self, executor: &TaskExecutor) -> std::result::Result<Vec<Child>, SpawnFailure> {
        // Children must be registered with the executor's runtime, which
        // owns their reapers.
        let _runtime = executor.handle().enter();

        let last = self.spec.stages.len().saturating_sub(1);
        let mut started: Vec<Child> = Vec::with_capacity(self.spec.stages.len());
        let mut upstream: Option<Stdio> = None;

        for (index, stage) in self.spec.stages.iter().enumerate() {
            let mut cmd = stage.to_command(self.spec.working_dir.as_deref(), &self.spec.env);
            cmd.kill_on_drop(true);
            cmd.stdin(upstream.take().unwrap_or_else(|| {
                self.policy
                    .resolve(Slot::Stdin, self.bindings.is_bound(Slot::Stdin))
                    .to_stdio()
            }));
            if index == last {
                cmd.stdout(
                    self.policy
                        .resolve(Slot::Stdout, self.bindings.is_bound(Slot::Stdout))
                        .to_stdio(),
                );
                cmd.stderr(
                    self.policy
                        .resolve(Slot::Stderr, self.bindings.is_bound(Slot::Stderr))
                        .to_stdio(),
                );
            } else {
                cmd.stdout(Stdio::piped());
                cmd.stderr(self.policy.intermediate_stderr().to_stdio());
            }

            let fail = |source: io::Error, started: Vec<Child>| SpawnFailure {
                stage: index,
                program: stage.display_name(),
                source,
                started,
            };

            let mut child = match cmd.spawn() {
                Ok(child) => child,
                Err(source) => return Err(fail(source, started)),
            };
            debug!(stage = index, pid = ?child.id(), program = %stage.display_name(), "Spawned stage");

            if index != last {
                let chained = child
                    .stdout
                    .take()
                    .ok_or_else(|| io::Error::other("stage stdout was not captured"))
                    .and_then(TryInto::<Stdio>::try_into);
                started.push(child);
                match chained {
                    Ok(stdio) => upstream = Some(stdio),
                    Err(source) => return Err(fail(source, started)),
                }
            } else {
                started.push(child);
            }
        }
        Ok(started)
    }

    /// Schedule the bound processors against the visible streams: input,
    /// then output, then error. The writer goes first so that on a small
    /// executor it never queues behind readers waiting for its EOF.
    fn wire(&self, pipeline: &Pipeline, streams: VisibleStreams) -> Result<()> {
        let token = pipeline.stream_token();
        if let Some(binding) = &self.bindings.stdin {
            let stream = streams.stdin.ok_or_else(|| missing(Slot::Stdin))?;
            binding.processor.schedule(StreamContext::new(
                pipeline.clone(),
                Slot::Stdin,
                PipeWriter::new(stream, token.clone()),
            ))?;
        }
        if let Some(binding) = &self.bindings.stdout {
            let stream = streams.stdout.ok_or_else(|| missing(Slot::Stdout))?;
            binding.processor.schedule(StreamContext::new(
                pipeline.clone(),
                Slot::Stdout,
                PipeReader::stdout(stream, token.clone()),
            ))?;
        }
        if let Some(binding) = &self.bindings.stderr {
            let stream = streams.stderr.ok_or_else(|| missing(Slot::Stderr))?;
            binding.processor.schedule(StreamContext::new(
                pipeline.clone(),
                Slot::Stderr,
                PipeReader::stderr(stream, token),
            ))?;
        }
        Ok(())
    }
}

fn missing(slot: Slot) -> Error {
    Error::Io(io::Error::other(format!("{slot} pipe was not created")))
}

impl std::fmt::Debug for PipelineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineBuilder")
            .field("spec", &self.spec)
            .field("policy", &self.policy)
            .field("stdin_bound", &self.bindings.stdin.is_some())
            .field("stdout_bound", &self.bindings.stdout.is_some())
            .field("stderr_bound", &self.bindings.stderr.is_some())
            .field("auto_grant_executable", &self.auto_grant_executable)
            .field("kill_grace", &self.kill_grace)
            .finish()
    }
}
