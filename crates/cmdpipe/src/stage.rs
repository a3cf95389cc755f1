//! One spawned process of a pipeline.
//!
//! Each stage hands its [`Child`] to a reaper task. The reaper is the only
//! owner of the OS handle: it publishes the exit status on a `watch`
//! channel and delivers kill requests, so a signal can never reach a pid
//! that was already reaped and possibly reused.

use std::io;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Child;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::tree_kill;

type ExitSlot = Option<std::result::Result<ExitStatus, Arc<io::Error>>>;

/// Handle to one running (or finished) stage.
#[derive(Debug)]
pub struct Stage {
    index: usize,
    program: String,
    pid: Option<u32>,
    exit: watch::Receiver<ExitSlot>,
    kill_tx: mpsc::UnboundedSender<bool>,
}

impl Stage {
    /// Take ownership of `child` and start its reaper on `handle`.
    pub(crate) fn start(index: usize, program: String, mut child: Child, handle: &Handle) -> Self {
        let pid = child.id();
        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, mut kill_rx) = mpsc::unbounded_channel::<bool>();

        handle.spawn(async move {
            let outcome = loop {
                tokio::select! {
                    status = child.wait() => break status.map_err(Arc::new),
                    Some(force) = kill_rx.recv() => deliver_signal(&mut child, pid, force),
                }
            };
            match &outcome {
                Ok(status) => debug!(stage = index, ?pid, %status, "Stage exited"),
                Err(e) => warn!(stage = index, ?pid, error = %e, "Failed to wait for stage"),
            }
            exit_tx.send_replace(Some(outcome));
        });

        Self {
            index,
            program,
            pid,
            exit: exit_rx,
            kill_tx,
        }
    }

    /// Position of this stage in the chain.
    pub const fn index(&self) -> usize {
        self.index
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// OS process id, if the platform reported one at spawn time.
    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Poll for exit without blocking.
    pub fn try_status(&self) -> Result<Option<ExitStatus>> {
        match &*self.exit.borrow() {
            None => Ok(None),
            Some(Ok(status)) => Ok(Some(*status)),
            Some(Err(e)) => Err(self.wait_error(Arc::clone(e))),
        }
    }

    pub fn is_running(&self) -> bool {
        self.exit.borrow().is_none()
    }

    /// Wait until the stage exits. Dropping the future abandons the wait
    /// and leaves the process alone.
    pub async fn wait(&self) -> Result<ExitStatus> {
        let mut exit = self.exit.clone();
        let slot = exit.wait_for(Option::is_some).await.map_err(|_| {
            self.wait_error(Arc::new(io::Error::other("stage reaper stopped")))
        })?;
        match &*slot {
            Some(Ok(status)) => Ok(*status),
            Some(Err(e)) => Err(self.wait_error(Arc::clone(e))),
            None => Err(self.wait_error(Arc::new(io::Error::other("stage exit not published")))),
        }
    }

    /// Wait at most `timeout`. Returns `true` if the stage exited in time.
    pub async fn wait_timeout(&self, timeout: Duration) -> Result<bool> {
        match tokio::time::timeout(timeout, self.wait()).await {
            Ok(status) => status.map(|_| true),
            Err(_) => Ok(false),
        }
    }

    /// Signal the stage's live descendants deepest first, then the stage
    /// itself. A stage that already exited is left alone.
    pub fn kill_tree(&self, force: bool) {
        if !self.is_running() {
            return;
        }
        if let Some(pid) = self.pid {
            tree_kill::kill_descendants(pid, force, tree_kill::system());
        }
        // A closed channel means the reaper already collected the exit.
        let _ = self.kill_tx.send(force);
    }

    fn wait_error(&self, source: Arc<io::Error>) -> Error {
        Error::Wait {
            stage: self.index,
            source,
        }
    }
}

fn deliver_signal(child: &mut Child, pid: Option<u32>, force: bool) {
    debug!(?pid, force, "Signalling stage");
    #[cfg(unix)]
    {
        if let (false, Some(pid)) = (force, pid) {
            tree_kill::signal_pid(pid, false);
            return;
        }
    }
    if let Err(e) = child.start_kill() {
        if e.kind() != io::ErrorKind::InvalidInput {
            warn!(?pid, error = %e, "Failed to kill stage");
        }
    }
}

/// Numeric exit code for reporting: the process's own code, or `128 + n`
/// when it was killed by signal `n` (the shell convention), else `-1`.
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}
