//! Handle set for a launched pipeline: aggregate wait, bounded wait and
//! stop across every stage.

use std::process::ExitStatus;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::cell::CompletionCell;
use crate::error::Result;
use crate::executor::TaskExecutor;
use crate::stage::Stage;

/// A running pipeline. Cheap to clone; clones share the same stages.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<PipelineInner>,
}

struct PipelineInner {
    id: Uuid,
    stages: Vec<Stage>,
    /// Cancelled by a forced stop to close the externally visible streams.
    streams: CancellationToken,
    executor: TaskExecutor,
    supervisor: OnceLock<CompletionCell<bool>>,
    kill_grace: Duration,
}

impl Pipeline {
    /// `stages` must be non-empty; the launcher only builds pipelines from
    /// a successful spawn of at least one stage.
    pub(crate) fn new(stages: Vec<Stage>, executor: TaskExecutor, kill_grace: Duration) -> Self {
        debug_assert!(!stages.is_empty());
        Self {
            inner: Arc::new(PipelineInner {
                id: Uuid::new_v4(),
                stages,
                streams: CancellationToken::new(),
                executor,
                supervisor: OnceLock::new(),
                kill_grace,
            }),
        }
    }

    /// Identifier used in log output.
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn stages(&self) -> &[Stage] {
        &self.inner.stages
    }

    /// The stage whose stdin is the pipeline's input and whose exit status
    /// represents the pipeline.
    pub fn first(&self) -> Option<&Stage> {
        self.inner.stages.first()
    }

    /// The stage whose stdout and stderr are the pipeline's outputs.
    pub fn last(&self) -> Option<&Stage> {
        self.inner.stages.last()
    }

    pub fn len(&self) -> usize {
        self.inner.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.stages.is_empty()
    }

    /// Whether any stage is still running.
    pub fn is_running(&self) -> bool {
        self.inner.stages.iter().any(Stage::is_running)
    }

    pub fn executor(&self) -> &TaskExecutor {
        &self.inner.executor
    }

    pub(crate) fn kill_grace(&self) -> Duration {
        self.inner.kill_grace
    }

    pub(crate) fn supervisor_slot(&self) -> &OnceLock<CompletionCell<bool>> {
        &self.inner.supervisor
    }

    pub(crate) fn stream_token(&self) -> CancellationToken {
        self.inner.streams.clone()
    }

    /// Wait for every stage to exit and return the first stage's status.
    ///
    /// Dropping the future abandons the wait; it never stops the pipeline.
    pub async fn wait_all(&self) -> Result<ExitStatus> {
        let mut representative = None;
        for stage in &self.inner.stages {
            let status = stage.wait().await?;
            representative.get_or_insert(status);
        }
        Ok(representative.unwrap_or_default())
    }

    /// Wait at most `timeout` for every stage. Returns `true` only if all of
    /// them exited in time.
    ///
    /// The deadline is fixed once up front and each stage gets whatever is
    /// left of it; once it has passed no further stage is waited.
    pub async fn wait_all_timeout(&self, timeout: Duration) -> Result<bool> {
        if let [stage] = self.inner.stages.as_slice() {
            return stage.wait_timeout(timeout).await;
        }
        self.wait_all_until(Instant::now().checked_add(timeout)).await
    }

    /// Wait for every stage until `deadline`. `None` waits without bound.
    pub(crate) async fn wait_all_until(&self, deadline: Option<Instant>) -> Result<bool> {
        let Some(deadline) = deadline else {
            self.wait_all().await?;
            return Ok(true);
        };
        for stage in &self.inner.stages {
            if Instant::now() >= deadline {
                return Ok(false);
            }
            match tokio::time::timeout_at(deadline, stage.wait()).await {
                Ok(status) => {
                    status?;
                }
                Err(_) => return Ok(false),
            }
        }
        Ok(true)
    }

    /// Tree-kill every stage. A forced stop also closes the pipeline's
    /// visible streams so handlers blocked on them wake up with an error.
    ///
    /// Never fails; safe to call repeatedly and from several tasks.
    pub fn stop_all(&self, force: bool) {
        debug!(pipeline = %self.inner.id, force, "Stopping pipeline");
        for stage in &self.inner.stages {
            stage.kill_tree(force);
        }
        if force {
            self.inner.streams.cancel();
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("id", &self.inner.id)
            .field("stages", &self.inner.stages)
            .field("streams_closed", &self.inner.streams.is_cancelled())
            .finish_non_exhaustive()
    }
}
