//! Background timeout supervisor: at most one per pipeline.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use crate::cell::CompletionCell;
use crate::error::TaskError;
use crate::pipeline::Pipeline;

const SUPERVISOR_TASK: &str = "timeout supervisor";

impl Pipeline {
    /// Start a background wait of at most `timeout`, killing the pipeline
    /// if it is still running when the timeout elapses.
    ///
    /// The cell resolves to `true` if every stage exited in time and to
    /// `false` on timeout. Only the first call starts a supervisor; later
    /// calls, whatever their timeout, return the same cell.
    ///
    /// On timeout the stages get a graceful kill first; if any is still
    /// running after the pipeline's kill grace period it is force-killed.
    ///
    /// The deadline is fixed when this is called, and the supervisor does
    /// not wait for an executor permit.
    pub fn background_timeout_kill(&self, timeout: Duration) -> CompletionCell<bool> {
        let mut reserved = false;
        let cell = self
            .supervisor_slot()
            .get_or_init(|| {
                reserved = true;
                CompletionCell::new()
            })
            .clone();
        if reserved {
            let deadline = Instant::now().checked_add(timeout);
            self.start_supervisor(timeout, deadline, cell.clone());
        }
        cell
    }

    fn start_supervisor(
        &self,
        timeout: Duration,
        deadline: Option<Instant>,
        cell: CompletionCell<bool>,
    ) {
        let pipeline = self.clone();
        let done_pipeline = self.clone();
        let done_cell = cell.clone();
        let task_cell = cell.clone();

        let task = async move {
            match pipeline.wait_all_until(deadline).await {
                Ok(true) => {
                    task_cell.succeed(true);
                }
                Ok(false) => {
                    warn!(
                        pipeline = %pipeline.id(),
                        timeout_ms = timeout.as_millis(),
                        "Pipeline timed out, stopping"
                    );
                    pipeline.stop_all(false);
                    task_cell.succeed(false);
                    let grace = pipeline.kill_grace();
                    if !pipeline.wait_all_timeout(grace).await.unwrap_or(false) {
                        info!(pipeline = %pipeline.id(), "Grace period elapsed, force killing");
                        pipeline.stop_all(true);
                    }
                }
                Err(e) => {
                    warn!(pipeline = %pipeline.id(), error = %e, "Timeout supervisor failed");
                    task_cell.fail(TaskError::Wait {
                        reason: e.to_string(),
                    });
                    pipeline.stop_all(true);
                }
            }
        };

        let submitted = self.executor().spawn_unbounded(SUPERVISOR_TASK, task, move |result| {
            if let Err(e) = result {
                if done_cell.fail(e.into_task_error(SUPERVISOR_TASK)) {
                    done_pipeline.stop_all(true);
                }
            }
        });
        if let Err(e) = submitted {
            warn!(pipeline = %self.id(), error = %e, "Could not start timeout supervisor");
            cell.fail(TaskError::ExecutorClosed);
        }
    }
}
