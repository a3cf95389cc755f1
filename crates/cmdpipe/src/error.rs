//! Error types for pipeline launch and stream handlers.

use std::sync::Arc;

use thiserror::Error;

use crate::stdio::Slot;

/// Result type alias using the pipeline [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised synchronously by launch, wait and scheduling operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Rejected before any OS call: no command, empty stage, bad binding.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The OS refused to create a stage process.
    #[error("Failed to spawn stage {stage} ({program}): {source}")]
    Spawn {
        stage: usize,
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// A stream processor instance was bound a second time.
    #[error("Stream processor for {slot} has already been used")]
    Reuse { slot: Slot },

    /// The task executor was shut down before the task could be submitted.
    #[error("Task executor is shut down, cannot run {task}")]
    ExecutorClosed { task: String },

    /// Waiting on a stage failed at the OS level.
    #[error("Failed to wait for stage {stage}: {source}")]
    Wait {
        stage: usize,
        #[source]
        source: Arc<std::io::Error>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure recorded in a completion cell.
///
/// Cloneable so every observer of a cell sees the same cause.
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    /// The user handler returned an error.
    #[error("{slot} handler failed: {cause:#}")]
    Handler {
        slot: Slot,
        cause: Arc<anyhow::Error>,
    },

    /// The task panicked while running.
    #[error("{task} panicked: {message}")]
    Panicked { task: String, message: String },

    /// The pipeline never started, so the handler never ran.
    #[error("command launch failed: {reason}")]
    LaunchFailed { reason: String },

    /// Waiting on the pipeline failed at the OS level.
    #[error("waiting for the pipeline failed: {reason}")]
    Wait { reason: String },

    #[error("task executor is shut down")]
    ExecutorClosed,

    #[error("task was cancelled before completing")]
    Cancelled,
}

impl TaskError {
    pub(crate) fn launch_failed(err: &Error) -> Self {
        Self::LaunchFailed {
            reason: err.to_string(),
        }
    }

    /// The handler's own error, when this failure came from one.
    pub fn handler_cause(&self) -> Option<&anyhow::Error> {
        match self {
            Self::Handler { cause, .. } => Some(cause),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuse_message_names_slot() {
        let msg = Error::Reuse { slot: Slot::Stdout }.to_string();
        assert!(msg.contains("stdout"));
        assert!(msg.contains("used"));
    }

    #[test]
    fn handler_error_shows_cause_chain() {
        let cause = anyhow::anyhow!("disk full").context("writing report");
        let err = TaskError::Handler {
            slot: Slot::Stderr,
            cause: Arc::new(cause),
        };
        let msg = err.to_string();
        assert!(msg.starts_with("stderr handler failed"));
        assert!(msg.contains("writing report"));
        assert!(msg.contains("disk full"));
        assert!(err.handler_cause().is_some());
    }

    #[test]
    fn launch_failed_wraps_reason() {
        let err = TaskError::launch_failed(&Error::Config("cmdline not set".into()));
        assert_eq!(
            err.to_string(),
            "command launch failed: Configuration error: cmdline not set"
        );
    }
}
