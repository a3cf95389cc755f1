//! Semaphore-bounded task executor for stream handlers and supervisors.
//!
//! The [`TaskExecutor`] is owned by the caller and passed into every launch,
//! so handler tasks never run on hidden process-wide state. It spawns onto a
//! Tokio runtime handle and limits how many submitted tasks make progress at
//! once with a semaphore; tasks beyond the limit queue until a permit frees.
//!
//! Stream handlers hold their permit until their stream ends, so an executor
//! shared by pipelines needs at least one permit per concurrently bound
//! handler. Timeout supervisors run outside the limit.

use std::any::Any;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tracing::{debug, info};

use cmdpipe_core::config::ExecutorConfig;

use crate::error::{Error, Result, TaskError};

/// Default maximum number of concurrently running tasks.
const DEFAULT_MAX_CONCURRENCY: usize = 16;

/// Why a submitted task produced no value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RunError {
    #[error("executor closed before the task started")]
    Closed,
    #[error("task panicked: {0}")]
    Panicked(String),
    #[error("task was cancelled")]
    Cancelled,
}

impl RunError {
    pub(crate) fn into_task_error(self, task: &str) -> TaskError {
        match self {
            Self::Closed => TaskError::ExecutorClosed,
            Self::Panicked(message) => TaskError::Panicked {
                task: task.to_string(),
                message,
            },
            Self::Cancelled => TaskError::Cancelled,
        }
    }
}

/// Bounded execution resource shared by all tasks of one or more pipelines.
#[derive(Clone)]
pub struct TaskExecutor {
    handle: Handle,
    semaphore: Arc<Semaphore>,
    max_concurrency: usize,
}

impl TaskExecutor {
    /// Create an executor on `handle` with the given concurrency limit.
    /// A limit of zero selects the default.
    pub fn new(handle: Handle, max_concurrency: usize) -> Self {
        let limit = if max_concurrency == 0 {
            DEFAULT_MAX_CONCURRENCY
        } else {
            max_concurrency
        };

        info!(max_concurrency = limit, "TaskExecutor created");

        Self {
            handle,
            semaphore: Arc::new(Semaphore::new(limit)),
            max_concurrency: limit,
        }
    }

    pub fn from_config(handle: Handle, config: &ExecutorConfig) -> Self {
        Self::new(handle, config.max_concurrent_tasks)
    }

    /// Create an executor on the runtime the caller is running in.
    pub fn current(max_concurrency: usize) -> Result<Self> {
        let handle = Handle::try_current()
            .map_err(|e| Error::Config(format!("no Tokio runtime available: {e}")))?;
        Ok(Self::new(handle, max_concurrency))
    }

    pub const fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Submit `task` and report its outcome to `on_done`.
    ///
    /// Fails immediately if the executor is shut down. Once accepted,
    /// `on_done` is called exactly once: with the task's value, with
    /// [`RunError::Panicked`] if it panicked, with [`RunError::Closed`] if
    /// the executor shut down while the task was still queued, or with
    /// [`RunError::Cancelled`] if the runtime dropped it.
    ///
    /// A free permit is taken at submission, so tasks that fit under the
    /// limit start in the order they were submitted.
    pub fn submit<F, T, C>(&self, name: &str, task: F, on_done: C) -> Result<()>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
        C: FnOnce(std::result::Result<T, RunError>) + Send + 'static,
    {
        self.ensure_open(name)?;
        let semaphore = Arc::clone(&self.semaphore);
        let ready = Arc::clone(&self.semaphore).try_acquire_owned().ok();
        let admission = async move {
            match ready {
                Some(permit) => Ok(permit),
                None => semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| RunError::Closed),
            }
        };
        self.run(name, admission, task, on_done);
        Ok(())
    }

    /// Like [`submit`](Self::submit), but the task does not count against
    /// the concurrency limit. Used for timeout supervisors, which must run
    /// even when every permit is held by a handler.
    pub fn spawn_unbounded<F, T, C>(&self, name: &str, task: F, on_done: C) -> Result<()>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
        C: FnOnce(std::result::Result<T, RunError>) + Send + 'static,
    {
        self.ensure_open(name)?;
        self.run(name, async { Ok::<(), RunError>(()) }, task, on_done);
        Ok(())
    }

    fn ensure_open(&self, name: &str) -> Result<()> {
        if self.semaphore.is_closed() {
            return Err(Error::ExecutorClosed {
                task: name.to_string(),
            });
        }
        Ok(())
    }

    fn run<A, P, F, T, C>(&self, name: &str, admission: A, task: F, on_done: C)
    where
        A: Future<Output = std::result::Result<P, RunError>> + Send + 'static,
        P: Send + 'static,
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
        C: FnOnce(std::result::Result<T, RunError>) + Send + 'static,
    {
        let handle = self.handle.clone();
        let name = name.to_string();
        let done = DoneGuard::new(on_done);
        self.handle.spawn(async move {
            let result = match admission.await {
                Ok(_permit) => match handle.spawn(task).await {
                    Ok(value) => Ok(value),
                    Err(e) if e.is_panic() => {
                        Err(RunError::Panicked(panic_message(e.into_panic().as_ref())))
                    }
                    Err(_) => Err(RunError::Cancelled),
                },
                Err(e) => Err(e),
            };
            debug!(task = %name, ok = result.is_ok(), "Task finished");
            done.finish(result);
        });
    }

    /// Stop accepting tasks. Queued tasks are completed with
    /// [`RunError::Closed`]; running tasks are left alone.
    pub fn shutdown(&self) {
        info!("TaskExecutor shutting down");
        self.semaphore.close();
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }

    /// Maximum concurrency limit.
    pub const fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Number of available permits remaining.
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}

impl std::fmt::Debug for TaskExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskExecutor")
            .field("max_concurrency", &self.max_concurrency)
            .field("available_permits", &self.available_permits())
            .finish_non_exhaustive()
    }
}

/// Calls `on_done` with [`RunError::Cancelled`] if the task is dropped
/// before it reports, e.g. when the runtime shuts down.
struct DoneGuard<T, C>
where
    C: FnOnce(std::result::Result<T, RunError>),
{
    on_done: Option<C>,
    _result: PhantomData<fn(T)>,
}

impl<T, C> DoneGuard<T, C>
where
    C: FnOnce(std::result::Result<T, RunError>),
{
    const fn new(on_done: C) -> Self {
        Self {
            on_done: Some(on_done),
            _result: PhantomData,
        }
    }

    fn finish(mut self, result: std::result::Result<T, RunError>) {
        if let Some(on_done) = self.on_done.take() {
            on_done(result);
        }
    }
}

impl<T, C> Drop for DoneGuard<T, C>
where
    C: FnOnce(std::result::Result<T, RunError>),
{
    fn drop(&mut self) {
        if let Some(on_done) = self.on_done.take() {
            on_done(Err(RunError::Cancelled));
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
