//! Single-assignment completion cell.
//!
//! A [`CompletionCell`] starts empty and transitions exactly once to a value
//! or a [`TaskError`]. The first writer wins; later writes are ignored and
//! reported as such. Setting never blocks, so the kill path can always
//! publish failures without risking a deadlock.

use std::sync::{Arc, OnceLock};

use tokio::sync::Notify;

use crate::error::TaskError;

/// Shared handle to a single-assignment result. Clones observe the same cell.
pub struct CompletionCell<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    value: OnceLock<Result<T, TaskError>>,
    notify: Notify,
}

impl<T> CompletionCell<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                value: OnceLock::new(),
                notify: Notify::new(),
            }),
        }
    }

    /// Set the outcome. Returns `false` if the cell was already complete.
    pub fn complete(&self, outcome: Result<T, TaskError>) -> bool {
        let won = self.inner.value.set(outcome).is_ok();
        if won {
            self.inner.notify.notify_waiters();
        }
        won
    }

    pub fn succeed(&self, value: T) -> bool {
        self.complete(Ok(value))
    }

    pub fn fail(&self, err: TaskError) -> bool {
        self.complete(Err(err))
    }

    /// The outcome, if already set.
    pub fn get(&self) -> Option<&Result<T, TaskError>> {
        self.inner.value.get()
    }

    pub fn is_complete(&self) -> bool {
        self.inner.value.get().is_some()
    }

    /// Wait until the cell is complete.
    pub async fn wait(&self) -> &Result<T, TaskError> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a completion in between is not lost.
            notified.as_mut().enable();
            if let Some(outcome) = self.inner.value.get() {
                return outcome;
            }
            notified.await;
        }
    }

    /// Whether both handles point at the same cell.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T: Clone> CompletionCell<T> {
    /// Wait and return an owned copy of the outcome.
    pub async fn outcome(&self) -> Result<T, TaskError> {
        self.wait().await.clone()
    }
}

impl<T> Clone for CompletionCell<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for CompletionCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for CompletionCell<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionCell")
            .field("value", &self.inner.value.get())
            .finish()
    }
}
