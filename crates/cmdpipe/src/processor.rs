//! Stream processors: user handlers bound to one visible stream of a
//! pipeline.
//!
//! A [`StreamProcessor`] wraps an async handler together with the
//! [`CompletionCell`] its outcome is published to. The cell exists from the
//! moment the processor is created, so anyone holding the processor can
//! await the outcome before, during or after launch. A processor runs at
//! most once; binding it to a second launch fails with [`Error::Reuse`].
//!
//! When a handler fails or panics, its cell records the failure and every
//! stage of the pipeline is force-stopped.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, warn};

use crate::cell::CompletionCell;
use crate::error::{Error, Result, TaskError};
use crate::pipeline::Pipeline;
use crate::stdio::Slot;
use crate::stream::{PipeReader, PipeWriter};

type HandlerFuture<R> = Pin<Box<dyn Future<Output = anyhow::Result<R>> + Send>>;
type BoxedHandler<S, R> = Box<dyn FnOnce(StreamContext<S>) -> HandlerFuture<R> + Send>;

/// What a handler receives: the pipeline it belongs to, the slot it is bound
/// to and the stream itself.
#[derive(Debug)]
pub struct StreamContext<S> {
    pipeline: Pipeline,
    slot: Slot,
    stream: S,
}

impl<S> StreamContext<S> {
    pub(crate) const fn new(pipeline: Pipeline, slot: Slot, stream: S) -> Self {
        Self {
            pipeline,
            slot,
            stream,
        }
    }

    pub const fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub const fn slot(&self) -> Slot {
        self.slot
    }

    pub const fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn into_stream(self) -> S {
        self.stream
    }

    pub fn into_parts(self) -> (Pipeline, Slot, S) {
        (self.pipeline, self.slot, self.stream)
    }
}

/// A handler bound once to a pipeline stream, with its completion cell.
///
/// Clones share the handler, the reuse guard and the cell.
pub struct StreamProcessor<S, R> {
    inner: Arc<ProcessorInner<S, R>>,
}

struct ProcessorInner<S, R> {
    handler: Mutex<Option<BoxedHandler<S, R>>>,
    used: AtomicBool,
    cell: CompletionCell<R>,
}

/// Handler for the pipeline's stdout or stderr.
pub type ReadProcessor<R> = StreamProcessor<PipeReader, R>;
/// Handler for the pipeline's stdin.
pub type WriteProcessor<R> = StreamProcessor<PipeWriter, R>;

impl<R> StreamProcessor<PipeReader, R>
where
    R: Send + Sync + 'static,
{
    /// Processor reading the last stage's stdout or stderr.
    pub fn read<F, Fut>(handler: F) -> Self
    where
        F: FnOnce(StreamContext<PipeReader>) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        Self::with_handler(handler)
    }
}

impl<R> StreamProcessor<PipeWriter, R>
where
    R: Send + Sync + 'static,
{
    /// Processor writing the first stage's stdin. The child sees EOF once
    /// the handler drops or shuts down the writer.
    pub fn write<F, Fut>(handler: F) -> Self
    where
        F: FnOnce(StreamContext<PipeWriter>) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        Self::with_handler(handler)
    }
}

impl<S, R> StreamProcessor<S, R>
where
    S: Send + 'static,
    R: Send + Sync + 'static,
{
    fn with_handler<F, Fut>(handler: F) -> Self
    where
        F: FnOnce(StreamContext<S>) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        let boxed: BoxedHandler<S, R> =
            Box::new(move |ctx| -> HandlerFuture<R> { Box::pin(handler(ctx)) });
        Self {
            inner: Arc::new(ProcessorInner {
                handler: Mutex::new(Some(boxed)),
                used: AtomicBool::new(false),
                cell: CompletionCell::new(),
            }),
        }
    }

    fn take_handler(&self) -> Option<BoxedHandler<S, R>> {
        self.inner
            .handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl<S, R> StreamProcessor<S, R> {
    /// The completion cell this processor publishes to.
    pub fn outcome(&self) -> CompletionCell<R> {
        self.inner.cell.clone()
    }

    /// Whether the processor was already bound to a launch.
    pub fn is_used(&self) -> bool {
        self.inner.used.load(Ordering::Acquire)
    }
}

impl<S, R: Clone> StreamProcessor<S, R> {
    /// Wait for the handler's outcome.
    pub async fn result(&self) -> std::result::Result<R, TaskError> {
        self.inner.cell.outcome().await
    }
}

impl<S, R> Clone for StreamProcessor<S, R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S, R> std::fmt::Debug for StreamProcessor<S, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamProcessor")
            .field("used", &self.inner.used.load(Ordering::Relaxed))
            .field("complete", &self.inner.cell.is_complete())
            .finish_non_exhaustive()
    }
}

/// Type-erased view of a processor used by the launcher, which does not
/// care about the handler's result type.
pub(crate) trait BoundProcessor<S>: Send + Sync {
    /// Take the one-shot guard for `slot`.
    fn claim(&self, slot: Slot) -> Result<()>;

    /// Take the guard if nobody has. Used to fail processors that a
    /// failing launch never got around to claiming.
    fn try_claim(&self) -> bool;

    /// Drop the handler without running it and fail the cell.
    fn abandon(&self, err: TaskError);

    /// Submit the handler to the pipeline's executor.
    fn schedule(&self, ctx: StreamContext<S>) -> Result<()>;
}

impl<S, R> BoundProcessor<S> for StreamProcessor<S, R>
where
    S: Send + 'static,
    R: Send + Sync + 'static,
{
    fn claim(&self, slot: Slot) -> Result<()> {
        if self.try_claim() {
            Ok(())
        } else {
            Err(Error::Reuse { slot })
        }
    }

    fn try_claim(&self) -> bool {
        self.inner
            .used
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn abandon(&self, err: TaskError) {
        drop(self.take_handler());
        self.inner.cell.fail(err);
    }

    fn schedule(&self, ctx: StreamContext<S>) -> Result<()> {
        let slot = ctx.slot;
        let Some(handler) = self.take_handler() else {
            return Err(Error::Reuse { slot });
        };
        let pipeline = ctx.pipeline.clone();
        let executor = pipeline.executor().clone();
        let cell = self.inner.cell.clone();
        let task_name = format!("{slot} handler");
        let name = task_name.clone();

        debug!(pipeline = %pipeline.id(), %slot, "Scheduling stream handler");
        executor.submit(&task_name, async move { handler(ctx).await }, move |result| {
            let outcome = match result {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(cause)) => Err(TaskError::Handler {
                    slot,
                    cause: Arc::new(cause),
                }),
                Err(e) => Err(e.into_task_error(&name)),
            };
            match outcome {
                Ok(value) => {
                    cell.succeed(value);
                }
                Err(err) => {
                    warn!(
                        pipeline = %pipeline.id(),
                        %slot,
                        error = %err,
                        "Stream handler failed, stopping pipeline"
                    );
                    cell.fail(err);
                    pipeline.stop_all(true);
                }
            }
        })
    }
}
