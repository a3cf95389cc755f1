//! `cmdpipe`: launch process pipelines and drive their stdio from async
//! handlers.
//!
//! - [`PipelineBuilder`] spawns one or more stages, chaining each stage's
//!   stdout into the next stage's stdin, and decides per slot whether the
//!   pipeline's visible ends are inherited, piped or discarded.
//! - [`Pipeline`] is the handle set over the spawned stages: aggregate
//!   wait, bounded wait, tree-kill, and a background timeout supervisor.
//! - [`StreamProcessor`] binds a handler to exactly one visible stream and
//!   publishes its outcome through a [`CompletionCell`]. A failing handler
//!   tears the whole pipeline down.
//! - [`Cmdline`] runs a pipeline to completion and reports on it.
//!
//! All handler and supervisor tasks run on a caller-owned [`TaskExecutor`].
//!
//! ```no_run
//! use cmdpipe::{PipelineBuilder, TaskExecutor, capture};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let executor = TaskExecutor::current(4)?;
//! let stdout = capture::collect_string();
//! let pipeline = PipelineBuilder::new()
//!     .cmdline(["ls", "-1"])
//!     .pipe(["wc", "-l"])
//!     .handle_stdout(&stdout)
//!     .launch(&executor)
//!     .await?;
//! pipeline.wait_all().await?;
//! println!("{}", stdout.result().await?);
//! # Ok(())
//! # }
//! ```

pub mod capture;
pub mod cell;
pub mod command;
pub mod error;
pub mod execute;
pub mod executor;
pub mod launcher;
pub mod permission;
pub mod pipeline;
pub mod processor;
pub mod stage;
pub mod stdio;
pub mod stream;
mod supervisor;
pub mod tree_kill;

pub use cell::CompletionCell;
pub use command::{CommandSpec, StageSpec};
pub use error::{Error, Result, TaskError};
pub use execute::{Cmdline, ExecuteError, ExecutionInfo, ExecutionResult, HandlerFailures};
pub use executor::{RunError, TaskExecutor};
pub use launcher::PipelineBuilder;
pub use pipeline::Pipeline;
pub use processor::{ReadProcessor, StreamContext, StreamProcessor, WriteProcessor};
pub use stage::Stage;
pub use stdio::{Disposition, Slot, StdioPolicy};
pub use stream::{PipeReader, PipeWriter};
