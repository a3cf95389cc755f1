//! `cmdpipe` CLI
//!
//! Runs a process pipeline given after `--`, with stages separated by a
//! literal `|` argument. Stdout of the last stage is forwarded; stderr is
//! kept as a bounded snapshot and printed when the run fails.

mod stages;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use tokio::io::AsyncWriteExt;
use tokio::runtime::Handle;
use tracing::{info, warn};

use cmdpipe::{Cmdline, ExecuteError, ReadProcessor, Slot, StreamProcessor, TaskExecutor};
use cmdpipe_core::config::load_config;
use cmdpipe_core::tracing_init::init_tracing;

/// Exit status used when the pipeline was killed for running too long.
const EXIT_TIMEOUT: i32 = 124;

#[derive(Parser, Debug)]
#[command(name = "cmdpipe")]
#[command(version, about = "Run a process pipeline with timeout and tree-kill")]
struct Args {
    /// Kill the pipeline after this many milliseconds
    #[arg(long, env = "CMDPIPE_TIMEOUT_MS")]
    timeout_ms: Option<u64>,

    /// Working directory for every stage
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Set a variable for every stage (repeatable)
    #[arg(long = "env", value_name = "NAME=VALUE")]
    env: Vec<String>,

    /// Like --env, but the value is masked in logs and reports
    #[arg(long = "secret-env", value_name = "NAME=VALUE")]
    secret_env: Vec<String>,

    /// Remove a variable from the inherited environment (repeatable)
    #[arg(long = "unset", value_name = "NAME")]
    unset: Vec<String>,

    /// Connect the first stage to this process's stdin instead of closing it
    #[arg(long)]
    inherit_stdin: bool,

    /// Make non-executable stage programs executable and retry once
    #[arg(long)]
    auto_grant_exec: bool,

    /// Maximum concurrently running handler tasks (at least one per bound stream)
    #[arg(long, env = "CMDPIPE_MAX_CONCURRENT_TASKS")]
    max_tasks: Option<usize>,

    /// Log level filter (e.g. "info", "debug", "warn")
    #[arg(long, env = "CMDPIPE_LOG_LEVEL")]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "CMDPIPE_LOG_JSON")]
    log_json: bool,

    /// The pipeline: `prog args [| prog args]...`
    #[arg(last = true, required = true, value_name = "COMMAND")]
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let project_dir = args.cwd.clone().or_else(|| std::env::current_dir().ok());
    let mut config = load_config(project_dir.as_deref())?;
    if args.auto_grant_exec {
        config.lifecycle.auto_grant_executable = true;
    }
    if let Some(max) = args.max_tasks {
        config.executor.max_concurrent_tasks = max;
    }
    let level = args.log_level.as_deref().unwrap_or(&config.log_level);
    init_tracing(&format!("cmdpipe={level}"), args.log_json);

    let stages = stages::split_stages(&args.command)?;
    let env = stages::parse_env(&args.env, &args.secret_env, &args.unset)?;

    let executor = TaskExecutor::from_config(Handle::current(), &config.executor);

    let mut stages = stages.into_iter();
    let first = stages.next().context("no command given")?;
    let mut cmdline = Cmdline::new(first).configure(&config);
    for stage in stages {
        cmdline = cmdline.pipe(stage);
    }
    for var in env {
        cmdline = cmdline.env_var(var);
    }
    if let Some(dir) = args.cwd {
        cmdline = cmdline.working_dir(dir);
    }
    if args.inherit_stdin {
        cmdline = cmdline.inherit_io(Slot::Stdin);
    }
    if let Some(ms) = args.timeout_ms {
        cmdline = cmdline.timeout(Duration::from_millis(ms));
    }

    let code = match cmdline.handle_stdout(forward_stdout()).execute(&executor).await {
        Ok(result) => {
            info!(exit_code = result.info.exit_code, "Pipeline completed");
            if result.info.exit_code != 0 {
                report(&result.info.to_string());
            }
            if result.info.exit_code < 0 {
                1
            } else {
                result.info.exit_code
            }
        }
        Err(ExecuteError::Timeout { timeout, info, .. }) => {
            warn!(timeout_ms = timeout.as_millis(), "Pipeline timed out");
            report(&info.to_string());
            EXIT_TIMEOUT
        }
        Err(e) => return Err(e.into()),
    };
    executor.shutdown();
    std::process::exit(code);
}

/// Copy the pipeline's stdout to ours. Returns the byte count.
fn forward_stdout() -> ReadProcessor<u64> {
    StreamProcessor::read(|mut ctx| async move {
        let mut out = tokio::io::stdout();
        let copied = tokio::io::copy(ctx.stream_mut(), &mut out)
            .await
            .context("forwarding stdout")?;
        out.flush().await.context("flushing stdout")?;
        Ok(copied)
    })
}

#[allow(clippy::print_stderr)]
fn report(text: &str) {
    eprintln!("{text}");
}
