#![allow(clippy::unwrap_used, clippy::panic)] // Integration tests use unwrap for brevity
#![cfg(unix)]

//! Stream processor harness: exactly-once scheduling, result publication,
//! fail-fast teardown and launch failures.

use std::time::Duration;

use tokio::io::AsyncReadExt;

use cmdpipe::{
    Error, PipelineBuilder, ReadProcessor, Slot, StreamProcessor, TaskError, TaskExecutor,
    WriteProcessor, capture,
};

const PATIENCE: Duration = Duration::from_secs(10);

fn executor() -> TaskExecutor {
    TaskExecutor::current(8).unwrap()
}

#[tokio::test]
async fn test_failing_handler_kills_pipeline() {
    let executor = executor();
    let stdout: ReadProcessor<()> =
        StreamProcessor::read(|_ctx| async { Err(anyhow::anyhow!("refusing to read")) });
    let pipeline = PipelineBuilder::new()
        .cmdline(["sleep", "30"])
        .handle_stdout(&stdout)
        .launch(&executor)
        .await
        .unwrap();

    let failure = tokio::time::timeout(PATIENCE, stdout.result())
        .await
        .unwrap()
        .unwrap_err();
    match &failure {
        TaskError::Handler { slot, cause } => {
            assert_eq!(*slot, Slot::Stdout);
            assert_eq!(cause.to_string(), "refusing to read");
        }
        other => panic!("unexpected failure: {other}"),
    }

    let status = tokio::time::timeout(PATIENCE, pipeline.wait_all())
        .await
        .unwrap()
        .unwrap();
    assert!(!status.success());
}

#[tokio::test]
async fn test_panicking_handler_is_recorded() {
    let executor = executor();
    let stderr: ReadProcessor<()> = StreamProcessor::read(|_ctx| async {
        let explode = true;
        assert!(!explode, "handler blew up");
        Ok(())
    });
    let pipeline = PipelineBuilder::new()
        .cmdline(["sleep", "30"])
        .handle_stderr(&stderr)
        .launch(&executor)
        .await
        .unwrap();

    let failure = tokio::time::timeout(PATIENCE, stderr.result())
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(failure, TaskError::Panicked { .. }));
    assert!(failure.to_string().contains("handler blew up"));
    tokio::time::timeout(PATIENCE, pipeline.wait_all())
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_handler_sees_its_pipeline_and_slot() {
    let executor = executor();
    let stdout: ReadProcessor<(Slot, usize, String)> = StreamProcessor::read(|ctx| async move {
        let (pipeline, slot, mut stream) = ctx.into_parts();
        let mut text = String::new();
        stream.read_to_string(&mut text).await?;
        Ok((slot, pipeline.len(), text))
    });
    let pipeline = PipelineBuilder::new()
        .cmdline(["echo", "one"])
        .pipe(["cat"])
        .handle_stdout(&stdout)
        .launch(&executor)
        .await
        .unwrap();
    pipeline.wait_all().await.unwrap();
    let (slot, stages, text) = stdout.result().await.unwrap();
    assert_eq!(slot, Slot::Stdout);
    assert_eq!(stages, 2);
    assert_eq!(text, "one\n");
}

#[tokio::test]
async fn test_reused_processor_is_rejected_before_spawn() {
    let executor = executor();
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("spawned");
    let stdout = capture::collect_string();

    let first = PipelineBuilder::new()
        .cmdline(["echo", "first"])
        .handle_stdout(&stdout)
        .launch(&executor)
        .await
        .unwrap();
    first.wait_all().await.unwrap();
    assert!(stdout.is_used());

    let err = PipelineBuilder::new()
        .cmdline(["touch", marker.to_str().unwrap()])
        .handle_stdout(&stdout)
        .launch(&executor)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Reuse { slot: Slot::Stdout }));
    assert!(err.to_string().contains("already been used"));
    assert!(!marker.exists());

    // The first run's outcome is untouched.
    assert_eq!(stdout.result().await.unwrap(), "first\n");
}

#[tokio::test]
async fn test_reuse_on_one_slot_fails_the_other_bound_cells() {
    let executor = executor();
    let used = capture::collect_string();
    PipelineBuilder::new()
        .cmdline(["true"])
        .handle_stdout(&used)
        .launch(&executor)
        .await
        .unwrap()
        .wait_all()
        .await
        .unwrap();

    let fresh = capture::collect_string();
    let err = PipelineBuilder::new()
        .cmdline(["true"])
        .handle_stdout(&used)
        .handle_stderr(&fresh)
        .launch(&executor)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Reuse { .. }));
    assert!(matches!(
        fresh.result().await.unwrap_err(),
        TaskError::LaunchFailed { .. }
    ));
}

#[tokio::test]
async fn test_spawn_failure_fails_every_bound_cell() {
    let executor = executor();
    let stdin: WriteProcessor<()> = capture::feed("ignored");
    let stdout = capture::collect_string();
    let err = PipelineBuilder::new()
        .cmdline(["sleep", "30"])
        .pipe(["/nonexistent/cmdpipe-test-program"])
        .handle_stdin(&stdin)
        .handle_stdout(&stdout)
        .launch(&executor)
        .await
        .unwrap_err();

    match &err {
        Error::Spawn { stage, program, .. } => {
            assert_eq!(*stage, 1);
            assert!(program.contains("cmdpipe-test-program"));
        }
        other => panic!("unexpected error: {other}"),
    }
    for failure in [
        stdin.result().await.unwrap_err(),
        stdout.result().await.map(|_| ()).unwrap_err(),
    ] {
        assert!(matches!(failure, TaskError::LaunchFailed { .. }));
        assert!(failure.to_string().starts_with("command launch failed"));
    }
}

#[tokio::test]
async fn test_missing_command_is_a_config_error() {
    let executor = executor();
    let stdout = capture::collect_string();
    let err = PipelineBuilder::new()
        .handle_stdout(&stdout)
        .launch(&executor)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Config(_)));
    assert!(err.to_string().contains("cmdline not set"));
    assert!(matches!(
        stdout.result().await.unwrap_err(),
        TaskError::LaunchFailed { .. }
    ));

    let err = PipelineBuilder::new()
        .cmdline(Vec::<String>::new())
        .launch(&executor)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

#[tokio::test]
async fn test_forced_stop_unblocks_reader_held_by_stray_process() {
    let executor = executor();
    // The double fork leaves a `sleep` outside the process tree that keeps
    // the stdout pipe open after the stage itself is killed.
    let stdout = capture::collect_bytes();
    let pipeline = PipelineBuilder::new()
        .cmdline(["sh", "-c", "(sleep 5 &); sleep 30"])
        .handle_stdout(&stdout)
        .launch(&executor)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!stdout.outcome().is_complete());

    pipeline.stop_all(true);
    tokio::time::timeout(Duration::from_secs(3), pipeline.wait_all())
        .await
        .unwrap()
        .unwrap();
    let failure = tokio::time::timeout(Duration::from_secs(3), stdout.result())
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(failure, TaskError::Handler { slot: Slot::Stdout, .. }));
}

#[tokio::test]
async fn test_handlers_queue_on_small_executor() {
    // One permit: stdout and stderr handlers must run one after the other
    // without deadlocking.
    let executor = TaskExecutor::current(1).unwrap();
    let stdout = capture::collect_string();
    let stderr = capture::collect_string();
    let pipeline = PipelineBuilder::new()
        .cmdline(["sh", "-c", "echo out; echo err >&2"])
        .handle_stdout(&stdout)
        .handle_stderr(&stderr)
        .launch(&executor)
        .await
        .unwrap();
    tokio::time::timeout(PATIENCE, pipeline.wait_all())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stdout.result().await.unwrap(), "out\n");
    assert_eq!(stderr.result().await.unwrap(), "err\n");
}
