#![allow(clippy::unwrap_used, clippy::panic)] // Integration tests use unwrap for brevity
#![cfg(unix)]

//! Timeout supervisor, execute-permission remediation and the
//! run-to-completion facade.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use cmdpipe::{
    Cmdline, Error, ExecuteError, PipelineBuilder, ReadProcessor, Slot, StreamProcessor,
    TaskError, TaskExecutor, capture, stage,
};

const PATIENCE: Duration = Duration::from_secs(10);

fn executor() -> TaskExecutor {
    TaskExecutor::current(8).unwrap()
}

/// Scratch directory under the target dir; `/tmp` may be mounted noexec.
fn scratch() -> tempfile::TempDir {
    tempfile::Builder::new()
        .prefix("cmdpipe-")
        .tempdir_in(env!("CARGO_TARGET_TMPDIR"))
        .unwrap()
}

fn write_script(dir: &Path, name: &str, body: &str, mode: u32) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).unwrap();
    path
}

fn mode(path: &Path) -> u32 {
    std::fs::metadata(path).unwrap().permissions().mode() & 0o777
}

/// Pids of live processes whose argv is exactly `argv`.
#[cfg(target_os = "linux")]
fn processes_running(argv: &[&str]) -> Vec<u32> {
    let wanted: Vec<u8> = argv
        .iter()
        .flat_map(|a| a.bytes().chain(std::iter::once(0)))
        .collect();
    std::fs::read_dir("/proc")
        .unwrap()
        .filter_map(Result::ok)
        .filter_map(|e| e.file_name().to_str()?.parse::<u32>().ok())
        .filter(|pid| std::fs::read(format!("/proc/{pid}/cmdline")).is_ok_and(|c| c == wanted))
        .collect()
}

// Supervisor

#[tokio::test]
async fn test_supervisor_kills_on_timeout() {
    let executor = executor();
    let pipeline = PipelineBuilder::new()
        .cmdline(["sleep", "30"])
        .pipe(["cat"])
        .launch(&executor)
        .await
        .unwrap();

    let cell = pipeline.background_timeout_kill(Duration::from_millis(100));
    let again = pipeline.background_timeout_kill(Duration::from_secs(60));
    assert!(cell.ptr_eq(&again));

    let in_time = tokio::time::timeout(PATIENCE, cell.outcome())
        .await
        .unwrap()
        .unwrap();
    assert!(!in_time);
    let status = tokio::time::timeout(PATIENCE, pipeline.wait_all())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stage::exit_code(status), 128 + libc::SIGTERM);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_supervisor_starts_share_one_cell() {
    let executor = executor();
    let pipeline = PipelineBuilder::new()
        .cmdline(["sleep", "30"])
        .launch(&executor)
        .await
        .unwrap();

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let p = pipeline.clone();
        tasks.push(tokio::spawn(async move {
            p.background_timeout_kill(Duration::from_millis(50))
        }));
    }
    let mut cells = Vec::new();
    for task in tasks {
        cells.push(task.await.unwrap());
    }
    assert!(cells.iter().all(|c| c.ptr_eq(&cells[0])));
    assert!(!cells[0].outcome().await.unwrap());
    tokio::time::timeout(PATIENCE, pipeline.wait_all())
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_supervisor_reports_finished_in_time() {
    let executor = executor();
    let pipeline = PipelineBuilder::new()
        .cmdline(["true"])
        .pipe(["cat"])
        .launch(&executor)
        .await
        .unwrap();
    let cell = pipeline.background_timeout_kill(PATIENCE);
    assert!(cell.outcome().await.unwrap());
    assert!(pipeline.wait_all().await.unwrap().success());
}

#[tokio::test]
async fn test_supervisor_escalates_when_term_is_ignored() {
    let executor = executor();
    let pipeline = PipelineBuilder::new()
        .cmdline(["sh", "-c", "trap '' TERM; sleep 30"])
        .kill_grace(Duration::from_millis(200))
        .launch(&executor)
        .await
        .unwrap();

    let cell = pipeline.background_timeout_kill(Duration::from_millis(300));
    assert!(!cell.outcome().await.unwrap());
    let status = tokio::time::timeout(PATIENCE, pipeline.wait_all())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stage::exit_code(status), 128 + libc::SIGKILL);
}

#[tokio::test]
async fn test_supervisor_runs_when_handlers_hold_every_permit() {
    let executor = TaskExecutor::current(2).unwrap();
    let stdout = capture::collect_bytes();
    let stderr = capture::collect_string();
    let pipeline = PipelineBuilder::new()
        .cmdline(["sleep", "30"])
        .handle_stdout(&stdout)
        .handle_stderr(&stderr)
        .launch(&executor)
        .await
        .unwrap();

    let started = std::time::Instant::now();
    let cell = pipeline.background_timeout_kill(Duration::from_millis(100));
    let in_time = tokio::time::timeout(PATIENCE, cell.outcome())
        .await
        .unwrap()
        .unwrap();
    assert!(!in_time);
    assert!(started.elapsed() < Duration::from_secs(5));
    tokio::time::timeout(PATIENCE, pipeline.wait_all())
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_supervisor_on_closed_executor_fails_its_cell() {
    let executor = executor();
    let pipeline = PipelineBuilder::new()
        .cmdline(["sleep", "30"])
        .launch(&executor)
        .await
        .unwrap();
    executor.shutdown();
    let cell = pipeline.background_timeout_kill(Duration::from_millis(10));
    assert!(matches!(
        cell.outcome().await.unwrap_err(),
        TaskError::ExecutorClosed
    ));
    pipeline.stop_all(true);
    pipeline.wait_all().await.unwrap();
}

// Remediation

#[tokio::test]
async fn test_remediation_grants_middle_stage_and_retries() {
    let executor = executor();
    let dir = scratch();
    let upper = write_script(dir.path(), "upper.sh", "tr a-z A-Z", 0o644);
    let stdout = capture::collect_string();

    let pipeline = PipelineBuilder::new()
        .cmdline(["echo", "hello"])
        .pipe([upper.as_os_str()])
        .pipe(["cat"])
        .auto_grant_executable(true)
        .handle_stdout(&stdout)
        .launch(&executor)
        .await
        .unwrap();
    assert!(pipeline.wait_all().await.unwrap().success());
    assert_eq!(stdout.result().await.unwrap(), "HELLO\n");
    assert_eq!(mode(&upper), 0o744);
}

#[tokio::test]
async fn test_permission_denied_without_remediation_propagates() {
    let executor = executor();
    let dir = scratch();
    let script = write_script(dir.path(), "plain.sh", "cat", 0o644);
    let stdout = capture::collect_string();

    let err = PipelineBuilder::new()
        .cmdline(["sleep", "30"])
        .pipe([script.as_os_str()])
        .handle_stdout(&stdout)
        .launch(&executor)
        .await
        .unwrap_err();
    match &err {
        Error::Spawn { stage, source, .. } => {
            assert_eq!(*stage, 1);
            assert_eq!(source.raw_os_error(), Some(libc::EACCES));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(mode(&script), 0o644);
    assert!(matches!(
        stdout.result().await.unwrap_err(),
        TaskError::LaunchFailed { .. }
    ));
}

#[tokio::test]
async fn test_remediation_retries_only_once() {
    let executor = executor();
    let dir = scratch();
    // Fixable permissions, but the interpreter does not exist, so the retry
    // fails too and that failure is reported.
    let script = dir.path().join("broken.sh");
    std::fs::write(&script, "#!/nonexistent/interpreter\n").unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o600)).unwrap();

    let err = tokio::time::timeout(
        PATIENCE,
        PipelineBuilder::new()
            .cmdline(["sleep", "31.7"])
            .pipe([script.as_os_str()])
            .pipe(["cat"])
            .auto_grant_executable(true)
            .launch(&executor),
    )
    .await
    .unwrap()
    .unwrap_err();
    match &err {
        Error::Spawn { stage, source, .. } => {
            assert_eq!(*stage, 1);
            assert_ne!(source.raw_os_error(), Some(libc::EACCES));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(mode(&script), 0o700);
    // Both attempts started stage 0; both were killed and reaped.
    #[cfg(target_os = "linux")]
    assert!(processes_running(&["sleep", "31.7"]).is_empty());
}

// Execution facade

#[tokio::test]
async fn test_execute_reports_output_and_stderr_snapshot() {
    let executor = executor();
    let result = Cmdline::new(["sh", "-c", "echo out; echo problem >&2; exit 2"])
        .env("UNUSED", "1")
        .capture_stdout()
        .execute(&executor)
        .await
        .unwrap();
    assert_eq!(result.stdout.as_deref(), Some("out\n"));
    assert_eq!(result.cmdline.stages.len(), 1);
    assert_eq!(result.cmdline.command_line(), result.info.command_line);
    assert_eq!(result.info.exit_code, 2);
    assert!(!result.info.timed_out);
    assert_eq!(result.info.stderr_snapshot.as_deref(), Some("problem"));
    assert!(result.info.pid.is_some());
    assert!(result.info.ended_at >= result.info.started_at);
    assert!(result.info.to_string().contains("exit code: 2"));
}

#[tokio::test]
async fn test_execute_pipes_stdin_through_stages() {
    let executor = executor();
    let result = Cmdline::new(["tr", "a-z", "A-Z"])
        .pipe(["wc", "-c"])
        .stdin_bytes("abc")
        .capture_stdout()
        .execute(&executor)
        .await
        .unwrap();
    assert_eq!(result.stdout.unwrap().trim(), "3");
    assert!(result.status.success());
}

#[tokio::test]
async fn test_execute_timeout_attaches_report() {
    let executor = executor();
    let err = Cmdline::new(["sleep", "30"])
        .timeout(Duration::from_millis(100))
        .execute(&executor)
        .await
        .unwrap_err();
    match &err {
        ExecuteError::Timeout { timeout, info, .. } => {
            assert_eq!(*timeout, Duration::from_millis(100));
            assert!(info.timed_out);
            assert!(info.elapsed < PATIENCE);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.info().is_some());
}

#[tokio::test]
async fn test_execute_timeout_with_every_permit_held() {
    let executor = TaskExecutor::current(2).unwrap();
    let started = std::time::Instant::now();
    let err = tokio::time::timeout(
        PATIENCE,
        Cmdline::new(["sleep", "30"])
            .timeout(Duration::from_millis(100))
            .capture_stdout()
            .execute(&executor),
    )
    .await
    .unwrap()
    .unwrap_err();
    assert!(matches!(err, ExecuteError::Timeout { .. }));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_execute_feeds_stdin_on_small_executor() {
    // Writer, reader and stderr snapshot share two permits.
    let executor = TaskExecutor::current(2).unwrap();
    let result = tokio::time::timeout(
        PATIENCE,
        Cmdline::new(["cat"])
            .stdin_bytes("abc")
            .capture_stdout()
            .execute(&executor),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(result.stdout.as_deref(), Some("abc"));
    assert!(result.status.success());
}

#[tokio::test]
async fn test_execute_handler_failure_names_slot() {
    let executor = executor();
    let stdout: ReadProcessor<()> =
        StreamProcessor::read(|_ctx| async { Err(anyhow::anyhow!("parse error")) });
    let err = Cmdline::new(["sleep", "30"])
        .handle_stdout(stdout)
        .execute(&executor)
        .await
        .unwrap_err();
    match &err {
        ExecuteError::Handler { first, failures, .. } => {
            assert!(matches!(first, TaskError::Handler { slot: Slot::Stdout, .. }));
            assert!(failures.stdout.is_some());
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.to_string().contains("parse error"));
}

#[tokio::test]
async fn test_execute_launch_failure() {
    let executor = executor();
    let err = Cmdline::new(["/nonexistent/cmdpipe-program"])
        .execute(&executor)
        .await
        .unwrap_err();
    assert!(matches!(err, ExecuteError::Launch(Error::Spawn { .. })));
    assert!(err.info().is_none());
}
