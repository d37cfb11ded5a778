use std::time::Duration;

use runcell::runner::{CancelSignal, ErrorKind, ExecuteError, execute};
use runcell::types::ExecutionStatus;

use super::mock::{Behavior, Failures, MockBackend};
use super::{cgroup_leftovers, exec_in, test_config};

#[tokio::test(start_paused = true)]
async fn test_deadline_is_three_times_time_limit() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MockBackend::new(Behavior::Hang);
    let exec = exec_in(dir.path(), &["sleep", "60"]).with_time_limit(100);

    let report = execute(&backend, &test_config(), &exec, CancelSignal::never())
        .await
        .expect("a killed process still yields a report");

    assert!(report.wall_time_limit_exceeded);
    assert_eq!(report.status, ExecutionStatus::WallTimeLimitExceeded);
    assert_eq!(report.signal, Some(libc::SIGKILL));
    assert_eq!(report.wall_time_ms, 300);
    assert_eq!(backend.kills(), 1);
    assert!(cgroup_leftovers(dir.path()).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_default_deadline_without_time_limit() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MockBackend::new(Behavior::Hang);
    let exec = exec_in(dir.path(), &["sleep", "infinity"]);

    let report = execute(&backend, &test_config(), &exec, CancelSignal::never())
        .await
        .unwrap();

    assert!(report.wall_time_limit_exceeded);
    assert_eq!(report.wall_time_ms, 10 * 60 * 1000);
}

#[tokio::test(start_paused = true)]
async fn test_custom_multiplier() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config();
    config.safety_net_multiplier = 5;
    let backend = MockBackend::new(Behavior::Hang);
    let exec = exec_in(dir.path(), &["sleep", "60"]).with_time_limit(200);

    let report = execute(&backend, &config, &exec, CancelSignal::never())
        .await
        .unwrap();

    assert!(report.wall_time_limit_exceeded);
    assert_eq!(report.wall_time_ms, 1000);
}

#[tokio::test(start_paused = true)]
async fn test_exit_before_deadline_is_not_flagged() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MockBackend::new(Behavior::ExitAfter(Duration::from_millis(250), 0));
    let exec = exec_in(dir.path(), &["sleep", "0.25"]).with_time_limit(100);

    let report = execute(&backend, &test_config(), &exec, CancelSignal::never())
        .await
        .unwrap();

    assert!(!report.wall_time_limit_exceeded);
    assert_eq!(report.exit_code, Some(0));
    assert_eq!(report.wall_time_ms, 250);
    assert_eq!(backend.kills(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_failed_kill_aborts_with_signal_error() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MockBackend::failing(
        Behavior::Hang,
        Failures {
            signal: true,
            ..Default::default()
        },
    );
    let exec = exec_in(dir.path(), &["sleep", "60"]).with_time_limit(100);

    let err = execute(&backend, &test_config(), &exec, CancelSignal::never())
        .await
        .unwrap_err();

    assert!(matches!(err, ExecuteError::Signal(_)));
    assert_eq!(err.kind(), ErrorKind::Launch);
    assert!(cgroup_leftovers(dir.path()).is_empty());
}
