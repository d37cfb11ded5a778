//! Teardown on every exit path

use runcell::container::{CgroupPaths, remove_path};
use runcell::runner::{CancelSignal, ErrorKind, ExecuteError, execute};
use runcell::types::FdConfig;

use super::mock::{Behavior, Failures, MockBackend};
use super::{cgroup_leftovers, exec_in, test_config};

#[tokio::test]
async fn test_create_failure_releases_cgroup() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MockBackend::failing(
        Behavior::Exit(0),
        Failures {
            create: true,
            ..Default::default()
        },
    );
    let exec = exec_in(dir.path(), &["true"]);

    let err = execute(&backend, &test_config(), &exec, CancelSignal::never())
        .await
        .unwrap_err();

    assert!(matches!(err, ExecuteError::Create(_)));
    assert_eq!(err.kind(), ErrorKind::Setup);
    // Nothing to destroy when the container never existed
    assert_eq!(backend.call_names(), vec!["create"]);
    assert!(cgroup_leftovers(dir.path()).is_empty());
}

#[tokio::test]
async fn test_stdio_failure_destroys_container() {
    let dir = tempfile::tempdir().unwrap();
    let cgroups = dir.path().join("cgroups");
    let backend = MockBackend::new(Behavior::Exit(0));
    let exec = exec_in(&cgroups, &["cat"]).with_fd(FdConfig {
        stdin: Some(dir.path().join("missing-input.txt")),
        ..Default::default()
    });

    let err = execute(&backend, &test_config(), &exec, CancelSignal::never())
        .await
        .unwrap_err();

    assert!(matches!(err, ExecuteError::Stdio(_)));
    assert_eq!(err.kind(), ErrorKind::Setup);
    assert_eq!(backend.call_names(), vec!["create", "destroy"]);
    assert!(cgroup_leftovers(&cgroups).is_empty());
}

#[tokio::test]
async fn test_launch_failure_destroys_container() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MockBackend::failing(
        Behavior::Exit(0),
        Failures {
            run: true,
            ..Default::default()
        },
    );
    let exec = exec_in(dir.path(), &["./missing-binary"]);

    let err = execute(&backend, &test_config(), &exec, CancelSignal::never())
        .await
        .unwrap_err();

    assert!(matches!(err, ExecuteError::Launch(_)));
    assert_eq!(err.kind(), ErrorKind::Launch);
    assert_eq!(backend.call_names(), vec!["create", "run", "destroy"]);
    assert!(cgroup_leftovers(dir.path()).is_empty());
}

#[tokio::test]
async fn test_wait_failure_is_distinct_error() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MockBackend::failing(
        Behavior::Exit(0),
        Failures {
            wait: true,
            ..Default::default()
        },
    );
    let exec = exec_in(dir.path(), &["true"]);

    let err = execute(&backend, &test_config(), &exec, CancelSignal::never())
        .await
        .unwrap_err();

    assert!(matches!(err, ExecuteError::Wait(_)));
    assert_eq!(err.kind(), ErrorKind::Launch);
    assert_eq!(backend.call_names(), vec!["create", "run", "wait", "destroy"]);
    assert!(cgroup_leftovers(dir.path()).is_empty());
}

#[tokio::test]
async fn test_stats_failure_is_report_resolution_error() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MockBackend::failing(
        Behavior::Exit(0),
        Failures {
            stats: true,
            ..Default::default()
        },
    );
    let exec = exec_in(dir.path(), &["true"]);

    let err = execute(&backend, &test_config(), &exec, CancelSignal::never())
        .await
        .unwrap_err();

    assert!(matches!(err, ExecuteError::Stats(_)));
    assert_eq!(err.kind(), ErrorKind::ReportResolution);
    assert_eq!(
        backend.call_names(),
        vec!["create", "run", "wait", "stats", "destroy"]
    );
    assert!(cgroup_leftovers(dir.path()).is_empty());
}

#[tokio::test]
async fn test_destroy_failure_still_returns_report() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MockBackend::failing(
        Behavior::Exit(0),
        Failures {
            destroy: true,
            ..Default::default()
        },
    );
    let exec = exec_in(dir.path(), &["true"]);

    let report = execute(&backend, &test_config(), &exec, CancelSignal::never())
        .await
        .expect("cleanup failures must not fail the run");

    assert!(report.is_success());
    assert!(cgroup_leftovers(dir.path()).is_empty());
}

#[tokio::test]
async fn test_every_failure_leaves_no_cgroup() {
    let cases = [
        Failures {
            create: true,
            ..Default::default()
        },
        Failures {
            run: true,
            ..Default::default()
        },
        Failures {
            wait: true,
            ..Default::default()
        },
        Failures {
            stats: true,
            ..Default::default()
        },
        Failures {
            destroy: true,
            ..Default::default()
        },
    ];

    for failures in cases {
        let dir = tempfile::tempdir().unwrap();
        let backend = MockBackend::failing(Behavior::Exit(0), failures);
        let exec = exec_in(dir.path(), &["true"]);

        let _ = execute(&backend, &test_config(), &exec, CancelSignal::never()).await;
        assert!(
            cgroup_leftovers(dir.path()).is_empty(),
            "cgroup left behind with {failures:?}"
        );
    }
}

#[tokio::test]
async fn test_double_removal_is_harmless() {
    let dir = tempfile::tempdir().unwrap();
    let paths = CgroupPaths::resolve(dir.path(), true, "runcell-cleanup-0")
        .await
        .unwrap();
    std::fs::create_dir_all(paths.leaf()).unwrap();
    let leaf = paths.leaf().to_path_buf();
    let parent = paths.parent().unwrap().to_path_buf();

    paths.release().await;
    remove_path(&leaf).await.unwrap();
    remove_path(&parent).await.unwrap();
    assert!(cgroup_leftovers(dir.path()).is_empty());
}

#[test]
fn test_dropped_future_removes_cgroup() {
    let dir = tempfile::tempdir().unwrap();
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    let backend = MockBackend::new(Behavior::Hang);
    let exec = exec_in(dir.path(), &["sleep", "infinity"]);
    let config = test_config();

    rt.block_on(async {
        let run = execute(&backend, &config, &exec, CancelSignal::never());
        // Abandon the run while the process is still going
        let _ = tokio::time::timeout(std::time::Duration::from_millis(50), run).await;
    });

    assert_eq!(backend.kills(), 0);
    assert!(cgroup_leftovers(dir.path()).is_empty());
}
