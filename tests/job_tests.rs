//! Tests for starting, reaping and cancelling worker processes.


use std::time::{Duration, Instant};

use tempfile::TempDir;

use lab_agent::config::TlsConfig;
use lab_agent::jobs::manager::MAX_ERROR_REPORT_LEN;
use lab_agent::jobs::{FinishedJob, JobManager, JobState, WorkerCerts};
use test_harness::{job_config, reap_until_finished, start_request, wait_for_file, write_worker};

fn manager_with_worker(dir: &TempDir, body: &str) -> JobManager {
    let worker = write_worker(dir.path(), "worker.sh", body);
    JobManager::new(job_config(dir.path(), worker))
}

#[tokio::test]
async fn test_start_writes_job_files_and_passes_arguments() {
    let dir = TempDir::new().unwrap();
    let mut manager = manager_with_worker(
        &dir,
        "printf '%s\\n' \"$@\" > args.txt\npwd > cwd.txt\nexec sleep 30",
    );

    let mut request = start_request(1, "");
    request.env_dut = Some("DUT_SERIAL: abc\n".to_string());
    manager.start(&request).await;

    assert_eq!(manager.state(1), Some(JobState::Running));
    let job_dir = manager.job_dir(1);
    assert!(manager.registry().get(1).unwrap().pid().is_some());

    assert_eq!(
        std::fs::read_to_string(job_dir.join("job.yaml")).unwrap(),
        "job_name: test-1\n"
    );
    assert_eq!(
        std::fs::read_to_string(job_dir.join("device.yaml")).unwrap(),
        "hostname: qemu01\n"
    );
    assert_eq!(
        std::fs::read_to_string(job_dir.join("env.dut.yaml")).unwrap(),
        "DUT_SERIAL: abc\n"
    );

    wait_for_file(&job_dir.join("cwd.txt")).await;
    wait_for_file(&job_dir.join("args.txt")).await;
    // Give the shell a moment to finish writing both files
    tokio::time::sleep(Duration::from_millis(100)).await;

    let dir_str = job_dir.display().to_string();
    let expected = vec![
        "--target".to_string(),
        format!("{dir_str}/device.yaml"),
        format!("{dir_str}/job.yaml"),
        "--output-dir".to_string(),
        format!("{dir_str}/logs"),
        "--job-id".to_string(),
        "1".to_string(),
        "--socket-addr".to_string(),
        "tcp://localhost:5555".to_string(),
        "--env-dut-path".to_string(),
        format!("{dir_str}/env.dut.yaml"),
    ];
    let args = std::fs::read_to_string(job_dir.join("args.txt")).unwrap();
    assert_eq!(args.lines().collect::<Vec<_>>(), expected);

    let cwd = std::fs::read_to_string(job_dir.join("cwd.txt")).unwrap();
    assert_eq!(
        std::fs::canonicalize(cwd.trim()).unwrap(),
        std::fs::canonicalize(&job_dir).unwrap()
    );

    manager.cancel(1).await;
    assert_eq!(manager.state(1), Some(JobState::Ended));
}

#[tokio::test]
async fn test_tls_certificates_are_passed_to_worker() {
    let dir = TempDir::new().unwrap();
    let worker = write_worker(dir.path(), "worker.sh", "printf '%s\\n' \"$@\" > args.txt");
    let tls = TlsConfig {
        enabled: true,
        ca_cert_path: Some(dir.path().join("coordinator.pem")),
        cert_path: Some(dir.path().join("agent.pem")),
        key_path: Some(dir.path().join("agent.key")),
        server_name: None,
    };
    let mut manager = JobManager::new(job_config(dir.path(), worker))
        .with_certs(WorkerCerts::from_tls(&tls));

    manager.start(&start_request(2, "")).await;
    reap_until_finished(&mut manager).await;

    let args = std::fs::read_to_string(manager.job_dir(2).join("args.txt")).unwrap();
    let args: Vec<&str> = args.lines().collect();
    let ca = dir.path().join("coordinator.pem").display().to_string();
    let cert = dir.path().join("agent.pem").display().to_string();
    assert_eq!(
        args[args.len() - 4..],
        ["--master-cert", ca.as_str(), "--slave-cert", cert.as_str()]
    );
    assert!(!args.contains(&"--env-dut-path"));
}

#[tokio::test]
async fn test_purged_environment_only_has_overrides() {
    let dir = TempDir::new().unwrap();
    let mut manager = manager_with_worker(&dir, "env > env.txt");

    let env = "purge: true\noverrides:\n  PATH: /usr/bin:/bin\n  LAB_MARKER: 7\n";
    manager.start(&start_request(2, env)).await;

    let finished = reap_until_finished(&mut manager).await;
    assert_eq!(
        finished,
        vec![FinishedJob {
            id: 2,
            exit_status: 0,
            error: None,
        }]
    );

    let dumped = std::fs::read_to_string(manager.job_dir(2).join("env.txt")).unwrap();
    let lines: Vec<&str> = dumped.lines().collect();
    assert!(lines.contains(&"PATH=/usr/bin:/bin"));
    assert!(lines.contains(&"LAB_MARKER=7"));
    assert!(!lines.iter().any(|line| line.starts_with("HOME=")));
}

#[tokio::test]
async fn test_inherited_environment_applies_removals() {
    let dir = TempDir::new().unwrap();
    let mut manager = manager_with_worker(&dir, "env > env.txt");

    manager
        .start(&start_request(3, "removes: [HOME]\noverrides: {LAB_MARKER: enabled}\n"))
        .await;
    reap_until_finished(&mut manager).await;

    let dumped = std::fs::read_to_string(manager.job_dir(3).join("env.txt")).unwrap();
    assert!(dumped.lines().any(|line| line == "LAB_MARKER=enabled"));
    assert!(!dumped.lines().any(|line| line.starts_with("HOME=")));
}

#[tokio::test]
async fn test_missing_worker_ends_job_with_error_file() {
    let dir = TempDir::new().unwrap();
    let mut manager = JobManager::new(job_config(
        dir.path(),
        dir.path().join("no-such-worker"),
    ));

    manager.start(&start_request(4, "")).await;

    let job = manager.registry().get(4).expect("failed job must stay registered");
    assert_eq!(job.state, JobState::Ended);
    assert_eq!(job.exit_status, None);
    assert_eq!(job.reported_status(), 0);
    assert!(job.ended_at.is_some());

    let err = std::fs::read_to_string(job.err_path()).unwrap();
    assert!(err.contains("Cannot run worker"), "err file: {err}");
    assert!(err.contains("caused by"), "err file: {err}");

    // Ended jobs are not reported again by the reaper
    assert!(manager.reap_finished().is_empty());
}

#[tokio::test]
async fn test_invalid_environment_ends_job() {
    let dir = TempDir::new().unwrap();
    let mut manager = manager_with_worker(&dir, "exit 0");

    manager
        .start(&start_request(5, "overrides:\n  LIST: [1, 2]\n"))
        .await;

    assert_eq!(manager.state(5), Some(JobState::Ended));
    let err = std::fs::read_to_string(manager.job_dir(5).join("err")).unwrap();
    assert!(err.contains("LIST"), "err file: {err}");
}

#[tokio::test]
async fn test_reap_reports_exit_status_and_errors() {
    let dir = TempDir::new().unwrap();
    let mut manager = manager_with_worker(&dir, "echo boom >&2\nexit 3");

    manager.start(&start_request(6, "")).await;
    let finished = reap_until_finished(&mut manager).await;

    assert_eq!(
        finished,
        vec![FinishedJob {
            id: 6,
            exit_status: 3,
            error: Some("boom\n".to_string()),
        }]
    );
    let job = manager.registry().get(6).unwrap();
    assert_eq!(job.state, JobState::Ended);
    assert_eq!(job.reported_status(), 3);
    assert!(job.pid().is_none());

    // Reported exactly once
    assert!(manager.reap_finished().is_empty());
}

#[tokio::test]
async fn test_large_error_file_is_reported_by_its_tail() {
    let dir = TempDir::new().unwrap();
    let mut manager = manager_with_worker(
        &dir,
        "head -c 1500000 /dev/zero | tr '\\0' x >&2\nprintf tail-marker >&2\nexit 2",
    );

    manager.start(&start_request(9, "")).await;
    let finished = reap_until_finished(&mut manager).await;

    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].exit_status, 2);
    let error = finished[0].error.as_deref().unwrap();
    assert_eq!(error.len(), MAX_ERROR_REPORT_LEN);
    assert!(error.ends_with("xxtail-marker"));
}

#[tokio::test]
async fn test_signal_killed_worker_reports_negative_signal() {
    let dir = TempDir::new().unwrap();
    let mut manager = manager_with_worker(&dir, "kill -9 $$");

    manager.start(&start_request(7, "")).await;
    let finished = reap_until_finished(&mut manager).await;

    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].exit_status, -9);
}

#[tokio::test]
async fn test_cancel_stops_running_worker() {
    let dir = TempDir::new().unwrap();
    let mut manager = manager_with_worker(&dir, "exec sleep 30");

    manager.start(&start_request(8, "")).await;
    assert_eq!(manager.state(8), Some(JobState::Running));

    let started = Instant::now();
    manager.cancel(8).await;
    assert!(started.elapsed() < Duration::from_secs(2));

    let job = manager.registry().get(8).unwrap();
    assert_eq!(job.state, JobState::Ended);
    assert_eq!(job.exit_status, None);
    assert!(job.pid().is_none());
    assert!(manager.reap_finished().is_empty());
}

#[tokio::test]
async fn test_cancel_kills_worker_ignoring_sigterm() {
    let dir = TempDir::new().unwrap();
    let worker = write_worker(
        dir.path(),
        "stubborn.sh",
        "trap '' TERM\ntouch ready\nwhile :; do sleep 1; done",
    );
    let mut config = job_config(dir.path(), worker);
    config.cancel_grace = Duration::from_millis(300);
    let mut manager = JobManager::new(config);

    manager.start(&start_request(9, "")).await;
    wait_for_file(&manager.job_dir(9).join("ready")).await;

    let started = Instant::now();
    manager.cancel(9).await;
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_millis(300), "killed too early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(5), "kill took {elapsed:?}");
    assert_eq!(manager.state(9), Some(JobState::Ended));
}

#[tokio::test]
async fn test_cancel_unknown_job_is_noop() {
    let dir = TempDir::new().unwrap();
    let mut manager = manager_with_worker(&dir, "exit 0");

    manager.cancel(99).await;
    assert!(manager.registry().is_empty());
}
