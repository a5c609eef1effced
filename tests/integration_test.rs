#![cfg(unix)]

use procdeck::core::shell;
use procdeck::{Config, JobEvent, JobId, JobState, ProcessRecord, Supervisor, SupervisorError};
use std::path::Path;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;

const EXIT_TIMEOUT: Duration = Duration::from_secs(10);

fn supervisor(temp_dir: &TempDir) -> (Supervisor, UnboundedReceiver<JobEvent>) {
    Supervisor::from_config(&Config::for_root(temp_dir.path()))
}

/// Output lines and exit code of `job_id`, skipping other jobs' events
async fn run_to_exit(
    events: &mut UnboundedReceiver<JobEvent>,
    job_id: JobId,
) -> (Vec<String>, Option<i32>) {
    let mut lines = Vec::new();
    let wait = async {
        while let Some(event) = events.recv().await {
            match event {
                JobEvent::Output { job_id: id, line } if id == job_id => lines.push(line),
                JobEvent::Exited { job_id: id, exit_code } if id == job_id => return exit_code,
                _ => {}
            }
        }
        panic!("event stream closed");
    };
    let exit_code = tokio::time::timeout(EXIT_TIMEOUT, wait)
        .await
        .expect("job did not exit in time");
    (lines, exit_code)
}

fn pid_of(supervisor: &Supervisor, job_id: JobId) -> u32 {
    supervisor
        .jobs()
        .into_iter()
        .find(|j| j.job_id == job_id)
        .and_then(|j| j.pid)
        .expect("job is live with a pid")
}

/// Wait for `pid` to die without yielding to the runtime, so the job's own
/// streaming task cannot be the one doing the killing
fn gone_without_yielding(pid: u32) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if !shell::is_process_running(pid) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    false
}

#[tokio::test]
async fn test_start_stop_end_to_end() {
    let temp_dir = TempDir::new().unwrap();
    let (supervisor, mut events) = supervisor(&temp_dir);

    let job = supervisor
        .start(Some("web"), "sleep 5", Some(Path::new("/tmp")))
        .unwrap();
    assert_eq!(job, JobId(1));
    let pid = pid_of(&supervisor, job);
    assert_eq!(supervisor.registry().get("web").unwrap().pid, Some(pid));

    supervisor.stop("web");
    assert_eq!(supervisor.job_state(job), Some(JobState::Killed));

    let (_, exit_code) = run_to_exit(&mut events, job).await;
    assert_eq!(exit_code, Some(-9));
    assert!(!shell::is_process_running(pid));
    assert!(!supervisor.registry().read().contains_key("web"));
    assert!(supervisor.job_for("web").is_none());

    let log = std::fs::read_to_string(supervisor.console_log().path()).unwrap();
    let start = log.find("] JOB 1 START =====").expect("header");
    let exit = log.find("[exit -9]").expect("exit trailer");
    let end = log.find("===== JOB 1 END =====").expect("footer");
    assert!(start < exit && exit < end);
    assert!(log.contains("CWD: /tmp\nCMD: sleep 5\n"));
}

#[tokio::test]
async fn test_natural_exit_streams_output_and_cleans_up() {
    let temp_dir = TempDir::new().unwrap();
    let (supervisor, mut events) = supervisor(&temp_dir);

    let job = supervisor
        .start(Some("greeter"), "echo hello; echo oops >&2", None)
        .unwrap();
    let (lines, exit_code) = run_to_exit(&mut events, job).await;

    assert_eq!(exit_code, Some(0));
    assert!(lines.contains(&"hello".to_string()));
    assert!(lines.contains(&"oops".to_string()));
    assert_eq!(supervisor.job_state(job), Some(JobState::Exited(0)));
    assert!(supervisor.job_for("greeter").is_none());
    assert!(supervisor.registry().read().is_empty());

    let log = std::fs::read_to_string(supervisor.console_log().path()).unwrap();
    assert!(log.contains(&format!("CWD: {}", temp_dir.path().display())));
    assert!(log.contains("hello\n"));
    assert!(log.contains("\n[exit 0]\n===== JOB 1 END =====\n"));
}

#[tokio::test]
async fn test_nonzero_exit_code() {
    let temp_dir = TempDir::new().unwrap();
    let (supervisor, mut events) = supervisor(&temp_dir);

    let job = supervisor.start(None, "exit 3", None).unwrap();
    let (_, exit_code) = run_to_exit(&mut events, job).await;

    assert_eq!(exit_code, Some(3));
    assert_eq!(supervisor.job_state(job), Some(JobState::Exited(3)));
}

#[tokio::test]
async fn test_single_instance_per_name() {
    let temp_dir = TempDir::new().unwrap();
    let (supervisor, _events) = supervisor(&temp_dir);

    let first = supervisor.start(Some("x"), "sleep 30", None).unwrap();
    let second = supervisor.start(Some("x"), "sleep 30", None).unwrap();
    let third = supervisor.start(Some("x"), "sleep 30", None).unwrap();

    let named: Vec<_> = supervisor
        .jobs()
        .into_iter()
        .filter(|j| j.name.as_deref() == Some("x"))
        .collect();
    assert_eq!(named.len(), 1);
    assert_eq!(named[0].job_id, third);
    assert_eq!(supervisor.job_for("x"), Some(third));

    // Earlier instances were told to die before the newest was recorded
    assert_eq!(supervisor.job_state(first), Some(JobState::Killed));
    assert_eq!(supervisor.job_state(second), Some(JobState::Killed));

    supervisor.stop_all();
}

#[tokio::test]
async fn test_stale_exit_does_not_clobber_newer_job() {
    let temp_dir = TempDir::new().unwrap();
    let (supervisor, mut events) = supervisor(&temp_dir);

    let old = supervisor.start(Some("x"), "sleep 30", None).unwrap();
    let new = supervisor.start(Some("x"), "sleep 30", None).unwrap();
    let new_pid = pid_of(&supervisor, new);

    // The old job's exit arrives after the name moved on
    run_to_exit(&mut events, old).await;

    assert_eq!(supervisor.job_for("x"), Some(new));
    assert_eq!(supervisor.job_state(new), Some(JobState::Running));
    assert_eq!(supervisor.registry().get("x").unwrap().pid, Some(new_pid));
    assert!(supervisor.is_alive("x"));

    supervisor.stop("x");
    run_to_exit(&mut events, new).await;
    assert!(!supervisor.is_alive("x"));
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let temp_dir = TempDir::new().unwrap();
    let (supervisor, _events) = supervisor(&temp_dir);

    supervisor.stop("never-started");

    supervisor.start(Some("x"), "sleep 30", None).unwrap();
    supervisor.stop("x");
    let after_first = (supervisor.job_for("x"), supervisor.registry().read());
    supervisor.stop("x");
    let after_second = (supervisor.job_for("x"), supervisor.registry().read());

    assert_eq!(after_first, after_second);
    assert!(after_second.0.is_none());
    assert!(after_second.1.is_empty());
}

#[tokio::test]
async fn test_job_ids_strictly_increase() {
    let temp_dir = TempDir::new().unwrap();
    let (supervisor, _events) = supervisor(&temp_dir);

    let ids = vec![
        supervisor.start(None, "true", None).unwrap(),
        supervisor.start(Some("a"), "sleep 30", None).unwrap(),
        supervisor
            .start(None, "true", Some(Path::new("/definitely/not/here")))
            .unwrap(),
        supervisor.start(Some("a"), "sleep 30", None).unwrap(),
        supervisor.start(Some("b"), "true", None).unwrap(),
    ];

    assert!(ids.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(ids[0], JobId(1));

    supervisor.stop_all();
}

#[tokio::test]
async fn test_spawn_failure_leaves_no_trace() {
    let temp_dir = TempDir::new().unwrap();
    let (supervisor, mut events) = supervisor(&temp_dir);

    let job = supervisor
        .start(Some("broken"), "true", Some(Path::new("/definitely/not/here")))
        .unwrap();

    assert_eq!(supervisor.job_state(job), Some(JobState::Failed));
    assert!(supervisor.job_for("broken").is_none());
    assert!(supervisor.jobs().is_empty());
    assert!(supervisor.registry().read().is_empty());

    match events.try_recv() {
        Ok(JobEvent::Failed { job_id, .. }) => assert_eq!(job_id, job),
        other => panic!("expected failure event, got {:?}", other),
    }

    let log = std::fs::read_to_string(supervisor.console_log().path()).unwrap();
    assert!(log.contains("JOB 1 START"));
    assert!(log.contains("[error]"));
    assert!(log.contains("===== JOB 1 END ====="));
}

#[tokio::test]
async fn test_empty_command_is_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let (supervisor, _events) = supervisor(&temp_dir);

    assert!(matches!(
        supervisor.start(Some("x"), "  ", None),
        Err(SupervisorError::EmptyCommand)
    ));
    // No id was consumed
    assert_eq!(supervisor.start(None, "true", None).unwrap(), JobId(1));
}

#[tokio::test]
async fn test_stop_falls_back_to_registry_pid() {
    let temp_dir = TempDir::new().unwrap();
    let (supervisor, _events) = supervisor(&temp_dir);

    // Started by "an earlier controller": only the registry knows about it
    let mut orphan = tokio::process::Command::new("sleep")
        .arg("30")
        .spawn()
        .unwrap();
    let pid = orphan.id().unwrap();
    supervisor.registry().upsert(
        "orphan",
        ProcessRecord::new(Some(pid), "sleep 30", temp_dir.path(), chrono::Local::now()),
    );
    assert!(supervisor.is_alive("orphan"));

    supervisor.stop("orphan");

    let status = tokio::time::timeout(EXIT_TIMEOUT, orphan.wait())
        .await
        .expect("orphan was not killed")
        .unwrap();
    assert!(!status.success());
    assert!(supervisor.registry().get("orphan").is_none());
}

#[tokio::test]
async fn test_stop_all_kills_named_and_unnamed() {
    let temp_dir = TempDir::new().unwrap();
    let (supervisor, mut events) = supervisor(&temp_dir);

    let named = supervisor.start(Some("svc"), "sleep 30", None).unwrap();
    let adhoc = supervisor.start(None, "sleep 30", None).unwrap();
    let pids = [pid_of(&supervisor, named), pid_of(&supervisor, adhoc)];

    supervisor.stop_all();
    assert!(supervisor.jobs().is_empty());
    assert!(supervisor.registry().read().is_empty());

    let mut pending = vec![named, adhoc];
    let wait = async {
        while let Some(event) = events.recv().await {
            if let JobEvent::Exited { job_id, .. } = event {
                pending.retain(|&id| id != job_id);
                if pending.is_empty() {
                    return;
                }
            }
        }
    };
    tokio::time::timeout(EXIT_TIMEOUT, wait)
        .await
        .expect("jobs did not exit in time");
    assert!(pids.iter().all(|&pid| !shell::is_process_running(pid)));
}

#[tokio::test]
async fn test_restart_and_stop_kill_before_returning() {
    let temp_dir = TempDir::new().unwrap();
    let (supervisor, _events) = supervisor(&temp_dir);

    let old = supervisor.start(Some("x"), "sleep 30", None).unwrap();
    let old_pid = pid_of(&supervisor, old);

    let new = supervisor.start(Some("x"), "sleep 30", None).unwrap();
    assert!(gone_without_yielding(old_pid), "old instance still alive after restart");

    let new_pid = pid_of(&supervisor, new);
    assert!(shell::is_process_running(new_pid));
    supervisor.stop("x");
    assert!(gone_without_yielding(new_pid), "instance still alive after stop");
}

#[tokio::test]
async fn test_invalid_utf8_output_does_not_kill_job() {
    let temp_dir = TempDir::new().unwrap();
    let (supervisor, mut events) = supervisor(&temp_dir);

    let job = supervisor
        .start(
            Some("latin1"),
            r"echo before; printf 'caf\351\n'; sleep 1; echo after",
            None,
        )
        .unwrap();
    let (lines, exit_code) = run_to_exit(&mut events, job).await;

    assert_eq!(exit_code, Some(0));
    assert_eq!(lines, vec!["before", "caf\u{FFFD}", "after"]);

    let log = std::fs::read_to_string(supervisor.console_log().path()).unwrap();
    assert!(log.contains("after\n\n[exit 0]\n"));
}
