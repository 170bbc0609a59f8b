mod common;

use std::{path::Path, time::Duration};

use dray_core::{
    Daemon, WorkerCommand,
    process::{process_alive, shutdown_marker_path},
};

use common::dead_pid;

fn daemon(dir: &Path) -> Daemon {
    Daemon::builder()
        .worker("sleeper", WorkerCommand::new("sleep").arg("30"))
        .pid_file(dir.join("dray.pid").to_string_lossy())
        .lock_file(dir.join("dray.lock"))
        .shutdown_marker_dir(dir)
        .stop_file(dir.join("stop.txt"))
        .stop_poll_interval(Duration::from_millis(50))
        .build()
        .unwrap()
}

fn pid_of(daemon: &Daemon) -> u32 {
    std::fs::read_to_string(daemon.pid_file_for(1))
        .unwrap()
        .trim()
        .parse()
        .unwrap()
}

#[test]
fn start_status_stop_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = daemon(dir.path());

    let started = daemon.start().unwrap();
    assert_eq!(started.code(), 0);
    assert_eq!(started.lines(), ["Worker #1 (sleeper): Starting"]);
    let pid = pid_of(&daemon);
    assert!(process_alive(pid));

    let again = daemon.start().unwrap();
    assert_eq!(again.code(), 2);
    assert!(again.lines().is_empty());

    let status = daemon.status().unwrap();
    assert_eq!(status.code(), 0);
    assert_eq!(status.lines(), ["Worker #1 (sleeper): Running"]);

    let stopped = daemon.stop(false).unwrap();
    assert_eq!(stopped.code(), 0);
    assert_eq!(stopped.lines(), ["Worker (sleeper) #1: Stopping"]);
    assert!(!daemon.pid_file_for(1).exists());
    assert!(!process_alive(pid));

    let stopped = daemon.stop(false).unwrap();
    assert_eq!(stopped.code(), 2);
    assert_eq!(stopped.lines(), ["Worker (sleeper) #1: Already stopped"]);

    let status = daemon.status().unwrap();
    assert_eq!(status.code(), 2);
    assert_eq!(status.lines(), ["Worker #1 (sleeper): Not running"]);
}

#[test]
fn watch_replaces_a_dead_worker() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = daemon(dir.path());
    let dead = dead_pid();
    std::fs::write(daemon.pid_file_for(1), dead.to_string()).unwrap();

    let watched = daemon.watch().unwrap();

    assert_eq!(watched.code(), 0);
    assert_eq!(watched.lines(), ["Worker #1 (sleeper): Starting (stale pid file)"]);
    let pid = pid_of(&daemon);
    assert_ne!(pid, dead);
    assert!(process_alive(pid));

    // Everything is running, nothing to do.
    let watched = daemon.watch().unwrap();
    assert_eq!(watched.code(), 0);
    assert!(watched.lines().is_empty());

    daemon.stop(true).unwrap();
    assert!(!process_alive(pid));
}

#[test]
fn watch_restarts_soft_restarted_worker_silently() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = daemon(dir.path());
    let dead = dead_pid();
    std::fs::write(daemon.pid_file_for(1), dead.to_string()).unwrap();
    let marker = shutdown_marker_path(dir.path(), dead);
    std::fs::write(&marker, b"").unwrap();

    let watched = daemon.watch().unwrap();

    assert_eq!(watched.code(), 0);
    assert!(watched.lines().is_empty());
    assert!(!marker.exists());
    assert!(process_alive(pid_of(&daemon)));

    daemon.stop(true).unwrap();
}

#[test]
fn stop_file_suspends_watch() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = daemon(dir.path());
    std::fs::write(dir.path().join("stop.txt"), b"").unwrap();

    let watched = daemon.watch().unwrap();

    assert_eq!(watched.code(), 0);
    assert!(!daemon.pid_file_for(1).exists());
}

#[test]
fn stale_pid_file_is_cleaned_by_stop() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = daemon(dir.path());
    std::fs::write(daemon.pid_file_for(1), dead_pid().to_string()).unwrap();

    let status = daemon.status().unwrap();
    assert_eq!(status.code(), 2);
    assert_eq!(status.lines(), ["Worker #1 (sleeper): Not running (stale PID file)"]);

    let stopped = daemon.stop(false).unwrap();
    assert_eq!(stopped.code(), 0);
    assert_eq!(
        stopped.lines(),
        ["Worker (sleeper) #1: Already stopped (stale PID file)"]
    );
    assert!(!daemon.pid_file_for(1).exists());
}

#[test]
fn soft_restart_signals_live_workers_only() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = daemon(dir.path());

    let idle = daemon.soft_restart().unwrap();
    assert_eq!(idle.code(), 0);
    assert!(idle.lines().is_empty());

    daemon.start().unwrap();
    let pid = pid_of(&daemon);

    // `sleep` does not handle USR1 and simply exits.
    let signalled = daemon.soft_restart().unwrap();
    assert_eq!(signalled.code(), 0);
    assert_eq!(signalled.lines(), ["Worker (sleeper) #1: Sent soft-restart signal"]);

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while process_alive(pid) {
        assert!(std::time::Instant::now() < deadline);
        std::thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(daemon.status().unwrap().code(), 2);
    daemon.stop(false).unwrap();
}

#[test]
fn restart_replaces_the_process() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = daemon(dir.path());
    daemon.start().unwrap();
    let before = pid_of(&daemon);

    let restarted = daemon.restart().unwrap();

    assert_eq!(restarted.code(), 0);
    assert_eq!(
        restarted.lines(),
        ["Worker (sleeper) #1: Stopping", "Worker #1 (sleeper): Starting"]
    );
    let after = pid_of(&daemon);
    assert_ne!(before, after);
    assert!(!process_alive(before));
    assert!(process_alive(after));

    daemon.stop(false).unwrap();
}
