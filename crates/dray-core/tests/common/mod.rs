#![allow(dead_code)]

use std::{
    future::Future,
    time::{Duration, Instant},
};

use dray_core::{Config, JobRecord, JobState, MemoryStore};

/// Log to the test harness; `RUST_LOG=dray_core=debug` to see poll cycles.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .compact()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Fast polling, no process-wide signal handlers.
pub fn config() -> Config {
    init_tracing();
    Config::new()
        .polling_interval(Duration::from_millis(100))
        .auto_terminate(false)
        .install_signal_handlers(false)
}

/// Poll `check` until it returns true, panicking after `timeout`.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    while !check().await {
        assert!(Instant::now() < deadline, "condition not reached within {timeout:?}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub async fn all_in_state(store: &MemoryStore, state: JobState) -> bool {
    store.jobs().await.iter().all(|job| job.state == state)
}

pub async fn job(store: &MemoryStore, id: i64) -> JobRecord {
    store
        .jobs()
        .await
        .into_iter()
        .find(|job| job.id == id)
        .unwrap()
}

/// Pid of a process that has exited and been reaped.
pub fn dead_pid() -> u32 {
    let mut child = std::process::Command::new("true").spawn().unwrap();
    let pid = child.id();
    child.wait().unwrap();
    pid
}
