//! Needs a PostgreSQL server: `DATABASE_URL=postgres://... cargo test -- --ignored`.
//!
//! Every test works on its own queue so the tests can share one table.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use dray_core::{
    BoxError, ClaimSession, Config, ErrorKind, JobContext, JobData, JobRegistry, JobState,
    JobStore, NewJob, WorkerBuilder, WorkerId,
};
use dray_sqlx::PgStore;

async fn store() -> PgStore {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let pool = sqlx::PgPool::connect(&url).await.unwrap();
    let store = PgStore::new(pool);
    store.install_schema().await.unwrap();
    store
}

fn unique_queue(name: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    format!("{name}-{}-{nanos}", std::process::id())
}

async fn state_of(store: &PgStore, id: i64) -> JobState {
    store.find(id).await.unwrap().unwrap().state
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn transitions_follow_the_state_machine() {
    let store = store().await;
    let queue = unique_queue("transitions");
    let worker = WorkerId::new("host", 1, "aaaaaa");
    let id = store
        .enqueue(NewJob::new("noop", &()).unwrap().queue(&queue).priority(3))
        .await
        .unwrap();

    let mut session = store
        .begin_claim(Duration::from_secs(5))
        .await
        .unwrap()
        .unwrap();
    let candidates = session
        .candidates(Some(&queue), SystemTime::now(), 10)
        .await
        .unwrap();
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].priority, 3);
    assert!(session.claim(id, &worker).await.unwrap());
    assert!(!session.claim(id, &worker).await.unwrap());
    assert!(session.busy_queues().await.unwrap().contains(&queue));
    session.commit().await.unwrap();

    let started = store.mark_started(id).await.unwrap();
    assert_eq!(started.state, JobState::Started);
    assert_eq!(started.claimed_by(), Some(worker));
    assert!(started.started_at.is_some());

    store.mark_succeeded(id).await.unwrap();
    let error = store.mark_succeeded(id).await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::State);

    store.reset(id, false).await.unwrap();
    let record = store.find(id).await.unwrap().unwrap();
    assert_eq!(record.state, JobState::Waiting);
    assert_eq!(record.locked_by, None);
    assert_eq!(record.succeeded_at, None);
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn missing_jobs_are_reported() {
    let store = store().await;

    assert!(store.find(-1).await.unwrap().is_none());
    let error = store.mark_started(-1).await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Database);
    assert_eq!(error.to_string(), "Job -1 does not exist.");
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn held_lock_times_out_and_rollback_releases_it() {
    let store = store().await;

    let held = store
        .begin_claim(Duration::from_secs(5))
        .await
        .unwrap()
        .unwrap();
    let other = store.begin_claim(Duration::from_millis(100)).await.unwrap();
    assert!(other.is_none());

    held.rollback().await.unwrap();
    let again = store.begin_claim(Duration::from_secs(5)).await.unwrap();
    assert!(again.is_some());
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn enqueue_tx_is_visible_after_commit() {
    let store = store().await;
    let queue = unique_queue("enqueue-tx");

    let mut tx = store.pool().begin().await.unwrap();
    let id = store
        .enqueue_tx(NewJob::new("noop", &()).unwrap().queue(&queue), &mut *tx)
        .await
        .unwrap();
    assert!(store.find(id).await.unwrap().is_none());

    tx.commit().await.unwrap();
    assert_eq!(state_of(&store, id).await, JobState::Waiting);
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn worker_runs_jobs_inside_transactions() {
    let store = store().await;
    let queue = unique_queue("worker");

    let follow_up_queue = queue.clone();
    let registry = JobRegistry::<PgStore>::new()
        .register("leaf", |JobData(_): JobData<u32>| async { Ok::<_, BoxError>(()) })
        .register("fan_out", move |ctx: JobContext<PgStore>| {
            let queue = follow_up_queue.clone();
            async move {
                let mut guard = ctx.transaction().await;
                let tx = guard.as_mut().ok_or("job is not running in a transaction")?;
                let job = NewJob::new("leaf", &7u32)?.queue(queue);
                ctx.store().enqueue_tx(job, &mut **tx).await?;
                Ok::<_, BoxError>(())
            }
        });
    let root = store
        .enqueue(NewJob::new("fan_out", &()).unwrap().queue(&queue))
        .await
        .unwrap();

    let worker = WorkerBuilder::new(store.clone(), registry)
        .config(
            Config::new()
                .queues([queue.as_str()])
                .polling_interval(Duration::from_millis(100))
                .perform_jobs_in_tx(true)
                .auto_terminate(false)
                .install_signal_handlers(false),
        )
        .build()
        .unwrap();
    worker.start().await.unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let mut session = store
            .begin_claim(Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        let waiting = session
            .candidates(Some(&queue), SystemTime::now(), 10)
            .await
            .unwrap();
        let busy = session.busy_queues().await.unwrap();
        session.rollback().await.unwrap();
        let done = waiting.is_empty() && !busy.contains(&queue);
        if done && state_of(&store, root).await == JobState::Succeeded {
            break;
        }
        assert!(Instant::now() < deadline, "jobs did not finish in time");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    worker.shutdown().await.unwrap();
}
