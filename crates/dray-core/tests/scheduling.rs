mod common;

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use dray_core::{
    BoxError, ErrorKind, JobData, JobRegistry, JobState, JobStore, MemoryStore, NewJob,
    WorkerBuilder, WorkerState, process::shutdown_marker_path,
};

use common::{all_in_state, config, eventually, job};

#[tokio::test]
async fn runs_jobs_by_priority_then_arrival() {
    let store = MemoryStore::new();
    let order = Arc::new(Mutex::new(Vec::new()));

    let recorded = order.clone();
    let registry = JobRegistry::<MemoryStore>::new().register(
        "record",
        move |JobData(label): JobData<String>| {
            let recorded = recorded.clone();
            async move {
                recorded.lock().unwrap().push(label);
                Ok::<_, BoxError>(())
            }
        },
    );

    for (priority, label) in [(4, "p4"), (3, "p3a"), (3, "p3b"), (2, "p2"), (1, "p1"), (0, "p0")] {
        let job = NewJob::new("record", &label).unwrap().priority(priority);
        store.enqueue(job).await.unwrap();
    }

    let worker = WorkerBuilder::new(store.clone(), registry)
        .config(config().with_pool_size(1).instant_repolling(true))
        .build()
        .unwrap();
    worker.start().await.unwrap();

    eventually(Duration::from_secs(10), || all_in_state(&store, JobState::Succeeded)).await;
    worker.shutdown().await.unwrap();

    assert_eq!(
        *order.lock().unwrap(),
        ["p0", "p1", "p2", "p3a", "p3b", "p4"]
    );
}

#[derive(Debug, Default)]
struct Concurrency {
    running: HashMap<String, usize>,
    max_per_queue: HashMap<String, usize>,
    total: usize,
    max_total: usize,
}

#[tokio::test]
async fn named_queues_run_one_job_at_a_time() {
    let store = MemoryStore::new();
    let stats = Arc::new(Mutex::new(Concurrency::default()));

    let tracked = stats.clone();
    let registry = JobRegistry::<MemoryStore>::new().register(
        "slow",
        move |JobData(queue): JobData<String>| {
            let tracked = tracked.clone();
            async move {
                {
                    let mut stats = tracked.lock().unwrap();
                    let running = stats.running.entry(queue.clone()).or_default();
                    *running += 1;
                    let running = *running;
                    let max = stats.max_per_queue.entry(queue.clone()).or_default();
                    *max = (*max).max(running);
                    stats.total += 1;
                    stats.max_total = stats.max_total.max(stats.total);
                }
                tokio::time::sleep(Duration::from_millis(300)).await;
                {
                    let mut stats = tracked.lock().unwrap();
                    *stats.running.entry(queue).or_default() -= 1;
                    stats.total -= 1;
                }
                Ok::<_, BoxError>(())
            }
        },
    );

    for queue in ["q1", "q1", "q2", "q2"] {
        let job = NewJob::new("slow", &queue).unwrap().queue(queue);
        store.enqueue(job).await.unwrap();
    }

    let worker = WorkerBuilder::new(store.clone(), registry)
        .config(config().with_pool_size(4).instant_repolling(true))
        .build()
        .unwrap();
    worker.start().await.unwrap();

    // After the first cycle one job per queue runs, the rest wait.
    eventually(Duration::from_secs(5), || async {
        store
            .jobs()
            .await
            .iter()
            .filter(|job| job.state == JobState::Started)
            .count()
            == 2
    })
    .await;
    let jobs = store.jobs().await;
    assert_eq!(jobs[1].state, JobState::Waiting);
    assert_eq!(jobs[3].state, JobState::Waiting);

    eventually(Duration::from_secs(10), || all_in_state(&store, JobState::Succeeded)).await;
    worker.shutdown().await.unwrap();

    let stats = stats.lock().unwrap();
    assert_eq!(stats.max_per_queue["q1"], 1);
    assert_eq!(stats.max_per_queue["q2"], 1);
    assert_eq!(stats.max_total, 2);
}

#[tokio::test]
async fn future_jobs_wait_for_their_time() {
    let store = MemoryStore::new();
    let registry = JobRegistry::<MemoryStore>::new()
        .register("noop", || async { Ok::<_, BoxError>(()) });
    let id = store
        .enqueue(NewJob::new("noop", &()).unwrap().delay(Duration::from_secs(1)))
        .await
        .unwrap();

    let worker = WorkerBuilder::new(store.clone(), registry)
        .config(config())
        .build()
        .unwrap();
    worker.start().await.unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(job(&store, id).await.state, JobState::Waiting);

    eventually(Duration::from_secs(5), || all_in_state(&store, JobState::Succeeded)).await;
    let record = job(&store, id).await;
    assert!(record.started_at.unwrap() >= record.perform_at.unwrap());
    worker.shutdown().await.unwrap();
}

#[tokio::test]
async fn failing_job_does_not_stop_the_worker() {
    let store = MemoryStore::new();
    let reported = Arc::new(Mutex::new(Vec::new()));

    let registry = JobRegistry::<MemoryStore>::new()
        .register("fail", || async { Err::<(), BoxError>("nope".into()) })
        .register("noop", || async { Ok::<_, BoxError>(()) });
    let failing = store.enqueue(NewJob::new("fail", &()).unwrap()).await.unwrap();
    let passing = store
        .enqueue(NewJob::new("noop", &()).unwrap().priority(1))
        .await
        .unwrap();

    let sink = reported.clone();
    let worker = WorkerBuilder::new(store.clone(), registry)
        .config(config().on_exception(move |error| sink.lock().unwrap().push(error.kind())))
        .build()
        .unwrap();
    worker.start().await.unwrap();

    eventually(Duration::from_secs(5), || async {
        job(&store, passing).await.state == JobState::Succeeded
    })
    .await;
    worker.shutdown().await.unwrap();

    let failed = job(&store, failing).await;
    assert_eq!(failed.state, JobState::Failed);
    assert_eq!(failed.last_error.as_deref(), Some("nope"));
    assert_eq!(*reported.lock().unwrap(), [ErrorKind::Job]);
}

#[tokio::test]
async fn soft_shutdown_drains_busy_slot_then_leaves_marker() {
    let dir = tempfile::tempdir().unwrap();
    let store = MemoryStore::new();
    let registry = JobRegistry::<MemoryStore>::new()
        .register("slow", || async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok::<_, BoxError>(())
        })
        .register("noop", || async { Ok::<_, BoxError>(()) });
    let slow = store.enqueue(NewJob::new("slow", &()).unwrap()).await.unwrap();

    let worker = WorkerBuilder::new(store.clone(), registry)
        .config(config().shutdown_marker_dir(dir.path()))
        .build()
        .unwrap();
    worker.start().await.unwrap();
    eventually(Duration::from_secs(5), || async {
        job(&store, slow).await.state == JobState::Started
    })
    .await;

    let draining = tokio::spawn({
        let worker = worker.clone();
        async move { worker.soft_shutdown().await }
    });
    eventually(Duration::from_secs(1), || async {
        worker.state() == WorkerState::SoftShutdown
    })
    .await;
    assert_eq!(worker.idle(), 0);
    let late = store.enqueue(NewJob::new("noop", &()).unwrap()).await.unwrap();

    draining.await.unwrap().unwrap();

    assert_eq!(worker.state(), WorkerState::Shutdown);
    assert_eq!(job(&store, slow).await.state, JobState::Succeeded);
    assert_eq!(job(&store, late).await.state, JobState::Waiting);
    assert!(shutdown_marker_path(dir.path(), worker.id().pid()).exists());
}

#[tokio::test]
async fn lock_contention_is_reported_once_and_recovers() {
    let store = MemoryStore::new();
    let reported = Arc::new(Mutex::new(Vec::new()));
    let registry = JobRegistry::<MemoryStore>::new()
        .register("noop", || async { Ok::<_, BoxError>(()) });
    let id = store.enqueue(NewJob::new("noop", &()).unwrap()).await.unwrap();

    // Another poller holds the cluster lock.
    let held = store
        .begin_claim(Duration::from_secs(1))
        .await
        .unwrap()
        .unwrap();

    let sink = reported.clone();
    let worker = WorkerBuilder::new(store.clone(), registry)
        .config(
            config()
                .max_global_lock_fails(1)
                .on_exception(move |error| sink.lock().unwrap().push(error.kind())),
        )
        .build()
        .unwrap();
    worker.start().await.unwrap();

    eventually(Duration::from_secs(5), || async { !reported.lock().unwrap().is_empty() }).await;
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(*reported.lock().unwrap(), [ErrorKind::Lock]);
    assert_eq!(job(&store, id).await.state, JobState::Waiting);

    drop(held);
    eventually(Duration::from_secs(5), || async {
        job(&store, id).await.state == JobState::Succeeded
    })
    .await;
    worker.shutdown().await.unwrap();
    assert_eq!(worker.state(), WorkerState::Shutdown);
}

#[tokio::test]
async fn allow_list_limits_served_queues() {
    let store = MemoryStore::new();
    let registry = JobRegistry::<MemoryStore>::new()
        .register("noop", || async { Ok::<_, BoxError>(()) });
    let open = store.enqueue(NewJob::new("noop", &()).unwrap()).await.unwrap();
    let mail = store
        .enqueue(NewJob::new("noop", &()).unwrap().queue("mail"))
        .await
        .unwrap();

    let worker = WorkerBuilder::new(store.clone(), registry)
        .config(config().queues(["mail"]))
        .build()
        .unwrap();
    worker.start().await.unwrap();

    eventually(Duration::from_secs(5), || async {
        job(&store, mail).await.state == JobState::Succeeded
    })
    .await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    worker.shutdown().await.unwrap();

    assert_eq!(job(&store, open).await.state, JobState::Waiting);
}
