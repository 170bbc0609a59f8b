//! Runs one claimed job to completion.
//!
//! `locked -> started`, decode, run the body (optionally inside a store
//! transaction), then `succeeded` or `failed`. A failure is persisted first
//! and returned afterwards so the worker can still report it.

use std::{
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use futures::FutureExt as _;
use tokio::sync::Mutex;

use crate::{
    error::{Error, ErrorKind},
    job::{JobId, WorkerId},
    pool::panic_message,
    registry::{JobContext, JobDecoder},
    store::JobStore,
};

tokio::task_local! {
    static CURRENT_PERFORMER: PerformerInfo;
}

/// What job code can learn about the performer running it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PerformerInfo {
    pub job_id: JobId,
    pub worker_id: WorkerId,
    pub job_type: String,
}

/// The performer running the current task.
///
/// Fails with [`ErrorKind::Usage`] when called outside a job body.
pub fn current() -> Result<PerformerInfo, Error> {
    CURRENT_PERFORMER
        .try_with(Clone::clone)
        .map_err(|_| Error::usage("No performer is active in this task."))
}

#[derive(Debug, thiserror::Error)]
#[error("Job panicked: {0}")]
struct JobPanicked(String);

pub struct Performer<S: JobStore> {
    job_id: JobId,
    worker_id: WorkerId,
    store: S,
    decoder: Arc<dyn JobDecoder<S>>,
    perform_jobs_in_tx: bool,
    started: AtomicBool,
}

impl<S: JobStore> Performer<S> {
    pub fn new(
        job_id: JobId,
        worker_id: WorkerId,
        store: S,
        decoder: Arc<dyn JobDecoder<S>>,
        perform_jobs_in_tx: bool,
    ) -> Self {
        Self {
            job_id,
            worker_id,
            store,
            decoder,
            perform_jobs_in_tx,
            started: AtomicBool::new(false),
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Run the job. A performer runs at most once.
    pub async fn perform(&self) -> Result<(), Error> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::usage("Performer can only run once."));
        }

        let record = self.store.mark_started(self.job_id).await?;
        tracing::info!(job_id = self.job_id, "Job started");

        match self.execute(record).await {
            Ok(()) => {
                self.store.mark_succeeded(self.job_id).await?;
                tracing::info!(job_id = self.job_id, "Job succeeded");
                Ok(())
            }
            Err(error) => {
                let report = error.report();
                tracing::error!(job_id = self.job_id, error = %report, "Job failed");
                self.store.mark_failed(self.job_id, &report).await?;
                Err(error)
            }
        }
    }

    async fn execute(&self, record: crate::job::JobRecord) -> Result<(), Error> {
        let job = self.decoder.decode(&record.payload)?;
        let info = PerformerInfo {
            job_id: self.job_id,
            worker_id: self.worker_id.clone(),
            job_type: job.job_type().to_string(),
        };

        let transaction = if job.in_transaction().unwrap_or(self.perform_jobs_in_tx) {
            Some(self.store.begin().await?)
        } else {
            None
        };
        let transaction = Arc::new(Mutex::new(transaction));
        let context = JobContext::new(record, self.store.clone(), transaction.clone());

        let outcome = CURRENT_PERFORMER
            .scope(info, AssertUnwindSafe(job.run(context)).catch_unwind())
            .await;
        let result = match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) => Err(Error::new(ErrorKind::Job, error)),
            Err(panic) => Err(Error::new(
                ErrorKind::Job,
                JobPanicked(panic_message(panic.as_ref())),
            )),
        };

        let transaction = transaction.lock().await.take();
        match (result, transaction) {
            (Ok(()), Some(transaction)) => self.store.commit(transaction).await,
            (Ok(()), None) => Ok(()),
            (Err(error), Some(transaction)) => {
                if let Err(rollback) = self.store.rollback(transaction).await {
                    tracing::error!(job_id = self.job_id, error = %rollback, "Failed to roll back job transaction");
                }
                Err(error)
            }
            (Err(error), None) => Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        BoxError, JobState, MemoryStore, NewJob,
        registry::{JobRegistry, TransactionMode},
        store::ClaimSession,
    };

    async fn claimed(store: &MemoryStore, job: NewJob, worker: &WorkerId) -> JobId {
        let id = store.enqueue(job).await.unwrap();
        let mut session = store
            .begin_claim(Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert!(session.claim(id, worker).await.unwrap());
        session.commit().await.unwrap();
        id
    }

    fn registry() -> Arc<dyn JobDecoder<MemoryStore>> {
        let registry = JobRegistry::<MemoryStore>::new()
            .register("ok", || async { Ok::<_, BoxError>(()) })
            .register("fail", || async { Err::<(), BoxError>("boom".into()) })
            .register("panic", || async {
                if true {
                    panic!("kaboom");
                }
                Ok::<_, BoxError>(())
            })
            .register_with("raw", TransactionMode::Never, || async {
                Ok::<_, BoxError>(())
            })
            .register("whoami", || async {
                match current() {
                    Ok(info) if info.job_type == "whoami" => Ok::<_, BoxError>(()),
                    Ok(_) => Err("wrong performer".into()),
                    Err(error) => Err(error.into()),
                }
            });
        Arc::new(registry)
    }

    async fn run(store: &MemoryStore, job_type: &str) -> (JobId, Result<(), Error>) {
        let worker = WorkerId::new("host", 1, "abcdef");
        let id = claimed(store, NewJob::new(job_type, &()).unwrap(), &worker).await;
        let performer = Performer::new(id, worker, store.clone(), registry(), true);
        let result = performer.perform().await;
        (id, result)
    }

    #[tokio::test]
    async fn success_commits_the_body_transaction() {
        let store = MemoryStore::new();

        let (id, result) = run(&store, "ok").await;

        result.unwrap();
        let record = store.find(id).await.unwrap().unwrap();
        assert_eq!(record.state, JobState::Succeeded);
        assert_eq!(store.transaction_counts(), (1, 0));
    }

    #[tokio::test]
    async fn failure_is_persisted_and_returned() {
        let store = MemoryStore::new();

        let (id, result) = run(&store, "fail").await;

        let error = result.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Job);
        let record = store.find(id).await.unwrap().unwrap();
        assert_eq!(record.state, JobState::Failed);
        assert_eq!(record.last_error.as_deref(), Some("boom"));
        assert_eq!(store.transaction_counts(), (0, 1));
    }

    #[tokio::test]
    async fn panic_is_recorded_as_failure() {
        let store = MemoryStore::new();

        let (id, result) = run(&store, "panic").await;

        assert_eq!(result.unwrap_err().kind(), ErrorKind::Job);
        let record = store.find(id).await.unwrap().unwrap();
        assert_eq!(record.state, JobState::Failed);
        assert_eq!(record.last_error.as_deref(), Some("Job panicked: kaboom"));
    }

    #[tokio::test]
    async fn unknown_type_fails_the_job() {
        let store = MemoryStore::new();

        let (id, result) = run(&store, "nope").await;

        assert_eq!(result.unwrap_err().kind(), ErrorKind::Decode);
        let record = store.find(id).await.unwrap().unwrap();
        assert_eq!(record.state, JobState::Failed);
        assert!(record.last_error.unwrap().contains("nope"));
    }

    #[tokio::test]
    async fn opted_out_job_runs_without_transaction() {
        let store = MemoryStore::new();

        let (_, result) = run(&store, "raw").await;

        result.unwrap();
        assert_eq!(store.transaction_counts(), (0, 0));
    }

    #[tokio::test]
    async fn current_performer_is_visible_to_the_job_only() {
        let store = MemoryStore::new();

        let (_, result) = run(&store, "whoami").await;

        result.unwrap();
        assert_eq!(current().unwrap_err().kind(), ErrorKind::Usage);
    }

    #[tokio::test]
    async fn performer_runs_once() {
        let store = MemoryStore::new();
        let worker = WorkerId::new("host", 1, "abcdef");
        let id = claimed(&store, NewJob::new("ok", &()).unwrap(), &worker).await;
        let performer = Performer::new(id, worker, store.clone(), registry(), true);

        performer.perform().await.unwrap();
        let error = performer.perform().await.unwrap_err();

        assert_eq!(error.kind(), ErrorKind::Usage);
    }

    #[tokio::test]
    async fn unclaimed_job_is_left_alone() {
        let store = MemoryStore::new();
        let id = store.enqueue(NewJob::new("ok", &()).unwrap()).await.unwrap();
        let worker = WorkerId::new("host", 1, "abcdef");
        let performer = Performer::new(id, worker, store.clone(), registry(), true);

        let error = performer.perform().await.unwrap_err();

        assert_eq!(error.kind(), ErrorKind::State);
        let record = store.find(id).await.unwrap().unwrap();
        assert_eq!(record.state, JobState::Waiting);
    }
}
