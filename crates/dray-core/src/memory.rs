//! In-process [`JobStore`] used by tests and single-process deployments.
//!
//! Rows live in a map behind an async lock; the cluster-wide lock is an async
//! mutex shared by every clone of the store, so several workers built on
//! clones of one `MemoryStore` coordinate exactly like separate processes on
//! one database.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        Arc,
        atomic::{AtomicI64, AtomicU64, Ordering},
    },
    time::{Duration, SystemTime},
};

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::{
    error::Error,
    job::{JobId, JobRecord, JobState, NewJob, WorkerId},
    store::{ClaimSession, JobStore},
};

#[derive(Debug, Default)]
struct Transactions {
    committed: AtomicU64,
    rolled_back: AtomicU64,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    jobs: Arc<RwLock<BTreeMap<JobId, JobRecord>>>,
    next_id: Arc<AtomicI64>,
    global_lock: Arc<Mutex<()>>,
    transactions: Arc<Transactions>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every row ordered by id.
    pub async fn jobs(&self) -> Vec<JobRecord> {
        self.jobs.read().await.values().cloned().collect()
    }

    /// Number of body transactions committed and rolled back so far.
    pub fn transaction_counts(&self) -> (u64, u64) {
        (
            self.transactions.committed.load(Ordering::SeqCst),
            self.transactions.rolled_back.load(Ordering::SeqCst),
        )
    }

    async fn update<F>(&self, id: JobId, f: F) -> Result<JobRecord, Error>
    where
        F: FnOnce(&mut JobRecord, SystemTime) -> Result<(), crate::error::StateMismatch>,
    {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&id).ok_or_else(|| not_found(id))?;
        f(job, SystemTime::now())?;
        Ok(job.clone())
    }

    async fn ids_where<P>(&self, predicate: P) -> Vec<JobId>
    where
        P: Fn(&JobRecord) -> bool,
    {
        let jobs = self.jobs.read().await;
        jobs.values().filter(|job| predicate(job)).map(|job| job.id).collect()
    }
}

fn not_found(id: JobId) -> Error {
    Error::new(crate::ErrorKind::Database, format!("Job {id} does not exist."))
}

/// Claim session over a [`MemoryStore`]. Rolling back returns claimed rows
/// to `waiting`.
#[derive(Debug)]
pub struct MemorySession {
    store: MemoryStore,
    claimed: Vec<JobId>,
    _guard: OwnedMutexGuard<()>,
}

impl ClaimSession for MemorySession {
    async fn waiting_queues(&mut self, now: SystemTime) -> Result<Vec<Option<String>>, Error> {
        let jobs = self.store.jobs.read().await;
        let queues = jobs
            .values()
            .filter(|job| job.is_eligible(now))
            .map(|job| job.queue.clone())
            .collect::<BTreeSet<_>>();
        Ok(queues.into_iter().collect())
    }

    async fn busy_queues(&mut self) -> Result<Vec<String>, Error> {
        let jobs = self.store.jobs.read().await;
        let queues = jobs
            .values()
            .filter(|job| matches!(job.state, JobState::Locked | JobState::Started))
            .filter_map(|job| job.queue.clone())
            .collect::<BTreeSet<_>>();
        Ok(queues.into_iter().collect())
    }

    async fn candidates(
        &mut self,
        queue: Option<&str>,
        now: SystemTime,
        limit: usize,
    ) -> Result<Vec<JobRecord>, Error> {
        let jobs = self.store.jobs.read().await;
        let mut candidates = jobs
            .values()
            .filter(|job| job.is_eligible(now) && job.queue.as_deref() == queue)
            .cloned()
            .collect::<Vec<_>>();
        candidates.sort_by_key(|job| (job.priority, job.created_at, job.id));
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn claim(&mut self, id: JobId, worker_id: &WorkerId) -> Result<bool, Error> {
        let mut jobs = self.store.jobs.write().await;
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(false);
        };
        match job.mark_locked(worker_id, SystemTime::now()) {
            Ok(()) => {
                self.claimed.push(id);
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    async fn commit(self) -> Result<(), Error> {
        Ok(())
    }

    async fn rollback(self) -> Result<(), Error> {
        let mut jobs = self.store.jobs.write().await;
        let now = SystemTime::now();
        for id in &self.claimed {
            if let Some(job) = jobs.get_mut(id) {
                if job.state == JobState::Locked {
                    let _ = job.reset(true, now);
                }
            }
        }
        Ok(())
    }
}

/// Body transaction marker; the memory store has no undo log.
#[derive(Debug)]
pub struct MemoryTransaction {
    _private: (),
}

impl JobStore for MemoryStore {
    type Session = MemorySession;
    type Transaction = MemoryTransaction;

    async fn begin_claim(&self, timeout: Duration) -> Result<Option<Self::Session>, Error> {
        let lock = self.global_lock.clone().lock_owned();
        match tokio::time::timeout(timeout, lock).await {
            Ok(guard) => Ok(Some(MemorySession {
                store: self.clone(),
                claimed: Vec::new(),
                _guard: guard,
            })),
            Err(_) => Ok(None),
        }
    }

    async fn enqueue(&self, job: NewJob) -> Result<JobId, Error> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let record = JobRecord::waiting(id, job, SystemTime::now());
        self.jobs.write().await.insert(id, record);
        Ok(id)
    }

    async fn find(&self, id: JobId) -> Result<Option<JobRecord>, Error> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn mark_started(&self, id: JobId) -> Result<JobRecord, Error> {
        self.update(id, |job, now| job.mark_started(now)).await
    }

    async fn mark_succeeded(&self, id: JobId) -> Result<(), Error> {
        self.update(id, |job, now| job.mark_succeeded(now)).await?;
        Ok(())
    }

    async fn mark_failed(&self, id: JobId, error: &str) -> Result<(), Error> {
        self.update(id, |job, now| job.mark_failed(error, now)).await?;
        Ok(())
    }

    async fn reset(&self, id: JobId, force: bool) -> Result<(), Error> {
        self.update(id, |job, now| job.reset(force, now)).await?;
        Ok(())
    }

    async fn claimed_on_host(&self, host: &str) -> Result<Vec<JobRecord>, Error> {
        let jobs = self.jobs.read().await;
        Ok(jobs
            .values()
            .filter(|job| matches!(job.state, JobState::Locked | JobState::Started))
            .filter(|job| job.claimed_by().is_some_and(|owner| owner.host() == host))
            .cloned()
            .collect())
    }

    async fn locked_before(&self, cutoff: SystemTime) -> Result<Vec<JobId>, Error> {
        Ok(self
            .ids_where(|job| {
                job.state == JobState::Locked && job.locked_at.is_some_and(|at| at < cutoff)
            })
            .await)
    }

    async fn started_before(&self, cutoff: SystemTime) -> Result<Vec<JobId>, Error> {
        Ok(self
            .ids_where(|job| {
                job.state == JobState::Started && job.started_at.is_some_and(|at| at < cutoff)
            })
            .await)
    }

    async fn delete_succeeded_before(&self, cutoff: SystemTime) -> Result<u64, Error> {
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, job| !(job.state == JobState::Succeeded && job.updated_at <= cutoff));
        Ok((before - jobs.len()) as u64)
    }

    async fn begin(&self) -> Result<Self::Transaction, Error> {
        Ok(MemoryTransaction { _private: () })
    }

    async fn commit(&self, _transaction: Self::Transaction) -> Result<(), Error> {
        self.transactions.committed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&self, _transaction: Self::Transaction) -> Result<(), Error> {
        self.transactions.rolled_back.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> NewJob {
        NewJob::new("noop", &()).unwrap()
    }

    #[tokio::test]
    async fn second_claim_of_the_same_row_is_a_noop() {
        let store = MemoryStore::new();
        let id = store.enqueue(job()).await.unwrap();
        let first = WorkerId::new("a", 1, "aaaaaa");
        let second = WorkerId::new("b", 2, "bbbbbb");

        let mut session = store.begin_claim(Duration::from_secs(1)).await.unwrap().unwrap();
        assert!(session.claim(id, &first).await.unwrap());
        session.commit().await.unwrap();

        let mut session = store.begin_claim(Duration::from_secs(1)).await.unwrap().unwrap();
        assert!(!session.claim(id, &second).await.unwrap());
        session.commit().await.unwrap();

        let record = store.find(id).await.unwrap().unwrap();
        assert_eq!(record.state, JobState::Locked);
        assert_eq!(record.locked_by.as_deref(), Some("a.1.aaaaaa"));
    }

    #[tokio::test]
    async fn global_lock_times_out_while_held() {
        let store = MemoryStore::new();
        let other = store.clone();

        let held = store.begin_claim(Duration::from_millis(100)).await.unwrap();
        assert!(held.is_some());
        let blocked = other.begin_claim(Duration::from_millis(50)).await.unwrap();
        assert!(blocked.is_none());

        drop(held);
        assert!(other.begin_claim(Duration::from_millis(50)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn rollback_returns_claims_to_waiting() {
        let store = MemoryStore::new();
        let id = store.enqueue(job()).await.unwrap();

        let mut session = store.begin_claim(Duration::from_secs(1)).await.unwrap().unwrap();
        assert!(session.claim(id, &WorkerId::new("h", 1, "t")).await.unwrap());
        session.rollback().await.unwrap();

        let record = store.find(id).await.unwrap().unwrap();
        assert_eq!(record.state, JobState::Waiting);
        assert_eq!(record.locked_by, None);
    }

    #[tokio::test]
    async fn candidates_follow_priority_then_arrival() {
        let store = MemoryStore::new();
        let low = store.enqueue(job().priority(5)).await.unwrap();
        let high = store.enqueue(job().priority(1)).await.unwrap();
        let high_later = store.enqueue(job().priority(1)).await.unwrap();
        store.enqueue(job().queue("other")).await.unwrap();

        let mut session = store.begin_claim(Duration::from_secs(1)).await.unwrap().unwrap();
        let ids = session
            .candidates(None, SystemTime::now(), 10)
            .await
            .unwrap()
            .into_iter()
            .map(|job| job.id)
            .collect::<Vec<_>>();

        assert_eq!(ids, vec![high, high_later, low]);
    }
}
