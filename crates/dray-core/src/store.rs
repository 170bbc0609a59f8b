//! Persistence-facing traits: claim sessions, transitions, transactions.
//!
//! The poller decides what to claim; the store decides how a claim becomes
//! durable. Every transition is a conditional update on the current state,
//! so a lost race shows up as a state mismatch or a `false` claim instead of
//! a double execution.
mod tmp {
    use std::time::{Duration, SystemTime};

    use crate::{
        error::Error,
        job::{JobId, JobRecord, NewJob, WorkerId},
    };

    /// One claim cycle: holds the cluster-wide lock and the claim
    /// transaction until committed or rolled back.
    ///
    /// Dropping a session without committing must release the lock and
    /// discard its claims.
    #[trait_variant::make(ClaimSession: Send)]
    pub trait LocalClaimSession {
        /// Distinct queues that have at least one eligible waiting job.
        async fn waiting_queues(&mut self, now: SystemTime) -> Result<Vec<Option<String>>, Error>;

        /// Named queues with a job in `locked` or `started`.
        async fn busy_queues(&mut self) -> Result<Vec<String>, Error>;

        /// Eligible waiting jobs of `queue` ordered by priority, then
        /// creation, then id.
        async fn candidates(
            &mut self,
            queue: Option<&str>,
            now: SystemTime,
            limit: usize,
        ) -> Result<Vec<JobRecord>, Error>;

        /// `waiting -> locked`. Returns `false` when the row is no longer
        /// waiting.
        async fn claim(&mut self, id: JobId, worker_id: &WorkerId) -> Result<bool, Error>;

        async fn commit(self) -> Result<(), Error>;

        async fn rollback(self) -> Result<(), Error>;
    }

    /// A relational job table plus a cluster-wide named lock.
    #[trait_variant::make(JobStore: Send)]
    pub trait LocalJobStore: Clone + Send + Sync + 'static {
        type Session: ClaimSession + Send + 'static;
        /// Transaction a job body may run in.
        type Transaction: Send + 'static;

        /// Acquire the cluster-wide lock within `timeout` and open a claim
        /// session. `None` when the lock is held elsewhere.
        async fn begin_claim(&self, timeout: Duration) -> Result<Option<Self::Session>, Error>;

        async fn enqueue(&self, job: NewJob) -> Result<JobId, Error>;

        async fn find(&self, id: JobId) -> Result<Option<JobRecord>, Error>;

        /// `locked -> started`; returns the updated record.
        async fn mark_started(&self, id: JobId) -> Result<JobRecord, Error>;

        /// `started -> succeeded`.
        async fn mark_succeeded(&self, id: JobId) -> Result<(), Error>;

        /// `locked | started -> failed`, persisting `error`.
        async fn mark_failed(&self, id: JobId, error: &str) -> Result<(), Error>;

        /// Terminal (or any, with `force`) `-> waiting`, clearing claim and
        /// result fields.
        async fn reset(&self, id: JobId, force: bool) -> Result<(), Error>;

        /// Jobs in `locked` or `started` whose claim owner runs on `host`.
        async fn claimed_on_host(&self, host: &str) -> Result<Vec<JobRecord>, Error>;

        /// Ids of jobs in `locked` since before `cutoff`.
        async fn locked_before(&self, cutoff: SystemTime) -> Result<Vec<JobId>, Error>;

        /// Ids of jobs in `started` since before `cutoff`.
        async fn started_before(&self, cutoff: SystemTime) -> Result<Vec<JobId>, Error>;

        /// Delete succeeded jobs last updated before `cutoff`.
        async fn delete_succeeded_before(&self, cutoff: SystemTime) -> Result<u64, Error>;

        async fn begin(&self) -> Result<Self::Transaction, Error>;

        async fn commit(&self, transaction: Self::Transaction) -> Result<(), Error>;

        async fn rollback(&self, transaction: Self::Transaction) -> Result<(), Error>;
    }
}

pub use tmp::{ClaimSession, JobStore};
