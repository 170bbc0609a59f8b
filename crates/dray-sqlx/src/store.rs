use std::time::{Duration, SystemTime};

use dray_core::{
    ClaimSession, Error, JobId, JobRecord, JobState, JobStore, NewJob, StateMismatch, WorkerId,
};
use sqlx::{PgConnection, PgPool, Postgres};

use crate::{
    PgDateTime, database,
    queries::{self, JobRow},
};

/// [`JobStore`] backed by the `dray_jobs` table.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the `dray_jobs` table and its indexes if they do not exist.
    pub async fn install_schema(&self) -> Result<(), Error> {
        sqlx::raw_sql(queries::SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(database)?;
        Ok(())
    }

    /// Enqueue `job` on a caller-provided connection or transaction, so the
    /// job only becomes visible when the caller's transaction commits.
    ///
    /// ```no_run
    /// # async fn demo(store: dray_sqlx::PgStore) -> Result<(), Box<dyn std::error::Error>> {
    /// use dray_sqlx::dray_core::NewJob;
    ///
    /// let mut tx = store.pool().begin().await?;
    /// store.enqueue_tx(NewJob::new("send_mail", &42)?, &mut *tx).await?;
    /// tx.commit().await?;
    /// # Ok(())
    /// # }
    /// ```
    #[allow(clippy::manual_async_fn)]
    pub fn enqueue_tx<'a, 'c, A>(
        &self,
        job: NewJob,
        tx: A,
    ) -> impl Future<Output = Result<JobId, Error>> + Send
    where
        A: sqlx::Acquire<'c, Database = Postgres> + Send + 'a,
    {
        async move {
            let mut conn = tx.acquire().await.map_err(database)?;
            insert(&mut *conn, &job).await
        }
    }

    /// Build the error for a conditional update that matched no row.
    async fn transition_error(&self, id: JobId, expected: &[JobState]) -> Error {
        match JobStore::find(self, id).await {
            Ok(Some(job)) => StateMismatch {
                id,
                expected: expected.to_vec(),
                actual: job.state,
            }
            .into(),
            Ok(None) => not_found(id),
            Err(e) => e,
        }
    }
}

fn not_found(id: JobId) -> Error {
    Error::new(
        dray_core::ErrorKind::Database,
        format!("Job {id} does not exist."),
    )
}

async fn insert(conn: &mut PgConnection, job: &NewJob) -> Result<JobId, Error> {
    let id = sqlx::query_scalar::<_, i64>(queries::INSERT)
        .bind(job.queue_name())
        .bind(job.priority_value())
        .bind(job.perform_at_value().map(PgDateTime))
        .bind(job.payload())
        .bind(job.description_value())
        .fetch_one(conn)
        .await
        .map_err(database)?;
    tracing::trace!(job_id = id, "enqueued job");
    Ok(id)
}

fn to_records(rows: Vec<JobRow>) -> Result<Vec<JobRecord>, Error> {
    rows.into_iter().map(JobRecord::try_from).collect()
}

/// Claim transaction holding the advisory lock.
#[derive(Debug)]
pub struct PgSession {
    tx: sqlx::Transaction<'static, Postgres>,
}

impl ClaimSession for PgSession {
    async fn waiting_queues(&mut self, now: SystemTime) -> Result<Vec<Option<String>>, Error> {
        sqlx::query_scalar::<_, Option<String>>(queries::WAITING_QUEUES)
            .bind(PgDateTime(now))
            .fetch_all(&mut *self.tx)
            .await
            .map_err(database)
    }

    async fn busy_queues(&mut self) -> Result<Vec<String>, Error> {
        sqlx::query_scalar::<_, String>(queries::BUSY_QUEUES)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(database)
    }

    async fn candidates(
        &mut self,
        queue: Option<&str>,
        now: SystemTime,
        limit: usize,
    ) -> Result<Vec<JobRecord>, Error> {
        let rows = sqlx::query_as::<_, JobRow>(queries::CANDIDATES)
            .bind(queue)
            .bind(PgDateTime(now))
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&mut *self.tx)
            .await
            .map_err(database)?;
        to_records(rows)
    }

    async fn claim(&mut self, id: JobId, worker_id: &WorkerId) -> Result<bool, Error> {
        let result = sqlx::query(queries::CLAIM)
            .bind(id)
            .bind(worker_id.to_string())
            .execute(&mut *self.tx)
            .await
            .map_err(database)?;
        Ok(result.rows_affected() == 1)
    }

    async fn commit(self) -> Result<(), Error> {
        self.tx.commit().await.map_err(database)
    }

    async fn rollback(self) -> Result<(), Error> {
        self.tx.rollback().await.map_err(database)
    }
}

impl JobStore for PgStore {
    type Session = PgSession;
    type Transaction = sqlx::Transaction<'static, Postgres>;

    async fn begin_claim(&self, timeout: Duration) -> Result<Option<PgSession>, Error> {
        let mut tx = self.pool.begin().await.map_err(database)?;

        // `lock_timeout = 0` would wait forever.
        let millis = timeout.as_millis().max(1);
        sqlx::query(queries::SET_LOCK_TIMEOUT)
            .bind(format!("{millis}ms"))
            .execute(&mut *tx)
            .await
            .map_err(database)?;

        let locked = sqlx::query(queries::ADVISORY_LOCK)
            .bind(queries::GLOBAL_LOCK_KEY)
            .execute(&mut *tx)
            .await;
        match locked {
            Ok(_) => Ok(Some(PgSession { tx })),
            Err(sqlx::Error::Database(e))
                if e.code().as_deref() == Some(queries::LOCK_NOT_AVAILABLE) =>
            {
                tracing::debug!(?timeout, "global lock is held elsewhere");
                tx.rollback().await.map_err(database)?;
                Ok(None)
            }
            Err(e) => Err(database(e)),
        }
    }

    async fn enqueue(&self, job: NewJob) -> Result<JobId, Error> {
        let mut conn = self.pool.acquire().await.map_err(database)?;
        insert(&mut *conn, &job).await
    }

    async fn find(&self, id: JobId) -> Result<Option<JobRecord>, Error> {
        let row = sqlx::query_as::<_, JobRow>(queries::FIND)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(database)?;
        row.map(JobRecord::try_from).transpose()
    }

    async fn mark_started(&self, id: JobId) -> Result<JobRecord, Error> {
        let row = sqlx::query_as::<_, JobRow>(queries::MARK_STARTED)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(database)?;
        match row {
            Some(row) => row.try_into(),
            None => Err(self.transition_error(id, &[JobState::Locked]).await),
        }
    }

    async fn mark_succeeded(&self, id: JobId) -> Result<(), Error> {
        let updated = sqlx::query_scalar::<_, i64>(queries::MARK_SUCCEEDED)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(database)?;
        match updated {
            Some(_) => Ok(()),
            None => Err(self.transition_error(id, &[JobState::Started]).await),
        }
    }

    async fn mark_failed(&self, id: JobId, error: &str) -> Result<(), Error> {
        let updated = sqlx::query_scalar::<_, i64>(queries::MARK_FAILED)
            .bind(id)
            .bind(error)
            .fetch_optional(&self.pool)
            .await
            .map_err(database)?;
        match updated {
            Some(_) => Ok(()),
            None => {
                let expected = [JobState::Locked, JobState::Started];
                Err(self.transition_error(id, &expected).await)
            }
        }
    }

    async fn reset(&self, id: JobId, force: bool) -> Result<(), Error> {
        let updated = sqlx::query_scalar::<_, i64>(queries::RESET)
            .bind(id)
            .bind(force)
            .fetch_optional(&self.pool)
            .await
            .map_err(database)?;
        match updated {
            Some(_) => Ok(()),
            None => {
                let expected = [JobState::Succeeded, JobState::Failed];
                Err(self.transition_error(id, &expected).await)
            }
        }
    }

    async fn claimed_on_host(&self, host: &str) -> Result<Vec<JobRecord>, Error> {
        let rows = sqlx::query_as::<_, JobRow>(queries::CLAIMED_ON_HOST)
            .bind(format!("{host}."))
            .fetch_all(&self.pool)
            .await
            .map_err(database)?;
        // The prefix also matches `host.sub`; the parsed owner decides.
        Ok(to_records(rows)?
            .into_iter()
            .filter(|job| job.claimed_by().is_some_and(|owner| owner.host() == host))
            .collect())
    }

    async fn locked_before(&self, cutoff: SystemTime) -> Result<Vec<JobId>, Error> {
        sqlx::query_scalar::<_, i64>(queries::LOCKED_BEFORE)
            .bind(PgDateTime(cutoff))
            .fetch_all(&self.pool)
            .await
            .map_err(database)
    }

    async fn started_before(&self, cutoff: SystemTime) -> Result<Vec<JobId>, Error> {
        sqlx::query_scalar::<_, i64>(queries::STARTED_BEFORE)
            .bind(PgDateTime(cutoff))
            .fetch_all(&self.pool)
            .await
            .map_err(database)
    }

    async fn delete_succeeded_before(&self, cutoff: SystemTime) -> Result<u64, Error> {
        let result = sqlx::query(queries::DELETE_SUCCEEDED_BEFORE)
            .bind(PgDateTime(cutoff))
            .execute(&self.pool)
            .await
            .map_err(database)?;
        Ok(result.rows_affected())
    }

    async fn begin(&self) -> Result<Self::Transaction, Error> {
        self.pool.begin().await.map_err(database)
    }

    async fn commit(&self, transaction: Self::Transaction) -> Result<(), Error> {
        transaction.commit().await.map_err(database)
    }

    async fn rollback(&self, transaction: Self::Transaction) -> Result<(), Error> {
        transaction.rollback().await.map_err(database)
    }
}
