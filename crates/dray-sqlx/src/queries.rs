//! SQL used by [`crate::PgStore`] and the row type it decodes into.

use dray_core::{Error, JobRecord};

use crate::PgDateTime;

pub(crate) const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS dray_jobs (
    id BIGSERIAL PRIMARY KEY,
    state TEXT NOT NULL DEFAULT 'waiting',
    queue TEXT,
    priority INTEGER NOT NULL DEFAULT 0,
    perform_at TIMESTAMPTZ,
    payload BYTEA NOT NULL,
    locked_by TEXT,
    locked_at TIMESTAMPTZ,
    started_at TIMESTAMPTZ,
    succeeded_at TIMESTAMPTZ,
    failed_at TIMESTAMPTZ,
    last_error TEXT,
    description TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    CONSTRAINT dray_jobs_state_check
        CHECK (state IN ('waiting', 'locked', 'started', 'succeeded', 'failed'))
);
CREATE INDEX IF NOT EXISTS dray_jobs_queue_idx
    ON dray_jobs (queue, priority, created_at, id) WHERE state = 'waiting';
CREATE INDEX IF NOT EXISTS dray_jobs_state_idx ON dray_jobs (state, locked_by);
"#;

/// Key of the transaction scoped advisory lock, `"dray"` in ASCII.
pub(crate) const GLOBAL_LOCK_KEY: i64 = 0x6472_6179;

pub(crate) const SET_LOCK_TIMEOUT: &str = "SELECT set_config('lock_timeout', $1, true)";

pub(crate) const ADVISORY_LOCK: &str = "SELECT pg_advisory_xact_lock($1)";

/// SQLSTATE raised when `lock_timeout` expires.
pub(crate) const LOCK_NOT_AVAILABLE: &str = "55P03";

pub(crate) const WAITING_QUEUES: &str = r#"
SELECT DISTINCT queue FROM dray_jobs
WHERE state = 'waiting' AND (perform_at IS NULL OR perform_at <= $1)
"#;

pub(crate) const BUSY_QUEUES: &str = r#"
SELECT DISTINCT queue FROM dray_jobs
WHERE state IN ('locked', 'started') AND queue IS NOT NULL
"#;

pub(crate) const CANDIDATES: &str = r#"
SELECT * FROM dray_jobs
WHERE state = 'waiting'
  AND queue IS NOT DISTINCT FROM $1
  AND (perform_at IS NULL OR perform_at <= $2)
ORDER BY priority, created_at, id
LIMIT $3
"#;

pub(crate) const CLAIM: &str = r#"
UPDATE dray_jobs
SET state = 'locked', locked_by = $2, locked_at = now(), updated_at = now()
WHERE id = $1 AND state = 'waiting'
"#;

pub(crate) const INSERT: &str = r#"
INSERT INTO dray_jobs (queue, priority, perform_at, payload, description)
VALUES ($1, $2, $3, $4, $5)
RETURNING id
"#;

pub(crate) const FIND: &str = "SELECT * FROM dray_jobs WHERE id = $1";

pub(crate) const MARK_STARTED: &str = r#"
UPDATE dray_jobs
SET state = 'started', started_at = now(), updated_at = now()
WHERE id = $1 AND state = 'locked'
RETURNING *
"#;

pub(crate) const MARK_SUCCEEDED: &str = r#"
UPDATE dray_jobs
SET state = 'succeeded', succeeded_at = now(), updated_at = now()
WHERE id = $1 AND state = 'started'
RETURNING id
"#;

pub(crate) const MARK_FAILED: &str = r#"
UPDATE dray_jobs
SET state = 'failed', failed_at = now(), last_error = $2, updated_at = now()
WHERE id = $1 AND state IN ('locked', 'started')
RETURNING id
"#;

pub(crate) const RESET: &str = r#"
UPDATE dray_jobs
SET state = 'waiting',
    locked_by = NULL,
    locked_at = NULL,
    started_at = NULL,
    succeeded_at = NULL,
    failed_at = NULL,
    last_error = NULL,
    updated_at = now()
WHERE id = $1 AND ($2 OR state IN ('succeeded', 'failed'))
RETURNING id
"#;

pub(crate) const CLAIMED_ON_HOST: &str = r#"
SELECT * FROM dray_jobs
WHERE state IN ('locked', 'started') AND starts_with(locked_by, $1)
ORDER BY id
"#;

pub(crate) const LOCKED_BEFORE: &str = r#"
SELECT id FROM dray_jobs WHERE state = 'locked' AND locked_at < $1 ORDER BY id
"#;

pub(crate) const STARTED_BEFORE: &str = r#"
SELECT id FROM dray_jobs WHERE state = 'started' AND started_at < $1 ORDER BY id
"#;

pub(crate) const DELETE_SUCCEEDED_BEFORE: &str = r#"
DELETE FROM dray_jobs WHERE state = 'succeeded' AND updated_at <= $1
"#;

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct JobRow {
    id: i64,
    state: String,
    queue: Option<String>,
    priority: i32,
    perform_at: Option<PgDateTime>,
    payload: Vec<u8>,
    locked_by: Option<String>,
    locked_at: Option<PgDateTime>,
    started_at: Option<PgDateTime>,
    succeeded_at: Option<PgDateTime>,
    failed_at: Option<PgDateTime>,
    last_error: Option<String>,
    description: Option<String>,
    created_at: PgDateTime,
    updated_at: PgDateTime,
}

impl TryFrom<JobRow> for JobRecord {
    type Error = Error;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(JobRecord {
            id: row.id,
            state: row.state.parse()?,
            queue: row.queue,
            priority: row.priority,
            perform_at: row.perform_at.map(|t| t.0),
            payload: row.payload,
            locked_by: row.locked_by,
            locked_at: row.locked_at.map(|t| t.0),
            started_at: row.started_at.map(|t| t.0),
            succeeded_at: row.succeeded_at.map(|t| t.0),
            failed_at: row.failed_at.map(|t| t.0),
            last_error: row.last_error,
            description: row.description,
            created_at: row.created_at.0,
            updated_at: row.updated_at.0,
        })
    }
}
