//! Built-in maintenance jobs.
//!
//! Both are meant to be enqueued periodically by the application. Stale job
//! detection only reports: it fails with a descriptive message so the
//! exception callback can alert an operator.

use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::{
    config::Config,
    error::{BoxError, Error},
    job::{JobId, NewJob},
    registry::{JobContext, JobData, JobRegistry},
    store::JobStore,
};

pub const DETECT_STALE_JOBS: &str = "dray.detect_stale_jobs";
pub const CLEANUP_SUCCEEDED_JOBS: &str = "dray.cleanup_succeeded_jobs";

const DEFAULT_MAX_AGE_DAYS: u64 = 14;
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Jobs locked longer than `locked_threshold` or started longer than
/// `run_time_threshold` ago. A zero threshold disables that check.
pub async fn detect_stale_jobs<S: JobStore>(
    store: &S,
    locked_threshold: Duration,
    run_time_threshold: Duration,
) -> Result<(), BoxError> {
    let now = SystemTime::now();
    let mut messages = Vec::new();

    if !locked_threshold.is_zero() {
        let ids = store.locked_before(cutoff(now, locked_threshold)).await?;
        if !ids.is_empty() {
            messages.push(format!(
                "Detected {} jobs that were locked more than {}s ago and might be stale: {}.",
                ids.len(),
                locked_threshold.as_secs(),
                format_ids(&ids)
            ));
        }
    }

    if !run_time_threshold.is_zero() {
        let ids = store.started_before(cutoff(now, run_time_threshold)).await?;
        if !ids.is_empty() {
            messages.push(format!(
                "Detected {} jobs that are running for longer than {}s and might be stale: {}.",
                ids.len(),
                run_time_threshold.as_secs(),
                format_ids(&ids)
            ));
        }
    }

    if messages.is_empty() {
        Ok(())
    } else {
        Err(messages.join(" ").into())
    }
}

/// Arguments of [`CLEANUP_SUCCEEDED_JOBS`]; a payload without them keeps
/// succeeded jobs for 14 days.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupArgs {
    #[serde(default = "default_max_age_days")]
    pub max_age_days: u64,
}

impl Default for CleanupArgs {
    fn default() -> Self {
        Self {
            max_age_days: DEFAULT_MAX_AGE_DAYS,
        }
    }
}

fn default_max_age_days() -> u64 {
    DEFAULT_MAX_AGE_DAYS
}

/// Delete succeeded jobs last updated more than `max_age_days` ago.
pub async fn cleanup_succeeded_jobs<S: JobStore>(
    store: &S,
    max_age_days: u64,
) -> Result<u64, BoxError> {
    let max_age = DAY.saturating_mul(u32::try_from(max_age_days).unwrap_or(u32::MAX));
    let deleted = store
        .delete_succeeded_before(cutoff(SystemTime::now(), max_age))
        .await?;
    tracing::info!(deleted, max_age_days, "Cleaned up succeeded jobs");
    Ok(deleted)
}

fn cutoff(now: SystemTime, age: Duration) -> SystemTime {
    now.checked_sub(age).unwrap_or(SystemTime::UNIX_EPOCH)
}

fn format_ids(ids: &[JobId]) -> String {
    let ids = ids.iter().map(ToString::to_string).collect::<Vec<_>>();
    format!("[{}]", ids.join(", "))
}

/// Enqueue descriptor for [`DETECT_STALE_JOBS`].
pub fn detect_stale_jobs_job() -> Result<NewJob, Error> {
    Ok(NewJob::new(DETECT_STALE_JOBS, &())?.description("Detect stale jobs"))
}

/// Enqueue descriptor for [`CLEANUP_SUCCEEDED_JOBS`].
pub fn cleanup_succeeded_jobs_job(max_age_days: u64) -> Result<NewJob, Error> {
    let args = CleanupArgs { max_age_days };
    Ok(NewJob::new(CLEANUP_SUCCEEDED_JOBS, &args)?.description("Clean up succeeded jobs"))
}

impl<S: JobStore> JobRegistry<S> {
    /// Register the maintenance jobs, using the stale thresholds of `config`.
    pub fn with_maintenance_jobs(self, config: &Config) -> Self {
        let locked_threshold = config.locked_threshold();
        let run_time_threshold = config.run_time_threshold();

        self.register(DETECT_STALE_JOBS, move |context: JobContext<S>| async move {
            detect_stale_jobs(context.store(), locked_threshold, run_time_threshold).await
        })
        .register(
            CLEANUP_SUCCEEDED_JOBS,
            |JobData(args): JobData<CleanupArgs>, context: JobContext<S>| async move {
                cleanup_succeeded_jobs(context.store(), args.max_age_days)
                    .await
                    .map(|_| ())
            },
        )
    }
}
