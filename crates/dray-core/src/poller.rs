//! The scheduling engine.
//!
//! Each cycle takes the cluster-wide lock, asks the worker how many slots are
//! idle, picks that many eligible jobs (one per busy-free named queue, as many
//! as fit from the open queue, best priority first), claims them, commits and
//! only then hands the ids to the worker. The lock is never held while a job
//! runs.

use std::{
    collections::{BTreeMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, SystemTime},
};

use futures::StreamExt as _;
use tokio::sync::{Notify, watch};
use tokio_util::sync::CancellationToken;
use tracing::Instrument as _;

use crate::{
    config::Queue,
    error::{Error, ErrorKind},
    job::{JobId, JobRecord, JobState},
    process::{current_memory_mb, process_alive},
    store::{ClaimSession, JobStore},
    utils::{Ticker, clamp_duration},
    worker::{Control, Shared},
};

const MIN_LOCK_TIMEOUT: Duration = Duration::from_millis(100);
const MAX_LOCK_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    NotRunning,
    Running,
    ShuttingDown,
    Stopped,
}

/// Wakes the poll loop before its interval elapses.
#[derive(Debug, Default)]
pub(crate) struct Repoll {
    requested: AtomicBool,
    notify: Notify,
}

impl Repoll {
    pub(crate) fn request(&self) {
        tracing::debug!("Aborting next sleep to perform instant repoll");
        self.requested.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn clear(&self) {
        self.requested.store(false, Ordering::SeqCst);
    }

    async fn requested(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.requested.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }
}

pub struct Poller<S: JobStore> {
    shared: Arc<Shared<S>>,
    repoll: Arc<Repoll>,
    state: Arc<watch::Sender<PollerState>>,
    cancel: CancellationToken,
}

impl<S: JobStore> Clone for Poller<S> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            repoll: self.repoll.clone(),
            state: self.state.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl<S: JobStore> Poller<S> {
    pub(crate) fn new(shared: Arc<Shared<S>>, repoll: Arc<Repoll>) -> Self {
        Self {
            shared,
            repoll,
            state: Arc::new(watch::Sender::new(PollerState::NotRunning)),
            cancel: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> PollerState {
        *self.state.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.state() == PollerState::Running
    }

    /// Spawn the poll loop.
    pub fn start(&self) -> Result<(), Error> {
        let started = self.state.send_if_modified(|state| {
            if *state == PollerState::NotRunning {
                *state = PollerState::Running;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(Error::usage("Poller is already running."));
        }

        let span = tracing::info_span!("worker", id = %self.shared.id);
        let poll_loop = PollLoop {
            poller: self.clone(),
            lock_fails: 0,
            lock_fails_reported: false,
            memory_exceeded: false,
        };
        tokio::spawn(poll_loop.run().instrument(span));
        Ok(())
    }

    /// Stop at the next interruption point and wait for the loop to exit.
    pub async fn shutdown(&self) -> Result<(), Error> {
        if self.state() == PollerState::NotRunning {
            return Err(Error::usage("Poller is not running."));
        }
        self.state.send_if_modified(|state| {
            if *state == PollerState::Running {
                *state = PollerState::ShuttingDown;
                true
            } else {
                false
            }
        });
        self.cancel.cancel();
        self.wait().await;
        Ok(())
    }

    /// Wait for the loop to exit. Returns at once if it never started.
    pub async fn wait(&self) {
        let mut state = self.state.subscribe();
        let _ = state
            .wait_for(|state| matches!(state, PollerState::NotRunning | PollerState::Stopped))
            .await;
    }

    /// Interrupt the current sleep and poll again right away.
    pub fn instant_repoll(&self) {
        self.repoll.request();
    }
}

struct PollLoop<S: JobStore> {
    poller: Poller<S>,
    lock_fails: u32,
    lock_fails_reported: bool,
    memory_exceeded: bool,
}

impl<S: JobStore> PollLoop<S> {
    async fn run(mut self) {
        let shared = self.poller.shared.clone();
        let cancel = self.poller.cancel.clone();

        if shared.config.cleans_stuck_jobs() {
            if let Err(error) = clean_stuck_jobs(&shared.store, shared.id.host()).await {
                self.fail(error);
                self.poller.state.send_replace(PollerState::Stopped);
                return;
            }
        }

        let ticker = Ticker::new(shared.config.interval());
        futures::pin_mut!(ticker);

        while !cancel.is_cancelled() {
            if self.memory_exceeded {
                // Waiting for the soft shutdown to stop us.
            } else if !self.memory_ok() {
                self.memory_exceeded = true;
                shared.send(Control::MemoryExceeded);
            } else if let Err(error) = self.poll().await {
                self.fail(error);
                break;
            }

            ticker.as_mut().restart();
            tokio::select! {
                _ = ticker.next() => {}
                _ = self.poller.repoll.requested() => {}
                _ = cancel.cancelled() => {}
            }
        }

        self.poller.state.send_replace(PollerState::Stopped);
    }

    fn fail(&self, error: Error) {
        let shared = &self.poller.shared;
        tracing::error!(error = %error.report(), "Poll encountered exception");
        tracing::info!("Worker shutting down...");
        if !shared.config.silences_poller_exceptions() {
            shared.config.report_exception(&error);
        }
        shared.send(Control::PollFailed);
    }

    fn memory_ok(&self) -> bool {
        let shared = &self.poller.shared;
        let max = shared.config.memory_ceiling_mb();
        if max == 0 {
            return true;
        }
        match current_memory_mb() {
            None => {
                tracing::warn!(
                    pid = shared.id.pid(),
                    "Could not determine memory consumption of worker"
                );
                false
            }
            Some(mb) if mb > max => {
                tracing::warn!(
                    "Worker process {} memory consumption (RSS) of {mb}MB exceeds configured \
                     per-worker limit of {max}MB and is now being shut down. Make sure that your \
                     worker processes are watched (e.g. using the \"watch\" command) for this \
                     worker to be restarted automatically.",
                    shared.id
                );
                false
            }
            Some(_) => true,
        }
    }

    async fn poll(&mut self) -> Result<(), Error> {
        let shared = self.poller.shared.clone();
        self.poller.repoll.clear();

        let timeout = clamp_duration(shared.config.interval(), MIN_LOCK_TIMEOUT, MAX_LOCK_TIMEOUT);
        let Some(mut session) = shared.store.begin_claim(timeout).await? else {
            self.lock_failed(timeout);
            return Ok(());
        };
        self.lock_fails = 0;
        self.lock_fails_reported = false;

        let claimed = match claim_jobs(&mut session, &shared).await {
            Ok(claimed) => claimed,
            Err(error) => {
                let _ = session.rollback().await;
                return Err(error);
            }
        };

        if self.poller.cancel.is_cancelled() {
            tracing::info!(
                "Rolling back transaction to unlock jobs, as worker has been shut down in the meantime"
            );
            return session.rollback().await;
        }
        session.commit().await?;

        // Committed claims are always dispatched; the pool drains only after
        // this loop has stopped.
        for job_id in claimed {
            shared.perform(job_id);
        }
        Ok(())
    }

    fn lock_failed(&mut self, timeout: Duration) {
        let config = &self.poller.shared.config;
        let max = config.lock_fail_threshold();
        self.lock_fails += 1;

        if !self.lock_fails_reported {
            tracing::warn!("Could not obtain global lock, retrying with next poll.");
        }
        if self.lock_fails > max && !self.lock_fails_reported {
            self.lock_fails_reported = true;
            tracing::warn!(
                "Could not obtain global lock, retrying with next poll. This will be the last \
                 such message for this worker until the issue is resolved."
            );
            let error = Error::new(
                ErrorKind::Lock,
                format!(
                    "Worker reached maximum number of consecutive times ({max}) where the global \
                     lock could not be acquired within the specified timeout ({timeout:?}). A \
                     worker that obtained this lock may have crashed without ending its database \
                     session properly. This message will be issued only once per worker and may \
                     only be re-triggered if the error happens again after the lock has been \
                     acquired in the meantime."
                ),
            );
            tracing::error!(error = %error, "Global lock unavailable");
            config.report_exception(&error);
        }
    }
}

async fn claim_jobs<S: JobStore>(
    session: &mut S::Session,
    shared: &Shared<S>,
) -> Result<Vec<JobId>, Error> {
    let idle = shared.idle();
    tracing::debug!("Polling DB for jobs ({idle} available slots)...");
    if idle == 0 {
        return Ok(Vec::new());
    }

    let jobs = select_jobs(session, shared.config.allowed_queues(), idle, SystemTime::now()).await?;
    let mut claimed = Vec::with_capacity(jobs.len());
    for job in jobs {
        tracing::debug!(job_id = job.id, "Marking job as locked");
        if session.claim(job.id, &shared.id).await? {
            claimed.push(job.id);
        } else {
            tracing::debug!(job_id = job.id, "Job was claimed by another worker, skipping");
        }
    }
    Ok(claimed)
}

/// Pick at most `limit` jobs to claim in this cycle.
pub async fn select_jobs<C: ClaimSession>(
    session: &mut C,
    allowed: &[Queue],
    limit: usize,
    now: SystemTime,
) -> Result<Vec<JobRecord>, Error> {
    let waiting = session.waiting_queues(now).await?;
    let busy = session.busy_queues().await?;

    let mut parts = Vec::new();
    for queue in valid_queues(waiting, &busy, allowed) {
        let take = if queue.is_none() { limit } else { 1 };
        parts.push(session.candidates(queue.as_deref(), now, take).await?);
    }
    Ok(merge_candidates(parts, limit))
}

/// Queues with eligible work that may receive a claim: named queues without
/// an active job, the open queue always, both filtered by the allow-list.
fn valid_queues(
    waiting: Vec<Option<String>>,
    busy: &[String],
    allowed: &[Queue],
) -> Vec<Option<String>> {
    let busy = busy.iter().map(String::as_str).collect::<HashSet<_>>();
    let mut queues = waiting
        .into_iter()
        .filter(|queue| queue.as_deref().is_none_or(|name| !busy.contains(name)))
        .filter(|queue| allowed.is_empty() || allowed.iter().any(|q| q.matches(queue.as_deref())))
        .collect::<Vec<_>>();
    queues.sort();
    queues.dedup();
    queues
}

/// Union of the per-queue candidates in execution order, capped at `limit`.
fn merge_candidates(parts: Vec<Vec<JobRecord>>, limit: usize) -> Vec<JobRecord> {
    let mut jobs = parts.into_iter().flatten().collect::<Vec<_>>();
    jobs.sort_by_key(|job| (job.priority, job.created_at, job.id));
    jobs.dedup_by_key(|job| job.id);
    jobs.truncate(limit);
    jobs
}

/// Outcome of [`clean_stuck_jobs`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StuckJobs {
    /// Jobs returned to `waiting` (claimed, never started).
    pub reset: Vec<JobId>,
    /// Jobs marked `failed` (started by a process that is gone).
    pub failed: Vec<JobId>,
}

/// Recover jobs claimed on `host` by processes that no longer exist.
///
/// Locked jobs never ran and go back to `waiting`. Started jobs may have run
/// partially, so they are failed instead of being retried.
pub async fn clean_stuck_jobs<S: JobStore>(store: &S, host: &str) -> Result<StuckJobs, Error> {
    let Some(session) = store.begin_claim(MAX_LOCK_TIMEOUT).await? else {
        tracing::warn!("Could not obtain global lock, skipping stuck job cleanup.");
        return Ok(StuckJobs::default());
    };

    let result = reclaim_orphans(store, host).await;
    session.commit().await?;
    result
}

async fn reclaim_orphans<S: JobStore>(store: &S, host: &str) -> Result<StuckJobs, Error> {
    let mut by_pid = BTreeMap::<u32, Vec<JobRecord>>::new();
    for job in store.claimed_on_host(host).await? {
        if let Some(owner) = job.claimed_by() {
            by_pid.entry(owner.pid()).or_default().push(job);
        }
    }

    let mut outcome = StuckJobs::default();
    for (pid, jobs) in by_pid {
        if process_alive(pid) {
            continue;
        }
        for job in jobs {
            match job.state {
                JobState::Locked => {
                    tracing::warn!(
                        "Job #{} has been locked but not yet started by PID {pid} on host {host}, \
                         but the process is not running anymore. This job has therefore been \
                         reset (set to 'waiting') by the cleanup logic.",
                        job.id
                    );
                    store.reset(job.id, true).await?;
                    outcome.reset.push(job.id);
                }
                JobState::Started => {
                    let message = format!(
                        "Job has been started by PID {pid} on host {host} but the process is not \
                         running anymore. This job has therefore been marked as failed by the \
                         cleanup logic."
                    );
                    tracing::warn!("Job #{}: {message}", job.id);
                    store.mark_failed(job.id, &message).await?;
                    outcome.failed.push(job.id);
                }
                _ => {}
            }
        }
    }
    Ok(outcome)
}
