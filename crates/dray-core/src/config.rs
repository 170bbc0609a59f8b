//! Worker configuration, built once and handed to [`WorkerBuilder`].
//!
//! [`WorkerBuilder`]: crate::worker::WorkerBuilder

use std::{path::PathBuf, sync::Arc, time::Duration};

use crate::error::Error;

/// Called for every job, dispatch and poll failure.
pub type ExceptionCallback = Arc<dyn Fn(&Error) + Send + Sync + 'static>;

/// Called when the worker is asked to reopen its log files (SIGHUP).
pub type LogReopenCallback = Arc<dyn Fn() + Send + Sync + 'static>;

/// An entry of the queue allow-list.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Queue {
    /// Jobs enqueued without a queue; they run in parallel.
    Open,
    Named(String),
}

impl Queue {
    pub fn named(name: impl Into<String>) -> Self {
        Queue::Named(name.into())
    }

    /// Whether a job stored with `queue` belongs to this entry.
    pub fn matches(&self, queue: Option<&str>) -> bool {
        match (self, queue) {
            (Queue::Open, None) => true,
            (Queue::Named(name), Some(queue)) => name == queue,
            _ => false,
        }
    }
}

impl From<&str> for Queue {
    fn from(value: &str) -> Self {
        Queue::named(value)
    }
}

impl From<Option<&str>> for Queue {
    fn from(value: Option<&str>) -> Self {
        value.map_or(Queue::Open, Queue::named)
    }
}

const POLLING_GRANULARITY: Duration = Duration::from_millis(100);

#[derive(Clone)]
pub struct Config {
    queues: Vec<Queue>,
    pool_size: Option<usize>,
    polling_interval: Duration,
    auto_terminate: bool,
    install_signal_handlers: bool,
    instant_repolling: bool,
    perform_jobs_in_tx: bool,
    max_global_lock_fails: u32,
    max_worker_memory_mb: u64,
    clean_stuck_jobs: bool,
    silence_poller_exceptions: bool,
    stale_locked_threshold: Duration,
    stale_run_time_threshold: Duration,
    shutdown_marker_dir: PathBuf,
    on_exception: ExceptionCallback,
    on_log_reopen: Option<LogReopenCallback>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            queues: Vec::new(),
            pool_size: None,
            polling_interval: Duration::from_secs(300),
            auto_terminate: true,
            install_signal_handlers: true,
            instant_repolling: false,
            perform_jobs_in_tx: true,
            max_global_lock_fails: 10,
            max_worker_memory_mb: 0,
            clean_stuck_jobs: false,
            silence_poller_exceptions: false,
            stale_locked_threshold: Duration::from_secs(3 * 60),
            stale_run_time_threshold: Duration::from_secs(12 * 60 * 60),
            shutdown_marker_dir: PathBuf::from("tmp/pids"),
            on_exception: Arc::new(|error: &Error| {
                tracing::error!(error = %error.report(), "unhandled exception");
            }),
            on_log_reopen: None,
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("queues", &self.queues)
            .field("pool_size", &self.pool_size())
            .field("polling_interval", &self.polling_interval)
            .field("auto_terminate", &self.auto_terminate)
            .field("install_signal_handlers", &self.install_signal_handlers)
            .field("instant_repolling", &self.instant_repolling)
            .field("perform_jobs_in_tx", &self.perform_jobs_in_tx)
            .field("max_global_lock_fails", &self.max_global_lock_fails)
            .field("max_worker_memory_mb", &self.max_worker_memory_mb)
            .field("clean_stuck_jobs", &self.clean_stuck_jobs)
            .field("silence_poller_exceptions", &self.silence_poller_exceptions)
            .field("shutdown_marker_dir", &self.shutdown_marker_dir)
            .finish_non_exhaustive()
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict the worker to these queues. Empty serves every queue.
    pub fn queues<I, Q>(self, queues: I) -> Self
    where
        I: IntoIterator<Item = Q>,
        Q: Into<Queue>,
    {
        Self {
            queues: queues.into_iter().map(Into::into).collect(),
            ..self
        }
    }

    /// Number of execution slots. Defaults to one per allowed queue plus one.
    pub fn pool_size(&self) -> usize {
        self.pool_size.unwrap_or(self.queues.len() + 1)
    }

    pub fn with_pool_size(self, pool_size: usize) -> Self {
        Self {
            pool_size: Some(pool_size),
            ..self
        }
    }

    /// Must be a positive multiple of 100 ms.
    pub fn polling_interval(self, polling_interval: Duration) -> Self {
        Self {
            polling_interval,
            ..self
        }
    }

    /// Shut down gracefully on SIGTERM / SIGINT.
    pub fn auto_terminate(self, auto_terminate: bool) -> Self {
        Self {
            auto_terminate,
            ..self
        }
    }

    /// Handle SIGHUP (log reopen) and SIGUSR1 (soft restart).
    pub fn install_signal_handlers(self, install_signal_handlers: bool) -> Self {
        Self {
            install_signal_handlers,
            ..self
        }
    }

    /// Cut the poll sleep short as soon as a slot frees up.
    pub fn instant_repolling(self, instant_repolling: bool) -> Self {
        Self {
            instant_repolling,
            ..self
        }
    }

    /// Default for job types registered with [`TransactionMode::Inherit`].
    ///
    /// [`TransactionMode::Inherit`]: crate::registry::TransactionMode::Inherit
    pub fn perform_jobs_in_tx(self, perform_jobs_in_tx: bool) -> Self {
        Self {
            perform_jobs_in_tx,
            ..self
        }
    }

    /// Consecutive lock failures tolerated before reporting an exception.
    pub fn max_global_lock_fails(self, max_global_lock_fails: u32) -> Self {
        Self {
            max_global_lock_fails,
            ..self
        }
    }

    /// Resident memory ceiling in MB. `0` disables the check.
    pub fn max_worker_memory_mb(self, max_worker_memory_mb: u64) -> Self {
        Self {
            max_worker_memory_mb,
            ..self
        }
    }

    /// Recover jobs orphaned by dead processes on this host at startup.
    pub fn clean_stuck_jobs(self, clean_stuck_jobs: bool) -> Self {
        Self {
            clean_stuck_jobs,
            ..self
        }
    }

    pub fn silence_poller_exceptions(self, silence_poller_exceptions: bool) -> Self {
        Self {
            silence_poller_exceptions,
            ..self
        }
    }

    /// `Duration::ZERO` disables the check.
    pub fn stale_locked_threshold(self, stale_locked_threshold: Duration) -> Self {
        Self {
            stale_locked_threshold,
            ..self
        }
    }

    /// `Duration::ZERO` disables the check.
    pub fn stale_run_time_threshold(self, stale_run_time_threshold: Duration) -> Self {
        Self {
            stale_run_time_threshold,
            ..self
        }
    }

    /// Directory holding soft-restart markers, shared with the supervisor.
    pub fn shutdown_marker_dir(self, shutdown_marker_dir: impl Into<PathBuf>) -> Self {
        Self {
            shutdown_marker_dir: shutdown_marker_dir.into(),
            ..self
        }
    }

    pub fn on_exception<F>(self, on_exception: F) -> Self
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        Self {
            on_exception: Arc::new(on_exception),
            ..self
        }
    }

    pub fn on_log_reopen<F>(self, on_log_reopen: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            on_log_reopen: Some(Arc::new(on_log_reopen)),
            ..self
        }
    }

    pub fn allowed_queues(&self) -> &[Queue] {
        &self.queues
    }

    pub fn interval(&self) -> Duration {
        self.polling_interval
    }

    pub fn auto_terminates(&self) -> bool {
        self.auto_terminate
    }

    pub fn installs_signal_handlers(&self) -> bool {
        self.install_signal_handlers
    }

    pub fn repolls_instantly(&self) -> bool {
        self.instant_repolling
    }

    pub fn performs_jobs_in_tx(&self) -> bool {
        self.perform_jobs_in_tx
    }

    pub fn lock_fail_threshold(&self) -> u32 {
        self.max_global_lock_fails
    }

    pub fn memory_ceiling_mb(&self) -> u64 {
        self.max_worker_memory_mb
    }

    pub fn cleans_stuck_jobs(&self) -> bool {
        self.clean_stuck_jobs
    }

    pub fn silences_poller_exceptions(&self) -> bool {
        self.silence_poller_exceptions
    }

    pub fn locked_threshold(&self) -> Duration {
        self.stale_locked_threshold
    }

    pub fn run_time_threshold(&self) -> Duration {
        self.stale_run_time_threshold
    }

    pub fn marker_dir(&self) -> &std::path::Path {
        &self.shutdown_marker_dir
    }

    pub(crate) fn report_exception(&self, error: &Error) {
        (self.on_exception)(error);
    }

    pub(crate) fn reopen_logs(&self) {
        if let Some(on_log_reopen) = &self.on_log_reopen {
            on_log_reopen();
        }
    }

    /// Check the values that cannot be expressed in the types.
    pub fn validate(&self) -> Result<(), Error> {
        let interval = self.polling_interval.as_millis();
        let granularity = POLLING_GRANULARITY.as_millis();
        if interval == 0 || interval % granularity != 0 {
            return Err(Error::config("Polling interval must be a multiple of 0.1 seconds."));
        }
        if self.pool_size() == 0 {
            return Err(Error::config("Pool size must be at least 1."));
        }
        Ok(())
    }
}
