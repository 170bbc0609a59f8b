//! A worker owns one poller and one execution pool.
//!
//! Lifecycle: `initialized -> running -> shutting down -> shutdown`, with a
//! `soft shutdown` detour where the worker stops accepting claims and drains
//! its slots before shutting down and leaving a restart marker behind.
//!
//! OS signals, poll failures and the memory ceiling are all turned into
//! [`Control`] events and sequenced by a single control task, so no shutdown
//! logic runs inside a signal handler.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};

use tokio::{
    signal::unix::{Signal, SignalKind, signal},
    sync::{mpsc, watch},
};
use tracing::Instrument as _;

use crate::{
    config::Config,
    error::Error,
    job::{JobId, WorkerId},
    performer::Performer,
    poller::{Poller, Repoll},
    pool::ExecutionPool,
    process::write_shutdown_marker,
    registry::JobDecoder,
    store::JobStore,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Initialized,
    Running,
    /// Not accepting claims, draining busy slots.
    SoftShutdown,
    ShuttingDown,
    Shutdown,
}

impl WorkerState {
    pub const fn as_str(self) -> &'static str {
        match self {
            WorkerState::Initialized => "initialized",
            WorkerState::Running => "running",
            WorkerState::SoftShutdown => "soft_shutdown",
            WorkerState::ShuttingDown => "shutting_down",
            WorkerState::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Control {
    Shutdown,
    SoftRestart,
    ReopenLogs,
    PollFailed,
    MemoryExceeded,
}

/// State shared by the worker handle, the poll loop and running jobs.
pub(crate) struct Shared<S: JobStore> {
    pub(crate) id: WorkerId,
    pub(crate) config: Config,
    pub(crate) store: S,
    decoder: Arc<dyn JobDecoder<S>>,
    pool: ExecutionPool,
    state: Mutex<WorkerState>,
    accepting: AtomicBool,
    control: mpsc::UnboundedSender<Control>,
}

impl<S: JobStore> Shared<S> {
    fn state(&self) -> WorkerState {
        *self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, state: WorkerState) {
        *self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = state;
    }

    /// Slots the poller may fill. Zero once the worker stopped accepting.
    pub(crate) fn idle(&self) -> usize {
        if self.accepting.load(Ordering::SeqCst) {
            self.pool.idle()
        } else {
            0
        }
    }

    pub(crate) fn send(&self, event: Control) {
        // The receiver only goes away together with the worker.
        let _ = self.control.send(event);
    }

    /// Post a performer for `job_id` to the pool.
    ///
    /// Failures are reported through the exception callback, never returned
    /// to the poll loop.
    pub(crate) fn perform(self: &Arc<Self>, job_id: JobId) {
        let state = self.state();
        if matches!(state, WorkerState::Initialized | WorkerState::Shutdown) {
            let error = Error::usage(format!(
                "Expected worker to be running but current state is {state}."
            ));
            self.config.report_exception(&error);
            return;
        }

        tracing::debug!(job_id, "Posting job to execution pool");
        let performer = Performer::new(
            job_id,
            self.id.clone(),
            self.store.clone(),
            self.decoder.clone(),
            self.config.performs_jobs_in_tx(),
        );
        let shared = self.clone();
        let span = tracing::info_span!("job", job_id);
        let posted = self.pool.post(
            async move {
                if let Err(error) = performer.perform().await {
                    shared.config.report_exception(&error);
                }
            }
            .instrument(span),
        );
        if let Err(error) = posted {
            tracing::error!(job_id, error = %error, "Could not post job to execution pool");
            self.config.report_exception(&error);
        }
    }
}

/// Builder for [`Worker`].
pub struct WorkerBuilder<S: JobStore> {
    store: S,
    decoder: Arc<dyn JobDecoder<S>>,
    config: Config,
    id: Option<WorkerId>,
}

impl<S: JobStore> WorkerBuilder<S> {
    pub fn new<D>(store: S, decoder: D) -> Self
    where
        D: JobDecoder<S>,
    {
        Self {
            store,
            decoder: Arc::new(decoder),
            config: Config::default(),
            id: None,
        }
    }

    pub fn config(self, config: Config) -> Self {
        Self { config, ..self }
    }

    /// Override the generated `host.pid.token` identity.
    pub fn worker_id(self, id: WorkerId) -> Self {
        Self {
            id: Some(id),
            ..self
        }
    }

    pub fn build(self) -> Result<Worker<S>, Error> {
        self.config.validate()?;

        let repoll = Arc::new(Repoll::default());
        let pool = if self.config.repolls_instantly() {
            let repoll = repoll.clone();
            ExecutionPool::with_on_idle(self.config.pool_size(), Arc::new(move || repoll.request()))
        } else {
            ExecutionPool::new(self.config.pool_size())
        };

        let (control, receiver) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            id: self.id.unwrap_or_else(WorkerId::generate),
            config: self.config,
            store: self.store,
            decoder: self.decoder,
            pool,
            state: Mutex::new(WorkerState::Initialized),
            accepting: AtomicBool::new(true),
            control,
        });
        let poller = Poller::new(shared.clone(), repoll);

        Ok(Worker {
            shared,
            poller,
            receiver: Arc::new(Mutex::new(Some(receiver))),
            done: Arc::new(watch::Sender::new(false)),
        })
    }
}

pub struct Worker<S: JobStore> {
    shared: Arc<Shared<S>>,
    poller: Poller<S>,
    receiver: Arc<Mutex<Option<mpsc::UnboundedReceiver<Control>>>>,
    done: Arc<watch::Sender<bool>>,
}

impl<S: JobStore> Clone for Worker<S> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            poller: self.poller.clone(),
            receiver: self.receiver.clone(),
            done: self.done.clone(),
        }
    }
}

impl<S: JobStore> std::fmt::Debug for Worker<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .field("pool", &self.shared.pool)
            .finish()
    }
}

impl<S: JobStore> Worker<S> {
    pub fn id(&self) -> &WorkerId {
        &self.shared.id
    }

    pub fn state(&self) -> WorkerState {
        self.shared.state()
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn poller(&self) -> &Poller<S> {
        &self.poller
    }

    /// Idle slots as seen by the poller.
    pub fn idle(&self) -> usize {
        self.shared.idle()
    }

    /// Dispatch a claimed job to the pool.
    pub fn perform(&self, job_id: JobId) {
        self.shared.perform(job_id);
    }

    /// Start polling and install the configured signal handlers.
    pub async fn start(&self) -> Result<(), Error> {
        {
            let mut state = self
                .shared
                .state
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if *state != WorkerState::Initialized {
                return Err(Error::usage(format!(
                    "Expected worker to be in state initialized but current state is {}.",
                    *state
                )));
            }
            *state = WorkerState::Running;
        }

        let span = tracing::info_span!("worker", id = %self.shared.id);
        tracing::info!(worker = %self.shared.id, "Starting up");

        let signals = match Signals::install(&self.shared.config) {
            Ok(signals) => signals,
            Err(error) => {
                self.shared.set_state(WorkerState::Initialized);
                return Err(error.into());
            }
        };
        let receiver = self
            .receiver
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(receiver) = receiver {
            tokio::spawn(control_loop(self.clone(), receiver, signals).instrument(span));
        }

        self.poller.start()?;
        tracing::info!(worker = %self.shared.id, "Started up");
        Ok(())
    }

    /// Stop polling, drain the pool and reach `shutdown`.
    ///
    /// Calling it again after shutdown is a no-op; calling it while another
    /// shutdown is in progress waits for that one.
    pub async fn shutdown(&self) -> Result<(), Error> {
        let previous = {
            let mut state = self
                .shared
                .state
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let previous = *state;
            if matches!(previous, WorkerState::Running | WorkerState::SoftShutdown) {
                *state = WorkerState::ShuttingDown;
            }
            previous
        };
        match previous {
            WorkerState::Shutdown => return Ok(()),
            WorkerState::ShuttingDown => {
                self.wait().await;
                return Ok(());
            }
            WorkerState::Initialized => {
                return Err(Error::usage(
                    "Expected worker to be in state running but current state is initialized.",
                ));
            }
            WorkerState::Running | WorkerState::SoftShutdown => {}
        }

        tracing::info!(worker = %self.shared.id, "Shutting down");
        self.shared.accepting.store(false, Ordering::SeqCst);
        self.poller.shutdown().await?;
        self.shared.pool.shutdown().await;
        self.shared.set_state(WorkerState::Shutdown);
        self.done.send_replace(true);
        tracing::info!(worker = %self.shared.id, "Shut down");
        Ok(())
    }

    /// Stop accepting claims, let busy slots finish, then shut down and write
    /// the restart marker for the supervisor.
    pub async fn soft_shutdown(&self) -> Result<(), Error> {
        {
            let mut state = self
                .shared
                .state
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            match *state {
                WorkerState::Initialized => {
                    return Err(Error::usage(
                        "Expected worker to be in state running but current state is initialized.",
                    ));
                }
                WorkerState::Running => *state = WorkerState::SoftShutdown,
                WorkerState::SoftShutdown
                | WorkerState::ShuttingDown
                | WorkerState::Shutdown => return Ok(()),
            }
        }

        self.shared.accepting.store(false, Ordering::SeqCst);
        let busy = self.shared.pool.size() - self.shared.pool.idle();
        tracing::info!(
            worker = %self.shared.id,
            busy,
            "Soft restart requested, waiting for busy slots to finish"
        );
        self.shared.pool.wait_idle().await;

        // Written before shutdown so the marker exists once `wait` returns.
        let marker = write_shutdown_marker(self.shared.config.marker_dir(), self.shared.id.pid());
        match &marker {
            Ok(path) => tracing::info!(
                worker = %self.shared.id,
                marker = %path.display(),
                "Wrote shutdown marker"
            ),
            Err(error) => tracing::error!(error = %error, "Could not write shutdown marker"),
        }
        self.shutdown().await?;
        marker.map(|_| ())
    }

    /// Wait until both poller and pool have stopped.
    pub async fn wait(&self) {
        if self.state() == WorkerState::Initialized {
            return;
        }
        let mut done = self.done.subscribe();
        let _ = done.wait_for(|done| *done).await;
    }

    /// Start and block until the worker has shut down.
    pub async fn start_and_wait(&self) -> Result<(), Error> {
        self.start().await?;
        self.wait().await;
        Ok(())
    }

    async fn handle(&self, event: Control) {
        match event {
            Control::Shutdown | Control::PollFailed => {
                if let Err(error) = self.shutdown().await {
                    tracing::error!(error = %error, "Worker shutdown failed");
                }
            }
            Control::SoftRestart => {
                let worker = self.clone();
                tokio::spawn(
                    async move {
                        if let Err(error) = worker.soft_shutdown().await {
                            tracing::error!(error = %error, "Soft restart failed");
                        }
                    }
                    .in_current_span(),
                );
            }
            Control::MemoryExceeded => {
                let config = &self.shared.config;
                if let Err(error) = write_shutdown_marker(config.marker_dir(), self.shared.id.pid()) {
                    tracing::error!(error = %error, "Could not write shutdown marker");
                }
                let worker = self.clone();
                tokio::spawn(
                    async move {
                        if let Err(error) = worker.soft_shutdown().await {
                            tracing::error!(error = %error, "Shutdown after memory check failed");
                        }
                    }
                    .in_current_span(),
                );
            }
            Control::ReopenLogs => {
                tracing::info!("Reopening log files");
                self.shared.config.reopen_logs();
            }
        }
    }
}

struct Signals {
    terminate: Option<Signal>,
    interrupt: Option<Signal>,
    hangup: Option<Signal>,
    soft_restart: Option<Signal>,
}

impl Signals {
    fn install(config: &Config) -> std::io::Result<Self> {
        let optional = |enabled: bool, kind: SignalKind| {
            if enabled { signal(kind).map(Some) } else { Ok(None) }
        };
        Ok(Self {
            terminate: optional(config.auto_terminates(), SignalKind::terminate())?,
            interrupt: optional(config.auto_terminates(), SignalKind::interrupt())?,
            hangup: optional(config.installs_signal_handlers(), SignalKind::hangup())?,
            soft_restart: optional(
                config.installs_signal_handlers(),
                SignalKind::user_defined1(),
            )?,
        })
    }
}

async fn recv(signal: &mut Option<Signal>) -> Option<()> {
    match signal {
        Some(signal) => signal.recv().await,
        None => std::future::pending().await,
    }
}

async fn control_loop<S: JobStore>(
    worker: Worker<S>,
    mut receiver: mpsc::UnboundedReceiver<Control>,
    mut signals: Signals,
) {
    let mut done = worker.done.subscribe();
    loop {
        let event = tokio::select! {
            Some(event) = receiver.recv() => event,
            Some(()) = recv(&mut signals.terminate) => {
                tracing::info!("Caught TERM, shutting worker down...");
                Control::Shutdown
            }
            Some(()) = recv(&mut signals.interrupt) => {
                tracing::info!("Caught INT, shutting worker down...");
                Control::Shutdown
            }
            Some(()) = recv(&mut signals.hangup) => Control::ReopenLogs,
            Some(()) = recv(&mut signals.soft_restart) => {
                tracing::info!("Caught USR1, starting soft restart...");
                Control::SoftRestart
            }
            _ = done.wait_for(|done| *done) => break,
        };
        worker.handle(event).await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{BoxError, ErrorKind, JobRegistry, MemoryStore};

    fn worker() -> Worker<MemoryStore> {
        let registry =
            JobRegistry::<MemoryStore>::new().register("noop", || async { Ok::<_, BoxError>(()) });
        let config = Config::new()
            .polling_interval(Duration::from_millis(100))
            .auto_terminate(false)
            .install_signal_handlers(false);
        WorkerBuilder::new(MemoryStore::new(), registry)
            .config(config)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn cannot_start_twice() {
        let worker = worker();

        worker.start().await.unwrap();
        let error = worker.start().await.unwrap_err();

        assert_eq!(error.kind(), ErrorKind::Usage);
        worker.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let worker = worker();
        worker.start().await.unwrap();

        worker.shutdown().await.unwrap();
        worker.shutdown().await.unwrap();

        assert_eq!(worker.state(), WorkerState::Shutdown);
        worker.wait().await;
    }

    #[tokio::test]
    async fn shutdown_before_start_is_a_usage_error() {
        let worker = worker();

        let error = worker.shutdown().await.unwrap_err();

        assert_eq!(error.kind(), ErrorKind::Usage);
        assert_eq!(worker.state(), WorkerState::Initialized);
    }

    #[tokio::test]
    async fn invalid_config_is_rejected_by_build() {
        let config = Config::new().polling_interval(Duration::from_millis(250));
        let error = WorkerBuilder::new(MemoryStore::new(), JobRegistry::<MemoryStore>::new())
            .config(config)
            .build()
            .unwrap_err();

        assert_eq!(error.kind(), ErrorKind::Config);
    }

    #[tokio::test]
    async fn idle_reports_zero_once_not_accepting() {
        let worker = worker();
        assert_eq!(worker.idle(), 1);

        worker.start().await.unwrap();
        worker.shutdown().await.unwrap();

        assert_eq!(worker.idle(), 0);
    }
}
