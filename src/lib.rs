pub use dray_core::{
    BoxError, ClaimSession, Config, Daemon, DaemonBuilder, Error, ErrorKind, JobContext, JobData,
    JobHandler, JobId, JobRecord, JobRegistry, JobState, JobStore, MemoryStore, NewJob, Queue,
    Report, TransactionMode, Worker, WorkerBuilder, WorkerCommand, WorkerId, WorkerState,
};
pub use dray_core::{daemon, jobs, process};

#[cfg(feature = "postgres")]
pub use dray_sqlx::{PgSession, PgStore};
