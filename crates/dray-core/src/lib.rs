//! Scheduling engine of the dray job queue.
//!
//! Jobs live in a shared store. Each worker process runs a [`Poller`] that,
//! under a cluster-wide lock, claims as many eligible jobs as its
//! [`ExecutionPool`] has idle slots and hands them to a [`Performer`]. Queues
//! are serialized: a named queue never has more than one job claimed or
//! running at a time. The [`daemon`] module keeps a fleet of worker
//! processes alive.
//!
//! Storage stays behind the [`JobStore`] trait; [`MemoryStore`] is the
//! in-process implementation used by tests.
pub mod config;
pub mod daemon;
pub mod error;
pub mod job;
pub mod jobs;
pub mod memory;
pub mod performer;
pub mod poller;
pub mod pool;
pub mod process;
pub mod registry;
pub mod store;
mod utils;
pub mod worker;

pub use config::{Config, Queue};
pub use daemon::{Daemon, DaemonBuilder, Report, WorkerCommand};
pub use error::{BoxError, Error, ErrorKind, StateMismatch};
pub use job::{Envelope, JobId, JobRecord, JobState, NewJob, WorkerId};
pub use memory::MemoryStore;
pub use performer::{Performer, PerformerInfo};
pub use poller::{Poller, PollerState, StuckJobs, clean_stuck_jobs};
pub use pool::ExecutionPool;
pub use registry::{
    DecodedJob, JobContext, JobData, JobDecoder, JobHandler, JobRegistry, TransactionMode,
};
pub use store::{ClaimSession, JobStore};
pub use worker::{Worker, WorkerBuilder, WorkerState};
