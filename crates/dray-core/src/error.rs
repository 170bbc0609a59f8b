//! Error taxonomy shared by every layer of the queue.
//!
//! One error type with a coarse [`ErrorKind`] and a boxed source. The kind is
//! what callers branch on (retry on the next cycle, record on the job, stop
//! the worker); the source carries the detail for logs and `last_error`.

use crate::job::{JobId, JobState};

/// Boxed error accepted from job bodies and backends.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
/// Categorization of failures raised by the queue.
pub enum ErrorKind {
    /// Errors originating from the persistence layer.
    Database,
    /// Serialization of a job payload failed.
    Encode,
    /// A job payload could not be decoded into a registered job.
    Decode,
    /// A state transition was attempted from an unexpected state.
    State,
    /// The execution pool has no idle slot.
    Saturated,
    /// The execution pool no longer accepts work.
    Closed,
    /// The cluster-wide lock could not be obtained repeatedly.
    Lock,
    /// A job body returned an error or panicked.
    Job,
    /// An API was used in a way that is not allowed (double start, ...).
    Usage,
    /// Invalid configuration.
    Config,
    /// Filesystem or process level failure.
    Io,
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    inner: BoxError,
}

impl Error {
    /// Wrap `inner` under the given category.
    pub fn new(kind: ErrorKind, inner: impl Into<BoxError>) -> Self {
        Self {
            kind,
            inner: inner.into(),
        }
    }

    pub(crate) fn usage(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Usage, message.into())
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, message.into())
    }

    /// Return the category of this error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Render the message followed by its `caused by:` chain.
    pub fn report(&self) -> String {
        report_chain(self.inner.as_ref())
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.inner.fmt(f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.inner.as_ref())
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::new(ErrorKind::Decode, value)
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::new(ErrorKind::Io, value)
    }
}

impl From<StateMismatch> for Error {
    fn from(value: StateMismatch) -> Self {
        Self::new(ErrorKind::State, value)
    }
}

impl From<PoolSaturated> for Error {
    fn from(value: PoolSaturated) -> Self {
        Self::new(ErrorKind::Saturated, value)
    }
}

impl From<PoolClosed> for Error {
    fn from(value: PoolClosed) -> Self {
        Self::new(ErrorKind::Closed, value)
    }
}

pub(crate) fn report_chain(error: &(dyn std::error::Error + 'static)) -> String {
    let mut text = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        text.push_str("\ncaused by: ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}

/// A transition was attempted from a state other than the expected one.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Job {id} is not in state {expected:?} but in state {actual}.")]
pub struct StateMismatch {
    pub id: JobId,
    pub expected: Vec<JobState>,
    pub actual: JobState,
}

/// No idle slot was available when posting to the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("All {size} execution slots are busy.")]
pub struct PoolSaturated {
    pub size: usize,
}

/// The pool has been shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("The execution pool has been shut down.")]
pub struct PoolClosed;
