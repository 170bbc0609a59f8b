//! Typed job registry: payload type tags resolved to registered handlers.
//!
//! A payload is an [`Envelope`] `{ "type": <tag>, "args": <json> }`. The
//! registry looks the tag up, deserializes `args` into the handler's data
//! type and hands back a runnable job. Unknown tags are decode errors, so a
//! worker never executes anything it was not told about.

use std::{collections::HashMap, marker::PhantomData, sync::Arc};

use futures::{FutureExt as _, future::BoxFuture};
use serde::de::{DeserializeOwned, IgnoredAny};
use tokio::sync::{Mutex, MutexGuard};

use crate::{
    error::{BoxError, Error, ErrorKind},
    job::{Envelope, JobRecord},
    store::JobStore,
};

/// Whether a job body runs inside a store transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionMode {
    /// Follow the worker's `perform_jobs_in_tx` setting.
    #[default]
    Inherit,
    Always,
    Never,
}

impl TransactionMode {
    fn preference(self) -> Option<bool> {
        match self {
            TransactionMode::Inherit => None,
            TransactionMode::Always => Some(true),
            TransactionMode::Never => Some(false),
        }
    }
}

/// Explicitly opt-in to receive the decoded arguments.
pub struct JobData<T>(pub T);

/// Explicitly opt-in to receive the running job's environment.
pub struct JobContext<S: JobStore> {
    record: JobRecord,
    store: S,
    transaction: Arc<Mutex<Option<S::Transaction>>>,
}

impl<S: JobStore> JobContext<S> {
    pub(crate) fn new(
        record: JobRecord,
        store: S,
        transaction: Arc<Mutex<Option<S::Transaction>>>,
    ) -> Self {
        Self {
            record,
            store,
            transaction,
        }
    }

    /// The job record as it was when the job was started.
    pub fn record(&self) -> &JobRecord {
        &self.record
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// The transaction wrapping this job body, `None` when the job runs
    /// outside a transaction.
    pub async fn transaction(&self) -> MutexGuard<'_, Option<S::Transaction>> {
        self.transaction.lock().await
    }
}

/// Trait implemented by functions that process a job.
///
/// The `M` type parameter determines which combination of [`JobData`] and
/// [`JobContext`] the handler expects.
pub trait JobHandler<M, S: JobStore>: Clone + Send + Sync + 'static {
    /// Arguments decoded from the payload.
    type Data: DeserializeOwned + Send + 'static;

    type Future: Future<Output = Result<(), BoxError>> + Send + 'static;

    fn call(self, data: Self::Data, context: JobContext<S>) -> Self::Future;
}

impl<F, Fut, S> JobHandler<(), S> for F
where
    S: JobStore,
    F: FnOnce() -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    type Data = IgnoredAny;
    type Future = Fut;

    fn call(self, _data: Self::Data, _context: JobContext<S>) -> Self::Future {
        self()
    }
}

impl<F, Fut, T, S> JobHandler<JobData<T>, S> for F
where
    S: JobStore,
    T: DeserializeOwned + Send + 'static,
    F: FnOnce(JobData<T>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    type Data = T;
    type Future = Fut;

    fn call(self, data: Self::Data, _context: JobContext<S>) -> Self::Future {
        self(JobData(data))
    }
}

impl<F, Fut, S> JobHandler<JobContext<S>, S> for F
where
    S: JobStore,
    F: FnOnce(JobContext<S>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    type Data = IgnoredAny;
    type Future = Fut;

    fn call(self, _data: Self::Data, context: JobContext<S>) -> Self::Future {
        self(context)
    }
}

impl<F, Fut, T, S> JobHandler<(JobData<T>, JobContext<S>), S> for F
where
    S: JobStore,
    T: DeserializeOwned + Send + 'static,
    F: FnOnce(JobData<T>, JobContext<S>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    type Data = T;
    type Future = Fut;

    fn call(self, data: Self::Data, context: JobContext<S>) -> Self::Future {
        self(JobData(data), context)
    }
}

type RunJob<S> =
    Box<dyn FnOnce(JobContext<S>) -> BoxFuture<'static, Result<(), BoxError>> + Send + 'static>;

/// A payload resolved into something the performer can run.
pub struct DecodedJob<S: JobStore> {
    job_type: String,
    in_transaction: Option<bool>,
    run: RunJob<S>,
}

impl<S: JobStore> DecodedJob<S> {
    /// `in_transaction` of `None` defers to the worker configuration.
    pub fn new<F, Fut>(job_type: impl Into<String>, in_transaction: Option<bool>, run: F) -> Self
    where
        F: FnOnce(JobContext<S>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        Self {
            job_type: job_type.into(),
            in_transaction,
            run: Box::new(move |context| run(context).boxed()),
        }
    }

    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    pub fn in_transaction(&self) -> Option<bool> {
        self.in_transaction
    }

    pub(crate) fn run(self, context: JobContext<S>) -> BoxFuture<'static, Result<(), BoxError>> {
        (self.run)(context)
    }
}

impl<S: JobStore> std::fmt::Debug for DecodedJob<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodedJob")
            .field("job_type", &self.job_type)
            .field("in_transaction", &self.in_transaction)
            .finish_non_exhaustive()
    }
}

/// Turns stored payload bytes into a runnable job.
pub trait JobDecoder<S: JobStore>: Send + Sync + 'static {
    fn decode(&self, payload: &[u8]) -> Result<DecodedJob<S>, Error>;
}

trait ErasedHandler<S: JobStore>: Send + Sync {
    fn prepare(&self, job_type: &str, args: serde_json::Value) -> Result<DecodedJob<S>, Error>;
}

struct Registered<H, M> {
    handler: H,
    mode: TransactionMode,
    _marker: PhantomData<fn() -> M>,
}

impl<H, M, S> ErasedHandler<S> for Registered<H, M>
where
    S: JobStore,
    H: JobHandler<M, S>,
    M: 'static,
{
    fn prepare(&self, job_type: &str, args: serde_json::Value) -> Result<DecodedJob<S>, Error> {
        let data = if args.is_null() {
            // A payload without `args` still decodes into all-default structs.
            serde_json::from_value::<H::Data>(serde_json::Value::Null).or_else(|error| {
                serde_json::from_value(serde_json::Value::Object(Default::default()))
                    .map_err(|_| error)
            })?
        } else {
            serde_json::from_value::<H::Data>(args)?
        };
        let handler = self.handler.clone();
        Ok(DecodedJob::new(
            job_type,
            self.mode.preference(),
            move |context| handler.call(data, context),
        ))
    }
}

/// Maps payload type tags to handlers.
pub struct JobRegistry<S: JobStore> {
    handlers: HashMap<String, Arc<dyn ErasedHandler<S>>>,
}

impl<S: JobStore> Default for JobRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: JobStore> JobRegistry<S> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register `handler` under `job_type`, replacing any previous handler.
    pub fn register<M, H>(self, job_type: impl Into<String>, handler: H) -> Self
    where
        H: JobHandler<M, S>,
        M: 'static,
    {
        self.register_with(job_type, TransactionMode::Inherit, handler)
    }

    /// Like [`register`](Self::register) with an explicit transaction mode.
    pub fn register_with<M, H>(
        mut self,
        job_type: impl Into<String>,
        mode: TransactionMode,
        handler: H,
    ) -> Self
    where
        H: JobHandler<M, S>,
        M: 'static,
    {
        let registered = Registered {
            handler,
            mode,
            _marker: PhantomData,
        };
        self.handlers.insert(job_type.into(), Arc::new(registered));
        self
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }
}

impl<S: JobStore> JobDecoder<S> for JobRegistry<S> {
    fn decode(&self, payload: &[u8]) -> Result<DecodedJob<S>, Error> {
        let Envelope { job_type, args } = Envelope::decode(payload)?;
        let handler = self.handlers.get(&job_type).ok_or_else(|| {
            Error::new(
                ErrorKind::Decode,
                format!("No job is registered for type {job_type:?}."),
            )
        })?;
        handler.prepare(&job_type, args)
    }
}
