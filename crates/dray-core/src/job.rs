//! The persisted job record and its state machine.
//!
//! ```text
//! waiting -> locked -> started -> succeeded
//!                  \          \-> failed
//!                   \-----------> failed
//! succeeded | failed -> waiting   (reset)
//! ```
//!
//! Stores apply the same transitions as conditional updates; the methods on
//! [`JobRecord`] are the reference semantics used by the in-memory store and
//! by tests.

use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind, StateMismatch};

/// Unique, monotonically increasing job identifier.
pub type JobId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Locked,
    Started,
    Succeeded,
    Failed,
}

impl JobState {
    pub const fn as_str(self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Locked => "locked",
            JobState::Started => "started",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
        }
    }

    /// `succeeded` and `failed` are never touched again by a worker.
    pub const fn is_terminal(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(JobState::Waiting),
            "locked" => Ok(JobState::Locked),
            "started" => Ok(JobState::Started),
            "succeeded" => Ok(JobState::Succeeded),
            "failed" => Ok(JobState::Failed),
            other => Err(Error::new(
                ErrorKind::Decode,
                format!("unknown job state {other:?}"),
            )),
        }
    }
}

/// Identity of a claiming worker, persisted in `locked_by` as
/// `host.pid.token`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerId {
    host: String,
    pid: u32,
    token: String,
}

impl WorkerId {
    pub fn new(host: impl Into<String>, pid: u32, token: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            pid,
            token: token.into(),
        }
    }

    /// Identity for the current process with a fresh random token.
    pub fn generate() -> Self {
        let bytes: [u8; 3] = rand::random();
        let token = bytes.iter().map(|b| format!("{b:02x}")).collect::<String>();
        Self::new(current_hostname(), std::process::id(), token)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.host, self.pid, self.token)
    }
}

impl std::str::FromStr for WorkerId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Split from the right: host names contain dots, pid and token never do.
        let malformed = || Error::new(ErrorKind::Decode, format!("malformed worker id {s:?}"));
        let mut parts = s.rsplitn(3, '.');
        let token = parts.next().filter(|t| !t.is_empty()).ok_or_else(malformed)?;
        let pid = parts
            .next()
            .and_then(|p| p.parse::<u32>().ok())
            .ok_or_else(malformed)?;
        let host = parts.next().filter(|h| !h.is_empty()).ok_or_else(malformed)?;
        Ok(Self::new(host, pid, token))
    }
}

pub(crate) fn current_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Persisted unit of work.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    pub id: JobId,
    pub state: JobState,
    /// `None` is the open queue, which allows parallel execution.
    pub queue: Option<String>,
    /// Lower runs earlier.
    pub priority: i32,
    pub perform_at: Option<SystemTime>,
    pub payload: Vec<u8>,
    pub locked_by: Option<String>,
    pub locked_at: Option<SystemTime>,
    pub started_at: Option<SystemTime>,
    pub succeeded_at: Option<SystemTime>,
    pub failed_at: Option<SystemTime>,
    pub last_error: Option<String>,
    pub description: Option<String>,
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
}

impl JobRecord {
    /// A freshly enqueued record in state `waiting`.
    pub fn waiting(id: JobId, job: NewJob, now: SystemTime) -> Self {
        Self {
            id,
            state: JobState::Waiting,
            queue: job.queue,
            priority: job.priority,
            perform_at: job.perform_at,
            payload: job.payload,
            locked_by: None,
            locked_at: None,
            started_at: None,
            succeeded_at: None,
            failed_at: None,
            last_error: None,
            description: job.description,
            created_at: now,
            updated_at: now,
        }
    }

    /// Waiting and due at `now`.
    pub fn is_eligible(&self, now: SystemTime) -> bool {
        self.state == JobState::Waiting && self.perform_at.is_none_or(|at| at <= now)
    }

    /// Parsed claim owner, if the record is claimed and `locked_by` is well formed.
    pub fn claimed_by(&self) -> Option<WorkerId> {
        self.locked_by.as_deref().and_then(|s| s.parse().ok())
    }

    pub fn mark_locked(&mut self, worker_id: &WorkerId, now: SystemTime) -> Result<(), StateMismatch> {
        self.assert_state(&[JobState::Waiting])?;
        self.state = JobState::Locked;
        self.locked_by = Some(worker_id.to_string());
        self.locked_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    pub fn mark_started(&mut self, now: SystemTime) -> Result<(), StateMismatch> {
        self.assert_state(&[JobState::Locked])?;
        self.state = JobState::Started;
        self.started_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    pub fn mark_succeeded(&mut self, now: SystemTime) -> Result<(), StateMismatch> {
        self.assert_state(&[JobState::Started])?;
        self.state = JobState::Succeeded;
        self.succeeded_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Allowed from `locked` too: decoding may fail before a job is started,
    /// and orphaned claims are failed without ever starting.
    pub fn mark_failed(&mut self, error: &str, now: SystemTime) -> Result<(), StateMismatch> {
        self.assert_state(&[JobState::Locked, JobState::Started])?;
        self.state = JobState::Failed;
        self.failed_at = Some(now);
        self.last_error = Some(error.to_string());
        self.updated_at = now;
        Ok(())
    }

    /// Return to `waiting` and clear every claim and result field.
    ///
    /// Only terminal records may be reset unless `force` is given. Forcing a
    /// record that a live worker still processes leads to double execution.
    pub fn reset(&mut self, force: bool, now: SystemTime) -> Result<(), StateMismatch> {
        if !force {
            self.assert_state(&[JobState::Succeeded, JobState::Failed])?;
        }
        self.state = JobState::Waiting;
        self.locked_by = None;
        self.locked_at = None;
        self.started_at = None;
        self.succeeded_at = None;
        self.failed_at = None;
        self.last_error = None;
        self.updated_at = now;
        Ok(())
    }

    fn assert_state(&self, expected: &[JobState]) -> Result<(), StateMismatch> {
        if expected.contains(&self.state) {
            Ok(())
        } else {
            Err(StateMismatch {
                id: self.id,
                expected: expected.to_vec(),
                actual: self.state,
            })
        }
    }
}

/// Wire format of a payload: a registered type tag plus its arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub job_type: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

impl Envelope {
    pub fn decode(payload: &[u8]) -> Result<Self, Error> {
        Ok(serde_json::from_slice(payload)?)
    }
}

/// Descriptor for inserting a job.
///
/// ```
/// # use dray_core::NewJob;
/// let job = NewJob::new("mail.send", &serde_json::json!({ "to": "ops@example.com" }))
///     .unwrap()
///     .queue("mail")
///     .priority(3);
/// assert_eq!(job.queue_name(), Some("mail"));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    queue: Option<String>,
    priority: i32,
    perform_at: Option<SystemTime>,
    payload: Vec<u8>,
    description: Option<String>,
}

impl NewJob {
    /// Encode `args` for the handler registered under `job_type`.
    pub fn new<T>(job_type: impl Into<String>, args: &T) -> Result<Self, Error>
    where
        T: Serialize + ?Sized,
    {
        let envelope = Envelope {
            job_type: job_type.into(),
            args: serde_json::to_value(args).map_err(|e| Error::new(ErrorKind::Encode, e))?,
        };
        let payload = serde_json::to_vec(&envelope).map_err(|e| Error::new(ErrorKind::Encode, e))?;
        Ok(Self::from_payload(payload))
    }

    /// Use an already encoded payload.
    pub fn from_payload(payload: Vec<u8>) -> Self {
        Self {
            queue: None,
            priority: 0,
            perform_at: None,
            payload,
            description: None,
        }
    }

    /// Serialize this job with the others of the same queue.
    pub fn queue(self, queue: impl Into<String>) -> Self {
        Self {
            queue: Some(queue.into()),
            ..self
        }
    }

    pub fn priority(self, priority: i32) -> Self {
        Self { priority, ..self }
    }

    /// Do not run before `at`.
    pub fn perform_at(self, at: SystemTime) -> Self {
        Self {
            perform_at: Some(at),
            ..self
        }
    }

    /// Do not run before `now + delay`.
    pub fn delay(self, delay: std::time::Duration) -> Self {
        self.perform_at(SystemTime::now() + delay)
    }

    pub fn description(self, description: impl Into<String>) -> Self {
        Self {
            description: Some(description.into()),
            ..self
        }
    }

    pub fn queue_name(&self) -> Option<&str> {
        self.queue.as_deref()
    }

    pub fn priority_value(&self) -> i32 {
        self.priority
    }

    pub fn perform_at_value(&self) -> Option<SystemTime> {
        self.perform_at
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn description_value(&self) -> Option<&str> {
        self.description.as_deref()
    }
}
