//! Job data types shared by the enqueuer, workers and the result ledger.

use std::time::Duration;

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use depot_core::{DomainError, JobId, JobType, QueueName, ResultStatus};

/// Keyword arguments of a task call.
pub type Kwargs = serde_json::Map<String, Value>;

/// Current wall-clock time as fractional unix seconds (the score unit of every
/// sorted set in the store).
pub fn now_ts() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// When a job becomes due.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum ScheduledFor {
    /// Due immediately.
    #[default]
    Now,
    /// Due after a relative delay.
    Delay(Duration),
    /// Due at a timezone-aware instant.
    At(DateTime<FixedOffset>),
    /// Due at a unix timestamp in seconds.
    Epoch(f64),
    /// A wall-clock time without an offset. Always rejected: the instant it
    /// denotes depends on whichever host reads it.
    Naive(NaiveDateTime),
}

impl ScheduledFor {
    /// Parse request-layer input: a numeric unix timestamp or an RFC 3339
    /// datetime. ISO-8601 strings without an offset parse as `Naive` so the
    /// enqueuer reports them as a validation error.
    pub fn parse(raw: &str) -> Result<Self, DomainError> {
        let raw = raw.trim();
        if let Ok(epoch) = raw.parse::<f64>() {
            return Ok(Self::Epoch(epoch));
        }
        if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
            return Ok(Self::At(at));
        }
        for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
            if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
                return Ok(Self::Naive(naive));
            }
        }
        Err(DomainError::validation(format!(
            "scheduled_for '{raw}' is neither a unix timestamp nor an RFC 3339 datetime"
        )))
    }

    /// Resolve to an absolute due time in unix seconds.
    pub fn resolve(&self, now: f64) -> Result<f64, DomainError> {
        match self {
            Self::Now => Ok(now),
            Self::Delay(delay) => Ok(now + delay.as_secs_f64()),
            Self::At(at) => Ok(at.timestamp_micros() as f64 / 1_000_000.0),
            Self::Epoch(epoch) if epoch.is_finite() && *epoch >= 0.0 => Ok(*epoch),
            Self::Epoch(epoch) => Err(DomainError::validation(format!(
                "scheduled_for epoch {epoch} is not a finite non-negative timestamp"
            ))),
            Self::Naive(naive) => Err(DomainError::validation(format!(
                "scheduled_for '{naive}' has no timezone; pass an offset-aware datetime"
            ))),
        }
    }
}

impl From<Duration> for ScheduledFor {
    fn from(delay: Duration) -> Self {
        Self::Delay(delay)
    }
}

impl<Tz: TimeZone> From<DateTime<Tz>> for ScheduledFor {
    fn from(at: DateTime<Tz>) -> Self {
        Self::At(at.fixed_offset())
    }
}

impl From<NaiveDateTime> for ScheduledFor {
    fn from(naive: NaiveDateTime) -> Self {
        Self::Naive(naive)
    }
}

impl From<f64> for ScheduledFor {
    fn from(epoch: f64) -> Self {
        Self::Epoch(epoch)
    }
}

/// Everything a caller can say about a job to enqueue.
#[derive(Debug, Clone, PartialEq)]
pub struct EnqueueRequest {
    pub task: String,
    pub args: Vec<Value>,
    pub kwargs: Kwargs,
    /// Queue name as given by the caller; validated on enqueue.
    pub queue: String,
    pub scheduled_for: ScheduledFor,
    pub job_type: Option<JobType>,
    pub dedupe_key: Option<String>,
}

impl EnqueueRequest {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            args: Vec::new(),
            kwargs: Kwargs::new(),
            queue: QueueName::Default.as_str().to_string(),
            scheduled_for: ScheduledFor::Now,
            job_type: None,
            dedupe_key: None,
        }
    }

    pub fn args(mut self, args: impl IntoIterator<Item = Value>) -> Self {
        self.args = args.into_iter().collect();
        self
    }

    pub fn arg(mut self, arg: impl Into<Value>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn kwargs(mut self, kwargs: Kwargs) -> Self {
        self.kwargs = kwargs;
        self
    }

    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn scheduled_for(mut self, scheduled_for: impl Into<ScheduledFor>) -> Self {
        self.scheduled_for = scheduled_for.into();
        self
    }

    pub fn delay(self, delay: Duration) -> Self {
        self.scheduled_for(delay)
    }

    pub fn job_type(mut self, job_type: JobType) -> Self {
        self.job_type = Some(job_type);
        self
    }

    pub fn dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }
}

/// Serialized body of a queued job, stored apart from its queue entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    pub task: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Kwargs,
    pub queue: QueueName,
    #[serde(default)]
    pub job_type: Option<JobType>,
    #[serde(default)]
    pub dedupe_key: Option<String>,
}

/// What `enqueue` did.
#[derive(Debug, Clone, PartialEq)]
pub struct EnqueueOutcome {
    pub job_id: JobId,
    pub queue: QueueName,
    pub due_at: f64,
    /// `false` when a job with the same identity was already pending.
    pub created: bool,
}

/// Outcome record kept by the result ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEntry {
    pub job_id: JobId,
    pub task: String,
    pub queue: QueueName,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Kwargs,
    pub status: ResultStatus,
    /// Completion time, unix seconds.
    pub timestamp: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResultEntry {
    pub fn from_payload(job_id: JobId, payload: &JobPayload, status: ResultStatus, timestamp: f64) -> Self {
        Self {
            job_id,
            task: payload.task.clone(),
            queue: payload.queue,
            args: payload.args.clone(),
            kwargs: payload.kwargs.clone(),
            status,
            timestamp,
            error: None,
        }
    }
}
