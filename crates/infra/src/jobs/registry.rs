//! Task registry: task names → async handlers, plus periodic schedules.
//!
//! Built once at startup by the embedding application and shared read-only by
//! every worker and the scheduler.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;

use depot_core::{JobId, JobType, QueueName};

use super::error::JobError;
use super::types::Kwargs;

/// Arguments of one task invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskCall {
    pub job_id: JobId,
    pub task: String,
    pub queue: QueueName,
    pub job_type: Option<JobType>,
    pub args: Vec<Value>,
    pub kwargs: Kwargs,
}

impl TaskCall {
    /// Deserialize the positional argument at `index`.
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> anyhow::Result<T> {
        let value = self
            .args
            .get(index)
            .with_context(|| format!("{}: missing positional argument {index}", self.task))?;
        serde_json::from_value(value.clone()).with_context(|| format!("{}: argument {index}", self.task))
    }

    /// Deserialize a keyword argument, if present.
    pub fn kwarg<T: DeserializeOwned>(&self, name: &str) -> anyhow::Result<Option<T>> {
        self.kwargs
            .get(name)
            .map(|v| serde_json::from_value(v.clone()))
            .transpose()
            .with_context(|| format!("{}: keyword argument '{name}'", self.task))
    }
}

/// An async task implementation.
///
/// Errors are recorded verbatim (with their context chain) as the failure
/// reason of the job. Handlers run in their own tokio task and are aborted
/// when the worker shuts down mid-execution.
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    async fn call(&self, call: TaskCall) -> anyhow::Result<()>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(TaskCall) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn call(&self, call: TaskCall) -> anyhow::Result<()> {
        (self.0)(call).await
    }
}

/// Unit of an interval schedule.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IntervalUnit {
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl IntervalUnit {
    fn seconds(self) -> u64 {
        match self {
            IntervalUnit::Seconds => 1,
            IntervalUnit::Minutes => 60,
            IntervalUnit::Hours => 3_600,
            IntervalUnit::Days => 86_400,
        }
    }
}

impl FromStr for IntervalUnit {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "seconds" => Ok(Self::Seconds),
            "minutes" => Ok(Self::Minutes),
            "hours" => Ok(Self::Hours),
            "days" => Ok(Self::Days),
            other => Err(JobError::validation(format!("unknown interval unit '{other}'"))),
        }
    }
}

/// When a periodic job runs.
#[derive(Clone)]
pub enum Schedule {
    Cron {
        expression: String,
        schedule: Box<cron::Schedule>,
    },
    Interval {
        value: u64,
        unit: IntervalUnit,
    },
}

impl fmt::Debug for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schedule::Cron { expression, .. } => f.debug_tuple("Cron").field(expression).finish(),
            Schedule::Interval { value, unit } => f.debug_tuple("Interval").field(value).field(unit).finish(),
        }
    }
}

impl Schedule {
    /// Parse a cron expression. Classic 5-field expressions (minute first)
    /// are accepted and fire at second 0.
    pub fn cron(expression: &str) -> Result<Self, JobError> {
        let expression = expression.trim();
        let normalized = if expression.split_whitespace().count() == 5 {
            format!("0 {expression}")
        } else {
            expression.to_string()
        };
        let schedule = cron::Schedule::from_str(&normalized)
            .map_err(|e| JobError::validation(format!("invalid cron expression '{expression}': {e}")))?;
        Ok(Schedule::Cron {
            expression: expression.to_string(),
            schedule: Box::new(schedule),
        })
    }

    pub fn every(value: u64, unit: IntervalUnit) -> Result<Self, JobError> {
        if value == 0 {
            return Err(JobError::validation("interval must be greater than zero"));
        }
        Ok(Schedule::Interval { value, unit })
    }

    pub fn job_type(&self) -> JobType {
        match self {
            Schedule::Cron { .. } => JobType::Cron,
            Schedule::Interval { .. } => JobType::Interval,
        }
    }

    pub fn interval(&self) -> Option<Duration> {
        match self {
            Schedule::Interval { value, unit } => Some(Duration::from_secs(value.saturating_mul(unit.seconds()))),
            Schedule::Cron { .. } => None,
        }
    }

    /// Next due time (unix seconds) given the last run, if any.
    ///
    /// - Interval: no last run → now; otherwise `max(last_run + interval, now)`
    /// - Cron: first fire time strictly after `max(last_run, now)`
    ///
    /// Returns `None` for a cron expression with no future fire time.
    pub fn next_due(&self, last_run: Option<f64>, now: f64) -> Option<f64> {
        match self {
            Schedule::Interval { .. } => {
                let interval = self.interval()?.as_secs_f64();
                Some(last_run.map_or(now, |last| (last + interval).max(now)))
            }
            Schedule::Cron { schedule, .. } => {
                let base = last_run.map_or(now, |last| last.max(now));
                let base = DateTime::<Utc>::from_timestamp_micros((base * 1_000_000.0) as i64)?;
                schedule
                    .after(&base)
                    .next()
                    .map(|at| at.timestamp_micros() as f64 / 1_000_000.0)
            }
        }
    }
}

/// A periodic job definition.
#[derive(Debug, Clone)]
pub struct PeriodicJob {
    pub task: String,
    pub enabled: bool,
    pub schedule: Schedule,
    pub queue: QueueName,
    pub args: Vec<Value>,
    pub kwargs: Kwargs,
}

impl PeriodicJob {
    pub fn new(task: impl Into<String>, schedule: Schedule) -> Self {
        Self {
            task: task.into(),
            enabled: true,
            schedule,
            queue: QueueName::Default,
            args: Vec::new(),
            kwargs: Kwargs::new(),
        }
    }

    pub fn on_queue(mut self, queue: QueueName) -> Self {
        self.queue = queue;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_args(mut self, args: Vec<Value>, kwargs: Kwargs) -> Self {
        self.args = args;
        self.kwargs = kwargs;
        self
    }
}

#[derive(Default)]
pub struct TaskRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
    periodic: BTreeMap<String, PeriodicJob>,
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("tasks", &self.task_names())
            .field("periodic", &self.periodic.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an async closure under `name`. Re-registering replaces the
    /// previous handler.
    pub fn register<F, Fut>(&mut self, name: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(TaskCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.register_handler(name, Arc::new(FnHandler(handler)))
    }

    pub fn register_handler(&mut self, name: impl Into<String>, handler: Arc<dyn TaskHandler>) -> &mut Self {
        self.handlers.insert(name.into(), handler);
        self
    }

    /// Add a periodic definition. The task must already be registered.
    pub fn schedule(&mut self, job: PeriodicJob) -> Result<&mut Self, JobError> {
        if !self.handlers.contains_key(&job.task) {
            return Err(JobError::validation(format!(
                "periodic job '{}' has no registered handler",
                job.task
            )));
        }
        self.periodic.insert(job.task.clone(), job);
        Ok(self)
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn TaskHandler>, JobError> {
        self.handlers
            .get(name)
            .cloned()
            .ok_or_else(|| JobError::Resolution(name.to_string()))
    }

    pub fn periodic(&self, task: &str) -> Option<&PeriodicJob> {
        self.periodic.get(task)
    }

    /// Enabled periodic definitions, ordered by task name.
    pub fn enabled_periodic(&self) -> impl Iterator<Item = &PeriodicJob> {
        self.periodic.values().filter(|job| job.enabled)
    }

    pub fn task_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn ts(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> f64 {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap().timestamp() as f64
    }

    #[test]
    fn interval_next_due_follows_last_run() {
        let every_five = Schedule::every(5, IntervalUnit::Minutes).unwrap();
        assert_eq!(every_five.next_due(None, 1_000.0), Some(1_000.0));
        assert_eq!(every_five.next_due(Some(900.0), 1_000.0), Some(1_200.0));
        assert_eq!(every_five.next_due(Some(100.0), 1_000.0), Some(1_000.0));
    }

    #[test]
    fn five_field_cron_fires_on_the_minute() {
        let hourly = Schedule::cron("30 * * * *").unwrap();
        let now = ts(2030, 1, 1, 10, 0, 0);
        assert_eq!(hourly.next_due(None, now), Some(ts(2030, 1, 1, 10, 30, 0)));

        let last = ts(2030, 1, 1, 10, 30, 0);
        assert_eq!(hourly.next_due(Some(last), now), Some(ts(2030, 1, 1, 11, 30, 0)));
    }

    #[test]
    fn cron_is_strictly_after_base() {
        let hourly = Schedule::cron("0 0 * * * *").unwrap();
        let on_the_hour = ts(2030, 1, 1, 10, 0, 0);
        assert_eq!(hourly.next_due(None, on_the_hour), Some(ts(2030, 1, 1, 11, 0, 0)));
    }

    #[test]
    fn invalid_schedules_are_rejected() {
        assert!(Schedule::cron("every tuesday").is_err());
        assert!(Schedule::every(0, IntervalUnit::Seconds).is_err());
        assert!("fortnights".parse::<IntervalUnit>().is_err());
    }

    #[test]
    fn periodic_jobs_require_a_handler() {
        let mut registry = TaskRegistry::new();
        let job = PeriodicJob::new("reports.daily", Schedule::every(1, IntervalUnit::Days).unwrap());
        assert!(registry.schedule(job.clone()).is_err());

        registry.register("reports.daily", |_call| async { anyhow::Ok(()) });
        registry.schedule(job.enabled(false)).unwrap();
        assert!(registry.periodic("reports.daily").is_some());
        assert_eq!(registry.enabled_periodic().count(), 0);
    }

    #[test]
    fn unknown_tasks_fail_resolution() {
        let registry = TaskRegistry::new();
        assert!(matches!(registry.resolve("nope"), Err(JobError::Resolution(name)) if name == "nope"));
    }

    #[tokio::test]
    async fn closures_receive_typed_arguments() {
        let mut registry = TaskRegistry::new();
        registry.register("stock.adjust", |call: TaskCall| async move {
            let sku: String = call.arg(0)?;
            let delta: Option<i64> = call.kwarg("delta")?;
            anyhow::ensure!(sku == "A-1" && delta == Some(-3), "unexpected arguments");
            anyhow::Ok(())
        });

        let mut kwargs = Kwargs::new();
        kwargs.insert("delta".into(), json!(-3));
        let call = TaskCall {
            job_id: JobId::from_string("j"),
            task: "stock.adjust".into(),
            queue: QueueName::Default,
            job_type: None,
            args: vec![json!("A-1")],
            kwargs,
        };
        registry.resolve("stock.adjust").unwrap().call(call.clone()).await.unwrap();

        let missing = TaskCall { args: vec![], ..call };
        assert!(registry.resolve("stock.adjust").unwrap().call(missing).await.is_err());
    }
}
