//! Worker pool: pops due jobs in priority order and runs their handlers.
//!
//! ## Loop
//!
//! 1. Take the first due member across the queues, highest priority first. A
//!    future job in a higher queue never hides a due job in a lower one.
//! 2. With nothing due, block on pop-minimum across the queues. The pop is
//!    bounded by `pop_timeout` and is never raced against cancellation, so a
//!    member is never popped and then forgotten. A job popped before it is due
//!    goes straight back with its original score and the worker sleeps until
//!    it is due (at most `early_pop_sleep_cap`).
//! 3. A due job is executed in its own tokio task. Its outcome and the payload
//!    deletion are written in one transaction.
//! 4. On cancellation after a pop, the handler (if running) is aborted and a
//!    detached task writes a cancelled outcome and requeues the job at
//!    `max(due_at, now + grace)`.

use std::any::Any;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use depot_core::{JobId, QueueName, ResultStatus};

use super::enqueuer::Enqueuer;
use super::error::JobError;
use super::keys::KeySpace;
use super::ledger::ResultLedger;
use super::registry::{TaskCall, TaskRegistry};
use super::types::{now_ts, EnqueueRequest, JobPayload, ResultEntry, ScheduledFor};
use crate::store::{SharedStore, StoreTx};

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Name prefix for logging
    pub name: String,
    /// Worker tasks to spawn
    pub concurrency: usize,
    pub pop_timeout: Duration,
    pub early_pop_sleep_cap: Duration,
    /// Minimum delay before a job requeued during shutdown is due again
    pub shutdown_grace: Duration,
    pub error_cooldown: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "depot-worker".to_string(),
            concurrency: 4,
            pop_timeout: Duration::from_secs(1),
            early_pop_sleep_cap: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(5),
            error_cooldown: Duration::from_secs(5),
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }
}

/// Pool-wide counters, shared by every worker task.
#[derive(Debug, Default)]
pub struct WorkerPoolStats {
    started: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    requeued_early: AtomicU64,
    dropped: AtomicU64,
    loop_errors: AtomicU64,
}

/// Point-in-time copy of [`WorkerPoolStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStatsSnapshot {
    pub jobs_started: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_cancelled: u64,
    pub jobs_requeued_early: u64,
    pub jobs_dropped: u64,
    pub loop_errors: u64,
}

impl WorkerPoolStats {
    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            jobs_started: self.started.load(Ordering::Relaxed),
            jobs_succeeded: self.succeeded.load(Ordering::Relaxed),
            jobs_failed: self.failed.load(Ordering::Relaxed),
            jobs_cancelled: self.cancelled.load(Ordering::Relaxed),
            jobs_requeued_early: self.requeued_early.load(Ordering::Relaxed),
            jobs_dropped: self.dropped.load(Ordering::Relaxed),
            loop_errors: self.loop_errors.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// What a single worker iteration did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Iteration {
    /// Nothing was ready before the pop timed out.
    Idle,
    /// A job was popped before it was due and pushed back.
    RequeuedEarly,
    /// The popped member had no payload (or was malformed) and was discarded.
    Dropped,
    /// A job ran (or failed to resolve) and its outcome was recorded.
    Finished(ResultStatus),
}

/// Handle to a running pool.
#[derive(Debug)]
pub struct WorkerPoolHandle {
    token: CancellationToken,
    workers: Vec<JoinHandle<()>>,
    stats: Arc<WorkerPoolStats>,
}

impl WorkerPoolHandle {
    /// Request shutdown and wait for every worker to stop.
    ///
    /// In-flight jobs are cancelled and requeued before this returns.
    pub async fn shutdown(self) {
        self.token.cancel();
        self.join().await;
    }

    /// Wait for every worker to stop without requesting shutdown.
    pub async fn join(self) {
        for worker in self.workers {
            if let Err(err) = worker.await {
                error!(error = %err, "worker task terminated abnormally");
            }
        }
    }

    pub fn stats(&self) -> WorkerStatsSnapshot {
        self.stats.snapshot()
    }
}

/// Pool of cooperating workers sharing one registry, store and ledger.
#[derive(Clone)]
pub struct WorkerPool {
    store: Arc<dyn SharedStore>,
    keys: KeySpace,
    queue_keys: Vec<String>,
    registry: Arc<TaskRegistry>,
    enqueuer: Enqueuer,
    ledger: ResultLedger,
    config: WorkerConfig,
    stats: Arc<WorkerPoolStats>,
}

impl WorkerPool {
    pub fn new(
        store: Arc<dyn SharedStore>,
        keys: KeySpace,
        registry: Arc<TaskRegistry>,
        ledger: ResultLedger,
        config: WorkerConfig,
    ) -> Self {
        Self {
            enqueuer: Enqueuer::new(store.clone(), keys.clone()),
            queue_keys: keys.queues_by_priority(),
            store,
            keys,
            registry,
            ledger,
            config,
            stats: Arc::new(WorkerPoolStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<WorkerPoolStats> {
        self.stats.clone()
    }

    /// Spawn `concurrency` worker tasks that run until `token` is cancelled.
    pub fn spawn(&self, token: CancellationToken) -> WorkerPoolHandle {
        let workers = (0..self.config.concurrency.max(1))
            .map(|i| {
                let pool = self.clone();
                let token = token.clone();
                let name = format!("{}-{i}", self.config.name);
                tokio::spawn(async move { pool.worker_loop(name, token).await })
            })
            .collect();

        WorkerPoolHandle {
            token,
            workers,
            stats: self.stats.clone(),
        }
    }

    async fn worker_loop(self, name: String, token: CancellationToken) {
        info!(worker = %name, "worker started");

        while !token.is_cancelled() {
            match self.run_once(&name, &token).await {
                Ok(_) => {}
                Err(JobError::Cancelled) => break,
                Err(err) => {
                    WorkerPoolStats::bump(&self.stats.loop_errors);
                    if err.is_transient() {
                        warn!(worker = %name, error = %err, "store unavailable; cooling down");
                    } else {
                        error!(worker = %name, error = %err, "worker iteration failed; cooling down");
                    }
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(self.config.error_cooldown) => {}
                    }
                }
            }
        }

        info!(worker = %name, "worker stopped");
    }

    /// Run one pop/execute iteration.
    ///
    /// Returns `Err(JobError::Cancelled)` once `token` is cancelled and any
    /// popped job has been put back.
    pub async fn run_once(&self, worker: &str, token: &CancellationToken) -> Result<Iteration, JobError> {
        let popped = match self.store.pop_due(&self.queue_keys, now_ts()).await? {
            Some(popped) => popped,
            None => match self.store.pop_min(&self.queue_keys, self.config.pop_timeout).await? {
                Some(popped) => popped,
                None => return Ok(Iteration::Idle),
            },
        };

        let Some(queue) = self.keys.queue_from_key(&popped.key) else {
            return Err(JobError::validation(format!("popped from unexpected key '{}'", popped.key)));
        };
        let Some(job_id) = self.keys.job_id_from_member(&popped.member) else {
            warn!(worker, member = %popped.member, "dropping malformed queue member");
            WorkerPoolStats::bump(&self.stats.dropped);
            return Ok(Iteration::Dropped);
        };

        let now = now_ts();
        if token.is_cancelled() {
            if popped.score > now {
                let requeue_at = popped.score.max(now + self.config.shutdown_grace.as_secs_f64());
                self.requeue(queue, &job_id, requeue_at).await?;
                debug!(worker, job_id = %job_id, requeue_at, "returned early job popped during shutdown");
            } else {
                self.cancel_popped(worker, queue, &job_id, popped.score).await?;
            }
            return Err(JobError::Cancelled);
        }

        if popped.score > now {
            self.requeue(queue, &job_id, popped.score).await?;
            WorkerPoolStats::bump(&self.stats.requeued_early);
            let wait = Duration::from_secs_f64(
                (popped.score - now).min(self.config.early_pop_sleep_cap.as_secs_f64()),
            );
            debug!(worker, job_id = %job_id, wait_ms = wait.as_millis() as u64, "job not due yet");
            tokio::select! {
                _ = token.cancelled() => return Err(JobError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
            return Ok(Iteration::RequeuedEarly);
        }

        self.execute(worker, queue, job_id, popped.score, token).await
    }

    async fn execute(
        &self,
        worker: &str,
        queue: QueueName,
        job_id: JobId,
        due_at: f64,
        token: &CancellationToken,
    ) -> Result<Iteration, JobError> {
        let raw = match self.store.get(&self.keys.payload(&job_id)).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                warn!(worker, job_id = %job_id, "payload missing; job already consumed");
                WorkerPoolStats::bump(&self.stats.dropped);
                return Ok(Iteration::Dropped);
            }
            Err(err) => {
                if let Err(requeue_err) = self.requeue(queue, &job_id, due_at).await {
                    error!(worker, job_id = %job_id, error = %requeue_err, "failed to return job after payload read error");
                }
                return Err(err.into());
            }
        };

        let payload: JobPayload = match serde_json::from_str(&raw) {
            Ok(payload) => payload,
            Err(err) => {
                let unreadable = JobPayload {
                    task: "<unreadable>".to_string(),
                    args: Vec::new(),
                    kwargs: Default::default(),
                    queue,
                    job_type: None,
                    dedupe_key: None,
                };
                let message = format!("unreadable payload: {err}");
                self.finish(worker, &job_id, &unreadable, ResultStatus::Failure, Some(message))
                    .await?;
                return Ok(Iteration::Finished(ResultStatus::Failure));
            }
        };

        let handler = match self.registry.resolve(&payload.task) {
            Ok(handler) => handler,
            Err(err) => {
                warn!(worker, job_id = %job_id, task = %payload.task, "no handler registered");
                self.finish(worker, &job_id, &payload, ResultStatus::Failure, Some(err.to_string()))
                    .await?;
                return Ok(Iteration::Finished(ResultStatus::Failure));
            }
        };

        let call = TaskCall {
            job_id: job_id.clone(),
            task: payload.task.clone(),
            queue,
            job_type: payload.job_type,
            args: payload.args.clone(),
            kwargs: payload.kwargs.clone(),
        };

        WorkerPoolStats::bump(&self.stats.started);
        debug!(worker, job_id = %job_id, task = %payload.task, queue = %queue, "executing job");
        let mut running = tokio::spawn(async move { handler.call(call).await });

        let joined = tokio::select! {
            biased;
            joined = &mut running => joined,
            _ = token.cancelled() => {
                running.abort();
                self.record_cancelled(worker, queue, &job_id, &payload, due_at).await;
                return Err(JobError::Cancelled);
            }
        };

        let (status, error) = match joined {
            Ok(Ok(())) => (ResultStatus::Success, None),
            Ok(Err(err)) => (ResultStatus::Failure, Some(format!("{err:#}"))),
            Err(err) if err.is_panic() => (
                ResultStatus::Failure,
                Some(format!("task panicked: {}", panic_message(err.into_panic()))),
            ),
            Err(err) => (ResultStatus::Failure, Some(err.to_string())),
        };

        let finished_at = self.finish(worker, &job_id, &payload, status, error).await?;
        if status == ResultStatus::Success {
            if let Err(err) = self.schedule_next(&payload, finished_at).await {
                error!(worker, job_id = %job_id, task = %payload.task, error = %err, "failed to enqueue next occurrence");
            }
        }
        Ok(Iteration::Finished(status))
    }

    /// Record a terminal outcome; returns its timestamp.
    async fn finish(
        &self,
        worker: &str,
        job_id: &JobId,
        payload: &JobPayload,
        status: ResultStatus,
        error: Option<String>,
    ) -> Result<f64, JobError> {
        let now = now_ts();
        let mut entry = ResultEntry::from_payload(job_id.clone(), payload, status, now);
        entry.error = error;

        let mut followup = StoreTx::new();
        if payload.job_type.is_some() {
            followup.set(self.keys.last_run(&payload.task), now.to_string(), None);
        }
        self.ledger.record(&entry, followup).await?;

        match status {
            ResultStatus::Success => {
                WorkerPoolStats::bump(&self.stats.succeeded);
                info!(worker, job_id = %job_id, task = %payload.task, "job succeeded");
            }
            _ => {
                WorkerPoolStats::bump(&self.stats.failed);
                warn!(
                    worker,
                    job_id = %job_id,
                    task = %payload.task,
                    error = entry.error.as_deref().unwrap_or_default(),
                    "job failed"
                );
            }
        }
        Ok(now)
    }

    /// Write the cancelled outcome and requeue, in one transaction that the
    /// cancellation itself cannot interrupt.
    async fn record_cancelled(
        &self,
        worker: &str,
        queue: QueueName,
        job_id: &JobId,
        payload: &JobPayload,
        due_at: f64,
    ) {
        let now = now_ts();
        let requeue_at = due_at.max(now + self.config.shutdown_grace.as_secs_f64());
        let entry = ResultEntry::from_payload(job_id.clone(), payload, ResultStatus::Cancelled, now);
        let mut followup = StoreTx::new();
        followup.zadd(self.keys.queue(queue), self.keys.job_member(job_id), requeue_at);

        let ledger = self.ledger.clone();
        match shield(async move { ledger.record(&entry, followup).await }).await {
            Ok(()) => {
                WorkerPoolStats::bump(&self.stats.cancelled);
                info!(worker, job_id = %job_id, task = %payload.task, requeue_at, "job cancelled and requeued");
            }
            Err(err) => {
                error!(worker, job_id = %job_id, task = %payload.task, error = %err, "failed to requeue cancelled job");
            }
        }
    }

    /// A due job popped after shutdown began: cancelled entry plus requeue when
    /// its payload is readable, a bare requeue otherwise.
    async fn cancel_popped(
        &self,
        worker: &str,
        queue: QueueName,
        job_id: &JobId,
        due_at: f64,
    ) -> Result<(), JobError> {
        let payload = match self.store.get(&self.keys.payload(job_id)).await {
            Ok(Some(raw)) => serde_json::from_str::<JobPayload>(&raw).ok(),
            Ok(None) => {
                debug!(worker, job_id = %job_id, "payload missing; nothing to requeue");
                return Ok(());
            }
            Err(err) => {
                warn!(worker, job_id = %job_id, error = %err, "payload read failed during shutdown");
                None
            }
        };

        match payload {
            Some(payload) => self.record_cancelled(worker, queue, job_id, &payload, due_at).await,
            None => {
                let requeue_at = due_at.max(now_ts() + self.config.shutdown_grace.as_secs_f64());
                self.requeue(queue, job_id, requeue_at).await?;
                debug!(worker, job_id = %job_id, requeue_at, "returned job popped during shutdown");
            }
        }
        Ok(())
    }

    async fn requeue(&self, queue: QueueName, job_id: &JobId, score: f64) -> Result<(), JobError> {
        let store = self.store.clone();
        let mut tx = StoreTx::new();
        tx.zadd(self.keys.queue(queue), self.keys.job_member(job_id), score);
        shield(async move {
            store.exec(tx).await?;
            Ok::<(), JobError>(())
        })
        .await
    }

    /// Enqueue the next occurrence of a periodic job that just succeeded.
    async fn schedule_next(&self, payload: &JobPayload, finished_at: f64) -> Result<(), JobError> {
        if payload.job_type.is_none() {
            return Ok(());
        }
        let Some(periodic) = self.registry.periodic(&payload.task).filter(|p| p.enabled) else {
            debug!(task = %payload.task, "periodic job no longer scheduled");
            return Ok(());
        };
        let Some(due) = periodic.schedule.next_due(Some(finished_at), finished_at) else {
            return Ok(());
        };

        let request = EnqueueRequest::new(payload.task.as_str())
            .args(payload.args.clone())
            .kwargs(payload.kwargs.clone())
            .queue(periodic.queue.as_str())
            .scheduled_for(ScheduledFor::Epoch(due))
            .job_type(periodic.schedule.job_type());
        self.enqueuer.enqueue(request).await?;
        Ok(())
    }
}

/// Run `fut` to completion in a detached task, so dropping or cancelling the
/// caller cannot interrupt it.
async fn shield<T, F>(fut: F) -> Result<T, JobError>
where
    F: Future<Output = Result<T, JobError>> + Send + 'static,
    T: Send + 'static,
{
    tokio::spawn(fut)
        .await
        .map_err(|err| JobError::Execution(format!("store write aborted: {err}")))?
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_messages_are_extracted() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new(String::from("bang"))), "bang");
        assert_eq!(panic_message(Box::new(7_u8)), "non-string panic payload");
    }

    #[test]
    fn concurrency_is_at_least_one() {
        assert_eq!(WorkerConfig::default().with_concurrency(0).concurrency, 1);
    }

    #[tokio::test]
    async fn shield_survives_caller_drop() {
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let caller = tokio::spawn(shield(async move {
            let _ = started_tx.send(());
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = done_tx.send(());
            Ok::<(), JobError>(())
        }));

        started_rx.await.unwrap();
        caller.abort();
        assert!(done_rx.await.is_ok());
    }
}
