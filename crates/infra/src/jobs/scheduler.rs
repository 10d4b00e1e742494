//! Leader-elected scheduler for periodic jobs.
//!
//! Every process runs a scheduler task, but only the holder of
//! `<ns>:scheduler:lock` seeds periodic jobs. The lock is taken with
//! `SET NX` + TTL, renewed with compare-then-expire and released with
//! compare-then-delete, so a holder never touches a lock it lost.
//!
//! Seeding is idempotent: periodic jobs have deterministic ids, so a pass
//! that runs while an occurrence is already pending changes nothing.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::enqueuer::Enqueuer;
use super::error::JobError;
use super::keys::KeySpace;
use super::registry::TaskRegistry;
use super::types::{now_ts, EnqueueRequest, ScheduledFor};
use crate::store::SharedStore;

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    pub lock_ttl: Duration,
    /// How often leadership is renewed (or retried) and periodic jobs are
    /// re-evaluated. Must be well below `lock_ttl`.
    pub tick: Duration,
    /// Evaluate once after the first successful acquisition, then only hold
    /// the lock until shutdown.
    pub single_pass: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(15),
            tick: Duration::from_secs(5),
            single_pass: false,
        }
    }
}

/// `<hostname>:<pid>:<uuid>`; unique per scheduler instance.
pub fn holder_identity() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| "worker".to_string());
    format!("{host}:{}:{}", std::process::id(), Uuid::now_v7())
}

#[derive(Clone)]
pub struct Scheduler {
    store: Arc<dyn SharedStore>,
    keys: KeySpace,
    registry: Arc<TaskRegistry>,
    enqueuer: Enqueuer,
    config: SchedulerConfig,
    holder: String,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn SharedStore>,
        keys: KeySpace,
        registry: Arc<TaskRegistry>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            enqueuer: Enqueuer::new(store.clone(), keys.clone()),
            store,
            keys,
            registry,
            config,
            holder: holder_identity(),
        }
    }

    pub fn with_holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = holder.into();
        self
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Try to become leader. At most one concurrent caller succeeds.
    #[instrument(skip(self), fields(holder = %self.holder), err)]
    pub async fn try_acquire(&self) -> Result<bool, JobError> {
        Ok(self
            .store
            .set_nx(&self.keys.scheduler_lock(), &self.holder, self.config.lock_ttl)
            .await?)
    }

    /// Extend the lock TTL; `false` means leadership was lost.
    pub async fn renew(&self) -> Result<bool, JobError> {
        Ok(self
            .store
            .compare_and_expire(&self.keys.scheduler_lock(), &self.holder, self.config.lock_ttl)
            .await?)
    }

    /// Release the lock if this instance still holds it.
    pub async fn release(&self) -> Result<bool, JobError> {
        Ok(self
            .store
            .compare_and_delete(&self.keys.scheduler_lock(), &self.holder)
            .await?)
    }

    /// Seed every enabled periodic job; returns how many new jobs were created.
    #[instrument(skip(self), fields(holder = %self.holder), err)]
    pub async fn evaluate(&self) -> Result<usize, JobError> {
        let now = now_ts();
        let mut created = 0;

        for job in self.registry.enabled_periodic() {
            let last_run = self
                .store
                .get(&self.keys.last_run(&job.task))
                .await?
                .and_then(|raw| raw.parse::<f64>().ok());

            let Some(due) = job.schedule.next_due(last_run, now) else {
                warn!(task = %job.task, schedule = ?job.schedule, "schedule has no upcoming fire time");
                continue;
            };

            let request = EnqueueRequest::new(job.task.as_str())
                .args(job.args.clone())
                .kwargs(job.kwargs.clone())
                .queue(job.queue.as_str())
                .scheduled_for(ScheduledFor::Epoch(due))
                .job_type(job.schedule.job_type());

            let outcome = self.enqueuer.enqueue(request).await?;
            if outcome.created {
                created += 1;
                debug!(task = %job.task, job_id = %outcome.job_id, due_at = due, "seeded periodic job");
            }
        }

        Ok(created)
    }

    pub fn spawn(self, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(token).await })
    }

    /// Leadership loop; returns after `token` is cancelled and the lock is
    /// released.
    pub async fn run(self, token: CancellationToken) {
        info!(holder = %self.holder, "scheduler started");
        let mut leader = false;
        let mut evaluated = false;

        loop {
            leader = match self.keep_leadership(leader).await {
                Ok(now_leader) => now_leader,
                Err(err) => {
                    warn!(holder = %self.holder, error = %err, "scheduler lock check failed");
                    false
                }
            };

            if leader && !(self.config.single_pass && evaluated) {
                match self.evaluate().await {
                    Ok(created) => {
                        evaluated = true;
                        if created > 0 {
                            info!(created, "periodic jobs seeded");
                        }
                    }
                    Err(err) => error!(error = %err, "periodic evaluation failed"),
                }
            }

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.config.tick) => {}
            }
        }

        if leader {
            match self.release().await {
                Ok(true) => info!(holder = %self.holder, "scheduler lock released"),
                Ok(false) => debug!(holder = %self.holder, "scheduler lock already gone"),
                Err(err) => warn!(holder = %self.holder, error = %err, "failed to release scheduler lock"),
            }
        }
        info!(holder = %self.holder, "scheduler stopped");
    }

    async fn keep_leadership(&self, leader: bool) -> Result<bool, JobError> {
        if leader {
            if self.renew().await? {
                return Ok(true);
            }
            warn!(holder = %self.holder, "scheduler lock lost");
        }
        let acquired = self.try_acquire().await?;
        if acquired {
            info!(holder = %self.holder, "acquired scheduler lock");
        }
        Ok(acquired)
    }
}
