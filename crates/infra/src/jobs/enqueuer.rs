//! Enqueuing jobs.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument};

use depot_core::QueueName;

use super::error::JobError;
use super::identity::derive_job_id;
use super::keys::KeySpace;
use super::types::{now_ts, EnqueueOutcome, EnqueueRequest, JobPayload};
use crate::store::SharedStore;

/// Minimum payload lifetime; a delayed job keeps its payload this long past
/// its due time.
const PAYLOAD_TTL_FLOOR: Duration = Duration::from_secs(3_600);

/// Payload TTL for a job due `delay_secs` from now: `max(1h, delay + 1h)`.
pub(crate) fn payload_ttl(delay_secs: f64) -> Duration {
    let extra = if delay_secs.is_finite() && delay_secs > 0.0 {
        Duration::from_secs_f64(delay_secs.min(u32::MAX as f64))
    } else {
        Duration::ZERO
    };
    PAYLOAD_TTL_FLOOR + extra
}

/// Writes jobs into the shared store.
///
/// Queue entry and payload are written in one atomic step. A job whose
/// identity is already pending (same dedupe key or periodic occurrence) is
/// left untouched, which makes enqueue idempotent for deterministic ids.
#[derive(Clone)]
pub struct Enqueuer {
    store: Arc<dyn SharedStore>,
    keys: KeySpace,
}

impl Enqueuer {
    pub fn new(store: Arc<dyn SharedStore>, keys: KeySpace) -> Self {
        Self { store, keys }
    }

    /// Validate, identify and enqueue a job.
    ///
    /// Validation errors are returned before any store mutation; store errors
    /// are transient and may be retried by the caller.
    #[instrument(skip(self, request), fields(task = %request.task, queue = %request.queue), err)]
    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<EnqueueOutcome, JobError> {
        let queue: QueueName = request.queue.parse()?;
        if request.task.trim().is_empty() {
            return Err(JobError::validation("task name must not be empty"));
        }
        if request.dedupe_key.as_deref().is_some_and(|k| k.trim().is_empty()) {
            return Err(JobError::validation("dedupe_key must not be empty"));
        }

        let now = now_ts();
        let due_at = request.scheduled_for.resolve(now)?;
        let job_id = derive_job_id(
            &request.task,
            &request.args,
            &request.kwargs,
            request.job_type,
            request.dedupe_key.as_deref(),
        );

        let payload = JobPayload {
            task: request.task,
            args: request.args,
            kwargs: request.kwargs,
            queue,
            job_type: request.job_type,
            dedupe_key: request.dedupe_key,
        };
        let body = serde_json::to_string(&payload)?;

        let created = self
            .store
            .enqueue_job(
                &self.keys.queue(queue),
                &self.keys.job_member(&job_id),
                due_at,
                &self.keys.payload(&job_id),
                &body,
                payload_ttl(due_at - now),
            )
            .await?;

        debug!(job_id = %job_id, due_at, created, "job enqueued");

        Ok(EnqueueOutcome {
            job_id,
            queue,
            due_at,
            created,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use depot_core::JobType;
    use serde_json::json;

    fn enqueuer() -> (Arc<InMemoryStore>, Enqueuer) {
        let store = Arc::new(InMemoryStore::new());
        let enqueuer = Enqueuer::new(store.clone(), KeySpace::default());
        (store, enqueuer)
    }

    #[test]
    fn payload_ttl_is_at_least_an_hour_past_due() {
        assert_eq!(payload_ttl(0.0), Duration::from_secs(3_600));
        assert_eq!(payload_ttl(-5.0), Duration::from_secs(3_600));
        assert_eq!(payload_ttl(7_200.0), Duration::from_secs(10_800));
    }

    #[tokio::test]
    async fn unknown_queue_is_rejected_without_writes() {
        let (store, enqueuer) = enqueuer();
        let err = enqueuer
            .enqueue(EnqueueRequest::new("mail.send").queue("urgent"))
            .await
            .unwrap_err();

        assert!(matches!(err, JobError::Validation(_)));
        for key in KeySpace::default().queues_by_priority() {
            assert_eq!(store.zcard(&key).await.unwrap(), 0);
        }
    }

    #[tokio::test]
    async fn writes_queue_entry_and_payload() {
        let (store, enqueuer) = enqueuer();
        let keys = KeySpace::default();
        let outcome = enqueuer
            .enqueue(EnqueueRequest::new("inventory.recount").arg(42).queue("low"))
            .await
            .unwrap();

        assert!(outcome.created);
        let score = store
            .zscore(&keys.queue(QueueName::Low), &keys.job_member(&outcome.job_id))
            .await
            .unwrap();
        assert_eq!(score, Some(outcome.due_at));

        let raw = store.get(&keys.payload(&outcome.job_id)).await.unwrap().unwrap();
        let payload: JobPayload = serde_json::from_str(&raw).unwrap();
        assert_eq!(payload.task, "inventory.recount");
        assert_eq!(payload.args, vec![json!(42)]);
        assert_eq!(payload.queue, QueueName::Low);
    }

    #[tokio::test]
    async fn periodic_identity_ignores_a_second_queue() {
        let (store, enqueuer) = enqueuer();
        let keys = KeySpace::default();
        let first = enqueuer
            .enqueue(EnqueueRequest::new("reports.daily").job_type(JobType::Cron).queue("high"))
            .await
            .unwrap();
        let second = enqueuer
            .enqueue(EnqueueRequest::new("reports.daily").job_type(JobType::Cron).queue("low"))
            .await
            .unwrap();

        assert_eq!(first.job_id, second.job_id);
        assert!(!second.created);
        assert_eq!(store.zcard(&keys.queue(QueueName::Low)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn blank_task_and_dedupe_key_are_rejected() {
        let (_, enqueuer) = enqueuer();
        assert!(enqueuer.enqueue(EnqueueRequest::new("  ")).await.is_err());
        assert!(
            enqueuer
                .enqueue(EnqueueRequest::new("t").dedupe_key(""))
                .await
                .is_err()
        );
    }
}
