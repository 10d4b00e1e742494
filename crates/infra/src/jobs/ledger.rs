//! Result ledger: bounded record of job outcomes.
//!
//! ## Retention
//!
//! - Success and cancelled details expire after the retention window, and
//!   every write to those indexes prunes members older than the window.
//! - Failure details never expire; they are kept until `clear_failed_jobs`
//!   or until a later run of the same job id records a newer outcome.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, instrument};

use depot_core::{JobId, QueueName, ResultStatus};

use super::error::JobError;
use super::keys::KeySpace;
use super::types::{now_ts, ResultEntry};
use crate::store::{SharedStore, StoreTx};

#[derive(Debug, Clone, PartialEq)]
pub struct LedgerConfig {
    /// How long success and cancelled outcomes are kept
    pub retention: Duration,
    /// Entries per `get_jobs` page
    pub page_size: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(1_000),
            page_size: 50,
        }
    }
}

/// Headline counts for dashboards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    /// Successes inside the retention window
    pub success: u64,
    /// All failures not yet cleared
    pub failure: u64,
}

#[derive(Clone)]
pub struct ResultLedger {
    store: Arc<dyn SharedStore>,
    keys: KeySpace,
    config: LedgerConfig,
}

impl ResultLedger {
    pub fn new(store: Arc<dyn SharedStore>, keys: KeySpace, config: LedgerConfig) -> Self {
        Self { store, keys, config }
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Build the writes that record `entry`.
    ///
    /// Terminal outcomes also delete the job payload; non-terminal
    /// (cancelled) outcomes keep it for the requeued occurrence.
    ///
    /// One detail key exists per job id, so a later outcome of the same id
    /// (dedupe and periodic ids repeat) replaces the earlier one and the id
    /// leaves every other status index in the same transaction.
    pub fn record_tx(&self, entry: &ResultEntry) -> Result<StoreTx, JobError> {
        let body = serde_json::to_string(entry)?;
        let index = self.keys.results_index(entry.status);
        let retained = !matches!(entry.status, ResultStatus::Failure);

        let mut tx = StoreTx::new();
        tx.zadd(&index, entry.job_id.as_str(), entry.timestamp).set(
            self.keys.result_detail(&entry.job_id),
            body,
            retained.then_some(self.config.retention),
        );
        if entry.status.is_terminal() {
            tx.del(self.keys.payload(&entry.job_id));
        }
        if retained {
            tx.zrem_range_by_score(index, entry.timestamp - self.config.retention.as_secs_f64());
        }
        for other in ResultStatus::ALL.into_iter().filter(|st| *st != entry.status) {
            tx.zrem(self.keys.results_index(other), entry.job_id.as_str());
        }
        Ok(tx)
    }

    /// Record `entry` together with `followup` writes, atomically.
    #[instrument(skip(self, entry, followup), fields(job_id = %entry.job_id, status = %entry.status), err)]
    pub async fn record(&self, entry: &ResultEntry, followup: StoreTx) -> Result<(), JobError> {
        let mut tx = self.record_tx(entry)?;
        tx.extend(followup);
        self.store.exec(tx).await?;
        Ok(())
    }

    /// One page of outcomes with `status`, newest first. Pages start at 1.
    ///
    /// Index members whose detail already expired, or whose detail records a
    /// different outcome, are skipped, so a page may hold fewer than
    /// `page_size` entries.
    pub async fn get_jobs(&self, status: ResultStatus, page: usize) -> Result<Vec<ResultEntry>, JobError> {
        let size = self.config.page_size;
        let start = page.max(1).saturating_sub(1).saturating_mul(size);
        let stop = start.saturating_add(size).saturating_sub(1);
        let (start, stop) = (
            isize::try_from(start).unwrap_or(isize::MAX),
            isize::try_from(stop).unwrap_or(isize::MAX),
        );

        let ids = self.store.zrevrange(&self.keys.results_index(status), start, stop).await?;
        let detail_keys: Vec<String> = ids
            .iter()
            .map(|id| self.keys.result_detail(&JobId::from_string(id.as_str())))
            .collect();

        let mut entries = Vec::with_capacity(ids.len());
        for raw in self.store.get_many(&detail_keys).await?.into_iter().flatten() {
            let entry: ResultEntry = serde_json::from_str(&raw)?;
            if entry.status == status {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    pub async fn get_job(&self, job_id: &JobId) -> Result<Option<ResultEntry>, JobError> {
        match self.store.get(&self.keys.result_detail(job_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn get_jobs_counts(&self) -> Result<JobCounts, JobError> {
        let cutoff = now_ts() - self.config.retention.as_secs_f64();
        let success = self
            .store
            .zcount(&self.keys.results_index(ResultStatus::Success), cutoff, f64::INFINITY)
            .await?;
        let failure = self.store.zcard(&self.keys.results_index(ResultStatus::Failure)).await?;
        Ok(JobCounts { success, failure })
    }

    /// Remove every recorded failure; returns how many were removed.
    #[instrument(skip(self), err)]
    pub async fn clear_failed_jobs(&self) -> Result<u64, JobError> {
        let index = self.keys.results_index(ResultStatus::Failure);
        let ids = self.store.zrevrange(&index, 0, -1).await?;
        if ids.is_empty() {
            return Ok(0);
        }

        let mut tx = StoreTx::new();
        for id in &ids {
            tx.zrem(&index, id.as_str())
                .del(self.keys.result_detail(&JobId::from_string(id.as_str())));
        }
        let replies = self.store.exec(tx).await?;
        let removed = replies.iter().step_by(2).filter(|r| **r > 0).count() as u64;
        debug!(removed, "cleared failed jobs");
        Ok(removed)
    }

    /// Drop success and cancelled index members older than the retention
    /// window; returns how many were dropped.
    pub async fn prune(&self) -> Result<u64, JobError> {
        let cutoff = now_ts() - self.config.retention.as_secs_f64();
        let mut tx = StoreTx::new();
        for status in [ResultStatus::Success, ResultStatus::Cancelled] {
            tx.zrem_range_by_score(self.keys.results_index(status), cutoff);
        }
        let replies = self.store.exec(tx).await?;
        Ok(replies.iter().map(|r| (*r).max(0) as u64).sum())
    }

    /// Pending jobs per queue, highest priority first.
    pub async fn queue_depths(&self) -> Result<Vec<(QueueName, u64)>, JobError> {
        let mut depths = Vec::with_capacity(QueueName::PRIORITY.len());
        for queue in QueueName::PRIORITY {
            depths.push((queue, self.store.zcard(&self.keys.queue(queue)).await?));
        }
        Ok(depths)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::{JobPayload, Kwargs};
    use crate::store::InMemoryStore;

    fn ledger() -> (Arc<InMemoryStore>, ResultLedger) {
        let store = Arc::new(InMemoryStore::new());
        let config = LedgerConfig {
            retention: Duration::from_secs(100),
            page_size: 2,
        };
        (store.clone(), ResultLedger::new(store, KeySpace::default(), config))
    }

    fn entry(id: &str, status: ResultStatus, timestamp: f64) -> ResultEntry {
        let payload = JobPayload {
            task: "orders.sync".into(),
            args: vec![],
            kwargs: Kwargs::new(),
            queue: QueueName::Default,
            job_type: None,
            dedupe_key: None,
        };
        ResultEntry::from_payload(JobId::from_string(id), &payload, status, timestamp)
    }

    #[test]
    fn failure_records_keep_detail_forever_and_delete_payload() {
        let (_, ledger) = ledger();
        let tx = ledger.record_tx(&entry("j", ResultStatus::Failure, 10.0)).unwrap();
        let ops = tx.ops();
        assert_eq!(ops.len(), 5);
        assert!(matches!(&ops[1], crate::store::TxOp::Set { ttl: None, .. }));
        assert!(matches!(&ops[2], crate::store::TxOp::Del { key } if key == "depot:job:payload:j"));
    }

    #[test]
    fn cancelled_records_keep_payload_and_prune() {
        let (_, ledger) = ledger();
        let tx = ledger.record_tx(&entry("j", ResultStatus::Cancelled, 500.0)).unwrap();
        assert!(!tx.ops().iter().any(|op| matches!(op, crate::store::TxOp::Del { .. })));
        assert!(tx.ops().iter().any(
            |op| matches!(op, crate::store::TxOp::ZRemRangeByScore { max, .. } if *max == 400.0)
        ));
    }

    #[tokio::test]
    async fn success_write_prunes_entries_outside_window() {
        let (store, ledger) = ledger();
        let now = now_ts();
        ledger.record(&entry("old", ResultStatus::Success, now - 500.0), StoreTx::new()).await.unwrap();
        ledger.record(&entry("new", ResultStatus::Success, now), StoreTx::new()).await.unwrap();

        let index = KeySpace::default().results_index(ResultStatus::Success);
        assert_eq!(store.zrevrange(&index, 0, -1).await.unwrap(), vec!["new"]);
        assert_eq!(ledger.get_jobs_counts().await.unwrap().success, 1);
    }

    #[tokio::test]
    async fn pages_are_one_based_and_newest_first() {
        let (_, ledger) = ledger();
        for (i, id) in ["a", "b", "c"].into_iter().enumerate() {
            ledger
                .record(&entry(id, ResultStatus::Failure, 10.0 + i as f64), StoreTx::new())
                .await
                .unwrap();
        }

        let first: Vec<String> = ledger
            .get_jobs(ResultStatus::Failure, 1)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.job_id.to_string())
            .collect();
        assert_eq!(first, vec!["c", "b"]);
        assert_eq!(ledger.get_jobs(ResultStatus::Failure, 0).await.unwrap().len(), 2);
        assert_eq!(ledger.get_jobs(ResultStatus::Failure, 2).await.unwrap().len(), 1);
        assert!(ledger.get_jobs(ResultStatus::Failure, 3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn clear_failed_jobs_reports_count() {
        let (_, ledger) = ledger();
        ledger.record(&entry("x", ResultStatus::Failure, 1.0), StoreTx::new()).await.unwrap();
        ledger.record(&entry("y", ResultStatus::Failure, 2.0), StoreTx::new()).await.unwrap();

        assert_eq!(ledger.clear_failed_jobs().await.unwrap(), 2);
        assert_eq!(ledger.get_jobs_counts().await.unwrap().failure, 0);
        assert!(ledger.get_job(&JobId::from_string("x")).await.unwrap().is_none());
        assert_eq!(ledger.clear_failed_jobs().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn later_outcome_of_same_id_moves_it_between_indexes() {
        let (store, ledger) = ledger();
        let now = now_ts();
        ledger.record(&entry("dup", ResultStatus::Failure, now - 5.0), StoreTx::new()).await.unwrap();
        ledger.record(&entry("dup", ResultStatus::Success, now), StoreTx::new()).await.unwrap();

        assert!(ledger.get_jobs(ResultStatus::Failure, 1).await.unwrap().is_empty());
        let succeeded = ledger.get_jobs(ResultStatus::Success, 1).await.unwrap();
        assert_eq!(succeeded.len(), 1);
        assert_eq!(succeeded[0].status, ResultStatus::Success);
        assert_eq!(ledger.get_jobs_counts().await.unwrap(), JobCounts { success: 1, failure: 0 });

        let failure_index = KeySpace::default().results_index(ResultStatus::Failure);
        assert_eq!(store.zcard(&failure_index).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn index_members_with_mismatched_detail_are_skipped() {
        let (store, ledger) = ledger();
        let now = now_ts();
        ledger.record(&entry("j", ResultStatus::Success, now), StoreTx::new()).await.unwrap();
        let mut tx = StoreTx::new();
        tx.zadd(KeySpace::default().results_index(ResultStatus::Failure), "j", now);
        store.exec(tx).await.unwrap();

        assert!(ledger.get_jobs(ResultStatus::Failure, 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn queue_depths_cover_every_queue() {
        let (store, ledger) = ledger();
        let mut tx = StoreTx::new();
        tx.zadd(KeySpace::default().queue(QueueName::Mail), "depot:job:m", 1.0);
        store.exec(tx).await.unwrap();

        let depths = ledger.queue_depths().await.unwrap();
        assert_eq!(depths.len(), 4);
        assert_eq!(depths[3], (QueueName::Mail, 1));
        assert_eq!(depths[0], (QueueName::High, 0));
    }
}
