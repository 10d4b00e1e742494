//! Wiring of the job system for one process.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::enqueuer::Enqueuer;
use super::keys::KeySpace;
use super::ledger::{LedgerConfig, ResultLedger};
use super::registry::TaskRegistry;
use super::scheduler::{Scheduler, SchedulerConfig};
use super::worker::{WorkerConfig, WorkerPool, WorkerPoolHandle, WorkerStatsSnapshot};
use crate::config::DepotConfig;
use crate::store::SharedStore;

/// Everything a process needs to enqueue, run and inspect jobs.
pub struct JobRuntime {
    store: Arc<dyn SharedStore>,
    keys: KeySpace,
    registry: Arc<TaskRegistry>,
    worker: WorkerConfig,
    scheduler: SchedulerConfig,
    ledger: LedgerConfig,
}

impl JobRuntime {
    pub fn new(store: Arc<dyn SharedStore>, registry: TaskRegistry, config: &DepotConfig) -> Self {
        Self {
            store,
            keys: KeySpace::new(config.namespace.as_str()),
            registry: Arc::new(registry),
            worker: config.worker_config(),
            scheduler: config.scheduler_config(),
            ledger: config.ledger_config(),
        }
    }

    pub fn with_worker_config(mut self, worker: WorkerConfig) -> Self {
        self.worker = worker;
        self
    }

    pub fn with_scheduler_config(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    pub fn enqueuer(&self) -> Enqueuer {
        Enqueuer::new(self.store.clone(), self.keys.clone())
    }

    pub fn ledger(&self) -> ResultLedger {
        ResultLedger::new(self.store.clone(), self.keys.clone(), self.ledger.clone())
    }

    pub fn worker_pool(&self) -> WorkerPool {
        WorkerPool::new(
            self.store.clone(),
            self.keys.clone(),
            self.registry.clone(),
            self.ledger(),
            self.worker.clone(),
        )
    }

    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(
            self.store.clone(),
            self.keys.clone(),
            self.registry.clone(),
            self.scheduler.clone(),
        )
    }

    /// Start the worker pool and the scheduler under one cancellation token.
    pub fn start(&self) -> RuntimeHandle {
        let token = CancellationToken::new();
        let pool = self.worker_pool().spawn(token.child_token());
        let scheduler = self.scheduler().spawn(token.child_token());
        info!(
            namespace = self.keys.namespace(),
            workers = self.worker.concurrency,
            "job runtime started"
        );
        RuntimeHandle {
            token,
            pool,
            scheduler,
        }
    }
}

#[derive(Debug)]
pub struct RuntimeHandle {
    token: CancellationToken,
    pool: WorkerPoolHandle,
    scheduler: JoinHandle<()>,
}

impl RuntimeHandle {
    pub fn stats(&self) -> WorkerStatsSnapshot {
        self.pool.stats()
    }

    /// Cancel everything, wait for in-flight jobs to be requeued and the
    /// scheduler lock to be released.
    pub async fn shutdown(self) {
        self.token.cancel();
        self.pool.join().await;
        if let Err(err) = self.scheduler.await {
            error!(error = %err, "scheduler task terminated abnormally");
        }
        info!("job runtime stopped");
    }
}
