//! Built-in housekeeping tasks.

use depot_core::QueueName;

use super::error::JobError;
use super::ledger::ResultLedger;
use super::registry::{IntervalUnit, PeriodicJob, Schedule, TaskRegistry};

/// Task that trims expired success and cancelled outcomes from the ledger
/// indexes. Writes prune as they go; this catches indexes that went quiet.
pub const PRUNE_RESULTS_TASK: &str = "ledger.prune_results";

/// Register every built-in task and its schedule.
pub fn register_builtin_tasks(registry: &mut TaskRegistry, ledger: ResultLedger) -> Result<(), JobError> {
    registry.register(PRUNE_RESULTS_TASK, move |_call| {
        let ledger = ledger.clone();
        async move {
            let pruned = ledger.prune().await?;
            tracing::debug!(pruned, "pruned result ledger");
            anyhow::Ok(())
        }
    });
    registry.schedule(
        PeriodicJob::new(PRUNE_RESULTS_TASK, Schedule::every(5, IntervalUnit::Minutes)?).on_queue(QueueName::Low),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::jobs::keys::KeySpace;
    use crate::jobs::ledger::LedgerConfig;
    use crate::store::InMemoryStore;
    use depot_core::JobType;

    #[test]
    fn prune_task_runs_every_five_minutes_on_low() {
        let ledger = ResultLedger::new(Arc::new(InMemoryStore::new()), KeySpace::default(), LedgerConfig::default());
        let mut registry = TaskRegistry::new();
        register_builtin_tasks(&mut registry, ledger).unwrap();

        let job = registry.periodic(PRUNE_RESULTS_TASK).unwrap();
        assert_eq!(job.queue, QueueName::Low);
        assert_eq!(job.schedule.job_type(), JobType::Interval);
        assert_eq!(job.schedule.interval(), Some(std::time::Duration::from_secs(300)));
        assert!(registry.resolve(PRUNE_RESULTS_TASK).is_ok());
    }
}
