//! Distributed priority job queue.
//!
//! ## Design
//!
//! - Jobs live in one sorted set per priority queue, scored by due time
//! - Payloads are stored apart from queue entries, with a TTL
//! - Workers pop across queues in fixed priority order (at-least-once)
//! - One leader-elected scheduler per deployment seeds periodic jobs
//! - Outcomes go to a bounded result ledger
//!
//! ## Components
//!
//! - `Enqueuer`: identity, validation and the atomic queue + payload write
//! - `TaskRegistry`: task names → handlers, periodic schedules
//! - `WorkerPool`: pop/execute loop with lossless cancellation
//! - `Scheduler`: lock-holding periodic seeding
//! - `ResultLedger`: outcome queries and retention
//! - `JobRuntime`: per-process wiring

pub mod builtin;
pub mod enqueuer;
pub mod error;
pub mod identity;
pub mod keys;
pub mod ledger;
pub mod registry;
pub mod runtime;
pub mod scheduler;
pub mod types;
pub mod worker;

pub use builtin::{register_builtin_tasks, PRUNE_RESULTS_TASK};
pub use enqueuer::Enqueuer;
pub use error::JobError;
pub use keys::KeySpace;
pub use ledger::{JobCounts, LedgerConfig, ResultLedger};
pub use registry::{IntervalUnit, PeriodicJob, Schedule, TaskCall, TaskHandler, TaskRegistry};
pub use runtime::{JobRuntime, RuntimeHandle};
pub use scheduler::{Scheduler, SchedulerConfig};
pub use types::{EnqueueOutcome, EnqueueRequest, JobPayload, Kwargs, ResultEntry, ScheduledFor};
pub use worker::{Iteration, WorkerConfig, WorkerPool, WorkerPoolHandle, WorkerPoolStats, WorkerStatsSnapshot};
