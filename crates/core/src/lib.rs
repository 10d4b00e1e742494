//! `depot-core`: vocabulary shared by the job system.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! job identifiers, the fixed set of priority queues, periodic job types and
//! result statuses.

pub mod error;
pub mod id;
pub mod queue;

pub use error::{DomainError, DomainResult};
pub use id::JobId;
pub use queue::{JobType, QueueName, ResultStatus};
