//! Shared-store boundary.
//!
//! The job system coordinates every process of a deployment through one
//! key/value + sorted-set store. This module defines that boundary without
//! committing to a backend; Redis is gated behind the `redis` feature.

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis;
pub mod r#trait;

pub use in_memory::InMemoryStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisStore;
pub use r#trait::{PoppedMember, SharedStore, StoreError, StoreTx, TxOp};
