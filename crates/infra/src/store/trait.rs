use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Shared-store operation error.
///
/// These are **infrastructure errors** and are treated as transient by the
/// job system: enqueue callers see them directly, worker loops log them and
/// back off.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("store connection error: {0}")]
    Connection(String),

    #[error("store command error: {0}")]
    Command(String),

    #[error("store script error: {0}")]
    Script(String),
}

/// A member removed by a blocking pop-minimum.
#[derive(Debug, Clone, PartialEq)]
pub struct PoppedMember {
    /// Sorted-set key the member was popped from.
    pub key: String,
    pub member: String,
    pub score: f64,
}

/// One write inside an atomic transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum TxOp {
    /// `ZADD key NX score member`
    ZAddNx { key: String, member: String, score: f64 },
    /// `ZADD key score member`
    ZAdd { key: String, member: String, score: f64 },
    /// `ZREM key member`
    ZRem { key: String, member: String },
    /// `ZREMRANGEBYSCORE key -inf max`
    ZRemRangeByScore { key: String, max: f64 },
    /// `SET key value [PX ttl]`
    Set {
        key: String,
        value: String,
        ttl: Option<Duration>,
    },
    /// `DEL key`
    Del { key: String },
}

/// Ordered batch of writes applied atomically (all or nothing, no interleaving).
///
/// Each op yields an integer reply: number of members added/removed for
/// sorted-set ops, `1` for `SET`, number of keys removed for `DEL`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreTx {
    ops: Vec<TxOp>,
}

impl StoreTx {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn zadd_nx(&mut self, key: impl Into<String>, member: impl Into<String>, score: f64) -> &mut Self {
        self.ops.push(TxOp::ZAddNx {
            key: key.into(),
            member: member.into(),
            score,
        });
        self
    }

    pub fn zadd(&mut self, key: impl Into<String>, member: impl Into<String>, score: f64) -> &mut Self {
        self.ops.push(TxOp::ZAdd {
            key: key.into(),
            member: member.into(),
            score,
        });
        self
    }

    pub fn zrem(&mut self, key: impl Into<String>, member: impl Into<String>) -> &mut Self {
        self.ops.push(TxOp::ZRem {
            key: key.into(),
            member: member.into(),
        });
        self
    }

    pub fn zrem_range_by_score(&mut self, key: impl Into<String>, max: f64) -> &mut Self {
        self.ops.push(TxOp::ZRemRangeByScore { key: key.into(), max });
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>, ttl: Option<Duration>) -> &mut Self {
        self.ops.push(TxOp::Set {
            key: key.into(),
            value: value.into(),
            ttl,
        });
        self
    }

    pub fn del(&mut self, key: impl Into<String>) -> &mut Self {
        self.ops.push(TxOp::Del { key: key.into() });
        self
    }

    /// Append every op of `other` after the ops already queued.
    pub fn extend(&mut self, other: StoreTx) -> &mut Self {
        self.ops.extend(other.ops);
        self
    }

    pub fn ops(&self) -> &[TxOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

/// Key/value + sorted-set store shared by every process of a deployment.
///
/// This is the **only** coordination primitive of the job system: no
/// in-process lock is used for cross-worker coordination. Every mutation of
/// queue membership, payload existence and leadership goes through one of the
/// atomic operations below.
///
/// ## Implementation Requirements
///
/// - `exec` applies all ops of a transaction atomically and in order
/// - `enqueue_job` is a single atomic step (see its docs)
/// - `pop_due` / `pop_min` remove the member they return (no other caller may
///   also get it)
/// - `compare_and_delete` / `compare_and_expire` compare and act atomically
/// - expired values are never returned
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Apply a transaction atomically and return one integer reply per op.
    async fn exec(&self, tx: StoreTx) -> Result<Vec<i64>, StoreError>;

    /// Atomically create a queued job.
    ///
    /// Does nothing (returns `false`) when `payload_key` already exists.
    /// Otherwise adds `member` to `queue_key` with `ZADD NX` and writes the
    /// payload with `SET NX` + TTL, returning whether the queue entry was added.
    async fn enqueue_job(
        &self,
        queue_key: &str,
        member: &str,
        score: f64,
        payload_key: &str,
        payload: &str,
        payload_ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Remove and return the lowest-scored member with `score <= max_score`
    /// from the first key (in the given order) that has one. Never blocks.
    async fn pop_due(&self, keys: &[String], max_score: f64) -> Result<Option<PoppedMember>, StoreError>;

    /// Block up to `timeout` for the lowest-scored member across `keys`.
    ///
    /// Keys are checked in the given order; the first non-empty key wins.
    async fn pop_min(&self, keys: &[String], timeout: Duration) -> Result<Option<PoppedMember>, StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError>;

    /// `SET key value NX PX ttl`; returns whether the value was written.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Delete `key` only if it currently holds `expected`.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError>;

    /// Reset the TTL of `key` only if it currently holds `expected`.
    async fn compare_and_expire(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Members by descending score; `stop` is inclusive and `-1` means the end.
    async fn zrevrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>, StoreError>;

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>, StoreError>;

    async fn zcard(&self, key: &str) -> Result<u64, StoreError>;

    /// Number of members with `min <= score <= max`.
    async fn zcount(&self, key: &str, min: f64, max: f64) -> Result<u64, StoreError>;
}
