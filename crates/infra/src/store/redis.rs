//! Redis-backed shared store.
//!
//! - **Transactions**: `MULTI`/`EXEC` via an atomic pipeline
//! - **Compare-and-act**: Lua scripts (`EVALSHA` with `EVAL` fallback)
//! - **Due pops**: one Lua script walks the queues in order and takes the
//!   first member whose score is due
//! - **Blocking pops**: `BZPOPMIN` on dedicated connections, so a worker
//!   blocked on an empty queue never stalls the shared multiplexed connection

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::{Script, Value};
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use super::r#trait::{PoppedMember, SharedStore, StoreError, StoreTx, TxOp};

const ENQUEUE_JOB_LUA: &str = include_str!("lua/enqueue_job.lua");
const POP_DUE_LUA: &str = include_str!("lua/pop_due.lua");
const COMPARE_AND_DELETE_LUA: &str = include_str!("lua/compare_and_delete.lua");
const COMPARE_AND_EXPIRE_LUA: &str = include_str!("lua/compare_and_expire.lua");

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout() {
            StoreError::Connection(err.to_string())
        } else if err.kind() == redis::ErrorKind::NoScriptError {
            StoreError::Script(err.to_string())
        } else {
            StoreError::Command(err.to_string())
        }
    }
}

#[derive(Clone)]
pub struct RedisStore {
    client: Arc<redis::Client>,
    conn: ConnectionManager,
    blocking: Arc<Mutex<Vec<MultiplexedConnection>>>,
    enqueue_job_script: Script,
    pop_due_script: Script,
    compare_and_delete_script: Script,
    compare_and_expire_script: Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to Redis.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    pub async fn connect(redis_url: impl AsRef<str>) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
            conn,
            blocking: Arc::new(Mutex::new(Vec::new())),
            enqueue_job_script: Script::new(ENQUEUE_JOB_LUA),
            pop_due_script: Script::new(POP_DUE_LUA),
            compare_and_delete_script: Script::new(COMPARE_AND_DELETE_LUA),
            compare_and_expire_script: Script::new(COMPARE_AND_EXPIRE_LUA),
        })
    }

    async fn checkout_blocking(&self) -> Result<MultiplexedConnection, StoreError> {
        if let Some(conn) = self.blocking.lock().await.pop() {
            return Ok(conn);
        }
        debug!("opening dedicated connection for blocking pops");
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))
    }

    async fn checkin_blocking(&self, conn: MultiplexedConnection) {
        self.blocking.lock().await.push(conn);
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// Redis accepts `-inf`/`+inf` as score bounds; Rust formats infinity as `inf`.
fn score_bound(score: f64) -> String {
    if score == f64::INFINITY {
        "+inf".to_string()
    } else if score == f64::NEG_INFINITY {
        "-inf".to_string()
    } else {
        score.to_string()
    }
}

fn reply_as_int(value: &Value) -> i64 {
    match value {
        Value::Nil => 0,
        Value::Int(n) => *n,
        _ => 1,
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    #[instrument(skip(self, tx), fields(ops = tx.len()), err)]
    async fn exec(&self, tx: StoreTx) -> Result<Vec<i64>, StoreError> {
        if tx.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in tx.ops() {
            match op {
                TxOp::ZAddNx { key, member, score } => {
                    pipe.cmd("ZADD").arg(key).arg("NX").arg(*score).arg(member);
                }
                TxOp::ZAdd { key, member, score } => {
                    pipe.cmd("ZADD").arg(key).arg(*score).arg(member);
                }
                TxOp::ZRem { key, member } => {
                    pipe.cmd("ZREM").arg(key).arg(member);
                }
                TxOp::ZRemRangeByScore { key, max } => {
                    pipe.cmd("ZREMRANGEBYSCORE").arg(key).arg("-inf").arg(score_bound(*max));
                }
                TxOp::Set { key, value, ttl } => {
                    let cmd = pipe.cmd("SET").arg(key).arg(value);
                    if let Some(ttl) = ttl {
                        cmd.arg("PX").arg(ttl_millis(*ttl));
                    }
                }
                TxOp::Del { key } => {
                    pipe.cmd("DEL").arg(key);
                }
            }
        }

        let mut conn = self.conn.clone();
        let replies: Vec<Value> = pipe.query_async(&mut conn).await?;
        Ok(replies.iter().map(reply_as_int).collect())
    }

    #[instrument(skip(self, payload), err)]
    async fn enqueue_job(
        &self,
        queue_key: &str,
        member: &str,
        score: f64,
        payload_key: &str,
        payload: &str,
        payload_ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let added: i64 = self
            .enqueue_job_script
            .key(queue_key)
            .key(payload_key)
            .arg(score)
            .arg(member)
            .arg(payload)
            .arg(ttl_millis(payload_ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(added == 1)
    }

    async fn pop_due(&self, keys: &[String], max_score: f64) -> Result<Option<PoppedMember>, StoreError> {
        if keys.is_empty() {
            return Ok(None);
        }
        let mut invocation = self.pop_due_script.prepare_invoke();
        for key in keys {
            invocation.key(key);
        }
        let mut conn = self.conn.clone();
        let popped: Option<(String, String, f64)> =
            invocation.arg(score_bound(max_score)).invoke_async(&mut conn).await?;
        Ok(popped.map(|(key, member, score)| PoppedMember { key, member, score }))
    }

    async fn pop_min(&self, keys: &[String], timeout: Duration) -> Result<Option<PoppedMember>, StoreError> {
        let mut conn = self.checkout_blocking().await?;
        let popped: Result<Option<(String, String, f64)>, redis::RedisError> = redis::cmd("BZPOPMIN")
            .arg(keys)
            // 0 would block forever
            .arg(timeout.as_secs_f64().max(0.001))
            .query_async(&mut conn)
            .await;

        match popped {
            Ok(popped) => {
                self.checkin_blocking(conn).await;
                Ok(popped.map(|(key, member, score)| PoppedMember { key, member, score }))
            }
            Err(err) => {
                warn!(error = %err, "dropping dedicated blocking connection");
                Err(err.into())
            }
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let values: Vec<Option<String>> = redis::cmd("MGET").arg(keys).query_async(&mut conn).await?;
        Ok(values)
    }

    #[instrument(skip(self, value), err)]
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let reply: Value = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply_as_int(&reply) == 1)
    }

    #[instrument(skip(self, expected), err)]
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .compare_and_delete_script
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }

    #[instrument(skip(self, expected), err)]
    async fn compare_and_expire(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let renewed: i64 = self
            .compare_and_expire_script
            .key(key)
            .arg(expected)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(renewed == 1)
    }

    async fn zrevrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = redis::cmd("ZREVRANGE")
            .arg(key)
            .arg(start)
            .arg(stop)
            .query_async(&mut conn)
            .await?;
        Ok(members)
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>, StoreError> {
        let mut conn = self.conn.clone();
        let score: Option<f64> = redis::cmd("ZSCORE").arg(key).arg(member).query_async(&mut conn).await?;
        Ok(score)
    }

    async fn zcard(&self, key: &str) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let count: u64 = redis::cmd("ZCARD").arg(key).query_async(&mut conn).await?;
        Ok(count)
    }

    async fn zcount(&self, key: &str, min: f64, max: f64) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let count: u64 = redis::cmd("ZCOUNT")
            .arg(key)
            .arg(score_bound(min))
            .arg(score_bound(max))
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infinite_bounds_use_redis_spelling() {
        assert_eq!(score_bound(f64::INFINITY), "+inf");
        assert_eq!(score_bound(f64::NEG_INFINITY), "-inf");
        assert_eq!(score_bound(12.5), "12.5");
    }

    #[test]
    fn status_and_nil_replies_map_to_effect_counts() {
        assert_eq!(reply_as_int(&Value::Okay), 1);
        assert_eq!(reply_as_int(&Value::Nil), 0);
        assert_eq!(reply_as_int(&Value::Int(3)), 3);
    }

    #[test]
    fn ttl_never_rounds_to_zero() {
        assert_eq!(ttl_millis(Duration::from_micros(10)), 1);
        assert_eq!(ttl_millis(Duration::from_secs(2)), 2000);
    }
}
