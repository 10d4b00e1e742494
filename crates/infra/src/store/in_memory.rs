use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::r#trait::{PoppedMember, SharedStore, StoreError, StoreTx, TxOp};

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

#[derive(Debug, Default)]
struct State {
    values: HashMap<String, StoredValue>,
    sorted: HashMap<String, HashMap<String, f64>>,
}

impl State {
    fn live_value(&mut self, key: &str, now: Instant) -> Option<&StoredValue> {
        if self.values.get(key).is_some_and(|v| !v.is_live(now)) {
            self.values.remove(key);
        }
        self.values.get(key)
    }

    fn set(&mut self, key: &str, value: &str, ttl: Option<Duration>, now: Instant) {
        self.values.insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                expires_at: ttl.map(|t| now + t),
            },
        );
    }

    fn zadd(&mut self, key: &str, member: &str, score: f64, only_new: bool) -> i64 {
        let set = self.sorted.entry(key.to_string()).or_default();
        match set.get_mut(member) {
            Some(_) if only_new => 0,
            Some(existing) => {
                *existing = score;
                0
            }
            None => {
                set.insert(member.to_string(), score);
                1
            }
        }
    }

    fn zrem(&mut self, key: &str, member: &str) -> i64 {
        let removed = self
            .sorted
            .get_mut(key)
            .map(|set| i64::from(set.remove(member).is_some()))
            .unwrap_or(0);
        self.drop_if_empty(key);
        removed
    }

    fn zrem_range_by_score(&mut self, key: &str, max: f64) -> i64 {
        let Some(set) = self.sorted.get_mut(key) else {
            return 0;
        };
        let before = set.len();
        set.retain(|_, score| *score > max);
        let removed = before - set.len();
        self.drop_if_empty(key);
        removed as i64
    }

    fn del(&mut self, key: &str, now: Instant) -> i64 {
        let value = self.live_value(key, now).is_some() && self.values.remove(key).is_some();
        let set = self.sorted.remove(key).is_some();
        i64::from(value || set)
    }

    fn drop_if_empty(&mut self, key: &str) {
        if self.sorted.get(key).is_some_and(|set| set.is_empty()) {
            self.sorted.remove(key);
        }
    }

    /// Members ordered by `(score, member)`, the order Redis uses.
    fn ordered(&self, key: &str) -> Vec<(String, f64)> {
        let mut members: Vec<(String, f64)> = self
            .sorted
            .get(key)
            .map(|set| set.iter().map(|(m, s)| (m.clone(), *s)).collect())
            .unwrap_or_default();
        members.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        members
    }

    fn pop_min(&mut self, keys: &[String]) -> Option<PoppedMember> {
        self.pop_first(keys, f64::INFINITY)
    }

    fn pop_first(&mut self, keys: &[String], max_score: f64) -> Option<PoppedMember> {
        for key in keys {
            let first = self.ordered(key).into_iter().next().filter(|(_, score)| *score <= max_score);
            if let Some((member, score)) = first {
                self.zrem(key, &member);
                return Some(PoppedMember {
                    key: key.clone(),
                    member,
                    score,
                });
            }
        }
        None
    }
}

/// In-memory shared store.
///
/// Intended for tests/dev. Not optimized for performance. Every operation runs
/// under a single mutex, so transactions are trivially atomic. TTLs follow the
/// tokio clock, which lets paused-time tests expire values deterministically.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
    changed: Notify,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Command("in-memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl SharedStore for InMemoryStore {
    async fn exec(&self, tx: StoreTx) -> Result<Vec<i64>, StoreError> {
        let now = Instant::now();
        let mut replies = Vec::with_capacity(tx.len());
        let mut added = false;
        {
            let mut state = self.state()?;
            for op in tx.ops() {
                let reply = match op {
                    TxOp::ZAddNx { key, member, score } => state.zadd(key, member, *score, true),
                    TxOp::ZAdd { key, member, score } => state.zadd(key, member, *score, false),
                    TxOp::ZRem { key, member } => state.zrem(key, member),
                    TxOp::ZRemRangeByScore { key, max } => state.zrem_range_by_score(key, *max),
                    TxOp::Set { key, value, ttl } => {
                        state.set(key, value, *ttl, now);
                        1
                    }
                    TxOp::Del { key } => state.del(key, now),
                };
                added |= matches!(op, TxOp::ZAddNx { .. } | TxOp::ZAdd { .. });
                replies.push(reply);
            }
        }
        if added {
            self.changed.notify_waiters();
        }
        Ok(replies)
    }

    async fn enqueue_job(
        &self,
        queue_key: &str,
        member: &str,
        score: f64,
        payload_key: &str,
        payload: &str,
        payload_ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = Instant::now();
        let added = {
            let mut state = self.state()?;
            if state.live_value(payload_key, now).is_some() {
                return Ok(false);
            }
            let added = state.zadd(queue_key, member, score, true) == 1;
            state.set(payload_key, payload, Some(payload_ttl), now);
            added
        };
        if added {
            self.changed.notify_waiters();
        }
        Ok(added)
    }

    async fn pop_due(&self, keys: &[String], max_score: f64) -> Result<Option<PoppedMember>, StoreError> {
        Ok(self.state()?.pop_first(keys, max_score))
    }

    async fn pop_min(&self, keys: &[String], timeout: Duration) -> Result<Option<PoppedMember>, StoreError> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(popped) = self.state()?.pop_min(keys) {
                return Ok(Some(popped));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = Instant::now();
        Ok(self.state()?.live_value(key, now).map(|v| v.value.clone()))
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError> {
        let now = Instant::now();
        let mut state = self.state()?;
        Ok(keys
            .iter()
            .map(|key| state.live_value(key, now).map(|v| v.value.clone()))
            .collect())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut state = self.state()?;
        if state.live_value(key, now).is_some() {
            return Ok(false);
        }
        state.set(key, value, Some(ttl), now);
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut state = self.state()?;
        if state.live_value(key, now).is_some_and(|v| v.value == expected) {
            state.values.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn compare_and_expire(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut state = self.state()?;
        if state.live_value(key, now).is_some_and(|v| v.value == expected) {
            if let Some(v) = state.values.get_mut(key) {
                v.expires_at = Some(now + ttl);
            }
            return Ok(true);
        }
        Ok(false)
    }

    async fn zrevrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>, StoreError> {
        let mut members = self.state()?.ordered(key);
        members.reverse();
        let len = members.len() as isize;
        let normalize = |i: isize| if i < 0 { len + i } else { i };
        let (start, stop) = (normalize(start).max(0), normalize(stop).min(len - 1));
        if start > stop {
            return Ok(Vec::new());
        }
        Ok(members[start as usize..=stop as usize]
            .iter()
            .map(|(m, _)| m.clone())
            .collect())
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>, StoreError> {
        Ok(self
            .state()?
            .sorted
            .get(key)
            .and_then(|set| set.get(member).copied()))
    }

    async fn zcard(&self, key: &str) -> Result<u64, StoreError> {
        Ok(self.state()?.sorted.get(key).map(|set| set.len() as u64).unwrap_or(0))
    }

    async fn zcount(&self, key: &str, min: f64, max: f64) -> Result<u64, StoreError> {
        Ok(self
            .state()?
            .sorted
            .get(key)
            .map(|set| set.values().filter(|s| **s >= min && **s <= max).count() as u64)
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn transaction_replies_follow_op_order() {
        let store = InMemoryStore::new();
        let mut tx = StoreTx::new();
        tx.zadd_nx("q", "a", 1.0)
            .zadd_nx("q", "a", 5.0)
            .set("k", "v", None)
            .del("missing");

        assert_eq!(store.exec(tx).await.unwrap(), vec![1, 0, 1, 0]);
        assert_eq!(store.zscore("q", "a").await.unwrap(), Some(1.0));
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn pop_min_honors_key_order_before_score() {
        let store = InMemoryStore::new();
        let mut tx = StoreTx::new();
        tx.zadd("low", "early", 1.0).zadd("high", "late", 100.0);
        store.exec(tx).await.unwrap();

        let keys = vec!["high".to_string(), "low".to_string()];
        let first = store.pop_min(&keys, Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(first.key, "high");
        assert_eq!(first.member, "late");

        let second = store.pop_min(&keys, Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(second.member, "early");
        assert!(store.pop_min(&keys, Duration::from_millis(10)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn pop_due_skips_keys_with_nothing_due() {
        let store = InMemoryStore::new();
        let mut tx = StoreTx::new();
        tx.zadd("high", "later", 100.0)
            .zadd("low", "now", 5.0)
            .zadd("low", "soon", 50.0);
        store.exec(tx).await.unwrap();

        let keys = vec!["high".to_string(), "low".to_string()];
        let popped = store.pop_due(&keys, 10.0).await.unwrap().unwrap();
        assert_eq!((popped.key.as_str(), popped.member.as_str()), ("low", "now"));
        assert!(store.pop_due(&keys, 10.0).await.unwrap().is_none());
        assert_eq!(store.zscore("high", "later").await.unwrap(), Some(100.0));
        assert_eq!(store.zcard("low").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn pop_min_wakes_on_concurrent_add() {
        let store = std::sync::Arc::new(InMemoryStore::new());
        let keys = vec!["q".to_string()];

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.pop_min(&keys, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let mut tx = StoreTx::new();
        tx.zadd("q", "m", 3.0);
        store.exec(tx).await.unwrap();

        let popped = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(popped.member, "m");
        assert_eq!(popped.score, 3.0);
    }

    #[tokio::test(start_paused = true)]
    async fn values_expire_on_the_tokio_clock() {
        let store = InMemoryStore::new();
        assert!(store.set_nx("lock", "a", Duration::from_secs(5)).await.unwrap());
        assert!(!store.set_nx("lock", "b", Duration::from_secs(5)).await.unwrap());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(store.get("lock").await.unwrap().is_none());
        assert!(store.set_nx("lock", "b", Duration::from_secs(5)).await.unwrap());
    }

    #[tokio::test]
    async fn compare_and_delete_only_removes_matching_holder() {
        let store = InMemoryStore::new();
        store.set_nx("lock", "me", Duration::from_secs(30)).await.unwrap();

        assert!(!store.compare_and_delete("lock", "you").await.unwrap());
        assert!(!store.compare_and_expire("lock", "you", Duration::from_secs(1)).await.unwrap());
        assert!(store.compare_and_delete("lock", "me").await.unwrap());
        assert!(store.get("lock").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn enqueue_job_refuses_existing_payload() {
        let store = InMemoryStore::new();
        let ttl = Duration::from_secs(60);
        assert!(store.enqueue_job("q1", "m", 1.0, "p", "{}", ttl).await.unwrap());
        assert!(!store.enqueue_job("q2", "m", 2.0, "p", "{}", ttl).await.unwrap());
        assert_eq!(store.zcard("q2").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn zrevrange_pages_newest_first() {
        let store = InMemoryStore::new();
        let mut tx = StoreTx::new();
        for i in 0..5 {
            tx.zadd("idx", format!("m{i}"), f64::from(i));
        }
        store.exec(tx).await.unwrap();

        assert_eq!(store.zrevrange("idx", 0, 1).await.unwrap(), vec!["m4", "m3"]);
        assert_eq!(store.zrevrange("idx", 4, 10).await.unwrap(), vec!["m0"]);
        assert!(store.zrevrange("idx", 5, 9).await.unwrap().is_empty());
        assert_eq!(store.zrevrange("idx", 0, -1).await.unwrap().len(), 5);
        assert_eq!(store.zcount("idx", 2.0, f64::INFINITY).await.unwrap(), 3);
    }
}
