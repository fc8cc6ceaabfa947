use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{AtomicKv, BalanceOutcome, BucketState, CounterOutcome, KvResult, now_ms};

#[derive(Default)]
struct Inner {
    counters: HashMap<String, (u64, u64)>,
    balances: HashMap<String, i64>,
    buckets: HashMap<String, (u32, u64)>,
    records: HashMap<String, (u64, Vec<u8>)>,
}

/// In-process store with the same operation semantics as [`super::FjallKv`].
/// Correct within one process; used as the degraded fallback and in tests.
#[derive(Default)]
pub struct MemoryKv {
    inner: Mutex<Inner>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AtomicKv for MemoryKv {
    async fn counter_consume(
        &self,
        key: &str,
        limit: u64,
        ttl: Duration,
    ) -> KvResult<CounterOutcome> {
        let mut inner = self.inner.lock().expect("memory kv lock");
        let now = now_ms();

        let (value, expires_at_ms) = match inner.counters.get(key) {
            Some(&(value, expires)) if expires > now => (value, expires),
            _ => (0, now + ttl.as_millis() as u64),
        };

        if value >= limit {
            return Ok(CounterOutcome { consumed: false, value });
        }
        inner.counters.insert(key.to_string(), (value + 1, expires_at_ms));
        Ok(CounterOutcome { consumed: true, value: value + 1 })
    }

    async fn counter_release(&self, key: &str) -> KvResult<u64> {
        let mut inner = self.inner.lock().expect("memory kv lock");
        let now = now_ms();
        match inner.counters.get(key).copied() {
            Some((value, expires)) if expires > now && value > 0 => {
                inner.counters.insert(key.to_string(), (value - 1, expires));
                Ok(value - 1)
            }
            _ => Ok(0),
        }
    }

    async fn balance_take(&self, key: &str, amount: i64) -> KvResult<BalanceOutcome> {
        let mut inner = self.inner.lock().expect("memory kv lock");
        let balance = inner.balances.get(key).copied().unwrap_or(0);
        if balance < amount {
            return Ok(BalanceOutcome { taken: false, balance });
        }
        inner.balances.insert(key.to_string(), balance - amount);
        Ok(BalanceOutcome { taken: true, balance: balance - amount })
    }

    async fn balance_add(&self, key: &str, delta: i64) -> KvResult<i64> {
        let mut inner = self.inner.lock().expect("memory kv lock");
        let next = (inner.balances.get(key).copied().unwrap_or(0) + delta).max(0);
        inner.balances.insert(key.to_string(), next);
        Ok(next)
    }

    async fn balance_get(&self, key: &str) -> KvResult<i64> {
        let inner = self.inner.lock().expect("memory kv lock");
        Ok(inner.balances.get(key).copied().unwrap_or(0))
    }

    async fn bucket_take(&self, key: &str, limit: u32, window: Duration) -> KvResult<BucketState> {
        let mut inner = self.inner.lock().expect("memory kv lock");
        let now = now_ms();

        let state = match inner.buckets.get(key).copied() {
            Some((remaining, reset_at_ms)) if reset_at_ms > now => {
                if remaining == 0 {
                    BucketState { admitted: false, limit, remaining: 0, reset_at_ms }
                } else {
                    inner.buckets.insert(key.to_string(), (remaining - 1, reset_at_ms));
                    BucketState { admitted: true, limit, remaining: remaining - 1, reset_at_ms }
                }
            }
            _ => {
                let reset_at_ms = now + window.as_millis() as u64;
                let remaining = limit.saturating_sub(1);
                inner.buckets.insert(key.to_string(), (remaining, reset_at_ms));
                BucketState { admitted: true, limit, remaining, reset_at_ms }
            }
        };
        Ok(state)
    }

    async fn record_get(&self, key: &str) -> KvResult<Option<Vec<u8>>> {
        let inner = self.inner.lock().expect("memory kv lock");
        Ok(inner
            .records
            .get(key)
            .filter(|(expires, _)| *expires > now_ms())
            .map(|(_, value)| value.clone()))
    }

    async fn record_put(&self, key: &str, value: &[u8], ttl: Duration) -> KvResult<()> {
        let mut inner = self.inner.lock().expect("memory kv lock");
        let expires = now_ms() + ttl.as_millis() as u64;
        inner.records.insert(key.to_string(), (expires, value.to_vec()));
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
