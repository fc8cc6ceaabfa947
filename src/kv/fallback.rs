use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use super::{AtomicKv, BalanceOutcome, BucketState, CounterOutcome, KvResult, MemoryKv};

/// Wraps the shared store with an in-process fallback of identical
/// semantics. The first primary failure flips the degraded flag (sticky
/// until restart) and routes subsequent operations to the fallback;
/// single-process correctness is preserved, distributed admission is lost,
/// and readiness reports `degraded`.
pub struct DegradingKv {
    primary: Arc<dyn AtomicKv>,
    fallback: MemoryKv,
    degraded: AtomicBool,
}

impl DegradingKv {
    pub fn new(primary: Arc<dyn AtomicKv>) -> Self {
        Self {
            primary,
            fallback: MemoryKv::new(),
            degraded: AtomicBool::new(false),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    fn degrade(&self, op: &'static str, err: &super::KvError) {
        if !self.degraded.swap(true, Ordering::Relaxed) {
            warn!(op, error = %err, "Shared KV unreachable, falling back to in-process store");
        }
    }
}

macro_rules! route {
    ($self:ident, $op:literal, $call:ident ( $($arg:expr),* )) => {{
        if $self.is_degraded() {
            return $self.fallback.$call($($arg),*).await;
        }
        match $self.primary.$call($($arg),*).await {
            Ok(value) => Ok(value),
            Err(err) => {
                $self.degrade($op, &err);
                $self.fallback.$call($($arg),*).await
            }
        }
    }};
}

#[async_trait]
impl AtomicKv for DegradingKv {
    async fn counter_consume(
        &self,
        key: &str,
        limit: u64,
        ttl: Duration,
    ) -> KvResult<CounterOutcome> {
        route!(self, "counter_consume", counter_consume(key, limit, ttl))
    }

    async fn counter_release(&self, key: &str) -> KvResult<u64> {
        route!(self, "counter_release", counter_release(key))
    }

    async fn balance_take(&self, key: &str, amount: i64) -> KvResult<BalanceOutcome> {
        route!(self, "balance_take", balance_take(key, amount))
    }

    async fn balance_add(&self, key: &str, delta: i64) -> KvResult<i64> {
        route!(self, "balance_add", balance_add(key, delta))
    }

    async fn balance_get(&self, key: &str) -> KvResult<i64> {
        route!(self, "balance_get", balance_get(key))
    }

    async fn bucket_take(&self, key: &str, limit: u32, window: Duration) -> KvResult<BucketState> {
        route!(self, "bucket_take", bucket_take(key, limit, window))
    }

    async fn record_get(&self, key: &str) -> KvResult<Option<Vec<u8>>> {
        route!(self, "record_get", record_get(key))
    }

    async fn record_put(&self, key: &str, value: &[u8], ttl: Duration) -> KvResult<()> {
        route!(self, "record_put", record_put(key, value, ttl))
    }

    fn backend(&self) -> &'static str {
        if self.is_degraded() { "memory-fallback" } else { self.primary.backend() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::KvError;

    /// Always-failing primary for exercising the fallback path
    struct BrokenKv;

    #[async_trait]
    impl AtomicKv for BrokenKv {
        async fn counter_consume(&self, _: &str, _: u64, _: Duration) -> KvResult<CounterOutcome> {
            Err(KvError::Unavailable("connection refused".into()))
        }
        async fn counter_release(&self, _: &str) -> KvResult<u64> {
            Err(KvError::Unavailable("connection refused".into()))
        }
        async fn balance_take(&self, _: &str, _: i64) -> KvResult<BalanceOutcome> {
            Err(KvError::Unavailable("connection refused".into()))
        }
        async fn balance_add(&self, _: &str, _: i64) -> KvResult<i64> {
            Err(KvError::Unavailable("connection refused".into()))
        }
        async fn balance_get(&self, _: &str) -> KvResult<i64> {
            Err(KvError::Unavailable("connection refused".into()))
        }
        async fn bucket_take(&self, _: &str, _: u32, _: Duration) -> KvResult<BucketState> {
            Err(KvError::Unavailable("connection refused".into()))
        }
        async fn record_get(&self, _: &str) -> KvResult<Option<Vec<u8>>> {
            Err(KvError::Unavailable("connection refused".into()))
        }
        async fn record_put(&self, _: &str, _: &[u8], _: Duration) -> KvResult<()> {
            Err(KvError::Unavailable("connection refused".into()))
        }
        fn backend(&self) -> &'static str {
            "broken"
        }
    }

    #[tokio::test]
    async fn healthy_primary_is_used() {
        let kv = DegradingKv::new(Arc::new(MemoryKv::new()));
        kv.balance_add("b", 3).await.unwrap();
        assert!(!kv.is_degraded());
        assert_eq!(kv.backend(), "memory");
    }

    #[tokio::test]
    async fn failure_switches_to_fallback_and_sticks() {
        let kv = DegradingKv::new(Arc::new(BrokenKv));
        let day = Duration::from_secs(86_400);

        let out = kv.counter_consume("c", 2, day).await.unwrap();
        assert!(out.consumed);
        assert!(kv.is_degraded());
        assert_eq!(kv.backend(), "memory-fallback");

        // Fallback state is coherent across subsequent operations
        assert!(kv.counter_consume("c", 2, day).await.unwrap().consumed);
        assert!(!kv.counter_consume("c", 2, day).await.unwrap().consumed);
    }
}
