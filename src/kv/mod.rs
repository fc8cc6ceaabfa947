//! Shared key-value store with atomic scripted operations
//!
//! Free-tier counters, paid balances, rate-limit buckets, and idempotency
//! records all live here and are mutated only through the operations on
//! [`AtomicKv`]. No caller ever does read-then-write across this seam.
//!
//! Two implementations: [`FjallKv`] (durable, the default single-node
//! deployment) and [`MemoryKv`]. [`DegradingKv`] wraps both and switches to
//! the in-memory store when the primary errors, preserving single-process
//! semantics while the readiness probe reports the degradation.

mod fallback;
mod memory;
mod store;

pub use fallback::DegradingKv;
pub use memory::MemoryKv;
pub use store::FjallKv;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("kv store error: {0}")]
    Store(#[from] fjall::Error),

    #[error("kv serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("kv backend unavailable: {0}")]
    Unavailable(String),
}

pub type KvResult<T> = std::result::Result<T, KvError>;

/// Result of a compare-and-increment on a bounded counter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterOutcome {
    /// Whether a slot was consumed (counter was below the limit)
    pub consumed: bool,
    /// Counter value after the operation
    pub value: u64,
}

/// Result of a compare-and-decrement on a balance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceOutcome {
    /// Whether the debit happened (balance covered the amount)
    pub taken: bool,
    /// Balance after the operation (unchanged when not taken)
    pub balance: i64,
}

/// Result of a token-bucket admission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketState {
    pub admitted: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Window reset instant, unix milliseconds
    pub reset_at_ms: u64,
}

impl BucketState {
    /// Whole seconds until the window resets, rounded up, never zero while
    /// the window is open.
    pub fn reset_secs(&self, now_ms: u64) -> u64 {
        self.reset_at_ms.saturating_sub(now_ms).div_ceil(1000).max(1)
    }
}

/// Atomic operations against the shared store. Every method is a single
/// script: observe-and-mutate happens under the store's own serialization,
/// never in the caller.
#[async_trait]
pub trait AtomicKv: Send + Sync {
    /// Consume one slot of a bounded counter if below `limit`. A missing or
    /// expired counter starts at zero with the given ttl.
    async fn counter_consume(
        &self,
        key: &str,
        limit: u64,
        ttl: Duration,
    ) -> KvResult<CounterOutcome>;

    /// Decrement a counter, never below zero. Returns the new value.
    async fn counter_release(&self, key: &str) -> KvResult<u64>;

    /// Debit `amount` if the balance covers it.
    async fn balance_take(&self, key: &str, amount: i64) -> KvResult<BalanceOutcome>;

    /// Adjust a balance by `delta` (floored at zero). Returns the new value.
    async fn balance_add(&self, key: &str, delta: i64) -> KvResult<i64>;

    async fn balance_get(&self, key: &str) -> KvResult<i64>;

    /// Fixed-window token bucket: recreate when missing or expired, deny at
    /// zero remaining, decrement otherwise.
    async fn bucket_take(&self, key: &str, limit: u32, window: Duration) -> KvResult<BucketState>;

    /// TTL-bound record read; expired entries read as absent.
    async fn record_get(&self, key: &str) -> KvResult<Option<Vec<u8>>>;

    async fn record_put(&self, key: &str, value: &[u8], ttl: Duration) -> KvResult<()>;

    /// Backend label for the readiness probe
    fn backend(&self) -> &'static str;
}

pub(crate) fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_secs_rounds_up_and_floors_at_one() {
        let state = BucketState {
            admitted: true,
            limit: 10,
            remaining: 9,
            reset_at_ms: 10_500,
        };
        assert_eq!(state.reset_secs(10_000), 1);
        assert_eq!(state.reset_secs(8_000), 3);
        assert_eq!(state.reset_secs(10_500), 1);
    }
}
