use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{AtomicKv, BalanceOutcome, BucketState, CounterOutcome, KvResult, now_ms};

#[derive(Debug, Serialize, Deserialize)]
struct CounterRow {
    value: u64,
    expires_at_ms: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct BucketRow {
    remaining: u32,
    reset_at_ms: u64,
}

/// Durable shared-KV implementation on a fjall keyspace
///
/// Partitions: `counters` (bounded daily counters), `balances` (paid
/// credit balances), `buckets` (rate-limit windows), `records`
/// (TTL-prefixed idempotency entries and markers). The `script` mutex
/// serializes each operation the way server-side scripting would on a
/// networked store.
pub struct FjallKv {
    keyspace: Keyspace,
    counters: PartitionHandle,
    balances: PartitionHandle,
    buckets: PartitionHandle,
    records: PartitionHandle,
    script: Mutex<()>,
}

impl FjallKv {
    pub fn open<P: AsRef<Path>>(path: P) -> KvResult<Self> {
        let path = path.as_ref();
        info!("Opening shared KV at: {}", path.display());

        let keyspace = Config::new(path).open()?;
        let counters = keyspace.open_partition("counters", PartitionCreateOptions::default())?;
        let balances = keyspace.open_partition("balances", PartitionCreateOptions::default())?;
        let buckets = keyspace.open_partition("buckets", PartitionCreateOptions::default())?;
        let records = keyspace.open_partition("records", PartitionCreateOptions::default())?;

        Ok(Self {
            keyspace,
            counters,
            balances,
            buckets,
            records,
            script: Mutex::new(()),
        })
    }

    pub fn persist(&self) -> KvResult<()> {
        self.keyspace.persist(fjall::PersistMode::SyncAll)?;
        Ok(())
    }

    pub fn health_check(&self) -> KvResult<()> {
        let _ = self.records.get(b"__health")?;
        Ok(())
    }

    fn read_counter(&self, key: &str, now: u64) -> KvResult<Option<CounterRow>> {
        match self.counters.get(key.as_bytes())? {
            Some(bytes) => {
                let row: CounterRow = serde_json::from_slice(&bytes)?;
                Ok(if row.expires_at_ms <= now { None } else { Some(row) })
            }
            None => Ok(None),
        }
    }

    fn read_balance(&self, key: &str) -> KvResult<i64> {
        match self.balances.get(key.as_bytes())? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(0),
        }
    }

    fn write_balance(&self, key: &str, value: i64) -> KvResult<()> {
        self.balances.insert(key.as_bytes(), serde_json::to_vec(&value)?)?;
        Ok(())
    }
}

#[async_trait]
impl AtomicKv for FjallKv {
    async fn counter_consume(
        &self,
        key: &str,
        limit: u64,
        ttl: Duration,
    ) -> KvResult<CounterOutcome> {
        let _script = self.script.lock().expect("kv script lock");
        let now = now_ms();
        let current = self.read_counter(key, now)?;

        let (value, expires_at_ms) = match current {
            Some(row) => (row.value, row.expires_at_ms),
            None => (0, now + ttl.as_millis() as u64),
        };

        if value >= limit {
            return Ok(CounterOutcome { consumed: false, value });
        }

        let row = CounterRow { value: value + 1, expires_at_ms };
        self.counters.insert(key.as_bytes(), serde_json::to_vec(&row)?)?;
        Ok(CounterOutcome { consumed: true, value: row.value })
    }

    async fn counter_release(&self, key: &str) -> KvResult<u64> {
        let _script = self.script.lock().expect("kv script lock");
        let now = now_ms();
        let Some(row) = self.read_counter(key, now)? else {
            return Ok(0);
        };
        if row.value == 0 {
            return Ok(0);
        }
        let next = CounterRow { value: row.value - 1, expires_at_ms: row.expires_at_ms };
        self.counters.insert(key.as_bytes(), serde_json::to_vec(&next)?)?;
        Ok(next.value)
    }

    async fn balance_take(&self, key: &str, amount: i64) -> KvResult<BalanceOutcome> {
        let _script = self.script.lock().expect("kv script lock");
        let balance = self.read_balance(key)?;
        if balance < amount {
            return Ok(BalanceOutcome { taken: false, balance });
        }
        let next = balance - amount;
        self.write_balance(key, next)?;
        Ok(BalanceOutcome { taken: true, balance: next })
    }

    async fn balance_add(&self, key: &str, delta: i64) -> KvResult<i64> {
        let _script = self.script.lock().expect("kv script lock");
        let next = (self.read_balance(key)? + delta).max(0);
        self.write_balance(key, next)?;
        Ok(next)
    }

    async fn balance_get(&self, key: &str) -> KvResult<i64> {
        self.read_balance(key)
    }

    async fn bucket_take(&self, key: &str, limit: u32, window: Duration) -> KvResult<BucketState> {
        let _script = self.script.lock().expect("kv script lock");
        let now = now_ms();

        let current: Option<BucketRow> = match self.buckets.get(key.as_bytes())? {
            Some(bytes) => Some(serde_json::from_slice(&bytes)?),
            None => None,
        };

        let state = match current {
            Some(row) if row.reset_at_ms > now => {
                if row.remaining == 0 {
                    BucketState { admitted: false, limit, remaining: 0, reset_at_ms: row.reset_at_ms }
                } else {
                    let next = BucketRow { remaining: row.remaining - 1, reset_at_ms: row.reset_at_ms };
                    self.buckets.insert(key.as_bytes(), serde_json::to_vec(&next)?)?;
                    BucketState {
                        admitted: true,
                        limit,
                        remaining: next.remaining,
                        reset_at_ms: next.reset_at_ms,
                    }
                }
            }
            _ => {
                let next = BucketRow {
                    remaining: limit.saturating_sub(1),
                    reset_at_ms: now + window.as_millis() as u64,
                };
                self.buckets.insert(key.as_bytes(), serde_json::to_vec(&next)?)?;
                BucketState {
                    admitted: true,
                    limit,
                    remaining: next.remaining,
                    reset_at_ms: next.reset_at_ms,
                }
            }
        };

        Ok(state)
    }

    async fn record_get(&self, key: &str) -> KvResult<Option<Vec<u8>>> {
        match self.records.get(key.as_bytes())? {
            Some(bytes) if bytes.len() >= 8 => {
                let expires_at_ms =
                    u64::from_be_bytes(bytes[..8].try_into().unwrap_or([0u8; 8]));
                if expires_at_ms <= now_ms() {
                    Ok(None)
                } else {
                    Ok(Some(bytes[8..].to_vec()))
                }
            }
            _ => Ok(None),
        }
    }

    async fn record_put(&self, key: &str, value: &[u8], ttl: Duration) -> KvResult<()> {
        let expires_at_ms = now_ms() + ttl.as_millis() as u64;
        let mut row = Vec::with_capacity(8 + value.len());
        row.extend_from_slice(&expires_at_ms.to_be_bytes());
        row.extend_from_slice(value);
        self.records.insert(key.as_bytes(), row)?;
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "fjall"
    }
}
