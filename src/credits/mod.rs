//! Credit accounting
//!
//! Two pools per user: a free-tier counter keyed by the UTC calendar day
//! (self-resetting via TTL) and a paid balance. Both are mutated only
//! through the shared KV's atomic operations; every mutation appends to the
//! append-only ledger in the document store. Refunds claim a one-shot
//! atomic marker per job before touching any counter, so invoking the
//! refund twice appends at most one compensating entry.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::api::models::{CreditInfo, CreditKind};
use crate::docstore::{DocError, FjallDocStore, LedgerEntry, LedgerKind, UserProfile};
use crate::kv::{AtomicKv, KvError};

const DAY: Duration = Duration::from_secs(24 * 60 * 60);
const REFUND_MARKER_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

#[derive(Debug, Error)]
pub enum CreditError {
    #[error(transparent)]
    Kv(#[from] KvError),

    #[error(transparent)]
    Store(#[from] DocError),
}

pub type Result<T> = std::result::Result<T, CreditError>;

/// Outcome of `check_and_deduct`
#[derive(Debug, Clone)]
pub struct DebitOutcome {
    pub allowed: bool,
    /// What was debited, when allowed
    pub credit: Option<CreditInfo>,
    /// Free slots left today after the operation
    pub remaining_free: u64,
    /// Paid balance after the operation
    pub remaining_paid: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefundOutcome {
    Refunded,
    /// The job's refund marker was already claimed; nothing changed
    AlreadyRefunded,
    /// No outstanding debit exists for the job
    NothingToRefund,
}

pub struct CreditLedger {
    kv: Arc<dyn AtomicKv>,
    docs: Arc<FjallDocStore>,
    free_daily_limit: u32,
    job_cost: i64,
}

impl CreditLedger {
    pub fn new(
        kv: Arc<dyn AtomicKv>,
        docs: Arc<FjallDocStore>,
        free_daily_limit: u32,
        job_cost: i64,
    ) -> Self {
        Self { kv, docs, free_daily_limit, job_cost }
    }

    fn free_key(user_id: &str) -> String {
        format!("credits:free:{user_id}:{}", Utc::now().format("%Y-%m-%d"))
    }

    fn paid_key(user_id: &str) -> String {
        format!("credits:paid:{user_id}")
    }

    fn refund_marker_key(job_id: Uuid) -> String {
        format!("credits:refund-claim:{job_id}")
    }

    /// Free slot first, then paid balance; a denial leaves no trace.
    pub async fn check_and_deduct(&self, user_id: &str, job_id: Uuid) -> Result<DebitOutcome> {
        let free_key = Self::free_key(user_id);
        let free = self
            .kv
            .counter_consume(&free_key, u64::from(self.free_daily_limit), DAY)
            .await?;

        if free.consumed {
            self.docs.append_ledger(LedgerEntry {
                id: 0,
                owner_id: user_id.to_string(),
                job_id,
                amount: -1,
                kind: LedgerKind::Free,
                reason: "free daily slot".to_string(),
                created_at: Utc::now(),
                refund_of: None,
                counter_key: Some(free_key),
            })?;
            debug!(user_id, %job_id, used = free.value, "Free slot debited");
            return Ok(DebitOutcome {
                allowed: true,
                credit: Some(CreditInfo { amount: 1, kind: CreditKind::Free }),
                remaining_free: u64::from(self.free_daily_limit).saturating_sub(free.value),
                remaining_paid: self.kv.balance_get(&Self::paid_key(user_id)).await?,
            });
        }

        let paid_key = Self::paid_key(user_id);
        let paid = self.kv.balance_take(&paid_key, self.job_cost).await?;
        if paid.taken {
            self.docs.append_ledger(LedgerEntry {
                id: 0,
                owner_id: user_id.to_string(),
                job_id,
                amount: -self.job_cost,
                kind: LedgerKind::Paid,
                reason: "paid restoration".to_string(),
                created_at: Utc::now(),
                refund_of: None,
                counter_key: Some(paid_key),
            })?;
            self.mirror_balance(user_id, paid.balance);
            debug!(user_id, %job_id, balance = paid.balance, "Paid credit debited");
            return Ok(DebitOutcome {
                allowed: true,
                credit: Some(CreditInfo { amount: self.job_cost, kind: CreditKind::Paid }),
                remaining_free: 0,
                remaining_paid: paid.balance,
            });
        }

        Ok(DebitOutcome {
            allowed: false,
            credit: None,
            remaining_free: 0,
            remaining_paid: paid.balance,
        })
    }

    /// Compensate the most recent debit for a job. The atomic marker makes
    /// repeats no-ops; the ledger keeps every attempt observable.
    pub async fn refund(
        &self,
        user_id: &str,
        job_id: Uuid,
        reason: &str,
    ) -> Result<RefundOutcome> {
        let marker = self
            .kv
            .counter_consume(&Self::refund_marker_key(job_id), 1, REFUND_MARKER_TTL)
            .await?;
        if !marker.consumed {
            debug!(%job_id, "Refund already claimed");
            return Ok(RefundOutcome::AlreadyRefunded);
        }

        let Some(debit) = self.docs.latest_debit_for_job(job_id)? else {
            return Ok(RefundOutcome::NothingToRefund);
        };

        let amount = debit.amount.unsigned_abs() as i64;
        match debit.kind {
            LedgerKind::Free => {
                if let Some(counter_key) = &debit.counter_key {
                    self.kv.counter_release(counter_key).await?;
                }
            }
            LedgerKind::Paid => {
                let balance = self.kv.balance_add(&Self::paid_key(user_id), amount).await?;
                self.mirror_balance(user_id, balance);
            }
            LedgerKind::Refund | LedgerKind::Purchase => {
                // is_debit() filtering makes this unreachable
            }
        }

        self.docs.append_ledger(LedgerEntry {
            id: 0,
            owner_id: user_id.to_string(),
            job_id,
            amount,
            kind: LedgerKind::Refund,
            reason: reason.to_string(),
            created_at: Utc::now(),
            refund_of: Some(debit.id),
            counter_key: debit.counter_key.clone(),
        })?;
        debug!(user_id, %job_id, amount, "Credits refunded");
        Ok(RefundOutcome::Refunded)
    }

    /// Balance increment from an out-of-core purchase event.
    pub async fn purchase(&self, user_id: &str, amount: i64, reason: &str) -> Result<i64> {
        let balance = self.kv.balance_add(&Self::paid_key(user_id), amount).await?;
        self.docs.append_ledger(LedgerEntry {
            id: 0,
            owner_id: user_id.to_string(),
            job_id: Uuid::nil(),
            amount,
            kind: LedgerKind::Purchase,
            reason: reason.to_string(),
            created_at: Utc::now(),
            refund_of: None,
            counter_key: Some(Self::paid_key(user_id)),
        })?;
        self.mirror_balance(user_id, balance);
        Ok(balance)
    }

    pub async fn paid_balance(&self, user_id: &str) -> Result<i64> {
        Ok(self.kv.balance_get(&Self::paid_key(user_id)).await?)
    }

    /// Best-effort mirror of the KV balance onto the durable profile; the
    /// KV stays authoritative and a failed mirror only logs.
    fn mirror_balance(&self, user_id: &str, balance: i64) {
        let docs = Arc::clone(&self.docs);
        let user_id = user_id.to_string();
        tokio::spawn(async move {
            let profile = UserProfile { user_id: user_id.clone(), paid_balance: balance, updated_at: Utc::now() };
            if let Err(e) = docs.put_profile(&profile) {
                warn!(user_id, error = %e, "Balance mirror failed");
            }
        });
    }
}
