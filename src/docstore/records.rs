//! Documents stored alongside the job records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::moderation::ModerationVerdict;
use crate::queue::RestoreTask;

/// Append-only credit ledger entry. Debits are negative, refunds and
/// purchases positive; refunds reference the debit they compensate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Store-assigned sequence, unique per process lifetime
    pub id: u64,
    pub owner_id: String,
    pub job_id: Uuid,
    pub amount: i64,
    pub kind: LedgerKind,
    pub reason: String,
    pub created_at: DateTime<Utc>,
    /// For refunds: the id of the debit being compensated
    #[serde(default)]
    pub refund_of: Option<u64>,
    /// KV key the debit touched, so a refund restores the same counter
    #[serde(default)]
    pub counter_key: Option<String>,
}

impl LedgerEntry {
    pub fn is_debit(&self) -> bool {
        self.amount < 0 && matches!(self.kind, LedgerKind::Free | LedgerKind::Paid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerKind {
    Free,
    Paid,
    Refund,
    Purchase,
}

/// Durable mirror of a user's credit state. The KV balances are
/// authoritative; this document trails them for audit and support.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: String,
    pub paid_balance: i64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    pub kind: String,
    pub message: String,
}

/// Archived task whose attempt budget is exhausted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// Predictable id (`dl-{job_id}`) so repeat archiving is idempotent
    pub id: String,
    pub job_id: Uuid,
    pub owner_id: String,
    pub task: RestoreTask,
    pub failure: FailureRecord,
    pub attempts_made: u32,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn id_for(job_id: Uuid) -> String {
        format!("dl-{job_id}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayAudit {
    pub id: u64,
    pub dead_letter_id: String,
    pub job_id: Uuid,
    pub operator: String,
    pub reason: String,
    pub replayed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModerationAudit {
    pub id: u64,
    pub owner_id: String,
    pub request_id: String,
    pub verdict: ModerationVerdict,
    /// True when the verdict came from the fail-closed path, not the service
    pub fail_closed: bool,
    pub created_at: DateTime<Utc>,
}
