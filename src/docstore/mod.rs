//! Durable document store
//!
//! Fjall-backed collections for everything that outlives a request: job
//! records, user profiles, the append-only credit ledger (with a per-job
//! index for refunds), moderation and replay audits, and the dead-letter
//! archive. Job writes are guarded merges (terminal records never change)
//! and every applied write is broadcast for the SSE surface.

mod error;
mod partitions;
mod records;
mod store;

pub use error::{DocError, Result};
pub use records::{
    DeadLetterEntry, FailureRecord, LedgerEntry, LedgerKind, ModerationAudit, ReplayAudit,
    UserProfile,
};
pub use store::{DocStats, FjallDocStore, PruneStats};
