use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle};
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

use crate::api::models::{JobRecord, JobStatus};

use super::error::{DocError, Result};
use super::partitions::{
    job_key, ledger_job_key, ledger_job_prefix, ledger_key, ledger_user_prefix, meta_key,
    moderation_audit_key, profile_key, replay_audit_key,
};
use super::records::{
    DeadLetterEntry, LedgerEntry, LedgerKind, ModerationAudit, ReplayAudit, UserProfile,
};

const LEDGER_SEQ: &str = "ledger_seq";
const AUDIT_SEQ: &str = "audit_seq";
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Fjall-backed document store: job records, user profiles, the credit
/// ledger, audits, and the dead-letter archive
///
/// Job writes go through [`FjallDocStore::transition`], which merges fields
/// under a lock and refuses to touch terminal records. Every applied write
/// is broadcast to SSE subscribers.
pub struct FjallDocStore {
    keyspace: Keyspace,
    jobs: PartitionHandle,
    profiles: PartitionHandle,
    ledger: PartitionHandle,
    ledger_by_job: PartitionHandle,
    deadletters: PartitionHandle,
    audits: PartitionHandle,
    metadata: PartitionHandle,
    ledger_seq: AtomicU64,
    audit_seq: AtomicU64,
    events: broadcast::Sender<JobRecord>,
    job_write: Mutex<()>,
}

impl FjallDocStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening document store at: {}", path.display());
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let keyspace = Config::new(path).open()?;
        let jobs = keyspace.open_partition("jobs", PartitionCreateOptions::default())?;
        let profiles = keyspace.open_partition("profiles", PartitionCreateOptions::default())?;
        let ledger = keyspace.open_partition("ledger", PartitionCreateOptions::default())?;
        let ledger_by_job =
            keyspace.open_partition("ledger_by_job", PartitionCreateOptions::default())?;
        let deadletters =
            keyspace.open_partition("deadletters", PartitionCreateOptions::default())?;
        let audits = keyspace.open_partition("audits", PartitionCreateOptions::default())?;
        let metadata = keyspace.open_partition("metadata", PartitionCreateOptions::default())?;

        let load_seq = |name: &str| -> Result<u64> {
            Ok(metadata
                .get(meta_key(name))?
                .and_then(|bytes| String::from_utf8(bytes.to_vec()).ok())
                .and_then(|s| s.parse().ok())
                .unwrap_or(0))
        };
        let ledger_seq = AtomicU64::new(load_seq(LEDGER_SEQ)?);
        let audit_seq = AtomicU64::new(load_seq(AUDIT_SEQ)?);

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            keyspace,
            jobs,
            profiles,
            ledger,
            ledger_by_job,
            deadletters,
            audits,
            metadata,
            ledger_seq,
            audit_seq,
            events,
            job_write: Mutex::new(()),
        })
    }

    /// Record-change stream consumed by the SSE surface
    pub fn subscribe(&self) -> broadcast::Receiver<JobRecord> {
        self.events.subscribe()
    }

    // --- jobs ---

    pub fn insert_job(&self, record: &JobRecord) -> Result<()> {
        let _guard = self.job_write.lock().expect("job write lock");
        self.jobs.insert(job_key(record.job_id), serde_json::to_vec(record)?)?;
        debug!(job_id = %record.job_id, "Job record created");
        let _ = self.events.send(record.clone());
        Ok(())
    }

    pub fn get_job(&self, job_id: Uuid) -> Result<Option<JobRecord>> {
        match self.jobs.get(job_key(job_id))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Merge-write a job record. The closure sees the current record and
    /// mutates the fields it owns; `updated_at` is stamped here. Terminal
    /// records are left untouched and `None` is returned, which is how
    /// duplicate deliveries become harmless.
    pub fn transition<F>(&self, job_id: Uuid, apply: F) -> Result<Option<JobRecord>>
    where
        F: FnOnce(&mut JobRecord),
    {
        let _guard = self.job_write.lock().expect("job write lock");
        let Some(bytes) = self.jobs.get(job_key(job_id))? else {
            return Err(DocError::JobNotFound(job_id));
        };
        let mut record: JobRecord = serde_json::from_slice(&bytes)?;
        if record.is_terminal() {
            return Ok(None);
        }
        apply(&mut record);
        record.updated_at = Utc::now();
        self.jobs.insert(job_key(job_id), serde_json::to_vec(&record)?)?;
        let _ = self.events.send(record.clone());
        Ok(Some(record))
    }

    /// Operator-only escape hatch for replay: a failed record returns to
    /// queued with its error cleared. Succeeded records are refused.
    pub fn reset_for_replay(&self, job_id: Uuid) -> Result<Option<JobRecord>> {
        let _guard = self.job_write.lock().expect("job write lock");
        let Some(bytes) = self.jobs.get(job_key(job_id))? else {
            return Err(DocError::JobNotFound(job_id));
        };
        let mut record: JobRecord = serde_json::from_slice(&bytes)?;
        if record.status != JobStatus::Failed {
            return Ok(None);
        }
        record.status = JobStatus::Queued;
        record.error = None;
        record.updated_at = Utc::now();
        self.jobs.insert(job_key(job_id), serde_json::to_vec(&record)?)?;
        let _ = self.events.send(record.clone());
        Ok(Some(record))
    }

    // --- profiles ---

    pub fn put_profile(&self, profile: &UserProfile) -> Result<()> {
        self.profiles.insert(profile_key(&profile.user_id), serde_json::to_vec(profile)?)?;
        Ok(())
    }

    pub fn get_profile(&self, user_id: &str) -> Result<Option<UserProfile>> {
        match self.profiles.get(profile_key(user_id))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    // --- credit ledger ---

    /// Append a ledger entry, assigning its sequence. Entries are written to
    /// both the per-user ordering and the per-job index.
    pub fn append_ledger(&self, mut entry: LedgerEntry) -> Result<LedgerEntry> {
        let seq = self.ledger_seq.fetch_add(1, Ordering::SeqCst) + 1;
        entry.id = seq;
        let value = serde_json::to_vec(&entry)?;
        self.ledger.insert(ledger_key(&entry.owner_id, seq), value.clone())?;
        self.ledger_by_job.insert(ledger_job_key(entry.job_id, seq), value)?;
        self.metadata.insert(meta_key(LEDGER_SEQ), seq.to_string().as_bytes())?;
        debug!(owner = %entry.owner_id, job_id = %entry.job_id, amount = entry.amount, "Ledger entry appended");
        Ok(entry)
    }

    pub fn ledger_for_job(&self, job_id: Uuid) -> Result<Vec<LedgerEntry>> {
        let mut entries = Vec::new();
        for item in self.ledger_by_job.prefix(ledger_job_prefix(job_id)) {
            let (_, value) = item?;
            entries.push(serde_json::from_slice(&value)?);
        }
        Ok(entries)
    }

    pub fn ledger_for_user(&self, user_id: &str) -> Result<Vec<LedgerEntry>> {
        let mut entries = Vec::new();
        for item in self.ledger.prefix(ledger_user_prefix(user_id)) {
            let (_, value) = item?;
            entries.push(serde_json::from_slice(&value)?);
        }
        Ok(entries)
    }

    /// Most recent debit for the job, for the refund path
    pub fn latest_debit_for_job(&self, job_id: Uuid) -> Result<Option<LedgerEntry>> {
        let entries = self.ledger_for_job(job_id)?;
        Ok(entries.into_iter().filter(LedgerEntry::is_debit).next_back())
    }

    pub fn has_refund_for_job(&self, job_id: Uuid) -> Result<bool> {
        let entries = self.ledger_for_job(job_id)?;
        Ok(entries.iter().any(|e| e.kind == LedgerKind::Refund))
    }

    // --- dead letters ---

    pub fn put_dead_letter(&self, entry: &DeadLetterEntry) -> Result<()> {
        self.deadletters.insert(entry.id.as_bytes(), serde_json::to_vec(entry)?)?;
        info!(dead_letter_id = %entry.id, attempts = entry.attempts_made, "Dead-letter entry archived");
        Ok(())
    }

    pub fn get_dead_letter(&self, id: &str) -> Result<Option<DeadLetterEntry>> {
        match self.deadletters.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn remove_dead_letter(&self, id: &str) -> Result<()> {
        self.deadletters.remove(id.as_bytes())?;
        Ok(())
    }

    pub fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>> {
        let mut entries = Vec::new();
        for item in self.deadletters.iter().take(limit) {
            let (_, value) = item?;
            entries.push(serde_json::from_slice(&value)?);
        }
        Ok(entries)
    }

    pub fn dead_letter_count(&self) -> Result<usize> {
        let mut count = 0;
        for item in self.deadletters.iter() {
            item?;
            count += 1;
        }
        Ok(count)
    }

    // --- audits ---

    pub fn append_moderation_audit(&self, mut audit: ModerationAudit) -> Result<()> {
        audit.id = self.next_audit_seq()?;
        self.audits.insert(moderation_audit_key(audit.id), serde_json::to_vec(&audit)?)?;
        Ok(())
    }

    pub fn append_replay_audit(&self, mut audit: ReplayAudit) -> Result<()> {
        audit.id = self.next_audit_seq()?;
        self.audits.insert(replay_audit_key(audit.id), serde_json::to_vec(&audit)?)?;
        Ok(())
    }

    fn next_audit_seq(&self) -> Result<u64> {
        let seq = self.audit_seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.metadata.insert(meta_key(AUDIT_SEQ), seq.to_string().as_bytes())?;
        Ok(seq)
    }

    // --- maintenance ---

    pub fn persist(&self) -> Result<()> {
        self.keyspace.persist(fjall::PersistMode::SyncAll)?;
        Ok(())
    }

    pub fn health_check(&self) -> Result<()> {
        let _ = self.metadata.get(meta_key(LEDGER_SEQ))?;
        Ok(())
    }

    pub fn stats(&self) -> Result<DocStats> {
        let count = |partition: &PartitionHandle| -> Result<usize> {
            let mut n = 0;
            for item in partition.iter() {
                item?;
                n += 1;
            }
            Ok(n)
        };
        Ok(DocStats {
            jobs: count(&self.jobs)?,
            ledger_entries: count(&self.ledger)?,
            dead_letters: count(&self.deadletters)?,
        })
    }

    /// Retention pass: terminal jobs and dead letters past their windows
    /// are dropped. Cursors in `metadata` record the last run.
    pub fn prune_expired(&self, jobs_ttl_days: u32, dead_letter_ttl_days: u32) -> Result<PruneStats> {
        let now = Utc::now();
        let mut stats = PruneStats::default();

        let job_cutoff = now - chrono::Duration::days(i64::from(jobs_ttl_days));
        let mut expired_jobs = Vec::new();
        for item in self.jobs.iter() {
            let (key, value) = item?;
            let record: JobRecord = serde_json::from_slice(&value)?;
            if record.is_terminal() && record.updated_at < job_cutoff {
                expired_jobs.push(key);
            }
        }
        for key in expired_jobs {
            self.jobs.remove(key)?;
            stats.jobs_pruned += 1;
        }

        let dl_cutoff = now - chrono::Duration::days(i64::from(dead_letter_ttl_days));
        let mut expired_dls = Vec::new();
        for item in self.deadletters.iter() {
            let (key, value) = item?;
            let entry: DeadLetterEntry = serde_json::from_slice(&value)?;
            if entry.failed_at < dl_cutoff {
                expired_dls.push(key);
            }
        }
        for key in expired_dls {
            self.deadletters.remove(key)?;
            stats.dead_letters_pruned += 1;
        }

        self.metadata.insert(meta_key("last_prune"), now.to_rfc3339().as_bytes())?;
        if stats.jobs_pruned > 0 || stats.dead_letters_pruned > 0 {
            info!(?stats, "Document store pruned");
        }
        Ok(stats)
    }
}

impl std::fmt::Debug for FjallDocStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FjallDocStore").finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DocStats {
    pub jobs: usize,
    pub ledger_entries: usize,
    pub dead_letters: usize,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PruneStats {
    pub jobs_pruned: usize,
    pub dead_letters_pruned: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::models::{CreditInfo, CreditKind, JobErrorInfo, PreprocessSummary};
    use crate::moderation::ModerationVerdict;
    use tempfile::TempDir;

    fn open_store() -> (FjallDocStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = FjallDocStore::open(temp_dir.path().join("docs")).unwrap();
        (store, temp_dir)
    }

    fn sample_job(status: JobStatus) -> JobRecord {
        let now = Utc::now();
        JobRecord::builder()
            .job_id(Uuid::now_v7())
            .owner_id("dev-user-a".to_string())
            .status(status)
            .created_at(now)
            .updated_at(now)
            .credit(CreditInfo { amount: 1, kind: CreditKind::Free })
            .source_object("uploads/dev-user-a/src.jpg".to_string())
            .preprocessing(PreprocessSummary {
                source_format: "jpeg".into(),
                width: 100,
                height: 100,
                operations: vec![],
                color_profile: "srgb".into(),
            })
            .moderation(ModerationVerdict::allow())
            .build()
    }

    fn debit(owner: &str, job_id: Uuid, kind: LedgerKind, amount: i64) -> LedgerEntry {
        LedgerEntry {
            id: 0,
            owner_id: owner.to_string(),
            job_id,
            amount,
            kind,
            reason: "test".into(),
            created_at: Utc::now(),
            refund_of: None,
            counter_key: Some("k".into()),
        }
    }

    #[test]
    fn job_round_trip_and_transition() {
        let (store, _tmp) = open_store();
        let job = sample_job(JobStatus::Queued);
        store.insert_job(&job).unwrap();

        let updated = store
            .transition(job.job_id, |r| {
                r.status = JobStatus::Running;
                r.attempts_made = 1;
            })
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, JobStatus::Running);
        assert_eq!(updated.attempts_made, 1);
        assert!(updated.updated_at >= job.updated_at);
    }

    #[test]
    fn terminal_records_are_immutable() {
        let (store, _tmp) = open_store();
        let mut job = sample_job(JobStatus::Queued);
        job.status = JobStatus::Succeeded;
        job.result_object = Some("results/dev-user-a/x.jpg".into());
        store.insert_job(&job).unwrap();

        let result = store.transition(job.job_id, |r| r.status = JobStatus::Running).unwrap();
        assert!(result.is_none());

        let stored = store.get_job(job.job_id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Succeeded);
    }

    #[test]
    fn transition_on_missing_job_errors() {
        let (store, _tmp) = open_store();
        let result = store.transition(Uuid::now_v7(), |_| {});
        assert!(matches!(result, Err(DocError::JobNotFound(_))));
    }

    #[test]
    fn transitions_are_broadcast() {
        let (store, _tmp) = open_store();
        let mut rx = store.subscribe();
        let job = sample_job(JobStatus::Queued);
        store.insert_job(&job).unwrap();
        store.transition(job.job_id, |r| r.status = JobStatus::Running).unwrap();

        assert_eq!(rx.try_recv().unwrap().status, JobStatus::Queued);
        assert_eq!(rx.try_recv().unwrap().status, JobStatus::Running);
    }

    #[test]
    fn ledger_tracks_debits_and_refunds_per_job() {
        let (store, _tmp) = open_store();
        let job_id = Uuid::now_v7();

        let d = store.append_ledger(debit("dev-user-a", job_id, LedgerKind::Paid, -1)).unwrap();
        assert!(d.id > 0);
        assert!(!store.has_refund_for_job(job_id).unwrap());
        assert_eq!(store.latest_debit_for_job(job_id).unwrap().unwrap().id, d.id);

        let mut refund = debit("dev-user-a", job_id, LedgerKind::Refund, 1);
        refund.refund_of = Some(d.id);
        store.append_ledger(refund).unwrap();
        assert!(store.has_refund_for_job(job_id).unwrap());

        let user_entries = store.ledger_for_user("dev-user-a").unwrap();
        assert_eq!(user_entries.len(), 2);
        assert!(user_entries[0].id < user_entries[1].id);
    }

    #[test]
    fn latest_debit_picks_newest() {
        let (store, _tmp) = open_store();
        let job_id = Uuid::now_v7();
        store.append_ledger(debit("u", job_id, LedgerKind::Free, -1)).unwrap();
        let second = store.append_ledger(debit("u", job_id, LedgerKind::Paid, -1)).unwrap();
        assert_eq!(store.latest_debit_for_job(job_id).unwrap().unwrap().id, second.id);
    }

    #[test]
    fn reset_for_replay_only_from_failed() {
        let (store, _tmp) = open_store();
        let mut failed = sample_job(JobStatus::Queued);
        failed.status = JobStatus::Failed;
        failed.error = Some(JobErrorInfo { kind: "provider".into(), message: "boom".into() });
        store.insert_job(&failed).unwrap();

        let reset = store.reset_for_replay(failed.job_id).unwrap().unwrap();
        assert_eq!(reset.status, JobStatus::Queued);
        assert!(reset.error.is_none());

        let mut succeeded = sample_job(JobStatus::Queued);
        succeeded.status = JobStatus::Succeeded;
        store.insert_job(&succeeded).unwrap();
        assert!(store.reset_for_replay(succeeded.job_id).unwrap().is_none());
    }

    #[test]
    fn ledger_seq_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("docs");
        let job_id = Uuid::now_v7();
        {
            let store = FjallDocStore::open(&path).unwrap();
            store.append_ledger(debit("u", job_id, LedgerKind::Free, -1)).unwrap();
            store.persist().unwrap();
        }
        let store = FjallDocStore::open(&path).unwrap();
        let next = store.append_ledger(debit("u", job_id, LedgerKind::Paid, -1)).unwrap();
        assert_eq!(next.id, 2);
    }
}
