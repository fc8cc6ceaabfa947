//! Dead-letter archive and operator replay
//!
//! One subscriber consumes the queue engine's terminal-failure channel, so
//! exhaustion is processed exactly once: build the archive entry, mark the
//! job failed, refund the debit, persist the entry under its predictable
//! id. The replay tool re-enqueues archived tasks with an audit trail and
//! never re-debits.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;

use crate::api::models::{JobErrorInfo, JobStatus};
use crate::credits::CreditLedger;
use crate::docstore::{DeadLetterEntry, DocError, FailureRecord, FjallDocStore, ReplayAudit};
use crate::observability::Metrics;
use crate::queue::{QueueEngine, QueueError, ReplayMarker, TerminalFailure};

const MAX_MESSAGE_LEN: usize = 500;

fn truncated(message: &str) -> String {
    if message.len() <= MAX_MESSAGE_LEN {
        return message.to_string();
    }
    let mut end = MAX_MESSAGE_LEN;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &message[..end])
}

/// The single terminal-failure subscriber
pub struct DeadLetterWriter {
    docs: Arc<FjallDocStore>,
    credits: Arc<CreditLedger>,
    metrics: Arc<Metrics>,
}

impl DeadLetterWriter {
    pub fn new(docs: Arc<FjallDocStore>, credits: Arc<CreditLedger>, metrics: Arc<Metrics>) -> Self {
        Self { docs, credits, metrics }
    }

    pub fn spawn(self, mut failures: UnboundedReceiver<TerminalFailure>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(failure) = failures.recv().await {
                self.handle(failure).await;
            }
        })
    }

    async fn handle(&self, terminal: TerminalFailure) {
        let job_id = terminal.task.job_id;
        let owner_id = terminal.task.owner_id.clone();
        let message = truncated(&terminal.failure.message);

        let entry = DeadLetterEntry {
            id: DeadLetterEntry::id_for(job_id),
            job_id,
            owner_id: owner_id.clone(),
            task: terminal.task,
            failure: FailureRecord { kind: terminal.failure.kind.clone(), message: message.clone() },
            attempts_made: terminal.attempts_made,
            failed_at: Utc::now(),
        };

        let transition = self.docs.transition(job_id, |record| {
            record.status = JobStatus::Failed;
            record.attempts_made = terminal.attempts_made;
            record.error = Some(JobErrorInfo { kind: terminal.failure.kind.clone(), message: message.clone() });
        });
        match transition {
            Ok(Some(_)) => {}
            Ok(None) => info!(%job_id, "Job already terminal at dead-letter time"),
            Err(e) => error!(%job_id, error = %e, "Failed to mark job failed"),
        }

        if let Err(e) = self.credits.refund(&owner_id, job_id, "attempts exhausted").await {
            error!(%job_id, error = %e, "Terminal refund failed");
        }

        if let Err(e) = self.docs.put_dead_letter(&entry) {
            error!(%job_id, error = %e, "Dead-letter archive write failed");
        }

        self.metrics.job_failed();
    }
}

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("dead-letter entry not found for job {0}")]
    NotFound(Uuid),

    #[error("job {0} already succeeded; refusing replay")]
    AlreadySucceeded(Uuid),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Store(#[from] DocError),
}

#[derive(Debug, Clone)]
pub struct ReplayReport {
    pub job_id: Uuid,
    pub dead_letter_id: String,
    /// A refund already exists; the replayed run rides the original debit
    /// and nothing is re-debited either way.
    pub refund_exists: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReplaySummary {
    pub replayed: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone)]
pub struct DeadLetterStats {
    pub total: usize,
    pub oldest_failed_at: Option<chrono::DateTime<Utc>>,
}

/// Operator tooling over the archive
pub struct ReplayTool {
    docs: Arc<FjallDocStore>,
    engine: Arc<QueueEngine>,
    metrics: Arc<Metrics>,
}

impl ReplayTool {
    pub fn new(docs: Arc<FjallDocStore>, engine: Arc<QueueEngine>, metrics: Arc<Metrics>) -> Self {
        Self { docs, engine, metrics }
    }

    pub fn list(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, ReplayError> {
        Ok(self.docs.list_dead_letters(limit)?)
    }

    pub fn stats(&self) -> Result<DeadLetterStats, ReplayError> {
        let entries = self.docs.list_dead_letters(usize::MAX)?;
        Ok(DeadLetterStats {
            total: entries.len(),
            oldest_failed_at: entries.iter().map(|e| e.failed_at).min(),
        })
    }

    /// Re-enqueue one archived task. The entry is removed only after the
    /// replacement task is durably enqueued.
    pub async fn replay(
        &self,
        job_id: Uuid,
        operator: &str,
        reason: &str,
        attempts_override: Option<u32>,
    ) -> Result<ReplayReport, ReplayError> {
        let dead_letter_id = DeadLetterEntry::id_for(job_id);
        let entry = self
            .docs
            .get_dead_letter(&dead_letter_id)?
            .ok_or(ReplayError::NotFound(job_id))?;

        if let Some(job) = self.docs.get_job(job_id)? {
            if job.status == JobStatus::Succeeded {
                return Err(ReplayError::AlreadySucceeded(job_id));
            }
        }
        let refund_exists = self.docs.has_refund_for_job(job_id)?;

        match self.docs.reset_for_replay(job_id) {
            Ok(_) => {}
            // A replayable task without a record is still replayable
            Err(DocError::JobNotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let mut task = entry.task.clone();
        task.replay = Some(ReplayMarker {
            original_job_id: job_id,
            dead_letter_id: dead_letter_id.clone(),
            previous_attempts: entry.attempts_made,
            reason: reason.to_string(),
        });
        self.engine.enqueue(task, attempts_override).await?;

        self.docs.remove_dead_letter(&dead_letter_id)?;
        self.docs.append_replay_audit(ReplayAudit {
            id: 0,
            dead_letter_id: dead_letter_id.clone(),
            job_id,
            operator: operator.to_string(),
            reason: reason.to_string(),
            replayed_at: Utc::now(),
        })?;
        self.metrics.job_replayed();
        info!(%job_id, operator, "Dead-letter entry replayed");

        Ok(ReplayReport { job_id, dead_letter_id, refund_exists })
    }

    pub async fn replay_all(&self, operator: &str, reason: &str) -> Result<ReplaySummary, ReplayError> {
        self.replay_where(operator, reason, |_| true).await
    }

    pub async fn replay_user(
        &self,
        user_id: &str,
        operator: &str,
        reason: &str,
    ) -> Result<ReplaySummary, ReplayError> {
        self.replay_where(operator, reason, |entry| entry.owner_id == user_id).await
    }

    async fn replay_where(
        &self,
        operator: &str,
        reason: &str,
        select: impl Fn(&DeadLetterEntry) -> bool,
    ) -> Result<ReplaySummary, ReplayError> {
        let mut summary = ReplaySummary::default();
        for entry in self.docs.list_dead_letters(usize::MAX)? {
            if !select(&entry) {
                continue;
            }
            match self.replay(entry.job_id, operator, reason, None).await {
                Ok(_) => summary.replayed += 1,
                Err(ReplayError::AlreadySucceeded(_)) | Err(ReplayError::NotFound(_)) => {
                    summary.skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(summary)
    }

    /// Drop entries past the retention window.
    pub fn cleanup(&self, ttl_days: u32) -> Result<usize, ReplayError> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(ttl_days));
        let mut removed = 0;
        for entry in self.docs.list_dead_letters(usize::MAX)? {
            if entry.failed_at < cutoff {
                self.docs.remove_dead_letter(&entry.id)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::models::{CreditInfo, CreditKind, JobRecord, PreprocessSummary};
    use crate::kv::{AtomicKv, MemoryKv};
    use crate::moderation::ModerationVerdict;
    use crate::observability::Metrics;
    use crate::queue::{EngineConfig, FjallQueue, RestoreTask};
    use crate::retry::RetryPolicy;
    use crate::trace::TraceContext;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::RwLock;
    use tokio::time::timeout;

    struct Fixture {
        docs: Arc<FjallDocStore>,
        credits: Arc<CreditLedger>,
        engine: Arc<QueueEngine>,
        _tmp: TempDir,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let docs = Arc::new(FjallDocStore::open(tmp.path().join("docs")).unwrap());
        let kv: Arc<dyn AtomicKv> = Arc::new(MemoryKv::new());
        let credits = Arc::new(CreditLedger::new(kv, Arc::clone(&docs), 3, 1));
        let queue = Arc::new(RwLock::new(FjallQueue::open(tmp.path().join("queue")).unwrap()));
        let config = EngineConfig {
            max_attempts: 5,
            backoff: RetryPolicy::new(5, 1, 0.0),
            lease_ms: 10_000,
            remove_on_complete: 100,
            remove_on_fail: 500,
        };
        let (engine, _failure_rx) = QueueEngine::new(queue, config, Arc::new(Metrics::new()));
        Fixture { docs, credits, engine, _tmp: tmp }
    }

    fn sample_task(owner: &str) -> RestoreTask {
        RestoreTask {
            job_id: Uuid::now_v7(),
            owner_id: owner.to_string(),
            prompt: None,
            source_object: format!("uploads/{owner}/src.jpg"),
            source_format: "jpeg".into(),
            moderation_flags: vec![],
            credit: CreditInfo { amount: 1, kind: CreditKind::Free },
            trace: TraceContext::default(),
            replay: None,
        }
    }

    fn job_for(task: &RestoreTask, status: JobStatus) -> JobRecord {
        let now = Utc::now();
        JobRecord::builder()
            .job_id(task.job_id)
            .owner_id(task.owner_id.clone())
            .status(status)
            .created_at(now)
            .updated_at(now)
            .credit(task.credit)
            .source_object(task.source_object.clone())
            .preprocessing(PreprocessSummary {
                source_format: "jpeg".into(),
                width: 64,
                height: 64,
                operations: vec![],
                color_profile: "srgb".into(),
            })
            .moderation(ModerationVerdict::allow())
            .build()
    }

    #[tokio::test]
    async fn terminal_failure_archives_fails_and_refunds() {
        let f = fixture();
        let task = sample_task("dev-user-a");
        let job_id = task.job_id;
        f.docs.insert_job(&job_for(&task, JobStatus::Running)).unwrap();
        f.credits.check_and_deduct("dev-user-a", job_id).await.unwrap();

        let writer = DeadLetterWriter::new(
            Arc::clone(&f.docs),
            Arc::clone(&f.credits),
            Arc::new(Metrics::new()),
        );
        writer
            .handle(TerminalFailure {
                seq: 0,
                task,
                attempts_made: 5,
                failure: FailureRecord { kind: "provider".into(), message: "x".repeat(600) },
            })
            .await;

        let job = f.docs.get_job(job_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        let error = job.error.unwrap();
        assert_eq!(error.kind, "provider");
        assert!(error.message.len() <= MAX_MESSAGE_LEN + 3);

        assert!(f.docs.has_refund_for_job(job_id).unwrap());
        let entry = f.docs.get_dead_letter(&DeadLetterEntry::id_for(job_id)).unwrap().unwrap();
        assert_eq!(entry.attempts_made, 5);
    }

    #[tokio::test]
    async fn replay_enqueues_marked_task_and_removes_entry() {
        let f = fixture();
        let task = sample_task("dev-user-a");
        let job_id = task.job_id;
        f.docs.insert_job(&job_for(&task, JobStatus::Running)).unwrap();
        f.credits.check_and_deduct("dev-user-a", job_id).await.unwrap();

        let writer = DeadLetterWriter::new(
            Arc::clone(&f.docs),
            Arc::clone(&f.credits),
            Arc::new(Metrics::new()),
        );
        writer
            .handle(TerminalFailure {
                seq: 0,
                task,
                attempts_made: 5,
                failure: FailureRecord { kind: "provider".into(), message: "down".into() },
            })
            .await;

        let tool = ReplayTool::new(Arc::clone(&f.docs), Arc::clone(&f.engine), Arc::new(Metrics::new()));
        let report = tool.replay(job_id, "op", "provider recovered", None).await.unwrap();
        assert!(report.refund_exists);

        // Entry is gone; job is queued again; the task carries the marker
        assert!(f.docs.get_dead_letter(&report.dead_letter_id).unwrap().is_none());
        assert_eq!(f.docs.get_job(job_id).unwrap().unwrap().status, JobStatus::Queued);

        let delivery = timeout(Duration::from_secs(2), f.engine.next_delivery()).await.unwrap();
        let marker = delivery.task.replay.unwrap();
        assert_eq!(marker.original_job_id, job_id);
        assert_eq!(marker.previous_attempts, 5);

        // Replaying again: entry no longer exists
        assert!(matches!(
            tool.replay(job_id, "op", "again", None).await,
            Err(ReplayError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn replay_refuses_succeeded_jobs() {
        let f = fixture();
        let task = sample_task("dev-user-a");
        let job_id = task.job_id;
        f.docs.insert_job(&job_for(&task, JobStatus::Queued)).unwrap();
        f.docs
            .transition(job_id, |r| {
                r.status = JobStatus::Succeeded;
                r.result_object = Some("results/dev-user-a/x.jpg".into());
            })
            .unwrap();
        f.docs
            .put_dead_letter(&DeadLetterEntry {
                id: DeadLetterEntry::id_for(job_id),
                job_id,
                owner_id: "dev-user-a".into(),
                task,
                failure: FailureRecord { kind: "provider".into(), message: "m".into() },
                attempts_made: 5,
                failed_at: Utc::now(),
            })
            .unwrap();

        let tool = ReplayTool::new(Arc::clone(&f.docs), Arc::clone(&f.engine), Arc::new(Metrics::new()));
        assert!(matches!(
            tool.replay(job_id, "op", "r", None).await,
            Err(ReplayError::AlreadySucceeded(_))
        ));
    }

    #[tokio::test]
    async fn cleanup_drops_only_expired_entries() {
        let f = fixture();
        let fresh = sample_task("dev-user-a");
        let stale = sample_task("dev-user-a");
        for (task, age_days) in [(&fresh, 0i64), (&stale, 40)] {
            f.docs
                .put_dead_letter(&DeadLetterEntry {
                    id: DeadLetterEntry::id_for(task.job_id),
                    job_id: task.job_id,
                    owner_id: task.owner_id.clone(),
                    task: task.clone(),
                    failure: FailureRecord { kind: "provider".into(), message: "m".into() },
                    attempts_made: 5,
                    failed_at: Utc::now() - chrono::Duration::days(age_days),
                })
                .unwrap();
        }

        let tool = ReplayTool::new(Arc::clone(&f.docs), Arc::clone(&f.engine), Arc::new(Metrics::new()));
        assert_eq!(tool.cleanup(30).unwrap(), 1);
        assert!(f.docs.get_dead_letter(&DeadLetterEntry::id_for(fresh.job_id)).unwrap().is_some());
        assert!(f.docs.get_dead_letter(&DeadLetterEntry::id_for(stale.job_id)).unwrap().is_none());
    }
}
