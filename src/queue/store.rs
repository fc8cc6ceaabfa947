use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use super::task::RestoreTask;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue store error: {0}")]
    Fjall(#[from] fjall::Error),

    #[error("task decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("task not found: seq={0}")]
    TaskNotFound(u64),
}

pub type Result<T> = std::result::Result<T, QueueError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// Waiting for a worker; eligible once `ready_at_ms` has passed
    Pending,
    /// Claimed by a worker holding a lease
    Leased,
}

/// Persisted queue row. The row is the source of truth for delivery state;
/// crash recovery reads these back and expired leases return to pending.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRow {
    pub task: RestoreTask,
    pub state: TaskState,
    /// Delivery number of the current or upcoming attempt, 1-based
    pub attempt: u32,
    pub ready_at_ms: u64,
    #[serde(default)]
    pub lease_expires_ms: Option<u64>,
    pub enqueued_at_ms: u64,
    /// Operator override from replay; otherwise the engine default applies
    #[serde(default)]
    pub max_attempts_override: Option<u32>,
}

/// Retained header for a finished task (completed or failed ring)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskHeader {
    pub seq: u64,
    pub job_id: Uuid,
    pub owner_id: String,
    pub attempts: u32,
    pub finished_at_ms: u64,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub leased: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Fjall-backed task queue
///
/// Partitions:
/// - `tasks`: u64 (big-endian seq) -> TaskRow (JSON)
/// - `metadata`: "next_seq" -> u64
/// - `completed` / `failed`: u64 -> TaskHeader (JSON), trimmed rings
pub struct FjallQueue {
    keyspace: Keyspace,
    tasks: PartitionHandle,
    metadata: PartitionHandle,
    completed: PartitionHandle,
    failed: PartitionHandle,
    seq_counter: AtomicU64,
}

impl FjallQueue {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        info!("Opening task queue at: {}", path.as_ref().display());
        let keyspace = Config::new(path).open()?;

        let tasks = keyspace.open_partition("tasks", PartitionCreateOptions::default())?;
        let metadata = keyspace.open_partition("metadata", PartitionCreateOptions::default())?;
        let completed = keyspace.open_partition("completed", PartitionCreateOptions::default())?;
        let failed = keyspace.open_partition("failed", PartitionCreateOptions::default())?;

        let current_seq = metadata
            .get(b"next_seq")?
            .map(|bytes| u64::from_be_bytes(bytes.as_ref().try_into().unwrap_or([0u8; 8])))
            .unwrap_or(0);

        Ok(Self {
            keyspace,
            tasks,
            metadata,
            completed,
            failed,
            seq_counter: AtomicU64::new(current_seq),
        })
    }

    /// Persist a new row and fsync. Enqueue must not report success unless
    /// the task survives a process restart.
    pub fn insert(&self, row: &TaskRow) -> Result<u64> {
        let seq = self.seq_counter.fetch_add(1, Ordering::SeqCst);
        self.tasks.insert(seq.to_be_bytes(), serde_json::to_vec(row)?)?;
        self.metadata.insert(b"next_seq", (seq + 1).to_be_bytes())?;
        self.keyspace.persist(fjall::PersistMode::SyncAll)?;
        debug!(seq, job_id = %row.task.job_id, "Task persisted");
        Ok(seq)
    }

    pub fn get(&self, seq: u64) -> Result<Option<TaskRow>> {
        match self.tasks.get(seq.to_be_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn update(&self, seq: u64, row: &TaskRow) -> Result<()> {
        self.tasks.insert(seq.to_be_bytes(), serde_json::to_vec(row)?)?;
        Ok(())
    }

    pub fn remove(&self, seq: u64) -> Result<()> {
        self.tasks.remove(seq.to_be_bytes())?;
        Ok(())
    }

    /// Claim the oldest pending row whose `ready_at_ms` has passed, marking
    /// it leased until `now + lease_ms`.
    pub fn claim_ready(&self, now_ms: u64, lease_ms: u64) -> Result<Option<(u64, TaskRow)>> {
        for item in self.tasks.iter() {
            let (key, value) = item?;
            let seq = u64::from_be_bytes(key.as_ref().try_into().unwrap_or([0u8; 8]));
            let mut row: TaskRow = serde_json::from_slice(&value)?;
            if row.state == TaskState::Pending && row.ready_at_ms <= now_ms {
                row.state = TaskState::Leased;
                row.lease_expires_ms = Some(now_ms + lease_ms);
                self.update(seq, &row)?;
                return Ok(Some((seq, row)));
            }
        }
        Ok(None)
    }

    /// Earliest instant a pending row becomes ready, for wake-up scheduling
    pub fn next_ready_at(&self) -> Result<Option<u64>> {
        let mut earliest: Option<u64> = None;
        for item in self.tasks.iter() {
            let (_, value) = item?;
            let row: TaskRow = serde_json::from_slice(&value)?;
            if row.state == TaskState::Pending {
                earliest = Some(earliest.map_or(row.ready_at_ms, |e| e.min(row.ready_at_ms)));
            }
        }
        Ok(earliest)
    }

    /// Extend the lease of a claimed row. A row that went back to pending
    /// (stalled recovery won the race) is left alone.
    pub fn heartbeat(&self, seq: u64, now_ms: u64, lease_ms: u64) -> Result<()> {
        if let Some(mut row) = self.get(seq)? {
            if row.state == TaskState::Leased {
                row.lease_expires_ms = Some(now_ms + lease_ms);
                self.update(seq, &row)?;
            }
        }
        Ok(())
    }

    /// Return expired leases to pending with their attempt counter intact.
    pub fn release_expired(&self, now_ms: u64) -> Result<Vec<u64>> {
        let mut released = Vec::new();
        let mut expired = Vec::new();
        for item in self.tasks.iter() {
            let (key, value) = item?;
            let seq = u64::from_be_bytes(key.as_ref().try_into().unwrap_or([0u8; 8]));
            let row: TaskRow = serde_json::from_slice(&value)?;
            if row.state == TaskState::Leased
                && row.lease_expires_ms.is_some_and(|lease| lease <= now_ms)
            {
                expired.push((seq, row));
            }
        }
        for (seq, mut row) in expired {
            row.state = TaskState::Pending;
            row.lease_expires_ms = None;
            row.ready_at_ms = now_ms;
            self.update(seq, &row)?;
            released.push(seq);
        }
        Ok(released)
    }

    pub fn record_completed(&self, header: &TaskHeader, keep: usize) -> Result<()> {
        self.completed.insert(header.seq.to_be_bytes(), serde_json::to_vec(header)?)?;
        self.trim_ring(&self.completed, keep)
    }

    pub fn record_failed(&self, header: &TaskHeader, keep: usize) -> Result<()> {
        self.failed.insert(header.seq.to_be_bytes(), serde_json::to_vec(header)?)?;
        self.trim_ring(&self.failed, keep)
    }

    fn trim_ring(&self, partition: &PartitionHandle, keep: usize) -> Result<()> {
        let mut keys = Vec::new();
        for item in partition.iter() {
            let (key, _) = item?;
            keys.push(key);
        }
        if keys.len() > keep {
            let excess = keys.len() - keep;
            for key in keys.into_iter().take(excess) {
                partition.remove(key)?;
            }
        }
        Ok(())
    }

    pub fn finished_header(&self, job_id: Uuid) -> Result<Option<TaskHeader>> {
        for partition in [&self.completed, &self.failed] {
            for item in partition.iter() {
                let (_, value) = item?;
                let header: TaskHeader = serde_json::from_slice(&value)?;
                if header.job_id == job_id {
                    return Ok(Some(header));
                }
            }
        }
        Ok(None)
    }

    pub fn counts(&self) -> Result<QueueCounts> {
        let mut counts = QueueCounts::default();
        for item in self.tasks.iter() {
            let (_, value) = item?;
            let row: TaskRow = serde_json::from_slice(&value)?;
            match row.state {
                TaskState::Pending => counts.pending += 1,
                TaskState::Leased => counts.leased += 1,
            }
        }
        for item in self.completed.iter() {
            item?;
            counts.completed += 1;
        }
        for item in self.failed.iter() {
            item?;
            counts.failed += 1;
        }
        Ok(counts)
    }

    pub fn flush(&self) -> Result<()> {
        self.keyspace.persist(fjall::PersistMode::SyncAll)?;
        Ok(())
    }

    pub fn health_check(&self) -> Result<()> {
        let _ = self.metadata.get(b"next_seq")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::models::{CreditInfo, CreditKind};
    use crate::trace::TraceContext;
    use tempfile::TempDir;

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

    fn pending_row(owner: &str, ready_at_ms: u64) -> TaskRow {
        TaskRow {
            task: sample_task(owner),
            state: TaskState::Pending,
            attempt: 1,
            ready_at_ms,
            lease_expires_ms: None,
            enqueued_at_ms: ready_at_ms,
            max_attempts_override: None,
        }
    }

    fn open_queue() -> (FjallQueue, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let queue = FjallQueue::open(temp_dir.path().join("queue")).unwrap();
        (queue, temp_dir)
    }

    #[test]
    fn insert_assigns_sequential_ids() {
        let (queue, _tmp) = open_queue();
        assert_eq!(queue.insert(&pending_row("u", 0)).unwrap(), 0);
        assert_eq!(queue.insert(&pending_row("u", 0)).unwrap(), 1);
        assert_eq!(queue.insert(&pending_row("u", 0)).unwrap(), 2);
    }

    #[test]
    fn claim_respects_ready_at_and_order() {
        let (queue, _tmp) = open_queue();
        let s0 = queue.insert(&pending_row("u", 1_000)).unwrap();
        let s1 = queue.insert(&pending_row("u", 5_000)).unwrap();

        // Before anything is ready
        assert!(queue.claim_ready(500, 10_000).unwrap().is_none());

        let (seq, row) = queue.claim_ready(2_000, 10_000).unwrap().unwrap();
        assert_eq!(seq, s0);
        assert_eq!(row.state, TaskState::Leased);
        assert_eq!(row.lease_expires_ms, Some(12_000));

        // s0 is leased; s1 not yet ready
        assert!(queue.claim_ready(2_000, 10_000).unwrap().is_none());
        let (seq, _) = queue.claim_ready(5_000, 10_000).unwrap().unwrap();
        assert_eq!(seq, s1);
    }

    #[test]
    fn expired_leases_return_to_pending_with_attempt_kept() {
        let (queue, _tmp) = open_queue();
        let mut row = pending_row("u", 0);
        row.attempt = 3;
        let seq = queue.insert(&row).unwrap();

        queue.claim_ready(1_000, 5_000).unwrap().unwrap();
        assert!(queue.release_expired(2_000).unwrap().is_empty());

        let released = queue.release_expired(7_000).unwrap();
        assert_eq!(released, vec![seq]);

        let row = queue.get(seq).unwrap().unwrap();
        assert_eq!(row.state, TaskState::Pending);
        assert_eq!(row.attempt, 3);
        assert!(row.lease_expires_ms.is_none());
    }

    #[test]
    fn heartbeat_extends_active_lease_only() {
        let (queue, _tmp) = open_queue();
        let seq = queue.insert(&pending_row("u", 0)).unwrap();
        queue.claim_ready(1_000, 5_000).unwrap().unwrap();

        queue.heartbeat(seq, 4_000, 5_000).unwrap();
        let row = queue.get(seq).unwrap().unwrap();
        assert_eq!(row.lease_expires_ms, Some(9_000));

        queue.release_expired(20_000).unwrap();
        queue.heartbeat(seq, 21_000, 5_000).unwrap();
        let row = queue.get(seq).unwrap().unwrap();
        assert_eq!(row.state, TaskState::Pending);
        assert!(row.lease_expires_ms.is_none());
    }

    #[test]
    fn next_ready_at_finds_earliest_pending() {
        let (queue, _tmp) = open_queue();
        assert!(queue.next_ready_at().unwrap().is_none());
        queue.insert(&pending_row("u", 9_000)).unwrap();
        queue.insert(&pending_row("u", 3_000)).unwrap();
        assert_eq!(queue.next_ready_at().unwrap(), Some(3_000));
    }

    #[test]
    fn rings_are_trimmed() {
        let (queue, _tmp) = open_queue();
        for seq in 0..5u64 {
            let header = TaskHeader {
                seq,
                job_id: Uuid::now_v7(),
                owner_id: "u".into(),
                attempts: 1,
                finished_at_ms: seq,
                error: None,
            };
            queue.record_completed(&header, 3).unwrap();
        }
        assert_eq!(queue.counts().unwrap().completed, 3);
    }

    #[test]
    fn rows_survive_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("queue");
        let seq = {
            let queue = FjallQueue::open(&path).unwrap();
            queue.insert(&pending_row("u", 0)).unwrap()
        };
        let queue = FjallQueue::open(&path).unwrap();
        assert!(queue.get(seq).unwrap().is_some());
        assert_eq!(queue.insert(&pending_row("u", 0)).unwrap(), seq + 1);
    }
}
