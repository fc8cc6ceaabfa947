//! Retry engine over the durable queue
//!
//! Delivery is pull-based: workers claim the oldest ready row under a
//! lease and heartbeat while processing. Transient failures reschedule the
//! row with jittered exponential backoff; an exhausted attempt budget
//! removes the row and emits one terminal-failure event, consumed by the
//! single dead-letter subscriber. A scanner returns expired leases to
//! pending with the attempt counter preserved, which is what makes
//! delivery at-least-once across worker crashes.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, RwLock, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::JobsConfig;
use crate::docstore::FailureRecord;
use crate::observability::Metrics;
use crate::retry::RetryPolicy;

use super::store::{FjallQueue, QueueCounts, Result, TaskHeader, TaskRow, TaskState};
use super::task::RestoreTask;

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub max_attempts: u32,
    pub backoff: RetryPolicy,
    /// Lease duration; a worker that stops heartbeating for this long is
    /// considered stalled
    pub lease_ms: u64,
    pub remove_on_complete: usize,
    pub remove_on_fail: usize,
}

impl EngineConfig {
    pub fn from_jobs(jobs: &JobsConfig) -> Self {
        Self {
            max_attempts: jobs.max_attempts,
            backoff: RetryPolicy::new(jobs.max_attempts, jobs.backoff_base_ms, jobs.backoff_jitter),
            lease_ms: jobs.stalled_check_ms,
            remove_on_complete: jobs.remove_on_complete,
            remove_on_fail: jobs.remove_on_fail,
        }
    }
}

/// A claimed task handed to a worker
#[derive(Debug, Clone)]
pub struct Delivery {
    pub seq: u64,
    /// 1-based attempt number of this delivery
    pub attempt: u32,
    pub max_attempts: u32,
    pub task: RestoreTask,
}

/// Emitted exactly once when a task exhausts its attempt budget
#[derive(Debug)]
pub struct TerminalFailure {
    pub seq: u64,
    pub task: RestoreTask,
    pub attempts_made: u32,
    pub failure: FailureRecord,
}

pub struct QueueEngine {
    store: Arc<RwLock<FjallQueue>>,
    notify: Notify,
    config: EngineConfig,
    failures: mpsc::UnboundedSender<TerminalFailure>,
    metrics: Arc<Metrics>,
}

impl QueueEngine {
    /// Returns the engine plus the terminal-failure stream for the
    /// dead-letter writer. One receiver; one subscriber.
    pub fn new(
        store: Arc<RwLock<FjallQueue>>,
        config: EngineConfig,
        metrics: Arc<Metrics>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<TerminalFailure>) {
        let (failures, failure_rx) = mpsc::unbounded_channel();
        let engine = Arc::new(Self {
            store,
            notify: Notify::new(),
            config,
            failures,
            metrics,
        });
        (engine, failure_rx)
    }

    /// Durable enqueue: the row is fsynced before this returns.
    pub async fn enqueue(
        &self,
        task: RestoreTask,
        max_attempts_override: Option<u32>,
    ) -> Result<u64> {
        let now = now_ms();
        let row = TaskRow {
            task,
            state: TaskState::Pending,
            attempt: 1,
            ready_at_ms: now,
            lease_expires_ms: None,
            enqueued_at_ms: now,
            max_attempts_override,
        };
        let seq = self.store.write().await.insert(&row)?;
        self.notify.notify_waiters();
        Ok(seq)
    }

    /// Block until a task is ready and claim it.
    pub async fn next_delivery(&self) -> Delivery {
        loop {
            let claimed = {
                let store = self.store.write().await;
                store.claim_ready(now_ms(), self.config.lease_ms)
            };

            match claimed {
                Ok(Some((seq, row))) => {
                    return Delivery {
                        seq,
                        attempt: row.attempt,
                        max_attempts: row.max_attempts_override.unwrap_or(self.config.max_attempts),
                        task: row.task,
                    };
                }
                Ok(None) => {
                    let next_ready = {
                        let store = self.store.read().await;
                        store.next_ready_at().ok().flatten()
                    };
                    let sleep_ms = next_ready
                        .map(|ready| ready.saturating_sub(now_ms()).clamp(10, 1_000))
                        .unwrap_or(1_000);
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = tokio::time::sleep(Duration::from_millis(sleep_ms)) => {}
                    }
                }
                Err(e) => {
                    error!(error = %e, "Queue claim failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    pub async fn complete(&self, delivery: &Delivery) -> Result<()> {
        let store = self.store.write().await;
        store.remove(delivery.seq)?;
        store.record_completed(
            &TaskHeader {
                seq: delivery.seq,
                job_id: delivery.task.job_id,
                owner_id: delivery.task.owner_id.clone(),
                attempts: delivery.attempt,
                finished_at_ms: now_ms(),
                error: None,
            },
            self.config.remove_on_complete,
        )?;
        Ok(())
    }

    /// Transient failure: reschedule with backoff, or emit the terminal
    /// failure once the budget is spent.
    pub async fn fail(&self, delivery: &Delivery, failure: FailureRecord) -> Result<()> {
        if delivery.attempt >= delivery.max_attempts {
            {
                let store = self.store.write().await;
                store.remove(delivery.seq)?;
                store.record_failed(
                    &TaskHeader {
                        seq: delivery.seq,
                        job_id: delivery.task.job_id,
                        owner_id: delivery.task.owner_id.clone(),
                        attempts: delivery.attempt,
                        finished_at_ms: now_ms(),
                        error: Some(failure.message.clone()),
                    },
                    self.config.remove_on_fail,
                )?;
            }
            warn!(
                seq = delivery.seq,
                job_id = %delivery.task.job_id,
                attempts = delivery.attempt,
                kind = %failure.kind,
                "Task attempts exhausted"
            );
            let _ = self.failures.send(TerminalFailure {
                seq: delivery.seq,
                task: delivery.task.clone(),
                attempts_made: delivery.attempt,
                failure,
            });
            return Ok(());
        }

        let delay = self.config.backoff.delay_for(delivery.attempt);
        {
            let store = self.store.write().await;
            if let Some(mut row) = store.get(delivery.seq)? {
                row.state = TaskState::Pending;
                row.attempt = delivery.attempt + 1;
                row.ready_at_ms = now_ms() + delay.as_millis() as u64;
                row.lease_expires_ms = None;
                store.update(delivery.seq, &row)?;
            }
        }
        self.metrics.task_retried();
        info!(
            seq = delivery.seq,
            job_id = %delivery.task.job_id,
            attempt = delivery.attempt,
            delay_ms = delay.as_millis() as u64,
            kind = %failure.kind,
            "Task rescheduled"
        );
        self.notify.notify_waiters();
        Ok(())
    }

    pub fn lease_ms(&self) -> u64 {
        self.config.lease_ms
    }

    pub async fn heartbeat(&self, seq: u64) -> Result<()> {
        let store = self.store.write().await;
        store.heartbeat(seq, now_ms(), self.config.lease_ms)
    }

    /// Background scanner returning expired leases to pending.
    pub fn spawn_stalled_scanner(self: &Arc<Self>, interval_ms: u64) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_millis(interval_ms.max(100)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let released = {
                    let store = engine.store.write().await;
                    store.release_expired(now_ms())
                };
                match released {
                    Ok(seqs) if !seqs.is_empty() => {
                        warn!(count = seqs.len(), "Stalled tasks redelivered");
                        engine.notify.notify_waiters();
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Stalled-task scan failed"),
                }
            }
        })
    }

    pub async fn stats(&self) -> Result<QueueCounts> {
        self.store.read().await.counts()
    }

    pub async fn finished_header(&self, job_id: Uuid) -> Result<Option<TaskHeader>> {
        self.store.read().await.finished_header(job_id)
    }

    pub async fn health_check(&self) -> bool {
        self.store.read().await.health_check().is_ok()
    }
}

fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}
