//! Restoration worker pool
//!
//! Workers pull deliveries from the queue engine with bounded concurrency
//! (one tokio task per worker slot), heartbeat while processing, and route
//! outcomes back into the engine: success completes the row; any error,
//! including the hard task timeout, is a transient failure for the retry
//! policy to judge.

pub mod classifier;
mod pipeline;
pub mod prompt;

pub use pipeline::{PipelineError, PipelineOutcome, WorkerContext, process_task};

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::docstore::FailureRecord;

pub fn spawn_workers(ctx: Arc<WorkerContext>, concurrency: usize) -> Vec<JoinHandle<()>> {
    info!(concurrency, "Starting worker pool");
    (0..concurrency)
        .map(|worker_id| {
            let ctx = Arc::clone(&ctx);
            tokio::spawn(async move { worker_loop(ctx, worker_id).await })
        })
        .collect()
}

async fn worker_loop(ctx: Arc<WorkerContext>, worker_id: usize) {
    loop {
        let delivery = ctx.engine.next_delivery().await;
        let seq = delivery.seq;

        // Lease keep-alive while the pipeline runs; a crashed worker stops
        // heartbeating and the stalled scanner redelivers.
        let heartbeat = {
            let engine = Arc::clone(&ctx.engine);
            let interval = heartbeat_interval(&ctx);
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(interval).await;
                    if let Err(e) = engine.heartbeat(seq).await {
                        warn!(seq, error = %e, "Heartbeat failed");
                    }
                }
            })
        };

        let result = tokio::time::timeout(ctx.task_timeout, process_task(&ctx, &delivery)).await;
        heartbeat.abort();

        match result {
            Ok(Ok(outcome)) => {
                if outcome == PipelineOutcome::AlreadyTerminal {
                    info!(worker_id, seq, "Duplicate delivery acknowledged");
                }
                if let Err(e) = ctx.engine.complete(&delivery).await {
                    error!(worker_id, seq, error = %e, "Completing task failed");
                }
            }
            Ok(Err(err)) => {
                warn!(worker_id, seq, kind = err.kind, error = %err.message, "Task attempt failed");
                let failure = FailureRecord { kind: err.kind.to_string(), message: err.message };
                if let Err(e) = ctx.engine.fail(&delivery, failure).await {
                    error!(worker_id, seq, error = %e, "Recording task failure failed");
                }
            }
            Err(_) => {
                warn!(worker_id, seq, "Hard task timeout");
                let failure = FailureRecord {
                    kind: "task-timeout".to_string(),
                    message: format!("task exceeded {}ms", ctx.task_timeout.as_millis()),
                };
                if let Err(e) = ctx.engine.fail(&delivery, failure).await {
                    error!(worker_id, seq, error = %e, "Recording task timeout failed");
                }
            }
        }
    }
}

fn heartbeat_interval(ctx: &WorkerContext) -> Duration {
    // A third of the lease keeps two misses survivable
    Duration::from_millis((ctx.engine.lease_ms() / 3).max(250))
}
