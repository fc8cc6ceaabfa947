//! Operator commands (`pixelift jobs ...`)
//!
//! These open the data directory directly, so they are meant for a stopped
//! instance (fjall is single-process). Output goes to stdout for humans
//! and scripts alike.

use std::sync::Arc;

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::api::models::JobStatus;
use crate::cli::ReplayCommand;
use crate::config::Config;
use crate::deadletter::{ReplayError, ReplayTool};
use crate::docstore::{DeadLetterEntry, FjallDocStore};
use crate::observability::Metrics;
use crate::queue::{EngineConfig, FjallQueue, QueueEngine};

type AnyError = Box<dyn std::error::Error + Send + Sync + 'static>;

struct Ops {
    docs: Arc<FjallDocStore>,
    engine: Arc<QueueEngine>,
}

fn open(config: &Config) -> Result<Ops, AnyError> {
    let data_dir = &config.server.data_dir;
    let docs = Arc::new(FjallDocStore::open(data_dir.join("docs"))?);
    let queue = Arc::new(RwLock::new(FjallQueue::open(data_dir.join("queue"))?));
    let (engine, _failure_rx) =
        QueueEngine::new(queue, EngineConfig::from_jobs(&config.jobs), Arc::new(Metrics::new()));
    Ok(Ops { docs, engine })
}

pub async fn job_status(config: &Config, raw_id: &str) -> Result<(), AnyError> {
    let ops = open(config)?;
    let job_id = Uuid::parse_str(raw_id)?;

    let record = ops.docs.get_job(job_id)?;
    let dead_letter = ops.docs.get_dead_letter(&DeadLetterEntry::id_for(job_id))?;
    let header = ops.engine.finished_header(job_id).await?;

    match &record {
        Some(record) => {
            println!("job:         {job_id}");
            println!("status:      {}", record.status);
            println!("owner:       {}", record.owner_id);
            println!("attempts:    {}", record.attempts_made);
            println!("created:     {}", record.created_at.to_rfc3339());
            println!("updated:     {}", record.updated_at.to_rfc3339());
            if let Some(timings) = &record.timings {
                println!(
                    "timings:     classify={}ms prompt={}ms restore={}ms total={}ms",
                    timings.classify_ms, timings.prompt_ms, timings.restore_ms, timings.total_ms
                );
            }
            if let Some(error) = &record.error {
                println!("error:       [{}] {}", error.kind, error.message);
            }
            if let Some(result) = &record.result_object {
                println!("result:      {result}");
            }
        }
        None => println!("job:         {job_id} (no record)"),
    }

    if let Some(header) = header {
        let outcome = if header.error.is_some() { "failed" } else { "completed" };
        println!("queue:       {outcome} after {} attempt(s)", header.attempts);
    }
    if let Some(entry) = &dead_letter {
        println!(
            "dead-letter: {} ({} attempts, failed {})",
            entry.id,
            entry.attempts_made,
            entry.failed_at.to_rfc3339()
        );
    }

    let recommendation = match (&record, &dead_letter) {
        (Some(r), _) if r.status == JobStatus::Succeeded => "none; job succeeded".to_string(),
        (_, Some(entry)) => {
            format!("replayable: pixelift jobs replay replay {}", entry.job_id)
        }
        (Some(r), None) if r.status == JobStatus::Failed => {
            "failed without a dead-letter entry; check the ledger for the refund".to_string()
        }
        (Some(_), None) => "in flight; watch /jobs/{id}/stream".to_string(),
        (None, None) => "unknown job id".to_string(),
    };
    println!("recommendation: {recommendation}");
    Ok(())
}

pub async fn queue_stats(config: &Config) -> Result<(), AnyError> {
    let ops = open(config)?;
    let counts = ops.engine.stats().await?;
    let dead_letters = ops.docs.dead_letter_count()?;
    let docs = ops.docs.stats()?;

    println!("pending:      {}", counts.pending);
    println!("leased:       {}", counts.leased);
    println!("completed:    {}", counts.completed);
    println!("failed:       {}", counts.failed);
    println!("dead-letters: {dead_letters}");
    println!("job records:  {}", docs.jobs);
    println!("ledger rows:  {}", docs.ledger_entries);
    Ok(())
}

pub async fn replay(config: &Config, command: ReplayCommand) -> Result<(), AnyError> {
    let ops = open(config)?;
    let tool = ReplayTool::new(Arc::clone(&ops.docs), Arc::clone(&ops.engine), Arc::new(Metrics::new()));

    match command {
        ReplayCommand::List { limit } => {
            let entries = tool.list(limit)?;
            if entries.is_empty() {
                println!("dead-letter archive is empty");
            }
            for entry in entries {
                println!(
                    "{}  owner={}  attempts={}  failed={}  [{}] {}",
                    entry.job_id,
                    entry.owner_id,
                    entry.attempts_made,
                    entry.failed_at.to_rfc3339(),
                    entry.failure.kind,
                    entry.failure.message
                );
            }
        }
        ReplayCommand::Stats => {
            let stats = tool.stats()?;
            println!("entries: {}", stats.total);
            match stats.oldest_failed_at {
                Some(oldest) => println!("oldest:  {}", oldest.to_rfc3339()),
                None => println!("oldest:  -"),
            }
        }
        ReplayCommand::Replay { id, operator, reason, attempts } => {
            let job_id = Uuid::parse_str(&id)?;
            match tool.replay(job_id, &operator, &reason, attempts).await {
                Ok(report) => {
                    println!("replayed {job_id} (dead-letter {})", report.dead_letter_id);
                    if report.refund_exists {
                        println!("note: a refund exists for this job; no re-debit happens");
                    }
                }
                Err(ReplayError::NotFound(_)) => println!("no dead-letter entry for {job_id}"),
                Err(ReplayError::AlreadySucceeded(_)) => {
                    println!("job {job_id} already succeeded; not replaying")
                }
                Err(e) => return Err(e.into()),
            }
        }
        ReplayCommand::ReplayAll { operator, reason } => {
            let summary = tool.replay_all(&operator, &reason).await?;
            println!("replayed: {}  skipped: {}", summary.replayed, summary.skipped);
        }
        ReplayCommand::ReplayUser { user_id, operator, reason } => {
            let summary = tool.replay_user(&user_id, &operator, &reason).await?;
            println!("replayed: {}  skipped: {}", summary.replayed, summary.skipped);
        }
        ReplayCommand::Cleanup { days } => {
            let days = days.unwrap_or(config.retention.dead_letter_ttl_days);
            let removed = tool.cleanup(days)?;
            println!("removed {removed} entries older than {days} days");
        }
    }
    Ok(())
}
