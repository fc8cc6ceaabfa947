//! Per-task restoration pipeline
//!
//! Sequential within one task: mark running, materialize the source image,
//! classify, enhance the prompt, call the provider, store the result, mark
//! succeeded. Errors bubble to the queue engine's retry policy; this code
//! never refunds. Duplicate deliveries of terminal jobs write nothing and
//! report success.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{Instrument, info, info_span};

use crate::api::models::{JobStatus, ProviderReceipt, StageTimings};
use crate::blob::BlobStore;
use crate::docstore::FjallDocStore;
use crate::observability::Metrics;
use crate::provider::RestorationProvider;
use crate::queue::{Delivery, QueueEngine};

use super::{classifier, prompt};

/// Everything a worker needs, built once in the composition root
pub struct WorkerContext {
    pub docs: Arc<FjallDocStore>,
    pub blobs: Arc<BlobStore>,
    pub provider: Arc<dyn RestorationProvider>,
    pub engine: Arc<QueueEngine>,
    pub metrics: Arc<Metrics>,
    pub stage_timeout: Duration,
    pub task_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineOutcome {
    Completed,
    /// The job was already terminal (duplicate delivery); nothing written
    AlreadyTerminal,
}

#[derive(Debug)]
pub struct PipelineError {
    pub kind: &'static str,
    pub message: String,
}

impl PipelineError {
    fn new(kind: &'static str, message: impl ToString) -> Self {
        Self { kind, message: message.to_string() }
    }
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

pub async fn process_task(
    ctx: &WorkerContext,
    delivery: &Delivery,
) -> Result<PipelineOutcome, PipelineError> {
    let task = &delivery.task;
    let span = info_span!(
        "worker.process",
        job_id = %task.job_id,
        attempt = delivery.attempt,
        owner_id = %task.owner_id,
        traceparent = task.trace.traceparent.as_deref().unwrap_or(""),
        tracestate = task.trace.tracestate.as_deref().unwrap_or(""),
    );
    run(ctx, delivery).instrument(span).await
}

async fn run(ctx: &WorkerContext, delivery: &Delivery) -> Result<PipelineOutcome, PipelineError> {
    let task = &delivery.task;
    let job_id = task.job_id;
    let started = Instant::now();

    if let Some(replay) = &task.replay {
        info!(
            dead_letter_id = %replay.dead_letter_id,
            previous_attempts = replay.previous_attempts,
            "Processing replayed task"
        );
    }

    let attempt = delivery.attempt;
    let running = ctx
        .docs
        .transition(job_id, |record| {
            record.status = JobStatus::Running;
            record.started_at.get_or_insert_with(Utc::now);
            record.attempts_made = attempt;
        })
        .map_err(|e| PipelineError::new("record-write", e))?;
    if running.is_none() {
        info!(%job_id, "Job already terminal, skipping duplicate delivery");
        return Ok(PipelineOutcome::AlreadyTerminal);
    }

    let source = ctx
        .blobs
        .download(&task.owner_id, &task.source_object)
        .await
        .map_err(|e| PipelineError::new("blob-download", e))?;
    let img = image::load_from_memory(&source)
        .map_err(|e| PipelineError::new("image-decode", e))?;

    let stage = Instant::now();
    let source_is_jpeg = task.source_format == "jpeg";
    let classification = tokio::task::spawn_blocking(move || classifier::classify(&img, source_is_jpeg))
        .await
        .map_err(|e| PipelineError::new("classify", e))?;
    let classify_ms = stage.elapsed().as_millis() as u64;

    let stage = Instant::now();
    let enhanced = prompt::enhance(&classification, task.prompt.as_deref());
    let prompt_ms = stage.elapsed().as_millis() as u64;

    let stage = Instant::now();
    let restoration = tokio::time::timeout(ctx.stage_timeout, ctx.provider.restore(&enhanced, &source))
        .await
        .map_err(|_| PipelineError::new("provider-timeout", "stage deadline exceeded"))?
        .map_err(|e| PipelineError::new("provider", e))?;
    let restore_ms = stage.elapsed().as_millis() as u64;

    let result_object = BlobStore::result_object_name(&task.owner_id, job_id);
    ctx.blobs
        .put(&task.owner_id, &result_object, restoration.image.to_vec())
        .await
        .map_err(|e| PipelineError::new("blob-upload", e))?;

    let timings = StageTimings {
        classify_ms,
        prompt_ms,
        restore_ms,
        total_ms: started.elapsed().as_millis() as u64,
    };
    let receipt = ProviderReceipt {
        request_id: restoration.request_id.clone(),
        billed_units: restoration.billed_units,
        estimated_cost: restoration.estimated_cost,
    };

    let succeeded = ctx
        .docs
        .transition(job_id, |record| {
            record.status = JobStatus::Succeeded;
            record.timings = Some(timings);
            record.classification = Some(classification.clone());
            record.enhanced_prompt = Some(enhanced.clone());
            record.provider = Some(receipt.clone());
            record.result_object = Some(result_object.clone());
        })
        .map_err(|e| PipelineError::new("record-write", e))?;
    if succeeded.is_none() {
        info!(%job_id, "Job went terminal mid-flight, result kept but record untouched");
        return Ok(PipelineOutcome::AlreadyTerminal);
    }

    ctx.metrics.job_succeeded();
    info!(
        %job_id,
        total_ms = timings.total_ms,
        provider_request = %receipt.request_id,
        "Restoration complete"
    );
    Ok(PipelineOutcome::Completed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::models::{CreditInfo, CreditKind, JobRecord, PreprocessSummary};
    use crate::imageprep;
    use crate::moderation::ModerationVerdict;
    use crate::provider::MockProvider;
    use crate::queue::{EngineConfig, FjallQueue, RestoreTask};
    use crate::retry::RetryPolicy;
    use crate::trace::TraceContext;
    use image::{Rgb, RgbImage};
    use std::io::Cursor;
    use tempfile::TempDir;
    use tokio::sync::RwLock;
    use uuid::Uuid;

    fn context(provider: Arc<dyn RestorationProvider>) -> (WorkerContext, TempDir) {
        let tmp = TempDir::new().unwrap();
        let docs = Arc::new(FjallDocStore::open(tmp.path().join("docs")).unwrap());
        let blobs = Arc::new(BlobStore::in_memory("http://localhost:8080", "secret"));
        let queue = Arc::new(RwLock::new(FjallQueue::open(tmp.path().join("queue")).unwrap()));
        let (engine, _rx) = QueueEngine::new(
            queue,
            EngineConfig {
                max_attempts: 5,
                backoff: RetryPolicy::new(5, 1, 0.0),
                lease_ms: 10_000,
                remove_on_complete: 100,
                remove_on_fail: 500,
            },
            Arc::new(Metrics::new()),
        );
        let ctx = WorkerContext {
            docs,
            blobs,
            provider,
            engine,
            metrics: Arc::new(Metrics::new()),
            stage_timeout: Duration::from_secs(5),
            task_timeout: Duration::from_secs(10),
        };
        (ctx, tmp)
    }

    fn sample_jpeg() -> Vec<u8> {
        let img = image::DynamicImage::ImageRgb8(RgbImage::from_pixel(32, 32, Rgb([90, 120, 150])));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageFormat::Png).unwrap();
        imageprep::prepare(&out.into_inner()).unwrap().jpeg
    }

    async fn seed_job(ctx: &WorkerContext, owner: &str) -> RestoreTask {
        let job_id = Uuid::now_v7();
        let source_object = format!("uploads/{owner}/{job_id}.jpg");
        ctx.blobs.put(owner, &source_object, sample_jpeg()).await.unwrap();

        let now = Utc::now();
        let record = JobRecord::builder()
            .job_id(job_id)
            .owner_id(owner.to_string())
            .status(JobStatus::Queued)
            .created_at(now)
            .updated_at(now)
            .credit(CreditInfo { amount: 1, kind: CreditKind::Free })
            .source_object(source_object.clone())
            .preprocessing(PreprocessSummary {
                source_format: "png".into(),
                width: 32,
                height: 32,
                operations: vec![],
                color_profile: "srgb".into(),
            })
            .moderation(ModerationVerdict::allow())
            .build();
        ctx.docs.insert_job(&record).unwrap();

        RestoreTask {
            job_id,
            owner_id: owner.to_string(),
            prompt: Some("restore my photo".into()),
            source_object,
            source_format: "png".into(),
            moderation_flags: vec![],
            credit: CreditInfo { amount: 1, kind: CreditKind::Free },
            trace: TraceContext::default(),
            replay: None,
        }
    }

    fn delivery_for(task: RestoreTask) -> Delivery {
        Delivery { seq: 0, attempt: 1, max_attempts: 5, task }
    }

    #[tokio::test]
    async fn happy_path_marks_succeeded_with_timings() {
        let (ctx, _tmp) = context(Arc::new(MockProvider::echo()));
        let task = seed_job(&ctx, "dev-user-a").await;
        let job_id = task.job_id;

        let outcome = process_task(&ctx, &delivery_for(task)).await.unwrap();
        assert_eq!(outcome, PipelineOutcome::Completed);

        let record = ctx.docs.get_job(job_id).unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Succeeded);
        assert_eq!(record.attempts_made, 1);
        assert!(record.started_at.is_some());
        let timings = record.timings.unwrap();
        assert!(timings.total_ms >= timings.restore_ms);
        assert!(record.classification.is_some());
        assert!(record.enhanced_prompt.unwrap().contains("restore my photo"));
        assert_eq!(record.provider.unwrap().request_id, "mock-1");

        let result_object = record.result_object.unwrap();
        let stored = ctx.blobs.download("dev-user-a", &result_object).await.unwrap();
        assert!(!stored.is_empty());
    }

    #[tokio::test]
    async fn duplicate_delivery_of_terminal_job_writes_nothing() {
        let (ctx, _tmp) = context(Arc::new(MockProvider::echo()));
        let task = seed_job(&ctx, "dev-user-a").await;
        let job_id = task.job_id;

        process_task(&ctx, &delivery_for(task.clone())).await.unwrap();
        let before = ctx.docs.get_job(job_id).unwrap().unwrap();

        let outcome = process_task(&ctx, &delivery_for(task)).await.unwrap();
        assert_eq!(outcome, PipelineOutcome::AlreadyTerminal);

        let after = ctx.docs.get_job(job_id).unwrap().unwrap();
        assert_eq!(after.updated_at, before.updated_at);
        assert_eq!(after.attempts_made, before.attempts_made);
    }

    #[tokio::test]
    async fn provider_outage_surfaces_as_pipeline_error() {
        let (ctx, _tmp) = context(Arc::new(MockProvider::always_failing()));
        let task = seed_job(&ctx, "dev-user-a").await;
        let job_id = task.job_id;

        let err = process_task(&ctx, &delivery_for(task)).await.unwrap_err();
        assert_eq!(err.kind, "provider");

        // Record is running, ready for redelivery
        let record = ctx.docs.get_job(job_id).unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Running);
    }

    #[tokio::test]
    async fn missing_source_object_fails_the_stage() {
        let (ctx, _tmp) = context(Arc::new(MockProvider::echo()));
        let mut task = seed_job(&ctx, "dev-user-a").await;
        task.source_object = "uploads/dev-user-a/ghost.jpg".into();

        let err = process_task(&ctx, &delivery_for(task)).await.unwrap_err();
        assert_eq!(err.kind, "blob-download");
    }
}
