//! Composition root and HTTP server
//!
//! All collaborators are constructed once here and threaded through an
//! explicit [`AppState`] / [`WorkerContext`]; nothing lives in module
//! globals. The same build serves the full control plane (`api`) and the
//! worker-only runtime (`worker`).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::{DefaultBodyLimit, Request, State};
use axum::http::header;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio::sync::mpsc::UnboundedReceiver;
use tower_http::decompression::RequestDecompressionLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::services::{
    get_job, health_live, health_ready, issue_upload_target, submit_job,
};
use super::state::{AppState, RequestId};
use super::stream::stream_job;
use crate::auth::{DevTokenVerifier, HttpTokenVerifier, TokenVerifier};
use crate::blob::BlobStore;
use crate::config::{CollaboratorMode, Config};
use crate::credits::CreditLedger;
use crate::deadletter::DeadLetterWriter;
use crate::docstore::FjallDocStore;
use crate::idempotency::IdempotencyStore;
use crate::kv::{AtomicKv, DegradingKv, FjallKv};
use crate::moderation::{HttpModeration, ModerationService, StaticModeration};
use crate::observability::{LatencySampler, Metrics};
use crate::provider::{HttpRestorationProvider, MockProvider, RestorationProvider};
use crate::queue::{EngineConfig, FjallQueue, QueueEngine, TerminalFailure};
use crate::ratelimit::RateLimiter;
use crate::worker::{WorkerContext, spawn_workers};

type AnyError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Everything `build` assembles, ready for either runtime shape
pub struct Runtime {
    pub state: AppState,
    pub worker_ctx: Arc<WorkerContext>,
    pub failure_rx: UnboundedReceiver<TerminalFailure>,
}

pub fn build(config: Config) -> Result<Runtime, AnyError> {
    let data_dir = config.server.data_dir.clone();
    std::fs::create_dir_all(&data_dir)?;

    let docs = Arc::new(FjallDocStore::open(data_dir.join("docs"))?);
    let primary: Arc<dyn AtomicKv> = Arc::new(FjallKv::open(data_dir.join("kv"))?);
    let kv = Arc::new(DegradingKv::new(primary));
    let kv_dyn: Arc<dyn AtomicKv> = kv.clone();

    let queue = Arc::new(RwLock::new(FjallQueue::open(data_dir.join("queue"))?));
    let metrics = Arc::new(Metrics::new());
    let latency = Arc::new(LatencySampler::new(config.health.metric_sample_size));
    let (engine, failure_rx) =
        QueueEngine::new(queue, EngineConfig::from_jobs(&config.jobs), Arc::clone(&metrics));

    let credits = Arc::new(CreditLedger::new(
        Arc::clone(&kv_dyn),
        Arc::clone(&docs),
        config.credits.free_daily_limit,
        config.credits.job_cost,
    ));
    let limiter = Arc::new(RateLimiter::new(Arc::clone(&kv_dyn), config.rate_limit.clone()));
    let idempotency = Arc::new(IdempotencyStore::new(Arc::clone(&kv_dyn)));

    let signing_secret = config.blob.signing_secret.clone().unwrap_or_else(|| {
        warn!("BLOB_SIGNING_SECRET not set; using a process-local development key");
        Uuid::new_v4().to_string()
    });
    let blob_dir = data_dir.join("blobs");
    std::fs::create_dir_all(&blob_dir)?;
    let object_store: Arc<dyn object_store::ObjectStore> =
        Arc::new(object_store::local::LocalFileSystem::new_with_prefix(&blob_dir)?);
    let blobs = Arc::new(BlobStore::new(
        object_store,
        config.server.public_base_url.clone(),
        &signing_secret,
        Duration::from_secs(config.blob.upload_ttl_seconds),
        Duration::from_secs(config.blob.download_ttl_seconds),
    ));

    let verifier: Arc<dyn TokenVerifier> = match config.auth.mode {
        CollaboratorMode::Dev => Arc::new(DevTokenVerifier),
        CollaboratorMode::Http => {
            let endpoint = config.auth.endpoint.clone().ok_or("auth.endpoint is required")?;
            let credentials =
                config.auth.credentials.clone().ok_or("TOKEN_VERIFIER_CREDENTIALS is required")?;
            Arc::new(HttpTokenVerifier::new(endpoint, credentials))
        }
    };
    let moderation: Arc<dyn ModerationService> = match config.moderation.mode {
        CollaboratorMode::Dev => Arc::new(StaticModeration::allow_all()),
        CollaboratorMode::Http => {
            let endpoint =
                config.moderation.endpoint.clone().ok_or("moderation.endpoint is required")?;
            Arc::new(HttpModeration::new(endpoint))
        }
    };
    let provider: Arc<dyn RestorationProvider> = match config.provider.mode {
        CollaboratorMode::Dev => Arc::new(MockProvider::echo()),
        CollaboratorMode::Http => {
            let endpoint =
                config.provider.endpoint.clone().ok_or("provider.endpoint is required")?;
            let api_key = config.provider.api_key.clone().ok_or("PROVIDER_API_KEY is required")?;
            Arc::new(HttpRestorationProvider::new(endpoint, api_key))
        }
    };

    let worker_ctx = Arc::new(WorkerContext {
        docs: Arc::clone(&docs),
        blobs: Arc::clone(&blobs),
        provider,
        engine: Arc::clone(&engine),
        metrics: Arc::clone(&metrics),
        stage_timeout: Duration::from_millis(config.jobs.stage_timeout_ms),
        task_timeout: Duration::from_millis(config.jobs.task_timeout_ms),
    });

    let state = AppState {
        config: Arc::new(config),
        docs,
        kv,
        blobs,
        engine,
        credits,
        limiter,
        idempotency,
        verifier,
        moderation,
        metrics,
        latency,
    };

    Ok(Runtime { state, worker_ctx, failure_rx })
}

pub fn router(state: AppState) -> Router {
    let body_limit = state.config.server.max_upload_bytes.as_usize() + (1 << 20);
    Router::new()
        .route("/uploads/signed-url", get(issue_upload_target))
        .route("/jobs", post(submit_job))
        .route("/jobs/{id}", get(get_job))
        .route("/jobs/{id}/stream", get(stream_job))
        .route("/health/live", get(health_live))
        .route("/health/ready", get(health_ready))
        .layer(middleware::from_fn_with_state(state.clone(), request_context))
        .layer(RequestDecompressionLayer::new())
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

/// Request id + response headers + latency sample, one middleware
async fn request_context(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let started = Instant::now();
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    request.extensions_mut().insert(RequestId(request_id.clone()));

    let mut response = next.run(request).await;
    state.latency.record(started.elapsed().as_millis().min(u128::from(u32::MAX)) as u32);

    let headers = response.headers_mut();
    if !headers.contains_key(header::CACHE_CONTROL) {
        headers.insert(header::CACHE_CONTROL, header::HeaderValue::from_static("no-store"));
    }
    if !headers.contains_key("x-request-id") {
        if let Ok(value) = request_id.parse() {
            headers.insert("x-request-id", value);
        }
    }
    response
}

/// Full control plane: HTTP front, embedded worker pool, stalled-task
/// scanner, dead-letter writer, retention maintenance.
pub async fn run(
    config: Config,
    address_override: Option<SocketAddr>,
    with_workers: bool,
) -> Result<(), AnyError> {
    let Runtime { state, worker_ctx, failure_rx } = build(config)?;

    let background = spawn_background(&state, worker_ctx, failure_rx, with_workers);

    let app = router(state.clone());
    let address = address_override.unwrap_or(state.config.server.bind_addr);
    let listener = TcpListener::bind(address).await?;
    info!(%address, "PixeLift API listening");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    for handle in background {
        handle.abort();
    }
    state.docs.persist()?;
    Ok(())
}

/// Worker pool without the HTTP front; shares the same build.
pub async fn run_worker(config: Config) -> Result<(), AnyError> {
    let Runtime { state, worker_ctx, failure_rx } = build(config)?;
    let background = spawn_background(&state, worker_ctx, failure_rx, true);
    info!("PixeLift worker pool running");

    shutdown_signal().await;
    for handle in background {
        handle.abort();
    }
    state.docs.persist()?;
    Ok(())
}

fn spawn_background(
    state: &AppState,
    worker_ctx: Arc<WorkerContext>,
    failure_rx: UnboundedReceiver<TerminalFailure>,
    with_workers: bool,
) -> Vec<tokio::task::JoinHandle<()>> {
    let mut handles = Vec::new();

    // The one terminal-failure subscriber
    let writer = DeadLetterWriter::new(
        Arc::clone(&state.docs),
        Arc::clone(&state.credits),
        Arc::clone(&state.metrics),
    );
    handles.push(writer.spawn(failure_rx));

    handles.push(state.engine.spawn_stalled_scanner(state.config.jobs.stalled_check_ms));

    if with_workers {
        handles.extend(spawn_workers(worker_ctx, state.config.jobs.worker_concurrency));
    }

    handles.push(spawn_maintenance(state.clone()));
    handles
}

/// Hourly retention pass over documents and blobs
fn spawn_maintenance(state: AppState) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(3600));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // immediate first tick consumed
        loop {
            ticker.tick().await;
            let retention = &state.config.retention;
            if let Err(e) = state
                .docs
                .prune_expired(retention.jobs_ttl_days, retention.dead_letter_ttl_days)
            {
                error!(error = %e, "Document retention pass failed");
            }
            let blob = &state.config.blob;
            if let Err(e) = state
                .blobs
                .prune(blob.originals_retention_days, blob.results_retention_days)
                .await
            {
                error!(error = %e, "Blob retention pass failed");
            }
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install signal handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
