//! Shared test harness: an AppState over in-memory collaborators and
//! temp-dir fjall stores, plus request builders.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, header};
use image::{Rgb, RgbImage};
use tempfile::TempDir;
use tokio::sync::RwLock;
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

use pixelift::api::state::AppState;
use pixelift::auth::DevTokenVerifier;
use pixelift::blob::BlobStore;
use pixelift::config::Config;
use pixelift::credits::CreditLedger;
use pixelift::docstore::FjallDocStore;
use pixelift::idempotency::IdempotencyStore;
use pixelift::kv::{AtomicKv, DegradingKv, MemoryKv};
use pixelift::moderation::{ModerationService, StaticModeration};
use pixelift::observability::{LatencySampler, Metrics};
use pixelift::queue::{EngineConfig, FjallQueue, QueueEngine, TerminalFailure};
use pixelift::ratelimit::RateLimiter;

pub const USER_TOKEN: &str = "dev-user-alice";
pub const OTHER_TOKEN: &str = "dev-user-bob";

pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub failure_rx: Option<UnboundedReceiver<TerminalFailure>>,
    _tmp: TempDir,
}

pub fn build_app(
    configure: impl FnOnce(&mut Config),
    moderation: Arc<dyn ModerationService>,
) -> TestApp {
    let tmp = TempDir::new().expect("temp dir");

    // Defaults come from the same serde path the TOML file uses
    let mut config: Config = toml::from_str("").expect("empty config");
    // Fast retries so failure scenarios finish quickly
    config.jobs.backoff_base_ms = 1;
    config.jobs.backoff_jitter = 0.0;
    config.jobs.stalled_check_ms = 10_000;
    configure(&mut config);

    let docs = Arc::new(FjallDocStore::open(tmp.path().join("docs")).expect("docstore"));
    let primary: Arc<dyn AtomicKv> = Arc::new(MemoryKv::new());
    let kv = Arc::new(DegradingKv::new(primary));
    let kv_dyn: Arc<dyn AtomicKv> = kv.clone();

    let queue = Arc::new(RwLock::new(FjallQueue::open(tmp.path().join("queue")).expect("queue")));
    let metrics = Arc::new(Metrics::new());
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
    let blobs = Arc::new(BlobStore::in_memory("http://localhost:8080", "test-secret"));

    let state = AppState {
        config: Arc::new(config),
        docs,
        kv,
        blobs,
        engine,
        credits,
        limiter,
        idempotency,
        verifier: Arc::new(DevTokenVerifier),
        moderation,
        metrics,
        latency: Arc::new(LatencySampler::new(64)),
    };

    TestApp {
        router: pixelift::api::router(state.clone()),
        state,
        failure_rx: Some(failure_rx),
        _tmp: tmp,
    }
}

pub fn default_app() -> TestApp {
    build_app(|_| {}, Arc::new(StaticModeration::allow_all()))
}

/// Small valid JPEG produced through the real encoder
pub fn sample_jpeg(width: u32, height: u32) -> Vec<u8> {
    let img = image::DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x % 251) as u8, (y % 241) as u8, ((x + y) % 239) as u8])
    }));
    let mut out = Vec::new();
    let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, 85);
    encoder.encode_image(&img.to_rgb8()).expect("jpeg encode");
    out
}

pub const MULTIPART_BOUNDARY: &str = "pixelift-test-boundary";

pub fn multipart_body(image: &[u8], prompt: Option<&str>) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{MULTIPART_BOUNDARY}\r\n").as_bytes());
    body.extend_from_slice(
        b"Content-Disposition: form-data; name=\"image\"; filename=\"photo.jpg\"\r\n",
    );
    body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
    body.extend_from_slice(image);
    body.extend_from_slice(b"\r\n");
    if let Some(prompt) = prompt {
        body.extend_from_slice(format!("--{MULTIPART_BOUNDARY}\r\n").as_bytes());
        body.extend_from_slice(b"Content-Disposition: form-data; name=\"prompt\"\r\n\r\n");
        body.extend_from_slice(prompt.as_bytes());
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{MULTIPART_BOUNDARY}--\r\n").as_bytes());
    body
}

pub fn submit_request(token: &str, idempotency_key: &str, body: Vec<u8>) -> Request<Body> {
    Request::builder()
        .uri("/jobs")
        .method("POST")
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .header("Idempotency-Key", idempotency_key)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={MULTIPART_BOUNDARY}"),
        )
        .header("x-forwarded-for", "203.0.113.9")
        .body(Body::from(body))
        .expect("request")
}

pub fn get_request(token: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .method("GET")
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .header("x-forwarded-for", "203.0.113.9")
        .body(Body::empty())
        .expect("request")
}

pub fn new_key() -> String {
    Uuid::now_v7().hyphenated().to_string()
}

pub async fn body_json(response: axum::response::Response) -> serde_json::Value {
    use http_body_util::BodyExt;
    let bytes = response.into_body().collect().await.expect("body").to_bytes();
    serde_json::from_slice(&bytes).expect("json body")
}

/// Poll the record until it reaches a terminal status.
pub async fn wait_for_terminal(
    docs: &FjallDocStore,
    job_id: Uuid,
    deadline: Duration,
) -> pixelift::api::models::JobRecord {
    let started = std::time::Instant::now();
    loop {
        if let Some(record) = docs.get_job(job_id).expect("get job") {
            if record.is_terminal() {
                return record;
            }
        }
        assert!(started.elapsed() < deadline, "job {job_id} did not reach a terminal status");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
