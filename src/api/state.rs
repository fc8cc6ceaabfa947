use std::sync::Arc;

use crate::auth::TokenVerifier;
use crate::blob::BlobStore;
use crate::config::Config;
use crate::credits::CreditLedger;
use crate::docstore::FjallDocStore;
use crate::idempotency::IdempotencyStore;
use crate::kv::DegradingKv;
use crate::moderation::ModerationService;
use crate::observability::{LatencySampler, Metrics};
use crate::queue::QueueEngine;
use crate::ratelimit::RateLimiter;

/// Composition root handed to every handler. No global state anywhere;
/// tests assemble one of these from in-memory pieces.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub docs: Arc<FjallDocStore>,
    pub kv: Arc<DegradingKv>,
    pub blobs: Arc<BlobStore>,
    pub engine: Arc<QueueEngine>,
    pub credits: Arc<CreditLedger>,
    pub limiter: Arc<RateLimiter>,
    pub idempotency: Arc<IdempotencyStore>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub moderation: Arc<dyn ModerationService>,
    pub metrics: Arc<Metrics>,
    pub latency: Arc<LatencySampler>,
}

/// Request id generated or echoed by the context middleware; becomes the
/// problem document's `instance`.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);
