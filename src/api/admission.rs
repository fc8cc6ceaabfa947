//! `POST /jobs` admission
//!
//! The decision path is a sequence of explicit stages, each returning an
//! immutable value consumed by the next: authenticate, rate-limit,
//! validate the idempotency key, decode the payload, preprocess, moderate
//! (fail-closed), consult the idempotency store, debit credits, create the
//! record, store the image, enqueue, cache the canonical 202. The first
//! failing stage short-circuits with a typed error; failures after the
//! debit compensate with a refund before surfacing.

use axum::body::Body;
use axum::extract::{FromRequest, Multipart, Request};
use axum::http::{HeaderMap, header};
use axum::response::Response;
use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::{error, warn};
use uuid::Uuid;

use crate::api::error::ApiError;
use crate::api::models::{BlobSubmission, BlobSource, JobAcceptedResponse, JobRecord, JobStatus};
use crate::api::state::AppState;
use crate::auth::VerifiedUser;
use crate::blob::{BlobError, BlobStore};
use crate::docstore::ModerationAudit;
use crate::idempotency::{self, StoredResponse};
use crate::imageprep::{self, PrepError, PreparedImage};
use crate::moderation::{ModerationContext, ModerationVerdict};
use crate::queue::RestoreTask;
use crate::ratelimit::RateDecision;
use crate::trace::TraceContext;

/// Decoded submission, identical downstream for both input shapes
struct SubmissionPayload {
    image: Vec<u8>,
    prompt: Option<String>,
    /// Stable bytes fed to the fingerprint
    canonical: Vec<u8>,
}

pub async fn admit(
    state: &AppState,
    request: Request,
    peer: &str,
    request_id: &str,
    rate_out: &mut Option<RateDecision>,
) -> Result<Response, ApiError> {
    let headers = request.headers().clone();

    let user = authenticate(state, &headers).await?;

    let decision = state
        .limiter
        .check(&user.user_id, peer)
        .await
        .map_err(|e| ApiError::ServiceUnavailable(e.to_string()))?;
    *rate_out = Some(decision);
    if !decision.allowed {
        state.metrics.rate_limited();
        return Err(ApiError::RateLimited {
            limit: decision.limit,
            remaining: decision.remaining,
            reset_secs: decision.reset_secs,
            retry_after: decision.retry_after.unwrap_or(decision.reset_secs),
        });
    }

    let idem_key = idempotency::validate_key(
        headers.get("idempotency-key").and_then(|v| v.to_str().ok()),
    )?;

    let payload = decode_payload(state, &user, request).await?;

    let prepared = imageprep::prepare(&payload.image).map_err(|e| match e {
        PrepError::UnrecognizedFormat => {
            ApiError::UnsupportedMediaType("image must be JPEG, PNG, or WebP".to_string())
        }
        other => ApiError::InvalidPayload(other.to_string()),
    })?;

    let verdict = moderate_fail_closed(state, &user, request_id, &prepared).await;
    if !verdict.allowed {
        state.metrics.moderation_rejected();
        return Err(ApiError::ModerationRejected { categories: verdict.flags });
    }

    let fingerprint = idempotency::fingerprint("POST", "/jobs", &payload.canonical);
    if let Some(stored) = state.idempotency.get(&user.user_id, idem_key).await? {
        if stored.fingerprint == fingerprint {
            state.metrics.idempotent_replay();
            return Ok(response_from(&stored));
        }
        return Err(ApiError::IdempotencyConflict);
    }

    let job_id = Uuid::now_v7();
    let debit = state.credits.check_and_deduct(&user.user_id, job_id).await?;
    if !debit.allowed {
        state.metrics.credits_denied();
        return Err(ApiError::InsufficientCredits { remaining: debit.remaining_paid });
    }
    let credit = debit.credit.ok_or_else(|| {
        ApiError::Internal("allowed debit without credit info".to_string())
    })?;

    let now = Utc::now();
    let source_object = format!("uploads/{}/{}.jpg", user.user_id, job_id);
    let record = JobRecord::builder()
        .job_id(job_id)
        .owner_id(user.user_id.clone())
        .status(JobStatus::Queued)
        .created_at(now)
        .updated_at(now)
        .credit(credit)
        .maybe_prompt(payload.prompt.clone())
        .source_object(source_object.clone())
        .preprocessing(prepared.summary())
        .moderation(verdict.clone())
        .build();
    state.docs.insert_job(&record)?;

    if let Err(e) = state
        .blobs
        .put(&user.user_id, &source_object, prepared.jpeg.clone())
        .await
    {
        compensate(state, &user, job_id, "blob-upload", &e.to_string()).await;
        return Err(ApiError::Internal(format!("storing source image failed: {e}")));
    }

    let task = RestoreTask {
        job_id,
        owner_id: user.user_id.clone(),
        prompt: payload.prompt.clone(),
        source_object,
        source_format: prepared.source_format.as_str().to_string(),
        moderation_flags: verdict.flags.clone(),
        credit,
        trace: TraceContext::from_headers(&headers),
        replay: None,
    };
    if let Err(e) = state.engine.enqueue(task, None).await {
        compensate(state, &user, job_id, "enqueue", &e.to_string()).await;
        return Err(ApiError::Internal(format!("enqueue failed: {e}")));
    }

    let accepted = JobAcceptedResponse {
        job_id,
        status: JobStatus::Queued,
        credit,
        location: format!("/jobs/{job_id}"),
    };
    let body = serde_json::to_vec(&accepted)
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    let stored = StoredResponse::new(
        fingerprint,
        202,
        vec![
            ("content-type".to_string(), "application/json".to_string()),
            ("location".to_string(), accepted.location.clone()),
        ],
        &body,
    );
    if let Err(e) = state.idempotency.put(&user.user_id, idem_key, &stored).await {
        warn!(%job_id, error = %e, "Caching canonical response failed");
    }

    state.metrics.job_accepted();
    // Emit from the cached form so replays are byte-for-byte identical
    Ok(response_from(&stored))
}

pub async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<VerifiedUser, ApiError> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(ApiError::Unauthorized)?;
    Ok(state.verifier.verify(bearer).await?)
}

async fn decode_payload(
    state: &AppState,
    user: &VerifiedUser,
    request: Request,
) -> Result<SubmissionPayload, ApiError> {
    let max_bytes = state.config.server.max_upload_bytes.as_usize();
    let content_type = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    if content_type.starts_with("multipart/form-data") {
        decode_multipart(request, max_bytes).await
    } else if content_type.starts_with("application/json") {
        decode_blob_reference(state, user, request.into_body(), max_bytes).await
    } else {
        Err(ApiError::InvalidPayload(format!(
            "expected multipart/form-data or application/json, got {content_type:?}"
        )))
    }
}

async fn decode_multipart(
    request: Request,
    max_bytes: usize,
) -> Result<SubmissionPayload, ApiError> {
    let mut multipart = Multipart::from_request(request, &())
        .await
        .map_err(|e| ApiError::InvalidPayload(e.to_string()))?;

    let mut image: Option<Vec<u8>> = None;
    let mut prompt: Option<String> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::InvalidPayload(e.to_string()))?
    {
        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some("image") => {
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::InvalidPayload(e.to_string()))?;
                image = Some(data.to_vec());
            }
            Some("prompt") => {
                prompt = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| ApiError::InvalidPayload(e.to_string()))?,
                );
            }
            _ => {}
        }
    }

    let image = image
        .ok_or_else(|| ApiError::InvalidPayload("multipart body requires an image part".into()))?;
    // At the limit is admitted; one byte over is not
    if image.len() > max_bytes {
        return Err(ApiError::FileTooLarge { limit: max_bytes as u64 });
    }

    let prompt = normalize_prompt(prompt);
    let canonical = canonical_body("inline", &image_digest(&image), prompt.as_deref());
    Ok(SubmissionPayload { image, prompt, canonical })
}

async fn decode_blob_reference(
    state: &AppState,
    user: &VerifiedUser,
    body: Body,
    max_bytes: usize,
) -> Result<SubmissionPayload, ApiError> {
    let bytes = axum::body::to_bytes(body, 64 * 1024)
        .await
        .map_err(|e| ApiError::InvalidPayload(e.to_string()))?;
    let submission: BlobSubmission = serde_json::from_slice(&bytes)
        .map_err(|e| ApiError::InvalidPayload(format!("malformed body: {e}")))?;
    let BlobSource::Blob { object_name } = submission.source;

    if !BlobStore::is_owned_by(&object_name, &user.user_id) {
        return Err(ApiError::InvalidPayload("unknown blob object".into()));
    }
    let image = match state.blobs.download(&user.user_id, &object_name).await {
        Ok(data) => data,
        Err(BlobError::NotFound(_)) | Err(BlobError::NotOwned(_)) => {
            return Err(ApiError::InvalidPayload("unknown blob object".into()));
        }
        Err(e) => return Err(ApiError::Internal(e.to_string())),
    };
    if image.len() > max_bytes {
        return Err(ApiError::FileTooLarge { limit: max_bytes as u64 });
    }

    let prompt = normalize_prompt(submission.prompt);
    let canonical = canonical_body(&object_name, &image_digest(&image), prompt.as_deref());
    Ok(SubmissionPayload { image, prompt, canonical })
}

fn normalize_prompt(prompt: Option<String>) -> Option<String> {
    prompt.map(|p| p.trim().to_string()).filter(|p| !p.is_empty())
}

fn image_digest(image: &[u8]) -> String {
    let digest = Sha256::digest(image);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Canonicalized body for the fingerprint: input-shape independent of
/// multipart boundaries and JSON whitespace.
fn canonical_body(source: &str, image_sha256: &str, prompt: Option<&str>) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "source": source,
        "image_sha256": image_sha256,
        "prompt": prompt,
    }))
    .unwrap_or_default()
}

/// Moderation with the fail-closed policy: a service error is treated as a
/// rejection, and every non-allowed outcome is audited.
async fn moderate_fail_closed(
    state: &AppState,
    user: &VerifiedUser,
    request_id: &str,
    prepared: &PreparedImage,
) -> ModerationVerdict {
    let ctx = ModerationContext { owner_id: user.user_id.clone(), request_id: request_id.to_string() };
    let (verdict, fail_closed) = match state.moderation.moderate(&prepared.jpeg, &ctx).await {
        Ok(verdict) => (verdict, false),
        Err(e) => {
            warn!(error = %e, "Moderation unavailable, rejecting fail-closed");
            (
                ModerationVerdict::reject(
                    vec!["moderation-unavailable".to_string()],
                    "moderation service unavailable",
                ),
                true,
            )
        }
    };

    if !verdict.allowed {
        let audit = ModerationAudit {
            id: 0,
            owner_id: user.user_id.clone(),
            request_id: request_id.to_string(),
            verdict: verdict.clone(),
            fail_closed,
            created_at: Utc::now(),
        };
        if let Err(e) = state.docs.append_moderation_audit(audit) {
            error!(error = %e, "Moderation audit write failed");
        }
    }
    verdict
}

/// Failure after the debit: refund and mark the record failed before the
/// 500 goes out.
async fn compensate(state: &AppState, user: &VerifiedUser, job_id: Uuid, kind: &str, message: &str) {
    error!(%job_id, kind, message, "Admission failed after debit, compensating");
    if let Err(e) = state.credits.refund(&user.user_id, job_id, "admission failed").await {
        error!(%job_id, error = %e, "Compensating refund failed");
    }
    let kind = kind.to_string();
    let message = message.to_string();
    match state.docs.transition(job_id, move |record| {
        record.status = JobStatus::Failed;
        record.error = Some(crate::api::models::JobErrorInfo { kind, message });
    }) {
        Ok(_) => {}
        Err(e) => error!(%job_id, error = %e, "Marking job failed after admission error"),
    }
}

/// Build the HTTP response from a stored canonical response.
pub fn response_from(stored: &StoredResponse) -> Response {
    let mut builder = Response::builder().status(stored.status);
    for (name, value) in &stored.headers {
        builder = builder.header(name, value);
    }
    builder
        .header(header::CACHE_CONTROL, "no-store")
        .body(Body::from(stored.body()))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}
