//! HTTP handlers
//!
//! Thin orchestration over the admission pipeline, the status surface, and
//! the health probes. Every handler resolves its request id from the
//! context middleware and renders failures as problem documents.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use crate::kv::AtomicKv;

use axum::Extension;
use axum::body::Body;
use axum::extract::{ConnectInfo, Path, Query, Request, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use super::admission::{self, authenticate};
use super::error::ApiError;
use super::models::{DownloadInfo, JobProjection, JobRecord, JobStatus, UploadTargetResponse};
use super::state::{AppState, RequestId};
use crate::blob::BlobError;
use crate::ratelimit::RateDecision;

/// `GET /uploads/signed-url?contentType=...`
#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    #[serde(rename = "contentType")]
    pub content_type: String,
}

pub async fn issue_upload_target(
    State(state): State<AppState>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    Query(query): Query<UploadQuery>,
    headers: axum::http::HeaderMap,
) -> Response {
    let result = async {
        let user = authenticate(&state, &headers).await?;
        let target = state
            .blobs
            .issue_upload_url(&user.user_id, &query.content_type)
            .map_err(|e| match e {
                BlobError::UnsupportedContentType(ct) => ApiError::UnsupportedMediaType(ct),
                other => ApiError::Internal(other.to_string()),
            })?;
        let body = UploadTargetResponse {
            upload_url: target.upload_url,
            object_name: target.object_name,
            expires_at: target.expires_at,
            content_type: target.content_type,
        };
        Ok::<_, ApiError>(json_response(StatusCode::OK, &body, &request_id))
    }
    .await;
    unwrap_or_problem(result, &request_id)
}

/// `POST /jobs`
pub async fn submit_job(State(state): State<AppState>, request: Request) -> Response {
    let request_id = request_id_of(&request);
    let peer = peer_of(&request);

    // Admission runs detached so a peer disconnect cannot cancel it between
    // the credit debit and the enqueue; the sequence always settles, with
    // its own compensation on failure.
    let admission_state = state.clone();
    let admission_request_id = request_id.clone();
    let task = tokio::spawn(async move {
        let mut rate: Option<RateDecision> = None;
        let result =
            admission::admit(&admission_state, request, &peer, &admission_request_id, &mut rate)
                .await;
        (result, rate)
    });

    let (result, rate) = match task.await {
        Ok(outcome) => outcome,
        Err(e) => (Err(crate::api::error::ApiError::Internal(e.to_string())), None),
    };
    let mut response = match result {
        Ok(response) => response,
        Err(err) => err.into_problem(&request_id),
    };

    if let Some(decision) = rate {
        apply_rate_headers(&mut response, &decision);
    }
    if !response.headers().contains_key("x-request-id") {
        if let Ok(value) = request_id.parse() {
            response.headers_mut().insert("x-request-id", value);
        }
    }
    response
}

/// `GET /jobs/{id}`. Foreign and missing jobs share the same 404 shape.
pub async fn get_job(
    State(state): State<AppState>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    Path(id): Path<String>,
    headers: axum::http::HeaderMap,
) -> Response {
    let result = async {
        let user = authenticate(&state, &headers).await?;
        let record = owned_job(&state, &user.user_id, &id)?;
        let projection = project(&state, &record)?;
        Ok::<_, ApiError>(json_response(StatusCode::OK, &projection, &request_id))
    }
    .await;
    unwrap_or_problem(result, &request_id)
}

/// `GET /health/live`
pub async fn health_live() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// `GET /health/ready`: 503 when a hard dependency is down, 200 with a
/// degraded flag when the shared KV fell back to the in-process store.
pub async fn health_ready(State(state): State<AppState>) -> Response {
    let docs_ok = state.docs.health_check().is_ok();
    let queue_ok = state.engine.health_check().await;
    let blobs_ok = state.blobs.health_check();
    let degraded = state.kv.is_degraded();

    let mut components = BTreeMap::new();
    components.insert("document_store", if docs_ok { "healthy" } else { "down" });
    components.insert("queue", if queue_ok { "healthy" } else { "down" });
    components.insert("blob_store", if blobs_ok { "healthy" } else { "down" });
    components.insert("shared_kv", state.kv.backend());

    let hard_down = !docs_ok || !queue_ok || !blobs_ok;
    let status = if hard_down {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    let body = json!({
        "status": if hard_down { "unavailable" } else if degraded { "degraded" } else { "ok" },
        "degraded": degraded,
        "components": components,
        "latency": state.latency.summary(),
        "metrics": state.metrics.snapshot(),
        "version": env!("CARGO_PKG_VERSION"),
    });

    let mut response = (status, axum::Json(body)).into_response();
    if hard_down {
        if let Ok(value) = "30".parse() {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
    }
    response
}

// --- shared helpers ---

pub(crate) fn owned_job(
    state: &AppState,
    user_id: &str,
    raw_id: &str,
) -> Result<JobRecord, ApiError> {
    let job_id = Uuid::parse_str(raw_id).map_err(|_| ApiError::NotFound)?;
    let record = state.docs.get_job(job_id)?.ok_or(ApiError::NotFound)?;
    if record.owner_id != user_id {
        return Err(ApiError::NotFound);
    }
    Ok(record)
}

/// Owner projection; succeeded jobs get a freshly minted download URL.
pub(crate) fn project(state: &AppState, record: &JobRecord) -> Result<JobProjection, ApiError> {
    let download = match (&record.status, &record.result_object) {
        (JobStatus::Succeeded, Some(object)) => {
            let filename = format!("restored-{}.jpg", record.job_id);
            let signed = state
                .blobs
                .issue_download_url(&record.owner_id, object, &filename)
                .map_err(|e| ApiError::Internal(e.to_string()))?;
            Some(DownloadInfo { url: signed.url, expires_at: signed.expires_at, filename })
        }
        _ => None,
    };
    Ok(record.projection(download))
}

pub(crate) fn json_response<T: serde::Serialize>(
    status: StatusCode,
    body: &T,
    request_id: &str,
) -> Response {
    let bytes = serde_json::to_vec(body).unwrap_or_else(|_| b"{}".to_vec());
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::CACHE_CONTROL, "no-store")
        .header("x-request-id", request_id)
        .body(Body::from(bytes))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

fn unwrap_or_problem(result: Result<Response, ApiError>, request_id: &str) -> Response {
    match result {
        Ok(response) => response,
        Err(err) => err.into_problem(request_id),
    }
}

pub(crate) fn request_id_of(request: &Request) -> String {
    if let Some(RequestId(id)) = request.extensions().get::<RequestId>() {
        return id.clone();
    }
    request
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

/// Peer address: trusted forwarding header first, then the socket.
pub(crate) fn peer_of(request: &Request) -> String {
    if let Some(forwarded) = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return forwarded.to_string();
    }
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn apply_rate_headers(response: &mut Response, decision: &RateDecision) {
    let headers = response.headers_mut();
    let pairs = [
        ("RateLimit-Limit", decision.limit.to_string()),
        ("RateLimit-Remaining", decision.remaining.to_string()),
        ("RateLimit-Reset", decision.reset_secs.to_string()),
    ];
    for (name, value) in pairs {
        if !headers.contains_key(name) {
            if let Ok(value) = value.parse() {
                headers.insert(name, value);
            }
        }
    }
}
