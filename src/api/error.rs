//! API error taxonomy and RFC 9457 problem documents
//!
//! Every error kind maps to a stable type URI, a title, and a status.
//! `into_problem` renders the document with the request id as `instance`
//! and attaches the per-kind extension fields and headers (RateLimit
//! values, Retry-After).

use axum::body::Body;
use axum::http::{StatusCode, header};
use axum::response::Response;
use serde_json::json;
use thiserror::Error;

use crate::auth::AuthError;
use crate::credits::CreditError;
use crate::docstore::DocError;
use crate::idempotency::KeyError;
use crate::kv::KvError;
use crate::queue::QueueError;

pub const PROBLEM_TYPE_BASE: &str = "https://pixelift.dev/problems";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("missing or invalid credential")]
    Unauthorized,

    #[error("resource not found")]
    NotFound,

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),

    #[error("Idempotency-Key header is required")]
    IdempotencyKeyMissing,

    #[error("Idempotency-Key must be a canonical UUID")]
    IdempotencyKeyInvalid,

    #[error("idempotency key reused with a different payload")]
    IdempotencyConflict,

    #[error("upload exceeds the {limit}-byte limit")]
    FileTooLarge { limit: u64 },

    #[error("submission rejected by content moderation")]
    ModerationRejected { categories: Vec<String> },

    #[error("insufficient credits")]
    InsufficientCredits { remaining: i64 },

    #[error("rate limit exceeded")]
    RateLimited { limit: u32, remaining: u32, reset_secs: u64, retry_after: u64 },

    #[error("not implemented")]
    NotImplemented,

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::InvalidPayload(_)
            | ApiError::IdempotencyKeyMissing
            | ApiError::IdempotencyKeyInvalid => StatusCode::BAD_REQUEST,
            ApiError::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ApiError::IdempotencyConflict => StatusCode::CONFLICT,
            ApiError::FileTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::ModerationRejected { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::InsufficientCredits { .. } => StatusCode::PAYMENT_REQUIRED,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::NotImplemented => StatusCode::NOT_IMPLEMENTED,
            ApiError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::Unauthorized => "unauthorized",
            ApiError::NotFound => "not-found",
            ApiError::InvalidPayload(_) => "invalid-payload",
            ApiError::UnsupportedMediaType(_) => "unsupported-media-type",
            ApiError::IdempotencyKeyMissing => "idempotency-key-missing",
            ApiError::IdempotencyKeyInvalid => "idempotency-key-invalid",
            ApiError::IdempotencyConflict => "idempotency-conflict",
            ApiError::FileTooLarge { .. } => "file-too-large",
            ApiError::ModerationRejected { .. } => "moderation-rejected",
            ApiError::InsufficientCredits { .. } => "insufficient-credits",
            ApiError::RateLimited { .. } => "rate-limit-exceeded",
            ApiError::NotImplemented => "not-implemented",
            ApiError::ServiceUnavailable(_) => "service-unavailable",
            ApiError::Internal(_) => "internal",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            ApiError::Unauthorized => "Unauthorized",
            ApiError::NotFound => "Not Found",
            ApiError::InvalidPayload(_) => "Invalid Payload",
            ApiError::UnsupportedMediaType(_) => "Unsupported Media Type",
            ApiError::IdempotencyKeyMissing => "Idempotency Key Missing",
            ApiError::IdempotencyKeyInvalid => "Idempotency Key Invalid",
            ApiError::IdempotencyConflict => "Idempotency Conflict",
            ApiError::FileTooLarge { .. } => "File Too Large",
            ApiError::ModerationRejected { .. } => "Moderation Rejected",
            ApiError::InsufficientCredits { .. } => "Insufficient Credits",
            ApiError::RateLimited { .. } => "Rate Limit Exceeded",
            ApiError::NotImplemented => "Not Implemented",
            ApiError::ServiceUnavailable(_) => "Service Unavailable",
            ApiError::Internal(_) => "Internal Server Error",
        }
    }

    /// Render the problem document. `request_id` becomes `instance` and is
    /// echoed in `X-Request-Id`.
    pub fn into_problem(self, request_id: &str) -> Response {
        let status = self.status();
        let mut body = json!({
            "type": format!("{PROBLEM_TYPE_BASE}/{}", self.kind()),
            "title": self.title(),
            "status": status.as_u16(),
            "detail": self.to_string(),
            "instance": request_id,
        });

        match &self {
            ApiError::InsufficientCredits { remaining } => {
                body["remaining_credits"] = json!(remaining);
            }
            ApiError::ModerationRejected { categories } => {
                body["categories"] = json!(categories);
            }
            ApiError::RateLimited { retry_after, .. } => {
                body["retry_after"] = json!(retry_after);
            }
            _ => {}
        }

        let mut builder = Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, "application/problem+json")
            .header(header::CACHE_CONTROL, "no-store")
            .header("x-request-id", request_id);

        match &self {
            ApiError::RateLimited { limit, remaining, reset_secs, retry_after } => {
                builder = builder
                    .header("RateLimit-Limit", limit.to_string())
                    .header("RateLimit-Remaining", remaining.to_string())
                    .header("RateLimit-Reset", reset_secs.to_string())
                    .header(header::RETRY_AFTER, retry_after.to_string());
            }
            ApiError::FileTooLarge { .. } => {
                builder = builder.header(header::RETRY_AFTER, "1");
            }
            ApiError::ServiceUnavailable(_) => {
                builder = builder.header(header::RETRY_AFTER, "30");
            }
            _ => {}
        }

        let bytes = serde_json::to_vec(&body).unwrap_or_else(|_| b"{}".to_vec());
        builder.body(Body::from(bytes)).unwrap_or_else(|_| {
            Response::new(Body::from("internal error"))
        })
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::MissingCredential | AuthError::InvalidCredential => ApiError::Unauthorized,
            AuthError::Unavailable(msg) => ApiError::ServiceUnavailable(msg),
        }
    }
}

impl From<KeyError> for ApiError {
    fn from(err: KeyError) -> Self {
        match err {
            KeyError::Missing => ApiError::IdempotencyKeyMissing,
            KeyError::Malformed => ApiError::IdempotencyKeyInvalid,
        }
    }
}

impl From<KvError> for ApiError {
    fn from(err: KvError) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl From<DocError> for ApiError {
    fn from(err: DocError) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl From<CreditError> for ApiError {
    fn from(err: CreditError) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        ApiError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_follow_the_taxonomy() {
        assert_eq!(ApiError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::InsufficientCredits { remaining: 0 }.status(), StatusCode::PAYMENT_REQUIRED);
        assert_eq!(ApiError::ModerationRejected { categories: vec![] }.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(ApiError::IdempotencyConflict.status(), StatusCode::CONFLICT);
        assert_eq!(ApiError::FileTooLarge { limit: 1 }.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn problem_document_shape() {
        let response = ApiError::InsufficientCredits { remaining: 2 }.into_problem("req-1");
        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/problem+json"
        );
        assert_eq!(response.headers().get("x-request-id").unwrap(), "req-1");
        assert_eq!(response.headers().get(header::CACHE_CONTROL).unwrap(), "no-store");

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let doc: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(doc["type"], format!("{PROBLEM_TYPE_BASE}/insufficient-credits"));
        assert_eq!(doc["title"], "Insufficient Credits");
        assert_eq!(doc["status"], 402);
        assert_eq!(doc["instance"], "req-1");
        assert_eq!(doc["remaining_credits"], 2);
    }

    #[test]
    fn rate_limited_carries_headers() {
        let response = ApiError::RateLimited { limit: 10, remaining: 0, reset_secs: 7, retry_after: 7 }
            .into_problem("req-2");
        assert_eq!(response.headers().get("RateLimit-Limit").unwrap(), "10");
        assert_eq!(response.headers().get("RateLimit-Remaining").unwrap(), "0");
        assert_eq!(response.headers().get("RateLimit-Reset").unwrap(), "7");
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "7");
    }
}
