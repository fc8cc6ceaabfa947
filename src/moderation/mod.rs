//! Content-moderation collaborator
//!
//! Narrow contract: image bytes in, verdict out. The fail-closed policy
//! (treat a moderation outage as a rejection) is applied by the admission
//! path, not here; this seam only reports what happened.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModerationError {
    #[error("moderation request failed: {0}")]
    Request(String),

    #[error("moderation response malformed: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModerationVerdict {
    pub allowed: bool,
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default)]
    pub rejection: Option<String>,
}

impl ModerationVerdict {
    pub fn allow() -> Self {
        Self { allowed: true, flags: Vec::new(), rejection: None }
    }

    pub fn reject(flags: Vec<String>, reason: impl Into<String>) -> Self {
        Self { allowed: false, flags, rejection: Some(reason.into()) }
    }
}

#[derive(Debug, Clone)]
pub struct ModerationContext {
    pub owner_id: String,
    pub request_id: String,
}

#[async_trait]
pub trait ModerationService: Send + Sync {
    async fn moderate(
        &self,
        image: &[u8],
        ctx: &ModerationContext,
    ) -> Result<ModerationVerdict, ModerationError>;
}

/// Remote classifier over HTTP
pub struct HttpModeration {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpModeration {
    pub fn new(endpoint: String) -> Self {
        Self { client: reqwest::Client::new(), endpoint }
    }
}

#[derive(Serialize)]
struct ModerationRequest<'a> {
    image_b64: String,
    owner_id: &'a str,
    request_id: &'a str,
}

#[async_trait]
impl ModerationService for HttpModeration {
    async fn moderate(
        &self,
        image: &[u8],
        ctx: &ModerationContext,
    ) -> Result<ModerationVerdict, ModerationError> {
        use base64::Engine;

        let body = ModerationRequest {
            image_b64: base64::engine::general_purpose::STANDARD.encode(image),
            owner_id: &ctx.owner_id,
            request_id: &ctx.request_id,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| ModerationError::Request(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ModerationError::Request(format!(
                "moderation service returned {}",
                response.status()
            )));
        }

        response
            .json::<ModerationVerdict>()
            .await
            .map_err(|e| ModerationError::Malformed(e.to_string()))
    }
}

/// Development / test implementation with a scripted outcome
pub struct StaticModeration {
    outcome: StaticOutcome,
}

enum StaticOutcome {
    Verdict(ModerationVerdict),
    Error(String),
}

impl StaticModeration {
    pub fn allow_all() -> Self {
        Self { outcome: StaticOutcome::Verdict(ModerationVerdict::allow()) }
    }

    pub fn rejecting(flags: Vec<String>, reason: impl Into<String>) -> Self {
        Self { outcome: StaticOutcome::Verdict(ModerationVerdict::reject(flags, reason)) }
    }

    /// Simulates a moderation outage; admission must treat this as unsafe.
    pub fn erroring(message: impl Into<String>) -> Self {
        Self { outcome: StaticOutcome::Error(message.into()) }
    }
}

#[async_trait]
impl ModerationService for StaticModeration {
    async fn moderate(
        &self,
        _image: &[u8],
        _ctx: &ModerationContext,
    ) -> Result<ModerationVerdict, ModerationError> {
        match &self.outcome {
            StaticOutcome::Verdict(v) => Ok(v.clone()),
            StaticOutcome::Error(msg) => Err(ModerationError::Request(msg.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ModerationContext {
        ModerationContext { owner_id: "dev-user-a".into(), request_id: "req-1".into() }
    }

    #[tokio::test]
    async fn static_verdicts_pass_through() {
        let allow = StaticModeration::allow_all();
        assert!(allow.moderate(b"img", &ctx()).await.unwrap().allowed);

        let reject = StaticModeration::rejecting(vec!["violence".into()], "unsafe");
        let verdict = reject.moderate(b"img", &ctx()).await.unwrap();
        assert!(!verdict.allowed);
        assert_eq!(verdict.flags, vec!["violence"]);
        assert_eq!(verdict.rejection.as_deref(), Some("unsafe"));
    }

    #[tokio::test]
    async fn erroring_surface_as_errors() {
        let broken = StaticModeration::erroring("timeout");
        assert!(broken.moderate(b"img", &ctx()).await.is_err());
    }
}
