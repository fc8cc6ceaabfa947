//! Generative image provider collaborator
//!
//! One opaque call: enhanced prompt + image in, restored image plus billing
//! metadata out. Retries are provider-local (3 attempts, 30% jitter) through
//! the shared backoff helper; the queue engine's own retry budget sits above
//! this and treats exhaustion as a transient task failure.

use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use serde::Deserialize;
use thiserror::Error;

use crate::retry::{RetryPolicy, with_backoff};

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Transient(String),

    #[error("provider rejected the request: {0}")]
    Permanent(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }
}

/// Restored image plus the provider's billing metadata
#[derive(Debug, Clone)]
pub struct Restoration {
    pub image: Bytes,
    pub request_id: String,
    pub billed_units: u32,
    pub estimated_cost: f64,
}

#[async_trait]
pub trait RestorationProvider: Send + Sync {
    async fn restore(&self, prompt: &str, image: &[u8]) -> Result<Restoration, ProviderError>;
}

/// HTTP provider client with request-level retries
pub struct HttpRestorationProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    retry: RetryPolicy,
}

impl HttpRestorationProvider {
    pub fn new(endpoint: String, api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
            api_key,
            retry: RetryPolicy::new(3, 1000, 0.3),
        }
    }

    async fn restore_once(&self, prompt: &str, image: &[u8]) -> Result<Restoration, ProviderError> {
        #[derive(Deserialize)]
        struct ProviderResponse {
            image_b64: String,
            request_id: String,
            #[serde(default)]
            billed_units: u32,
            #[serde(default)]
            estimated_cost: f64,
        }

        let body = serde_json::json!({
            "prompt": prompt,
            "image_b64": base64::engine::general_purpose::STANDARD.encode(image),
        });

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ProviderError::Transient(format!("provider returned {status}")));
        }
        if !status.is_success() {
            return Err(ProviderError::Permanent(format!("provider returned {status}")));
        }

        let parsed: ProviderResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Transient(e.to_string()))?;
        let image = base64::engine::general_purpose::STANDARD
            .decode(&parsed.image_b64)
            .map_err(|e| ProviderError::Permanent(format!("undecodable image payload: {e}")))?;

        Ok(Restoration {
            image: Bytes::from(image),
            request_id: parsed.request_id,
            billed_units: parsed.billed_units,
            estimated_cost: parsed.estimated_cost,
        })
    }
}

#[async_trait]
impl RestorationProvider for HttpRestorationProvider {
    async fn restore(&self, prompt: &str, image: &[u8]) -> Result<Restoration, ProviderError> {
        with_backoff(&self.retry, "provider.restore", ProviderError::is_transient, || {
            self.restore_once(prompt, image)
        })
        .await
    }
}

/// Scripted provider for development and tests
pub struct MockProvider {
    behavior: MockBehavior,
    calls: std::sync::atomic::AtomicU32,
}

pub enum MockBehavior {
    /// Echo the input back as the "restored" image
    Echo,
    /// Fail transiently for the first `n` calls, then echo
    TransientFailures(u32),
    /// Fail transiently forever
    AlwaysTransient,
}

impl MockProvider {
    pub fn echo() -> Self {
        Self { behavior: MockBehavior::Echo, calls: Default::default() }
    }

    pub fn failing_first(n: u32) -> Self {
        Self { behavior: MockBehavior::TransientFailures(n), calls: Default::default() }
    }

    pub fn always_failing() -> Self {
        Self { behavior: MockBehavior::AlwaysTransient, calls: Default::default() }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl RestorationProvider for MockProvider {
    async fn restore(&self, _prompt: &str, image: &[u8]) -> Result<Restoration, ProviderError> {
        let call = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
        let fail = match self.behavior {
            MockBehavior::Echo => false,
            MockBehavior::TransientFailures(n) => call <= n,
            MockBehavior::AlwaysTransient => true,
        };
        if fail {
            return Err(ProviderError::Transient(format!("simulated outage (call {call})")));
        }
        Ok(Restoration {
            image: Bytes::copy_from_slice(image),
            request_id: format!("mock-{call}"),
            billed_units: 1,
            estimated_cost: 0.01,
        })
    }
}
