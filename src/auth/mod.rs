//! Token-verifier collaborator
//!
//! The verifier turns a bearer credential into a stable user identifier.
//! Verification failures all map to 401 at the API layer.

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing bearer credential")]
    MissingCredential,

    #[error("invalid credential")]
    InvalidCredential,

    #[error("verifier unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct VerifiedUser {
    pub user_id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub verified: bool,
}

#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, bearer: &str) -> Result<VerifiedUser, AuthError>;
}

/// Development verifier: accepts `dev-user-<id>` tokens, the token itself
/// becoming the user id.
pub struct DevTokenVerifier;

#[async_trait]
impl TokenVerifier for DevTokenVerifier {
    async fn verify(&self, bearer: &str) -> Result<VerifiedUser, AuthError> {
        let id_part = bearer.strip_prefix("dev-user-").ok_or(AuthError::InvalidCredential)?;
        if id_part.is_empty() || !id_part.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(AuthError::InvalidCredential);
        }
        Ok(VerifiedUser { user_id: bearer.to_string(), email: None, verified: true })
    }
}

/// Remote verifier over HTTP
pub struct HttpTokenVerifier {
    client: reqwest::Client,
    endpoint: String,
    credentials: String,
}

impl HttpTokenVerifier {
    pub fn new(endpoint: String, credentials: String) -> Self {
        Self { client: reqwest::Client::new(), endpoint, credentials }
    }
}

#[async_trait]
impl TokenVerifier for HttpTokenVerifier {
    async fn verify(&self, bearer: &str) -> Result<VerifiedUser, AuthError> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.credentials)
            .json(&serde_json::json!({ "token": bearer }))
            .send()
            .await
            .map_err(|e| AuthError::Unavailable(e.to_string()))?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(AuthError::InvalidCredential);
        }
        if !response.status().is_success() {
            return Err(AuthError::Unavailable(format!(
                "verifier returned {}",
                response.status()
            )));
        }

        let user: VerifiedUser = response
            .json()
            .await
            .map_err(|e| AuthError::Unavailable(e.to_string()))?;
        if !user.verified {
            return Err(AuthError::InvalidCredential);
        }
        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dev_verifier_accepts_dev_tokens() {
        let verifier = DevTokenVerifier;
        let user = verifier.verify("dev-user-alice").await.unwrap();
        assert_eq!(user.user_id, "dev-user-alice");
        assert!(user.verified);
    }

    #[tokio::test]
    async fn dev_verifier_rejects_other_tokens() {
        let verifier = DevTokenVerifier;
        assert!(verifier.verify("sk-live-123").await.is_err());
        assert!(verifier.verify("dev-user-").await.is_err());
        assert!(verifier.verify("dev-user-bad token").await.is_err());
    }
}
