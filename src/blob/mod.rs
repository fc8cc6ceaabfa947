//! Blob storage collaborator
//!
//! Wraps an `object_store` backend with owner-scoped object naming and
//! HMAC-signed, time-limited upload/download URLs. Object names are the
//! ownership boundary: `uploads/{user}/...` and `results/{user}/...`;
//! a reference outside the caller's own prefix never resolves.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, TimeZone, Utc};
use futures::TryStreamExt;
use hmac::{Hmac, Mac};
use object_store::{ObjectStore, path::Path as StoragePath};
use sha2::Sha256;
use thiserror::Error;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

pub const ALLOWED_CONTENT_TYPES: [&str; 3] = ["image/jpeg", "image/png", "image/webp"];

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("unsupported content type: {0}")]
    UnsupportedContentType(String),

    #[error("object not found: {0}")]
    NotFound(String),

    #[error("object {0} is not owned by the caller")]
    NotOwned(String),

    #[error("object store error: {0}")]
    Store(#[from] object_store::Error),
}

pub type Result<T> = std::result::Result<T, BlobError>;

/// Pre-signed upload target handed to the client
#[derive(Debug, Clone)]
pub struct UploadTarget {
    pub upload_url: String,
    pub object_name: String,
    pub expires_at: DateTime<Utc>,
    pub content_type: String,
}

/// Pre-signed download link for a stored object
#[derive(Debug, Clone)]
pub struct SignedDownload {
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct BlobStore {
    store: Arc<dyn ObjectStore>,
    public_base: String,
    signing_key: Vec<u8>,
    upload_ttl: Duration,
    download_ttl: Duration,
}

impl BlobStore {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        public_base: String,
        signing_secret: &str,
        upload_ttl: Duration,
        download_ttl: Duration,
    ) -> Self {
        Self {
            store,
            public_base: public_base.trim_end_matches('/').to_string(),
            signing_key: signing_secret.as_bytes().to_vec(),
            upload_ttl,
            download_ttl,
        }
    }

    /// In-memory backend for development and tests
    pub fn in_memory(public_base: &str, signing_secret: &str) -> Self {
        Self::new(
            Arc::new(object_store::memory::InMemory::new()),
            public_base.to_string(),
            signing_secret,
            Duration::from_secs(900),
            Duration::from_secs(900),
        )
    }

    pub fn is_owned_by(object_name: &str, user_id: &str) -> bool {
        object_name.starts_with(&format!("uploads/{user_id}/"))
            || object_name.starts_with(&format!("results/{user_id}/"))
    }

    fn extension_for(content_type: &str) -> &'static str {
        match content_type {
            "image/png" => "png",
            "image/webp" => "webp",
            _ => "jpg",
        }
    }

    pub fn upload_object_name(user_id: &str, content_type: &str) -> String {
        format!("uploads/{user_id}/{}.{}", Uuid::now_v7(), Self::extension_for(content_type))
    }

    pub fn result_object_name(user_id: &str, job_id: Uuid) -> String {
        format!("results/{user_id}/{job_id}.jpg")
    }

    /// Target for a direct client upload. 415-class failures surface as
    /// [`BlobError::UnsupportedContentType`].
    pub fn issue_upload_url(&self, user_id: &str, content_type: &str) -> Result<UploadTarget> {
        if !ALLOWED_CONTENT_TYPES.contains(&content_type) {
            return Err(BlobError::UnsupportedContentType(content_type.to_string()));
        }

        let object_name = Self::upload_object_name(user_id, content_type);
        let expires_at = Utc::now() + chrono::Duration::from_std(self.upload_ttl).expect("ttl fits");
        let signature = self.sign("put", &object_name, expires_at.timestamp());

        Ok(UploadTarget {
            upload_url: format!(
                "{}/blobs/{}?op=put&expires={}&sig={}",
                self.public_base,
                object_name,
                expires_at.timestamp(),
                signature
            ),
            object_name,
            expires_at,
            content_type: content_type.to_string(),
        })
    }

    pub fn issue_download_url(
        &self,
        user_id: &str,
        object_name: &str,
        filename: &str,
    ) -> Result<SignedDownload> {
        if !Self::is_owned_by(object_name, user_id) {
            return Err(BlobError::NotOwned(object_name.to_string()));
        }

        let expires_at =
            Utc::now() + chrono::Duration::from_std(self.download_ttl).expect("ttl fits");
        let signature = self.sign("get", object_name, expires_at.timestamp());

        Ok(SignedDownload {
            url: format!(
                "{}/blobs/{}?op=get&expires={}&sig={}&filename={}",
                self.public_base,
                object_name,
                expires_at.timestamp(),
                signature,
                filename
            ),
            expires_at,
        })
    }

    pub async fn put(&self, user_id: &str, object_name: &str, data: Vec<u8>) -> Result<()> {
        if !Self::is_owned_by(object_name, user_id) {
            return Err(BlobError::NotOwned(object_name.to_string()));
        }
        self.store.put(&StoragePath::from(object_name), data.into()).await?;
        tracing::debug!(object_name, "Stored blob");
        Ok(())
    }

    pub async fn download(&self, user_id: &str, object_name: &str) -> Result<Vec<u8>> {
        if !Self::is_owned_by(object_name, user_id) {
            return Err(BlobError::NotOwned(object_name.to_string()));
        }
        let result = match self.store.get(&StoragePath::from(object_name)).await {
            Ok(result) => result,
            Err(object_store::Error::NotFound { .. }) => {
                return Err(BlobError::NotFound(object_name.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(result.bytes().await?.to_vec())
    }

    pub async fn exists(&self, object_name: &str) -> Result<bool> {
        match self.store.head(&StoragePath::from(object_name)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub fn health_check(&self) -> bool {
        // The embedded backends cannot fail shallowly; a remote backend
        // would probe here.
        true
    }

    /// Lifecycle pass: originals and results are deleted after their
    /// retention windows.
    pub async fn prune(&self, originals_days: u32, results_days: u32) -> Result<usize> {
        let now = Utc::now();
        let mut removed = 0;

        for (prefix, days) in [("uploads", originals_days), ("results", results_days)] {
            let cutoff = now - chrono::Duration::days(i64::from(days));
            let prefix_path = StoragePath::from(prefix);
            let mut listing = self.store.list(Some(&prefix_path));
            while let Some(meta) = listing.try_next().await? {
                if meta.last_modified < cutoff {
                    self.store.delete(&meta.location).await?;
                    removed += 1;
                }
            }
        }

        if removed > 0 {
            tracing::info!(removed, "Pruned expired blobs");
        }
        Ok(removed)
    }

    fn sign(&self, op: &str, object_name: &str, expires_unix: i64) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.signing_key).expect("any key length");
        mac.update(op.as_bytes());
        mac.update(b"\n");
        mac.update(object_name.as_bytes());
        mac.update(b"\n");
        mac.update(expires_unix.to_string().as_bytes());
        URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
    }

    /// Validates a signature minted by [`Self::sign`]; expired links fail.
    pub fn verify_signature(
        &self,
        op: &str,
        object_name: &str,
        expires_unix: i64,
        signature: &str,
    ) -> bool {
        let not_expired = Utc.timestamp_opt(expires_unix, 0).single().is_some_and(|t| t > Utc::now());
        not_expired && self.sign(op, object_name, expires_unix) == signature
    }
}
