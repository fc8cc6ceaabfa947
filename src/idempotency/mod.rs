//! Idempotent admission replay
//!
//! Maps (owner id, client key) to the canonical first response for 24
//! hours. The entry records exactly what the API returned (status, the
//! minimal header set, and the body), so retries replay byte-for-byte.
//! Length- and hop-by-hop headers are excluded so framework recomputation
//! cannot invalidate the replay. Only final statuses in [200, 499] are
//! cached; 5xx responses stay retryable.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

use crate::kv::{AtomicKv, KvError};

const TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Headers that never participate in replay
const EXCLUDED_HEADERS: [&str; 4] = ["content-length", "transfer-encoding", "connection", "date"];

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("Idempotency-Key header is required")]
    Missing,

    #[error("Idempotency-Key must be a canonical UUID")]
    Malformed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredResponse {
    pub fingerprint: String,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    body_b64: String,
    pub created_at: DateTime<Utc>,
}

impl StoredResponse {
    pub fn new(fingerprint: String, status: u16, headers: Vec<(String, String)>, body: &[u8]) -> Self {
        let headers = headers
            .into_iter()
            .filter(|(name, _)| !EXCLUDED_HEADERS.contains(&name.to_ascii_lowercase().as_str()))
            .collect();
        Self {
            fingerprint,
            status,
            headers,
            body_b64: BASE64.encode(body),
            created_at: Utc::now(),
        }
    }

    pub fn body(&self) -> Vec<u8> {
        BASE64.decode(&self.body_b64).unwrap_or_default()
    }
}

/// Validates the client key: canonical hyphenated 128-bit textual form,
/// nothing else. One character off is a 400, not a guess.
pub fn validate_key(raw: Option<&str>) -> Result<Uuid, KeyError> {
    let raw = raw.ok_or(KeyError::Missing)?;
    let uuid = Uuid::try_parse(raw).map_err(|_| KeyError::Malformed)?;
    if raw != uuid.hyphenated().to_string() {
        return Err(KeyError::Malformed);
    }
    Ok(uuid)
}

/// Stable hash over method, path, and the canonicalized body
pub fn fingerprint(method: &str, path: &str, canonical_body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(method.as_bytes());
    hasher.update(b"\n");
    hasher.update(path.as_bytes());
    hasher.update(b"\n");
    hasher.update(canonical_body);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

pub struct IdempotencyStore {
    kv: Arc<dyn AtomicKv>,
}

impl IdempotencyStore {
    pub fn new(kv: Arc<dyn AtomicKv>) -> Self {
        Self { kv }
    }

    fn entry_key(owner_id: &str, key: Uuid) -> String {
        format!("idem:{owner_id}:{key}")
    }

    pub async fn get(&self, owner_id: &str, key: Uuid) -> Result<Option<StoredResponse>, KvError> {
        let Some(bytes) = self.kv.record_get(&Self::entry_key(owner_id, key)).await? else {
            return Ok(None);
        };
        Ok(serde_json::from_slice(&bytes).ok())
    }

    /// Writes the canonical response iff its status belongs in the cache.
    pub async fn put(
        &self,
        owner_id: &str,
        key: Uuid,
        response: &StoredResponse,
    ) -> Result<(), KvError> {
        if !(200..500).contains(&response.status) {
            return Ok(());
        }
        let bytes = serde_json::to_vec(response)?;
        self.kv.record_put(&Self::entry_key(owner_id, key), &bytes, TTL).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;

    fn store() -> IdempotencyStore {
        IdempotencyStore::new(Arc::new(MemoryKv::new()))
    }

    #[test]
    fn canonical_keys_only() {
        let canonical = "0192d3a4-9b7c-7def-8123-456789abcdef";
        assert!(validate_key(Some(canonical)).is_ok());

        assert!(matches!(validate_key(None), Err(KeyError::Missing)));
        // One character off
        assert!(matches!(
            validate_key(Some("0192d3a4-9b7c-7def-8123-456789abcde")),
            Err(KeyError::Malformed)
        ));
        // Uppercase is not the canonical textual form
        assert!(matches!(
            validate_key(Some("0192D3A4-9B7C-7DEF-8123-456789ABCDEF")),
            Err(KeyError::Malformed)
        ));
        // Unhyphenated simple form rejected
        assert!(matches!(
            validate_key(Some("0192d3a49b7c7def8123456789abcdef")),
            Err(KeyError::Malformed)
        ));
    }

    #[test]
    fn fingerprint_is_stable_and_sensitive() {
        let a = fingerprint("POST", "/jobs", b"body");
        let b = fingerprint("POST", "/jobs", b"body");
        let c = fingerprint("POST", "/jobs", b"different");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn excluded_headers_are_dropped() {
        let stored = StoredResponse::new(
            "fp".into(),
            202,
            vec![
                ("Location".into(), "/jobs/x".into()),
                ("Content-Length".into(), "123".into()),
                ("content-type".into(), "application/json".into()),
            ],
            b"{}",
        );
        assert_eq!(stored.headers.len(), 2);
        assert!(stored.headers.iter().all(|(n, _)| n.to_ascii_lowercase() != "content-length"));
    }

    #[tokio::test]
    async fn round_trip_preserves_bytes() {
        let store = store();
        let key = Uuid::now_v7();
        let stored = StoredResponse::new("fp".into(), 202, vec![], b"exact-bytes");
        store.put("u1", key, &stored).await.unwrap();

        let loaded = store.get("u1", key).await.unwrap().unwrap();
        assert_eq!(loaded.status, 202);
        assert_eq!(loaded.body(), b"exact-bytes");
        assert_eq!(loaded.fingerprint, "fp");

        // Scoped per owner
        assert!(store.get("u2", key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn server_errors_are_not_cached() {
        let store = store();
        let key = Uuid::now_v7();
        let stored = StoredResponse::new("fp".into(), 500, vec![], b"boom");
        store.put("u1", key, &stored).await.unwrap();
        assert!(store.get("u1", key).await.unwrap().is_none());

        let conflict = StoredResponse::new("fp".into(), 409, vec![], b"conflict");
        store.put("u1", key, &conflict).await.unwrap();
        assert!(store.get("u1", key).await.unwrap().is_some());
    }
}
