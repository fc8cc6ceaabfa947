//! Fixed-window token buckets over the shared KV
//!
//! Two buckets guard admission, consulted in order: (user, id) then
//! (peer, address). One algorithm serves both; the in-process fallback is
//! the same code running over the degraded KV, not a second
//! implementation.

use std::sync::Arc;
use std::time::Duration;

use crate::config::RateLimitConfig;
use crate::kv::{AtomicKv, KvResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateScope {
    User,
    Peer,
}

impl RateScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateScope::User => "user",
            RateScope::Peer => "peer",
        }
    }
}

/// Admission decision plus the header values for the response. On deny the
/// values come from the denying bucket; on admit, from the user bucket.
#[derive(Debug, Clone, Copy)]
pub struct RateDecision {
    pub allowed: bool,
    pub scope: RateScope,
    pub limit: u32,
    pub remaining: u32,
    pub reset_secs: u64,
    /// Seconds the client should wait; present on deny only
    pub retry_after: Option<u64>,
}

pub struct RateLimiter {
    kv: Arc<dyn AtomicKv>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(kv: Arc<dyn AtomicKv>, config: RateLimitConfig) -> Self {
        Self { kv, config }
    }

    pub async fn check(&self, user_id: &str, peer_addr: &str) -> KvResult<RateDecision> {
        let now_ms = chrono::Utc::now().timestamp_millis() as u64;

        let user_state = self
            .kv
            .bucket_take(
                &format!("rl:user:{user_id}"),
                self.config.user_limit,
                Duration::from_secs(self.config.user_interval_secs),
            )
            .await?;
        if !user_state.admitted {
            let reset = user_state.reset_secs(now_ms);
            return Ok(RateDecision {
                allowed: false,
                scope: RateScope::User,
                limit: user_state.limit,
                remaining: user_state.remaining,
                reset_secs: reset,
                retry_after: Some(reset),
            });
        }

        let peer_state = self
            .kv
            .bucket_take(
                &format!("rl:peer:{peer_addr}"),
                self.config.ip_limit,
                Duration::from_secs(self.config.ip_interval_secs),
            )
            .await?;
        if !peer_state.admitted {
            let reset = peer_state.reset_secs(now_ms);
            return Ok(RateDecision {
                allowed: false,
                scope: RateScope::Peer,
                limit: peer_state.limit,
                remaining: peer_state.remaining,
                reset_secs: reset,
                retry_after: Some(reset),
            });
        }

        Ok(RateDecision {
            allowed: true,
            scope: RateScope::User,
            limit: user_state.limit,
            remaining: user_state.remaining,
            reset_secs: user_state.reset_secs(now_ms),
            retry_after: None,
        })
    }
}
