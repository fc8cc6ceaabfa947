use crate::humanize::ByteSize;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Top-level configuration
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub credits: CreditsConfig,
    #[serde(default)]
    pub blob: BlobConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub moderation: ModerationConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub health: HealthConfig,
}

/// HTTP server + on-disk state location
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,
    /// Root for the fjall keyspaces (documents, queue, shared KV)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Base used when minting signed blob URLs
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: ByteSize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            data_dir: default_data_dir(),
            public_base_url: default_public_base_url(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

fn default_bind_addr() -> SocketAddr {
    "0.0.0.0:8080".parse().expect("static addr")
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_public_base_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_max_upload_bytes() -> ByteSize {
    ByteSize(10 << 20)
}

/// Queue, retry, worker, and stream cadence knobs (`JOBS_*` env names)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JobsConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_jitter")]
    pub backoff_jitter: f64,
    #[serde(default = "default_remove_on_complete")]
    pub remove_on_complete: usize,
    #[serde(default = "default_remove_on_fail")]
    pub remove_on_fail: usize,
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,
    #[serde(default = "default_stalled_check_ms")]
    pub stalled_check_ms: u64,
    #[serde(default = "default_sse_heartbeat_ms")]
    pub sse_heartbeat_ms: u64,
    /// Soft deadline per pipeline stage
    #[serde(default = "default_stage_timeout_ms")]
    pub stage_timeout_ms: u64,
    /// Hard deadline for one whole task; expiry is a transient failure
    #[serde(default = "default_task_timeout_ms")]
    pub task_timeout_ms: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_jitter: default_backoff_jitter(),
            remove_on_complete: default_remove_on_complete(),
            remove_on_fail: default_remove_on_fail(),
            worker_concurrency: default_worker_concurrency(),
            stalled_check_ms: default_stalled_check_ms(),
            sse_heartbeat_ms: default_sse_heartbeat_ms(),
            stage_timeout_ms: default_stage_timeout_ms(),
            task_timeout_ms: default_task_timeout_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_backoff_jitter() -> f64 {
    0.3
}

fn default_remove_on_complete() -> usize {
    100
}

fn default_remove_on_fail() -> usize {
    500
}

fn default_worker_concurrency() -> usize {
    2
}

fn default_stalled_check_ms() -> u64 {
    10_000
}

fn default_sse_heartbeat_ms() -> u64 {
    30_000
}

fn default_stage_timeout_ms() -> u64 {
    60_000
}

fn default_task_timeout_ms() -> u64 {
    180_000
}

/// Fixed-window token buckets per user id and per peer address
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_user_limit")]
    pub user_limit: u32,
    #[serde(default = "default_user_interval_secs")]
    pub user_interval_secs: u64,
    #[serde(default = "default_ip_limit")]
    pub ip_limit: u32,
    #[serde(default = "default_ip_interval_secs")]
    pub ip_interval_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            user_limit: default_user_limit(),
            user_interval_secs: default_user_interval_secs(),
            ip_limit: default_ip_limit(),
            ip_interval_secs: default_ip_interval_secs(),
        }
    }
}

fn default_user_limit() -> u32 {
    120
}

fn default_user_interval_secs() -> u64 {
    60
}

fn default_ip_limit() -> u32 {
    100
}

fn default_ip_interval_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CreditsConfig {
    /// Free restorations per user per UTC calendar day
    #[serde(default = "default_free_daily_limit")]
    pub free_daily_limit: u32,
    /// Paid credits one restoration costs
    #[serde(default = "default_job_cost")]
    pub job_cost: i64,
}

impl Default for CreditsConfig {
    fn default() -> Self {
        Self {
            free_daily_limit: default_free_daily_limit(),
            job_cost: default_job_cost(),
        }
    }
}

fn default_free_daily_limit() -> u32 {
    3
}

fn default_job_cost() -> i64 {
    1
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BlobConfig {
    #[serde(default = "default_signed_url_ttl")]
    pub upload_ttl_seconds: u64,
    #[serde(default = "default_signed_url_ttl")]
    pub download_ttl_seconds: u64,
    #[serde(default = "default_originals_retention_days")]
    pub originals_retention_days: u32,
    #[serde(default = "default_results_retention_days")]
    pub results_retention_days: u32,
    /// HMAC key for signed URLs; environment only, never the TOML file
    #[serde(skip)]
    pub signing_secret: Option<String>,
}

impl Default for BlobConfig {
    fn default() -> Self {
        Self {
            upload_ttl_seconds: default_signed_url_ttl(),
            download_ttl_seconds: default_signed_url_ttl(),
            originals_retention_days: default_originals_retention_days(),
            results_retention_days: default_results_retention_days(),
            signing_secret: None,
        }
    }
}

fn default_signed_url_ttl() -> u64 {
    900
}

fn default_originals_retention_days() -> u32 {
    7
}

fn default_results_retention_days() -> u32 {
    30
}

/// Which implementation backs an external collaborator seam
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CollaboratorMode {
    /// In-process development implementation
    #[default]
    Dev,
    /// Remote HTTP service
    Http,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct AuthConfig {
    #[serde(default)]
    pub mode: CollaboratorMode,
    pub endpoint: Option<String>,
    /// Verifier credentials; environment only
    #[serde(skip)]
    pub credentials: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ModerationConfig {
    #[serde(default)]
    pub mode: CollaboratorMode,
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ProviderConfig {
    #[serde(default)]
    pub mode: CollaboratorMode,
    pub endpoint: Option<String>,
    /// Provider API key; environment only
    #[serde(skip)]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetentionConfig {
    #[serde(default = "default_jobs_ttl_days")]
    pub jobs_ttl_days: u32,
    #[serde(default = "default_dead_letter_ttl_days")]
    pub dead_letter_ttl_days: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            jobs_ttl_days: default_jobs_ttl_days(),
            dead_letter_ttl_days: default_dead_letter_ttl_days(),
        }
    }
}

fn default_jobs_ttl_days() -> u32 {
    30
}

fn default_dead_letter_ttl_days() -> u32 {
    30
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthConfig {
    #[serde(default = "default_metric_sample_size")]
    pub metric_sample_size: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            metric_sample_size: default_metric_sample_size(),
        }
    }
}

fn default_metric_sample_size() -> usize {
    1000
}
