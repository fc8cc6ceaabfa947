use super::models::Config;
use config::{ConfigError, Environment, File};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::warn;

const CONFIG_ENV_VAR: &str = "PIXELIFT_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config/pixelift.toml";
const ENV_PREFIX: &str = "PIXELIFT";
const ENV_SEPARATOR: &str = "__";

/// Load configuration from all sources, lowest to highest priority:
/// 1. Defaults embedded in the structs
/// 2. TOML file (if present)
/// 3. `.env` file (via dotenvy)
/// 4. `PIXELIFT__<section>__<key>` environment variables
/// 5. The flat deployment variables (`JOBS_*`, `RATE_LIMIT_*`, ...)
/// 6. Secrets (environment only, never the TOML file)
pub fn load() -> Result<Config, ConfigError> {
    let _ = dotenvy::dotenv();

    let config_path = env::var(CONFIG_ENV_VAR)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));

    let mut config = load_from_sources(config_path)?;
    apply_flat_overrides(&mut config);
    load_secrets(&mut config);
    Ok(config)
}

pub fn load_from_sources(config_path: PathBuf) -> Result<Config, ConfigError> {
    let mut builder = config::Config::builder();

    if config_path.exists() {
        tracing::info!("Loading configuration from: {}", config_path.display());
        builder = builder.add_source(File::from(config_path).required(false));
    } else {
        warn!(
            "Configuration file not found at {}, using defaults and environment overrides",
            config_path.display()
        );
    }

    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .separator(ENV_SEPARATOR)
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}

fn env_value<T: FromStr>(name: &str) -> Option<T> {
    let raw = env::var(name).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(name, raw = %raw, "Ignoring unparseable environment override");
            None
        }
    }
}

/// The flat variable names the deployment environment sets, applied on top
/// of the layered sources.
fn apply_flat_overrides(config: &mut Config) {
    macro_rules! take {
        ($name:literal => $slot:expr) => {
            if let Some(value) = env_value($name) {
                $slot = value;
            }
        };
    }

    take!("JOBS_MAX_ATTEMPTS" => config.jobs.max_attempts);
    take!("JOBS_BACKOFF_BASE_MS" => config.jobs.backoff_base_ms);
    take!("JOBS_BACKOFF_JITTER" => config.jobs.backoff_jitter);
    take!("JOBS_REMOVE_ON_COMPLETE" => config.jobs.remove_on_complete);
    take!("JOBS_REMOVE_ON_FAIL" => config.jobs.remove_on_fail);
    take!("JOBS_WORKER_CONCURRENCY" => config.jobs.worker_concurrency);
    take!("JOBS_STALLED_CHECK_MS" => config.jobs.stalled_check_ms);
    take!("JOBS_SSE_HEARTBEAT_MS" => config.jobs.sse_heartbeat_ms);

    take!("RATE_LIMIT_USER_LIMIT" => config.rate_limit.user_limit);
    take!("RATE_LIMIT_USER_INTERVAL" => config.rate_limit.user_interval_secs);
    take!("RATE_LIMIT_IP_LIMIT" => config.rate_limit.ip_limit);
    take!("RATE_LIMIT_IP_INTERVAL" => config.rate_limit.ip_interval_secs);

    take!("GCS_UPLOAD_TTL_SECONDS" => config.blob.upload_ttl_seconds);
    take!("GCS_DOWNLOAD_TTL_SECONDS" => config.blob.download_ttl_seconds);
    take!("UPLOAD_RETENTION_DAYS" => config.blob.originals_retention_days);
    take!("RESULT_RETENTION_DAYS" => config.blob.results_retention_days);

    take!("HEALTH_METRIC_SAMPLE_SIZE" => config.health.metric_sample_size);
}

/// Secrets come from the environment only
fn load_secrets(config: &mut Config) {
    if let Ok(key) = env::var("PROVIDER_API_KEY") {
        config.provider.api_key = Some(key);
    }
    if let Ok(credentials) = env::var("TOKEN_VERIFIER_CREDENTIALS") {
        config.auth.credentials = Some(credentials);
    }
    if let Ok(secret) = env::var("BLOB_SIGNING_SECRET") {
        config.blob.signing_secret = Some(secret);
    }
}
