//! Layered configuration
//!
//! Settings load from defaults, an optional TOML file, and the environment:
//!
//! - `PIXELIFT_CONFIG` points at the TOML file (default `config/pixelift.toml`)
//! - `PIXELIFT__<SECTION>__<KEY>` overrides any setting
//! - the flat deployment names (`JOBS_MAX_ATTEMPTS`, `RATE_LIMIT_USER_LIMIT`,
//!   `GCS_UPLOAD_TTL_SECONDS`, ...) are recognized verbatim
//! - secrets (`PROVIDER_API_KEY`, `TOKEN_VERIFIER_CREDENTIALS`,
//!   `BLOB_SIGNING_SECRET`) come from the environment only
//!
//! `Config::load` validates the result; a collaborator in `http` mode with
//! its secret missing aborts startup with a message naming the variable.

mod models;
mod sources;
mod validation;

pub use crate::humanize::ByteSize;
pub use models::{
    AuthConfig, BlobConfig, CollaboratorMode, Config, CreditsConfig, HealthConfig, JobsConfig,
    ModerationConfig, ProviderConfig, RateLimitConfig, RetentionConfig, ServerConfig,
};
pub use validation::ValidationError;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("configuration invalid: {0}")]
    Validation(#[from] ValidationError),
}

impl Config {
    /// Load and validate configuration from all sources.
    pub fn load() -> Result<Self, ConfigError> {
        let config = sources::load()?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Load from a specific TOML path; used by tests.
    pub fn load_from_path(path: std::path::PathBuf) -> Result<Self, ConfigError> {
        let config = sources::load_from_sources(path)?;
        validation::validate(&config)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn full_config_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("pixelift.toml");

        let toml_content = r#"
[server]
bind_addr = "0.0.0.0:8088"
data_dir = "var/pixelift"
public_base_url = "https://api.pixelift.example"
max_upload_bytes = "10MiB"

[jobs]
max_attempts = 5
backoff_base_ms = 1000
backoff_jitter = 0.3
worker_concurrency = 2

[rate_limit]
user_limit = 120
user_interval_secs = 60
ip_limit = 100
ip_interval_secs = 60

[credits]
free_daily_limit = 3
job_cost = 1

[blob]
upload_ttl_seconds = 900
download_ttl_seconds = 900

[retention]
jobs_ttl_days = 30
dead_letter_ttl_days = 30
        "#;
        fs::write(&config_path, toml_content).unwrap();

        let config = Config::load_from_path(config_path).unwrap();
        assert_eq!(config.server.bind_addr.to_string(), "0.0.0.0:8088");
        assert_eq!(config.server.public_base_url, "https://api.pixelift.example");
        assert_eq!(config.retention.dead_letter_ttl_days, 30);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("pixelift.toml");
        fs::write(&config_path, "[jobs]\nmax_attempts = 0\n").unwrap();

        let result = Config::load_from_path(config_path);
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }
}
