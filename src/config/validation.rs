use super::models::{CollaboratorMode, Config};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("missing required secret {name}: {purpose} (set the {name} environment variable)")]
    MissingSecret { name: &'static str, purpose: &'static str },

    #[error("missing endpoint for {collaborator} in http mode")]
    MissingEndpoint { collaborator: &'static str },

    #[error("{field} must be {requirement}, got {value}")]
    OutOfRange {
        field: &'static str,
        requirement: &'static str,
        value: String,
    },
}

/// Startup validation. Secrets are only demanded for collaborators that are
/// actually configured to call out; the dev implementations need none.
pub fn validate(config: &Config) -> Result<(), ValidationError> {
    if config.jobs.max_attempts == 0 {
        return Err(ValidationError::OutOfRange {
            field: "jobs.max_attempts",
            requirement: "at least 1",
            value: config.jobs.max_attempts.to_string(),
        });
    }

    if config.jobs.worker_concurrency == 0 {
        return Err(ValidationError::OutOfRange {
            field: "jobs.worker_concurrency",
            requirement: "at least 1",
            value: config.jobs.worker_concurrency.to_string(),
        });
    }

    if !(0.0..1.0).contains(&config.jobs.backoff_jitter) {
        return Err(ValidationError::OutOfRange {
            field: "jobs.backoff_jitter",
            requirement: "within [0, 1)",
            value: config.jobs.backoff_jitter.to_string(),
        });
    }

    if config.credits.job_cost < 1 {
        return Err(ValidationError::OutOfRange {
            field: "credits.job_cost",
            requirement: "at least 1",
            value: config.credits.job_cost.to_string(),
        });
    }

    if config.provider.mode == CollaboratorMode::Http {
        if config.provider.endpoint.is_none() {
            return Err(ValidationError::MissingEndpoint { collaborator: "provider" });
        }
        if config.provider.api_key.is_none() {
            return Err(ValidationError::MissingSecret {
                name: "PROVIDER_API_KEY",
                purpose: "authenticates calls to the generative image provider",
            });
        }
    }

    if config.auth.mode == CollaboratorMode::Http {
        if config.auth.endpoint.is_none() {
            return Err(ValidationError::MissingEndpoint { collaborator: "token verifier" });
        }
        if config.auth.credentials.is_none() {
            return Err(ValidationError::MissingSecret {
                name: "TOKEN_VERIFIER_CREDENTIALS",
                purpose: "authenticates calls to the token verifier",
            });
        }
    }

    if config.moderation.mode == CollaboratorMode::Http && config.moderation.endpoint.is_none() {
        return Err(ValidationError::MissingEndpoint { collaborator: "moderation" });
    }

    // Dev mode mints a process-local signing key; production must pin one so
    // URLs survive restarts and replicas agree.
    let any_http = [config.provider.mode, config.auth.mode, config.moderation.mode]
        .contains(&CollaboratorMode::Http);
    if any_http && config.blob.signing_secret.is_none() {
        return Err(ValidationError::MissingSecret {
            name: "BLOB_SIGNING_SECRET",
            purpose: "signs time-limited upload and download URLs",
        });
    }

    Ok(())
}
