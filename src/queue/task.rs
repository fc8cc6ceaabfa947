use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::models::CreditInfo;
use crate::trace::TraceContext;

/// One unit of restoration work, persisted at admission and consumed by a
/// worker. Tasks carry a blob reference only; inline image bytes are
/// written to blob storage before enqueueing, never through the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreTask {
    pub job_id: Uuid,
    pub owner_id: String,
    /// Trimmed user prompt; empty prompts are absent
    #[serde(default)]
    pub prompt: Option<String>,
    /// Preprocessed source image, owner-scoped
    pub source_object: String,
    /// Format the user originally submitted (classifier hint)
    pub source_format: String,
    /// Flags moderation attached at admission
    #[serde(default)]
    pub moderation_flags: Vec<String>,
    /// What admission debited, for the record and terminal compensation
    pub credit: CreditInfo,
    #[serde(default)]
    pub trace: TraceContext,
    /// Present when an operator replayed this task from the dead letter
    #[serde(default)]
    pub replay: Option<ReplayMarker>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayMarker {
    pub original_job_id: Uuid,
    pub dead_letter_id: String,
    pub previous_attempts: u32,
    pub reason: String,
}
