//! Job records and API data transfer types
//!
//! The [`JobRecord`] is the authoritative state of one restoration job,
//! owned by the control plane for its whole lifecycle. The API front writes
//! admission-owned fields (credit, moderation, preprocessing); workers merge
//! in pipeline results through the document store's guarded transitions and
//! never overwrite a terminal status.
//!
//! Clients see only the [`JobProjection`], which adds a freshly minted
//! download URL for succeeded jobs and hides internal bookkeeping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::moderation::ModerationVerdict;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    /// Succeeded and failed are terminal; no transition leaves them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CreditKind {
    Free,
    Paid,
}

/// What admission debited for this job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditInfo {
    pub amount: i64,
    pub kind: CreditKind,
}

/// The seven degradation categories the classifier scores
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DegradationKind {
    Blur,
    Noise,
    LowLight,
    Compression,
    Scratch,
    Fade,
    ColorShift,
}

impl DegradationKind {
    pub const ALL: [DegradationKind; 7] = [
        DegradationKind::Blur,
        DegradationKind::Noise,
        DegradationKind::LowLight,
        DegradationKind::Compression,
        DegradationKind::Scratch,
        DegradationKind::Fade,
        DegradationKind::ColorShift,
    ];
}

/// Frozen classifier output: kind → confidence in [0, 1]
pub type DegradationMap = BTreeMap<DegradationKind, f32>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTimings {
    pub classify_ms: u64,
    pub prompt_ms: u64,
    pub restore_ms: u64,
    pub total_ms: u64,
}

/// What preprocessing did to the submitted image
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreprocessSummary {
    pub source_format: String,
    pub width: u32,
    pub height: u32,
    pub operations: Vec<String>,
    pub color_profile: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderReceipt {
    pub request_id: String,
    pub billed_units: u32,
    pub estimated_cost: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobErrorInfo {
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, bon::Builder)]
pub struct JobRecord {
    pub job_id: Uuid,
    pub owner_id: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    #[builder(default)]
    pub attempts_made: u32,
    pub credit: CreditInfo,
    pub prompt: Option<String>,
    /// Preprocessed source image in blob storage, owner-scoped
    pub source_object: String,
    pub preprocessing: PreprocessSummary,
    pub moderation: ModerationVerdict,
    pub timings: Option<StageTimings>,
    pub classification: Option<DegradationMap>,
    pub enhanced_prompt: Option<String>,
    pub provider: Option<ProviderReceipt>,
    /// Present iff status = succeeded
    pub result_object: Option<String>,
    /// Present iff status = failed
    pub error: Option<JobErrorInfo>,
}

impl JobRecord {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Owner-facing view. `download` is minted by the caller for succeeded
    /// jobs only.
    pub fn projection(&self, download: Option<DownloadInfo>) -> JobProjection {
        JobProjection {
            job_id: self.job_id,
            status: self.status,
            created_at: self.created_at,
            updated_at: self.updated_at,
            credit: self.credit,
            prompt: self.prompt.clone(),
            enhanced_prompt: self.enhanced_prompt.clone(),
            timings: self.timings,
            classification: self.classification.clone(),
            moderation: ModerationSummary {
                allowed: self.moderation.allowed,
                flags: self.moderation.flags.clone(),
            },
            attempts_made: self.attempts_made,
            error: self.error.clone(),
            download,
        }
    }
}

/// Moderation fields safe to show the owner (no rejection internals)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModerationSummary {
    pub allowed: bool,
    pub flags: Vec<String>,
}

/// Time-limited signed download link for a succeeded job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadInfo {
    pub url: String,
    pub expires_at: DateTime<Utc>,
    pub filename: String,
}

/// `GET /jobs/{id}` response body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobProjection {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub credit: CreditInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enhanced_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timings: Option<StageTimings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classification: Option<DegradationMap>,
    pub moderation: ModerationSummary,
    pub attempts_made: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobErrorInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download: Option<DownloadInfo>,
}

/// `POST /jobs` 202 body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobAcceptedResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub credit: CreditInfo,
    pub location: String,
}

/// `GET /uploads/signed-url` response body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadTargetResponse {
    pub upload_url: String,
    pub object_name: String,
    pub expires_at: DateTime<Utc>,
    pub content_type: String,
}

/// Blob-reference submission body (the non-multipart `POST /jobs` shape)
#[derive(Debug, Clone, Deserialize)]
pub struct BlobSubmission {
    pub source: BlobSource,
    #[serde(default)]
    pub prompt: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BlobSource {
    Blob { object_name: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Succeeded.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }

    #[test]
    fn degradation_kind_serializes_kebab_case() {
        assert_eq!(
            serde_json::to_string(&DegradationKind::LowLight).unwrap(),
            "\"low-light\""
        );
        assert_eq!(
            serde_json::to_string(&DegradationKind::ColorShift).unwrap(),
            "\"color-shift\""
        );
    }

    #[test]
    fn blob_submission_parses() {
        let body = r#"{"source": {"type": "blob", "object_name": "uploads/u1/abc.jpg"}, "prompt": "restore"}"#;
        let parsed: BlobSubmission = serde_json::from_str(body).unwrap();
        let BlobSource::Blob { object_name } = parsed.source;
        assert_eq!(object_name, "uploads/u1/abc.jpg");
        assert_eq!(parsed.prompt.as_deref(), Some("restore"));
    }

    #[test]
    fn projection_hides_rejection_detail() {
        let record = sample_record(JobStatus::Succeeded);
        let projection = record.projection(None);
        assert!(projection.moderation.allowed);
        assert_eq!(projection.job_id, record.job_id);
    }

    fn sample_record(status: JobStatus) -> JobRecord {
        let now = Utc::now();
        JobRecord::builder()
            .job_id(Uuid::now_v7())
            .owner_id("dev-user-alice".to_string())
            .status(status)
            .created_at(now)
            .updated_at(now)
            .credit(CreditInfo { amount: 1, kind: CreditKind::Free })
            .source_object("uploads/dev-user-alice/img.jpg".to_string())
            .preprocessing(PreprocessSummary {
                source_format: "jpeg".into(),
                width: 512,
                height: 512,
                operations: vec!["resize".into()],
                color_profile: "srgb".into(),
            })
            .moderation(ModerationVerdict { allowed: true, flags: vec![], rejection: None })
            .build()
    }
}
