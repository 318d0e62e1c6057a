//! Processing job models for background pipeline tracking.
//!
//! A `ProcessingJob` records one pipeline invocation over a document: its
//! status, stage-level progress, retry counters, and the metadata blob that
//! carries partial progress across worker crashes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::progress::StageProgress;

/// Type of processing job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    /// Full document pipeline (OCR through timeline).
    DocumentProcessing,
    Ocr,
    Validation,
    Chunking,
    Embedding,
    EntityExtraction,
    AliasResolution,
    DateExtraction,
    EventClassification,
    EntityLinking,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DocumentProcessing => "DOCUMENT_PROCESSING",
            Self::Ocr => "OCR",
            Self::Validation => "VALIDATION",
            Self::Chunking => "CHUNKING",
            Self::Embedding => "EMBEDDING",
            Self::EntityExtraction => "ENTITY_EXTRACTION",
            Self::AliasResolution => "ALIAS_RESOLUTION",
            Self::DateExtraction => "DATE_EXTRACTION",
            Self::EventClassification => "EVENT_CLASSIFICATION",
            Self::EntityLinking => "ENTITY_LINKING",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "DOCUMENT_PROCESSING" => Some(Self::DocumentProcessing),
            "OCR" => Some(Self::Ocr),
            "VALIDATION" => Some(Self::Validation),
            "CHUNKING" => Some(Self::Chunking),
            "EMBEDDING" => Some(Self::Embedding),
            "ENTITY_EXTRACTION" => Some(Self::EntityExtraction),
            "ALIAS_RESOLUTION" => Some(Self::AliasResolution),
            "DATE_EXTRACTION" => Some(Self::DateExtraction),
            "EVENT_CLASSIFICATION" => Some(Self::EventClassification),
            "ENTITY_LINKING" => Some(Self::EntityLinking),
            _ => None,
        }
    }
}

/// Processing job status.
///
/// `Completed`, `Failed`, `Cancelled`, and `Skipped` are absorbing: once a
/// job reaches one of them, only an explicit user retry moves it back to
/// `Queued`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
    Skipped,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
            Self::Skipped => "SKIPPED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "QUEUED" => Some(Self::Queued),
            "PROCESSING" => Some(Self::Processing),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            "CANCELLED" => Some(Self::Cancelled),
            "SKIPPED" => Some(Self::Skipped),
            _ => None,
        }
    }

    /// Whether this status is terminal (absorbing).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Skipped
        )
    }
}

/// Status of one stage within a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "IN_PROGRESS" => Some(Self::InProgress),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            "SKIPPED" => Some(Self::Skipped),
            _ => None,
        }
    }
}

/// Job metadata blob persisted as JSON on the job row.
///
/// Known keys are typed; anything else a caller stores survives round-trips
/// through `extra`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobMetadata {
    /// Per-stage partial progress, keyed by stage name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub partial_progress: BTreeMap<String, StageProgress>,
    /// How many times a sweeper has re-queued this job.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub recovery_attempts: u32,
    /// When the most recent recovery happened.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_recovery_at: Option<DateTime<Utc>>,
    /// The stage the job was in when it was last recovered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovered_from_stage: Option<String>,
    /// Free-form keys preserved for forward compatibility.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

impl JobMetadata {
    /// Parse from a raw JSON string, tolerating null/empty columns.
    pub fn from_json(raw: Option<&str>) -> Self {
        raw.and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or_default()
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// A persistent record of one pipeline invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingJob {
    /// Job UUID.
    pub id: String,
    /// Matter this job belongs to.
    pub matter_id: String,
    /// Document UUID (None for matter-level jobs).
    pub document_id: Option<String>,
    pub job_type: JobType,
    pub status: JobStatus,
    /// Current stage name while processing.
    pub current_stage: Option<String>,
    /// Total stages in the pipeline (7 for document processing).
    pub total_stages: u32,
    pub completed_stages: u32,
    /// Overall progress 0..=100.
    pub progress_pct: u8,
    pub estimated_completion: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    /// Machine-readable error code.
    pub error_code: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub metadata: JobMetadata,
    /// Liveness marker written by the owning worker while active.
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProcessingJob {
    /// The timestamp the stale-job sweeper should judge liveness by:
    /// the heartbeat when present, otherwise the last update.
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.heartbeat_at.unwrap_or(self.updated_at)
    }
}

/// Sparse patch applied through `JobRepository::update`.
///
/// `None` fields are left untouched. Option-of-Option fields distinguish
/// "leave alone" from "set to NULL".
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub current_stage: Option<Option<String>>,
    pub completed_stages: Option<u32>,
    pub progress_pct: Option<u8>,
    pub estimated_completion: Option<Option<DateTime<Utc>>>,
    pub error_message: Option<Option<String>>,
    pub error_code: Option<Option<String>>,
    pub retry_count: Option<u32>,
    pub started_at: Option<Option<DateTime<Utc>>>,
    pub completed_at: Option<Option<DateTime<Utc>>>,
    pub metadata: Option<JobMetadata>,
}

/// Append-mostly stage history entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStageHistory {
    pub id: String,
    pub job_id: String,
    pub stage_name: String,
    pub status: StageStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Queue statistics per matter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub queued: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub skipped: u64,
    /// Mean wall-clock time of completed jobs in milliseconds.
    pub avg_processing_time_ms: u64,
}

/// Compact job representation for list responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobListItem {
    pub id: String,
    pub matter_id: String,
    pub document_id: Option<String>,
    pub job_type: JobType,
    pub status: JobStatus,
    pub current_stage: Option<String>,
    pub progress_pct: u8,
    pub estimated_completion: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<&ProcessingJob> for JobListItem {
    fn from(job: &ProcessingJob) -> Self {
        Self {
            id: job.id.clone(),
            matter_id: job.matter_id.clone(),
            document_id: job.document_id.clone(),
            job_type: job.job_type,
            status: job.status,
            current_stage: job.current_stage.clone(),
            progress_pct: job.progress_pct,
            estimated_completion: job.estimated_completion,
            retry_count: job.retry_count,
            error_message: job.error_message.clone(),
            created_at: job.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(JobStatus::Skipped.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
    }

    #[test]
    fn test_status_round_trip() {
        for s in [
            JobStatus::Queued,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
            JobStatus::Skipped,
        ] {
            assert_eq!(JobStatus::from_str(s.as_str()), Some(s));
        }
        assert_eq!(JobStatus::from_str("RUNNING"), None);
    }

    #[test]
    fn test_metadata_preserves_unknown_keys() {
        let raw = r#"{"recovery_attempts":2,"batch_label":"import-7"}"#;
        let meta = JobMetadata::from_json(Some(raw));
        assert_eq!(meta.recovery_attempts, 2);
        assert_eq!(
            meta.extra.get("batch_label").and_then(|v| v.as_str()),
            Some("import-7")
        );

        let back: JobMetadata = serde_json::from_str(&meta.to_json()).unwrap();
        assert_eq!(
            back.extra.get("batch_label").and_then(|v| v.as_str()),
            Some("import-7")
        );
    }

    #[test]
    fn test_last_activity_prefers_heartbeat() {
        let updated = Utc::now();
        let beat = updated + chrono::Duration::seconds(90);
        let mut job = sample_job();
        job.updated_at = updated;
        job.heartbeat_at = Some(beat);
        assert_eq!(job.last_activity(), beat);

        job.heartbeat_at = None;
        assert_eq!(job.last_activity(), updated);
    }

    fn sample_job() -> ProcessingJob {
        let now = Utc::now();
        ProcessingJob {
            id: "job-1".into(),
            matter_id: "m-1".into(),
            document_id: Some("doc-1".into()),
            job_type: JobType::DocumentProcessing,
            status: JobStatus::Queued,
            current_stage: None,
            total_stages: 7,
            completed_stages: 0,
            progress_pct: 0,
            estimated_completion: None,
            error_message: None,
            error_code: None,
            retry_count: 0,
            max_retries: 3,
            metadata: JobMetadata::default(),
            heartbeat_at: None,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}
