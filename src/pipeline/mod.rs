//! Document processing pipeline: stage order, executor, orchestrator.

pub mod executor;
pub mod orchestrator;
pub mod stages;

pub use executor::{CancelToken, ItemFailurePolicy, StageContext, StageExecutor, StageHandler};
pub use orchestrator::PipelineOrchestrator;

use thiserror::Error;

use crate::external::ExternalError;

/// Ordered stages of the DOCUMENT_PROCESSING pipeline.
///
/// `timeline` covers date extraction, event classification, and entity
/// linking; the three remain individually addressable job types for
/// standalone runs.
pub const PIPELINE_STAGES: [&str; 7] = [
    "ocr",
    "validation",
    "chunking",
    "embedding",
    "entity_extraction",
    "alias_resolution",
    "timeline",
];

/// Index of a stage within the pipeline.
pub fn stage_index(stage: &str) -> Option<usize> {
    PIPELINE_STAGES.iter().position(|s| *s == stage)
}

/// Stage that follows `completed_stages` completed stages, if any remain.
pub fn stage_at(completed_stages: u32) -> Option<&'static str> {
    PIPELINE_STAGES.get(completed_stages as usize).copied()
}

/// Progress percentage at which a stage starts.
pub fn stage_floor_pct(index: usize, total_stages: u32) -> u8 {
    let total = total_stages.max(1) as usize;
    ((index.min(total) * 100) / total) as u8
}

/// Progress percentage a completed stage advances the job to.
pub fn stage_ceiling_pct(index: usize, total_stages: u32) -> u8 {
    let total = total_stages.max(1) as usize;
    (((index + 1).min(total) * 100) / total).min(100) as u8
}

/// Behavioural error categories for stage execution (spec'd by what the
/// orchestrator does with them, not by their source).
#[derive(Error, Debug, Clone)]
pub enum StageError {
    /// A specific item failed. `class` groups identical failures for poison
    /// pill detection.
    #[error("item {item_id} failed ({class}): {message}")]
    Item {
        item_id: String,
        class: String,
        message: String,
        retryable: bool,
    },
    /// The stage failed outside any particular item.
    #[error("stage failed: {message}")]
    Stage { message: String, retryable: bool },
    /// Dependency invariants are broken; no retry will help.
    #[error("fatal: {message}")]
    Fatal { message: String },
    /// Cooperative cancellation, or the job row moved under us
    /// (concurrency violation, treated the same way: drop current work).
    #[error("cancelled")]
    Cancelled,
}

impl StageError {
    pub fn retryable(&self) -> bool {
        match self {
            Self::Item { retryable, .. } | Self::Stage { retryable, .. } => *retryable,
            Self::Fatal { .. } | Self::Cancelled => false,
        }
    }

    /// Classify a provider error for one item at the executor boundary.
    pub fn from_external(item_id: &str, err: ExternalError) -> Self {
        match err {
            ExternalError::Transient(message) => Self::Item {
                item_id: item_id.to_string(),
                class: "TRANSIENT_EXTERNAL".to_string(),
                message,
                retryable: true,
            },
            ExternalError::Permanent(message) => Self::Item {
                item_id: item_id.to_string(),
                class: "PERMANENT".to_string(),
                message,
                retryable: false,
            },
        }
    }

    /// Machine-readable code stored on the job row when this error fails it.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Item { retryable: true, .. } | Self::Stage { retryable: true, .. } => {
                "STAGE_RETRIES_EXHAUSTED"
            }
            Self::Item { .. } => "STAGE_ITEM_FAILED",
            Self::Stage { .. } => "STAGE_FAILED",
            Self::Fatal { .. } => "JOB_FATAL",
            Self::Cancelled => "CANCELLED",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order_and_lookup() {
        assert_eq!(stage_at(0), Some("ocr"));
        assert_eq!(stage_at(3), Some("embedding"));
        assert_eq!(stage_at(7), None);
        assert_eq!(stage_index("alias_resolution"), Some(5));
        assert_eq!(stage_index("unknown"), None);
    }

    #[test]
    fn test_stage_pct_bands() {
        // 7-stage pipeline: ocr owns 0..14, completing it lands on 14.
        assert_eq!(stage_floor_pct(0, 7), 0);
        assert_eq!(stage_ceiling_pct(0, 7), 14);
        assert_eq!(stage_floor_pct(3, 7), 42);
        assert_eq!(stage_ceiling_pct(6, 7), 100);
    }

    #[test]
    fn test_external_classification() {
        let transient = StageError::from_external("c1", ExternalError::Transient("503".into()));
        assert!(transient.retryable());
        let permanent = StageError::from_external("c1", ExternalError::Permanent("bad pdf".into()));
        assert!(!permanent.retryable());
        assert!(!StageError::Cancelled.retryable());
    }
}
