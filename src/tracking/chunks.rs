//! OCR chunk progress aggregation into job progress.

use std::sync::Arc;

use crate::models::{ChunkProgress, JobStatus, JobUpdate};
use crate::repository::{ChunkRepository, Result};

use super::JobTracker;

/// Human-facing chunk failure string. `chunk_index` is 0-based internally
/// and displayed 1-based.
pub fn format_chunk_failure_message(
    chunk_index: u32,
    page_start: u32,
    page_end: u32,
    error_message: &str,
) -> String {
    format!(
        "Chunk {} (pages {}-{}) failed: {}",
        chunk_index + 1,
        page_start,
        page_end,
        error_message
    )
}

/// Rolls per-chunk completion into the owning job's stage label and
/// progress percentage.
pub struct ChunkProgressTracker {
    tracker: JobTracker,
    chunks: Arc<ChunkRepository>,
}

impl ChunkProgressTracker {
    pub fn new(tracker: JobTracker, chunks: Arc<ChunkRepository>) -> Self {
        Self { tracker, chunks }
    }

    /// Recompute chunk progress for a document and write it to the job.
    ///
    /// The OCR fan-out owns the 0..=94 band; the merge step claims 95.
    pub async fn update(&self, job_id: &str, document_id: &str) -> Result<ChunkProgress> {
        let progress = self.chunks.progress(document_id)?;
        let pct = progress.pct().min(94);
        let stage = format!("OCR ({}/{} chunks)", progress.completed, progress.total);

        self.tracker
            .update(
                job_id,
                JobUpdate {
                    status: Some(JobStatus::Processing),
                    current_stage: Some(Some(stage)),
                    progress_pct: Some(pct),
                    ..Default::default()
                },
            )
            .await?;

        Ok(progress)
    }
}
