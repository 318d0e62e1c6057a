//! OCR chunk coordinator.
//!
//! Large documents are split into page-range chunks processed in parallel by
//! the worker pool. Each chunk's completion rolls into job progress; when
//! the last chunk lands, the coordinator merges the per-chunk artifacts into
//! one document-wide OCR artifact and advances the pipeline.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::Settings;
use crate::external::{BlobStore, ExternalError, ExternalOcr};
use crate::models::{
    ChunkStatus, DocumentStatus, JobStatus, JobUpdate, OcrArtifact, OcrChunk, ProcessingJob,
    StageStatus,
};
use crate::pipeline::{stage_ceiling_pct, StageError};
use crate::queue::{Task, TaskQueue};
use crate::repository::{ChunkRepository, DocumentRepository, RepositoryError};
use crate::tracking::{format_chunk_failure_message, ChunkProgressTracker, JobTracker};

/// Progress percentage while merging chunk results. Chunk fan-out owns the
/// band below it.
const MERGE_PCT: u8 = 95;

/// What `run_ocr_stage` left behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OcrStageOutcome {
    /// Chunk tasks are dispatched; chunk completions drive the rest.
    InFlight,
    /// Every chunk was already merged (idempotent re-entry).
    AlreadyMerged,
}

/// Partition `[1..=page_count]` into chunk rows of `chunk_size` pages.
pub fn plan_chunks(
    matter_id: &str,
    document_id: &str,
    page_count: u32,
    chunk_size: u32,
) -> Vec<OcrChunk> {
    let chunk_size = chunk_size.max(1);
    let now = Utc::now();
    let mut chunks = Vec::new();
    let mut page_start = 1u32;
    let mut index = 0u32;
    while page_start <= page_count {
        let page_end = (page_start + chunk_size - 1).min(page_count);
        chunks.push(OcrChunk {
            id: Uuid::new_v4().to_string(),
            matter_id: matter_id.to_string(),
            document_id: document_id.to_string(),
            chunk_index: index,
            page_start,
            page_end,
            status: ChunkStatus::Pending,
            result_blob_path: None,
            result_checksum: None,
            created_at: now,
            updated_at: now,
        });
        page_start = page_end + 1;
        index += 1;
    }
    chunks
}

fn chunk_blob_path(matter_id: &str, document_id: &str, chunk_index: u32) -> String {
    format!("{matter_id}/{document_id}/ocr/chunks/{chunk_index}.json")
}

fn merged_blob_path(matter_id: &str, document_id: &str) -> String {
    format!("{matter_id}/{document_id}/ocr/merged.json")
}

pub struct OcrChunkCoordinator {
    tracker: JobTracker,
    chunks: Arc<ChunkRepository>,
    docs: Arc<DocumentRepository>,
    blob: Arc<dyn BlobStore>,
    ocr: Arc<dyn ExternalOcr>,
    queue: Arc<dyn TaskQueue>,
    settings: Arc<Settings>,
}

impl OcrChunkCoordinator {
    pub fn new(
        tracker: JobTracker,
        chunks: Arc<ChunkRepository>,
        docs: Arc<DocumentRepository>,
        blob: Arc<dyn BlobStore>,
        ocr: Arc<dyn ExternalOcr>,
        queue: Arc<dyn TaskQueue>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            tracker,
            chunks,
            docs,
            blob,
            ocr,
            queue,
            settings,
        }
    }

    fn progress_tracker(&self) -> ChunkProgressTracker {
        ChunkProgressTracker::new(self.tracker.clone(), self.chunks.clone())
    }

    /// Chunk size for a document: small documents get one chunk covering all
    /// pages, large ones get `page_chunk_size` ranges.
    fn chunk_size_for(&self, page_count: u32) -> u32 {
        if page_count <= self.settings.ocr_fanout_threshold_pages {
            page_count.max(1)
        } else {
            self.settings.page_chunk_size
        }
    }

    /// Start (or resume) the OCR stage for a job: ensure chunk rows exist
    /// and dispatch a task per unfinished chunk.
    pub async fn run_ocr_stage(
        &self,
        job: &ProcessingJob,
        document_id: &str,
    ) -> Result<OcrStageOutcome, StageError> {
        let document = self.docs.get_required(document_id).map_err(fatal)?;

        let mut existing = self.chunks.list_by_document(document_id).map_err(fatal)?;
        if existing.is_empty() {
            let planned = plan_chunks(
                &job.matter_id,
                document_id,
                document.page_count.max(1),
                self.chunk_size_for(document.page_count.max(1)),
            );
            self.chunks.create_many(&planned).map_err(fatal)?;
            existing = planned;
        }

        let progress = self.chunks.progress(document_id).map_err(fatal)?;
        if progress.all_completed() {
            // Every chunk landed but the stage never closed (merge crashed or
            // the job was recovered mid-merge). Merge is idempotent; redo it.
            self.merge(job, document_id).await?;
            return Ok(OcrStageOutcome::AlreadyMerged);
        }

        self.tracker
            .repo()
            .append_stage_history(&job.id, "ocr", StageStatus::InProgress, None, None)
            .map_err(fatal)?;
        self.progress_tracker()
            .update(&job.id, document_id)
            .await
            .map_err(fatal)?;

        // Resume path: a chunk stuck PROCESSING since before the stale cutoff
        // belongs to a dead worker and is fair game.
        let stale_cutoff =
            Utc::now() - chrono::Duration::minutes(self.settings.job_stale_timeout_minutes);
        self.chunks
            .reset_stale_processing(stale_cutoff)
            .map_err(fatal)?;

        let mut dispatched = 0u32;
        for chunk in &existing {
            let current = self.chunks.get_required(&chunk.id).map_err(fatal)?;
            if current.status == ChunkStatus::Pending {
                self.queue
                    .dispatch(
                        Task::OcrChunk {
                            chunk_id: chunk.id.clone(),
                            attempt: 0,
                        },
                        Duration::ZERO,
                    )
                    .await;
                dispatched += 1;
            }
        }

        info!(
            job_id = %job.id,
            document_id,
            chunks = existing.len(),
            dispatched,
            "ocr chunk fan-out started"
        );
        Ok(OcrStageOutcome::InFlight)
    }

    /// Process one chunk task. `attempt` counts prior tries of this chunk.
    pub async fn process_chunk(&self, chunk_id: &str, attempt: u32) {
        let chunk = match self.chunks.get_required(chunk_id) {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!(chunk_id, error = %e, "chunk task for missing chunk");
                return;
            }
        };

        let job = match self.owning_job(&chunk) {
            Some(job) => job,
            None => {
                warn!(chunk_id, document_id = %chunk.document_id, "no active job for chunk");
                return;
            }
        };

        // Cancellation between chunks: put the chunk back and walk away.
        if job.status == JobStatus::Cancelled {
            let _ = self.chunks.set_status(chunk_id, ChunkStatus::Pending);
            return;
        }

        match self.chunks.transition(
            chunk_id,
            ChunkStatus::Pending,
            ChunkStatus::Processing,
            None,
            None,
        ) {
            Ok(()) => {}
            Err(RepositoryError::Conflict(_)) => {
                // Completed by a previous run, or claimed elsewhere. Either
                // way the aggregate step below may still need to fire.
                if chunk.status == ChunkStatus::Completed {
                    self.after_chunk(&job, &chunk.document_id).await;
                }
                return;
            }
            Err(e) => {
                error!(chunk_id, error = %e, "chunk claim failed");
                return;
            }
        }

        let _ = self.tracker.heartbeat(&job.id);

        match self.recognize_chunk(&chunk).await {
            Ok((blob_path, checksum)) => {
                if let Err(e) = self.chunks.transition(
                    chunk_id,
                    ChunkStatus::Processing,
                    ChunkStatus::Completed,
                    Some(&blob_path),
                    Some(&checksum),
                ) {
                    error!(chunk_id, error = %e, "chunk completion write failed");
                    return;
                }
                self.after_chunk(&job, &chunk.document_id).await;
            }
            Err(err) => self.handle_chunk_failure(&job, &chunk, attempt, err).await,
        }
    }

    /// Download the page range and run external OCR within the hard budget.
    async fn recognize_chunk(&self, chunk: &OcrChunk) -> Result<(String, String), ExternalError> {
        let document = self
            .docs
            .get_required(&chunk.document_id)
            .map_err(|e| ExternalError::Permanent(e.to_string()))?;
        let pdf = self.blob.download(&document.blob_path).await?;

        let recognize = self.ocr.recognize(&pdf, chunk.page_start, chunk.page_end);
        let artifact = tokio::time::timeout(self.settings.ocr_timeout_hard, recognize)
            .await
            .map_err(|_| {
                ExternalError::Transient(format!(
                    "OCR timed out after {}s",
                    self.settings.ocr_timeout_hard.as_secs()
                ))
            })??;

        let bytes = artifact.to_bytes();
        let checksum = hex::encode(Sha256::digest(&bytes));
        let blob_path = chunk_blob_path(&chunk.matter_id, &chunk.document_id, chunk.chunk_index);
        self.blob.upload(&blob_path, &bytes).await?;
        Ok((blob_path, checksum))
    }

    /// Retry a transiently failed chunk with backoff; fail the job only when
    /// the chunk's own retries are exhausted.
    async fn handle_chunk_failure(
        &self,
        job: &ProcessingJob,
        chunk: &OcrChunk,
        attempt: u32,
        err: ExternalError,
    ) {
        let message = format_chunk_failure_message(
            chunk.chunk_index,
            chunk.page_start,
            chunk.page_end,
            &err.to_string(),
        );
        warn!(job_id = %job.id, chunk_id = %chunk.id, attempt, error = %err, "chunk failed");

        let retryable = err.is_retryable() && attempt + 1 < self.settings.job_max_retries;
        if retryable {
            // Surface the failure on the job but keep it PROCESSING so the
            // retry (or an operator) can finish the stage.
            let _ = self
                .tracker
                .update(
                    &job.id,
                    JobUpdate {
                        error_message: Some(Some(message)),
                        error_code: Some(Some("OCR_CHUNK_FAILED".to_string())),
                        ..Default::default()
                    },
                )
                .await;
            let _ = self.chunks.set_status(&chunk.id, ChunkStatus::Pending);
            let countdown = crate::pipeline::orchestrator::backoff_delay(
                self.settings.retry_backoff_base,
                self.settings.retry_backoff_max,
                attempt + 1,
            );
            self.queue
                .dispatch(
                    Task::OcrChunk {
                        chunk_id: chunk.id.clone(),
                        attempt: attempt + 1,
                    },
                    countdown,
                )
                .await;
            return;
        }

        let _ = self
            .chunks
            .set_status(&chunk.id, ChunkStatus::Failed);
        let _ = self
            .tracker
            .update(
                &job.id,
                JobUpdate {
                    status: Some(JobStatus::Failed),
                    error_message: Some(Some(message)),
                    error_code: Some(Some("OCR_CHUNK_FAILED".to_string())),
                    ..Default::default()
                },
            )
            .await;
        let _ = self
            .tracker
            .repo()
            .append_stage_history(&job.id, "ocr", StageStatus::Failed, Some(&err.to_string()), None);
        let _ = self
            .docs
            .set_status(&chunk.document_id, DocumentStatus::Failed);
    }

    /// Roll the chunk's completion into job progress and merge when it was
    /// the last one.
    async fn after_chunk(&self, job: &ProcessingJob, document_id: &str) {
        let progress = match self.progress_tracker().update(&job.id, document_id).await {
            Ok(progress) => progress,
            Err(e) => {
                error!(job_id = %job.id, error = %e, "chunk progress update failed");
                return;
            }
        };

        if !progress.all_completed() {
            return;
        }

        // Concurrent last-chunk completions can both land here; a stage
        // already closed out (or a job no longer running) needs no merge.
        match self.tracker.repo().get_required(&job.id) {
            Ok(current)
                if current.completed_stages >= 1 || current.status != JobStatus::Processing =>
            {
                return;
            }
            Err(_) => return,
            Ok(_) => {}
        }

        if let Err(err) = self.merge(job, document_id).await {
            warn!(job_id = %job.id, error = %err, "ocr merge failed");
            let _ = self
                .tracker
                .update(
                    &job.id,
                    JobUpdate {
                        error_message: Some(Some(format!("OCR merge failed: {err}"))),
                        error_code: Some(Some("OCR_MERGE_FAILED".to_string())),
                        ..Default::default()
                    },
                )
                .await;
        }
    }

    /// Concatenate chunk artifacts in chunk order, renumbering reading order
    /// globally, then complete the OCR stage and continue the pipeline.
    async fn merge(&self, job: &ProcessingJob, document_id: &str) -> Result<(), StageError> {
        self.tracker
            .update(
                &job.id,
                JobUpdate {
                    current_stage: Some(Some("Merging OCR results".to_string())),
                    progress_pct: Some(MERGE_PCT),
                    ..Default::default()
                },
            )
            .await
            .map_err(fatal)?;

        let chunks = self.chunks.list_by_document(document_id).map_err(fatal)?;
        let mut merged = OcrArtifact::default();
        let mut next_reading_order = 0u64;

        // Fetch every chunk blob concurrently; concatenation below follows
        // chunk_index order regardless.
        let downloads = futures::future::join_all(chunks.iter().map(|chunk| async {
            let blob_path =
                chunk
                    .result_blob_path
                    .as_deref()
                    .ok_or_else(|| StageError::Fatal {
                        message: format!("completed chunk {} has no result blob", chunk.id),
                    })?;
            self.blob
                .download(blob_path)
                .await
                .map_err(|e| StageError::Stage {
                    message: format!("chunk {} blob download failed: {e}", chunk.chunk_index),
                    retryable: true,
                })
        }))
        .await;

        for (chunk, bytes) in chunks.iter().zip(downloads) {
            let bytes = bytes?;

            if let Some(expected) = &chunk.result_checksum {
                let actual = hex::encode(Sha256::digest(&bytes));
                if &actual != expected {
                    return Err(StageError::Stage {
                        message: format!(
                            "chunk {} checksum mismatch (expected {expected}, got {actual})",
                            chunk.chunk_index
                        ),
                        retryable: true,
                    });
                }
            }

            let artifact = OcrArtifact::from_bytes(&bytes).map_err(|e| StageError::Stage {
                message: format!("chunk {} artifact unparseable: {e}", chunk.chunk_index),
                retryable: false,
            })?;

            merged.pages.extend(artifact.pages);
            for mut ocr_box in artifact.boxes {
                ocr_box.reading_order_index = next_reading_order;
                next_reading_order += 1;
                merged.boxes.push(ocr_box);
            }
            if !merged.full_text.is_empty() {
                merged.full_text.push('\n');
            }
            merged.full_text.push_str(&artifact.full_text);
        }

        merged.pages.sort_by_key(|p| p.page_number);
        merged.overall_confidence = OcrArtifact::overall_confidence(&merged.pages);

        let merged_path = merged_blob_path(&job.matter_id, document_id);
        self.blob
            .upload(&merged_path, &merged.to_bytes())
            .await
            .map_err(|e| StageError::Stage {
                message: format!("merged artifact upload failed: {e}"),
                retryable: true,
            })?;

        self.tracker
            .repo()
            .append_stage_history(
                &job.id,
                "ocr",
                StageStatus::Completed,
                None,
                Some(serde_json::json!({
                    "chunks": chunks.len(),
                    "pages": merged.pages.len(),
                    "boxes": merged.boxes.len(),
                })),
            )
            .map_err(fatal)?;
        self.tracker
            .update(
                &job.id,
                JobUpdate {
                    completed_stages: Some(1),
                    progress_pct: Some(stage_ceiling_pct(0, job.total_stages).max(MERGE_PCT)),
                    error_message: Some(None),
                    error_code: Some(None),
                    ..Default::default()
                },
            )
            .await
            .map_err(fatal)?;

        info!(
            job_id = %job.id,
            document_id,
            chunks = chunks.len(),
            boxes = merged.boxes.len(),
            "ocr chunks merged"
        );

        // Hand the document back to the pipeline for the next stage.
        self.queue
            .dispatch(
                Task::ProcessDocument {
                    document_id: document_id.to_string(),
                },
                Duration::ZERO,
            )
            .await;
        Ok(())
    }

    /// The job this chunk reports into: the newest non-terminal document
    /// pipeline (or standalone OCR) job for its document.
    fn owning_job(&self, chunk: &OcrChunk) -> Option<ProcessingJob> {
        for job_type in [
            crate::models::JobType::DocumentProcessing,
            crate::models::JobType::Ocr,
        ] {
            if let Ok(Some(job)) = self
                .tracker
                .repo()
                .latest_for_document(&chunk.document_id, job_type)
            {
                if !job.status.is_terminal() || job.status == JobStatus::Cancelled {
                    return Some(job);
                }
            }
        }
        None
    }
}

fn fatal(err: RepositoryError) -> StageError {
    StageError::Fatal {
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_partitions_fifty_pages_into_two_chunks() {
        let chunks = plan_chunks("m", "d", 50, 25);
        assert_eq!(chunks.len(), 2);
        assert_eq!((chunks[0].chunk_index, chunks[0].page_start, chunks[0].page_end), (0, 1, 25));
        assert_eq!((chunks[1].chunk_index, chunks[1].page_start, chunks[1].page_end), (1, 26, 50));
    }

    #[test]
    fn test_plan_covers_every_page_exactly_once() {
        for (pages, size) in [(1u32, 25u32), (24, 25), (25, 25), (26, 25), (423, 25), (100, 7)] {
            let chunks = plan_chunks("m", "d", pages, size);
            let mut covered = vec![false; pages as usize + 1];
            for chunk in &chunks {
                assert!(chunk.page_start <= chunk.page_end);
                for page in chunk.page_start..=chunk.page_end {
                    assert!(!covered[page as usize], "page {page} covered twice");
                    covered[page as usize] = true;
                }
            }
            assert!(
                covered[1..].iter().all(|c| *c),
                "pages uncovered for ({pages}, {size})"
            );
            // chunk_index numbers the partition monotonically.
            for (i, chunk) in chunks.iter().enumerate() {
                assert_eq!(chunk.chunk_index, i as u32);
            }
        }
    }

    #[test]
    fn test_blob_paths_are_matter_scoped() {
        assert_eq!(
            chunk_blob_path("m1", "d1", 3),
            "m1/d1/ocr/chunks/3.json"
        );
        assert_eq!(merged_blob_path("m1", "d1"), "m1/d1/ocr/merged.json");
    }
}
