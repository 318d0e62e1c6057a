//! Pipeline orchestrator: job creation, stage sequencing, retry policy.
//!
//! The orchestrator never runs stage work inline; it claims jobs, hands
//! stages to the executor (or the OCR coordinator), and schedules the next
//! task. Failures flow back here to be classified into retry-with-backoff,
//! poison-pill abort, or terminal job failure.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{info, warn};

use super::executor::{StageExecutor, StageHandler};
use super::stages::StageHandlers;
use super::{stage_at, StageError};
use crate::cache::MatterQueryCache;
use crate::config::Settings;
use crate::eta::EtaEstimator;
use crate::models::{
    DocumentStatus, JobMetadata, JobStatus, JobType, JobUpdate, ProcessingJob, StageStatus,
};
use crate::ocr::{OcrChunkCoordinator, OcrStageOutcome};
use crate::queue::{Task, TaskQueue};
use crate::repository::{DocumentRepository, RepositoryError};
use crate::tracking::{JobTracker, PartialProgressTracker};

/// Same stage + same item + same error class this many times fails the job.
const POISON_STRIKES: u32 = 3;

/// Exponential backoff with full jitter: `uniform(0, min(max, base * 2^attempt))`.
pub fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let exp = base.as_secs_f64() * 2f64.powi(attempt.min(16) as i32);
    let capped = exp.min(max.as_secs_f64());
    let jittered = rand::thread_rng().gen_range(0.0..=capped);
    Duration::from_secs_f64(jittered)
}

/// Outcome of a manual retry request.
#[derive(Debug, Clone)]
pub struct RetryOutcome {
    pub new_status: JobStatus,
    pub message: String,
}

pub struct PipelineOrchestrator {
    tracker: JobTracker,
    docs: Arc<DocumentRepository>,
    queue: Arc<dyn TaskQueue>,
    cache: Arc<MatterQueryCache>,
    eta: Arc<EtaEstimator>,
    settings: Arc<Settings>,
    handlers: StageHandlers,
    executor: StageExecutor,
    coordinator: Arc<OcrChunkCoordinator>,
}

impl PipelineOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tracker: JobTracker,
        docs: Arc<DocumentRepository>,
        queue: Arc<dyn TaskQueue>,
        cache: Arc<MatterQueryCache>,
        eta: Arc<EtaEstimator>,
        settings: Arc<Settings>,
        handlers: StageHandlers,
        coordinator: Arc<OcrChunkCoordinator>,
    ) -> Self {
        let executor = StageExecutor::new(
            tracker.clone(),
            settings.heartbeat_interval,
            settings.ocr_timeout_hard,
        );
        Self {
            tracker,
            docs,
            queue,
            cache,
            eta,
            settings,
            handlers,
            executor,
            coordinator,
        }
    }

    pub fn tracker(&self) -> &JobTracker {
        &self.tracker
    }

    /// Create a DOCUMENT_PROCESSING job for a document and dispatch its
    /// first stage. Refuses while the document's latest job is still live,
    /// unless the caller is a recovery sweeper.
    pub async fn start(
        &self,
        document_id: &str,
        from_sweeper: bool,
    ) -> Result<ProcessingJob, RepositoryError> {
        let document = self.docs.get_required(document_id)?;

        if !from_sweeper {
            if let Some(latest) = self
                .tracker
                .repo()
                .latest_for_document(document_id, JobType::DocumentProcessing)?
            {
                if !latest.status.is_terminal() {
                    return Err(RepositoryError::Conflict(format!(
                        "document {document_id} already has active job {}",
                        latest.id
                    )));
                }
            }
        }

        let job = self
            .tracker
            .create(
                &document.matter_id,
                Some(document_id),
                JobType::DocumentProcessing,
                self.settings.job_max_retries,
                JobMetadata::default(),
            )
            .await?;

        // Seed a user-facing estimate from the rolling processing-rate window.
        let eta = self
            .eta
            .processing_eta(
                &document.matter_id,
                &[crate::eta::PendingDoc {
                    page_count: document.page_count,
                }],
            )
            .await;
        let job = self
            .tracker
            .update(
                &job.id,
                JobUpdate {
                    estimated_completion: Some(Some(
                        chrono::Utc::now()
                            + chrono::Duration::seconds(eta.best_guess_seconds as i64),
                    )),
                    ..Default::default()
                },
            )
            .await?;

        self.queue
            .dispatch(
                Task::ProcessDocument {
                    document_id: document_id.to_string(),
                },
                Duration::ZERO,
            )
            .await;

        info!(job_id = %job.id, document_id, "document processing job created");
        Ok(job)
    }

    /// Handle a `ProcessDocument` task: claim the document's live job and
    /// run its next stage, then dispatch the follow-up task.
    pub async fn run_next_stage(&self, document_id: &str) {
        let job = match self.live_job(document_id) {
            Some(job) => job,
            None => {
                warn!(document_id, "process task with no live job; ignoring");
                return;
            }
        };

        // Claim if queued; if another worker already holds it, this task is
        // a duplicate and the CAS losing is the correct outcome.
        if job.status == JobStatus::Queued
            && !self
                .tracker
                .repo()
                .mark_processing_if_queued(&job.id)
                .unwrap_or(false)
        {
            return;
        }
        let job = match self.tracker.repo().get_required(&job.id) {
            Ok(job) => job,
            Err(e) => {
                warn!(document_id, error = %e, "job vanished during claim");
                return;
            }
        };
        if job.status != JobStatus::Processing {
            return;
        }

        let _ = self.docs.set_status(document_id, DocumentStatus::Processing);
        self.cache.invalidate_matter(&job.matter_id);

        let stage = match stage_at(job.completed_stages) {
            Some(stage) => stage,
            None => {
                self.complete_job(&job).await;
                return;
            }
        };

        if stage == "ocr" {
            match self.coordinator.run_ocr_stage(&job, document_id).await {
                Ok(OcrStageOutcome::InFlight) => {}
                Ok(OcrStageOutcome::AlreadyMerged) => {
                    self.dispatch_continue(document_id).await;
                }
                Err(err) => self.on_stage_failure(&job, stage, err).await,
            }
            return;
        }

        let handler = match self.handlers.get(stage) {
            Some(handler) => handler,
            None => {
                self.fail_job(&job, "PIPELINE_MISCONFIGURED", &format!("no handler for stage {stage}"))
                    .await;
                return;
            }
        };

        match self.executor.execute(&job, handler.as_ref(), false).await {
            Ok(_) => self.dispatch_continue(document_id).await,
            Err(StageError::Cancelled) => {
                info!(job_id = %job.id, stage, "stage run stopped (cancelled or superseded)");
            }
            Err(err) => self.on_stage_failure(&job, stage, err).await,
        }
    }

    /// Handle a standalone `StageTask` (embed-only, entity-only, forced
    /// re-runs).
    pub async fn run_stage_task(&self, job_id: &str, stage: &str, force: bool) {
        let job = match self.tracker.repo().get_required(job_id) {
            Ok(job) => job,
            Err(e) => {
                warn!(job_id, error = %e, "stage task for missing job");
                return;
            }
        };
        if job.status.is_terminal() {
            return;
        }
        if job.status == JobStatus::Queued
            && !self
                .tracker
                .repo()
                .mark_processing_if_queued(job_id)
                .unwrap_or(false)
        {
            return;
        }
        let job = match self.tracker.repo().get_required(job_id) {
            Ok(job) => job,
            Err(_) => return,
        };

        let handler: Arc<dyn StageHandler> = match self.handlers.get(stage) {
            Some(handler) => handler,
            None => {
                warn!(job_id, stage, "stage task for unknown stage");
                return;
            }
        };

        match self.executor.execute(&job, handler.as_ref(), force).await {
            Ok(_) => {
                if job.job_type == JobType::DocumentProcessing {
                    if let Some(document_id) = &job.document_id {
                        self.dispatch_continue(document_id).await;
                    }
                } else {
                    let _ = self
                        .tracker
                        .update(
                            job_id,
                            JobUpdate {
                                status: Some(JobStatus::Completed),
                                progress_pct: Some(100),
                                ..Default::default()
                            },
                        )
                        .await;
                }
            }
            Err(StageError::Cancelled) => {}
            Err(err) => self.on_stage_failure(&job, stage, err).await,
        }
    }

    async fn dispatch_continue(&self, document_id: &str) {
        self.queue
            .dispatch(
                Task::ProcessDocument {
                    document_id: document_id.to_string(),
                },
                Duration::ZERO,
            )
            .await;
    }

    /// Stage failure policy: poison-pill detection first, then bounded
    /// retry with full-jitter backoff, then terminal failure.
    pub async fn on_stage_failure(&self, job: &ProcessingJob, stage: &str, err: StageError) {
        if let StageError::Item {
            item_id,
            class,
            message,
            ..
        } = &err
        {
            let strikes = self
                .record_poison_strike(&job.id, stage, item_id, class, message)
                .await;
            if strikes >= POISON_STRIKES {
                warn!(
                    job_id = %job.id,
                    stage,
                    item_id = %item_id,
                    class = %class,
                    strikes,
                    "poison pill detected"
                );
                self.fail_job(
                    job,
                    "POISON_PILL",
                    &format!("stage {stage} failed {strikes} times at item {item_id}: {message}"),
                )
                .await;
                return;
            }
        }

        if err.retryable() && job.retry_count < job.max_retries {
            let attempt = job.retry_count + 1;
            let delay = backoff_delay(
                self.settings.retry_backoff_base,
                self.settings.retry_backoff_max,
                attempt,
            );
            warn!(
                job_id = %job.id,
                stage,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "stage failed; scheduling retry"
            );
            let requeued = self
                .tracker
                .update(
                    &job.id,
                    JobUpdate {
                        status: Some(JobStatus::Queued),
                        retry_count: Some(attempt),
                        error_message: Some(Some(err.to_string())),
                        error_code: Some(Some(err.code().to_string())),
                        ..Default::default()
                    },
                )
                .await;
            if requeued.is_err() {
                return;
            }
            if let Some(document_id) = &job.document_id {
                self.queue
                    .dispatch(
                        Task::ProcessDocument {
                            document_id: document_id.clone(),
                        },
                        delay,
                    )
                    .await;
            }
            return;
        }

        self.fail_job(job, err.code(), &err.to_string()).await;
    }

    /// Count a repeated identical item failure in job metadata, recording
    /// the item in the stage's failed set.
    async fn record_poison_strike(
        &self,
        job_id: &str,
        stage: &str,
        item_id: &str,
        class: &str,
        message: &str,
    ) -> u32 {
        let job = match self.tracker.repo().get_required(job_id) {
            Ok(job) => job,
            Err(_) => return 0,
        };
        let mut metadata = job.metadata;

        let key = format!("{stage}:{item_id}:{class}");
        let strikes = {
            let map = metadata
                .extra
                .entry("poison_strikes".to_string())
                .or_insert_with(|| serde_json::json!({}));
            let strikes = map.get(&key).and_then(|v| v.as_u64()).unwrap_or(0) as u32 + 1;
            if let Some(obj) = map.as_object_mut() {
                obj.insert(key, serde_json::json!(strikes));
            }
            strikes
        };

        if strikes >= POISON_STRIKES {
            metadata
                .partial_progress
                .entry(stage.to_string())
                .or_insert_with(|| crate::models::StageProgress::new(stage))
                .mark_failed(item_id, message);
        }

        let _ = self
            .tracker
            .update(
                job_id,
                JobUpdate {
                    metadata: Some(metadata),
                    ..Default::default()
                },
            )
            .await;
        strikes
    }

    async fn complete_job(&self, job: &ProcessingJob) {
        let completed = self
            .tracker
            .update(
                &job.id,
                JobUpdate {
                    status: Some(JobStatus::Completed),
                    progress_pct: Some(100),
                    error_message: Some(None),
                    error_code: Some(None),
                    ..Default::default()
                },
            )
            .await;

        if let (Ok(completed), Some(document_id)) = (&completed, &job.document_id) {
            let _ = self.docs.set_status(document_id, DocumentStatus::Completed);
            self.cache.invalidate_matter(&job.matter_id);

            if let Ok(document) = self.docs.get_required(document_id) {
                if let (Some(started), Some(finished)) =
                    (completed.started_at, completed.completed_at)
                {
                    let elapsed_ms = (finished - started).num_milliseconds().max(0) as u64;
                    self.eta
                        .record_completion(document.page_count, elapsed_ms)
                        .await;
                }
            }
        }
        info!(job_id = %job.id, "job completed");
    }

    async fn fail_job(&self, job: &ProcessingJob, code: &str, message: &str) {
        let _ = self
            .tracker
            .update(
                &job.id,
                JobUpdate {
                    status: Some(JobStatus::Failed),
                    error_message: Some(Some(message.to_string())),
                    error_code: Some(Some(code.to_string())),
                    ..Default::default()
                },
            )
            .await;
        let _ = self.tracker.repo().append_stage_history(
            &job.id,
            job.current_stage.as_deref().unwrap_or("pipeline"),
            StageStatus::Failed,
            Some(message),
            None,
        );
        if let Some(document_id) = &job.document_id {
            let _ = self.docs.set_status(document_id, DocumentStatus::Failed);
        }
        self.cache.invalidate_matter(&job.matter_id);
        warn!(job_id = %job.id, code, message, "job failed");
    }

    /// Manual retry of a terminal job. Keeps partial progress unless
    /// `restart` clears the current stage's record.
    pub async fn retry(
        &self,
        job_id: &str,
        reset_retry_count: bool,
        restart: bool,
    ) -> Result<RetryOutcome, RepositoryError> {
        let job = self.tracker.repo().get_required(job_id)?;
        if !job.status.is_terminal() {
            return Err(RepositoryError::Conflict(format!(
                "job {job_id} is {}; only terminal jobs can be retried",
                job.status.as_str()
            )));
        }

        if restart {
            if let Some(stage) = &job.current_stage {
                PartialProgressTracker::new(job_id, self.tracker.clone())
                    .clear(stage)
                    .await?;
            }
        }

        self.tracker
            .update(
                job_id,
                JobUpdate {
                    status: Some(JobStatus::Queued),
                    retry_count: reset_retry_count.then_some(0),
                    error_message: Some(None),
                    error_code: Some(None),
                    completed_at: Some(None),
                    ..Default::default()
                },
            )
            .await?;

        if let Some(document_id) = &job.document_id {
            let _ = self.docs.set_status(document_id, DocumentStatus::Pending);
            self.cache.invalidate_matter(&job.matter_id);
            self.queue
                .dispatch(
                    Task::ProcessDocument {
                        document_id: document_id.clone(),
                    },
                    Duration::ZERO,
                )
                .await;
        }

        Ok(RetryOutcome {
            new_status: JobStatus::Queued,
            message: if restart {
                "job requeued; stage progress cleared".to_string()
            } else {
                "job requeued; resuming from saved progress".to_string()
            },
        })
    }

    /// Cooperative cancel. Idempotent: cancelling a cancelled job is a
    /// no-op; other terminal states refuse.
    pub async fn cancel(&self, job_id: &str) -> Result<ProcessingJob, RepositoryError> {
        let job = self.tracker.repo().get_required(job_id)?;
        match job.status {
            JobStatus::Cancelled => Ok(job),
            status if status.is_terminal() => Err(RepositoryError::Conflict(format!(
                "job {job_id} already {}",
                status.as_str()
            ))),
            _ => {
                self.tracker
                    .update(
                        job_id,
                        JobUpdate {
                            status: Some(JobStatus::Cancelled),
                            ..Default::default()
                        },
                    )
                    .await
            }
        }
    }

    /// Skip a failed job so it stops appearing as actionable. Idempotent.
    pub async fn skip(&self, job_id: &str, reason: &str) -> Result<ProcessingJob, RepositoryError> {
        let job = self.tracker.repo().get_required(job_id)?;
        if job.status == JobStatus::Skipped {
            return Ok(job);
        }
        let mut metadata = job.metadata.clone();
        metadata
            .extra
            .insert("skip_reason".to_string(), serde_json::json!(reason));
        self.tracker
            .update(
                job_id,
                JobUpdate {
                    status: Some(JobStatus::Skipped),
                    metadata: Some(metadata),
                    ..Default::default()
                },
            )
            .await
    }

    /// The document's newest non-terminal DOCUMENT_PROCESSING job.
    fn live_job(&self, document_id: &str) -> Option<ProcessingJob> {
        self.tracker
            .repo()
            .latest_for_document(document_id, JobType::DocumentProcessing)
            .ok()
            .flatten()
            .filter(|job| !job.status.is_terminal())
    }
}
