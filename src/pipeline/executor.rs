//! Stage executor: runs one pipeline stage over its items.
//!
//! The executor owns the generic machinery (heartbeats, stage history,
//! partial-progress resume, cancellation, progress arithmetic) and knows
//! nothing about what a stage does. Stage logic lives in handlers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use super::{stage_ceiling_pct, stage_floor_pct, stage_index, StageError};
use crate::models::{JobStatus, JobUpdate, ProcessingJob, StageStatus};
use crate::tracking::{JobTracker, PartialProgressTracker};

/// Cooperative cancellation flag threaded through stage handlers.
///
/// The executor sets it when the job row reports CANCELLED; handlers honour
/// it at their own suspension points.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// What a stage does when one item permanently fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemFailurePolicy {
    /// Any permanent item failure fails the stage.
    Strict,
    /// Record the failure and continue with the remaining items.
    Tolerant,
}

/// Everything a handler may need about the run it is part of.
#[derive(Clone)]
pub struct StageContext {
    pub job_id: String,
    pub matter_id: String,
    pub document_id: Option<String>,
    /// Bypass "already done" short-circuits inside the handler.
    pub force: bool,
    pub cancel: CancelToken,
}

/// Pluggable stage logic. `process_item` must be idempotent: the same item
/// may be handed to it again after a crash.
#[async_trait]
pub trait StageHandler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Item ids this stage will process, in processing order.
    async fn plan(&self, ctx: &StageContext) -> Result<Vec<String>, StageError>;

    async fn process_item(&self, ctx: &StageContext, item_id: &str) -> Result<(), StageError>;

    fn failure_policy(&self) -> ItemFailurePolicy {
        ItemFailurePolicy::Strict
    }
}

/// Result of a completed stage run.
#[derive(Debug, Clone, Copy)]
pub struct StageOutcome {
    pub processed: usize,
    pub failed: usize,
}

/// Runs one stage of one job.
pub struct StageExecutor {
    tracker: JobTracker,
    heartbeat_interval: std::time::Duration,
    /// Hard wall-clock budget for one item; overrun is a transient failure.
    item_budget: std::time::Duration,
}

impl StageExecutor {
    pub fn new(
        tracker: JobTracker,
        heartbeat_interval: std::time::Duration,
        item_budget: std::time::Duration,
    ) -> Self {
        Self {
            tracker,
            heartbeat_interval,
            item_budget,
        }
    }

    /// Execute `handler` for `job`, resuming from any persisted partial
    /// progress. `force` clears prior progress and reprocesses everything.
    pub async fn execute(
        &self,
        job: &ProcessingJob,
        handler: &dyn StageHandler,
        force: bool,
    ) -> Result<StageOutcome, StageError> {
        let stage_name = handler.name();
        let index = stage_index(stage_name).unwrap_or(job.completed_stages as usize);
        let floor = stage_floor_pct(index, job.total_stages);
        let ceiling = stage_ceiling_pct(index, job.total_stages);

        let ctx = StageContext {
            job_id: job.id.clone(),
            matter_id: job.matter_id.clone(),
            document_id: job.document_id.clone(),
            force,
            cancel: CancelToken::new(),
        };

        // The worker claimed QUEUED -> PROCESSING before calling us; anything
        // else (cancellation, a sweeper's requeue) means this run must stop.
        self.check_alive(&job.id, &ctx).await?;

        self.tracker.heartbeat(&job.id).map_err(fatal)?;
        self.tracker
            .repo()
            .append_stage_history(&job.id, stage_name, StageStatus::InProgress, None, None)
            .map_err(fatal)?;

        let partial = PartialProgressTracker::new(&job.id, self.tracker.clone());
        if force {
            partial.clear(stage_name).await.map_err(fatal)?;
        }
        let mut stage = partial.get_or_create(stage_name).map_err(fatal)?;

        let items = handler.plan(&ctx).await?;
        stage.total_items = items.len();

        let span = ceiling.saturating_sub(floor) as usize;
        let initial_within = if stage.total_items == 0 {
            0
        } else {
            stage.processed_items.len() * span / stage.total_items
        };
        self.tracker
            .update(
                &job.id,
                JobUpdate {
                    current_stage: Some(Some(stage_name.to_string())),
                    progress_pct: Some(floor + initial_within as u8),
                    ..Default::default()
                },
            )
            .await
            .map_err(fatal)?;

        // Liveness while the stage runs; between-item heartbeats alone would
        // stall on one slow external call.
        let beat = {
            let tracker = self.tracker.clone();
            let job_id = job.id.clone();
            let interval = self.heartbeat_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if tracker.heartbeat(&job_id).is_err() {
                        break;
                    }
                }
            })
        };

        let result = self
            .run_items(job, handler, &partial, &mut stage, &ctx, &items, floor, ceiling)
            .await;
        beat.abort();

        match result {
            Ok(outcome) => {
                partial.flush(&stage, true).await.map_err(fatal)?;
                self.tracker
                    .repo()
                    .append_stage_history(&job.id, stage_name, StageStatus::Completed, None, None)
                    .map_err(fatal)?;
                self.tracker
                    .update(
                        &job.id,
                        JobUpdate {
                            completed_stages: Some((index + 1) as u32),
                            progress_pct: Some(ceiling),
                            ..Default::default()
                        },
                    )
                    .await
                    .map_err(fatal)?;
                info!(
                    job_id = %job.id,
                    stage = stage_name,
                    processed = outcome.processed,
                    failed = outcome.failed,
                    "stage completed"
                );
                Ok(outcome)
            }
            Err(StageError::Cancelled) => Err(StageError::Cancelled),
            Err(err) => {
                // Keep whatever progress the run made; a retry resumes from it.
                let _ = partial.flush(&stage, true).await;
                let _ = self.tracker.repo().append_stage_history(
                    &job.id,
                    stage_name,
                    StageStatus::Failed,
                    Some(&err.to_string()),
                    None,
                );
                warn!(job_id = %job.id, stage = stage_name, error = %err, "stage failed");
                Err(err)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_items(
        &self,
        job: &ProcessingJob,
        handler: &dyn StageHandler,
        partial: &PartialProgressTracker,
        stage: &mut crate::models::StageProgress,
        ctx: &StageContext,
        items: &[String],
        floor: u8,
        ceiling: u8,
    ) -> Result<StageOutcome, StageError> {
        let remaining: Vec<String> = stage.remaining(items).into_iter().cloned().collect();
        let span = ceiling.saturating_sub(floor) as usize;

        for item_id in &remaining {
            self.check_alive(&job.id, ctx).await?;

            let attempt = tokio::time::timeout(self.item_budget, handler.process_item(ctx, item_id))
                .await
                .unwrap_or_else(|_| {
                    Err(StageError::Item {
                        item_id: item_id.clone(),
                        class: "ITEM_TIMEOUT".into(),
                        message: format!(
                            "item exceeded {}s wall-clock budget",
                            self.item_budget.as_secs()
                        ),
                        retryable: true,
                    })
                });
            match attempt {
                Ok(()) => {
                    stage.mark_done(item_id);
                    let processed = stage.processed_items.len();
                    partial.flush(stage, false).await.map_err(fatal)?;
                    if processed % 10 == 0 {
                        self.tracker.heartbeat(&job.id).map_err(fatal)?;
                        let within = if stage.total_items == 0 {
                            0
                        } else {
                            processed * span / stage.total_items
                        };
                        self.tracker
                            .update(
                                &job.id,
                                JobUpdate {
                                    progress_pct: Some(floor + within as u8),
                                    ..Default::default()
                                },
                            )
                            .await
                            .map_err(fatal)?;
                    }
                }
                Err(StageError::Cancelled) => return Err(StageError::Cancelled),
                Err(err) if err.retryable() => return Err(err),
                Err(err) => {
                    if let StageError::Item {
                        item_id, message, ..
                    } = &err
                    {
                        stage.mark_failed(item_id, message);
                    }
                    match handler.failure_policy() {
                        ItemFailurePolicy::Strict => return Err(err),
                        ItemFailurePolicy::Tolerant => {
                            warn!(
                                job_id = %job.id,
                                stage = handler.name(),
                                item = %item_id,
                                error = %err,
                                "item failed; stage policy tolerates and continues"
                            );
                        }
                    }
                }
            }
        }

        Ok(StageOutcome {
            processed: stage.processed_items.len(),
            failed: stage.failed_items.len(),
        })
    }

    /// Between items: stop if the job was cancelled or moved out from under
    /// this worker.
    async fn check_alive(&self, job_id: &str, ctx: &StageContext) -> Result<(), StageError> {
        let current = self.tracker.repo().get_required(job_id).map_err(fatal)?;
        match current.status {
            JobStatus::Processing => Ok(()),
            JobStatus::Cancelled => {
                ctx.cancel.cancel();
                Err(StageError::Cancelled)
            }
            other => {
                ctx.cancel.cancel();
                warn!(
                    job_id,
                    status = other.as_str(),
                    "job no longer PROCESSING; dropping current work"
                );
                Err(StageError::Cancelled)
            }
        }
    }
}

fn fatal(err: crate::repository::RepositoryError) -> StageError {
    StageError::Fatal {
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::NullBroadcast;
    use crate::models::{JobMetadata, JobType};
    use crate::repository::JobRepository;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tempfile::TempDir;

    const MATTER: &str = "1f0e2ab4-9c7d-4e2f-8a61-3bb1c0de9f12";

    struct CountingHandler {
        items: Vec<String>,
        calls: AtomicUsize,
        fail_item: Option<(String, bool)>,
        policy: ItemFailurePolicy,
    }

    impl CountingHandler {
        fn new(count: usize) -> Self {
            Self {
                items: (0..count).map(|i| i.to_string()).collect(),
                calls: AtomicUsize::new(0),
                fail_item: None,
                policy: ItemFailurePolicy::Strict,
            }
        }
    }

    #[async_trait]
    impl StageHandler for CountingHandler {
        fn name(&self) -> &'static str {
            "embedding"
        }

        async fn plan(&self, _ctx: &StageContext) -> Result<Vec<String>, StageError> {
            Ok(self.items.clone())
        }

        async fn process_item(&self, _ctx: &StageContext, item_id: &str) -> Result<(), StageError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some((bad, retryable)) = &self.fail_item {
                if bad == item_id {
                    return Err(StageError::Item {
                        item_id: item_id.to_string(),
                        class: "PERMANENT".into(),
                        message: "boom".into(),
                        retryable: *retryable,
                    });
                }
            }
            Ok(())
        }

        fn failure_policy(&self) -> ItemFailurePolicy {
            self.policy
        }
    }

    async fn setup() -> (TempDir, JobTracker, StageExecutor) {
        let dir = TempDir::new().unwrap();
        let repo = Arc::new(JobRepository::new(&dir.path().join("t.db")).unwrap());
        let tracker = JobTracker::new(repo, Arc::new(NullBroadcast));
        let executor = StageExecutor::new(
            tracker.clone(),
            Duration::from_secs(30),
            Duration::from_secs(60),
        );
        (dir, tracker, executor)
    }

    async fn make_job(tracker: &JobTracker) -> ProcessingJob {
        let job = tracker
            .create(
                MATTER,
                Some("doc-1"),
                JobType::DocumentProcessing,
                3,
                JobMetadata::default(),
            )
            .await
            .unwrap();
        tracker.repo().mark_processing_if_queued(&job.id).unwrap();
        tracker.repo().get_required(&job.id).unwrap()
    }

    #[tokio::test]
    async fn test_zero_items_completes_at_ceiling() {
        let (_dir, tracker, executor) = setup().await;
        let job = make_job(&tracker).await;

        let handler = CountingHandler::new(0);
        let outcome = executor.execute(&job, &handler, false).await.unwrap();
        assert_eq!(outcome.processed, 0);

        let job = tracker.repo().get_required(&job.id).unwrap();
        // embedding is stage index 3 of 7; ceiling 4*100/7 = 57.
        assert_eq!(job.progress_pct, 57);
        assert_eq!(job.completed_stages, 4);
    }

    #[tokio::test]
    async fn test_resume_skips_processed_items() {
        let (_dir, tracker, executor) = setup().await;
        let job = make_job(&tracker).await;

        // Simulate a prior run that finished items 0..=62.
        let partial = PartialProgressTracker::new(&job.id, tracker.clone());
        let mut stage = partial.get_or_create("embedding").unwrap();
        stage.total_items = 100;
        for i in 0..=62 {
            stage.mark_done(&i.to_string());
        }
        partial.flush(&stage, true).await.unwrap();

        let handler = CountingHandler::new(100);
        let outcome = executor.execute(&job, &handler, false).await.unwrap();
        assert_eq!(outcome.processed, 100);
        // Only the 37 unprocessed items were handed to the handler.
        assert_eq!(handler.calls.load(Ordering::SeqCst), 37);
    }

    #[tokio::test]
    async fn test_force_reprocesses_everything() {
        let (_dir, tracker, executor) = setup().await;
        let job = make_job(&tracker).await;

        let partial = PartialProgressTracker::new(&job.id, tracker.clone());
        let mut stage = partial.get_or_create("embedding").unwrap();
        stage.total_items = 5;
        for i in 0..5 {
            stage.mark_done(&i.to_string());
        }
        partial.flush(&stage, true).await.unwrap();

        let handler = CountingHandler::new(5);
        executor.execute(&job, &handler, true).await.unwrap();
        assert_eq!(handler.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_transient_failure_keeps_progress() {
        let (_dir, tracker, executor) = setup().await;
        let job = make_job(&tracker).await;

        let mut handler = CountingHandler::new(5);
        handler.fail_item = Some(("3".to_string(), true));
        let err = executor.execute(&job, &handler, false).await.unwrap_err();
        assert!(err.retryable());

        // Items 0..=2 survived into metadata for the retry.
        let saved = tracker.repo().get_required(&job.id).unwrap();
        let progress = saved.metadata.partial_progress.get("embedding").unwrap();
        assert_eq!(progress.processed_items.len(), 3);
        assert!(progress.is_done("2"));
    }

    #[tokio::test]
    async fn test_tolerant_policy_records_and_continues() {
        let (_dir, tracker, executor) = setup().await;
        let job = make_job(&tracker).await;

        let mut handler = CountingHandler::new(4);
        handler.fail_item = Some(("1".to_string(), false));
        handler.policy = ItemFailurePolicy::Tolerant;

        let outcome = executor.execute(&job, &handler, false).await.unwrap();
        assert_eq!(outcome.processed, 3);
        assert_eq!(outcome.failed, 1);

        let saved = tracker.repo().get_required(&job.id).unwrap();
        let progress = saved.metadata.partial_progress.get("embedding").unwrap();
        assert_eq!(progress.failed_items.get("1").unwrap(), "boom");
    }

    #[tokio::test]
    async fn test_cancelled_job_stops_between_items() {
        let (_dir, tracker, executor) = setup().await;
        let job = make_job(&tracker).await;

        tracker
            .update(
                &job.id,
                JobUpdate {
                    status: Some(JobStatus::Cancelled),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let handler = CountingHandler::new(3);
        let err = executor.execute(&job, &handler, false).await.unwrap_err();
        assert!(matches!(err, StageError::Cancelled));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }
}
