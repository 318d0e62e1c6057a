//! Partial progress preservation across stage retries.
//!
//! Each stage records which item ids it has already processed inside the job
//! metadata. A stage retried after a crash consults the record and skips
//! finished work. Writes are batched: persisting on every item would hammer
//! the job row, and re-doing at most nine idempotent items after a crash is
//! an acceptable trade.

use tracing::{debug, warn};

use super::JobTracker;
use crate::models::{JobUpdate, StageProgress};
use crate::repository::Result;

/// How many processed items between automatic flushes.
const FLUSH_EVERY: usize = 10;

/// Tracks partial progress for one job.
pub struct PartialProgressTracker {
    job_id: String,
    tracker: JobTracker,
}

impl PartialProgressTracker {
    pub fn new(job_id: &str, tracker: JobTracker) -> Self {
        Self {
            job_id: job_id.to_string(),
            tracker,
        }
    }

    /// Load a stage's progress from job metadata, creating a fresh record
    /// when the stage has never run.
    pub fn get_or_create(&self, stage_name: &str) -> Result<StageProgress> {
        let job = self.tracker.repo().get_required(&self.job_id)?;
        Ok(job
            .metadata
            .partial_progress
            .get(stage_name)
            .cloned()
            .unwrap_or_else(|| StageProgress::new(stage_name)))
    }

    /// Persist stage progress into job metadata.
    ///
    /// Unless `force`, only writes when the processed count has reached a
    /// multiple of ten. Stage completion must flush with `force = true`.
    pub async fn flush(&self, stage: &StageProgress, force: bool) -> Result<()> {
        let processed = stage.processed_items.len();
        if !force && processed % FLUSH_EVERY != 0 {
            return Ok(());
        }

        let job = self.tracker.repo().get_required(&self.job_id)?;
        let mut metadata = job.metadata;
        metadata
            .partial_progress
            .insert(stage.stage_name.clone(), stage.clone());

        self.tracker
            .update(
                &self.job_id,
                JobUpdate {
                    metadata: Some(metadata),
                    ..Default::default()
                },
            )
            .await?;

        debug!(
            job_id = %self.job_id,
            stage = %stage.stage_name,
            processed,
            total = stage.total_items,
            "partial progress saved"
        );
        Ok(())
    }

    /// Remove a stage's record, used when deliberately restarting the stage.
    pub async fn clear(&self, stage_name: &str) -> Result<()> {
        let job = self.tracker.repo().get_required(&self.job_id)?;
        let mut metadata = job.metadata;
        if metadata.partial_progress.remove(stage_name).is_none() {
            return Ok(());
        }
        if let Err(e) = self
            .tracker
            .update(
                &self.job_id,
                JobUpdate {
                    metadata: Some(metadata),
                    ..Default::default()
                },
            )
            .await
        {
            warn!(job_id = %self.job_id, stage = stage_name, error = %e, "partial progress clear failed");
            return Err(e);
        }
        Ok(())
    }
}
