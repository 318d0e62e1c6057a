//! Job tracking: state writes that fan out progress events.

mod chunks;
mod partial;

pub use chunks::{format_chunk_failure_message, ChunkProgressTracker};
pub use partial::PartialProgressTracker;

use std::sync::Arc;

use crate::broadcast::{matter_channel, Broadcast, JobProgressEvent};
use crate::models::{JobMetadata, JobType, JobUpdate, ProcessingJob};
use crate::repository::{JobRepository, Result};

/// Wraps the job store so every state-changing write also publishes a
/// progress event on the owning matter's channel.
#[derive(Clone)]
pub struct JobTracker {
    repo: Arc<JobRepository>,
    broadcast: Arc<dyn Broadcast>,
}

impl JobTracker {
    pub fn new(repo: Arc<JobRepository>, broadcast: Arc<dyn Broadcast>) -> Self {
        Self { repo, broadcast }
    }

    pub fn repo(&self) -> &JobRepository {
        &self.repo
    }

    pub async fn create(
        &self,
        matter_id: &str,
        document_id: Option<&str>,
        job_type: JobType,
        max_retries: u32,
        metadata: JobMetadata,
    ) -> Result<ProcessingJob> {
        let job = self
            .repo
            .create(matter_id, document_id, job_type, max_retries, metadata)?;
        self.publish(&job).await;
        Ok(job)
    }

    /// Apply a patch and broadcast the resulting state.
    pub async fn update(&self, job_id: &str, patch: JobUpdate) -> Result<ProcessingJob> {
        let broadcast_worthy = patch.status.is_some()
            || patch.current_stage.is_some()
            || patch.progress_pct.is_some()
            || patch.error_message.is_some();
        let job = self.repo.update(job_id, patch)?;
        if broadcast_worthy {
            self.publish(&job).await;
        }
        Ok(job)
    }

    pub fn heartbeat(&self, job_id: &str) -> Result<()> {
        self.repo.heartbeat(job_id)
    }

    /// Re-read a job and publish its current state. Used after guarded
    /// writes that bypass `update` (sweeper compare-and-swaps).
    pub async fn publish_current(&self, job_id: &str) -> Result<()> {
        let job = self.repo.get_required(job_id)?;
        self.publish(&job).await;
        Ok(())
    }

    async fn publish(&self, job: &ProcessingJob) {
        self.broadcast
            .publish(
                &matter_channel(&job.matter_id),
                JobProgressEvent {
                    job_id: job.id.clone(),
                    matter_id: job.matter_id.clone(),
                    document_id: job.document_id.clone(),
                    status: job.status,
                    stage: job.current_stage.clone(),
                    progress_pct: job.progress_pct,
                    error_message: job.error_message.clone(),
                },
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::ChannelBroadcast;
    use crate::models::JobStatus;
    use tempfile::TempDir;

    const MATTER: &str = "1f0e2ab4-9c7d-4e2f-8a61-3bb1c0de9f12";

    #[tokio::test]
    async fn test_update_publishes_progress_event() {
        let dir = TempDir::new().unwrap();
        let repo = Arc::new(JobRepository::new(&dir.path().join("t.db")).unwrap());
        let broadcast = Arc::new(ChannelBroadcast::default());
        let tracker = JobTracker::new(repo, broadcast.clone());

        let mut rx = broadcast.subscribe(&matter_channel(MATTER));
        let job = tracker
            .create(MATTER, None, JobType::Ocr, 3, JobMetadata::default())
            .await
            .unwrap();
        tracker
            .update(
                &job.id,
                JobUpdate {
                    status: Some(JobStatus::Processing),
                    progress_pct: Some(12),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let created = rx.recv().await.unwrap();
        assert_eq!(created.status, JobStatus::Queued);
        let updated = rx.recv().await.unwrap();
        assert_eq!(updated.status, JobStatus::Processing);
        assert_eq!(updated.progress_pct, 12);
    }
}
