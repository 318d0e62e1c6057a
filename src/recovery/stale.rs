//! Stale-PROCESSING detection and recovery.
//!
//! A job is stale when its last activity (heartbeat when present, otherwise
//! the last update) is older than the timeout. Recovery re-queues the job
//! and re-dispatches its pipeline task; a job recovered too many times is
//! failed instead.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::cache::MatterQueryCache;
use crate::config::Settings;
use crate::models::{DocumentStatus, JobStatus, JobUpdate, ProcessingJob};
use crate::queue::{Task, TaskQueue};
use crate::repository::{DocumentRepository, RepositoryError};
use crate::tracking::JobTracker;

/// Delay before the recovered job's task fires, to avoid a retry storm.
const REDISPATCH_COUNTDOWN: Duration = Duration::from_secs(5);

/// Result of one job's recovery attempt.
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryOutcome {
    pub job_id: String,
    pub success: bool,
    /// "requeued" | "marked_failed" | "skipped"
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recovery_attempt: Option<u32>,
}

/// Summary of one sweep.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoverySummary {
    pub checked: usize,
    pub recovered: usize,
    pub failed: usize,
    pub jobs: Vec<RecoveryOutcome>,
}

/// Payload for the recovery stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryStats {
    pub stale_jobs_count: usize,
    pub recovered_last_hour: u64,
    pub stale_jobs: Vec<StaleJobBrief>,
    pub configuration: RecoveryConfiguration,
}

#[derive(Debug, Clone, Serialize)]
pub struct StaleJobBrief {
    pub id: String,
    pub matter_id: String,
    pub document_id: Option<String>,
    pub current_stage: Option<String>,
    pub recovery_attempts: u32,
    pub last_activity: chrono::DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecoveryConfiguration {
    pub stale_timeout_minutes: i64,
    pub max_recovery_retries: u32,
    pub recovery_enabled: bool,
}

pub struct StaleJobRecovery {
    tracker: JobTracker,
    docs: Arc<DocumentRepository>,
    queue: Arc<dyn TaskQueue>,
    cache: Arc<MatterQueryCache>,
    settings: Arc<Settings>,
}

impl StaleJobRecovery {
    pub fn new(
        tracker: JobTracker,
        docs: Arc<DocumentRepository>,
        queue: Arc<dyn TaskQueue>,
        cache: Arc<MatterQueryCache>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            tracker,
            docs,
            queue,
            cache,
            settings,
        }
    }

    /// Jobs stuck in PROCESSING past the timeout.
    pub fn find_stale_jobs(
        &self,
        timeout_minutes: Option<i64>,
    ) -> Result<Vec<ProcessingJob>, RepositoryError> {
        let timeout = timeout_minutes.unwrap_or(self.settings.job_stale_timeout_minutes);
        let cutoff = Utc::now() - chrono::Duration::minutes(timeout);
        let stale = self.tracker.repo().find_stale_processing(cutoff)?;
        if !stale.is_empty() {
            warn!(
                count = stale.len(),
                timeout_minutes = timeout,
                "stale jobs detected"
            );
        }
        Ok(stale)
    }

    /// Recover one stale job, re-verifying its state first.
    pub async fn recover_job(&self, job_id: &str) -> RecoveryOutcome {
        let job = match self.tracker.repo().get(job_id) {
            Ok(Some(job)) => job,
            Ok(None) => {
                return RecoveryOutcome {
                    job_id: job_id.to_string(),
                    success: false,
                    action: "skipped".into(),
                    error: Some("job not found".into()),
                    recovery_attempt: None,
                }
            }
            Err(e) => {
                return RecoveryOutcome {
                    job_id: job_id.to_string(),
                    success: false,
                    action: "skipped".into(),
                    error: Some(e.to_string()),
                    recovery_attempt: None,
                }
            }
        };

        if job.status != JobStatus::Processing {
            return RecoveryOutcome {
                job_id: job_id.to_string(),
                success: false,
                action: "skipped".into(),
                error: Some(format!(
                    "job no longer in PROCESSING state (current: {})",
                    job.status.as_str()
                )),
                recovery_attempt: None,
            };
        }

        let attempts = job.metadata.recovery_attempts;
        if attempts >= self.settings.job_max_recovery_retries {
            self.mark_permanently_failed(&job).await;
            return RecoveryOutcome {
                job_id: job_id.to_string(),
                success: false,
                action: "marked_failed".into(),
                error: Some(format!(
                    "Max recovery attempts ({}) exceeded",
                    self.settings.job_max_recovery_retries
                )),
                recovery_attempt: Some(attempts),
            };
        }

        let mut metadata = job.metadata.clone();
        metadata.recovery_attempts = attempts + 1;
        metadata.last_recovery_at = Some(Utc::now());
        metadata.recovered_from_stage = job.current_stage.clone();

        // Guarded transition: only moves PROCESSING -> QUEUED while the row
        // is still PROCESSING. A worker that woke up in the meantime wins.
        if let Err(e) = self
            .tracker
            .repo()
            .requeue_if_still_processing(&job.id, &metadata)
        {
            return RecoveryOutcome {
                job_id: job_id.to_string(),
                success: false,
                action: "skipped".into(),
                error: Some(e.to_string()),
                recovery_attempt: None,
            };
        }
        let _ = self.tracker.publish_current(&job.id).await;

        if let Some(document_id) = &job.document_id {
            if let Err(e) = self.docs.set_status(document_id, DocumentStatus::Pending) {
                warn!(document_id, error = %e, "document status reset failed");
            }
            self.cache.invalidate_matter(&job.matter_id);
            self.queue
                .dispatch(
                    Task::ProcessDocument {
                        document_id: document_id.clone(),
                    },
                    REDISPATCH_COUNTDOWN,
                )
                .await;
        }

        info!(
            job_id,
            document_id = job.document_id.as_deref().unwrap_or(""),
            recovery_attempt = attempts + 1,
            previous_stage = job.current_stage.as_deref().unwrap_or(""),
            "job recovered"
        );

        RecoveryOutcome {
            job_id: job_id.to_string(),
            success: true,
            action: "requeued".into(),
            error: None,
            recovery_attempt: Some(attempts + 1),
        }
    }

    /// Find and recover all stale jobs. Honors the recovery kill-switch.
    pub async fn recover_all(&self) -> RecoverySummary {
        if !self.settings.job_recovery_enabled {
            info!("job recovery disabled in config");
            return RecoverySummary::default();
        }

        let stale = match self.find_stale_jobs(None) {
            Ok(stale) => stale,
            Err(e) => {
                warn!(error = %e, "stale job detection failed");
                return RecoverySummary::default();
            }
        };

        let mut summary = RecoverySummary {
            checked: stale.len(),
            ..Default::default()
        };
        for job in &stale {
            let outcome = self.recover_job(&job.id).await;
            if outcome.success {
                summary.recovered += 1;
            } else {
                summary.failed += 1;
            }
            summary.jobs.push(outcome);
        }

        info!(
            total = summary.checked,
            recovered = summary.recovered,
            failed = summary.failed,
            "batch job recovery complete"
        );
        summary
    }

    pub fn stats(&self) -> Result<RecoveryStats, RepositoryError> {
        let stale = self.find_stale_jobs(None)?;
        let recovered_last_hour = self
            .tracker
            .repo()
            .count_recovered_since(Utc::now() - chrono::Duration::hours(1))?;

        Ok(RecoveryStats {
            stale_jobs_count: stale.len(),
            recovered_last_hour,
            stale_jobs: stale
                .iter()
                .map(|job| StaleJobBrief {
                    id: job.id.clone(),
                    matter_id: job.matter_id.clone(),
                    document_id: job.document_id.clone(),
                    current_stage: job.current_stage.clone(),
                    recovery_attempts: job.metadata.recovery_attempts,
                    last_activity: job.last_activity(),
                })
                .collect(),
            configuration: RecoveryConfiguration {
                stale_timeout_minutes: self.settings.job_stale_timeout_minutes,
                max_recovery_retries: self.settings.job_max_recovery_retries,
                recovery_enabled: self.settings.job_recovery_enabled,
            },
        })
    }

    async fn mark_permanently_failed(&self, job: &ProcessingJob) {
        let message = format!(
            "Job failed after {} recovery attempts",
            self.settings.job_max_recovery_retries
        );
        let _ = self
            .tracker
            .update(
                &job.id,
                JobUpdate {
                    status: Some(JobStatus::Failed),
                    error_message: Some(Some(message)),
                    error_code: Some(Some("RECOVERY_EXHAUSTED".to_string())),
                    ..Default::default()
                },
            )
            .await;
        if let Some(document_id) = &job.document_id {
            let _ = self.docs.set_status(document_id, DocumentStatus::Failed);
            self.cache.invalidate_matter(&job.matter_id);
        }
        warn!(
            job_id = %job.id,
            document_id = job.document_id.as_deref().unwrap_or(""),
            recovery_attempts = job.metadata.recovery_attempts,
            "job marked permanently failed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::NullBroadcast;
    use crate::models::{JobMetadata, JobType};
    use crate::queue::MemoryTaskQueue;
    use crate::repository::JobRepository;
    use tempfile::TempDir;

    const MATTER: &str = "1f0e2ab4-9c7d-4e2f-8a61-3bb1c0de9f12";

    struct Fixture {
        _dir: TempDir,
        tracker: JobTracker,
        docs: Arc<DocumentRepository>,
        queue: Arc<MemoryTaskQueue>,
        recovery: StaleJobRecovery,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("t.db");
        let jobs = Arc::new(JobRepository::new(&db).unwrap());
        let docs = Arc::new(DocumentRepository::new(&db).unwrap());
        let queue = MemoryTaskQueue::new(64);
        let tracker = JobTracker::new(jobs, Arc::new(NullBroadcast));
        let recovery = StaleJobRecovery::new(
            tracker.clone(),
            docs.clone(),
            queue.clone(),
            Arc::new(MatterQueryCache::new()),
            Arc::new(Settings::default()),
        );
        Fixture {
            _dir: dir,
            tracker,
            docs,
            queue,
            recovery,
        }
    }

    async fn processing_job(fixture: &Fixture, recovery_attempts: u32) -> ProcessingJob {
        let doc = fixture
            .docs
            .create(MATTER, "contract.pdf", "m/contract.pdf", 10)
            .unwrap();
        let mut metadata = JobMetadata::default();
        metadata.recovery_attempts = recovery_attempts;
        let job = fixture
            .tracker
            .create(
                MATTER,
                Some(&doc.id),
                JobType::DocumentProcessing,
                3,
                metadata,
            )
            .await
            .unwrap();
        fixture
            .tracker
            .repo()
            .mark_processing_if_queued(&job.id)
            .unwrap();
        fixture.tracker.repo().get_required(&job.id).unwrap()
    }

    #[tokio::test]
    async fn test_recover_requeues_and_counts_attempt() {
        let fixture = fixture();
        let job = processing_job(&fixture, 0).await;

        let outcome = fixture.recovery.recover_job(&job.id).await;
        assert!(outcome.success);
        assert_eq!(outcome.action, "requeued");
        assert_eq!(outcome.recovery_attempt, Some(1));

        let recovered = fixture.tracker.repo().get_required(&job.id).unwrap();
        assert_eq!(recovered.status, JobStatus::Queued);
        assert_eq!(recovered.metadata.recovery_attempts, 1);
        assert!(recovered.metadata.last_recovery_at.is_some());
        assert!(recovered.error_message.is_none());

        // Document reset to PENDING, pipeline task re-dispatched.
        let doc = fixture
            .docs
            .get_required(job.document_id.as_ref().unwrap())
            .unwrap();
        assert_eq!(doc.status, DocumentStatus::Pending);
        assert_eq!(fixture.queue.depth(), 1);
    }

    #[tokio::test]
    async fn test_third_attempt_marks_failed() {
        let fixture = fixture();
        let job = processing_job(&fixture, 3).await;

        let outcome = fixture.recovery.recover_job(&job.id).await;
        assert!(!outcome.success);
        assert_eq!(outcome.action, "marked_failed");

        let failed = fixture.tracker.repo().get_required(&job.id).unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(
            failed.error_message.as_deref(),
            Some("Job failed after 3 recovery attempts")
        );
        let doc = fixture
            .docs
            .get_required(job.document_id.as_ref().unwrap())
            .unwrap();
        assert_eq!(doc.status, DocumentStatus::Failed);
        // No task dispatched for a dead job.
        assert_eq!(fixture.queue.depth(), 0);
    }

    #[tokio::test]
    async fn test_recover_skips_non_processing() {
        let fixture = fixture();
        let job = processing_job(&fixture, 0).await;
        fixture
            .tracker
            .update(
                &job.id,
                JobUpdate {
                    status: Some(JobStatus::Completed),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let outcome = fixture.recovery.recover_job(&job.id).await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("no longer in PROCESSING"));
    }

    #[tokio::test]
    async fn test_find_stale_uses_heartbeat_over_updated_at() {
        let fixture = fixture();
        let job = processing_job(&fixture, 0).await;

        // Fresh heartbeat: not stale even with a permissive timeout of 0.
        fixture.tracker.repo().heartbeat(&job.id).unwrap();
        let stale = fixture.recovery.find_stale_jobs(Some(1)).unwrap();
        assert!(stale.is_empty());
    }
}
