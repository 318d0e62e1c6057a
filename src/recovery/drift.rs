//! Status-drift reconciliation.
//!
//! Stage tasks can run standalone (outside a managed job) and leave the job
//! record behind reality. This sweep infers the actual stage from downstream
//! artifact counts and writes the difference back.
//!
//! Known limitation: the inference reads zero downstream rows as "stage not
//! reached", so a stage that is legitimately in progress but has produced
//! nothing yet (entity extraction mid-flight with zero entities) can be
//! misclassified and rewound. Writes are logged with old/new values and the
//! partial-progress map is never touched, so no resumable work is lost.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::models::{JobStatus, JobUpdate};
use crate::repository::DocumentRepository;
use crate::tracking::JobTracker;

#[derive(Debug, Clone, Default, Serialize)]
pub struct DriftSummary {
    pub checked: usize,
    pub synced: usize,
    pub errors: Vec<String>,
}

pub struct DriftReconciler {
    tracker: JobTracker,
    docs: Arc<DocumentRepository>,
}

impl DriftReconciler {
    pub fn new(tracker: JobTracker, docs: Arc<DocumentRepository>) -> Self {
        Self { tracker, docs }
    }

    /// Infer (stage, progress) from downstream counts.
    fn infer(counts: &crate::repository::DownstreamCounts) -> (&'static str, u8) {
        if counts.chunk_count == 0 {
            ("chunking", 40)
        } else if counts.embedded_count < counts.chunk_count {
            ("embedding", 60)
        } else if counts.entity_count == 0 {
            ("entity_extraction", 70)
        } else {
            ("alias_resolution", 80)
        }
    }

    pub async fn run(&self, stale_minutes: i64) -> DriftSummary {
        let cutoff = Utc::now() - chrono::Duration::minutes(stale_minutes);
        let stale = match self.tracker.repo().find_stale_active(cutoff) {
            Ok(stale) => stale,
            Err(e) => {
                warn!(error = %e, "drift scan failed");
                return DriftSummary {
                    errors: vec![e.to_string()],
                    ..Default::default()
                };
            }
        };

        let mut summary = DriftSummary {
            checked: stale.len(),
            ..Default::default()
        };

        for job in &stale {
            let document_id = match &job.document_id {
                Some(document_id) => document_id,
                None => continue,
            };

            let counts = match self.docs.downstream_counts(document_id, &job.matter_id) {
                Ok(counts) => counts,
                Err(e) => {
                    summary.errors.push(format!("job {}: {e}", job.id));
                    continue;
                }
            };

            let (actual_stage, actual_progress) = Self::infer(&counts);
            let unchanged = job.current_stage.as_deref() == Some(actual_stage)
                && job.progress_pct == actual_progress;
            if unchanged {
                continue;
            }

            let result = self
                .tracker
                .update(
                    &job.id,
                    JobUpdate {
                        status: Some(JobStatus::Queued),
                        current_stage: Some(Some(actual_stage.to_string())),
                        progress_pct: Some(actual_progress),
                        ..Default::default()
                    },
                )
                .await;

            match result {
                Ok(_) => {
                    summary.synced += 1;
                    info!(
                        job_id = %job.id,
                        old_stage = job.current_stage.as_deref().unwrap_or(""),
                        new_stage = actual_stage,
                        old_progress = job.progress_pct,
                        new_progress = actual_progress,
                        "job status reconciled against downstream state"
                    );
                }
                Err(e) => summary.errors.push(format!("job {}: {e}", job.id)),
            }
        }

        info!(
            synced = summary.synced,
            total = summary.checked,
            errors = summary.errors.len(),
            "status drift sweep complete"
        );
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::NullBroadcast;
    use crate::models::{JobMetadata, JobType};
    use crate::repository::JobRepository;
    use tempfile::TempDir;

    const MATTER: &str = "1f0e2ab4-9c7d-4e2f-8a61-3bb1c0de9f12";

    struct Fixture {
        _dir: TempDir,
        tracker: JobTracker,
        docs: Arc<DocumentRepository>,
        reconciler: DriftReconciler,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("t.db");
        let jobs = Arc::new(JobRepository::new(&db).unwrap());
        let docs = Arc::new(DocumentRepository::new(&db).unwrap());
        let tracker = JobTracker::new(jobs, Arc::new(NullBroadcast));
        let reconciler = DriftReconciler::new(tracker.clone(), docs.clone());
        Fixture {
            _dir: dir,
            tracker,
            docs,
            reconciler,
        }
    }

    #[tokio::test]
    async fn test_infers_embedding_when_chunks_unembedded() {
        let fixture = fixture();
        let doc = fixture
            .docs
            .create(MATTER, "a.pdf", "p", 5)
            .unwrap();
        let job = fixture
            .tracker
            .create(MATTER, Some(&doc.id), JobType::DocumentProcessing, 3, JobMetadata::default())
            .await
            .unwrap();

        let ids = fixture
            .docs
            .replace_text_chunks(MATTER, &doc.id, &["one".into(), "two".into()])
            .unwrap();
        fixture.docs.mark_chunk_embedded(&ids[0]).unwrap();

        // Cutoff in the future makes the fresh job eligible.
        let summary = fixture.reconciler.run(-1).await;
        assert_eq!(summary.synced, 1);

        let synced = fixture.tracker.repo().get_required(&job.id).unwrap();
        assert_eq!(synced.current_stage.as_deref(), Some("embedding"));
        assert_eq!(synced.progress_pct, 60);
        assert_eq!(synced.status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn test_no_write_when_already_correct() {
        let fixture = fixture();
        let doc = fixture.docs.create(MATTER, "a.pdf", "p", 5).unwrap();
        let job = fixture
            .tracker
            .create(MATTER, Some(&doc.id), JobType::DocumentProcessing, 3, JobMetadata::default())
            .await
            .unwrap();
        fixture
            .tracker
            .update(
                &job.id,
                JobUpdate {
                    current_stage: Some(Some("chunking".into())),
                    progress_pct: Some(40),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let summary = fixture.reconciler.run(-1).await;
        assert_eq!(summary.synced, 0);
    }

    #[test]
    fn test_inference_bands() {
        use crate::repository::DownstreamCounts;
        assert_eq!(
            DriftReconciler::infer(&DownstreamCounts::default()),
            ("chunking", 40)
        );
        assert_eq!(
            DriftReconciler::infer(&DownstreamCounts {
                chunk_count: 4,
                embedded_count: 4,
                entity_count: 0
            }),
            ("entity_extraction", 70)
        );
        assert_eq!(
            DriftReconciler::infer(&DownstreamCounts {
                chunk_count: 4,
                embedded_count: 4,
                entity_count: 9
            }),
            ("alias_resolution", 80)
        );
    }
}
