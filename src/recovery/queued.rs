//! Stuck-QUEUED re-dispatch.
//!
//! Jobs can land in QUEUED with no task behind them (manual recovery,
//! database edits, a dispatch lost at a crash). This sweep re-dispatches the
//! right task for wherever the job got to.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::queue::{Task, TaskQueue};
use crate::tracking::JobTracker;

/// Small delay so a burst of re-dispatches does not land at once.
const DISPATCH_COUNTDOWN: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Default, Serialize)]
pub struct StuckQueuedSummary {
    pub checked: usize,
    pub dispatched: usize,
    pub errors: Vec<String>,
}

pub struct StuckQueuedDispatcher {
    tracker: JobTracker,
    queue: Arc<dyn TaskQueue>,
}

impl StuckQueuedDispatcher {
    pub fn new(tracker: JobTracker, queue: Arc<dyn TaskQueue>) -> Self {
        Self { tracker, queue }
    }

    pub async fn run(&self, stale_minutes: i64) -> StuckQueuedSummary {
        let cutoff = Utc::now() - chrono::Duration::minutes(stale_minutes);
        let stuck = match self.tracker.repo().find_stuck_queued(cutoff) {
            Ok(stuck) => stuck,
            Err(e) => {
                warn!(error = %e, "stuck queued scan failed");
                return StuckQueuedSummary {
                    errors: vec![e.to_string()],
                    ..Default::default()
                };
            }
        };

        let mut summary = StuckQueuedSummary {
            checked: stuck.len(),
            ..Default::default()
        };

        for job in &stuck {
            let document_id = match &job.document_id {
                Some(document_id) => document_id.clone(),
                None => {
                    summary
                        .errors
                        .push(format!("job {}: no document_id", job.id));
                    continue;
                }
            };

            // Dispatch by where the job says it got to; stage-specific tasks
            // force past "already done" short-circuits.
            let task = match job.current_stage.as_deref() {
                Some("embedding") => Task::StageTask {
                    job_id: job.id.clone(),
                    stage: "embedding".to_string(),
                    force: true,
                },
                Some("entity_extraction") => Task::StageTask {
                    job_id: job.id.clone(),
                    stage: "entity_extraction".to_string(),
                    force: true,
                },
                _ => Task::ProcessDocument {
                    document_id: document_id.clone(),
                },
            };

            self.queue.dispatch(task, DISPATCH_COUNTDOWN).await;
            summary.dispatched += 1;
            info!(
                job_id = %job.id,
                document_id = %document_id,
                stage = job.current_stage.as_deref().unwrap_or(""),
                "stuck queued job dispatched"
            );

            // Touch so the next sweep does not immediately re-dispatch.
            if let Err(e) = self.tracker.repo().touch(&job.id) {
                summary.errors.push(format!("job {}: {e}", job.id));
            }
        }

        info!(
            dispatched = summary.dispatched,
            total = summary.checked,
            errors = summary.errors.len(),
            "stuck queued sweep complete"
        );
        summary
    }
}
