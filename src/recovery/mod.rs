//! Recovery sweepers: the periodic tasks that mend anomalies.
//!
//! Three job sweeps (stale-PROCESSING recovery, stuck-QUEUED re-dispatch,
//! status-drift reconciliation) plus chunk garbage collection. Each emits a
//! summary and relies on guarded writes so a worker that is actually alive
//! always wins the race.

mod chunk_gc;
mod drift;
mod queued;
mod stale;

pub use chunk_gc::{ChunkGc, ChunkGcSummary};
pub use drift::{DriftReconciler, DriftSummary};
pub use queued::{StuckQueuedDispatcher, StuckQueuedSummary};
pub use stale::{RecoveryOutcome, RecoveryStats, RecoverySummary, StaleJobRecovery};

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::queue::{Task, TaskQueue};

/// Enqueue the maintenance tasks on a fixed tick until shutdown.
///
/// The sweeps run as ordinary queue tasks so a single worker pool drains
/// both pipeline and maintenance work.
pub async fn run_maintenance_timer(
    queue: Arc<dyn TaskQueue>,
    tick: Duration,
    stuck_queued_minutes: i64,
    drift_minutes: i64,
    chunk_retention_hours: i64,
) {
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        info!("maintenance tick");
        queue.dispatch(Task::RecoverStaleJobs, Duration::ZERO).await;
        queue
            .dispatch(
                Task::DispatchStuckQueued {
                    stale_minutes: stuck_queued_minutes,
                },
                Duration::ZERO,
            )
            .await;
        queue
            .dispatch(
                Task::SyncStaleJobStatus {
                    stale_minutes: drift_minutes,
                },
                Duration::ZERO,
            )
            .await;
        queue
            .dispatch(
                Task::CleanupStaleChunks {
                    retention_hours: chunk_retention_hours,
                },
                Duration::ZERO,
            )
            .await;
    }
}
