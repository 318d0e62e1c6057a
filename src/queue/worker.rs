//! Worker tier: long-running consumers of the task queue.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::{Task, TaskQueue};
use crate::eta::WorkerCountProvider;
use crate::ocr::OcrChunkCoordinator;
use crate::pipeline::PipelineOrchestrator;
use crate::recovery::{ChunkGc, DriftReconciler, StaleJobRecovery, StuckQueuedDispatcher};

/// Routes tasks to the component that owns them. One dispatcher is shared
/// by every worker.
pub struct TaskDispatcher {
    pub orchestrator: Arc<PipelineOrchestrator>,
    pub coordinator: Arc<OcrChunkCoordinator>,
    pub stale_recovery: Arc<StaleJobRecovery>,
    pub stuck_queued: Arc<StuckQueuedDispatcher>,
    pub drift: Arc<DriftReconciler>,
    pub chunk_gc: Arc<ChunkGc>,
}

impl TaskDispatcher {
    pub async fn handle(&self, task: Task) {
        debug!(?task, "worker picked up task");
        match task {
            Task::ProcessDocument { document_id } => {
                self.orchestrator.run_next_stage(&document_id).await;
            }
            Task::OcrChunk { chunk_id, attempt } => {
                self.coordinator.process_chunk(&chunk_id, attempt).await;
            }
            Task::StageTask {
                job_id,
                stage,
                force,
            } => {
                self.orchestrator.run_stage_task(&job_id, &stage, force).await;
            }
            Task::RecoverStaleJobs => {
                let summary = self.stale_recovery.recover_all().await;
                debug!(
                    recovered = summary.recovered,
                    failed = summary.failed,
                    "stale job sweep done"
                );
            }
            Task::DispatchStuckQueued { stale_minutes } => {
                self.stuck_queued.run(stale_minutes).await;
            }
            Task::SyncStaleJobStatus { stale_minutes } => {
                self.drift.run(stale_minutes).await;
            }
            Task::CleanupStaleChunks { retention_hours } => {
                self.chunk_gc.run(retention_hours).await;
            }
        }
    }
}

/// A pool of workers draining the queue until it closes.
pub struct WorkerPool {
    active: Arc<AtomicUsize>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(
        queue: Arc<dyn TaskQueue>,
        dispatcher: Arc<TaskDispatcher>,
        workers: usize,
    ) -> Self {
        Self::spawn_with_gauge(queue, dispatcher, workers, Arc::new(AtomicUsize::new(0)))
    }

    /// Spawn with an externally owned gauge so the ETA estimator can observe
    /// the pool it was built before.
    pub fn spawn_with_gauge(
        queue: Arc<dyn TaskQueue>,
        dispatcher: Arc<TaskDispatcher>,
        workers: usize,
        active: Arc<AtomicUsize>,
    ) -> Self {
        let mut handles = Vec::with_capacity(workers);

        for worker_id in 0..workers.max(1) {
            let queue = queue.clone();
            let dispatcher = dispatcher.clone();
            let active = active.clone();

            let handle = tokio::spawn(async move {
                active.fetch_add(1, Ordering::SeqCst);
                info!(worker_id, "worker started");
                while let Some(task) = queue.recv().await {
                    dispatcher.handle(task).await;
                }
                active.fetch_sub(1, Ordering::SeqCst);
                info!(worker_id, "worker stopped");
            });
            handles.push(handle);
        }

        Self { active, handles }
    }

    /// Live-worker gauge for the ETA estimator.
    pub fn count_provider(&self) -> PoolWorkerCount {
        PoolWorkerCount {
            active: self.active.clone(),
        }
    }

    pub async fn join(self) {
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

/// Worker count sourced from the live pool gauge.
pub struct PoolWorkerCount {
    active: Arc<AtomicUsize>,
}

impl PoolWorkerCount {
    pub fn new(active: Arc<AtomicUsize>) -> Self {
        Self { active }
    }
}

#[async_trait]
impl WorkerCountProvider for PoolWorkerCount {
    async fn active_workers(&self) -> Option<usize> {
        match self.active.load(Ordering::SeqCst) {
            0 => None,
            n => Some(n),
        }
    }
}
