//! Composition root: wires repositories, trackers, the pipeline, sweepers,
//! and the HTTP state from one `Settings`. No global mutable state; every
//! dependency is constructor-injected from here.

use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use crate::broadcast::{Broadcast, ChannelBroadcast};
use crate::cache::MatterQueryCache;
use crate::config::Settings;
use crate::eta::{EtaEstimator, MemoryMetrics};
use crate::external::{
    offline::{OfflineEmbedder, OfflineLlm, OfflineOcr, OfflineSearch},
    BlobStore, ExternalEmbedder, ExternalLlm, ExternalOcr, FsBlobStore, SearchIndex,
};
use crate::ocr::OcrChunkCoordinator;
use crate::pipeline::stages::{
    AliasResolutionStage, ChunkingStage, EmbeddingStage, EntityExtractionStage, StageHandlers,
    TimelineStage, ValidationStage,
};
use crate::pipeline::PipelineOrchestrator;
use crate::queue::{MemoryTaskQueue, PoolWorkerCount, TaskDispatcher, WorkerPool};
use crate::rate_limit::{MemoryCounters, RateLimiter};
use crate::recovery::{ChunkGc, DriftReconciler, StaleJobRecovery, StuckQueuedDispatcher};
use crate::repository::{ChunkRepository, DocumentRepository, JobRepository, Result};
use crate::server::AppState;
use crate::tracking::JobTracker;

/// External collaborators, swappable per deployment.
pub struct Collaborators {
    pub ocr: Arc<dyn ExternalOcr>,
    pub embedder: Arc<dyn ExternalEmbedder>,
    pub llm: Arc<dyn ExternalLlm>,
    pub search: Arc<dyn SearchIndex>,
    pub blob: Arc<dyn BlobStore>,
    pub broadcast: Arc<dyn Broadcast>,
}

impl Collaborators {
    /// Offline providers plus filesystem blobs; enough to run the whole
    /// pipeline without credentials.
    pub fn offline(settings: &Settings) -> Self {
        Self {
            ocr: Arc::new(OfflineOcr),
            embedder: Arc::new(OfflineEmbedder),
            llm: Arc::new(OfflineLlm),
            search: Arc::new(OfflineSearch),
            blob: Arc::new(FsBlobStore::new(settings.blob_dir.clone())),
            broadcast: Arc::new(ChannelBroadcast::default()),
        }
    }
}

/// Everything a process needs to serve, work, or sweep.
pub struct Engine {
    pub settings: Arc<Settings>,
    pub queue: Arc<MemoryTaskQueue>,
    pub dispatcher: Arc<TaskDispatcher>,
    pub state: AppState,
    pub worker_gauge: Arc<AtomicUsize>,
}

impl Engine {
    pub fn build(settings: Settings, collaborators: Collaborators) -> Result<Self> {
        let settings = Arc::new(settings);

        let jobs = Arc::new(JobRepository::new(&settings.database_path)?);
        let chunks = Arc::new(ChunkRepository::new(&settings.database_path)?);
        let docs = Arc::new(DocumentRepository::new(&settings.database_path)?);

        let tracker = JobTracker::new(jobs, collaborators.broadcast.clone());
        let cache = Arc::new(MatterQueryCache::new());

        let worker_gauge = Arc::new(AtomicUsize::new(0));
        let eta = Arc::new(EtaEstimator::new(
            Box::new(MemoryMetrics::new()),
            Box::new(PoolWorkerCount::new(worker_gauge.clone())),
            settings.eta_window_size,
            settings.eta_fallback_sec_per_page,
            settings.eta_min_high_confidence_samples,
        ));

        let queue = MemoryTaskQueue::new(1024);

        let coordinator = Arc::new(OcrChunkCoordinator::new(
            tracker.clone(),
            chunks.clone(),
            docs.clone(),
            collaborators.blob.clone(),
            collaborators.ocr.clone(),
            queue.clone(),
            settings.clone(),
        ));

        let stage_handlers: Vec<Arc<dyn crate::pipeline::StageHandler>> = vec![
            Arc::new(ValidationStage::new(collaborators.blob.clone())),
            Arc::new(ChunkingStage::new(docs.clone(), collaborators.blob.clone())),
            Arc::new(EmbeddingStage::new(
                docs.clone(),
                collaborators.embedder.clone(),
                collaborators.search.clone(),
            )),
            Arc::new(EntityExtractionStage::new(
                docs.clone(),
                collaborators.llm.clone(),
            )),
            Arc::new(AliasResolutionStage::new(docs.clone())),
            Arc::new(TimelineStage::new(
                collaborators.blob.clone(),
                collaborators.llm.clone(),
            )),
        ];
        let handlers = StageHandlers::new(stage_handlers);

        let orchestrator = Arc::new(PipelineOrchestrator::new(
            tracker.clone(),
            docs.clone(),
            queue.clone(),
            cache.clone(),
            eta.clone(),
            settings.clone(),
            handlers,
            coordinator.clone(),
        ));

        let stale_recovery = Arc::new(StaleJobRecovery::new(
            tracker.clone(),
            docs.clone(),
            queue.clone(),
            cache.clone(),
            settings.clone(),
        ));
        let stuck_queued = Arc::new(StuckQueuedDispatcher::new(tracker.clone(), queue.clone()));
        let drift = Arc::new(DriftReconciler::new(tracker.clone(), docs.clone()));
        let chunk_gc = Arc::new(ChunkGc::new(chunks.clone(), collaborators.blob.clone()));

        let dispatcher = Arc::new(TaskDispatcher {
            orchestrator: orchestrator.clone(),
            coordinator,
            stale_recovery: stale_recovery.clone(),
            stuck_queued,
            drift,
            chunk_gc,
        });

        let limiter = Arc::new(RateLimiter::new(
            Box::new(MemoryCounters::new()),
            settings.clone(),
            "memory",
        ));

        let state = AppState {
            settings: settings.clone(),
            tracker,
            docs,
            chunks,
            orchestrator,
            recovery: stale_recovery,
            limiter,
            eta,
            cache,
            blob: collaborators.blob.clone(),
        };

        Ok(Self {
            settings,
            queue,
            dispatcher,
            state,
            worker_gauge,
        })
    }

    /// Spawn the worker pool against this engine's queue.
    pub fn spawn_workers(&self, workers: usize) -> WorkerPool {
        WorkerPool::spawn_with_gauge(
            self.queue.clone(),
            self.dispatcher.clone(),
            workers,
            self.worker_gauge.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_engine_builds_from_defaults() {
        let dir = TempDir::new().unwrap();
        let mut settings = Settings::default();
        settings.database_path = dir.path().join("engine.db");
        settings.blob_dir = dir.path().join("blobs");
        let collaborators = Collaborators::offline(&settings);
        let engine = Engine::build(settings, collaborators).unwrap();
        assert_eq!(engine.queue.depth(), 0);
    }
}
