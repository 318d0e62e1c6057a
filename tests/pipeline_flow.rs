//! End-to-end pipeline tests against the in-process engine with offline
//! collaborators.

use std::sync::Arc;
use std::time::Duration;

use lexpipe::app::{Collaborators, Engine};
use lexpipe::broadcast::{matter_channel, ChannelBroadcast};
use lexpipe::config::Settings;
use lexpipe::external::{
    offline::{OfflineEmbedder, OfflineLlm, OfflineOcr, OfflineSearch},
    BlobStore, FsBlobStore,
};
use lexpipe::models::{DocumentStatus, JobStatus, OcrArtifact, StageStatus};
use tempfile::TempDir;

const MATTER: &str = "1f0e2ab4-9c7d-4e2f-8a61-3bb1c0de9f12";

struct Harness {
    _dir: TempDir,
    engine: Engine,
    broadcast: Arc<ChannelBroadcast>,
    blob: Arc<FsBlobStore>,
}

fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let mut settings = Settings::default();
    settings.database_path = dir.path().join("engine.db");
    settings.blob_dir = dir.path().join("blobs");
    // Keep retry waits short if anything flakes in-process.
    settings.retry_backoff_base = Duration::from_millis(10);
    settings.retry_backoff_max = Duration::from_millis(50);

    let broadcast = Arc::new(ChannelBroadcast::default());
    let blob = Arc::new(FsBlobStore::new(settings.blob_dir.clone()));
    let collaborators = Collaborators {
        ocr: Arc::new(OfflineOcr),
        embedder: Arc::new(OfflineEmbedder),
        llm: Arc::new(OfflineLlm),
        search: Arc::new(OfflineSearch),
        blob: blob.clone(),
        broadcast: broadcast.clone(),
    };
    let engine = Engine::build(settings, collaborators).unwrap();
    Harness {
        _dir: dir,
        engine,
        broadcast,
        blob,
    }
}

async fn wait_terminal(engine: &Engine, job_id: &str) -> JobStatus {
    for _ in 0..200 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let job = engine.state.tracker.repo().get_required(job_id).unwrap();
        if job.status.is_terminal() {
            return job.status;
        }
    }
    panic!("job {job_id} did not reach a terminal state");
}

#[tokio::test]
async fn test_fifty_page_document_runs_full_pipeline() {
    let harness = harness();
    let engine = &harness.engine;

    // A 50-page upload with the default 25-page chunk size.
    let blob_path = format!("{MATTER}/upload/source.pdf");
    harness
        .blob
        .upload(&blob_path, b"%PDF-1.7 fifty pages of lease")
        .await
        .unwrap();
    let document = engine
        .state
        .docs
        .create(MATTER, "Lease.pdf", &blob_path, 50)
        .unwrap();

    let mut events = harness.broadcast.subscribe(&matter_channel(MATTER));
    let job = engine.state.orchestrator.start(&document.id, false).await.unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert!(job.estimated_completion.is_some());

    let _pool = engine.spawn_workers(2);
    let status = wait_terminal(engine, &job.id).await;
    assert_eq!(status, JobStatus::Completed);

    let finished = engine.state.tracker.repo().get_required(&job.id).unwrap();
    assert_eq!(finished.progress_pct, 100);
    assert_eq!(finished.completed_stages, finished.total_stages);
    assert!(finished.error_message.is_none());

    // Two chunks, pages 1-25 and 26-50, both completed.
    let chunks = engine.state.chunks.list_by_document(&document.id).unwrap();
    assert_eq!(chunks.len(), 2);
    assert_eq!((chunks[0].page_start, chunks[0].page_end), (1, 25));
    assert_eq!((chunks[1].page_start, chunks[1].page_end), (26, 50));
    assert!(chunks.iter().all(|c| c.result_checksum.is_some()));

    // Merged artifact covers all 50 pages with globally renumbered boxes.
    let merged_bytes = harness
        .blob
        .download(&format!("{MATTER}/{}/ocr/merged.json", document.id))
        .await
        .unwrap();
    let merged = OcrArtifact::from_bytes(&merged_bytes).unwrap();
    assert_eq!(merged.pages.len(), 50);
    assert_eq!(merged.boxes.len(), 50);
    for (index, ocr_box) in merged.boxes.iter().enumerate() {
        assert_eq!(ocr_box.reading_order_index, index as u64);
    }

    // The merge published its well-known stage label at 95%.
    let mut saw_merge = false;
    while let Ok(event) = events.try_recv() {
        if event.stage.as_deref() == Some("Merging OCR results") {
            assert_eq!(event.progress_pct, 95);
            saw_merge = true;
        }
    }
    assert!(saw_merge, "no merge progress event observed");

    // Downstream stages really ran: chunks embedded, entities extracted.
    let counts = engine
        .state
        .docs
        .downstream_counts(&document.id, MATTER)
        .unwrap();
    assert!(counts.chunk_count > 0);
    assert_eq!(counts.embedded_count, counts.chunk_count);
    assert!(counts.entity_count > 0);

    // Stage history closed out the pipeline stages.
    let history = engine.state.tracker.repo().stage_history(&job.id).unwrap();
    let completed: Vec<&str> = history
        .iter()
        .filter(|h| h.status == StageStatus::Completed)
        .map(|h| h.stage_name.as_str())
        .collect();
    for stage in [
        "ocr",
        "validation",
        "chunking",
        "embedding",
        "entity_extraction",
        "alias_resolution",
        "timeline",
    ] {
        assert!(completed.contains(&stage), "stage {stage} not completed");
    }

    let document = engine.state.docs.get_required(&document.id).unwrap();
    assert_eq!(document.status, DocumentStatus::Completed);
}

#[tokio::test]
async fn test_second_job_refused_while_first_active() {
    let harness = harness();
    let engine = &harness.engine;

    let document = engine
        .state
        .docs
        .create(MATTER, "Brief.pdf", "m/brief.pdf", 3)
        .unwrap();
    engine.state.orchestrator.start(&document.id, false).await.unwrap();

    // No workers running: the first job is still QUEUED.
    let err = engine
        .state
        .orchestrator
        .start(&document.id, false)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("already has active job"));

    // A recovery sweeper caller bypasses the guard.
    assert!(engine.state.orchestrator.start(&document.id, true).await.is_ok());
}

#[tokio::test]
async fn test_cancel_is_idempotent_and_terminal() {
    let harness = harness();
    let engine = &harness.engine;

    let document = engine
        .state
        .docs
        .create(MATTER, "Memo.pdf", "m/memo.pdf", 2)
        .unwrap();
    let job = engine.state.orchestrator.start(&document.id, false).await.unwrap();

    let cancelled = engine.state.orchestrator.cancel(&job.id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert!(cancelled.completed_at.is_some());

    // Second cancel is a no-op, not an error.
    let again = engine.state.orchestrator.cancel(&job.id).await.unwrap();
    assert_eq!(again.status, JobStatus::Cancelled);

    // Terminal absorbing: no worker will pick it up.
    let _pool = engine.spawn_workers(1);
    tokio::time::sleep(Duration::from_millis(300)).await;
    let job = engine.state.tracker.repo().get_required(&job.id).unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
}

/// OCR that fails its first call transiently, then behaves.
struct FlakyOcr {
    failures_left: std::sync::atomic::AtomicU32,
    inner: OfflineOcr,
}

#[async_trait::async_trait]
impl lexpipe::external::ExternalOcr for FlakyOcr {
    async fn recognize(
        &self,
        pdf: &[u8],
        page_start: u32,
        page_end: u32,
    ) -> Result<lexpipe::models::OcrArtifact, lexpipe::external::ExternalError> {
        use std::sync::atomic::Ordering;
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(lexpipe::external::ExternalError::Transient(
                "provider 503".into(),
            ));
        }
        self.inner.recognize(pdf, page_start, page_end).await
    }
}

#[tokio::test]
async fn test_chunk_failure_surfaces_then_clears_on_retry() {
    let dir = TempDir::new().unwrap();
    let mut settings = Settings::default();
    settings.database_path = dir.path().join("engine.db");
    settings.blob_dir = dir.path().join("blobs");
    settings.retry_backoff_base = Duration::from_millis(10);
    settings.retry_backoff_max = Duration::from_millis(20);

    let broadcast = Arc::new(ChannelBroadcast::default());
    let blob = Arc::new(FsBlobStore::new(settings.blob_dir.clone()));
    let collaborators = Collaborators {
        ocr: Arc::new(FlakyOcr {
            failures_left: std::sync::atomic::AtomicU32::new(1),
            inner: OfflineOcr,
        }),
        embedder: Arc::new(OfflineEmbedder),
        llm: Arc::new(OfflineLlm),
        search: Arc::new(OfflineSearch),
        blob: blob.clone(),
        broadcast: broadcast.clone(),
    };
    let engine = Engine::build(settings, collaborators).unwrap();

    let blob_path = format!("{MATTER}/upload/flaky.pdf");
    blob.upload(&blob_path, b"%PDF-1.7 flaky").await.unwrap();
    let document = engine
        .state
        .docs
        .create(MATTER, "Flaky.pdf", &blob_path, 10)
        .unwrap();

    let mut events = broadcast.subscribe(&matter_channel(MATTER));
    let job = engine.state.orchestrator.start(&document.id, false).await.unwrap();

    let _pool = engine.spawn_workers(1);
    let status = wait_terminal(&engine, &job.id).await;
    assert_eq!(status, JobStatus::Completed);

    // The transient chunk failure was surfaced while the job stayed live,
    // and the eventual success cleared it.
    let mut saw_chunk_failure = false;
    while let Ok(event) = events.try_recv() {
        if let Some(message) = &event.error_message {
            if message.starts_with("Chunk 1 (pages 1-10) failed:") {
                assert_eq!(event.status, JobStatus::Processing);
                saw_chunk_failure = true;
            }
        }
    }
    assert!(saw_chunk_failure, "chunk failure never surfaced on the job");

    let finished = engine.state.tracker.repo().get_required(&job.id).unwrap();
    assert!(finished.error_message.is_none());
    assert!(finished.error_code.is_none());
}

#[tokio::test]
async fn test_skip_is_idempotent() {
    let harness = harness();
    let engine = &harness.engine;

    let document = engine
        .state
        .docs
        .create(MATTER, "Exhibit.pdf", "m/exhibit.pdf", 2)
        .unwrap();
    let job = engine.state.orchestrator.start(&document.id, false).await.unwrap();

    let skipped = engine
        .state
        .orchestrator
        .skip(&job.id, "obsolete upload")
        .await
        .unwrap();
    assert_eq!(skipped.status, JobStatus::Skipped);

    let again = engine.state.orchestrator.skip(&job.id, "again").await.unwrap();
    assert_eq!(again.status, JobStatus::Skipped);
}
