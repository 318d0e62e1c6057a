//! OCR chunk garbage collection.
//!
//! Chunk artifacts only exist to be merged; once a document's chunk set has
//! been idle past the retention window, both the result blobs and the rows
//! go. The sweep continues past per-file failures and counts them.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::external::BlobStore;
use crate::repository::ChunkRepository;

#[derive(Debug, Clone, Default, Serialize)]
pub struct ChunkGcSummary {
    pub documents_cleaned: usize,
    pub chunks_deleted: u64,
    pub blobs_deleted: u64,
    pub errors: Vec<String>,
}

pub struct ChunkGc {
    chunks: Arc<ChunkRepository>,
    blob: Arc<dyn BlobStore>,
}

impl ChunkGc {
    pub fn new(chunks: Arc<ChunkRepository>, blob: Arc<dyn BlobStore>) -> Self {
        Self { chunks, blob }
    }

    /// Delete blob artifacts then rows for one document's chunk set.
    pub async fn cleanup_document(&self, document_id: &str) -> ChunkGcSummary {
        let mut summary = ChunkGcSummary::default();

        let chunks = match self.chunks.list_by_document(document_id) {
            Ok(chunks) => chunks,
            Err(e) => {
                summary.errors.push(format!("{document_id}: {e}"));
                return summary;
            }
        };

        for chunk in &chunks {
            if let Some(blob_path) = &chunk.result_blob_path {
                match self.blob.delete(blob_path).await {
                    Ok(()) => summary.blobs_deleted += 1,
                    Err(e) => {
                        // Keep going; rows without blobs are still worth
                        // removing and the error is surfaced in the summary.
                        summary.errors.push(format!("{blob_path}: {e}"));
                    }
                }
            }
        }

        match self.chunks.delete_by_document(document_id) {
            Ok(deleted) => {
                summary.chunks_deleted = deleted;
                summary.documents_cleaned = 1;
            }
            Err(e) => summary.errors.push(format!("{document_id}: {e}")),
        }

        summary
    }

    /// Clean every chunk set idle past the retention window.
    pub async fn run(&self, retention_hours: i64) -> ChunkGcSummary {
        let cutoff = Utc::now() - chrono::Duration::hours(retention_hours);
        let stale = match self.chunks.list_stale(cutoff) {
            Ok(stale) => stale,
            Err(e) => {
                warn!(error = %e, "stale chunk scan failed");
                return ChunkGcSummary {
                    errors: vec![e.to_string()],
                    ..Default::default()
                };
            }
        };

        let mut summary = ChunkGcSummary::default();
        for set in &stale {
            let result = self.cleanup_document(&set.document_id).await;
            summary.documents_cleaned += result.documents_cleaned;
            summary.chunks_deleted += result.chunks_deleted;
            summary.blobs_deleted += result.blobs_deleted;
            summary.errors.extend(result.errors);
        }

        info!(
            documents_cleaned = summary.documents_cleaned,
            chunks_deleted = summary.chunks_deleted,
            errors = summary.errors.len(),
            retention_hours,
            "chunk cleanup complete"
        );
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::FsBlobStore;
    use crate::models::{ChunkStatus, OcrChunk};
    use tempfile::TempDir;

    const MATTER: &str = "1f0e2ab4-9c7d-4e2f-8a61-3bb1c0de9f12";

    fn chunk_row(id: &str, index: u32, blob_path: Option<&str>) -> OcrChunk {
        let now = Utc::now();
        OcrChunk {
            id: id.into(),
            matter_id: MATTER.into(),
            document_id: "doc-1".into(),
            chunk_index: index,
            page_start: index * 25 + 1,
            page_end: (index + 1) * 25,
            status: ChunkStatus::Completed,
            result_blob_path: blob_path.map(String::from),
            result_checksum: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_cleanup_deletes_blobs_and_rows() {
        let dir = TempDir::new().unwrap();
        let chunks = Arc::new(ChunkRepository::new(&dir.path().join("t.db")).unwrap());
        let blob = Arc::new(FsBlobStore::new(dir.path().join("blobs")));

        blob.upload("c0.json", b"a").await.unwrap();
        blob.upload("c1.json", b"b").await.unwrap();
        chunks
            .create_many(&[
                chunk_row("a", 0, Some("c0.json")),
                chunk_row("b", 1, Some("c1.json")),
                chunk_row("c", 2, None),
            ])
            .unwrap();

        let gc = ChunkGc::new(chunks.clone(), blob.clone());
        let summary = gc.run(-1).await; // cutoff in the future: everything stale

        assert_eq!(summary.documents_cleaned, 1);
        assert_eq!(summary.chunks_deleted, 3);
        assert_eq!(summary.blobs_deleted, 2);
        assert!(summary.errors.is_empty());
        assert!(chunks.list_by_document("doc-1").unwrap().is_empty());
        assert!(blob.download("c0.json").await.is_err());
    }

    #[tokio::test]
    async fn test_cleanup_continues_past_missing_blobs() {
        let dir = TempDir::new().unwrap();
        let chunks = Arc::new(ChunkRepository::new(&dir.path().join("t.db")).unwrap());
        let blob = Arc::new(FsBlobStore::new(dir.path().join("blobs")));

        // Blob never uploaded; FsBlobStore::delete treats missing as ok, so
        // point at an invalid path to force a per-file error instead.
        chunks
            .create_many(&[chunk_row("a", 0, Some("bad//path"))])
            .unwrap();

        let gc = ChunkGc::new(chunks.clone(), blob);
        let summary = gc.run(-1).await;

        assert_eq!(summary.errors.len(), 1);
        // Rows still removed despite the blob failure.
        assert_eq!(summary.chunks_deleted, 1);
    }

    #[tokio::test]
    async fn test_retention_window_respected() {
        let dir = TempDir::new().unwrap();
        let chunks = Arc::new(ChunkRepository::new(&dir.path().join("t.db")).unwrap());
        let blob = Arc::new(FsBlobStore::new(dir.path().join("blobs")));
        chunks.create_many(&[chunk_row("a", 0, None)]).unwrap();

        let gc = ChunkGc::new(chunks.clone(), blob);
        // Rows were just written; a 24h retention keeps them.
        let summary = gc.run(24).await;
        assert_eq!(summary.documents_cleaned, 0);
        assert_eq!(chunks.list_by_document("doc-1").unwrap().len(), 1);
    }
}
