//! OCR chunk models: page-range partitions of large documents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of a single OCR chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChunkStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ChunkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "PROCESSING" => Some(Self::Processing),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// One page-range partition of a document's OCR work.
///
/// `chunk_index` is 0-based everywhere internally; user-facing strings
/// display it 1-based. The `[page_start, page_end]` intervals of a
/// document's chunks partition `[1..page_count]` with no overlap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrChunk {
    pub id: String,
    pub matter_id: String,
    pub document_id: String,
    pub chunk_index: u32,
    /// First page of the range, 1-based inclusive.
    pub page_start: u32,
    /// Last page of the range, 1-based inclusive.
    pub page_end: u32,
    pub status: ChunkStatus,
    /// Blob path of the chunk's OCR result once completed.
    pub result_blob_path: Option<String>,
    /// SHA-256 of the result blob, hex encoded.
    pub result_checksum: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OcrChunk {
    pub fn page_count(&self) -> u32 {
        self.page_end - self.page_start + 1
    }
}

/// Aggregate chunk counts for one document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkProgress {
    pub total: u64,
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
}

impl ChunkProgress {
    /// Whether every chunk has reached a terminal chunk state successfully.
    pub fn all_completed(&self) -> bool {
        self.total > 0 && self.pending == 0 && self.processing == 0 && self.failed == 0
    }

    /// Completed percentage, floored.
    pub fn pct(&self) -> u8 {
        if self.total == 0 {
            return 0;
        }
        (self.completed * 100 / self.total).min(100) as u8
    }
}

/// A document set whose chunks are past the retention window.
#[derive(Debug, Clone)]
pub struct StaleChunkSet {
    pub document_id: String,
    pub matter_id: String,
    pub chunk_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_progress_pct() {
        let progress = ChunkProgress {
            total: 17,
            pending: 5,
            processing: 1,
            completed: 10,
            failed: 1,
        };
        assert_eq!(progress.pct(), 58);
        assert!(!progress.all_completed());
    }

    #[test]
    fn test_all_completed() {
        let progress = ChunkProgress {
            total: 2,
            pending: 0,
            processing: 0,
            completed: 2,
            failed: 0,
        };
        assert!(progress.all_completed());

        let empty = ChunkProgress::default();
        assert!(!empty.all_completed());
    }

    #[test]
    fn test_page_count_single_page() {
        let now = Utc::now();
        let chunk = OcrChunk {
            id: "c".into(),
            matter_id: "m".into(),
            document_id: "d".into(),
            chunk_index: 16,
            page_start: 422,
            page_end: 422,
            status: ChunkStatus::Pending,
            result_blob_path: None,
            result_checksum: None,
            created_at: now,
            updated_at: now,
        };
        assert_eq!(chunk.page_count(), 1);
    }
}
