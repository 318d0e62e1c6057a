//! OCR fan-out: page-range chunking, parallel recognition, merge.

mod coordinator;

pub use coordinator::{plan_chunks, OcrChunkCoordinator, OcrStageOutcome};
