//! Domain models for the processing job engine.

mod chunk;
mod document;
mod job;
mod ocr;
mod progress;

pub use chunk::{ChunkProgress, ChunkStatus, OcrChunk, StaleChunkSet};
pub use document::{Document, DocumentStatus};
pub use job::{
    JobListItem, JobMetadata, JobStageHistory, JobStatus, JobType, JobUpdate, ProcessingJob,
    QueueStats, StageStatus,
};
pub use ocr::{OcrArtifact, OcrBox, OcrPage};
pub use progress::StageProgress;
