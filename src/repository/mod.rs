//! Repository layer for database persistence.

mod chunk;
mod document;
mod job;

pub use chunk::ChunkRepository;
pub use document::{DocumentRepository, DownstreamCounts};
pub use job::{JobFilter, JobPage, JobRepository};

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::path::Path;
use thiserror::Error;

/// Parse a datetime string from the database, defaulting to Unix epoch on error.
pub fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::UNIX_EPOCH)
}

/// Parse an optional datetime string from the database.
pub fn parse_datetime_opt(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
    })
}

/// Convert a rusqlite Result<T> to Result<Option<T>>, treating QueryReturnedNoRows as None.
pub fn to_option<T>(result: rusqlite::Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Not found: {0}")]
    NotFound(String),
    /// A guarded update found the row no longer in the expected state.
    #[error("Conflict: {0}")]
    Conflict(String),
}

pub type Result<T> = std::result::Result<T, RepositoryError>;

/// Create a database connection with settings tuned for concurrent workers.
pub fn connect(db_path: &Path) -> Result<Connection> {
    let conn = Connection::open(db_path)?;

    // WAL mode: multiple readers + one writer across worker processes.
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        PRAGMA busy_timeout = 30000;
        PRAGMA cache_size = -64000;
        PRAGMA temp_store = MEMORY;
    "#,
    )?;

    Ok(conn)
}

/// Create every table the engine uses. Idempotent.
pub fn init_schema(db_path: &Path) -> Result<()> {
    let conn = connect(db_path)?;
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS processing_jobs (
            id TEXT PRIMARY KEY,
            matter_id TEXT NOT NULL,
            document_id TEXT,
            job_type TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'QUEUED',
            current_stage TEXT,
            total_stages INTEGER NOT NULL DEFAULT 7,
            completed_stages INTEGER NOT NULL DEFAULT 0,
            progress_pct INTEGER NOT NULL DEFAULT 0,
            estimated_completion TEXT,
            error_message TEXT,
            error_code TEXT,
            retry_count INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL DEFAULT 3,
            metadata TEXT NOT NULL DEFAULT '{}',
            heartbeat_at TEXT,
            started_at TEXT,
            completed_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_jobs_matter ON processing_jobs(matter_id);
        CREATE INDEX IF NOT EXISTS idx_jobs_status ON processing_jobs(status, updated_at);
        CREATE INDEX IF NOT EXISTS idx_jobs_document ON processing_jobs(document_id, created_at);

        CREATE TABLE IF NOT EXISTS job_stage_history (
            id TEXT PRIMARY KEY,
            job_id TEXT NOT NULL REFERENCES processing_jobs(id),
            stage_name TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'PENDING',
            started_at TEXT,
            completed_at TEXT,
            error_message TEXT,
            metadata TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_stage_history_job ON job_stage_history(job_id, created_at);

        CREATE TABLE IF NOT EXISTS document_ocr_chunks (
            id TEXT PRIMARY KEY,
            matter_id TEXT NOT NULL,
            document_id TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            page_start INTEGER NOT NULL,
            page_end INTEGER NOT NULL,
            status TEXT NOT NULL DEFAULT 'PENDING',
            result_blob_path TEXT,
            result_checksum TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE(document_id, chunk_index)
        );
        CREATE INDEX IF NOT EXISTS idx_chunks_document ON document_ocr_chunks(document_id);
        CREATE INDEX IF NOT EXISTS idx_chunks_status ON document_ocr_chunks(status, updated_at);

        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            matter_id TEXT NOT NULL,
            title TEXT NOT NULL,
            blob_path TEXT NOT NULL,
            page_count INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'PENDING',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_documents_matter ON documents(matter_id);

        CREATE TABLE IF NOT EXISTS text_chunks (
            id TEXT PRIMARY KEY,
            matter_id TEXT NOT NULL,
            document_id TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            content TEXT NOT NULL,
            embedded INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            UNIQUE(document_id, chunk_index)
        );
        CREATE INDEX IF NOT EXISTS idx_text_chunks_document ON text_chunks(document_id);

        CREATE TABLE IF NOT EXISTS entities (
            id TEXT PRIMARY KEY,
            matter_id TEXT NOT NULL,
            document_id TEXT,
            label TEXT NOT NULL,
            kind TEXT NOT NULL,
            canonical_id TEXT,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_entities_matter ON entities(matter_id);
    "#,
    )?;
    Ok(())
}
