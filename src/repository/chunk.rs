//! OCR chunk store: per-document page-range chunk rows.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use std::path::{Path, PathBuf};

use super::{parse_datetime, to_option, RepositoryError, Result};
use crate::models::{ChunkProgress, ChunkStatus, OcrChunk, StaleChunkSet};

/// Repository for `document_ocr_chunks`.
#[derive(Clone)]
pub struct ChunkRepository {
    db_path: PathBuf,
}

fn row_to_chunk(row: &Row) -> rusqlite::Result<OcrChunk> {
    let status: String = row.get("status")?;
    Ok(OcrChunk {
        id: row.get("id")?,
        matter_id: row.get("matter_id")?,
        document_id: row.get("document_id")?,
        chunk_index: row.get("chunk_index")?,
        page_start: row.get("page_start")?,
        page_end: row.get("page_end")?,
        status: ChunkStatus::from_str(&status).unwrap_or(ChunkStatus::Pending),
        result_blob_path: row.get("result_blob_path")?,
        result_checksum: row.get("result_checksum")?,
        created_at: parse_datetime(&row.get::<_, String>("created_at")?),
        updated_at: parse_datetime(&row.get::<_, String>("updated_at")?),
    })
}

impl ChunkRepository {
    pub fn new(db_path: &Path) -> Result<Self> {
        super::init_schema(db_path)?;
        Ok(Self {
            db_path: db_path.to_path_buf(),
        })
    }

    fn connect(&self) -> Result<Connection> {
        super::connect(&self.db_path)
    }

    /// Insert a planned chunk set in one transaction.
    pub fn create_many(&self, chunks: &[OcrChunk]) -> Result<()> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        for chunk in chunks {
            tx.execute(
                r#"
                INSERT INTO document_ocr_chunks
                    (id, matter_id, document_id, chunk_index, page_start, page_end,
                     status, result_blob_path, result_checksum, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                "#,
                params![
                    chunk.id,
                    chunk.matter_id,
                    chunk.document_id,
                    chunk.chunk_index,
                    chunk.page_start,
                    chunk.page_end,
                    chunk.status.as_str(),
                    chunk.result_blob_path,
                    chunk.result_checksum,
                    chunk.created_at.to_rfc3339(),
                    chunk.updated_at.to_rfc3339(),
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get(&self, chunk_id: &str) -> Result<Option<OcrChunk>> {
        let conn = self.connect()?;
        to_option(conn.query_row(
            "SELECT * FROM document_ocr_chunks WHERE id = ?",
            params![chunk_id],
            row_to_chunk,
        ))
    }

    pub fn get_required(&self, chunk_id: &str) -> Result<OcrChunk> {
        self.get(chunk_id)?
            .ok_or_else(|| RepositoryError::NotFound(format!("chunk {chunk_id}")))
    }

    /// Compare-and-swap status transition. Fails with `Conflict` when the
    /// chunk is no longer in `expected`.
    pub fn transition(
        &self,
        chunk_id: &str,
        expected: ChunkStatus,
        next: ChunkStatus,
        result_blob_path: Option<&str>,
        result_checksum: Option<&str>,
    ) -> Result<()> {
        let conn = self.connect()?;
        let changed = conn.execute(
            r#"
            UPDATE document_ocr_chunks
            SET status = ?1,
                result_blob_path = COALESCE(?2, result_blob_path),
                result_checksum = COALESCE(?3, result_checksum),
                updated_at = ?4
            WHERE id = ?5 AND status = ?6
            "#,
            params![
                next.as_str(),
                result_blob_path,
                result_checksum,
                Utc::now().to_rfc3339(),
                chunk_id,
                expected.as_str()
            ],
        )?;
        if changed == 0 {
            return Err(RepositoryError::Conflict(format!(
                "chunk {chunk_id} not in {}",
                expected.as_str()
            )));
        }
        Ok(())
    }

    /// Unconditional status write (chunk retry path).
    pub fn set_status(&self, chunk_id: &str, status: ChunkStatus) -> Result<()> {
        let conn = self.connect()?;
        let changed = conn.execute(
            "UPDATE document_ocr_chunks SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), Utc::now().to_rfc3339(), chunk_id],
        )?;
        if changed == 0 {
            return Err(RepositoryError::NotFound(format!("chunk {chunk_id}")));
        }
        Ok(())
    }

    /// All chunks of a document in chunk_index order.
    pub fn list_by_document(&self, document_id: &str) -> Result<Vec<OcrChunk>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM document_ocr_chunks WHERE document_id = ? ORDER BY chunk_index ASC",
        )?;
        let chunks = stmt
            .query_map(params![document_id], row_to_chunk)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(chunks)
    }

    /// Aggregate counts by status for one document.
    pub fn progress(&self, document_id: &str) -> Result<ChunkProgress> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT status, COUNT(*) FROM document_ocr_chunks
            WHERE document_id = ? GROUP BY status
            "#,
        )?;
        let counts = stmt
            .query_map(params![document_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut progress = ChunkProgress::default();
        for (status, count) in counts {
            progress.total += count;
            match ChunkStatus::from_str(&status) {
                Some(ChunkStatus::Pending) => progress.pending = count,
                Some(ChunkStatus::Processing) => progress.processing = count,
                Some(ChunkStatus::Completed) => progress.completed = count,
                Some(ChunkStatus::Failed) => progress.failed = count,
                None => {}
            }
        }
        Ok(progress)
    }

    /// Documents whose newest chunk update is older than the cutoff.
    pub fn list_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<StaleChunkSet>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT document_id, matter_id, COUNT(*) as chunk_count
            FROM document_ocr_chunks
            GROUP BY document_id, matter_id
            HAVING MAX(updated_at) < ?
            "#,
        )?;
        let sets = stmt
            .query_map(params![cutoff.to_rfc3339()], |row| {
                Ok(StaleChunkSet {
                    document_id: row.get(0)?,
                    matter_id: row.get(1)?,
                    chunk_count: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(sets)
    }

    /// PROCESSING chunks with stale `updated_at` are fair game to reset.
    pub fn reset_stale_processing(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let conn = self.connect()?;
        let changed = conn.execute(
            r#"
            UPDATE document_ocr_chunks
            SET status = 'PENDING', updated_at = ?1
            WHERE status = 'PROCESSING' AND updated_at < ?2
            "#,
            params![Utc::now().to_rfc3339(), cutoff.to_rfc3339()],
        )?;
        Ok(changed as u64)
    }

    pub fn delete_by_document(&self, document_id: &str) -> Result<u64> {
        let conn = self.connect()?;
        let deleted = conn.execute(
            "DELETE FROM document_ocr_chunks WHERE document_id = ?",
            params![document_id],
        )?;
        Ok(deleted as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MATTER: &str = "1f0e2ab4-9c7d-4e2f-8a61-3bb1c0de9f12";

    fn repo() -> (TempDir, ChunkRepository) {
        let dir = TempDir::new().unwrap();
        let repo = ChunkRepository::new(&dir.path().join("test.db")).unwrap();
        (dir, repo)
    }

    fn chunk(id: &str, index: u32, start: u32, end: u32) -> OcrChunk {
        let now = Utc::now();
        OcrChunk {
            id: id.into(),
            matter_id: MATTER.into(),
            document_id: "doc-1".into(),
            chunk_index: index,
            page_start: start,
            page_end: end,
            status: ChunkStatus::Pending,
            result_blob_path: None,
            result_checksum: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_create_and_list_ordered() {
        let (_dir, repo) = repo();
        repo.create_many(&[chunk("b", 1, 26, 50), chunk("a", 0, 1, 25)])
            .unwrap();
        let chunks = repo.list_by_document("doc-1").unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].chunk_index, 0);
        assert_eq!(chunks[1].chunk_index, 1);
    }

    #[test]
    fn test_transition_cas() {
        let (_dir, repo) = repo();
        repo.create_many(&[chunk("a", 0, 1, 25)]).unwrap();

        repo.transition("a", ChunkStatus::Pending, ChunkStatus::Processing, None, None)
            .unwrap();
        // Second claim on the same chunk loses.
        let err = repo
            .transition("a", ChunkStatus::Pending, ChunkStatus::Processing, None, None)
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));

        repo.transition(
            "a",
            ChunkStatus::Processing,
            ChunkStatus::Completed,
            Some("m/doc-1/chunks/0.json"),
            Some("abc123"),
        )
        .unwrap();
        let chunk = repo.get_required("a").unwrap();
        assert_eq!(chunk.status, ChunkStatus::Completed);
        assert_eq!(chunk.result_blob_path.as_deref(), Some("m/doc-1/chunks/0.json"));
    }

    #[test]
    fn test_progress_counts() {
        let (_dir, repo) = repo();
        repo.create_many(&[chunk("a", 0, 1, 25), chunk("b", 1, 26, 50)])
            .unwrap();
        repo.transition("a", ChunkStatus::Pending, ChunkStatus::Processing, None, None)
            .unwrap();
        repo.transition("a", ChunkStatus::Processing, ChunkStatus::Completed, None, None)
            .unwrap();

        let progress = repo.progress("doc-1").unwrap();
        assert_eq!(progress.total, 2);
        assert_eq!(progress.completed, 1);
        assert_eq!(progress.pending, 1);
        assert!(!progress.all_completed());
    }

    #[test]
    fn test_delete_by_document() {
        let (_dir, repo) = repo();
        repo.create_many(&[chunk("a", 0, 1, 25), chunk("b", 1, 26, 50)])
            .unwrap();
        assert_eq!(repo.delete_by_document("doc-1").unwrap(), 2);
        assert!(repo.list_by_document("doc-1").unwrap().is_empty());
    }

    #[test]
    fn test_list_stale_uses_newest_update() {
        let (_dir, repo) = repo();
        repo.create_many(&[chunk("a", 0, 1, 25)]).unwrap();

        let future = Utc::now() + chrono::Duration::hours(1);
        let stale = repo.list_stale(future).unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].chunk_count, 1);

        let past = Utc::now() - chrono::Duration::hours(1);
        assert!(repo.list_stale(past).unwrap().is_empty());
    }
}
