//! Document repository plus the downstream-state counts the drift
//! reconciler consults (text chunks, embedded chunks, entities).

use rusqlite::{params, Connection, Row};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use chrono::Utc;

use super::{parse_datetime, to_option, RepositoryError, Result};
use crate::models::{Document, DocumentStatus};

/// Downstream artifact counts for one document, used to infer the stage a
/// stale job actually reached.
#[derive(Debug, Clone, Copy, Default)]
pub struct DownstreamCounts {
    pub chunk_count: u64,
    pub embedded_count: u64,
    pub entity_count: u64,
}

#[derive(Clone)]
pub struct DocumentRepository {
    db_path: PathBuf,
}

fn row_to_document(row: &Row) -> rusqlite::Result<Document> {
    let status: String = row.get("status")?;
    Ok(Document {
        id: row.get("id")?,
        matter_id: row.get("matter_id")?,
        title: row.get("title")?,
        blob_path: row.get("blob_path")?,
        page_count: row.get("page_count")?,
        status: DocumentStatus::from_str(&status).unwrap_or(DocumentStatus::Pending),
        created_at: parse_datetime(&row.get::<_, String>("created_at")?),
        updated_at: parse_datetime(&row.get::<_, String>("updated_at")?),
    })
}

impl DocumentRepository {
    pub fn new(db_path: &Path) -> Result<Self> {
        super::init_schema(db_path)?;
        Ok(Self {
            db_path: db_path.to_path_buf(),
        })
    }

    fn connect(&self) -> Result<Connection> {
        super::connect(&self.db_path)
    }

    pub fn create(
        &self,
        matter_id: &str,
        title: &str,
        blob_path: &str,
        page_count: u32,
    ) -> Result<Document> {
        let conn = self.connect()?;
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            r#"
            INSERT INTO documents (id, matter_id, title, blob_path, page_count, status,
                                   created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, 'PENDING', ?6, ?6)
            "#,
            params![id, matter_id, title, blob_path, page_count, now],
        )?;
        self.get_required(&id)
    }

    pub fn get(&self, document_id: &str) -> Result<Option<Document>> {
        let conn = self.connect()?;
        to_option(conn.query_row(
            "SELECT * FROM documents WHERE id = ?",
            params![document_id],
            row_to_document,
        ))
    }

    pub fn get_required(&self, document_id: &str) -> Result<Document> {
        self.get(document_id)?
            .ok_or_else(|| RepositoryError::NotFound(format!("document {document_id}")))
    }

    pub fn set_status(&self, document_id: &str, status: DocumentStatus) -> Result<()> {
        let conn = self.connect()?;
        let changed = conn.execute(
            "UPDATE documents SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), Utc::now().to_rfc3339(), document_id],
        )?;
        if changed == 0 {
            return Err(RepositoryError::NotFound(format!("document {document_id}")));
        }
        Ok(())
    }

    /// Counts of chunks, embedded chunks, and matter entities for drift
    /// inference.
    pub fn downstream_counts(&self, document_id: &str, matter_id: &str) -> Result<DownstreamCounts> {
        let conn = self.connect()?;
        let chunk_count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM text_chunks WHERE document_id = ?",
            params![document_id],
            |row| row.get(0),
        )?;
        let embedded_count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM text_chunks WHERE document_id = ? AND embedded = 1",
            params![document_id],
            |row| row.get(0),
        )?;
        let entity_count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM entities WHERE matter_id = ?",
            params![matter_id],
            |row| row.get(0),
        )?;
        Ok(DownstreamCounts {
            chunk_count,
            embedded_count,
            entity_count,
        })
    }

    /// Replace a document's text chunks (chunking stage output).
    pub fn replace_text_chunks(
        &self,
        matter_id: &str,
        document_id: &str,
        contents: &[String],
    ) -> Result<Vec<String>> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM text_chunks WHERE document_id = ?",
            params![document_id],
        )?;
        let now = Utc::now().to_rfc3339();
        let mut ids = Vec::with_capacity(contents.len());
        for (index, content) in contents.iter().enumerate() {
            let id = Uuid::new_v4().to_string();
            tx.execute(
                r#"
                INSERT INTO text_chunks (id, matter_id, document_id, chunk_index, content,
                                         embedded, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)
                "#,
                params![id, matter_id, document_id, index as u32, content, now],
            )?;
            ids.push(id);
        }
        tx.commit()?;
        Ok(ids)
    }

    /// Text chunk ids of a document not yet embedded, in chunk order.
    pub fn unembedded_chunk_ids(&self, document_id: &str) -> Result<Vec<String>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT id FROM text_chunks WHERE document_id = ? AND embedded = 0 ORDER BY chunk_index",
        )?;
        let ids = stmt
            .query_map(params![document_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    /// All text chunk ids of a document, in chunk order.
    pub fn text_chunk_ids(&self, document_id: &str) -> Result<Vec<String>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT id FROM text_chunks WHERE document_id = ? ORDER BY chunk_index",
        )?;
        let ids = stmt
            .query_map(params![document_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    pub fn text_chunk_content(&self, chunk_id: &str) -> Result<String> {
        let conn = self.connect()?;
        to_option(conn.query_row(
            "SELECT content FROM text_chunks WHERE id = ?",
            params![chunk_id],
            |row| row.get(0),
        ))?
        .ok_or_else(|| RepositoryError::NotFound(format!("text chunk {chunk_id}")))
    }

    pub fn mark_chunk_embedded(&self, chunk_id: &str) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE text_chunks SET embedded = 1 WHERE id = ?",
            params![chunk_id],
        )?;
        Ok(())
    }

    /// Record an extracted entity.
    pub fn insert_entity(
        &self,
        matter_id: &str,
        document_id: Option<&str>,
        label: &str,
        kind: &str,
    ) -> Result<String> {
        let conn = self.connect()?;
        let id = Uuid::new_v4().to_string();
        conn.execute(
            r#"
            INSERT INTO entities (id, matter_id, document_id, label, kind, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                id,
                matter_id,
                document_id,
                label,
                kind,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(id)
    }

    /// Entity ids of a matter without a canonical alias assignment.
    pub fn unresolved_entity_ids(&self, matter_id: &str) -> Result<Vec<String>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT id FROM entities WHERE matter_id = ? AND canonical_id IS NULL ORDER BY created_at",
        )?;
        let ids = stmt
            .query_map(params![matter_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    pub fn set_entity_canonical(&self, entity_id: &str, canonical_id: &str) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE entities SET canonical_id = ?1 WHERE id = ?2",
            params![canonical_id, entity_id],
        )?;
        Ok(())
    }
}
