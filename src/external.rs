//! Opaque external collaborators.
//!
//! The OCR/embedding/LLM providers, the search index, and the object store
//! are all third-party systems; the engine depends on these traits only.
//! Provider errors carry a retryability flag so the stage executor can
//! classify them at the boundary.

use async_trait::async_trait;
use std::path::PathBuf;
use thiserror::Error;

use crate::models::OcrArtifact;

#[derive(Error, Debug)]
pub enum ExternalError {
    /// Network flake, provider 5xx, or retryable quota exhaustion.
    #[error("transient provider error: {0}")]
    Transient(String),
    /// The provider rejected the input permanently.
    #[error("permanent provider error: {0}")]
    Permanent(String),
}

impl ExternalError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

pub type ExternalResult<T> = std::result::Result<T, ExternalError>;

/// OCR provider. Input is raw PDF bytes for a page range.
#[async_trait]
pub trait ExternalOcr: Send + Sync {
    /// Recognize text on `pages` (1-based, inclusive) of the document blob.
    async fn recognize(
        &self,
        pdf: &[u8],
        page_start: u32,
        page_end: u32,
    ) -> ExternalResult<OcrArtifact>;
}

/// Embedding provider.
#[async_trait]
pub trait ExternalEmbedder: Send + Sync {
    async fn embed(&self, texts: &[String]) -> ExternalResult<Vec<Vec<f32>>>;
}

/// LLM provider used by the analysis stages.
#[async_trait]
pub trait ExternalLlm: Send + Sync {
    async fn complete(&self, prompt: &str) -> ExternalResult<String>;
}

/// Vector/full-text index. The engine only writes; search RPCs belong to the
/// query path of the wider platform.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    async fn index_chunk(
        &self,
        matter_id: &str,
        chunk_id: &str,
        content: &str,
        embedding: &[f32],
    ) -> ExternalResult<()>;
    async fn remove_document(&self, matter_id: &str, document_id: &str) -> ExternalResult<()>;
}

/// Object store for document and artifact blobs.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn upload(&self, path: &str, bytes: &[u8]) -> ExternalResult<()>;
    async fn download(&self, path: &str) -> ExternalResult<Vec<u8>>;
    async fn delete(&self, path: &str) -> ExternalResult<()>;
    /// Time-limited URL for client-side download.
    async fn signed_url(&self, path: &str, expires_secs: u64) -> ExternalResult<String>;
}

/// Filesystem-backed blob store.
///
/// Blob paths are forward-slash keys relative to the root; path segments are
/// rejected rather than sanitized.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn resolve(&self, path: &str) -> ExternalResult<PathBuf> {
        if path.is_empty() || path.split('/').any(|seg| seg.is_empty() || seg == "..") {
            return Err(ExternalError::Permanent(format!("invalid blob path: {path}")));
        }
        Ok(self.root.join(path))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn upload(&self, path: &str, bytes: &[u8]) -> ExternalResult<()> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ExternalError::Transient(e.to_string()))?;
        }
        tokio::fs::write(&target, bytes)
            .await
            .map_err(|e| ExternalError::Transient(e.to_string()))
    }

    async fn download(&self, path: &str) -> ExternalResult<Vec<u8>> {
        let target = self.resolve(path)?;
        tokio::fs::read(&target).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ExternalError::Permanent(format!("blob not found: {path}"))
            } else {
                ExternalError::Transient(e.to_string())
            }
        })
    }

    async fn delete(&self, path: &str) -> ExternalResult<()> {
        let target = self.resolve(path)?;
        match tokio::fs::remove_file(&target).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ExternalError::Transient(e.to_string())),
        }
    }

    async fn signed_url(&self, path: &str, expires_secs: u64) -> ExternalResult<String> {
        let target = self.resolve(path)?;
        Ok(format!(
            "file://{}?expires={}",
            target.display(),
            expires_secs
        ))
    }
}

pub mod offline {
    //! Offline collaborators for development and tests.
    //!
    //! Deterministic, dependency-free stand-ins that exercise the full
    //! pipeline contract without any provider credentials.

    use super::*;
    use crate::models::{OcrArtifact, OcrBox, OcrPage};
    use sha2::{Digest, Sha256};

    /// OCR that fabricates one page of text per page in the range,
    /// deterministic in the input bytes.
    pub struct OfflineOcr;

    #[async_trait]
    impl ExternalOcr for OfflineOcr {
        async fn recognize(
            &self,
            pdf: &[u8],
            page_start: u32,
            page_end: u32,
        ) -> ExternalResult<OcrArtifact> {
            if pdf.is_empty() {
                return Err(ExternalError::Permanent("empty document".into()));
            }
            let digest = hex::encode(&Sha256::digest(pdf)[..4]);
            let mut pages = Vec::new();
            let mut boxes = Vec::new();
            let mut full_text = String::new();
            for (offset, page) in (page_start..=page_end).enumerate() {
                let text = format!("[{digest}] page {page} text");
                boxes.push(OcrBox {
                    page,
                    text: text.clone(),
                    bbox: [0.1, 0.1, 0.8, 0.05],
                    reading_order_index: offset as u64,
                    confidence: Some(0.97),
                });
                if !full_text.is_empty() {
                    full_text.push('\n');
                }
                full_text.push_str(&text);
                pages.push(OcrPage {
                    page_number: page,
                    text,
                    confidence: Some(0.97),
                });
            }
            let overall_confidence = OcrArtifact::overall_confidence(&pages);
            Ok(OcrArtifact {
                pages,
                boxes,
                full_text,
                overall_confidence,
            })
        }
    }

    /// Embeddings derived from a content hash: stable, dimension 8.
    pub struct OfflineEmbedder;

    #[async_trait]
    impl ExternalEmbedder for OfflineEmbedder {
        async fn embed(&self, texts: &[String]) -> ExternalResult<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|text| {
                    let digest = Sha256::digest(text.as_bytes());
                    digest[..8].iter().map(|b| *b as f32 / 255.0).collect()
                })
                .collect())
        }
    }

    /// An LLM that answers entity prompts with a fixed parse of its input
    /// and everything else with an empty completion.
    pub struct OfflineLlm;

    #[async_trait]
    impl ExternalLlm for OfflineLlm {
        async fn complete(&self, prompt: &str) -> ExternalResult<String> {
            if prompt.starts_with("List the legal entities") {
                return Ok("org: Offline Counsel LLP".to_string());
            }
            Ok(String::new())
        }
    }

    /// Search index that accepts writes and drops them.
    pub struct OfflineSearch;

    #[async_trait]
    impl SearchIndex for OfflineSearch {
        async fn index_chunk(
            &self,
            _matter_id: &str,
            _chunk_id: &str,
            _content: &str,
            _embedding: &[f32],
        ) -> ExternalResult<()> {
            Ok(())
        }

        async fn remove_document(
            &self,
            _matter_id: &str,
            _document_id: &str,
        ) -> ExternalResult<()> {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_fs_blob_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = FsBlobStore::new(dir.path().to_path_buf());

        store.upload("m1/doc/chunk-0.json", b"payload").await.unwrap();
        let bytes = store.download("m1/doc/chunk-0.json").await.unwrap();
        assert_eq!(bytes, b"payload");

        store.delete("m1/doc/chunk-0.json").await.unwrap();
        assert!(store.download("m1/doc/chunk-0.json").await.is_err());
        // Deleting a missing blob is not an error.
        store.delete("m1/doc/chunk-0.json").await.unwrap();
    }

    #[tokio::test]
    async fn test_fs_blob_rejects_traversal() {
        let dir = TempDir::new().unwrap();
        let store = FsBlobStore::new(dir.path().to_path_buf());
        assert!(store.upload("../escape", b"x").await.is_err());
        assert!(store.download("a//b").await.is_err());
    }
}
