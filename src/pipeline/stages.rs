//! Built-in stage handlers.
//!
//! Each handler implements the pluggable stage contract over the opaque
//! collaborators; the analysis logic itself stays behind `ExternalLlm` and
//! `ExternalEmbedder`. Items are idempotent so a retried stage can replay
//! any of them safely.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::executor::{ItemFailurePolicy, StageContext, StageHandler};
use super::StageError;
use crate::external::{BlobStore, ExternalEmbedder, ExternalLlm, SearchIndex};
use crate::models::OcrArtifact;
use crate::repository::DocumentRepository;

/// Maximum characters per text chunk produced by the chunking stage.
const CHUNK_CHAR_BUDGET: usize = 2000;

fn require_document(ctx: &StageContext) -> Result<String, StageError> {
    ctx.document_id.clone().ok_or_else(|| StageError::Fatal {
        message: format!("stage requires a document-scoped job (job {})", ctx.job_id),
    })
}

async fn load_merged_artifact(
    blob: &dyn BlobStore,
    matter_id: &str,
    document_id: &str,
) -> Result<OcrArtifact, StageError> {
    let path = format!("{matter_id}/{document_id}/ocr/merged.json");
    let bytes = blob.download(&path).await.map_err(|e| StageError::Stage {
        message: format!("merged OCR artifact unavailable: {e}"),
        retryable: e.is_retryable(),
    })?;
    OcrArtifact::from_bytes(&bytes).map_err(|e| StageError::Stage {
        message: format!("merged OCR artifact unparseable: {e}"),
        retryable: false,
    })
}

/// Validation: every OCR'd page must carry usable text.
///
/// Pages that came back empty are recorded as failed items; the stage
/// tolerates them so one blank exhibit page cannot sink a filing.
pub struct ValidationStage {
    blob: Arc<dyn BlobStore>,
}

impl ValidationStage {
    pub fn new(blob: Arc<dyn BlobStore>) -> Self {
        Self { blob }
    }
}

#[async_trait]
impl StageHandler for ValidationStage {
    fn name(&self) -> &'static str {
        "validation"
    }

    async fn plan(&self, ctx: &StageContext) -> Result<Vec<String>, StageError> {
        let document_id = require_document(ctx)?;
        let artifact = load_merged_artifact(self.blob.as_ref(), &ctx.matter_id, &document_id).await?;
        Ok(artifact
            .pages
            .iter()
            .map(|p| format!("page:{}", p.page_number))
            .collect())
    }

    async fn process_item(&self, ctx: &StageContext, item_id: &str) -> Result<(), StageError> {
        let document_id = require_document(ctx)?;
        let artifact = load_merged_artifact(self.blob.as_ref(), &ctx.matter_id, &document_id).await?;
        let page_number: u32 = item_id
            .strip_prefix("page:")
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| StageError::Fatal {
                message: format!("malformed validation item {item_id}"),
            })?;

        let page = artifact
            .pages
            .iter()
            .find(|p| p.page_number == page_number)
            .ok_or_else(|| StageError::Item {
                item_id: item_id.to_string(),
                class: "PAGE_MISSING".into(),
                message: format!("page {page_number} absent from merged artifact"),
                retryable: false,
            })?;

        if page.text.trim().is_empty() {
            return Err(StageError::Item {
                item_id: item_id.to_string(),
                class: "EMPTY_PAGE".into(),
                message: format!("page {page_number} produced no text"),
                retryable: false,
            });
        }
        Ok(())
    }

    fn failure_policy(&self) -> ItemFailurePolicy {
        ItemFailurePolicy::Tolerant
    }
}

/// Split merged text into retrieval-sized chunks on paragraph boundaries.
pub fn split_text(text: &str, budget: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    for paragraph in text.split("\n\n") {
        let paragraph = paragraph.trim();
        if paragraph.is_empty() {
            continue;
        }
        if !current.is_empty() && current.len() + paragraph.len() + 2 > budget {
            chunks.push(std::mem::take(&mut current));
        }
        // A single oversized paragraph is split hard at the budget.
        if paragraph.len() > budget {
            let mut rest = paragraph;
            while rest.len() > budget {
                let mut cut = budget;
                while !rest.is_char_boundary(cut) {
                    cut -= 1;
                }
                chunks.push(rest[..cut].to_string());
                rest = &rest[cut..];
            }
            if !rest.is_empty() {
                current = rest.to_string();
            }
            continue;
        }
        if !current.is_empty() {
            current.push_str("\n\n");
        }
        current.push_str(paragraph);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Chunking: one item, the whole document. Replacing the chunk set is
/// idempotent by construction.
pub struct ChunkingStage {
    docs: Arc<DocumentRepository>,
    blob: Arc<dyn BlobStore>,
}

impl ChunkingStage {
    pub fn new(docs: Arc<DocumentRepository>, blob: Arc<dyn BlobStore>) -> Self {
        Self { docs, blob }
    }
}

#[async_trait]
impl StageHandler for ChunkingStage {
    fn name(&self) -> &'static str {
        "chunking"
    }

    async fn plan(&self, ctx: &StageContext) -> Result<Vec<String>, StageError> {
        let document_id = require_document(ctx)?;
        Ok(vec![format!("document:{document_id}")])
    }

    async fn process_item(&self, ctx: &StageContext, _item_id: &str) -> Result<(), StageError> {
        let document_id = require_document(ctx)?;
        let artifact = load_merged_artifact(self.blob.as_ref(), &ctx.matter_id, &document_id).await?;
        let contents = split_text(&artifact.full_text, CHUNK_CHAR_BUDGET);
        self.docs
            .replace_text_chunks(&ctx.matter_id, &document_id, &contents)
            .map_err(|e| StageError::Stage {
                message: e.to_string(),
                retryable: false,
            })?;
        Ok(())
    }
}

/// Embedding: one item per text chunk; skips already-embedded chunks unless
/// forced.
pub struct EmbeddingStage {
    docs: Arc<DocumentRepository>,
    embedder: Arc<dyn ExternalEmbedder>,
    search: Arc<dyn SearchIndex>,
}

impl EmbeddingStage {
    pub fn new(
        docs: Arc<DocumentRepository>,
        embedder: Arc<dyn ExternalEmbedder>,
        search: Arc<dyn SearchIndex>,
    ) -> Self {
        Self {
            docs,
            embedder,
            search,
        }
    }
}

#[async_trait]
impl StageHandler for EmbeddingStage {
    fn name(&self) -> &'static str {
        "embedding"
    }

    async fn plan(&self, ctx: &StageContext) -> Result<Vec<String>, StageError> {
        let document_id = require_document(ctx)?;
        let ids = if ctx.force {
            self.docs.text_chunk_ids(&document_id)
        } else {
            self.docs.unembedded_chunk_ids(&document_id)
        };
        ids.map_err(|e| StageError::Stage {
            message: e.to_string(),
            retryable: false,
        })
    }

    async fn process_item(&self, ctx: &StageContext, item_id: &str) -> Result<(), StageError> {
        let content = self
            .docs
            .text_chunk_content(item_id)
            .map_err(|e| StageError::Item {
                item_id: item_id.to_string(),
                class: "CHUNK_MISSING".into(),
                message: e.to_string(),
                retryable: false,
            })?;

        let embeddings = self
            .embedder
            .embed(std::slice::from_ref(&content))
            .await
            .map_err(|e| StageError::from_external(item_id, e))?;
        let embedding = embeddings.first().ok_or_else(|| StageError::Item {
            item_id: item_id.to_string(),
            class: "EMPTY_EMBEDDING".into(),
            message: "embedder returned no vectors".into(),
            retryable: true,
        })?;

        self.search
            .index_chunk(&ctx.matter_id, item_id, &content, embedding)
            .await
            .map_err(|e| StageError::from_external(item_id, e))?;
        self.docs
            .mark_chunk_embedded(item_id)
            .map_err(|e| StageError::Stage {
                message: e.to_string(),
                retryable: false,
            })?;
        Ok(())
    }
}

/// Entity extraction: one item per text chunk, parsed from the LLM's
/// `kind: label` line format. Bad chunks are tolerated.
pub struct EntityExtractionStage {
    docs: Arc<DocumentRepository>,
    llm: Arc<dyn ExternalLlm>,
}

impl EntityExtractionStage {
    pub fn new(docs: Arc<DocumentRepository>, llm: Arc<dyn ExternalLlm>) -> Self {
        Self { docs, llm }
    }
}

#[async_trait]
impl StageHandler for EntityExtractionStage {
    fn name(&self) -> &'static str {
        "entity_extraction"
    }

    async fn plan(&self, ctx: &StageContext) -> Result<Vec<String>, StageError> {
        let document_id = require_document(ctx)?;
        self.docs
            .text_chunk_ids(&document_id)
            .map_err(|e| StageError::Stage {
                message: e.to_string(),
                retryable: false,
            })
    }

    async fn process_item(&self, ctx: &StageContext, item_id: &str) -> Result<(), StageError> {
        let content = self
            .docs
            .text_chunk_content(item_id)
            .map_err(|e| StageError::Item {
                item_id: item_id.to_string(),
                class: "CHUNK_MISSING".into(),
                message: e.to_string(),
                retryable: false,
            })?;

        let prompt = format!(
            "List the legal entities (person, org, court, statute) mentioned below, \
             one per line as `kind: name`.\n\n{content}"
        );
        let response = self
            .llm
            .complete(&prompt)
            .await
            .map_err(|e| StageError::from_external(item_id, e))?;

        for line in response.lines() {
            if let Some((kind, label)) = line.split_once(':') {
                let (kind, label) = (kind.trim(), label.trim());
                if kind.is_empty() || label.is_empty() {
                    continue;
                }
                self.docs
                    .insert_entity(&ctx.matter_id, ctx.document_id.as_deref(), label, kind)
                    .map_err(|e| StageError::Stage {
                        message: e.to_string(),
                        retryable: false,
                    })?;
            }
        }
        Ok(())
    }

    fn failure_policy(&self) -> ItemFailurePolicy {
        ItemFailurePolicy::Tolerant
    }
}

/// Alias resolution: one item per unresolved entity. Entities without a
/// better anchor become their own canonical.
pub struct AliasResolutionStage {
    docs: Arc<DocumentRepository>,
}

impl AliasResolutionStage {
    pub fn new(docs: Arc<DocumentRepository>) -> Self {
        Self { docs }
    }
}

#[async_trait]
impl StageHandler for AliasResolutionStage {
    fn name(&self) -> &'static str {
        "alias_resolution"
    }

    async fn plan(&self, ctx: &StageContext) -> Result<Vec<String>, StageError> {
        self.docs
            .unresolved_entity_ids(&ctx.matter_id)
            .map_err(|e| StageError::Stage {
                message: e.to_string(),
                retryable: false,
            })
    }

    async fn process_item(&self, _ctx: &StageContext, item_id: &str) -> Result<(), StageError> {
        // Self-canonical is the safe default; a later grouping pass
        // overwrites it when it finds a better anchor.
        self.docs
            .set_entity_canonical(item_id, item_id)
            .map_err(|e| StageError::Item {
                item_id: item_id.to_string(),
                class: "ENTITY_WRITE".into(),
                message: e.to_string(),
                retryable: false,
            })?;
        Ok(())
    }

    fn failure_policy(&self) -> ItemFailurePolicy {
        ItemFailurePolicy::Tolerant
    }
}

/// Timeline: the distilled tail of the pipeline (date extraction, event
/// classification, entity linking) in one stage, stored as an artifact.
pub struct TimelineStage {
    blob: Arc<dyn BlobStore>,
    llm: Arc<dyn ExternalLlm>,
}

impl TimelineStage {
    pub fn new(blob: Arc<dyn BlobStore>, llm: Arc<dyn ExternalLlm>) -> Self {
        Self { blob, llm }
    }
}

#[async_trait]
impl StageHandler for TimelineStage {
    fn name(&self) -> &'static str {
        "timeline"
    }

    async fn plan(&self, ctx: &StageContext) -> Result<Vec<String>, StageError> {
        let document_id = require_document(ctx)?;
        Ok(vec![format!("timeline:{document_id}")])
    }

    async fn process_item(&self, ctx: &StageContext, item_id: &str) -> Result<(), StageError> {
        let document_id = require_document(ctx)?;
        let artifact = load_merged_artifact(self.blob.as_ref(), &ctx.matter_id, &document_id).await?;

        let prompt = format!(
            "Extract dated events from this document as JSON lines \
             {{\"date\": ..., \"event\": ..., \"actors\": [...]}}.\n\n{}",
            artifact.full_text
        );
        let response = self
            .llm
            .complete(&prompt)
            .await
            .map_err(|e| StageError::from_external(item_id, e))?;

        let path = format!("{}/{}/timeline.json", ctx.matter_id, document_id);
        self.blob
            .upload(&path, response.as_bytes())
            .await
            .map_err(|e| StageError::from_external(item_id, e))?;
        Ok(())
    }
}

/// Stage name -> handler registry assembled at the composition root.
pub struct StageHandlers {
    handlers: HashMap<&'static str, Arc<dyn StageHandler>>,
}

impl StageHandlers {
    pub fn new(handlers: Vec<Arc<dyn StageHandler>>) -> Self {
        Self {
            handlers: handlers.into_iter().map(|h| (h.name(), h)).collect(),
        }
    }

    pub fn get(&self, stage: &str) -> Option<Arc<dyn StageHandler>> {
        self.handlers.get(stage).cloned()
    }
}
