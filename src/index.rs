//! Hybrid index builder.
//!
//! Drives one document through the indexing pipeline:
//! chunk → embed → vector upsert → lexical upsert → graph extraction.
//!
//! Durability contract: a chunk is durable once its vector **and** lexical
//! writes have succeeded. Graph extraction may fail independently — the
//! chunk then exists without enrichment and the outcome reports
//! `graph_partial`. There is no distributed transaction; idempotent upserts
//! keyed by content-derived chunk ids make re-driving safe.
//!
//! Re-ingesting a changed document replaces its chunks: ids that existed
//! before but are absent from the new chunking are deleted from all stores
//! after the new content is durable.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::chunker::chunk_text;
use crate::config::ChunkingConfig;
use crate::embedding::Embedder;
use crate::error::EngineError;
use crate::extractor::TripleExtractor;
use crate::models::{Chunk, ExtractionFormat, IngestPhase, ParsedDocument};
use crate::store::{
    GraphStore, LexicalItem, LexicalStore, SourcedTriple, VectorItem, VectorStore,
};

/// Chunks per embedding call; the embedder may sub-batch further.
const EMBED_BATCH: usize = 64;

/// Result of indexing one document.
#[derive(Debug, Default)]
pub struct IndexOutcome {
    pub chunk_ids: Vec<String>,
    pub chunks: u64,
    pub triples: u64,
    pub entities: u64,
    pub relations: u64,
    /// Graph enrichment failed for at least one chunk.
    pub graph_partial: bool,
    /// First graph extraction error, if any (file-level).
    pub graph_error: Option<EngineError>,
}

/// Shared pipeline for ingestion runs and the sync controller.
pub struct IndexBuilder {
    embedder: Arc<dyn Embedder>,
    vector: Arc<dyn VectorStore>,
    lexical: Arc<dyn LexicalStore>,
    graph: Option<Arc<dyn GraphStore>>,
    extractor: Option<Arc<dyn TripleExtractor>>,
    chunking: ChunkingConfig,
    extraction_format: ExtractionFormat,
    store_timeout: Duration,
}

impl IndexBuilder {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        embedder: Arc<dyn Embedder>,
        vector: Arc<dyn VectorStore>,
        lexical: Arc<dyn LexicalStore>,
        graph: Option<Arc<dyn GraphStore>>,
        extractor: Option<Arc<dyn TripleExtractor>>,
        chunking: ChunkingConfig,
        extraction_format: ExtractionFormat,
        store_timeout: Duration,
    ) -> Self {
        Self {
            embedder,
            vector,
            lexical,
            graph,
            extractor,
            chunking,
            extraction_format,
            store_timeout,
        }
    }

    pub fn graph_enabled(&self) -> bool {
        self.graph.is_some() && self.extractor.is_some()
    }

    /// Split a document's plaintext into chunks carrying index metadata.
    pub fn chunk(
        &self,
        doc_id: &str,
        logical_path: &str,
        display_name: &str,
        parsed: &ParsedDocument,
    ) -> Vec<Chunk> {
        let mut chunks = chunk_text(
            doc_id,
            &parsed.plaintext,
            self.chunking.chunk_size,
            self.chunking.chunk_overlap,
        );
        for chunk in &mut chunks {
            chunk.metadata.insert("doc_id".to_string(), doc_id.to_string());
            chunk
                .metadata
                .insert("logical_path".to_string(), logical_path.to_string());
            chunk
                .metadata
                .insert("display_name".to_string(), display_name.to_string());
        }
        chunks
    }

    /// Index one parsed document. `on_phase` observes intra-file phase
    /// transitions and completion percent for progress reporting.
    pub async fn index_document(
        &self,
        doc_id: &str,
        logical_path: &str,
        display_name: &str,
        parsed: &ParsedDocument,
        skip_graph: bool,
        cancel: &CancellationToken,
        mut on_phase: impl FnMut(IngestPhase, u8) + Send,
    ) -> Result<IndexOutcome, EngineError> {
        let mut outcome = IndexOutcome::default();

        on_phase(IngestPhase::Chunking, 10);
        let chunks = self.chunk(doc_id, logical_path, display_name, parsed);
        let previous_ids = self
            .with_store_timeout(self.lexical.ids_for_doc(doc_id))
            .await?;

        if chunks.is_empty() {
            // A now-empty document still removes its previous content.
            self.remove_ids(&previous_ids).await?;
            on_phase(IngestPhase::Finalizing, 100);
            return Ok(outcome);
        }

        outcome.chunk_ids = chunks.iter().map(|c| c.chunk_id.clone()).collect();
        outcome.chunks = chunks.len() as u64;

        // Embed and write vector + lexical in document order, batch by batch.
        // After each batch the chunk ids written so far are durable in both.
        on_phase(IngestPhase::Vectorizing, 25);
        let mut written: Vec<String> = Vec::new();
        let total_batches = chunks.len().div_ceil(EMBED_BATCH);
        for (batch_no, batch) in chunks.chunks(EMBED_BATCH).enumerate() {
            if cancel.is_cancelled() {
                self.rollback(&written).await;
                return Err(EngineError::Cancelled);
            }

            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let vectors = self.embedder.embed_batch(&texts).await?;
            let dim = self.vector.dimension();
            for vector in &vectors {
                if vector.len() != dim {
                    return Err(EngineError::Embedding(format!(
                        "embedder returned {}-dimension vector, index expects {dim}",
                        vector.len()
                    )));
                }
            }

            let vector_items: Vec<VectorItem> = batch
                .iter()
                .zip(&vectors)
                .map(|(chunk, vector)| VectorItem {
                    id: chunk.chunk_id.clone(),
                    vector: vector.clone(),
                    metadata: chunk.metadata.clone(),
                })
                .collect();
            self.with_store_timeout(self.vector.upsert(&vector_items))
                .await?;

            let lexical_items: Vec<LexicalItem> = batch
                .iter()
                .map(|chunk| LexicalItem {
                    id: chunk.chunk_id.clone(),
                    text: chunk.text.clone(),
                    metadata: chunk.metadata.clone(),
                })
                .collect();
            self.with_store_timeout(self.lexical.upsert(&lexical_items))
                .await?;

            written.extend(batch.iter().map(|c| c.chunk_id.clone()));
            let percent = 25 + (35 * (batch_no + 1) / total_batches) as u8;
            on_phase(IngestPhase::IndexingLexical, percent);
        }

        // Graph enrichment: failures here never undo chunk durability.
        if self.graph_enabled() && !skip_graph {
            on_phase(IngestPhase::ExtractingGraph, 70);
            self.extract_graph(doc_id, parsed, &chunks, cancel, &mut outcome)
                .await?;
        }

        // Replacement: drop ids from the previous version of this document
        // that no longer exist.
        let current: HashSet<&str> = outcome.chunk_ids.iter().map(String::as_str).collect();
        let stale: Vec<String> = previous_ids
            .into_iter()
            .filter(|id| !current.contains(id.as_str()))
            .collect();
        if !stale.is_empty() {
            debug!(doc_id, stale = stale.len(), "removing replaced chunks");
            self.remove_ids(&stale).await?;
        }

        on_phase(IngestPhase::Finalizing, 100);
        Ok(outcome)
    }

    async fn extract_graph(
        &self,
        doc_id: &str,
        parsed: &ParsedDocument,
        chunks: &[Chunk],
        cancel: &CancellationToken,
        outcome: &mut IndexOutcome,
    ) -> Result<(), EngineError> {
        let (Some(graph), Some(extractor)) = (self.graph.as_ref(), self.extractor.as_ref()) else {
            return Ok(());
        };

        // Extraction reads the configured representation; offsets still
        // index the plaintext that was chunked, so the chunk text itself is
        // used unless the whole document prefers markdown.
        let use_markdown = matches!(
            (self.extraction_format, parsed.metadata.tables),
            (ExtractionFormat::Markdown, _) | (ExtractionFormat::Auto, 1..)
        );

        let mut entity_keys: HashSet<(String, String)> = HashSet::new();
        for (i, chunk) in chunks.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            let text = if use_markdown && chunks.len() == 1 {
                parsed.markdown.as_str()
            } else {
                chunk.text.as_str()
            };

            match extractor.extract(text).await {
                Ok(triples) => {
                    if triples.is_empty() {
                        continue;
                    }
                    let sourced: Vec<SourcedTriple> = triples
                        .iter()
                        .map(|t| SourcedTriple {
                            triple: t.clone(),
                            chunk_id: chunk.chunk_id.clone(),
                            doc_id: doc_id.to_string(),
                        })
                        .collect();
                    self.with_store_timeout(graph.upsert_triples(&sourced))
                        .await?;

                    for t in &triples {
                        entity_keys
                            .insert((t.subject_label.to_lowercase(), t.subject_type.clone()));
                        entity_keys.insert((t.object_label.to_lowercase(), t.object_type.clone()));
                    }
                    outcome.triples += triples.len() as u64;
                    outcome.relations += triples.len() as u64;
                }
                Err(e) => {
                    warn!(doc_id, chunk = i, error = %e, "graph extraction failed");
                    outcome.graph_partial = true;
                    if outcome.graph_error.is_none() {
                        outcome.graph_error = Some(e);
                    }
                }
            }
        }
        outcome.entities = entity_keys.len() as u64;
        Ok(())
    }

    /// Remove a document's chunks from every store. Returns how many chunk
    /// ids were removed.
    pub async fn delete_document(&self, doc_id: &str) -> Result<usize, EngineError> {
        let ids = self
            .with_store_timeout(self.lexical.ids_for_doc(doc_id))
            .await?;
        if !ids.is_empty() {
            self.remove_ids(&ids).await?;
        }
        Ok(ids.len())
    }

    async fn remove_ids(&self, ids: &[String]) -> Result<(), EngineError> {
        if ids.is_empty() {
            return Ok(());
        }
        self.with_store_timeout(self.vector.delete(ids)).await?;
        if let Some(graph) = &self.graph {
            self.with_store_timeout(graph.delete_by_chunk_ids(ids))
                .await?;
        }
        self.with_store_timeout(self.lexical.delete(ids)).await?;
        Ok(())
    }

    /// Best-effort removal of partially written chunks after cancellation:
    /// either all stores have a chunk id or none do.
    pub async fn rollback(&self, ids: &[String]) {
        if ids.is_empty() {
            return;
        }
        if let Err(e) = self.remove_ids(ids).await {
            warn!(error = %e, "cleanup of partially written chunks failed");
        }
    }

    async fn with_store_timeout<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, EngineError>>,
    ) -> Result<T, EngineError> {
        match tokio::time::timeout(self.store_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::store_transient(format!(
                "store call exceeded {:?}",
                self.store_timeout
            ))),
        }
    }
}
