//! Storage abstractions for the three index modalities.
//!
//! The [`VectorStore`], [`LexicalStore`], and [`GraphStore`] traits define
//! the contracts any backend must satisfy, enabling pluggable
//! implementations behind the factory's kind registry. Built-ins live in
//! [`memory`] (tests, small corpora) and [`sqlite`] (persistent single-node
//! deployments); external engines plug in by implementing the same traits.
//!
//! All upserts are idempotent by id — that idempotence is the engine's
//! cross-store consistency primitive, replacing distributed transactions.
//!
//! Implementations must be `Send + Sync`; stores are shared by concurrent
//! ingestion runs and the sync controller.

pub mod memory;
pub mod sqlite;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::models::Triple;

// ═══════════════════════════════════════════════════════════════════════
// Vector store
// ═══════════════════════════════════════════════════════════════════════

/// One embedded chunk to upsert into a vector store.
#[derive(Debug, Clone)]
pub struct VectorItem {
    pub id: String,
    pub vector: Vec<f32>,
    pub metadata: BTreeMap<String, String>,
}

/// A vector search hit. `score` is cosine similarity normalized to `[0, 1]`.
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub id: String,
    pub score: f64,
    pub metadata: BTreeMap<String, String>,
}

/// Embedding index keyed by chunk id.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// The dimensionality this index was created with.
    fn dimension(&self) -> usize;

    /// Insert or replace items; idempotent by id.
    async fn upsert(&self, items: &[VectorItem]) -> Result<(), EngineError>;

    /// Nearest neighbours of `query`, best first, scores in `[0, 1]`.
    async fn search(&self, query: &[f32], top_k: usize) -> Result<Vec<VectorHit>, EngineError>;

    /// Best-effort removal of the given ids.
    async fn delete(&self, ids: &[String]) -> Result<(), EngineError>;
}

// ═══════════════════════════════════════════════════════════════════════
// Lexical store
// ═══════════════════════════════════════════════════════════════════════

/// One chunk of text to index for keyword search.
#[derive(Debug, Clone)]
pub struct LexicalItem {
    pub id: String,
    pub text: String,
    pub metadata: BTreeMap<String, String>,
}

/// A keyword search hit. `score` is min-max normalized over the returned
/// batch; zero-score results are dropped before returning.
#[derive(Debug, Clone)]
pub struct LexicalHit {
    pub id: String,
    pub score: f64,
    pub text: String,
    pub metadata: BTreeMap<String, String>,
}

/// BM25 keyword index keyed by chunk id.
#[async_trait]
pub trait LexicalStore: Send + Sync {
    /// Insert or replace items; idempotent by id.
    async fn upsert(&self, items: &[LexicalItem]) -> Result<(), EngineError>;

    /// BM25 search; scores min-max normalized to `[0, 1]`, zeros dropped.
    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<LexicalHit>, EngineError>;

    /// Fetch stored items by id (scores are zero). Used by graph retrieval
    /// to resolve chunk text from MENTIONS provenance.
    async fn fetch(&self, ids: &[String]) -> Result<Vec<LexicalHit>, EngineError>;

    /// Ids of all chunks whose metadata carries the given `doc_id`. Used by
    /// deletion flows to find every chunk of a document.
    async fn ids_for_doc(&self, doc_id: &str) -> Result<Vec<String>, EngineError>;

    /// Remove the given ids.
    async fn delete(&self, ids: &[String]) -> Result<(), EngineError>;
}

// ═══════════════════════════════════════════════════════════════════════
// Graph store
// ═══════════════════════════════════════════════════════════════════════

/// A triple plus the chunk/document it was extracted from.
#[derive(Debug, Clone)]
pub struct SourcedTriple {
    pub triple: Triple,
    pub chunk_id: String,
    pub doc_id: String,
}

/// An entity node: identity is `(casefolded label, type)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphEntity {
    pub label: String,
    pub entity_type: String,
}

/// A typed relation edge in a returned subgraph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubgraphRelation {
    pub subject: GraphEntity,
    pub predicate: String,
    pub object: GraphEntity,
    pub chunk_id: String,
}

/// A `(:Chunk)-[:MENTIONS]->(:Entity)` edge in a returned subgraph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MentionEdge {
    pub chunk_id: String,
    pub entity: GraphEntity,
}

/// Result of a seeded graph traversal.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Subgraph {
    pub entities: Vec<GraphEntity>,
    pub relations: Vec<SubgraphRelation>,
    pub mentions: Vec<MentionEdge>,
}

/// Knowledge graph of entities, typed relations, and chunk provenance.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Upsert triples; idempotent on `(subject, predicate, object, chunk_id)`.
    /// Also records a MENTIONS edge from the chunk to both endpoints.
    async fn upsert_triples(&self, triples: &[SourcedTriple]) -> Result<(), EngineError>;

    /// Subgraph reachable from the seed entity labels within `depth` hops
    /// (`depth` ≤ 2). Seed matching is case-insensitive on the label.
    async fn query(&self, seeds: &[String], depth: usize) -> Result<Subgraph, EngineError>;

    /// Remove all relations and mentions recorded from the given chunks,
    /// pruning entities that lose their last mention.
    async fn delete_by_chunk_ids(&self, ids: &[String]) -> Result<(), EngineError>;
}

// ═══════════════════════════════════════════════════════════════════════
// Score normalization
// ═══════════════════════════════════════════════════════════════════════

/// Min-max normalize raw scores to `[0.0, 1.0]`.
///
/// If all scores are equal, they normalize to `1.0`. This is the default
/// normalization strategy for every retrieval modality; swap this function
/// to change it engine-wide.
pub fn normalize_min_max(scores: &[f64]) -> Vec<f64> {
    if scores.is_empty() {
        return Vec::new();
    }
    let min = scores.iter().copied().fold(f64::INFINITY, f64::min);
    let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    scores
        .iter()
        .map(|&s| {
            if (max - min).abs() < f64::EPSILON {
                1.0
            } else {
                (s - min) / (max - min)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_empty() {
        assert!(normalize_min_max(&[]).is_empty());
    }

    #[test]
    fn normalize_single_value_is_one() {
        assert_eq!(normalize_min_max(&[5.0]), vec![1.0]);
    }

    #[test]
    fn normalize_range() {
        let out = normalize_min_max(&[10.0, 5.0, 0.0]);
        assert!((out[0] - 1.0).abs() < 1e-9);
        assert!((out[1] - 0.5).abs() < 1e-9);
        assert!((out[2] - 0.0).abs() < 1e-9);
    }

    #[test]
    fn normalize_all_equal() {
        let out = normalize_min_max(&[3.0, 3.0, 3.0]);
        assert!(out.iter().all(|s| (*s - 1.0).abs() < 1e-9));
    }

    #[test]
    fn normalize_stays_in_unit_interval() {
        let out = normalize_min_max(&[-5.0, 100.0, 42.0]);
        assert!(out.iter().all(|s| (0.0..=1.0).contains(s)));
    }
}
