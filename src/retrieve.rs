//! Hybrid retriever: vector, lexical, and graph search with score fusion.
//!
//! # Algorithm
//!
//! 1. Launch the enabled sub-retrievers concurrently, each fetching
//!    `top_k * 2` candidates.
//! 2. Min-max normalize scores per modality to `[0, 1]`.
//! 3. Fuse: `fused = Σ weight_m · score_m`, default weights
//!    `vector 0.5 / lexical 0.3 / graph 0.2`, renormalized over the enabled
//!    modalities.
//! 4. Deduplicate by chunk id, keeping each modality's score for
//!    transparency.
//! 5. Drop zero-score results.
//! 6. Sort by fused score descending, chunk id ascending — repeated calls
//!    over unchanged stores return identical lists.
//!
//! The graph modality asks the LLM for 1–5 seed entities, walks the graph
//! two hops from the seeds, collects chunk ids from MENTIONS provenance,
//! and scores each chunk by its share of matched entities.
//!
//! A single failing modality is logged and skipped; if every enabled
//! modality fails the retrieval fails.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use crate::embedding::Embedder;
use crate::error::EngineError;
use crate::llm::{CompleteOptions, Llm};
use crate::models::{RankedNode, RetrievalMode};
use crate::store::{normalize_min_max, GraphStore, LexicalStore, VectorStore};

/// Fusion weight per modality before renormalization.
fn base_weight(mode: RetrievalMode) -> f64 {
    match mode {
        RetrievalMode::Vector => 0.5,
        RetrievalMode::Lexical => 0.3,
        RetrievalMode::Graph => 0.2,
    }
}

/// One modality's candidate before fusion.
struct Candidate {
    chunk_id: String,
    raw_score: f64,
    text: Option<String>,
    metadata: BTreeMap<String, String>,
}

pub struct HybridRetriever {
    embedder: Arc<dyn Embedder>,
    vector: Arc<dyn VectorStore>,
    lexical: Arc<dyn LexicalStore>,
    graph: Option<Arc<dyn GraphStore>>,
    llm: Arc<dyn Llm>,
}

impl HybridRetriever {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        vector: Arc<dyn VectorStore>,
        lexical: Arc<dyn LexicalStore>,
        graph: Option<Arc<dyn GraphStore>>,
        llm: Arc<dyn Llm>,
    ) -> Self {
        Self {
            embedder,
            vector,
            lexical,
            graph,
            llm,
        }
    }

    /// Modalities enabled by configuration, intersected with the request.
    fn effective_modes(&self, requested: &[RetrievalMode]) -> Vec<RetrievalMode> {
        let requested = if requested.is_empty() {
            vec![
                RetrievalMode::Vector,
                RetrievalMode::Lexical,
                RetrievalMode::Graph,
            ]
        } else {
            requested.to_vec()
        };
        requested
            .into_iter()
            .filter(|m| *m != RetrievalMode::Graph || self.graph.is_some())
            .collect()
    }

    /// Run hybrid retrieval for `query`, returning at most `top_k` nodes.
    pub async fn retrieve(
        &self,
        query: &str,
        top_k: usize,
        modes: &[RetrievalMode],
    ) -> Result<Vec<RankedNode>, EngineError> {
        if query.trim().is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }

        let modes = self.effective_modes(modes);
        if modes.is_empty() {
            return Ok(Vec::new());
        }
        let per_source_k = top_k * 2;

        let want = |m: RetrievalMode| modes.contains(&m);
        let (vector_result, lexical_result, graph_result) = tokio::join!(
            async {
                if want(RetrievalMode::Vector) {
                    Some(self.vector_candidates(query, per_source_k).await)
                } else {
                    None
                }
            },
            async {
                if want(RetrievalMode::Lexical) {
                    Some(self.lexical_candidates(query, per_source_k).await)
                } else {
                    None
                }
            },
            async {
                if want(RetrievalMode::Graph) {
                    Some(self.graph_candidates(query).await)
                } else {
                    None
                }
            },
        );

        let mut per_modality: Vec<(RetrievalMode, Vec<Candidate>)> = Vec::new();
        let mut failures = 0usize;
        for (mode, result) in [
            (RetrievalMode::Vector, vector_result),
            (RetrievalMode::Lexical, lexical_result),
            (RetrievalMode::Graph, graph_result),
        ] {
            let Some(result) = result else { continue };
            match result {
                Ok(candidates) => per_modality.push((mode, candidates)),
                Err(e) => {
                    warn!(modality = mode.as_str(), error = %e, "retrieval modality failed");
                    failures += 1;
                }
            }
        }

        if per_modality.is_empty() && failures > 0 {
            return Err(EngineError::Retrieval(format!(
                "all {failures} enabled retrieval modalities failed"
            )));
        }

        // Renormalize fusion weights over the modalities that produced
        // results or at least ran.
        let weight_total: f64 = per_modality.iter().map(|(m, _)| base_weight(*m)).sum();

        struct Fused {
            fused_score: f64,
            per_modality_scores: BTreeMap<String, f64>,
            text: Option<String>,
            metadata: BTreeMap<String, String>,
        }
        let mut fused: HashMap<String, Fused> = HashMap::new();

        for (mode, candidates) in per_modality {
            let weight = base_weight(mode) / weight_total;
            let raw: Vec<f64> = candidates.iter().map(|c| c.raw_score).collect();
            let normalized = normalize_min_max(&raw);

            for (candidate, score) in candidates.into_iter().zip(normalized) {
                let entry = fused.entry(candidate.chunk_id).or_insert_with(|| Fused {
                    fused_score: 0.0,
                    per_modality_scores: BTreeMap::new(),
                    text: None,
                    metadata: BTreeMap::new(),
                });
                entry.fused_score += weight * score;
                // Dedup within a modality keeps the max score.
                let slot = entry
                    .per_modality_scores
                    .entry(mode.as_str().to_string())
                    .or_insert(0.0);
                *slot = slot.max(score);
                if entry.text.is_none() {
                    entry.text = candidate.text;
                }
                if entry.metadata.is_empty() {
                    entry.metadata = candidate.metadata;
                }
            }
        }

        // Resolve text for chunks only the vector index returned.
        let missing: Vec<String> = fused
            .iter()
            .filter(|(_, f)| f.text.is_none())
            .map(|(id, _)| id.clone())
            .collect();
        if !missing.is_empty() {
            for hit in self.lexical.fetch(&missing).await? {
                if let Some(entry) = fused.get_mut(&hit.id) {
                    entry.text = Some(hit.text);
                    if entry.metadata.is_empty() {
                        entry.metadata = hit.metadata;
                    }
                }
            }
        }

        let mut nodes: Vec<RankedNode> = fused
            .into_iter()
            .filter(|(_, f)| f.fused_score > 0.0)
            .map(|(chunk_id, f)| {
                let get = |key: &str| f.metadata.get(key).cloned().unwrap_or_default();
                RankedNode {
                    chunk_id,
                    text: f.text.unwrap_or_default(),
                    fused_score: f.fused_score,
                    per_modality_scores: f.per_modality_scores,
                    doc_id: get("doc_id"),
                    display_name: get("display_name"),
                    logical_path: get("logical_path"),
                }
            })
            .collect();

        nodes.sort_by(|a, b| {
            b.fused_score
                .partial_cmp(&a.fused_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        nodes.truncate(top_k);
        Ok(nodes)
    }

    async fn vector_candidates(
        &self,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<Candidate>, EngineError> {
        let query_vec = self.embedder.embed_query(query).await?;
        let hits = self.vector.search(&query_vec, top_k).await?;
        Ok(hits
            .into_iter()
            .map(|hit| Candidate {
                chunk_id: hit.id,
                raw_score: hit.score,
                text: None,
                metadata: hit.metadata,
            })
            .collect())
    }

    async fn lexical_candidates(
        &self,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<Candidate>, EngineError> {
        let hits = self.lexical.search(query, top_k).await?;
        Ok(hits
            .into_iter()
            .map(|hit| Candidate {
                chunk_id: hit.id,
                raw_score: hit.score,
                text: Some(hit.text),
                metadata: hit.metadata,
            })
            .collect())
    }

    async fn graph_candidates(&self, query: &str) -> Result<Vec<Candidate>, EngineError> {
        let Some(graph) = &self.graph else {
            return Ok(Vec::new());
        };

        let seeds = self.extract_seed_entities(query).await?;
        if seeds.is_empty() {
            return Ok(Vec::new());
        }

        let subgraph = graph.query(&seeds, 2).await?;
        if subgraph.mentions.is_empty() {
            return Ok(Vec::new());
        }

        // Score a chunk by how many subgraph entities it mentions.
        let mut match_counts: HashMap<String, usize> = HashMap::new();
        for mention in &subgraph.mentions {
            *match_counts.entry(mention.chunk_id.clone()).or_insert(0) += 1;
        }
        let max_count = match_counts.values().copied().max().unwrap_or(1) as f64;

        let chunk_ids: Vec<String> = match_counts.keys().cloned().collect();
        let texts = self.lexical.fetch(&chunk_ids).await?;
        let mut by_id: HashMap<String, (String, BTreeMap<String, String>)> = texts
            .into_iter()
            .map(|hit| (hit.id, (hit.text, hit.metadata)))
            .collect();

        Ok(match_counts
            .into_iter()
            .map(|(chunk_id, count)| {
                let (text, metadata) = by_id.remove(&chunk_id).unwrap_or_default();
                Candidate {
                    chunk_id,
                    raw_score: count as f64 / max_count,
                    text: Some(text),
                    metadata,
                }
            })
            .collect())
    }

    /// Ask the LLM for 1–5 seed entities mentioned in the query.
    async fn extract_seed_entities(&self, query: &str) -> Result<Vec<String>, EngineError> {
        let options = CompleteOptions {
            system: Some(
                "Extract the named entities from the user's question. Respond with a \
                 JSON array of 1 to 5 entity name strings, nothing else."
                    .to_string(),
            ),
            temperature: Some(0.0),
            max_tokens: Some(128),
        };
        let response = self.llm.complete(query, &options).await?;

        let start = response.find('[');
        let end = response.rfind(']');
        let (Some(start), Some(end)) = (start, end) else {
            return Ok(Vec::new());
        };
        let seeds: Vec<String> = serde_json::from_str::<Value>(&response[start..=end])
            .ok()
            .and_then(|v| {
                v.as_array().map(|arr| {
                    arr.iter()
                        .filter_map(|s| s.as_str().map(|s| s.trim().to_string()))
                        .filter(|s| !s.is_empty())
                        .collect()
                })
            })
            .unwrap_or_default();
        Ok(seeds.into_iter().take(5).collect())
    }
}
