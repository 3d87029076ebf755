//! In-memory store implementations.
//!
//! Used for tests, ephemeral deployments, and small corpora. Vector search
//! is brute-force cosine similarity; keyword search is an in-process BM25
//! (k1 = 1.2, b = 0.75); the graph is a petgraph `StableGraph` with entity
//! and chunk nodes.
//!
//! State lives behind `std::sync::RwLock` — operations never hold the lock
//! across an await point.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::RwLock;

use async_trait::async_trait;
use petgraph::stable_graph::{NodeIndex, StableGraph};
use petgraph::visit::{EdgeRef, IntoEdgeReferences};
use petgraph::Direction;

use crate::embedding::cosine_similarity;
use crate::error::EngineError;

use super::{
    normalize_min_max, GraphEntity, GraphStore, LexicalHit, LexicalItem, LexicalStore,
    MentionEdge, SourcedTriple, Subgraph, SubgraphRelation, VectorHit, VectorItem, VectorStore,
};

// ═══════════════════════════════════════════════════════════════════════
// Vector store
// ═══════════════════════════════════════════════════════════════════════

/// Brute-force in-memory vector index.
pub struct MemoryVectorStore {
    dimension: usize,
    items: RwLock<HashMap<String, (Vec<f32>, BTreeMap<String, String>)>>,
}

impl MemoryVectorStore {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            items: RwLock::new(HashMap::new()),
        }
    }

    /// Number of stored vectors.
    pub fn len(&self) -> usize {
        self.items.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn upsert(&self, items: &[VectorItem]) -> Result<(), EngineError> {
        let mut stored = self.items.write().unwrap();
        for item in items {
            if item.vector.len() != self.dimension {
                return Err(EngineError::store_permanent(format!(
                    "vector for '{}' has dimension {}, index expects {}",
                    item.id,
                    item.vector.len(),
                    self.dimension
                )));
            }
            stored.insert(item.id.clone(), (item.vector.clone(), item.metadata.clone()));
        }
        Ok(())
    }

    async fn search(&self, query: &[f32], top_k: usize) -> Result<Vec<VectorHit>, EngineError> {
        let stored = self.items.read().unwrap();
        let mut hits: Vec<VectorHit> = stored
            .iter()
            .map(|(id, (vector, metadata))| VectorHit {
                id: id.clone(),
                // Cosine in [-1, 1] mapped onto [0, 1].
                score: f64::from(cosine_similarity(query, vector) + 1.0) / 2.0,
                metadata: metadata.clone(),
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn delete(&self, ids: &[String]) -> Result<(), EngineError> {
        let mut stored = self.items.write().unwrap();
        for id in ids {
            stored.remove(id);
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Lexical store (BM25)
// ═══════════════════════════════════════════════════════════════════════

const BM25_K1: f64 = 1.2;
const BM25_B: f64 = 0.75;

struct LexicalDoc {
    text: String,
    tokens: Vec<String>,
    metadata: BTreeMap<String, String>,
}

/// In-memory BM25 keyword index.
pub struct MemoryLexicalStore {
    docs: RwLock<HashMap<String, LexicalDoc>>,
}

impl MemoryLexicalStore {
    pub fn new() -> Self {
        Self {
            docs: RwLock::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.docs.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryLexicalStore {
    fn default() -> Self {
        Self::new()
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}

#[async_trait]
impl LexicalStore for MemoryLexicalStore {
    async fn upsert(&self, items: &[LexicalItem]) -> Result<(), EngineError> {
        let mut docs = self.docs.write().unwrap();
        for item in items {
            docs.insert(
                item.id.clone(),
                LexicalDoc {
                    tokens: tokenize(&item.text),
                    text: item.text.clone(),
                    metadata: item.metadata.clone(),
                },
            );
        }
        Ok(())
    }

    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<LexicalHit>, EngineError> {
        let terms = tokenize(query);
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let docs = self.docs.read().unwrap();
        let n = docs.len() as f64;
        if n == 0.0 {
            return Ok(Vec::new());
        }
        let avg_len: f64 =
            docs.values().map(|d| d.tokens.len() as f64).sum::<f64>() / n;

        // Document frequency per query term.
        let mut df: HashMap<&str, f64> = HashMap::new();
        for term in &terms {
            let count = docs.values().filter(|d| d.tokens.iter().any(|t| t == term)).count();
            df.insert(term.as_str(), count as f64);
        }

        let mut scored: Vec<(String, f64)> = Vec::new();
        for (id, doc) in docs.iter() {
            let dl = doc.tokens.len() as f64;
            let mut score = 0.0;
            for term in &terms {
                let tf = doc.tokens.iter().filter(|t| *t == term).count() as f64;
                if tf == 0.0 {
                    continue;
                }
                let df_t = df[term.as_str()];
                let idf = ((n - df_t + 0.5) / (df_t + 0.5) + 1.0).ln();
                let denom = tf + BM25_K1 * (1.0 - BM25_B + BM25_B * dl / avg_len.max(1.0));
                score += idf * tf * (BM25_K1 + 1.0) / denom;
            }
            if score > 0.0 {
                scored.push((id.clone(), score));
            }
        }

        let raw: Vec<f64> = scored.iter().map(|(_, s)| *s).collect();
        let normalized = normalize_min_max(&raw);

        let mut hits: Vec<LexicalHit> = scored
            .into_iter()
            .zip(normalized)
            .filter(|(_, norm)| *norm > 0.0)
            .map(|((id, _), norm)| {
                let doc = &docs[&id];
                LexicalHit {
                    id,
                    score: norm,
                    text: doc.text.clone(),
                    metadata: doc.metadata.clone(),
                }
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn fetch(&self, ids: &[String]) -> Result<Vec<LexicalHit>, EngineError> {
        let docs = self.docs.read().unwrap();
        Ok(ids
            .iter()
            .filter_map(|id| {
                docs.get(id).map(|doc| LexicalHit {
                    id: id.clone(),
                    score: 0.0,
                    text: doc.text.clone(),
                    metadata: doc.metadata.clone(),
                })
            })
            .collect())
    }

    async fn ids_for_doc(&self, doc_id: &str) -> Result<Vec<String>, EngineError> {
        let docs = self.docs.read().unwrap();
        let mut ids: Vec<String> = docs
            .iter()
            .filter(|(_, d)| d.metadata.get("doc_id").map(String::as_str) == Some(doc_id))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn delete(&self, ids: &[String]) -> Result<(), EngineError> {
        let mut docs = self.docs.write().unwrap();
        for id in ids {
            docs.remove(id);
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Graph store
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
enum GraphNode {
    Entity {
        /// Display casing of the label (first seen wins).
        label: String,
        entity_type: String,
    },
    Chunk {
        chunk_id: String,
    },
}

#[derive(Debug, Clone)]
enum GraphEdge {
    Rel { predicate: String, chunk_id: String },
    Mentions,
}

#[derive(Default)]
struct GraphInner {
    graph: StableGraph<GraphNode, GraphEdge>,
    /// (casefolded label, casefolded type) → entity node.
    entities: HashMap<(String, String), NodeIndex>,
    /// chunk_id → chunk node.
    chunks: HashMap<String, NodeIndex>,
}

/// In-memory knowledge graph backed by a petgraph `StableGraph`.
pub struct MemoryGraphStore {
    inner: RwLock<GraphInner>,
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(GraphInner::default()),
        }
    }

    /// (entities, relations) counts, for run counters and `/status`.
    pub fn stats(&self) -> (usize, usize) {
        let inner = self.inner.read().unwrap();
        let relations = inner
            .graph
            .edge_indices()
            .filter(|e| matches!(inner.graph[*e], GraphEdge::Rel { .. }))
            .count();
        (inner.entities.len(), relations)
    }
}

impl Default for MemoryGraphStore {
    fn default() -> Self {
        Self::new()
    }
}

fn entity_key(label: &str, entity_type: &str) -> (String, String) {
    (label.to_lowercase(), entity_type.to_lowercase())
}

impl GraphInner {
    fn entity_node(&mut self, label: &str, entity_type: &str) -> NodeIndex {
        let key = entity_key(label, entity_type);
        if let Some(&idx) = self.entities.get(&key) {
            return idx;
        }
        let idx = self.graph.add_node(GraphNode::Entity {
            label: label.to_string(),
            entity_type: entity_type.to_uppercase(),
        });
        self.entities.insert(key, idx);
        idx
    }

    fn chunk_node(&mut self, chunk_id: &str) -> NodeIndex {
        if let Some(&idx) = self.chunks.get(chunk_id) {
            return idx;
        }
        let idx = self.graph.add_node(GraphNode::Chunk {
            chunk_id: chunk_id.to_string(),
        });
        self.chunks.insert(chunk_id.to_string(), idx);
        idx
    }

    fn has_rel(&self, from: NodeIndex, to: NodeIndex, predicate: &str, chunk_id: &str) -> bool {
        self.graph
            .edges_directed(from, Direction::Outgoing)
            .any(|e| {
                e.target() == to
                    && matches!(
                        e.weight(),
                        GraphEdge::Rel { predicate: p, chunk_id: c } if p == predicate && c == chunk_id
                    )
            })
    }

    fn has_mention(&self, chunk: NodeIndex, entity: NodeIndex) -> bool {
        self.graph
            .edges_directed(chunk, Direction::Outgoing)
            .any(|e| e.target() == entity && matches!(e.weight(), GraphEdge::Mentions))
    }

    fn entity_of(&self, idx: NodeIndex) -> Option<GraphEntity> {
        match self.graph.node_weight(idx)? {
            GraphNode::Entity { label, entity_type } => Some(GraphEntity {
                label: label.clone(),
                entity_type: entity_type.clone(),
            }),
            GraphNode::Chunk { .. } => None,
        }
    }
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    async fn upsert_triples(&self, triples: &[SourcedTriple]) -> Result<(), EngineError> {
        let mut inner = self.inner.write().unwrap();
        for st in triples {
            let t = &st.triple;
            let subject = inner.entity_node(&t.subject_label, &t.subject_type);
            let object = inner.entity_node(&t.object_label, &t.object_type);
            let chunk = inner.chunk_node(&st.chunk_id);

            if !inner.has_rel(subject, object, &t.predicate, &st.chunk_id) {
                inner.graph.add_edge(
                    subject,
                    object,
                    GraphEdge::Rel {
                        predicate: t.predicate.clone(),
                        chunk_id: st.chunk_id.clone(),
                    },
                );
            }
            for entity in [subject, object] {
                if !inner.has_mention(chunk, entity) {
                    inner.graph.add_edge(chunk, entity, GraphEdge::Mentions);
                }
            }
        }
        Ok(())
    }

    async fn query(&self, seeds: &[String], depth: usize) -> Result<Subgraph, EngineError> {
        let depth = depth.min(2);
        let inner = self.inner.read().unwrap();

        // Seed entity nodes: case-insensitive label match across all types.
        let mut frontier: VecDeque<(NodeIndex, usize)> = VecDeque::new();
        let mut visited: HashSet<NodeIndex> = HashSet::new();
        for seed in seeds {
            let needle = seed.to_lowercase();
            for ((label, _), &idx) in inner.entities.iter() {
                if *label == needle && visited.insert(idx) {
                    frontier.push_back((idx, 0));
                }
            }
        }

        // Undirected BFS over relation edges.
        while let Some((idx, dist)) = frontier.pop_front() {
            if dist >= depth {
                continue;
            }
            for edge in inner.graph.edges_directed(idx, Direction::Outgoing).chain(
                inner.graph.edges_directed(idx, Direction::Incoming),
            ) {
                if !matches!(edge.weight(), GraphEdge::Rel { .. }) {
                    continue;
                }
                let other = if edge.source() == idx { edge.target() } else { edge.source() };
                if visited.insert(other) {
                    frontier.push_back((other, dist + 1));
                }
            }
        }

        let mut subgraph = Subgraph::default();
        for &idx in &visited {
            if let Some(entity) = inner.entity_of(idx) {
                subgraph.entities.push(entity);
            }
        }
        subgraph.entities.sort_by(|a, b| {
            a.label.cmp(&b.label).then_with(|| a.entity_type.cmp(&b.entity_type))
        });

        for edge in inner.graph.edge_references() {
            match edge.weight() {
                GraphEdge::Rel { predicate, chunk_id } => {
                    if visited.contains(&edge.source()) && visited.contains(&edge.target()) {
                        if let (Some(subject), Some(object)) =
                            (inner.entity_of(edge.source()), inner.entity_of(edge.target()))
                        {
                            subgraph.relations.push(SubgraphRelation {
                                subject,
                                predicate: predicate.clone(),
                                object,
                                chunk_id: chunk_id.clone(),
                            });
                        }
                    }
                }
                GraphEdge::Mentions => {
                    if visited.contains(&edge.target()) {
                        if let (GraphNode::Chunk { chunk_id }, Some(entity)) = (
                            &inner.graph[edge.source()],
                            inner.entity_of(edge.target()),
                        ) {
                            subgraph.mentions.push(MentionEdge {
                                chunk_id: chunk_id.clone(),
                                entity,
                            });
                        }
                    }
                }
            }
        }
        subgraph
            .mentions
            .sort_by(|a, b| a.chunk_id.cmp(&b.chunk_id).then_with(|| a.entity.label.cmp(&b.entity.label)));

        Ok(subgraph)
    }

    async fn delete_by_chunk_ids(&self, ids: &[String]) -> Result<(), EngineError> {
        let mut inner = self.inner.write().unwrap();
        let id_set: HashSet<&str> = ids.iter().map(String::as_str).collect();

        // Drop relation edges extracted from these chunks.
        let stale_edges: Vec<_> = inner
            .graph
            .edge_indices()
            .filter(|&e| {
                matches!(&inner.graph[e], GraphEdge::Rel { chunk_id, .. } if id_set.contains(chunk_id.as_str()))
            })
            .collect();
        for edge in stale_edges {
            inner.graph.remove_edge(edge);
        }

        // Drop the chunk nodes themselves (removes their MENTIONS edges).
        for id in ids {
            if let Some(idx) = inner.chunks.remove(id) {
                inner.graph.remove_node(idx);
            }
        }

        // Prune entities left with no edges at all.
        let orphans: Vec<(String, String)> = inner
            .entities
            .iter()
            .filter(|(_, &idx)| inner.graph.edges_directed(idx, Direction::Outgoing).next().is_none()
                && inner.graph.edges_directed(idx, Direction::Incoming).next().is_none())
            .map(|(key, _)| key.clone())
            .collect();
        for key in orphans {
            if let Some(idx) = inner.entities.remove(&key) {
                inner.graph.remove_node(idx);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Triple;

    fn item(id: &str, vector: Vec<f32>) -> VectorItem {
        VectorItem {
            id: id.to_string(),
            vector,
            metadata: BTreeMap::new(),
        }
    }

    fn triple(s: &str, p: &str, o: &str, chunk: &str) -> SourcedTriple {
        SourcedTriple {
            triple: Triple {
                subject_label: s.to_string(),
                subject_type: "PERSON".to_string(),
                predicate: p.to_string(),
                object_label: o.to_string(),
                object_type: "ORGANIZATION".to_string(),
            },
            chunk_id: chunk.to_string(),
            doc_id: "doc1".to_string(),
        }
    }

    #[tokio::test]
    async fn vector_upsert_is_idempotent() {
        let store = MemoryVectorStore::new(3);
        let items = vec![item("c1", vec![1.0, 0.0, 0.0])];
        store.upsert(&items).await.unwrap();
        store.upsert(&items).await.unwrap();
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn vector_search_scores_in_unit_interval() {
        let store = MemoryVectorStore::new(2);
        store
            .upsert(&[item("a", vec![1.0, 0.0]), item("b", vec![-1.0, 0.0])])
            .await
            .unwrap();
        let hits = store.search(&[1.0, 0.0], 10).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "a");
        assert!((hits[0].score - 1.0).abs() < 1e-6);
        assert!(hits[1].score.abs() < 1e-6);
    }

    #[tokio::test]
    async fn vector_rejects_wrong_dimension() {
        let store = MemoryVectorStore::new(3);
        let err = store.upsert(&[item("c1", vec![1.0])]).await.unwrap_err();
        assert_eq!(err.kind(), "StoreError.permanent");
    }

    #[tokio::test]
    async fn bm25_ranks_matching_chunk_first() {
        let store = MemoryLexicalStore::new();
        let mk = |id: &str, text: &str| LexicalItem {
            id: id.to_string(),
            text: text.to_string(),
            metadata: BTreeMap::new(),
        };
        store
            .upsert(&[
                mk("c1", "The rover Perseverance was built by NASA."),
                mk("c2", "Bread is baked with flour and water."),
                mk("c3", "NASA also built the Curiosity rover."),
            ])
            .await
            .unwrap();

        let hits = store.search("who built Perseverance", 10).await.unwrap();
        assert!(!hits.is_empty());
        assert_eq!(hits[0].id, "c1");
        assert!(hits.iter().all(|h| h.score > 0.0 && h.score <= 1.0));
        assert!(hits.iter().all(|h| h.id != "c2"));
    }

    #[tokio::test]
    async fn lexical_ids_for_doc_filters_by_metadata() {
        let store = MemoryLexicalStore::new();
        let mut meta = BTreeMap::new();
        meta.insert("doc_id".to_string(), "d1".to_string());
        store
            .upsert(&[LexicalItem {
                id: "c1".to_string(),
                text: "x".to_string(),
                metadata: meta,
            }])
            .await
            .unwrap();
        assert_eq!(store.ids_for_doc("d1").await.unwrap(), vec!["c1".to_string()]);
        assert!(store.ids_for_doc("d2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn graph_query_traverses_two_hops_with_mentions() {
        let store = MemoryGraphStore::new();
        store
            .upsert_triples(&[
                triple("Alice", "WORKS_AT", "Acme", "chunk1"),
                triple("Acme", "BASED_IN", "Paris", "chunk1"),
            ])
            .await
            .unwrap();

        let subgraph = store.query(&["alice".to_string()], 2).await.unwrap();
        let labels: Vec<&str> = subgraph.entities.iter().map(|e| e.label.as_str()).collect();
        assert!(labels.contains(&"Alice"));
        assert!(labels.contains(&"Acme"));
        assert!(labels.contains(&"Paris"));
        assert_eq!(subgraph.relations.len(), 2);
        assert!(subgraph.mentions.iter().all(|m| m.chunk_id == "chunk1"));
        assert!(subgraph.mentions.len() >= 3);
    }

    #[tokio::test]
    async fn graph_depth_one_stops_early() {
        let store = MemoryGraphStore::new();
        store
            .upsert_triples(&[
                triple("Alice", "WORKS_AT", "Acme", "chunk1"),
                triple("Acme", "BASED_IN", "Paris", "chunk2"),
            ])
            .await
            .unwrap();
        let subgraph = store.query(&["Alice".to_string()], 1).await.unwrap();
        let labels: Vec<&str> = subgraph.entities.iter().map(|e| e.label.as_str()).collect();
        assert!(labels.contains(&"Acme"));
        assert!(!labels.contains(&"Paris"));
    }

    #[tokio::test]
    async fn graph_upsert_is_idempotent() {
        let store = MemoryGraphStore::new();
        let triples = vec![triple("Alice", "WORKS_AT", "Acme", "chunk1")];
        store.upsert_triples(&triples).await.unwrap();
        store.upsert_triples(&triples).await.unwrap();
        let (entities, relations) = store.stats();
        assert_eq!(entities, 2);
        assert_eq!(relations, 1);
    }

    #[tokio::test]
    async fn graph_delete_by_chunk_prunes_orphans() {
        let store = MemoryGraphStore::new();
        store
            .upsert_triples(&[
                triple("Alice", "WORKS_AT", "Acme", "chunk1"),
                triple("Bob", "WORKS_AT", "Acme", "chunk2"),
            ])
            .await
            .unwrap();

        store.delete_by_chunk_ids(&["chunk1".to_string()]).await.unwrap();
        let (entities, relations) = store.stats();
        // Alice is orphaned and pruned; Bob and Acme survive via chunk2.
        assert_eq!(entities, 2);
        assert_eq!(relations, 1);

        let subgraph = store.query(&["Alice".to_string()], 2).await.unwrap();
        assert!(subgraph.entities.is_empty());
    }
}
