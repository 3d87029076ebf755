//! Shared fixtures for integration tests: deterministic stand-ins for the
//! LLM, embedder, parser, and extractor, plus an engine assembly over the
//! in-memory stores.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use lattice::config::{from_env_map, Config};
use lattice::embedding::Embedder;
use lattice::error::EngineError;
use lattice::extractor::TripleExtractor;
use lattice::index::IndexBuilder;
use lattice::ingest::IngestionManager;
use lattice::llm::{CompleteOptions, Llm, TokenStream};
use lattice::models::{
    Document, ExtractionFormat, IngestRun, ParseMetadata, ParsedDocument, Triple,
};
use lattice::parser::DocumentParser;
use lattice::retrieve::HybridRetriever;
use lattice::status::StatusRegistry;
use lattice::store::memory::{MemoryGraphStore, MemoryLexicalStore, MemoryVectorStore};
use lattice::store::{GraphStore, LexicalStore, VectorStore};

pub const TEST_DIM: usize = 64;

/// Deterministic embedder: hashes words into a fixed-dimension bag, with an
/// optional per-batch delay to make cancellation windows observable.
pub struct HashEmbedder {
    dim: usize,
    delay: Option<Duration>,
}

impl HashEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim, delay: None }
    }

    pub fn with_delay(dim: usize, delay: Duration) -> Self {
        Self {
            dim,
            delay: Some(delay),
        }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dim];
        for token in text.to_lowercase().split(|c: char| !c.is_alphanumeric()) {
            if token.is_empty() {
                continue;
            }
            let mut h = 0usize;
            for b in token.bytes() {
                h = h.wrapping_mul(31).wrapping_add(b as usize);
            }
            v[h % self.dim] += 1.0;
        }
        v
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn model_name(&self) -> &str {
        "hash-test"
    }

    fn dimension(&self) -> usize {
        self.dim
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EngineError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

/// LLM stub: `complete` returns a fixed reply (entity extraction etc.),
/// `stream_complete` streams a fixed answer in two fragments.
pub struct StubLlm {
    pub complete_reply: String,
    pub stream_reply: String,
}

impl StubLlm {
    pub fn new(complete_reply: &str, stream_reply: &str) -> Self {
        Self {
            complete_reply: complete_reply.to_string(),
            stream_reply: stream_reply.to_string(),
        }
    }
}

#[async_trait]
impl Llm for StubLlm {
    fn name(&self) -> &str {
        "stub-test"
    }

    async fn complete(
        &self,
        _prompt: &str,
        _options: &CompleteOptions,
    ) -> Result<String, EngineError> {
        Ok(self.complete_reply.clone())
    }

    async fn stream_complete(&self, _prompt: &str) -> Result<TokenStream, EngineError> {
        let mid = self.stream_reply.len() / 2;
        let parts = vec![
            Ok(self.stream_reply[..mid].to_string()),
            Ok(self.stream_reply[mid..].to_string()),
        ];
        Ok(Box::pin(futures::stream::iter(parts)))
    }
}

/// Extractor stub returning a fixed triple list for every chunk.
pub struct ScriptedExtractor(pub Vec<Triple>);

#[async_trait]
impl TripleExtractor for ScriptedExtractor {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn extract(&self, _chunk_text: &str) -> Result<Vec<Triple>, EngineError> {
        Ok(self.0.clone())
    }
}

pub fn triple(s: &str, st: &str, p: &str, o: &str, ot: &str) -> Triple {
    Triple {
        subject_label: s.to_string(),
        subject_type: st.to_string(),
        predicate: p.to_string(),
        object_label: o.to_string(),
        object_type: ot.to_string(),
    }
}

/// Parser stub: plain-text pass-through, except files whose name contains
/// `slow`, which time out like an oversized document would.
pub struct StubParser;

#[async_trait]
impl DocumentParser for StubParser {
    fn name(&self) -> &str {
        "stub"
    }

    async fn parse(&self, doc: &Document) -> Result<ParsedDocument, EngineError> {
        if doc.display_name.contains("slow") {
            tokio::time::sleep(Duration::from_millis(50)).await;
            return Err(EngineError::ParseTimeout(Duration::from_secs(1)));
        }
        let text = String::from_utf8_lossy(
            &doc.bytes()
                .map_err(|e| EngineError::ParseFailure(e.to_string()))?,
        )
        .to_string();
        Ok(ParsedDocument {
            markdown: text.clone(),
            plaintext: text,
            metadata: ParseMetadata::default(),
            parser_name: "stub".to_string(),
            parse_mode: "test".to_string(),
        })
    }
}

pub fn test_config(graph_enabled: bool) -> Config {
    let mut env: HashMap<String, String> = HashMap::new();
    env.insert("VECTOR_DB".into(), "memory".into());
    env.insert("SEARCH_DB".into(), "memory".into());
    env.insert("EMBEDDING_DIMENSION".into(), TEST_DIM.to_string());
    env.insert("CHUNK_SIZE".into(), "512".into());
    env.insert("CHUNK_OVERLAP".into(), "50".into());
    env.insert(
        "ENABLE_KNOWLEDGE_GRAPH".into(),
        graph_enabled.to_string(),
    );
    from_env_map(&env).expect("test config is valid")
}

/// A fully wired engine over in-memory stores with concrete handles kept
/// for assertions.
pub struct TestEngine {
    pub manager: Arc<IngestionManager>,
    pub status: Arc<StatusRegistry>,
    pub retriever: Arc<HybridRetriever>,
    pub builder: Arc<IndexBuilder>,
    pub vector: Arc<MemoryVectorStore>,
    pub lexical: Arc<MemoryLexicalStore>,
    pub graph: Option<Arc<MemoryGraphStore>>,
}

pub struct TestEngineOptions {
    pub graph: bool,
    pub extractor: Option<Arc<dyn TripleExtractor>>,
    pub embed_delay: Option<Duration>,
    pub parser: Arc<dyn DocumentParser>,
    pub llm: Arc<dyn Llm>,
}

impl Default for TestEngineOptions {
    fn default() -> Self {
        Self {
            graph: false,
            extractor: None,
            embed_delay: None,
            parser: Arc::new(StubParser),
            llm: Arc::new(StubLlm::new("[]", "not found")),
        }
    }
}

pub fn build_engine(options: TestEngineOptions) -> TestEngine {
    let config = test_config(options.graph);

    let embedder: Arc<dyn Embedder> = match options.embed_delay {
        Some(delay) => Arc::new(HashEmbedder::with_delay(TEST_DIM, delay)),
        None => Arc::new(HashEmbedder::new(TEST_DIM)),
    };
    let vector = Arc::new(MemoryVectorStore::new(TEST_DIM));
    let lexical = Arc::new(MemoryLexicalStore::new());
    let graph = options.graph.then(|| Arc::new(MemoryGraphStore::new()));

    let builder = Arc::new(IndexBuilder::new(
        Arc::clone(&embedder),
        Arc::clone(&vector) as Arc<dyn VectorStore>,
        Arc::clone(&lexical) as Arc<dyn LexicalStore>,
        graph
            .as_ref()
            .map(|g| Arc::clone(g) as Arc<dyn GraphStore>),
        options.extractor,
        config.chunking.clone(),
        ExtractionFormat::Auto,
        Duration::from_secs(5),
    ));

    let status = Arc::new(StatusRegistry::new(Duration::from_secs(3600)));
    let manager = Arc::new(IngestionManager::new(
        options.parser,
        Arc::clone(&builder),
        Arc::clone(&status),
        config,
    ));

    let retriever = Arc::new(HybridRetriever::new(
        embedder,
        Arc::clone(&vector) as Arc<dyn VectorStore>,
        Arc::clone(&lexical) as Arc<dyn LexicalStore>,
        graph
            .as_ref()
            .map(|g| Arc::clone(g) as Arc<dyn GraphStore>),
        options.llm,
    ));

    TestEngine {
        manager,
        status,
        retriever,
        builder,
        vector,
        lexical,
        graph,
    }
}

/// Poll the registry until the run reaches a terminal phase.
pub async fn wait_for_terminal(
    status: &StatusRegistry,
    run_id: &str,
    timeout: Duration,
) -> IngestRun {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(run) = status.get(run_id) {
            if run.phase.is_terminal() {
                return run;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "run {run_id} did not finish within {timeout:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll until the run reports at least `n` completed files.
pub async fn wait_for_files_done(
    status: &StatusRegistry,
    run_id: &str,
    n: usize,
    timeout: Duration,
) -> IngestRun {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(run) = status.get(run_id) {
            if run.files_done >= n || run.phase.is_terminal() {
                return run;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "run {run_id} did not reach {n} files within {timeout:?}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Doc id as the ingestion manager derives it for filesystem sources.
pub fn fs_doc_id(logical_path: &str) -> String {
    format!("local_fs:{logical_path}")
}
