//! Factory layer: configuration → live collaborator instances.
//!
//! The only place that knows provider-specific field names. Each `make_*`
//! function maps a kind string onto a constructor; unknown kinds fail with a
//! `ConfigError` naming the supported set.
//!
//! Compatibility rules enforced here:
//! 1. The embedder's declared dimension must equal the vector store's
//!    dimension — a mismatch aborts startup with `DimensionMismatch` and
//!    remediation text, before any store is written.
//! 2. Providers that cannot host the schema-validating extractor (ollama)
//!    get the dynamic extractor substituted transparently, with a log line.
//! 3. Gemini embedders require a Gemini LLM (shared async client family);
//!    the mismatch is a `ConfigError` at startup.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::warn;

use crate::config::Config;
use crate::db;
use crate::embedding::{Embedder, GeminiEmbedder, OllamaEmbedder, OpenAiEmbedder};
use crate::error::EngineError;
use crate::extractor::{ExtractorMode, LlmTripleExtractor, TripleExtractor};
use crate::llm::{GeminiLlm, Llm, OllamaLlm, OpenAiLlm};
use crate::parser::{CloudParser, DocumentParser, LocalParser};
use crate::store::memory::{MemoryGraphStore, MemoryLexicalStore, MemoryVectorStore};
use crate::store::sqlite::{SqliteLexicalStore, SqliteVectorStore};
use crate::store::{GraphStore, LexicalStore, VectorStore};

/// Cross-provider rules that do not depend on any single component.
pub fn check_compatibility(config: &Config) -> Result<(), EngineError> {
    if config.embedding.kind == "gemini" && config.llm.provider != "gemini" {
        return Err(EngineError::Config(format!(
            "EMBEDDING_KIND=gemini requires LLM_PROVIDER=gemini (shared client), got '{}'",
            config.llm.provider
        )));
    }
    Ok(())
}

/// Construct the configured document parser adapter.
pub fn make_parser(config: &Config) -> Result<Arc<dyn DocumentParser>, EngineError> {
    match config.parser.kind.as_str() {
        "docling" => Ok(Arc::new(LocalParser::new(
            &config.parser,
            config.timeouts.parse,
        ))),
        "cloud" => Ok(Arc::new(CloudParser::new(
            &config.parser,
            config.timeouts.parse,
        )?)),
        other => Err(EngineError::Config(format!(
            "Unknown DOCUMENT_PARSER: '{other}'. Supported: docling, cloud."
        ))),
    }
}

/// Construct the configured LLM client.
pub fn make_llm(config: &Config) -> Result<Arc<dyn Llm>, EngineError> {
    let timeout = config.timeouts.llm;
    match config.llm.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAiLlm::new(&config.llm, timeout)?)),
        "ollama" => Ok(Arc::new(OllamaLlm::new(&config.llm, timeout)?)),
        "gemini" => Ok(Arc::new(GeminiLlm::new(&config.llm, timeout)?)),
        other => Err(EngineError::Config(format!(
            "Unknown LLM_PROVIDER: '{other}'. Supported: openai, ollama, gemini."
        ))),
    }
}

/// Construct the configured embedding client.
pub fn make_embedder(config: &Config) -> Result<Arc<dyn Embedder>, EngineError> {
    let timeout = config.timeouts.embed;
    match config.embedding.kind.as_str() {
        "openai" => Ok(Arc::new(OpenAiEmbedder::new(&config.embedding, timeout)?)),
        "ollama" => Ok(Arc::new(OllamaEmbedder::new(&config.embedding, timeout)?)),
        "gemini" => Ok(Arc::new(GeminiEmbedder::new(&config.embedding, timeout)?)),
        other => Err(EngineError::Config(format!(
            "Unknown EMBEDDING_KIND: '{other}'. Supported: openai, ollama, gemini."
        ))),
    }
}

fn params_path(params: &serde_json::Value, default: &str) -> PathBuf {
    params["path"]
        .as_str()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(default))
}

/// Construct the vector store and verify its dimension against `dim`
/// (the embedder's declared dimensionality).
pub async fn make_vector_store(config: &Config, dim: usize) -> Result<Arc<dyn VectorStore>, EngineError> {
    let store: Arc<dyn VectorStore> = match config.vector.kind.as_str() {
        "memory" => Arc::new(MemoryVectorStore::new(dim)),
        "sqlite" => {
            let path = params_path(&config.vector.params, "./data/lattice-vector.sqlite");
            let pool = db::connect(&path).await?;
            Arc::new(SqliteVectorStore::open(pool, dim).await?)
        }
        other => {
            return Err(EngineError::Config(format!(
                "Unknown VECTOR_DB: '{other}'. Built-in kinds: memory, sqlite."
            )))
        }
    };

    if store.dimension() != dim {
        return Err(EngineError::DimensionMismatch {
            embedder: dim,
            store: store.dimension(),
        });
    }
    Ok(store)
}

/// Construct the lexical store.
pub async fn make_lexical_store(config: &Config) -> Result<Arc<dyn LexicalStore>, EngineError> {
    match config.lexical.kind.as_str() {
        "memory" => Ok(Arc::new(MemoryLexicalStore::new())),
        "sqlite" => {
            let path = params_path(&config.lexical.params, "./data/lattice-lexical.sqlite");
            let pool = db::connect(&path).await?;
            Ok(Arc::new(SqliteLexicalStore::open(pool).await?))
        }
        other => Err(EngineError::Config(format!(
            "Unknown SEARCH_DB: '{other}'. Built-in kinds: memory, sqlite."
        ))),
    }
}

/// Construct the graph store, or `None` when the graph phase is disabled.
pub async fn make_graph_store(config: &Config) -> Result<Option<Arc<dyn GraphStore>>, EngineError> {
    if !config.graph.enabled {
        return Ok(None);
    }
    match config.graph.kind.as_str() {
        "memory" => Ok(Some(Arc::new(MemoryGraphStore::new()))),
        other => Err(EngineError::Config(format!(
            "Unknown GRAPH_DB: '{other}'. Built-in kinds: memory."
        ))),
    }
}

/// Providers whose APIs cannot host the schema-validating extractor.
fn supports_schema_extractor(provider: &str) -> bool {
    provider != "ollama"
}

/// Construct the KG extractor, applying the provider substitution rule.
pub fn make_kg_extractor(
    config: &Config,
    llm: Arc<dyn Llm>,
) -> Result<Arc<dyn TripleExtractor>, EngineError> {
    let mut mode = match config.kg.extractor.as_str() {
        "simple" => ExtractorMode::Simple,
        "schema" => ExtractorMode::Schema,
        "dynamic" => ExtractorMode::Dynamic,
        other => {
            return Err(EngineError::Config(format!(
                "Unknown KG_EXTRACTOR_TYPE: '{other}'. Supported: simple, schema, dynamic."
            )))
        }
    };

    if mode == ExtractorMode::Schema && !supports_schema_extractor(&config.llm.provider) {
        warn!(
            provider = %config.llm.provider,
            "provider cannot host the schema-validating extractor; substituting dynamic"
        );
        mode = ExtractorMode::Dynamic;
    }

    let schema = if mode == ExtractorMode::Simple {
        None
    } else {
        config.kg.schema().cloned()
    };

    Ok(Arc::new(LlmTripleExtractor::new(
        llm,
        mode,
        schema,
        config.kg.max_triples_per_chunk,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::from_env_map;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> Config {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        from_env_map(&map).unwrap()
    }

    #[tokio::test]
    async fn memory_vector_store_matches_embedder_dimension() {
        let cfg = config(&[("VECTOR_DB", "memory"), ("EMBEDDING_DIMENSION", "384")]);
        let store = make_vector_store(&cfg, 384).await.unwrap();
        assert_eq!(store.dimension(), 384);
    }

    #[tokio::test]
    async fn unknown_store_kind_is_a_config_error() {
        let cfg = config(&[("VECTOR_DB", "milvus")]);
        let err = match make_vector_store(&cfg, 384).await {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };
        assert_eq!(err.kind(), "ConfigError");
        assert!(err.to_string().contains("memory"));
    }

    #[tokio::test]
    async fn sqlite_store_with_other_dimension_raises_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vec.sqlite");
        let json = format!(r#"{{"path":"{}"}}"#, path.display());

        let cfg = config(&[("VECTOR_DB", "sqlite"), ("VECTOR_DB_CONFIG", json.as_str())]);
        // First open seeds the index at 1536.
        make_vector_store(&cfg, 1536).await.unwrap();
        // Second open with a 384-dim embedder must fail before any write.
        let err = match make_vector_store(&cfg, 384).await {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };
        assert_eq!(err.kind(), "DimensionMismatch");
        assert!(err.to_string().contains("dimension"));
    }

    #[tokio::test]
    async fn graph_store_absent_when_disabled() {
        let cfg = config(&[("ENABLE_KNOWLEDGE_GRAPH", "false")]);
        assert!(make_graph_store(&cfg).await.unwrap().is_none());

        let cfg = config(&[("ENABLE_KNOWLEDGE_GRAPH", "true")]);
        assert!(make_graph_store(&cfg).await.unwrap().is_some());
    }

    #[test]
    fn gemini_embedder_requires_gemini_llm() {
        let cfg = config(&[("EMBEDDING_KIND", "gemini"), ("LLM_PROVIDER", "openai")]);
        let err = check_compatibility(&cfg).unwrap_err();
        assert_eq!(err.kind(), "ConfigError");

        let cfg = config(&[("EMBEDDING_KIND", "gemini"), ("LLM_PROVIDER", "gemini")]);
        assert!(check_compatibility(&cfg).is_ok());
    }

    #[tokio::test]
    async fn schema_extractor_substituted_on_ollama() {
        use crate::llm::CompleteOptions;

        struct NullLlm;
        #[async_trait::async_trait]
        impl Llm for NullLlm {
            fn name(&self) -> &str {
                "null"
            }
            async fn complete(
                &self,
                _prompt: &str,
                _options: &CompleteOptions,
            ) -> Result<String, EngineError> {
                Ok("[]".to_string())
            }
            async fn stream_complete(
                &self,
                _prompt: &str,
            ) -> Result<crate::llm::TokenStream, EngineError> {
                Ok(Box::pin(futures::stream::empty()))
            }
        }

        let cfg = config(&[("LLM_PROVIDER", "ollama"), ("KG_EXTRACTOR_TYPE", "schema")]);
        let extractor = make_kg_extractor(&cfg, Arc::new(NullLlm)).unwrap();
        assert_eq!(extractor.name(), "dynamic");

        let cfg = config(&[("LLM_PROVIDER", "openai"), ("KG_EXTRACTOR_TYPE", "schema")]);
        let extractor = make_kg_extractor(&cfg, Arc::new(NullLlm)).unwrap();
        assert_eq!(extractor.name(), "schema");
    }
}
