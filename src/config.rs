//! Configuration parsing and validation.
//!
//! Lattice is configured through a flat key-value environment (see the
//! repository README for the full variable list). [`load_config`] is the
//! single entry point: it reads the process environment, applies defaults,
//! and validates the result. Invalid configuration aborts startup with exit
//! code 2.
//!
//! # Key variables
//!
//! | Variable | Meaning | Default |
//! |----------|---------|---------|
//! | `LLM_PROVIDER` / `LLM_MODEL` | answer-synthesis model | `openai` / `gpt-4o-mini` |
//! | `EMBEDDING_KIND` / `EMBEDDING_MODEL` / `EMBEDDING_DIMENSION` | embedding provider | `openai` / `text-embedding-3-small` / `1536` |
//! | `VECTOR_DB` / `VECTOR_DB_CONFIG` | vector store kind + JSON params | `memory` |
//! | `SEARCH_DB` / `SEARCH_DB_CONFIG` | lexical store kind + JSON params | `sqlite` |
//! | `GRAPH_DB` / `GRAPH_DB_CONFIG` / `ENABLE_KNOWLEDGE_GRAPH` | graph store | `memory` / enabled |
//! | `DOCUMENT_PARSER` | `docling` or `cloud` | `docling` |
//! | `KG_EXTRACTOR_TYPE` | `simple`, `schema`, or `dynamic` | `dynamic` |
//! | `SCHEMA_NAME` / `SCHEMAS` | schema selection + custom schema JSON array | `default` |
//! | `CHUNK_SIZE` / `CHUNK_OVERLAP` | chunking (tokens) | `512` / `50` |
//! | `MAX_TRIPLETS_PER_CHUNK` | extractor output cap | `10` |
//! | `*_TIMEOUT_S` | per-operation timeouts | see [`Timeouts`] |

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde_json::Value;

use crate::error::EngineError;
use crate::models::{ExtractionFormat, Schema};

/// Immutable process-wide configuration, built once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub llm: LlmConfig,
    pub embedding: EmbeddingConfig,
    pub vector: StoreConfig,
    pub lexical: StoreConfig,
    pub graph: GraphConfig,
    pub parser: ParserConfig,
    pub kg: KgConfig,
    pub chunking: ChunkingConfig,
    pub timeouts: Timeouts,
    pub server: ServerConfig,
    /// How long terminal run records stay in the status registry.
    pub status_retention: Duration,
    /// SQLite file backing the incremental-sync state tables.
    pub sync_db_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// Provider kind: `openai`, `ollama`, or `gemini`.
    pub provider: String,
    pub model: String,
    /// Override for the provider's API base URL.
    pub base_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    /// Provider kind: `openai`, `ollama`, or `gemini`.
    pub kind: String,
    pub model: String,
    /// Declared vector dimensionality; must match the vector store.
    pub dimension: usize,
    /// Maximum texts per upstream API call; larger batches are split.
    pub batch_size: usize,
    pub base_url: Option<String>,
}

/// Kind + opaque JSON connection params for a pluggable store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub kind: String,
    pub params: Value,
}

#[derive(Debug, Clone)]
pub struct GraphConfig {
    pub kind: String,
    pub params: Value,
    pub enabled: bool,
}

#[derive(Debug, Clone)]
pub struct ParserConfig {
    /// `docling` (in-process) or `cloud`.
    pub kind: String,
    /// Device hint for the local parser: `auto`, `cpu`, or `gpu`.
    pub device: String,
    /// Quality mode for the cloud parser: `fast`, `default`, or `premium`.
    pub quality: String,
    /// Base URL of the cloud parsing service.
    pub cloud_url: Option<String>,
    /// Representation handed to KG extraction.
    pub extraction_format: ExtractionFormat,
    /// Persist `{name}.md` / `{name}.txt` / `{name}.meta.json` after parsing.
    pub save_parsed_output: bool,
    pub parsed_output_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct KgConfig {
    /// Extractor kind: `simple`, `schema`, or `dynamic`.
    pub extractor: String,
    /// Selected schema name (`default`, `sample`, or a custom name).
    pub schema_name: String,
    /// All known schemas: built-ins plus any supplied via `SCHEMAS`.
    pub schemas: Vec<Schema>,
    pub max_triples_per_chunk: usize,
}

impl KgConfig {
    /// Resolve the selected schema.
    pub fn schema(&self) -> Option<&Schema> {
        self.schemas.iter().find(|s| s.name == self.schema_name)
    }
}

#[derive(Debug, Clone)]
pub struct ChunkingConfig {
    /// Target chunk size in tokens.
    pub chunk_size: usize,
    /// Overlap between consecutive chunks in tokens.
    pub chunk_overlap: usize,
}

/// Per-operation timeouts. Parse/embed/graph timeouts fail the file;
/// store timeouts fail the run.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub parse: Duration,
    pub embed: Duration,
    pub store: Duration,
    pub llm: Duration,
    pub connector: Duration,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    /// Scratch directory for `/upload` staging.
    pub upload_dir: PathBuf,
}

/// Load and validate configuration from the process environment.
pub fn load_config() -> Result<Config, EngineError> {
    let env: HashMap<String, String> = std::env::vars().collect();
    from_env_map(&env)
}

/// Build a [`Config`] from an explicit key-value map. Used by tests and by
/// [`load_config`].
pub fn from_env_map(env: &HashMap<String, String>) -> Result<Config, EngineError> {
    let get = |key: &str| env.get(key).map(|s| s.trim().to_string()).filter(|s| !s.is_empty());

    let llm = LlmConfig {
        provider: get("LLM_PROVIDER").unwrap_or_else(|| "openai".to_string()),
        model: get("LLM_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string()),
        base_url: get("LLM_BASE_URL"),
    };

    let embedding = EmbeddingConfig {
        kind: get("EMBEDDING_KIND").unwrap_or_else(|| "openai".to_string()),
        model: get("EMBEDDING_MODEL").unwrap_or_else(|| "text-embedding-3-small".to_string()),
        dimension: parse_number(env, "EMBEDDING_DIMENSION", 1536)?,
        batch_size: parse_number(env, "EMBEDDING_BATCH_SIZE", 64)?,
        base_url: get("EMBEDDING_BASE_URL"),
    };

    let vector = StoreConfig {
        kind: get("VECTOR_DB").unwrap_or_else(|| "memory".to_string()),
        params: parse_json(env, "VECTOR_DB_CONFIG")?,
    };
    let lexical = StoreConfig {
        kind: get("SEARCH_DB").unwrap_or_else(|| "sqlite".to_string()),
        params: parse_json(env, "SEARCH_DB_CONFIG")?,
    };
    let graph = GraphConfig {
        kind: get("GRAPH_DB").unwrap_or_else(|| "memory".to_string()),
        params: parse_json(env, "GRAPH_DB_CONFIG")?,
        enabled: parse_bool(env, "ENABLE_KNOWLEDGE_GRAPH", true)?,
    };

    let extraction_format = match get("EXTRACTION_FORMAT").as_deref() {
        None | Some("auto") => ExtractionFormat::Auto,
        Some("markdown") => ExtractionFormat::Markdown,
        Some("plaintext") | Some("text") => ExtractionFormat::Plaintext,
        Some(other) => {
            return Err(EngineError::Config(format!(
                "Unknown EXTRACTION_FORMAT: '{other}'. Use auto, markdown, or plaintext."
            )))
        }
    };

    let parser = ParserConfig {
        kind: get("DOCUMENT_PARSER").unwrap_or_else(|| "docling".to_string()),
        device: get("PARSER_DEVICE").unwrap_or_else(|| "auto".to_string()),
        quality: get("PARSE_QUALITY").unwrap_or_else(|| "default".to_string()),
        cloud_url: get("CLOUD_PARSER_URL"),
        extraction_format,
        save_parsed_output: parse_bool(env, "SAVE_PARSED_OUTPUT", false)?,
        parsed_output_dir: get("PARSED_OUTPUT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data/parsed")),
    };

    let mut schemas = vec![Schema::default_schema(), Schema::sample_schema()];
    if let Some(raw) = get("SCHEMAS") {
        let custom: Vec<Schema> = serde_json::from_str(&raw)
            .map_err(|e| EngineError::Config(format!("SCHEMAS is not a valid JSON array: {e}")))?;
        schemas.extend(custom);
    }

    let kg = KgConfig {
        extractor: get("KG_EXTRACTOR_TYPE").unwrap_or_else(|| "dynamic".to_string()),
        schema_name: get("SCHEMA_NAME").unwrap_or_else(|| "default".to_string()),
        schemas,
        max_triples_per_chunk: parse_number(env, "MAX_TRIPLETS_PER_CHUNK", 10)?,
    };

    let chunking = ChunkingConfig {
        chunk_size: parse_number(env, "CHUNK_SIZE", 512)?,
        chunk_overlap: parse_number(env, "CHUNK_OVERLAP", 50)?,
    };

    let timeouts = Timeouts {
        parse: Duration::from_secs(parse_number(env, "PARSE_TIMEOUT_S", 300)? as u64),
        embed: Duration::from_secs(parse_number(env, "EMBED_TIMEOUT_S", 60)? as u64),
        store: Duration::from_secs(parse_number(env, "STORE_TIMEOUT_S", 30)? as u64),
        llm: Duration::from_secs(parse_number(env, "LLM_TIMEOUT_S", 60)? as u64),
        connector: Duration::from_secs(parse_number(env, "CONNECTOR_TIMEOUT_S", 60)? as u64),
    };

    let server = ServerConfig {
        bind: get("SERVER_BIND").unwrap_or_else(|| "127.0.0.1:8000".to_string()),
        upload_dir: get("UPLOAD_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data/uploads")),
    };

    let config = Config {
        llm,
        embedding,
        vector,
        lexical,
        graph,
        parser,
        kg,
        chunking,
        timeouts,
        server,
        status_retention: Duration::from_secs(parse_number(env, "STATUS_RETENTION_S", 3600)? as u64),
        sync_db_path: get("SYNC_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data/lattice-sync.sqlite")),
    };

    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<(), EngineError> {
    if config.chunking.chunk_size == 0 {
        return Err(EngineError::Config("CHUNK_SIZE must be > 0".to_string()));
    }
    if config.chunking.chunk_overlap >= config.chunking.chunk_size {
        return Err(EngineError::Config(format!(
            "CHUNK_OVERLAP ({}) must be smaller than CHUNK_SIZE ({})",
            config.chunking.chunk_overlap, config.chunking.chunk_size
        )));
    }
    if config.embedding.dimension == 0 {
        return Err(EngineError::Config(
            "EMBEDDING_DIMENSION must be > 0".to_string(),
        ));
    }
    if config.embedding.batch_size == 0 {
        return Err(EngineError::Config(
            "EMBEDDING_BATCH_SIZE must be > 0".to_string(),
        ));
    }

    match config.llm.provider.as_str() {
        "openai" | "ollama" | "gemini" => {}
        other => {
            return Err(EngineError::Config(format!(
                "Unknown LLM_PROVIDER: '{other}'. Use openai, ollama, or gemini."
            )))
        }
    }
    match config.embedding.kind.as_str() {
        "openai" | "ollama" | "gemini" => {}
        other => {
            return Err(EngineError::Config(format!(
                "Unknown EMBEDDING_KIND: '{other}'. Use openai, ollama, or gemini."
            )))
        }
    }
    match config.parser.kind.as_str() {
        "docling" | "cloud" => {}
        other => {
            return Err(EngineError::Config(format!(
                "Unknown DOCUMENT_PARSER: '{other}'. Use docling or cloud."
            )))
        }
    }
    if config.parser.kind == "cloud" && config.parser.cloud_url.is_none() {
        return Err(EngineError::Config(
            "CLOUD_PARSER_URL is required when DOCUMENT_PARSER=cloud".to_string(),
        ));
    }
    match config.parser.device.as_str() {
        "auto" | "cpu" | "gpu" => {}
        other => {
            return Err(EngineError::Config(format!(
                "Unknown PARSER_DEVICE: '{other}'. Use auto, cpu, or gpu."
            )))
        }
    }
    match config.parser.quality.as_str() {
        "fast" | "default" | "premium" => {}
        other => {
            return Err(EngineError::Config(format!(
                "Unknown PARSE_QUALITY: '{other}'. Use fast, default, or premium."
            )))
        }
    }
    match config.kg.extractor.as_str() {
        "simple" | "schema" | "dynamic" => {}
        other => {
            return Err(EngineError::Config(format!(
                "Unknown KG_EXTRACTOR_TYPE: '{other}'. Use simple, schema, or dynamic."
            )))
        }
    }
    if config.kg.schema().is_none() {
        let known: Vec<&str> = config.kg.schemas.iter().map(|s| s.name.as_str()).collect();
        return Err(EngineError::Config(format!(
            "SCHEMA_NAME '{}' not found. Known schemas: {}",
            config.kg.schema_name,
            known.join(", ")
        )));
    }

    Ok(())
}

fn parse_number(env: &HashMap<String, String>, key: &str, default: usize) -> Result<usize, EngineError> {
    match env.get(key).map(|s| s.trim()).filter(|s| !s.is_empty()) {
        None => Ok(default),
        Some(raw) => raw
            .parse::<usize>()
            .map_err(|_| EngineError::Config(format!("{key} must be a non-negative integer, got '{raw}'"))),
    }
}

fn parse_bool(env: &HashMap<String, String>, key: &str, default: bool) -> Result<bool, EngineError> {
    match env.get(key).map(|s| s.trim().to_lowercase()) {
        None => Ok(default),
        Some(raw) if raw.is_empty() => Ok(default),
        Some(raw) => match raw.as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            _ => Err(EngineError::Config(format!(
                "{key} must be true or false, got '{raw}'"
            ))),
        },
    }
}

fn parse_json(env: &HashMap<String, String>, key: &str) -> Result<Value, EngineError> {
    match env.get(key).map(|s| s.trim()).filter(|s| !s.is_empty()) {
        None => Ok(Value::Object(serde_json::Map::new())),
        Some(raw) => serde_json::from_str(raw)
            .map_err(|e| EngineError::Config(format!("{key} is not valid JSON: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_are_valid() {
        let config = from_env_map(&env(&[])).unwrap();
        assert_eq!(config.llm.provider, "openai");
        assert_eq!(config.embedding.dimension, 1536);
        assert_eq!(config.vector.kind, "memory");
        assert_eq!(config.lexical.kind, "sqlite");
        assert!(config.graph.enabled);
        assert_eq!(config.chunking.chunk_size, 512);
        assert_eq!(config.kg.schema().unwrap().name, "default");
    }

    #[test]
    fn invalid_chunk_overlap_rejected() {
        let err = from_env_map(&env(&[("CHUNK_SIZE", "100"), ("CHUNK_OVERLAP", "100")]))
            .unwrap_err();
        assert_eq!(err.kind(), "ConfigError");
    }

    #[test]
    fn unknown_provider_rejected() {
        let err = from_env_map(&env(&[("LLM_PROVIDER", "watson")])).unwrap_err();
        assert!(err.to_string().contains("watson"));
    }

    #[test]
    fn custom_schemas_are_merged_and_selectable() {
        let schemas = r#"[{"name":"legal","entity_types":["CASE"],"relation_types":["CITES"],"strict":false,"max_triples_per_chunk":5}]"#;
        let config = from_env_map(&env(&[("SCHEMAS", schemas), ("SCHEMA_NAME", "legal")])).unwrap();
        assert_eq!(config.kg.schema().unwrap().max_triples_per_chunk, 5);
    }

    #[test]
    fn unknown_schema_name_lists_known_schemas() {
        let err = from_env_map(&env(&[("SCHEMA_NAME", "nope")])).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("default"));
        assert!(msg.contains("sample"));
    }

    #[test]
    fn store_config_json_parsed() {
        let config = from_env_map(&env(&[
            ("VECTOR_DB", "sqlite"),
            ("VECTOR_DB_CONFIG", r#"{"path":"/tmp/x.sqlite"}"#),
        ]))
        .unwrap();
        assert_eq!(config.vector.params["path"], "/tmp/x.sqlite");
    }

    #[test]
    fn malformed_json_config_rejected() {
        let err = from_env_map(&env(&[("VECTOR_DB_CONFIG", "{not json")])).unwrap_err();
        assert_eq!(err.kind(), "ConfigError");
    }

    #[test]
    fn cloud_parser_requires_url() {
        let err = from_env_map(&env(&[("DOCUMENT_PARSER", "cloud")])).unwrap_err();
        assert!(err.to_string().contains("CLOUD_PARSER_URL"));
    }
}
