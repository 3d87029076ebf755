//! Embedding provider abstraction and implementations.
//!
//! Defines the [`Embedder`] trait and concrete implementations:
//! - **[`OpenAiEmbedder`]** — OpenAI `/v1/embeddings` with batching and backoff.
//! - **[`OllamaEmbedder`]** — local Ollama `/api/embed`.
//! - **[`GeminiEmbedder`]** — Google Gemini `batchEmbedContents`.
//!
//! Every embedder declares its vector dimensionality up front; the factory
//! checks it against the vector store before any document is touched.
//! Callers may submit batches of any size — [`Embedder::embed_batch`]
//! sub-batches internally to the provider's per-request limit.
//!
//! Also provides vector utilities shared by the stores:
//! - [`cosine_similarity`] — similarity between two embedding vectors
//! - [`vec_to_blob`] / [`blob_to_vec`] — little-endian f32 codec for BLOB
//!   storage

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::EmbeddingConfig;
use crate::error::EngineError;
use crate::llm::post_json_with_retry;

/// A batch text-embedding model with a declared dimensionality.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;

    /// Vector dimensionality every returned embedding must have.
    fn dimension(&self) -> usize;

    /// Embed a batch of texts, one vector per input, in input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EngineError>;

    /// Embed a single query text.
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, EngineError> {
        let mut result = self.embed_batch(&[text.to_string()]).await?;
        result
            .pop()
            .ok_or_else(|| EngineError::Embedding("empty embedding response".into()))
    }
}

/// Check a provider response batch against the declared dimension.
fn check_dimensions(vectors: &[Vec<f32>], dimension: usize) -> Result<(), EngineError> {
    for v in vectors {
        if v.len() != dimension {
            return Err(EngineError::Embedding(format!(
                "provider returned a {}-dimension vector, expected {}",
                v.len(),
                dimension
            )));
        }
    }
    Ok(())
}

fn parse_f32_array(value: &Value) -> Option<Vec<f32>> {
    value
        .as_array()
        .map(|arr| arr.iter().map(|v| v.as_f64().unwrap_or(0.0) as f32).collect())
}

// ═══════════════════════════════════════════════════════════════════════
// OpenAI
// ═══════════════════════════════════════════════════════════════════════

/// Embedding provider using the OpenAI API. Requires `OPENAI_API_KEY`.
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    model: String,
    dimension: usize,
    batch_size: usize,
    base_url: String,
    api_key: String,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingConfig, timeout: Duration) -> Result<Self, EngineError> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| EngineError::Auth("OPENAI_API_KEY environment variable not set".into()))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::ProviderUnavailable(e.to_string()))?;
        Ok(Self {
            client,
            model: config.model.clone(),
            dimension: config.dimension,
            batch_size: config.batch_size,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            api_key,
        })
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EngineError> {
        let url = format!("{}/embeddings", self.base_url);
        let headers = vec![(
            "Authorization".to_string(),
            format!("Bearer {}", self.api_key),
        )];

        let mut vectors = Vec::with_capacity(texts.len());
        for sub in texts.chunks(self.batch_size) {
            let body = json!({ "model": self.model, "input": sub });
            let resp = post_json_with_retry(&self.client, &url, &headers, &body, &self.model)
                .await
                .map_err(wrap_embedding_error)?;

            let data = resp["data"]
                .as_array()
                .ok_or_else(|| EngineError::Embedding("response missing data array".into()))?;
            for item in data {
                let vec = parse_f32_array(&item["embedding"])
                    .ok_or_else(|| EngineError::Embedding("response missing embedding".into()))?;
                vectors.push(vec);
            }
        }

        check_dimensions(&vectors, self.dimension)?;
        Ok(vectors)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Ollama
// ═══════════════════════════════════════════════════════════════════════

/// Embedding provider using a local Ollama server.
pub struct OllamaEmbedder {
    client: reqwest::Client,
    model: String,
    dimension: usize,
    batch_size: usize,
    base_url: String,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig, timeout: Duration) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::ProviderUnavailable(e.to_string()))?;
        Ok(Self {
            client,
            model: config.model.clone(),
            dimension: config.dimension,
            batch_size: config.batch_size,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".to_string()),
        })
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EngineError> {
        let url = format!("{}/api/embed", self.base_url);

        let mut vectors = Vec::with_capacity(texts.len());
        for sub in texts.chunks(self.batch_size) {
            let body = json!({ "model": self.model, "input": sub });
            let resp = post_json_with_retry(&self.client, &url, &[], &body, &self.model)
                .await
                .map_err(wrap_embedding_error)?;

            let data = resp["embeddings"]
                .as_array()
                .ok_or_else(|| EngineError::Embedding("response missing embeddings array".into()))?;
            for item in data {
                let vec = parse_f32_array(item)
                    .ok_or_else(|| EngineError::Embedding("malformed embedding entry".into()))?;
                vectors.push(vec);
            }
        }

        check_dimensions(&vectors, self.dimension)?;
        Ok(vectors)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Gemini
// ═══════════════════════════════════════════════════════════════════════

/// Embedding provider using the Gemini API. Requires `GEMINI_API_KEY`.
///
/// Gemini embedders share the provider's async client family with the
/// Gemini LLM; the factory enforces that pairing at startup.
pub struct GeminiEmbedder {
    client: reqwest::Client,
    model: String,
    dimension: usize,
    batch_size: usize,
    base_url: String,
    api_key: String,
}

impl GeminiEmbedder {
    pub fn new(config: &EmbeddingConfig, timeout: Duration) -> Result<Self, EngineError> {
        let api_key = std::env::var("GEMINI_API_KEY")
            .map_err(|_| EngineError::Auth("GEMINI_API_KEY environment variable not set".into()))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::ProviderUnavailable(e.to_string()))?;
        Ok(Self {
            client,
            model: config.model.clone(),
            dimension: config.dimension,
            batch_size: config.batch_size,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| "https://generativelanguage.googleapis.com/v1beta".to_string()),
            api_key,
        })
    }
}

#[async_trait]
impl Embedder for GeminiEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EngineError> {
        let url = format!(
            "{}/models/{}:batchEmbedContents?key={}",
            self.base_url, self.model, self.api_key
        );

        let mut vectors = Vec::with_capacity(texts.len());
        for sub in texts.chunks(self.batch_size) {
            let requests: Vec<Value> = sub
                .iter()
                .map(|t| {
                    json!({
                        "model": format!("models/{}", self.model),
                        "content": {"parts": [{"text": t}]},
                    })
                })
                .collect();
            let body = json!({ "requests": requests });
            let resp = post_json_with_retry(&self.client, &url, &[], &body, &self.model)
                .await
                .map_err(wrap_embedding_error)?;

            let data = resp["embeddings"]
                .as_array()
                .ok_or_else(|| EngineError::Embedding("response missing embeddings array".into()))?;
            for item in data {
                let vec = parse_f32_array(&item["values"])
                    .ok_or_else(|| EngineError::Embedding("malformed embedding entry".into()))?;
                vectors.push(vec);
            }
        }

        check_dimensions(&vectors, self.dimension)?;
        Ok(vectors)
    }
}

/// Keep auth/provider failures as-is; everything else becomes EmbeddingError.
fn wrap_embedding_error(err: EngineError) -> EngineError {
    match err {
        EngineError::Auth(_) | EngineError::ProviderUnavailable(_) | EngineError::ModelNotFound(_) => {
            err
        }
        other => EngineError::Embedding(other.to_string()),
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Vector utilities
// ═══════════════════════════════════════════════════════════════════════

/// Encode a float vector as a BLOB (little-endian f32 bytes).
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1, 1]`; `0.0` for empty or mismatched vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}
