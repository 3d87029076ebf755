//! Knowledge-graph triple extraction.
//!
//! Converts chunk text into typed `(subject, predicate, object)` triples by
//! prompting the configured LLM for a JSON array. Three variants share one
//! implementation:
//!
//! | Kind | Schema use |
//! |------|-----------|
//! | `simple` | none — the model picks its own types |
//! | `dynamic` | schema vocabulary guides the prompt, advisory only |
//! | `schema` | schema validates output; `strict` schemas discard violations |
//!
//! Output is deduplicated within the chunk and capped at
//! `max_triples_per_chunk`.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

use crate::error::EngineError;
use crate::llm::{CompleteOptions, Llm};
use crate::models::{Schema, Triple};

/// Extracts typed triples from one chunk of text.
#[async_trait]
pub trait TripleExtractor: Send + Sync {
    fn name(&self) -> &str;

    async fn extract(&self, chunk_text: &str) -> Result<Vec<Triple>, EngineError>;
}

/// How the schema participates in extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractorMode {
    Simple,
    Dynamic,
    Schema,
}

impl ExtractorMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Simple => "simple",
            Self::Dynamic => "dynamic",
            Self::Schema => "schema",
        }
    }
}

const EXTRACTION_SYSTEM: &str = "You extract knowledge graph triples from text. \
Respond with a JSON array only, no prose. Each element is an object with keys \
\"subject\", \"subject_type\", \"predicate\", \"object\", \"object_type\". \
Use concise entity labels exactly as they appear in the text and UPPER_SNAKE \
predicates.";

/// LLM-backed extractor implementing all three variants.
pub struct LlmTripleExtractor {
    llm: Arc<dyn Llm>,
    mode: ExtractorMode,
    schema: Option<Schema>,
    max_triples: usize,
}

impl LlmTripleExtractor {
    pub fn new(
        llm: Arc<dyn Llm>,
        mode: ExtractorMode,
        schema: Option<Schema>,
        max_triples: usize,
    ) -> Self {
        Self {
            llm,
            mode,
            schema,
            max_triples,
        }
    }

    fn prompt(&self, chunk_text: &str) -> String {
        let mut prompt = String::new();
        if self.mode != ExtractorMode::Simple {
            if let Some(schema) = &self.schema {
                prompt.push_str(&format!(
                    "Entity types: {}.\nRelation types: {}.\n",
                    schema.entity_types.join(", "),
                    schema.relation_types.join(", ")
                ));
                if self.mode == ExtractorMode::Schema && !schema.validation_pairs.is_empty() {
                    prompt.push_str("Allowed (subject_type, predicate, object_type) combinations:\n");
                    for (s, p, o) in &schema.validation_pairs {
                        prompt.push_str(&format!("- ({s}, {p}, {o})\n"));
                    }
                }
            }
        }
        prompt.push_str(&format!(
            "Extract at most {} triples from the following text.\n\nText:\n{}",
            self.max_triples, chunk_text
        ));
        prompt
    }
}

#[async_trait]
impl TripleExtractor for LlmTripleExtractor {
    fn name(&self) -> &str {
        self.mode.as_str()
    }

    async fn extract(&self, chunk_text: &str) -> Result<Vec<Triple>, EngineError> {
        if chunk_text.trim().is_empty() {
            return Ok(Vec::new());
        }

        let options = CompleteOptions {
            system: Some(EXTRACTION_SYSTEM.to_string()),
            temperature: Some(0.0),
            max_tokens: None,
        };
        let response = self
            .llm
            .complete(&self.prompt(chunk_text), &options)
            .await
            .map_err(|e| EngineError::KgExtraction(e.to_string()))?;

        let mut triples = parse_triples_json(&response)?;

        // Within-chunk dedup, preserving first occurrence.
        let mut seen = HashSet::new();
        triples.retain(|t| seen.insert(t.dedup_key()));

        // Strict schemas reject non-conforming triples; advisory schemas
        // (dynamic mode) keep them.
        if self.mode == ExtractorMode::Schema {
            if let Some(schema) = &self.schema {
                if schema.strict {
                    let before = triples.len();
                    triples.retain(|t| schema.allows(t));
                    if triples.len() < before {
                        debug!(
                            dropped = before - triples.len(),
                            schema = %schema.name,
                            "strict schema discarded triples"
                        );
                    }
                }
            }
        }

        triples.truncate(self.max_triples);
        Ok(triples)
    }
}

/// Parse the model's response into triples. Tolerates code fences and prose
/// around the array by slicing from the first `[` to the last `]`.
fn parse_triples_json(response: &str) -> Result<Vec<Triple>, EngineError> {
    let start = response.find('[');
    let end = response.rfind(']');
    let (Some(start), Some(end)) = (start, end) else {
        return Err(EngineError::KgExtraction(
            "response contains no JSON array".to_string(),
        ));
    };
    if end < start {
        return Err(EngineError::KgExtraction(
            "malformed JSON array in response".to_string(),
        ));
    }

    let value: Value = serde_json::from_str(&response[start..=end])
        .map_err(|e| EngineError::KgExtraction(format!("invalid JSON: {e}")))?;
    let items = value
        .as_array()
        .ok_or_else(|| EngineError::KgExtraction("expected a JSON array".to_string()))?;

    let mut triples = Vec::with_capacity(items.len());
    for item in items {
        let get = |key: &str| item[key].as_str().unwrap_or_default().trim().to_string();
        let triple = Triple {
            subject_label: get("subject"),
            subject_type: get("subject_type").to_uppercase(),
            predicate: get("predicate").to_uppercase().replace(' ', "_"),
            object_label: get("object"),
            object_type: get("object_type").to_uppercase(),
        };
        if triple.subject_label.is_empty()
            || triple.predicate.is_empty()
            || triple.object_label.is_empty()
        {
            continue;
        }
        triples.push(triple);
    }
    Ok(triples)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CannedLlm(String);

    #[async_trait]
    impl Llm for CannedLlm {
        fn name(&self) -> &str {
            "canned"
        }

        async fn complete(
            &self,
            _prompt: &str,
            _options: &CompleteOptions,
        ) -> Result<String, EngineError> {
            Ok(self.0.clone())
        }

        async fn stream_complete(&self, _prompt: &str) -> Result<crate::llm::TokenStream, EngineError> {
            Ok(Box::pin(futures::stream::iter(vec![Ok(self.0.clone())])))
        }
    }

    const ALICE_JSON: &str = r#"[
        {"subject":"Alice","subject_type":"PERSON","predicate":"WORKS_AT","object":"Acme","object_type":"ORGANIZATION"},
        {"subject":"Acme","subject_type":"ORGANIZATION","predicate":"BASED_IN","object":"Paris","object_type":"LOCATION"},
        {"subject":"Alice","subject_type":"PERSON","predicate":"WORKS_AT","object":"Acme","object_type":"ORGANIZATION"}
    ]"#;

    #[tokio::test]
    async fn extracts_and_dedups_triples() {
        let extractor = LlmTripleExtractor::new(
            Arc::new(CannedLlm(ALICE_JSON.to_string())),
            ExtractorMode::Dynamic,
            Some(Schema::default_schema()),
            10,
        );
        let triples = extractor
            .extract("Alice works at Acme. Acme is based in Paris.")
            .await
            .unwrap();
        assert_eq!(triples.len(), 2);
        assert_eq!(triples[0].predicate, "WORKS_AT");
    }

    #[tokio::test]
    async fn strict_schema_discards_violations() {
        let bad = r#"[
            {"subject":"Alice","subject_type":"PERSON","predicate":"WORKS_AT","object":"Acme","object_type":"ORGANIZATION"},
            {"subject":"Paris","subject_type":"LOCATION","predicate":"WORKS_AT","object":"Acme","object_type":"ORGANIZATION"}
        ]"#;
        let extractor = LlmTripleExtractor::new(
            Arc::new(CannedLlm(bad.to_string())),
            ExtractorMode::Schema,
            Some(Schema::sample_schema()),
            10,
        );
        let triples = extractor.extract("text").await.unwrap();
        assert_eq!(triples.len(), 1);
        assert_eq!(triples[0].subject_label, "Alice");
    }

    #[tokio::test]
    async fn max_triples_is_enforced() {
        let extractor = LlmTripleExtractor::new(
            Arc::new(CannedLlm(ALICE_JSON.to_string())),
            ExtractorMode::Simple,
            None,
            1,
        );
        let triples = extractor.extract("text").await.unwrap();
        assert_eq!(triples.len(), 1);
    }

    #[tokio::test]
    async fn code_fenced_json_is_accepted() {
        let fenced = format!("Here are the triples:\n```json\n{ALICE_JSON}\n```");
        let extractor = LlmTripleExtractor::new(
            Arc::new(CannedLlm(fenced)),
            ExtractorMode::Simple,
            None,
            10,
        );
        assert_eq!(extractor.extract("text").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn prose_response_is_an_extraction_error() {
        let extractor = LlmTripleExtractor::new(
            Arc::new(CannedLlm("I could not find any triples.".to_string())),
            ExtractorMode::Simple,
            None,
            10,
        );
        let err = extractor.extract("text").await.unwrap_err();
        assert_eq!(err.kind(), "KGExtractionError");
    }

    #[tokio::test]
    async fn empty_chunk_yields_no_triples_without_llm_call() {
        let extractor = LlmTripleExtractor::new(
            Arc::new(CannedLlm("ignored".to_string())),
            ExtractorMode::Simple,
            None,
            10,
        );
        assert!(extractor.extract("   ").await.unwrap().is_empty());
    }
}
