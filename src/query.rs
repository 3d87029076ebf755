//! Query engine: retrieval-augmented answer synthesis.
//!
//! Runs the hybrid retriever, serializes the retrieved nodes into a
//! context block, and prompts the LLM under a fixed system instruction:
//! answer only from context, cite chunk ids, say "not found" when the
//! context is insufficient.
//!
//! The completion is consumed as a token stream under `llm_timeout_s`; on
//! timeout the partial answer accumulated so far is returned with a
//! truncation flag instead of an error.
//!
//! Citations are the chunk ids actually referenced by the answer (found by
//! scanning for id tokens), falling back to the full retrieved set when the
//! model cited nothing explicitly.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;

use crate::error::EngineError;
use crate::llm::Llm;
use crate::models::{RankedNode, RetrievalMode};
use crate::retrieve::HybridRetriever;

const ANSWER_SYSTEM: &str = "Answer the question using ONLY the provided context. \
Cite the chunk ids (in square brackets) of every chunk you draw on. \
If the context is insufficient to answer, reply exactly: not found";

/// Answer plus provenance.
#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub answer: String,
    pub citations: Vec<String>,
    /// The LLM timed out and `answer` holds the partial output.
    pub truncated: bool,
    /// Retrieval produced no context nodes.
    pub no_results: bool,
}

pub struct QueryEngine {
    retriever: Arc<HybridRetriever>,
    llm: Arc<dyn Llm>,
    llm_timeout: Duration,
}

impl QueryEngine {
    pub fn new(retriever: Arc<HybridRetriever>, llm: Arc<dyn Llm>, llm_timeout: Duration) -> Self {
        Self {
            retriever,
            llm,
            llm_timeout,
        }
    }

    /// Retrieve context and synthesize an answer with citations.
    pub async fn answer(
        &self,
        query: &str,
        top_k: usize,
        modes: &[RetrievalMode],
    ) -> Result<Answer, EngineError> {
        let nodes = self.retriever.retrieve(query, top_k, modes).await?;
        let no_results = nodes.is_empty();

        let prompt = build_prompt(query, &nodes);
        let (answer, truncated) = self.complete_with_timeout(&prompt).await?;

        let citations = extract_citations(&answer, &nodes);
        Ok(Answer {
            answer,
            citations,
            truncated,
            no_results,
        })
    }

    /// Stream the completion, cutting it off at the timeout with whatever
    /// tokens have arrived.
    async fn complete_with_timeout(&self, prompt: &str) -> Result<(String, bool), EngineError> {
        let full_prompt = format!("{ANSWER_SYSTEM}\n\n{prompt}");
        let mut stream = self.llm.stream_complete(&full_prompt).await?;

        let mut answer = String::new();
        let deadline = tokio::time::Instant::now() + self.llm_timeout;
        loop {
            match tokio::time::timeout_at(deadline, stream.next()).await {
                Err(_) => return Ok((answer, true)),
                Ok(None) => return Ok((answer, false)),
                Ok(Some(Ok(token))) => answer.push_str(&token),
                Ok(Some(Err(e))) => {
                    // Keep a partial answer if the stream dies midway.
                    if answer.is_empty() {
                        return Err(e);
                    }
                    return Ok((answer, true));
                }
            }
        }
    }
}

/// Serialize context nodes and the user question into the prompt body.
fn build_prompt(query: &str, nodes: &[RankedNode]) -> String {
    let mut prompt = String::from("Context:\n");
    if nodes.is_empty() {
        prompt.push_str("(no context found)\n");
    }
    for node in nodes {
        prompt.push_str(&format!(
            "[{}] (from {})\n{}\n\n",
            node.chunk_id, node.display_name, node.text
        ));
    }
    prompt.push_str(&format!("Question: {query}"));
    prompt
}

/// Chunk ids referenced by the answer, in first-mention order; the full
/// retrieved set when the answer cites nothing.
fn extract_citations(answer: &str, nodes: &[RankedNode]) -> Vec<String> {
    let mut cited: Vec<(usize, String)> = nodes
        .iter()
        .filter_map(|node| {
            answer
                .find(node.chunk_id.as_str())
                .map(|pos| (pos, node.chunk_id.clone()))
        })
        .collect();
    cited.sort_by_key(|(pos, _)| *pos);

    if cited.is_empty() {
        nodes.iter().map(|n| n.chunk_id.clone()).collect()
    } else {
        cited.into_iter().map(|(_, id)| id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn node(chunk_id: &str) -> RankedNode {
        RankedNode {
            chunk_id: chunk_id.to_string(),
            text: "text".to_string(),
            fused_score: 1.0,
            per_modality_scores: BTreeMap::new(),
            doc_id: "d1".to_string(),
            display_name: "doc.txt".to_string(),
            logical_path: "doc.txt".to_string(),
        }
    }

    #[test]
    fn prompt_contains_ids_names_and_question() {
        let prompt = build_prompt("who built it?", &[node("chunk-abc")]);
        assert!(prompt.contains("[chunk-abc]"));
        assert!(prompt.contains("doc.txt"));
        assert!(prompt.ends_with("Question: who built it?"));
    }

    #[test]
    fn citations_follow_mention_order() {
        let nodes = vec![node("aaa111"), node("bbb222"), node("ccc333")];
        let answer = "Based on [bbb222] and later [aaa111], the answer is yes.";
        assert_eq!(
            extract_citations(answer, &nodes),
            vec!["bbb222".to_string(), "aaa111".to_string()]
        );
    }

    #[test]
    fn citations_fall_back_to_all_nodes() {
        let nodes = vec![node("aaa111"), node("bbb222")];
        assert_eq!(
            extract_citations("No explicit citations here.", &nodes),
            vec!["aaa111".to_string(), "bbb222".to_string()]
        );
    }

    #[test]
    fn empty_context_has_empty_fallback() {
        assert!(extract_citations("not found", &[]).is_empty());
    }
}
