//! End-to-end ingestion and retrieval scenarios over in-memory stores.

mod common;

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use lattice::ingest::IngestOptions;
use lattice::models::{IngestPhase, RetrievalMode, SourceSpec};
use lattice::query::QueryEngine;
use lattice::store::{GraphStore, LexicalStore};

fn fs_spec(dir: &std::path::Path) -> SourceSpec {
    SourceSpec::LocalFs {
        paths: vec![dir.to_path_buf()],
        include_globs: Vec::new(),
        exclude_globs: Vec::new(),
    }
}

// ── single-file round trip ──────────────────────────────────────────────

#[tokio::test]
async fn single_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("a.txt"),
        "The Mars rover Perseverance landed in Jezero crater in 2021. Perseverance was built by NASA.",
    )
    .unwrap();

    let engine = build_engine(TestEngineOptions::default());
    let run_id = engine
        .manager
        .ingest(fs_spec(dir.path()), IngestOptions::default())
        .unwrap();

    let run = wait_for_terminal(&engine.status, &run_id, Duration::from_secs(10)).await;
    assert_eq!(run.phase, IngestPhase::Done);
    assert_eq!(run.percent, 100);
    assert_eq!(run.files_total, 1);
    assert_eq!(run.files_done, 1);
    assert_eq!(run.counters.chunks, 1);
    assert_eq!(run.counters.triples, 0);

    // Exactly one chunk in both stores.
    assert_eq!(engine.vector.len(), 1);
    assert_eq!(engine.lexical.len(), 1);

    // Search finds it with a positive fused score.
    let results = engine
        .retriever
        .retrieve("who built Perseverance", 3, &[])
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[0].fused_score > 0.0);
    assert!(results[0].text.contains("NASA"));
    assert_eq!(results[0].doc_id, fs_doc_id("a.txt"));
    assert_eq!(results[0].display_name, "a.txt");

    // Query returns the stub answer plus the chunk as a citation.
    let query = QueryEngine::new(
        Arc::clone(&engine.retriever),
        Arc::new(StubLlm::new("[]", "Perseverance was built by NASA.")),
        Duration::from_secs(5),
    );
    let answer = query.answer("who built Perseverance", 3, &[]).await.unwrap();
    assert!(answer.answer.contains("NASA"));
    assert!(!answer.no_results);
    assert_eq!(answer.citations, vec![results[0].chunk_id.clone()]);
}

// ── idempotent re-ingestion ─────────────────────────────────────────────

#[tokio::test]
async fn reingesting_unchanged_content_adds_nothing() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("a.txt"), "Stable content that never changes.").unwrap();

    let engine = build_engine(TestEngineOptions::default());

    for _ in 0..2 {
        let run_id = engine
            .manager
            .ingest(fs_spec(dir.path()), IngestOptions::default())
            .unwrap();
        let run = wait_for_terminal(&engine.status, &run_id, Duration::from_secs(10)).await;
        assert_eq!(run.phase, IngestPhase::Done);
    }

    assert_eq!(engine.vector.len(), 1);
    assert_eq!(engine.lexical.len(), 1);
}

// ── empty document boundary ─────────────────────────────────────────────

#[tokio::test]
async fn empty_document_completes_with_zero_chunks() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("empty.txt"), "   \n\t\n  ").unwrap();

    let engine = build_engine(TestEngineOptions::default());
    let run_id = engine
        .manager
        .ingest(fs_spec(dir.path()), IngestOptions::default())
        .unwrap();

    let run = wait_for_terminal(&engine.status, &run_id, Duration::from_secs(10)).await;
    assert_eq!(run.phase, IngestPhase::Done);
    assert_eq!(run.counters.chunks, 0);
    assert_eq!(run.counters.triples, 0);
    assert_eq!(engine.vector.len(), 0);
    assert_eq!(engine.lexical.len(), 0);
}

// ── multi-batch embedding ───────────────────────────────────────────────

#[tokio::test]
async fn document_larger_than_one_embedding_batch_loses_no_chunks() {
    let dir = tempfile::tempdir().unwrap();
    // ~160k characters chunks into more than 64 pieces at the default
    // 512-token chunk size, forcing at least two embedding batches.
    let body: String = (0..4000)
        .map(|i| format!("Sentence number {i} talks about topic {i}. "))
        .collect();
    fs::write(dir.path().join("big.txt"), &body).unwrap();

    let engine = build_engine(TestEngineOptions::default());
    let run_id = engine
        .manager
        .ingest(fs_spec(dir.path()), IngestOptions::default())
        .unwrap();
    let run = wait_for_terminal(&engine.status, &run_id, Duration::from_secs(20)).await;

    assert_eq!(run.phase, IngestPhase::Done);
    assert!(run.counters.chunks > 1);
    assert_eq!(engine.vector.len() as u64, run.counters.chunks);
    assert_eq!(engine.lexical.len() as u64, run.counters.chunks);
}

// ── cancellation mid-run ────────────────────────────────────────────────

#[tokio::test]
async fn cancellation_keeps_completed_files_and_drops_partial_ones() {
    let dir = tempfile::tempdir().unwrap();
    let lorem = "Lorem ipsum dolor sit amet, consectetur adipiscing elit. ".repeat(40);
    for i in 0..50 {
        fs::write(dir.path().join(format!("file{i:02}.txt")), &lorem).unwrap();
    }

    let mut options = TestEngineOptions::default();
    options.embed_delay = Some(Duration::from_millis(15));
    let engine = build_engine(options);

    let run_id = engine
        .manager
        .ingest(fs_spec(dir.path()), IngestOptions::default())
        .unwrap();

    let seen = wait_for_files_done(&engine.status, &run_id, 5, Duration::from_secs(30)).await;
    assert!(!seen.phase.is_terminal(), "run finished before cancellation");

    let cancelled_at = tokio::time::Instant::now();
    assert!(engine.status.cancel(&run_id));
    let run = wait_for_terminal(&engine.status, &run_id, Duration::from_secs(5)).await;

    assert_eq!(run.phase, IngestPhase::Cancelled);
    assert!(run.cancel_flag);
    assert!(
        cancelled_at.elapsed() < Duration::from_secs(2),
        "cancellation took {:?}",
        cancelled_at.elapsed()
    );
    assert!(run.files_done >= 5);
    assert!(run.files_done < 50);

    // Completed files keep their chunks in both stores; files that never
    // completed have none — no partial chunk survives anywhere.
    let mut durable = 0usize;
    for i in 0..50 {
        let path = format!("file{i:02}.txt");
        let ids = engine.lexical.ids_for_doc(&fs_doc_id(&path)).await.unwrap();
        let completed = run
            .per_file
            .get(&path)
            .map(|fp| fp.percent == 100)
            .unwrap_or(false);
        if completed {
            assert!(!ids.is_empty(), "{path} completed but has no chunks");
            durable += ids.len();
        } else {
            assert!(ids.is_empty(), "{path} incomplete but left chunks behind");
        }
    }
    assert_eq!(engine.vector.len(), durable);
    assert_eq!(engine.lexical.len(), durable);
}

#[tokio::test]
async fn cancelling_immediately_leaves_stores_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let lorem = "Lorem ipsum dolor sit amet. ".repeat(100);
    for i in 0..10 {
        fs::write(dir.path().join(format!("f{i}.txt")), &lorem).unwrap();
    }

    let mut options = TestEngineOptions::default();
    options.embed_delay = Some(Duration::from_millis(50));
    let engine = build_engine(options);

    let run_id = engine
        .manager
        .ingest(fs_spec(dir.path()), IngestOptions::default())
        .unwrap();
    engine.status.cancel(&run_id);

    let run = wait_for_terminal(&engine.status, &run_id, Duration::from_secs(5)).await;
    assert_eq!(run.phase, IngestPhase::Cancelled);
    assert_eq!(run.files_done, 0);
    assert_eq!(engine.vector.len(), 0);
    assert_eq!(engine.lexical.len(), 0);
}

// ── graph retrieval ─────────────────────────────────────────────────────

#[tokio::test]
async fn graph_modality_returns_mentioned_chunk() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("acme.txt"), "Alice works at Acme. Acme is based in Paris.").unwrap();

    let mut options = TestEngineOptions::default();
    options.graph = true;
    options.extractor = Some(Arc::new(ScriptedExtractor(vec![
        triple("Alice", "PERSON", "WORKS_AT", "Acme", "ORGANIZATION"),
        triple("Acme", "ORGANIZATION", "BASED_IN", "Paris", "LOCATION"),
    ])));
    options.llm = Arc::new(StubLlm::new(r#"["Alice"]"#, "Alice works at Acme."));
    let engine = build_engine(options);

    let run_id = engine
        .manager
        .ingest(fs_spec(dir.path()), IngestOptions::default())
        .unwrap();
    let run = wait_for_terminal(&engine.status, &run_id, Duration::from_secs(10)).await;

    assert_eq!(run.phase, IngestPhase::Done);
    assert!(!run.graph_partial);
    assert_eq!(run.counters.triples, 2);
    assert_eq!(run.counters.entities, 3);

    // The graph holds both relations with MENTIONS provenance.
    let graph = engine.graph.as_ref().unwrap();
    let subgraph = graph.query(&["Alice".to_string()], 2).await.unwrap();
    let labels: Vec<&str> = subgraph.entities.iter().map(|e| e.label.as_str()).collect();
    assert!(labels.contains(&"Alice") && labels.contains(&"Acme") && labels.contains(&"Paris"));
    assert_eq!(subgraph.relations.len(), 2);
    assert!(subgraph
        .relations
        .iter()
        .any(|r| r.subject.label == "Alice" && r.predicate == "WORKS_AT" && r.object.label == "Acme"));
    assert!(subgraph
        .relations
        .iter()
        .any(|r| r.subject.label == "Acme" && r.predicate == "BASED_IN" && r.object.label == "Paris"));
    assert!(!subgraph.mentions.is_empty());

    // Graph-only search returns the chunk with a positive graph score.
    let results = engine
        .retriever
        .retrieve("Where does Alice work?", 5, &[RetrievalMode::Graph])
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[0].per_modality_scores["graph"] > 0.0);
    assert!(results[0].text.contains("Alice works at Acme"));
}

// ── parser timeout isolation ────────────────────────────────────────────

#[tokio::test]
async fn parse_timeout_fails_the_file_not_the_run() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("fast.txt"), "Quick fact: otters hold hands while sleeping.").unwrap();
    fs::write(dir.path().join("slow.txt"), "pretend this is 500 MB").unwrap();

    let engine = build_engine(TestEngineOptions::default());
    let run_id = engine
        .manager
        .ingest(fs_spec(dir.path()), IngestOptions::default())
        .unwrap();
    let run = wait_for_terminal(&engine.status, &run_id, Duration::from_secs(10)).await;

    assert_eq!(run.phase, IngestPhase::Done);
    assert_eq!(run.files_done, 1);
    let slow = run.per_file.get("slow.txt").unwrap();
    assert_eq!(slow.error.as_ref().unwrap().kind, "ParseTimeout");

    // Only the fast file is searchable.
    let results = engine.retriever.retrieve("otters", 5, &[]).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].doc_id, fs_doc_id("fast.txt"));
}

// ── run with only failures is failed ────────────────────────────────────

#[tokio::test]
async fn all_files_failing_marks_the_run_failed() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("slow-one.txt"), "x").unwrap();
    fs::write(dir.path().join("slow-two.txt"), "y").unwrap();

    let engine = build_engine(TestEngineOptions::default());
    let run_id = engine
        .manager
        .ingest(fs_spec(dir.path()), IngestOptions::default())
        .unwrap();
    let run = wait_for_terminal(&engine.status, &run_id, Duration::from_secs(10)).await;

    assert_eq!(run.phase, IngestPhase::Failed);
    assert_eq!(run.error_kind.as_deref(), Some("ParseTimeout"));
    assert_eq!(run.files_done, 0);
}

// ── inline text ingestion ───────────────────────────────────────────────

#[tokio::test]
async fn ingest_text_bypasses_connector_and_parser() {
    let engine = build_engine(TestEngineOptions::default());
    let run_id = engine
        .manager
        .ingest_text(
            "Inline note: the warehouse moves to Berlin in October.".to_string(),
            "note".to_string(),
            IngestOptions::default(),
        )
        .unwrap();

    let run = wait_for_terminal(&engine.status, &run_id, Duration::from_secs(10)).await;
    assert_eq!(run.phase, IngestPhase::Done);
    assert_eq!(run.counters.chunks, 1);

    let results = engine.retriever.retrieve("warehouse Berlin", 3, &[]).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].doc_id, "text:note");
}

// ── status invariants ───────────────────────────────────────────────────

#[tokio::test]
async fn terminal_accounting_covers_every_file() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("ok.txt"), "A perfectly fine file.").unwrap();
    fs::write(dir.path().join("slow.txt"), "times out").unwrap();

    let engine = build_engine(TestEngineOptions::default());
    let run_id = engine
        .manager
        .ingest(fs_spec(dir.path()), IngestOptions::default())
        .unwrap();
    let run = wait_for_terminal(&engine.status, &run_id, Duration::from_secs(10)).await;

    let completed = run.per_file.values().filter(|fp| fp.percent == 100).count();
    let errored = run.per_file.values().filter(|fp| fp.error.is_some()).count();
    assert_eq!(completed + errored, run.files_total);
    assert!(run.files_in_progress.is_empty());
}
