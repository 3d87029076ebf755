//! Ingestion manager.
//!
//! Owns the lifecycle of one ingestion run: resolve the connector, drive
//! every document through parse → index, keep the status registry current,
//! and classify failures.
//!
//! # Run phases
//!
//! ```text
//! queued → parsing → chunking → vectorizing → indexing_lexical
//!        → [extracting_graph]? → finalizing → done | cancelled | failed
//! ```
//!
//! The run-level phase only moves forward (later files revisiting earlier
//! pipeline stages do not move it back); per-file phases live in
//! `per_file`.
//!
//! # Failure policy
//!
//! - Parse timeouts/failures, KG extraction errors, and permanent source
//!   errors are **file-level**: recorded in `FileProgress.error`, the run
//!   continues.
//! - Transient source/store errors are retried (three retries, 1 s / 4 s /
//!   15 s backoff) around idempotent operations.
//! - Store-level and provider-level failures are **run-level**: the run
//!   transitions to `failed` with the error kind.
//! - A run whose files *all* failed is `failed` even without a run-level
//!   error.
//!
//! # Cancellation
//!
//! Cooperative: the token is checked before each file, each embedding
//! batch, and each graph extraction call. On cancel, partially written
//! chunks of the in-flight file are removed from every store; completed
//! files are retained so the next run is incremental.

use std::sync::Arc;

use dashmap::DashSet;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::connector::{resolve_connector, ConnectorProgress, ProgressFn};
use crate::error::{EngineError, RETRY_BACKOFF};
use crate::index::IndexBuilder;
use crate::models::{
    Document, FileError, IngestPhase, ParseMetadata, ParsedDocument, SourceSpec,
};
use crate::parser::{save_parsed_output, DocumentParser};
use crate::status::StatusRegistry;

/// Per-run options.
#[derive(Debug, Clone, Default)]
pub struct IngestOptions {
    /// Skip the graph phase for this run even when globally enabled.
    pub skip_graph: bool,
    /// Caller-supplied run id (defaults to a fresh UUID).
    pub run_id: Option<String>,
}

/// Rank used to keep the run-level phase monotonic.
fn phase_rank(phase: IngestPhase) -> u8 {
    match phase {
        IngestPhase::Queued => 0,
        IngestPhase::Parsing => 1,
        IngestPhase::Chunking => 2,
        IngestPhase::Vectorizing => 3,
        IngestPhase::IndexingLexical => 4,
        IngestPhase::ExtractingGraph => 5,
        IngestPhase::Finalizing => 6,
        IngestPhase::Done | IngestPhase::Cancelled | IngestPhase::Failed => 7,
    }
}

pub struct IngestionManager {
    parser: Arc<dyn DocumentParser>,
    builder: Arc<IndexBuilder>,
    status: Arc<StatusRegistry>,
    config: Config,
    /// Run ids with a live background task (at-most-one task per id).
    active: DashSet<String>,
}

impl IngestionManager {
    pub fn new(
        parser: Arc<dyn DocumentParser>,
        builder: Arc<IndexBuilder>,
        status: Arc<StatusRegistry>,
        config: Config,
    ) -> Self {
        Self {
            parser,
            builder,
            status,
            config,
            active: DashSet::new(),
        }
    }

    pub fn status(&self) -> &Arc<StatusRegistry> {
        &self.status
    }

    pub fn builder(&self) -> &Arc<IndexBuilder> {
        &self.builder
    }

    /// Start an ingestion run. Returns immediately with the run id; progress
    /// is observable through the status registry.
    pub fn ingest(
        self: &Arc<Self>,
        spec: SourceSpec,
        options: IngestOptions,
    ) -> Result<String, EngineError> {
        let run_id = options
            .run_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        if !self.active.insert(run_id.clone()) {
            return Err(EngineError::Config(format!(
                "run '{run_id}' is already active"
            )));
        }

        self.status.create(&run_id, spec.clone());
        let manager = Arc::clone(self);
        let task_run_id = run_id.clone();
        tokio::spawn(async move {
            manager.run(&task_run_id, spec, options).await;
            manager.active.remove(&task_run_id);
        });

        Ok(run_id)
    }

    /// Ingest inline text, bypassing connector and parser.
    pub fn ingest_text(
        self: &Arc<Self>,
        text: String,
        name: String,
        options: IngestOptions,
    ) -> Result<String, EngineError> {
        let run_id = options
            .run_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        if !self.active.insert(run_id.clone()) {
            return Err(EngineError::Config(format!(
                "run '{run_id}' is already active"
            )));
        }

        let spec = SourceSpec::WebPage { urls: Vec::new() };
        self.status.create(&run_id, spec);
        let manager = Arc::clone(self);
        let task_run_id = run_id.clone();
        tokio::spawn(async move {
            manager
                .run_text(&task_run_id, text, name, options.skip_graph)
                .await;
            manager.active.remove(&task_run_id);
        });

        Ok(run_id)
    }

    // ── run drivers ───────────────────────────────────────────────────

    async fn run(self: &Arc<Self>, run_id: &str, spec: SourceSpec, options: IngestOptions) {
        let cancel = self
            .status
            .cancel_token(run_id)
            .unwrap_or_else(CancellationToken::new);
        let connector = resolve_connector(&spec);

        self.advance_phase(run_id, IngestPhase::Parsing);

        // Connector listing, with transient errors retried.
        let status = Arc::clone(&self.status);
        let progress_run_id = run_id.to_string();
        let progress: ProgressFn = Arc::new(move |event| {
            if let ConnectorProgress::SetTotal(total) = event {
                status.update(&progress_run_id, |run| run.files_total = total);
            }
        });

        let enumerated = retry_transient(|| {
            connector.enumerate(Arc::clone(&progress), cancel.clone())
        })
        .await;

        let (total, mut stream) = match enumerated {
            Ok(pair) => pair,
            Err(e) => {
                self.finish_failed(run_id, &e);
                return;
            }
        };
        self.status
            .update(run_id, |run| run.files_total = run.files_total.max(total));

        let mut files_failed = 0usize;
        let mut files_done = 0usize;
        let mut first_error: Option<String> = None;
        let mut source_errors = 0usize;

        while let Some(item) = stream.next().await {
            if cancel.is_cancelled() {
                self.finish_cancelled(run_id);
                return;
            }

            let doc = match item {
                Ok(doc) => doc,
                Err(e) => {
                    // The stream cannot replay a failed item; any source
                    // error at this point marks one file failed.
                    source_errors += 1;
                    let key = format!("<source error {source_errors}>");
                    warn!(run_id, error = %e, "document fetch failed");
                    self.record_file_error(run_id, &key, &e);
                    files_failed += 1;
                    first_error.get_or_insert_with(|| e.kind().to_string());
                    continue;
                }
            };

            let path = doc.logical_path.clone();
            self.status.update(run_id, |run| {
                run.files_in_progress.push(path.clone());
                run.per_file.entry(path.clone()).or_default().phase = Some(IngestPhase::Parsing);
            });

            match self.process_document(run_id, &spec, &doc, options.skip_graph, &cancel).await {
                Ok(()) => {
                    files_done += 1;
                }
                Err(EngineError::Cancelled) => {
                    self.clear_in_progress(run_id, &doc.logical_path);
                    self.finish_cancelled(run_id);
                    return;
                }
                Err(e) if e.is_file_level() => {
                    self.record_file_error(run_id, &doc.logical_path, &e);
                    files_failed += 1;
                    first_error.get_or_insert_with(|| e.kind().to_string());
                }
                Err(e) => {
                    self.clear_in_progress(run_id, &doc.logical_path);
                    self.finish_failed(run_id, &e);
                    return;
                }
            }

            let path = doc.logical_path.clone();
            self.status.update(run_id, |run| {
                run.files_in_progress.retain(|p| p != &path);
                run.files_done = files_done;
                let processed = files_done + files_failed;
                if run.files_total > 0 {
                    run.percent = (processed * 100 / run.files_total).min(99) as u8;
                }
            });
        }

        if cancel.is_cancelled() {
            self.finish_cancelled(run_id);
            return;
        }

        self.advance_phase(run_id, IngestPhase::Finalizing);
        let all_failed = files_done == 0 && files_failed > 0;
        self.status.update(run_id, |run| {
            if all_failed {
                run.phase = IngestPhase::Failed;
                run.error_kind = first_error.clone();
            } else {
                run.phase = IngestPhase::Done;
            }
        });
        info!(run_id, files_done, files_failed, "ingestion run finished");
    }

    async fn run_text(self: &Arc<Self>, run_id: &str, text: String, name: String, skip_graph: bool) {
        let cancel = self
            .status
            .cancel_token(run_id)
            .unwrap_or_else(CancellationToken::new);

        self.status.update(run_id, |run| {
            run.files_total = 1;
            run.per_file.entry(name.clone()).or_default().phase = Some(IngestPhase::Chunking);
        });
        self.advance_phase(run_id, IngestPhase::Chunking);

        let parsed = ParsedDocument {
            plaintext: text.clone(),
            markdown: text,
            metadata: ParseMetadata::default(),
            parser_name: "inline".to_string(),
            parse_mode: "text".to_string(),
        };
        let doc_id = format!("text:{name}");

        match self
            .index_with_status(run_id, &doc_id, &name, &name, &parsed, skip_graph, &cancel)
            .await
        {
            Ok(()) => {
                self.status.update(run_id, |run| {
                    run.files_done = 1;
                    run.phase = IngestPhase::Done;
                });
            }
            Err(EngineError::Cancelled) => self.finish_cancelled(run_id),
            Err(e) if e.is_file_level() => {
                self.record_file_error(run_id, &name, &e);
                self.status
                    .update(run_id, |run| run.phase = IngestPhase::Failed);
            }
            Err(e) => self.finish_failed(run_id, &e),
        }
    }

    /// Parse and index one document.
    async fn process_document(
        &self,
        run_id: &str,
        spec: &SourceSpec,
        doc: &Document,
        skip_graph: bool,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let parsed = self.parser.parse(doc).await?;

        if self.config.parser.save_parsed_output {
            let stem = doc
                .display_name
                .rsplit_once('.')
                .map(|(stem, _)| stem.to_string())
                .unwrap_or_else(|| doc.display_name.clone());
            save_parsed_output(&self.config.parser.parsed_output_dir, &stem, &parsed);
        }

        let doc_id = format!("{}:{}", spec.family(), doc.logical_path);
        self.index_with_status(
            run_id,
            &doc_id,
            &doc.logical_path,
            &doc.display_name,
            &parsed,
            skip_graph,
            cancel,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn index_with_status(
        &self,
        run_id: &str,
        doc_id: &str,
        logical_path: &str,
        display_name: &str,
        parsed: &ParsedDocument,
        skip_graph: bool,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let status = Arc::clone(&self.status);
        let file_key = logical_path.to_string();
        let progress_run_id = run_id.to_string();

        let outcome = self
            .builder
            .index_document(
                doc_id,
                logical_path,
                display_name,
                parsed,
                skip_graph,
                cancel,
                move |phase, percent| {
                    status.update(&progress_run_id, |run| {
                        let fp = run.per_file.entry(file_key.clone()).or_default();
                        fp.phase = Some(phase);
                        if percent > fp.percent {
                            fp.percent = percent;
                        }
                    });
                },
            )
            .await?;

        // Run-level phase follows the furthest pipeline stage reached.
        self.advance_phase(run_id, IngestPhase::IndexingLexical);
        if self.builder.graph_enabled() && !skip_graph {
            self.advance_phase(run_id, IngestPhase::ExtractingGraph);
        }

        let graph_error = outcome.graph_error.as_ref().map(|e| FileError {
            kind: e.kind().to_string(),
            message: e.to_string(),
        });
        let graph_partial = outcome.graph_partial;
        let file_key = logical_path.to_string();
        self.status.update(run_id, |run| {
            run.counters.chunks += outcome.chunks;
            run.counters.triples += outcome.triples;
            run.counters.entities += outcome.entities;
            run.counters.relations += outcome.relations;
            run.graph_partial |= graph_partial;

            let fp = run.per_file.entry(file_key.clone()).or_default();
            if let Some(err) = graph_error {
                // Chunks stayed durable; only enrichment is missing.
                fp.error = Some(err);
                fp.percent = fp.percent.min(90);
            } else {
                fp.percent = 100;
            }
        });
        Ok(())
    }

    // ── status helpers ────────────────────────────────────────────────

    fn advance_phase(&self, run_id: &str, phase: IngestPhase) {
        self.status.update(run_id, |run| {
            if phase_rank(phase) > phase_rank(run.phase) {
                run.phase = phase;
            }
        });
    }

    fn record_file_error(&self, run_id: &str, path: &str, error: &EngineError) {
        let (kind, message) = (error.kind().to_string(), error.to_string());
        let path = path.to_string();
        self.status.update(run_id, |run| {
            run.files_in_progress.retain(|p| p != &path);
            let fp = run.per_file.entry(path.clone()).or_default();
            fp.error = Some(FileError {
                kind: kind.clone(),
                message: message.clone(),
            });
        });
    }

    fn clear_in_progress(&self, run_id: &str, path: &str) {
        let path = path.to_string();
        self.status.update(run_id, |run| {
            run.files_in_progress.retain(|p| p != &path);
        });
    }

    fn finish_cancelled(&self, run_id: &str) {
        info!(run_id, "ingestion run cancelled");
        self.status.update(run_id, |run| {
            run.phase = IngestPhase::Cancelled;
        });
    }

    fn finish_failed(&self, run_id: &str, error: &EngineError) {
        warn!(run_id, error = %error, "ingestion run failed");
        let kind = error.kind().to_string();
        self.status.update(run_id, |run| {
            run.phase = IngestPhase::Failed;
            run.error_kind = Some(kind.clone());
        });
    }
}

/// Run an idempotent operation, retrying transient failures with the
/// engine's backoff schedule.
pub async fn retry_transient<T, F, Fut>(mut op: F) -> Result<T, EngineError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, EngineError>>,
{
    let mut attempt = 0usize;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.retryable() && attempt < RETRY_BACKOFF.len() => {
                warn!(attempt, error = %e, "transient failure, backing off");
                tokio::time::sleep(RETRY_BACKOFF[attempt]).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn retry_succeeds_after_transient_failures() {
        let calls = AtomicUsize::new(0);
        let result = retry_transient(|| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(EngineError::source_transient("flaky"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_gives_up_on_permanent_errors() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), _> = retry_transient(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(EngineError::source_permanent("gone")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn phase_ranks_are_ordered() {
        assert!(phase_rank(IngestPhase::Parsing) < phase_rank(IngestPhase::Chunking));
        assert!(phase_rank(IngestPhase::Vectorizing) < phase_rank(IngestPhase::IndexingLexical));
        assert!(phase_rank(IngestPhase::Finalizing) < phase_rank(IngestPhase::Done));
    }
}
