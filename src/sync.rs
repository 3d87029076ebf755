//! Incremental sync controller.
//!
//! Keeps long-lived datasources in step with their sources, out of band
//! from interactive ingestion. For each active [`DatasourceConfig`] the
//! controller polls the connector's change feed every `refresh_interval_s`
//! (change streams are reserved at the interface) and:
//!
//! - **add / modify** — hashes the document's canonical bytes; when the
//!   hash differs from the stored one, re-ingests just that file through
//!   the shared index builder and upserts [`DocumentState`] with the new
//!   hash, sync timestamps, and a strictly increasing ordinal;
//! - **delete** — removes the document's chunks from all three stores and
//!   drops the state row. Polling connectors cannot observe deletions
//!   directly, so rows whose `source_path` vanished from the feed are
//!   reconciled into deletes.
//!
//! One sync may be inflight per config at a time; manual triggers run
//! configs sequentially, the background loop runs them concurrently.
//! A failing change event is logged and retried at the next tick.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::{DashMap, DashSet};
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connector::resolve_connector;
use crate::error::EngineError;
use crate::index::IndexBuilder;
use crate::models::{
    ChangeEvent, ChangeKind, DatasourceConfig, Document, DocumentState, IngestPhase,
    ParseMetadata, ParsedDocument, SourceSpec,
};
use crate::parser::DocumentParser;

/// Outcome of one sync tick for one config.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub ingested: usize,
    pub deleted: usize,
    pub unchanged: usize,
    pub failed: usize,
}

pub struct SyncController {
    pool: SqlitePool,
    builder: Arc<IndexBuilder>,
    parser: Arc<dyn DocumentParser>,
    /// Configs with an inflight sync (advisory lock).
    inflight: DashSet<String>,
    /// Last poll start per config (epoch seconds).
    last_polled: DashMap<String, i64>,
}

impl SyncController {
    pub fn new(pool: SqlitePool, builder: Arc<IndexBuilder>, parser: Arc<dyn DocumentParser>) -> Self {
        Self {
            pool,
            builder,
            parser,
            inflight: DashSet::new(),
            last_polled: DashMap::new(),
        }
    }

    // ── config persistence ────────────────────────────────────────────

    /// Insert or update a datasource configuration.
    pub async fn upsert_config(&self, config: &DatasourceConfig) -> Result<(), EngineError> {
        sqlx::query(
            r#"
            INSERT INTO datasource_config
                (config_id, source_type, params_json, refresh_interval_s,
                 change_stream_enabled, skip_graph, active, last_sync_ordinal, last_sync_status)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(config_id) DO UPDATE SET
                source_type = excluded.source_type,
                params_json = excluded.params_json,
                refresh_interval_s = excluded.refresh_interval_s,
                change_stream_enabled = excluded.change_stream_enabled,
                skip_graph = excluded.skip_graph,
                active = excluded.active
            "#,
        )
        .bind(&config.config_id)
        .bind(&config.source_type)
        .bind(&config.params_json)
        .bind(config.refresh_interval_s)
        .bind(config.change_stream_enabled)
        .bind(config.skip_graph)
        .bind(config.active)
        .bind(config.last_sync_ordinal)
        .bind(&config.last_sync_status)
        .execute(&self.pool)
        .await
        .map_err(|e| EngineError::store_permanent(e.to_string()))?;
        Ok(())
    }

    pub async fn list_configs(&self) -> Result<Vec<DatasourceConfig>, EngineError> {
        sqlx::query_as::<_, DatasourceConfig>(
            "SELECT * FROM datasource_config ORDER BY config_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| EngineError::store_transient(e.to_string()))
    }

    pub async fn document_state(&self, doc_id: &str) -> Result<Option<DocumentState>, EngineError> {
        sqlx::query_as::<_, DocumentState>("SELECT * FROM document_state WHERE doc_id = ?")
            .bind(doc_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| EngineError::store_transient(e.to_string()))
    }

    async fn states_for_config(&self, config_id: &str) -> Result<Vec<DocumentState>, EngineError> {
        sqlx::query_as::<_, DocumentState>(
            "SELECT * FROM document_state WHERE config_id = ? ORDER BY ordinal",
        )
        .bind(config_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| EngineError::store_transient(e.to_string()))
    }

    // ── sync driving ──────────────────────────────────────────────────

    /// Run sync ticks for every active config, sequentially. Used by the
    /// manual trigger path.
    pub async fn sync_all(&self) -> Result<Vec<(String, SyncReport)>, EngineError> {
        let mut reports = Vec::new();
        for config in self.list_configs().await? {
            if !config.active {
                continue;
            }
            let report = self.sync_config(&config.config_id).await?;
            reports.push((config.config_id, report));
        }
        Ok(reports)
    }

    /// One sync tick for one config.
    pub async fn sync_config(&self, config_id: &str) -> Result<SyncReport, EngineError> {
        if !self.inflight.insert(config_id.to_string()) {
            debug!(config_id, "sync already inflight, skipping");
            return Ok(SyncReport::default());
        }
        let result = self.sync_config_inner(config_id).await;
        self.inflight.remove(config_id);

        let status = match &result {
            Ok(report) if report.failed == 0 => "ok".to_string(),
            Ok(report) => format!("partial: {} events failed", report.failed),
            Err(e) => format!("error: {e}"),
        };
        let _ = sqlx::query("UPDATE datasource_config SET last_sync_status = ? WHERE config_id = ?")
            .bind(&status)
            .bind(config_id)
            .execute(&self.pool)
            .await;

        result
    }

    async fn sync_config_inner(&self, config_id: &str) -> Result<SyncReport, EngineError> {
        let config = sqlx::query_as::<_, DatasourceConfig>(
            "SELECT * FROM datasource_config WHERE config_id = ?",
        )
        .bind(config_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| EngineError::store_transient(e.to_string()))?
        .ok_or_else(|| EngineError::Config(format!("unknown datasource config: {config_id}")))?;

        let spec: SourceSpec = serde_json::from_str(&config.params_json)
            .map_err(|e| EngineError::Config(format!("bad params_json for {config_id}: {e}")))?;
        let connector = resolve_connector(&spec);

        let events = connector.fetch_changes(config.last_sync_ordinal).await?;
        let mut report = SyncReport::default();
        let mut max_ordinal = config.last_sync_ordinal;
        let mut seen_paths: HashSet<String> = HashSet::new();

        for event in &events {
            if event.change != ChangeKind::Delete {
                seen_paths.insert(event.source_path.clone());
            }
            match self.apply_event(&config, connector.as_ref(), event).await {
                Ok(applied) => {
                    match applied {
                        Applied::Ingested(ordinal) => {
                            report.ingested += 1;
                            max_ordinal = max_ordinal.max(ordinal);
                        }
                        Applied::Deleted => report.deleted += 1,
                        Applied::Unchanged => {
                            report.unchanged += 1;
                            max_ordinal = max_ordinal.max(event.ordinal);
                        }
                    }
                }
                Err(e) => {
                    // Retried at the next tick; the watermark does not
                    // advance past a failed event's ordinal.
                    warn!(config_id, path = %event.source_path, error = %e, "change event failed");
                    report.failed += 1;
                }
            }
        }

        // Reconcile deletions: stored rows whose path no longer exists.
        for state in self.states_for_config(config_id).await? {
            if seen_paths.contains(&state.source_path) {
                continue;
            }
            let synthetic = ChangeEvent {
                change: ChangeKind::Delete,
                source_path: state.source_path.clone(),
                source_id: Some(state.source_id.clone()),
                modified_at: Utc::now(),
                ordinal: state.ordinal,
            };
            match self.apply_event(&config, connector.as_ref(), &synthetic).await {
                Ok(_) => report.deleted += 1,
                Err(e) => {
                    warn!(config_id, path = %state.source_path, error = %e, "delete reconciliation failed");
                    report.failed += 1;
                }
            }
        }

        if report.failed == 0 && max_ordinal > config.last_sync_ordinal {
            sqlx::query(
                "UPDATE datasource_config SET last_sync_ordinal = ? WHERE config_id = ?",
            )
            .bind(max_ordinal)
            .bind(config_id)
            .execute(&self.pool)
            .await
            .map_err(|e| EngineError::store_transient(e.to_string()))?;
        }

        info!(
            config_id,
            ingested = report.ingested,
            deleted = report.deleted,
            unchanged = report.unchanged,
            failed = report.failed,
            "sync tick finished"
        );
        Ok(report)
    }

    async fn apply_event(
        &self,
        config: &DatasourceConfig,
        connector: &dyn crate::connector::SourceConnector,
        event: &ChangeEvent,
    ) -> Result<Applied, EngineError> {
        let doc_id = format!("{}:{}", config.config_id, event.source_path);

        if event.change == ChangeKind::Delete {
            let removed = self.builder.delete_document(&doc_id).await?;
            sqlx::query("DELETE FROM document_state WHERE doc_id = ?")
                .bind(&doc_id)
                .execute(&self.pool)
                .await
                .map_err(|e| EngineError::store_transient(e.to_string()))?;
            debug!(doc_id, chunks = removed, "document removed by sync");
            return Ok(Applied::Deleted);
        }

        let doc = connector.fetch_document(&event.source_path).await?;
        let bytes = doc
            .bytes()
            .map_err(|e| EngineError::source_transient(e.to_string()))?;
        let content_hash = hex_sha256(&bytes);

        let existing = self.document_state(&doc_id).await?;
        if existing.as_ref().map(|s| s.content_hash.as_str()) == Some(content_hash.as_str()) {
            return Ok(Applied::Unchanged);
        }

        // Targeted re-ingest through the shared pipeline.
        let parsed = self.parse(&doc).await?;
        self.builder
            .index_document(
                &doc_id,
                &event.source_path,
                &doc.display_name,
                &parsed,
                config.skip_graph,
                &CancellationToken::new(),
                |_: IngestPhase, _: u8| {},
            )
            .await?;

        let ordinal = self.next_ordinal(&config.config_id, event.ordinal).await?;
        let now = Utc::now();
        let graph_synced = (!config.skip_graph && self.builder.graph_enabled()).then_some(now);
        sqlx::query(
            r#"
            INSERT INTO document_state
                (doc_id, config_id, source_path, source_id, ordinal, content_hash,
                 vector_synced_at, search_synced_at, graph_synced_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(doc_id) DO UPDATE SET
                source_id = excluded.source_id,
                ordinal = excluded.ordinal,
                content_hash = excluded.content_hash,
                vector_synced_at = excluded.vector_synced_at,
                search_synced_at = excluded.search_synced_at,
                graph_synced_at = excluded.graph_synced_at
            "#,
        )
        .bind(&doc_id)
        .bind(&config.config_id)
        .bind(&event.source_path)
        .bind(event.source_id.clone().unwrap_or_else(|| event.source_path.clone()))
        .bind(ordinal)
        .bind(&content_hash)
        .bind(now)
        .bind(now)
        .bind(graph_synced)
        .execute(&self.pool)
        .await
        .map_err(|e| EngineError::store_transient(e.to_string()))?;

        Ok(Applied::Ingested(ordinal))
    }

    async fn parse(&self, doc: &Document) -> Result<ParsedDocument, EngineError> {
        match doc.ext.as_str() {
            // Plain text shortcuts the parser, matching inline ingestion.
            "txt" | "" => {
                let text = String::from_utf8_lossy(
                    &doc.bytes()
                        .map_err(|e| EngineError::ParseFailure(e.to_string()))?,
                )
                .to_string();
                Ok(ParsedDocument {
                    markdown: text.clone(),
                    plaintext: text,
                    metadata: ParseMetadata::default(),
                    parser_name: "inline".to_string(),
                    parse_mode: "text".to_string(),
                })
            }
            _ => self.parser.parse(doc).await,
        }
    }

    /// Strictly increasing ordinal within a config: the max of the current
    /// time, the event's own ordinal, and the stored maximum plus one.
    async fn next_ordinal(&self, config_id: &str, event_ordinal: i64) -> Result<i64, EngineError> {
        let stored_max: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(ordinal) FROM document_state WHERE config_id = ?",
        )
        .bind(config_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| EngineError::store_transient(e.to_string()))?;

        Ok(Utc::now()
            .timestamp_micros()
            .max(event_ordinal)
            .max(stored_max.unwrap_or(0) + 1))
    }

    /// Background polling loop. Runs until the token is cancelled; each due
    /// config syncs concurrently, guarded by the per-config inflight lock.
    pub async fn run_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tick.tick() => {}
            }

            let configs = match self.list_configs().await {
                Ok(configs) => configs,
                Err(e) => {
                    warn!(error = %e, "sync loop could not list configs");
                    continue;
                }
            };

            let now = Utc::now().timestamp();
            for config in configs {
                if !config.active || self.inflight.contains(&config.config_id) {
                    continue;
                }
                let due = self
                    .last_polled
                    .get(&config.config_id)
                    .map(|last| now - *last >= config.refresh_interval_s)
                    .unwrap_or(true);
                if !due {
                    continue;
                }
                self.last_polled.insert(config.config_id.clone(), now);

                let controller = Arc::clone(&self);
                tokio::spawn(async move {
                    if let Err(e) = controller.sync_config(&config.config_id).await {
                        warn!(config_id = %config.config_id, error = %e, "sync tick failed");
                    }
                });
            }
        }
    }
}

enum Applied {
    Ingested(i64),
    Deleted,
    Unchanged,
}

fn hex_sha256(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_is_sha256_hex() {
        let hash = hex_sha256(b"hello");
        assert_eq!(
            hash,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }
}
