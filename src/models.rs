//! Core data models used throughout Lattice.
//!
//! These types flow through the ingestion and retrieval pipeline and define
//! the wire shapes consumed by the HTTP API: the serde field names of
//! [`IngestRun`], [`RankedNode`], and [`ChangeEvent`] are a public contract.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ═══════════════════════════════════════════════════════════════════════
// Source specification
// ═══════════════════════════════════════════════════════════════════════

/// Identifies one of the supported source families plus its family-specific
/// connection data. Opaque to the core; interpreted only by the matching
/// connector.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceSpec {
    /// Local filesystem roots.
    LocalFs {
        paths: Vec<PathBuf>,
        #[serde(default)]
        include_globs: Vec<String>,
        #[serde(default)]
        exclude_globs: Vec<String>,
    },
    /// Amazon S3 (or S3-compatible) bucket.
    S3 {
        bucket: String,
        #[serde(default)]
        prefix: String,
        #[serde(default = "default_s3_region")]
        region: String,
        #[serde(default)]
        endpoint_url: Option<String>,
    },
    /// Google Cloud Storage bucket.
    Gcs {
        bucket: String,
        #[serde(default)]
        prefix: String,
    },
    /// Azure Blob Storage container.
    Azblob {
        account: String,
        container: String,
        #[serde(default)]
        prefix: String,
    },
    /// Microsoft OneDrive folder.
    Onedrive {
        drive_id: String,
        #[serde(default)]
        folder_path: String,
        access_token: String,
    },
    /// SharePoint document library.
    Sharepoint {
        site_id: String,
        drive_id: String,
        #[serde(default)]
        folder_path: String,
        access_token: String,
    },
    /// Google Drive folder.
    Gdrive {
        folder_id: String,
        access_token: String,
    },
    /// Box folder.
    Box {
        folder_id: String,
        access_token: String,
    },
    /// Generic CMIS 1.1 repository (browser binding).
    Cmis {
        base_url: String,
        folder_path: String,
        username: String,
        password: String,
    },
    /// Alfresco repository (CMIS browser binding under the Alfresco API root).
    Alfresco {
        base_url: String,
        folder_path: String,
        username: String,
        password: String,
    },
    /// A list of web page URLs.
    WebPage { urls: Vec<String> },
    /// Wikipedia page titles or URLs.
    Wikipedia { pages: Vec<String> },
    /// YouTube video URLs (transcripts).
    Youtube { urls: Vec<String> },
}

fn default_s3_region() -> String {
    "us-east-1".to_string()
}

impl SourceSpec {
    /// Family name used in logs, run records, and `doc_id` prefixes.
    pub fn family(&self) -> &'static str {
        match self {
            Self::LocalFs { .. } => "local_fs",
            Self::S3 { .. } => "s3",
            Self::Gcs { .. } => "gcs",
            Self::Azblob { .. } => "azblob",
            Self::Onedrive { .. } => "onedrive",
            Self::Sharepoint { .. } => "sharepoint",
            Self::Gdrive { .. } => "gdrive",
            Self::Box { .. } => "box",
            Self::Cmis { .. } => "cmis",
            Self::Alfresco { .. } => "alfresco",
            Self::WebPage { .. } => "web_page",
            Self::Wikipedia { .. } => "wikipedia",
            Self::Youtube { .. } => "youtube",
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Documents
// ═══════════════════════════════════════════════════════════════════════

/// Document payload: either inline bytes or a path to a temporary local file
/// owned by the connector until the consumer is done with the document.
#[derive(Debug, Clone)]
pub enum DocumentContent {
    Bytes(Vec<u8>),
    LocalPath(PathBuf),
}

/// The unit produced by a connector and consumed by the parser.
#[derive(Debug, Clone)]
pub struct Document {
    /// Source-assigned identifier (object key, node id, URL, ...).
    pub source_id: String,
    /// Path-like identifier within the source, stable across syncs.
    pub logical_path: String,
    /// Human-readable name shown in results and progress.
    pub display_name: String,
    /// Lowercased file extension without the dot, or a MIME type.
    pub ext: String,
    /// Inline bytes or a temporary file path.
    pub content: DocumentContent,
    /// Free-form source metadata carried through to the indexes.
    pub metadata: BTreeMap<String, String>,
}

impl Document {
    /// Build an inline-bytes document with empty metadata.
    pub fn from_bytes(
        source_id: impl Into<String>,
        logical_path: impl Into<String>,
        display_name: impl Into<String>,
        ext: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            logical_path: logical_path.into(),
            display_name: display_name.into(),
            ext: ext.into(),
            content: DocumentContent::Bytes(bytes),
            metadata: BTreeMap::new(),
        }
    }

    /// Read the document's bytes, loading from disk if content is a path.
    pub fn bytes(&self) -> std::io::Result<Vec<u8>> {
        match &self.content {
            DocumentContent::Bytes(b) => Ok(b.clone()),
            DocumentContent::LocalPath(p) => std::fs::read(p),
        }
    }
}

/// Parse result: both representations always exist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedDocument {
    /// Layout-preserving markdown rendition.
    pub markdown: String,
    /// Plain text rendition.
    pub plaintext: String,
    /// Parser-reported metadata (table count, page count, ...).
    pub metadata: ParseMetadata,
    /// Name of the parser that produced this result.
    pub parser_name: String,
    /// Parser mode used (device hint or cloud quality mode).
    pub parse_mode: String,
}

/// Structural metadata reported by a parser.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParseMetadata {
    /// Number of tables detected in the document.
    #[serde(default)]
    pub tables: usize,
    /// Number of pages, when the format has pages.
    #[serde(default)]
    pub pages: Option<usize>,
    /// Source content type as understood by the parser.
    #[serde(default)]
    pub content_type: String,
}

impl ParsedDocument {
    /// Representation handed to the KG extractor per the configured format:
    /// `auto` selects markdown iff the parse detected at least one table.
    pub fn extraction_text(&self, format: ExtractionFormat) -> &str {
        match format {
            ExtractionFormat::Markdown => &self.markdown,
            ExtractionFormat::Plaintext => &self.plaintext,
            ExtractionFormat::Auto => {
                if self.metadata.tables > 0 {
                    &self.markdown
                } else {
                    &self.plaintext
                }
            }
        }
    }
}

/// Which representation downstream extraction receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionFormat {
    Auto,
    Markdown,
    Plaintext,
}

// ═══════════════════════════════════════════════════════════════════════
// Chunks and triples
// ═══════════════════════════════════════════════════════════════════════

/// A contiguous span of document text; the atomic unit of indexing.
///
/// `chunk_id` is a stable hash of `(doc_id, start_offset, end_offset,
/// text hash)`, so re-ingesting unchanged content is idempotent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: String,
    pub doc_id: String,
    pub text: String,
    pub start_offset: usize,
    pub end_offset: usize,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// A typed (subject, predicate, object) relation extracted from one chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Triple {
    pub subject_label: String,
    pub subject_type: String,
    pub predicate: String,
    pub object_label: String,
    pub object_type: String,
}

impl Triple {
    /// Identity used for within-chunk deduplication and idempotent upserts.
    pub fn dedup_key(&self) -> (String, String, String) {
        (
            self.subject_label.to_lowercase(),
            self.predicate.to_lowercase(),
            self.object_label.to_lowercase(),
        )
    }
}

/// Entity/relation vocabulary that constrains or guides the KG extractor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schema {
    pub name: String,
    pub entity_types: Vec<String>,
    pub relation_types: Vec<String>,
    /// Allowed (subject_type, predicate, object_type) combinations.
    #[serde(default)]
    pub validation_pairs: Vec<(String, String, String)>,
    /// `true` ⇒ triples violating `validation_pairs` are discarded.
    #[serde(default)]
    pub strict: bool,
    #[serde(default = "default_max_triples")]
    pub max_triples_per_chunk: usize,
}

fn default_max_triples() -> usize {
    10
}

impl Schema {
    /// Whether a triple's types and predicate satisfy the schema.
    pub fn allows(&self, triple: &Triple) -> bool {
        if self.validation_pairs.is_empty() {
            return self.relation_types.is_empty()
                || self
                    .relation_types
                    .iter()
                    .any(|r| r.eq_ignore_ascii_case(&triple.predicate));
        }
        self.validation_pairs.iter().any(|(s, p, o)| {
            s.eq_ignore_ascii_case(&triple.subject_type)
                && p.eq_ignore_ascii_case(&triple.predicate)
                && o.eq_ignore_ascii_case(&triple.object_type)
        })
    }

    /// Built-in general-purpose schema.
    pub fn default_schema() -> Self {
        Self {
            name: "default".to_string(),
            entity_types: [
                "PERSON",
                "ORGANIZATION",
                "LOCATION",
                "PRODUCT",
                "EVENT",
                "CONCEPT",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            relation_types: [
                "WORKS_AT",
                "BASED_IN",
                "LOCATED_IN",
                "PART_OF",
                "PRODUCES",
                "FOUNDED",
                "RELATED_TO",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            validation_pairs: Vec::new(),
            strict: false,
            max_triples_per_chunk: 10,
        }
    }

    /// Built-in strict sample schema used in documentation and tests.
    pub fn sample_schema() -> Self {
        Self {
            name: "sample".to_string(),
            entity_types: ["PERSON", "ORGANIZATION", "LOCATION"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            relation_types: ["WORKS_AT", "BASED_IN"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            validation_pairs: vec![
                (
                    "PERSON".to_string(),
                    "WORKS_AT".to_string(),
                    "ORGANIZATION".to_string(),
                ),
                (
                    "ORGANIZATION".to_string(),
                    "BASED_IN".to_string(),
                    "LOCATION".to_string(),
                ),
            ],
            strict: true,
            max_triples_per_chunk: 10,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Retrieval results
// ═══════════════════════════════════════════════════════════════════════

/// One fused retrieval result with per-modality provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedNode {
    pub chunk_id: String,
    pub text: String,
    pub fused_score: f64,
    pub per_modality_scores: BTreeMap<String, f64>,
    pub doc_id: String,
    pub display_name: String,
    pub logical_path: String,
}

/// A retrieval modality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalMode {
    Vector,
    Lexical,
    Graph,
}

impl RetrievalMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vector => "vector",
            Self::Lexical => "lexical",
            Self::Graph => "graph",
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Ingestion run state
// ═══════════════════════════════════════════════════════════════════════

/// Phase of an ingestion run. Transitions are monotonic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestPhase {
    Queued,
    Parsing,
    Chunking,
    Vectorizing,
    IndexingLexical,
    ExtractingGraph,
    Finalizing,
    Done,
    Cancelled,
    Failed,
}

impl IngestPhase {
    /// Whether the run has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Cancelled | Self::Failed)
    }
}

/// Aggregate counters accumulated over a run.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct IngestCounters {
    pub chunks: u64,
    pub triples: u64,
    pub entities: u64,
    pub relations: u64,
}

/// Progress of one file within a run. Created lazily at first work item.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileProgress {
    pub phase: Option<IngestPhase>,
    pub percent: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_total: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_done: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<FileError>,
}

/// Recorded file-level failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileError {
    pub kind: String,
    pub message: String,
}

/// Live status record for one ingestion run; a materialized view polled by
/// consumers, not a replay log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestRun {
    pub run_id: String,
    pub source_spec: SourceSpec,
    pub phase: IngestPhase,
    pub percent: u8,
    pub files_total: usize,
    pub files_done: usize,
    pub files_in_progress: Vec<String>,
    pub cancel_flag: bool,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    pub counters: IngestCounters,
    /// Whether graph enrichment partially failed while chunks stayed durable.
    #[serde(default)]
    pub graph_partial: bool,
    pub per_file: BTreeMap<String, FileProgress>,
}

impl IngestRun {
    /// Fresh run record in the `queued` phase.
    pub fn new(run_id: String, source_spec: SourceSpec) -> Self {
        Self {
            run_id,
            source_spec,
            phase: IngestPhase::Queued,
            percent: 0,
            files_total: 0,
            files_done: 0,
            files_in_progress: Vec::new(),
            cancel_flag: false,
            started_at: Utc::now(),
            completed_at: None,
            error_kind: None,
            counters: IngestCounters::default(),
            graph_partial: false,
            per_file: BTreeMap::new(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Incremental sync
// ═══════════════════════════════════════════════════════════════════════

/// Kind of change observed by a connector's change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Add,
    Modify,
    Delete,
}

/// One change observed since a sync watermark.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub change: ChangeKind,
    pub source_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    pub modified_at: DateTime<Utc>,
    /// Monotonic microsecond ordinal within the source.
    pub ordinal: i64,
}

/// Persisted per-datasource sync configuration (`datasource_config` table).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DatasourceConfig {
    pub config_id: String,
    pub source_type: String,
    /// The `SourceSpec`, serialized.
    pub params_json: String,
    pub refresh_interval_s: i64,
    pub change_stream_enabled: bool,
    pub skip_graph: bool,
    pub active: bool,
    pub last_sync_ordinal: i64,
    #[sqlx(default)]
    pub last_sync_status: Option<String>,
}

/// Persisted per-document sync state (`document_state` table).
///
/// `doc_id = config_id + ":" + source_path`; exactly one row per
/// (config, source_path); `ordinal` strictly increases within a config.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DocumentState {
    pub doc_id: String,
    pub config_id: String,
    pub source_path: String,
    pub source_id: String,
    pub ordinal: i64,
    pub content_hash: String,
    pub vector_synced_at: DateTime<Utc>,
    pub search_synced_at: DateTime<Utc>,
    #[sqlx(default)]
    pub graph_synced_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_spec_round_trips_through_json() {
        let spec = SourceSpec::LocalFs {
            paths: vec![PathBuf::from("/docs")],
            include_globs: vec!["**/*.md".to_string()],
            exclude_globs: vec![],
        };
        let json = serde_json::to_string(&spec).unwrap();
        assert!(json.contains("\"kind\":\"local_fs\""));
        let back: SourceSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back.family(), "local_fs");
    }

    #[test]
    fn phase_serializes_snake_case() {
        let s = serde_json::to_string(&IngestPhase::IndexingLexical).unwrap();
        assert_eq!(s, "\"indexing_lexical\"");
        assert!(IngestPhase::Cancelled.is_terminal());
        assert!(!IngestPhase::Finalizing.is_terminal());
    }

    #[test]
    fn sample_schema_validates_pairs() {
        let schema = Schema::sample_schema();
        let ok = Triple {
            subject_label: "Alice".into(),
            subject_type: "PERSON".into(),
            predicate: "WORKS_AT".into(),
            object_label: "Acme".into(),
            object_type: "ORGANIZATION".into(),
        };
        let bad = Triple {
            subject_label: "Acme".into(),
            subject_type: "ORGANIZATION".into(),
            predicate: "WORKS_AT".into(),
            object_label: "Paris".into(),
            object_type: "LOCATION".into(),
        };
        assert!(schema.allows(&ok));
        assert!(!schema.allows(&bad));
    }

    #[test]
    fn extraction_format_auto_prefers_markdown_with_tables() {
        let mut parsed = ParsedDocument {
            markdown: "| a | b |".into(),
            plaintext: "a b".into(),
            metadata: ParseMetadata::default(),
            parser_name: "test".into(),
            parse_mode: "auto".into(),
        };
        assert_eq!(parsed.extraction_text(ExtractionFormat::Auto), "a b");
        parsed.metadata.tables = 1;
        assert_eq!(parsed.extraction_text(ExtractionFormat::Auto), "| a | b |");
    }

    #[test]
    fn ingest_run_wire_field_names() {
        let run = IngestRun::new(
            "r1".to_string(),
            SourceSpec::WebPage {
                urls: vec!["https://example.com".to_string()],
            },
        );
        let json = serde_json::to_value(&run).unwrap();
        for field in [
            "run_id",
            "source_spec",
            "phase",
            "percent",
            "files_total",
            "files_done",
            "files_in_progress",
            "cancel_flag",
            "started_at",
            "counters",
            "per_file",
        ] {
            assert!(json.get(field).is_some(), "missing field {field}");
        }
    }
}
