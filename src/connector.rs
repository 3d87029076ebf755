//! Source connector interface.
//!
//! A connector adapts one source family to the common [`Document`] shape.
//! [`SourceConnector::enumerate`] yields the file count (exact when cheap,
//! estimated otherwise — corrected via the progress callback) plus an async
//! document stream. The stream observes its cancellation token between
//! documents and ends early when cancelled; the ingestion manager performs
//! its own checks as well.
//!
//! Documents carry either inline bytes or a temporary local file. A
//! connector that hands out temp paths must keep each file alive until the
//! consumer finishes with the document — in practice every document is
//! processed to completion before the stream is polled again, so yielding
//! synchronously per document is sufficient.
//!
//! [`SourceConnector::fetch_changes`] is the optional change feed consumed
//! by the sync controller; connectors without durable ordering simply do not
//! implement it.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use tokio_util::sync::CancellationToken;

use crate::connector_cmis::CmisConnector;
use crate::connector_drive::DriveConnector;
use crate::connector_fs::FsConnector;
use crate::connector_object::ObjectStoreConnector;
use crate::connector_web::WebConnector;
use crate::error::EngineError;
use crate::models::{ChangeEvent, Document, SourceSpec};

/// Progress signals emitted while enumerating a source.
#[derive(Debug, Clone)]
pub enum ConnectorProgress {
    /// Correct the total file count (estimates only).
    SetTotal(usize),
    /// A document has been fetched from the source.
    Fetched { logical_path: String },
}

/// Callback invoked by connectors during enumeration.
pub type ProgressFn = Arc<dyn Fn(ConnectorProgress) + Send + Sync>;

/// No-op progress callback.
pub fn no_progress() -> ProgressFn {
    Arc::new(|_| {})
}

/// Stream of documents produced by one enumeration.
pub type DocumentStream = Pin<Box<dyn Stream<Item = Result<Document, EngineError>> + Send>>;

/// Uniform iteration over one source family.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    /// Family name (matches [`SourceSpec::family`]).
    fn kind(&self) -> &'static str;

    /// Enumerate the source: `(file_count, document stream)`.
    async fn enumerate(
        &self,
        progress: ProgressFn,
        cancel: CancellationToken,
    ) -> Result<(usize, DocumentStream), EngineError>;

    /// Changes observed since `since_ordinal` (microsecond watermark).
    /// Default: the family has no durable change ordering.
    async fn fetch_changes(&self, _since_ordinal: i64) -> Result<Vec<ChangeEvent>, EngineError> {
        Err(EngineError::source_permanent(format!(
            "source family '{}' does not support change feeds",
            self.kind()
        )))
    }

    /// Fetch a single document by source path. Used by the sync controller
    /// for targeted re-ingestion of changed files.
    async fn fetch_document(&self, source_path: &str) -> Result<Document, EngineError> {
        Err(EngineError::source_permanent(format!(
            "source family '{}' does not support targeted fetches of '{source_path}'",
            self.kind()
        )))
    }
}

/// Resolve the connector for a source spec.
pub fn resolve_connector(spec: &SourceSpec) -> Box<dyn SourceConnector> {
    match spec {
        SourceSpec::LocalFs { .. } => Box::new(FsConnector::new(spec.clone())),
        SourceSpec::S3 { .. } | SourceSpec::Gcs { .. } | SourceSpec::Azblob { .. } => {
            Box::new(ObjectStoreConnector::new(spec.clone()))
        }
        SourceSpec::Onedrive { .. }
        | SourceSpec::Sharepoint { .. }
        | SourceSpec::Gdrive { .. }
        | SourceSpec::Box { .. } => Box::new(DriveConnector::new(spec.clone())),
        SourceSpec::Cmis { .. } | SourceSpec::Alfresco { .. } => {
            Box::new(CmisConnector::new(spec.clone()))
        }
        SourceSpec::WebPage { .. } | SourceSpec::Wikipedia { .. } | SourceSpec::Youtube { .. } => {
            Box::new(WebConnector::new(spec.clone()))
        }
    }
}

/// Map an HTTP response status onto the source error taxonomy.
pub(crate) fn classify_source_status(status: reqwest::StatusCode, context: &str) -> EngineError {
    use crate::error::SourceErrorKind;
    let kind = match status.as_u16() {
        401 | 403 => SourceErrorKind::Auth,
        404 => SourceErrorKind::NotFound,
        429 => SourceErrorKind::Transient,
        s if (500..600).contains(&s) => SourceErrorKind::Transient,
        _ => SourceErrorKind::Permanent,
    };
    EngineError::Source {
        kind,
        message: format!("{context}: HTTP {status}"),
    }
}

/// File extension (lowercased, no dot) from a path-like string.
pub(crate) fn ext_of(path: &str) -> String {
    std::path::Path::new(path)
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

/// Last path segment, used as the display name.
pub(crate) fn file_name_of(path: &str) -> String {
    path.rsplit('/').next().unwrap_or(path).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_matches_family() {
        let spec = SourceSpec::Wikipedia {
            pages: vec!["Rust".to_string()],
        };
        assert_eq!(resolve_connector(&spec).kind(), "wikipedia");

        let spec = SourceSpec::S3 {
            bucket: "b".to_string(),
            prefix: String::new(),
            region: "us-east-1".to_string(),
            endpoint_url: None,
        };
        assert_eq!(resolve_connector(&spec).kind(), "s3");
    }

    #[test]
    fn status_classification_covers_the_taxonomy() {
        assert_eq!(
            classify_source_status(reqwest::StatusCode::FORBIDDEN, "x").kind(),
            "SourceError.auth"
        );
        assert_eq!(
            classify_source_status(reqwest::StatusCode::NOT_FOUND, "x").kind(),
            "SourceError.not_found"
        );
        assert_eq!(
            classify_source_status(reqwest::StatusCode::SERVICE_UNAVAILABLE, "x").kind(),
            "SourceError.transient"
        );
        assert_eq!(
            classify_source_status(reqwest::StatusCode::BAD_REQUEST, "x").kind(),
            "SourceError.permanent"
        );
    }

    #[test]
    fn path_helpers() {
        assert_eq!(ext_of("docs/guide.PDF"), "pdf");
        assert_eq!(ext_of("no-extension"), "");
        assert_eq!(file_name_of("a/b/c.txt"), "c.txt");
    }
}
