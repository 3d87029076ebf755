//! Engine error taxonomy.
//!
//! Every fallible operation in the engine surfaces one of these kinds. The
//! taxonomy doubles as the wire vocabulary: [`EngineError::kind`] yields the
//! string stored in `IngestRun.error_kind` and returned by the HTTP API.
//!
//! Classification drives recovery:
//! - **retryable** errors get bounded retries with exponential backoff
//!   (1 s / 4 s / 15 s, three attempts) inside the ingestion manager;
//! - **file-level** errors are recorded in `FileProgress.error` and the run
//!   continues;
//! - everything else is **run-level** and transitions the run to `failed`.

use std::time::Duration;

use thiserror::Error;

/// Sub-kind for connector failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceErrorKind {
    /// Credentials rejected by the source.
    Auth,
    /// The requested path/bucket/page does not exist.
    NotFound,
    /// Network or throttling failure worth retrying.
    Transient,
    /// Unrecoverable source-side failure.
    Permanent,
}

/// Sub-kind for store failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    /// Worth retrying (connection reset, lock contention, timeout).
    Transient,
    /// Unrecoverable (schema mismatch, corrupted index).
    Permanent,
}

/// All error kinds produced by the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Invalid or inconsistent configuration. Aborts startup with exit code 2.
    #[error("configuration error: {0}")]
    Config(String),

    /// An LLM or embedding provider could not be reached.
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Credentials rejected by an LLM or embedding provider.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The configured model id does not exist at the provider.
    #[error("model not found: {0}")]
    ModelNotFound(String),

    /// A source connector failed.
    #[error("source error: {message}")]
    Source {
        kind: SourceErrorKind,
        message: String,
    },

    /// Parsing exceeded the configured per-file timeout.
    #[error("parse timed out after {0:?}")]
    ParseTimeout(Duration),

    /// The parser rejected the document.
    #[error("parse failed: {0}")]
    ParseFailure(String),

    /// Embedding computation failed.
    #[error("embedding failed: {0}")]
    Embedding(String),

    /// A vector, lexical, or graph store operation failed.
    #[error("store error: {message}")]
    Store {
        kind: StoreErrorKind,
        message: String,
    },

    /// Knowledge-graph triple extraction failed.
    #[error("knowledge graph extraction failed: {0}")]
    KgExtraction(String),

    /// Every retrieval modality failed.
    #[error("retrieval failed: {0}")]
    Retrieval(String),

    /// The operation observed its cancellation token.
    #[error("operation cancelled")]
    Cancelled,

    /// Embedder and vector store disagree on vector dimensionality.
    #[error(
        "embedding dimension {embedder} \u{2260} vector store dimension {store}; \
         delete the existing vector index or switch back to a {store}-dimension embedding model"
    )]
    DimensionMismatch { embedder: usize, store: usize },
}

impl EngineError {
    /// Convenience constructor for transient source errors.
    pub fn source_transient(message: impl Into<String>) -> Self {
        Self::Source {
            kind: SourceErrorKind::Transient,
            message: message.into(),
        }
    }

    /// Convenience constructor for permanent source errors.
    pub fn source_permanent(message: impl Into<String>) -> Self {
        Self::Source {
            kind: SourceErrorKind::Permanent,
            message: message.into(),
        }
    }

    /// Convenience constructor for transient store errors.
    pub fn store_transient(message: impl Into<String>) -> Self {
        Self::Store {
            kind: StoreErrorKind::Transient,
            message: message.into(),
        }
    }

    /// Convenience constructor for permanent store errors.
    pub fn store_permanent(message: impl Into<String>) -> Self {
        Self::Store {
            kind: StoreErrorKind::Permanent,
            message: message.into(),
        }
    }

    /// Stable kind string used in status records and API responses.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "ConfigError",
            Self::ProviderUnavailable(_) => "ProviderUnavailable",
            Self::Auth(_) => "AuthError",
            Self::ModelNotFound(_) => "ModelNotFound",
            Self::Source { kind, .. } => match kind {
                SourceErrorKind::Auth => "SourceError.auth",
                SourceErrorKind::NotFound => "SourceError.not_found",
                SourceErrorKind::Transient => "SourceError.transient",
                SourceErrorKind::Permanent => "SourceError.permanent",
            },
            Self::ParseTimeout(_) => "ParseTimeout",
            Self::ParseFailure(_) => "ParseFailure",
            Self::Embedding(_) => "EmbeddingError",
            Self::Store { kind, .. } => match kind {
                StoreErrorKind::Transient => "StoreError.transient",
                StoreErrorKind::Permanent => "StoreError.permanent",
            },
            Self::KgExtraction(_) => "KGExtractionError",
            Self::Retrieval(_) => "RetrievalError",
            Self::Cancelled => "Cancelled",
            Self::DimensionMismatch { .. } => "DimensionMismatch",
        }
    }

    /// Whether the manager should retry this error with backoff.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Self::Source {
                kind: SourceErrorKind::Transient,
                ..
            } | Self::Store {
                kind: StoreErrorKind::Transient,
                ..
            }
        )
    }

    /// Whether this error fails only the current file (the run continues).
    pub fn is_file_level(&self) -> bool {
        matches!(
            self,
            Self::ParseTimeout(_)
                | Self::ParseFailure(_)
                | Self::KgExtraction(_)
                | Self::Embedding(_)
                | Self::Source {
                    kind: SourceErrorKind::Permanent | SourceErrorKind::NotFound,
                    ..
                }
        )
    }
}

/// Backoff schedule for retryable errors: 1 s, 4 s, 15 s.
pub const RETRY_BACKOFF: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(4),
    Duration::from_secs(15),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_strings_are_stable() {
        assert_eq!(EngineError::Cancelled.kind(), "Cancelled");
        assert_eq!(
            EngineError::source_transient("x").kind(),
            "SourceError.transient"
        );
        assert_eq!(
            EngineError::store_permanent("x").kind(),
            "StoreError.permanent"
        );
        assert_eq!(
            EngineError::DimensionMismatch {
                embedder: 384,
                store: 1536
            }
            .kind(),
            "DimensionMismatch"
        );
    }

    #[test]
    fn dimension_mismatch_message_names_both_dimensions() {
        let err = EngineError::DimensionMismatch {
            embedder: 768,
            store: 1536,
        };
        let msg = err.to_string();
        assert!(msg.contains("768"));
        assert!(msg.contains("1536"));
        assert!(msg.contains("dimension"));
    }

    #[test]
    fn retryable_classification() {
        assert!(EngineError::source_transient("net").retryable());
        assert!(EngineError::store_transient("lock").retryable());
        assert!(!EngineError::source_permanent("gone").retryable());
        assert!(!EngineError::ParseFailure("bad".into()).retryable());
    }

    #[test]
    fn file_level_classification() {
        assert!(EngineError::ParseTimeout(Duration::from_secs(1)).is_file_level());
        assert!(EngineError::KgExtraction("x".into()).is_file_level());
        assert!(!EngineError::store_permanent("x").is_file_level());
        assert!(!EngineError::ProviderUnavailable("x".into()).is_file_level());
    }
}
