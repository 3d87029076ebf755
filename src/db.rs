//! SQLite connection management.
//!
//! One pool per database file, WAL mode, parent directories created on
//! demand. Used by the sqlite store backends and the sync-state tables.

use std::path::Path;
use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

use crate::error::EngineError;

/// Open (or create) a SQLite database file.
pub async fn connect(path: &Path) -> Result<SqlitePool, EngineError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| EngineError::store_permanent(format!("create {}: {e}", parent.display())))?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
        .map_err(|e| EngineError::store_permanent(e.to_string()))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .map_err(|e| EngineError::store_transient(e.to_string()))
}

/// In-memory database for tests. A single connection keeps the database
/// alive for the pool's lifetime.
pub async fn connect_in_memory() -> Result<SqlitePool, EngineError> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .map_err(|e| EngineError::store_permanent(e.to_string()))?;

    SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .map_err(|e| EngineError::store_transient(e.to_string()))
}
