//! Sync-state schema migrations.
//!
//! Creates the `datasource_config` and `document_state` tables used by the
//! incremental sync controller. Idempotent; safe to run at every startup.

use sqlx::SqlitePool;

use crate::error::EngineError;

pub async fn run_migrations(pool: &SqlitePool) -> Result<(), EngineError> {
    let err = |e: sqlx::Error| EngineError::store_permanent(e.to_string());

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS datasource_config (
            config_id TEXT PRIMARY KEY,
            source_type TEXT NOT NULL,
            params_json TEXT NOT NULL,
            refresh_interval_s INTEGER NOT NULL DEFAULT 300,
            change_stream_enabled INTEGER NOT NULL DEFAULT 0,
            skip_graph INTEGER NOT NULL DEFAULT 0,
            active INTEGER NOT NULL DEFAULT 1,
            last_sync_ordinal INTEGER NOT NULL DEFAULT 0,
            last_sync_status TEXT
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(err)?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS document_state (
            doc_id TEXT PRIMARY KEY,
            config_id TEXT NOT NULL,
            source_path TEXT NOT NULL,
            source_id TEXT NOT NULL,
            ordinal INTEGER NOT NULL,
            content_hash TEXT NOT NULL,
            vector_synced_at TEXT NOT NULL,
            search_synced_at TEXT NOT NULL,
            graph_synced_at TEXT,
            UNIQUE(config_id, source_path),
            FOREIGN KEY (config_id) REFERENCES datasource_config(config_id)
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(err)?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_document_state_config_ordinal \
         ON document_state(config_id, ordinal)",
    )
    .execute(pool)
    .await
    .map_err(err)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let pool = db::connect_in_memory().await.unwrap();
        run_migrations(&pool).await.unwrap();
        run_migrations(&pool).await.unwrap();

        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type='table' ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();
        assert!(tables.contains(&"datasource_config".to_string()));
        assert!(tables.contains(&"document_state".to_string()));
    }
}
