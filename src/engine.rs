//! Engine assembly: configuration → wired component graph.
//!
//! [`Engine::from_config`] runs the factory layer in dependency order,
//! enforces the cross-component compatibility rules before any store is
//! written, and bundles the shared components handed to the HTTP server
//! and CLI.

use std::sync::Arc;

use crate::config::Config;
use crate::db;
use crate::error::EngineError;
use crate::factory::{
    check_compatibility, make_embedder, make_graph_store, make_kg_extractor, make_lexical_store,
    make_llm, make_parser, make_vector_store,
};
use crate::index::IndexBuilder;
use crate::ingest::IngestionManager;
use crate::migrate;
use crate::query::QueryEngine;
use crate::retrieve::HybridRetriever;
use crate::status::StatusRegistry;
use crate::store::GraphStore;
use crate::sync::SyncController;

/// The wired engine shared by every entry point.
pub struct Engine {
    pub config: Config,
    pub status: Arc<StatusRegistry>,
    pub manager: Arc<IngestionManager>,
    pub retriever: Arc<HybridRetriever>,
    pub query: Arc<QueryEngine>,
    pub sync: Arc<SyncController>,
    pub graph: Option<Arc<dyn GraphStore>>,
}

impl Engine {
    /// Build every component from configuration.
    ///
    /// Fails fast — before any ingestion — on provider incompatibilities
    /// and on an embedder/vector-store dimension mismatch.
    pub async fn from_config(config: Config) -> Result<Self, EngineError> {
        check_compatibility(&config)?;

        let llm = make_llm(&config)?;
        let embedder = make_embedder(&config)?;
        let vector = make_vector_store(&config, embedder.dimension()).await?;
        let lexical = make_lexical_store(&config).await?;
        let graph = make_graph_store(&config).await?;
        let extractor = match &graph {
            Some(_) => Some(make_kg_extractor(&config, Arc::clone(&llm))?),
            None => None,
        };
        let parser = make_parser(&config)?;

        let builder = Arc::new(IndexBuilder::new(
            Arc::clone(&embedder),
            Arc::clone(&vector),
            Arc::clone(&lexical),
            graph.clone(),
            extractor,
            config.chunking.clone(),
            config.parser.extraction_format,
            config.timeouts.store,
        ));

        let status = Arc::new(StatusRegistry::new(config.status_retention));
        let manager = Arc::new(IngestionManager::new(
            Arc::clone(&parser),
            Arc::clone(&builder),
            Arc::clone(&status),
            config.clone(),
        ));

        let retriever = Arc::new(HybridRetriever::new(
            embedder,
            vector,
            lexical,
            graph.clone(),
            Arc::clone(&llm),
        ));
        let query = Arc::new(QueryEngine::new(
            Arc::clone(&retriever),
            llm,
            config.timeouts.llm,
        ));

        let pool = db::connect(&config.sync_db_path).await?;
        migrate::run_migrations(&pool).await?;
        let sync = Arc::new(SyncController::new(pool, builder, parser));

        Ok(Self {
            config,
            status,
            manager,
            retriever,
            query,
            sync,
            graph,
        })
    }
}
