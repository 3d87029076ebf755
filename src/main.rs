//! Lattice CLI entry point.
//!
//! Configuration comes from the environment (see [`lattice::config`]);
//! subcommands drive the engine directly.
//!
//! Exit codes: `0` ok, `2` configuration error, `3` store-level startup
//! failure, `130` interrupted.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use lattice::config::load_config;
use lattice::engine::Engine;
use lattice::error::EngineError;
use lattice::ingest::IngestOptions;
use lattice::models::{DatasourceConfig, RetrievalMode, SourceSpec};
use lattice::server::run_server;

#[derive(Parser)]
#[command(
    name = "lattice",
    about = "Lattice — hybrid keyword/vector/graph retrieval over document corpora",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server (and the background sync loop)
    Serve,

    /// Initialize the sync-state database schema
    Init,

    /// Ingest local files or directories and wait for completion
    Ingest {
        /// Paths to ingest
        paths: Vec<std::path::PathBuf>,

        /// Skip the knowledge-graph phase for this run
        #[arg(long)]
        skip_graph: bool,
    },

    /// Hybrid search over the indexes
    Search {
        /// Search query
        query: String,

        /// Maximum number of results
        #[arg(long, default_value_t = 10)]
        top_k: usize,

        /// Modalities: vector, lexical, graph (default: all enabled)
        #[arg(long, value_delimiter = ',')]
        modes: Vec<String>,
    },

    /// Ask a question; the answer is synthesized from retrieved context
    Query {
        /// The question
        query: String,

        /// Number of context chunks
        #[arg(long, default_value_t = 10)]
        top_k: usize,
    },

    /// Register a datasource for incremental sync
    AddSource {
        /// Config id
        config_id: String,

        /// Source spec as JSON (same shape as the /ingest API)
        spec_json: String,

        /// Poll interval in seconds
        #[arg(long, default_value_t = 300)]
        refresh_interval: i64,
    },

    /// Run one sync tick for every active datasource
    Sync,
}

fn parse_modes(modes: &[String]) -> Result<Vec<RetrievalMode>, EngineError> {
    modes
        .iter()
        .map(|m| match m.as_str() {
            "vector" => Ok(RetrievalMode::Vector),
            "lexical" => Ok(RetrievalMode::Lexical),
            "graph" => Ok(RetrievalMode::Graph),
            other => Err(EngineError::Config(format!(
                "unknown retrieval mode: '{other}'. Use vector, lexical, or graph."
            ))),
        })
        .collect()
}

async fn run(cli: Cli) -> Result<(), EngineError> {
    let config = load_config()?;

    match cli.command {
        Commands::Serve => {
            let engine = Arc::new(Engine::from_config(config).await?);

            let sync_cancel = CancellationToken::new();
            tokio::spawn(Arc::clone(&engine.sync).run_loop(sync_cancel.clone()));

            let result = run_server(engine).await;
            sync_cancel.cancel();
            result
        }

        Commands::Init => {
            let pool = lattice::db::connect(&config.sync_db_path).await?;
            lattice::migrate::run_migrations(&pool).await?;
            println!("sync database initialized at {}", config.sync_db_path.display());
            Ok(())
        }

        Commands::Ingest { paths, skip_graph } => {
            if paths.is_empty() {
                return Err(EngineError::Config("no paths given".to_string()));
            }
            let engine = Arc::new(Engine::from_config(config).await?);
            let spec = SourceSpec::LocalFs {
                paths,
                include_globs: Vec::new(),
                exclude_globs: Vec::new(),
            };
            let run_id = engine.manager.ingest(
                spec,
                IngestOptions {
                    skip_graph,
                    run_id: None,
                },
            )?;
            println!("run {run_id}");

            // Poll to completion so the CLI is synchronous.
            loop {
                tokio::time::sleep(Duration::from_millis(250)).await;
                let Some(run) = engine.status.get(&run_id) else { break };
                eprintln!(
                    "  {:?}  {}%  {}/{} files",
                    run.phase, run.percent, run.files_done, run.files_total
                );
                if run.phase.is_terminal() {
                    println!(
                        "{:?}: {} chunks, {} triples, {} entities",
                        run.phase, run.counters.chunks, run.counters.triples, run.counters.entities
                    );
                    break;
                }
            }
            Ok(())
        }

        Commands::Search { query, top_k, modes } => {
            let engine = Arc::new(Engine::from_config(config).await?);
            let modes = parse_modes(&modes)?;
            let results = engine.retriever.retrieve(&query, top_k, &modes).await?;
            if results.is_empty() {
                println!("No results.");
                return Ok(());
            }
            for (i, node) in results.iter().enumerate() {
                println!(
                    "{}. [{:.3}] {} ({})",
                    i + 1,
                    node.fused_score,
                    node.display_name,
                    node.logical_path
                );
                let scores: Vec<String> = node
                    .per_modality_scores
                    .iter()
                    .map(|(m, s)| format!("{m}={s:.3}"))
                    .collect();
                println!("    modalities: {}", scores.join(" "));
                println!("    excerpt: \"{}\"", node.text.replace('\n', " ").trim());
                println!("    id: {}", node.chunk_id);
                println!();
            }
            Ok(())
        }

        Commands::Query { query, top_k } => {
            let engine = Arc::new(Engine::from_config(config).await?);
            let answer = engine.query.answer(&query, top_k, &[]).await?;
            println!("{}", answer.answer);
            if answer.truncated {
                eprintln!("(answer truncated by timeout)");
            }
            if !answer.citations.is_empty() {
                println!("\ncitations:");
                for citation in &answer.citations {
                    println!("  {citation}");
                }
            }
            Ok(())
        }

        Commands::AddSource {
            config_id,
            spec_json,
            refresh_interval,
        } => {
            let spec: SourceSpec = serde_json::from_str(&spec_json)
                .map_err(|e| EngineError::Config(format!("invalid spec JSON: {e}")))?;
            let engine = Arc::new(Engine::from_config(config).await?);
            engine
                .sync
                .upsert_config(&DatasourceConfig {
                    config_id: config_id.clone(),
                    source_type: spec.family().to_string(),
                    params_json: serde_json::to_string(&spec)
                        .map_err(|e| EngineError::Config(e.to_string()))?,
                    refresh_interval_s: refresh_interval,
                    change_stream_enabled: false,
                    skip_graph: false,
                    active: true,
                    last_sync_ordinal: 0,
                    last_sync_status: None,
                })
                .await?;
            println!("datasource '{config_id}' registered");
            Ok(())
        }

        Commands::Sync => {
            let engine = Arc::new(Engine::from_config(config).await?);
            for (config_id, report) in engine.sync.sync_all().await? {
                println!(
                    "{config_id}: {} ingested, {} deleted, {} unchanged, {} failed",
                    report.ingested, report.deleted, report.unchanged, report.failed
                );
            }
            Ok(())
        }
    }
}

fn exit_code_for(error: &EngineError) -> ExitCode {
    match error {
        EngineError::Config(_) | EngineError::DimensionMismatch { .. } => ExitCode::from(2),
        EngineError::Store { .. } => ExitCode::from(3),
        _ => ExitCode::FAILURE,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    tokio::select! {
        result = run(cli) => match result {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("error: {e}");
                exit_code_for(&e)
            }
        },
        _ = tokio::signal::ctrl_c() => {
            eprintln!("interrupted");
            ExitCode::from(130)
        }
    }
}
