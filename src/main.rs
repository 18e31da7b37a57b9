//! `crag` — command-line front end for the Concept-RAG engine.
//!
//! All real logic lives in the library; this binary parses arguments,
//! loads the config, wires the engine, and prints results.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use concept_rag::config;
use concept_rag::engine::{Collaborators, Engine};
use concept_rag::ops;
use concept_rag::progress::ProgressMode;

#[derive(Parser)]
#[command(
    name = "crag",
    about = "Concept-RAG — local document retrieval with LLM concept enrichment",
    version
)]
struct Cli {
    /// Path to configuration file
    #[arg(long, global = true, default_value = "./config/crag.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest a directory of PDF/EPUB documents and rebuild the tables
    Ingest {
        /// Directory to scan for documents
        source_dir: PathBuf,

        /// Worker pool size (overrides config)
        #[arg(long)]
        parallel: Option<usize>,

        /// Cap the number of documents processed
        #[arg(long)]
        max_docs: Option<usize>,

        /// Ignore the stage cache, re-run all LLM calls
        #[arg(long)]
        no_cache: bool,

        /// Rebuild from scratch, discarding the checkpoint
        #[arg(long)]
        overwrite: bool,

        /// Discard the checkpoint before running
        #[arg(long)]
        clean_checkpoint: bool,
    },

    /// Search the catalog or chunk collections
    Search {
        /// Search query
        query: String,

        /// Collection: catalog or chunks
        #[arg(long, default_value = "catalog")]
        collection: String,

        /// Scope chunk search to one document (path or title)
        #[arg(long)]
        source: Option<String>,

        /// Emit per-component score traces
        #[arg(long)]
        debug: bool,
    },

    /// Look up a concept: summary, relations, sources, chunks
    Concept {
        /// Concept name
        name: String,

        /// Maximum chunks returned
        #[arg(long)]
        limit: Option<usize>,

        /// Restrict to one document
        #[arg(long)]
        source: Option<String>,
    },

    /// List categories
    Categories {
        /// Sort order: name, document_count, or popularity
        #[arg(long, default_value = "name")]
        sort_by: String,

        /// Maximum categories listed
        #[arg(long, default_value_t = 50)]
        limit: usize,

        /// Substring filter over names and aliases
        #[arg(long)]
        search: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Ingest {
            source_dir,
            parallel,
            max_docs,
            no_cache,
            overwrite,
            clean_checkpoint,
        } => {
            let mut cfg = cfg;
            if let Some(parallel) = parallel {
                cfg.pipeline.parallel = parallel;
            }
            if let Some(max_docs) = max_docs {
                cfg.pipeline.max_docs = Some(max_docs);
            }
            cfg.pipeline.use_cache = !no_cache;
            cfg.pipeline.overwrite = overwrite;
            cfg.pipeline.clean_checkpoint = clean_checkpoint;

            let collaborators = Collaborators {
                progress: Some(ProgressMode::default_for_tty().sink().into()),
                ..Default::default()
            };
            let engine = Engine::open_with(cfg, collaborators).await?;

            // Ctrl-C stops dispatch, flushes the checkpoint, and exits.
            let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    let _ = shutdown_tx.send(true);
                }
            });

            let stats = engine.ingest(source_dir, shutdown_rx).await?;
            println!("ingest");
            println!("  processed: {}", stats.documents_processed);
            println!("  reused from cache: {}", stats.documents_skipped);
            println!("  failed: {}", stats.documents_failed);
            println!("  chunks: {}", stats.chunks);
            println!("  llm calls: {}", stats.llm_calls);
            println!(
                "  stage cache: {} hits / {} misses",
                stats.cache_hits, stats.cache_misses
            );
            if stats.cancelled {
                println!("  cancelled before index build");
            } else {
                println!(
                    "  tables: {} docs, {} chunks, {} concepts, {} categories",
                    stats.build.documents,
                    stats.build.chunks,
                    stats.build.concepts,
                    stats.build.categories
                );
            }
            println!("ok");
            engine.close().await;
        }

        Commands::Search {
            query,
            collection,
            source,
            debug,
        } => {
            let engine = Engine::open(cfg).await?;
            match (collection.as_str(), source) {
                ("catalog", _) => {
                    let results = ops::catalog_search(&engine, &query, debug)
                        .await
                        .map_err(op_err)?;
                    if results.is_empty() {
                        println!("No results.");
                    }
                    for (i, item) in results.iter().enumerate() {
                        println!(
                            "{}. [{:.3}] {}",
                            i + 1,
                            item.scores.hybrid,
                            item.title
                        );
                        println!("    source: {}", item.source);
                        println!("    summary: {}", first_line(&item.summary));
                    }
                }
                ("chunks", None) => {
                    let results = ops::broad_chunks_search(&engine, &query, debug)
                        .await
                        .map_err(op_err)?;
                    print_chunks(&results);
                }
                ("chunks", Some(source)) => {
                    let results = ops::chunks_search(&engine, &query, &source, debug)
                        .await
                        .map_err(op_err)?;
                    print_chunks(&results);
                }
                (other, _) => anyhow::bail!("unknown collection: {} (catalog or chunks)", other),
            }
            engine.close().await;
        }

        Commands::Concept {
            name,
            limit,
            source,
        } => {
            let engine = Engine::open(cfg).await?;
            let request = ops::ConceptSearchRequest {
                concept: name,
                limit,
                source_filter: source,
                debug: false,
            };
            let response = ops::concept_search(&engine, &request)
                .await
                .map_err(op_err)?;
            println!("{} (id {})", response.concept, response.concept_id);
            if !response.summary.is_empty() {
                println!("  {}", response.summary);
            }
            if !response.related_concepts.is_empty() {
                println!("  related: {}", response.related_concepts.join(", "));
            }
            println!(
                "  sources: {} ({} related)",
                response.stats.total_sources, response.stats.related_count
            );
            for src in &response.sources {
                let pages = if src.pages.is_empty() {
                    String::new()
                } else {
                    format!(
                        "  pages {}",
                        src.pages
                            .iter()
                            .map(|p| p.to_string())
                            .collect::<Vec<_>>()
                            .join(",")
                    )
                };
                println!("    [{}] {}{}", src.match_type, src.title, pages);
            }
            for chunk in &response.chunks {
                println!(
                    "  chunk ({}, density {:.2}): {}",
                    chunk.title,
                    chunk.concept_density,
                    first_line(&chunk.text)
                );
            }
            engine.close().await;
        }

        Commands::Categories {
            sort_by,
            limit,
            search,
        } => {
            let engine = Engine::open(cfg).await?;
            let categories = ops::list_categories(&engine, &sort_by, limit, search.as_deref())
                .await
                .map_err(op_err)?;
            if categories.is_empty() {
                println!("No categories.");
            }
            for category in &categories {
                let aliases = if category.aliases.is_empty() {
                    String::new()
                } else {
                    format!(" ({})", category.aliases.join(", "))
                };
                println!(
                    "{}{}  docs={} concepts={}",
                    category.name, aliases, category.document_count, category.concept_count
                );
            }
            engine.close().await;
        }
    }

    Ok(())
}

fn print_chunks(results: &[ops::ChunkSearchItem]) {
    if results.is_empty() {
        println!("No results.");
    }
    for (i, item) in results.iter().enumerate() {
        let page = item
            .page
            .map(|p| format!(" p.{}", p))
            .unwrap_or_default();
        println!(
            "{}. [{:.3}] {}{}",
            i + 1,
            item.scores.hybrid,
            item.title,
            page
        );
        println!("    {}", first_line(&item.text));
    }
}

fn first_line(text: &str) -> String {
    let line = text.lines().next().unwrap_or("");
    let mut out: String = line.chars().take(160).collect();
    if line.chars().count() > 160 || text.lines().count() > 1 {
        out.push('…');
    }
    out
}

fn op_err(e: ops::OpError) -> anyhow::Error {
    anyhow::anyhow!("{}: {}", e.error_kind, e.message)
}
